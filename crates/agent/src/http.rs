use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, Method};
use tracing::debug;

use convoflow_core::errors::ExternalCallError;
use convoflow_core::flows::{HttpCall, HttpReply, HttpTransport};

const USER_AGENT: &str = concat!("convoflow/", env!("CARGO_PKG_VERSION"));

/// `http_request` transport. Non-2xx replies are returned as-is; the engine decides what they mean.
#[derive(Clone)]
pub struct ReqwestTransport {
    client: Client,
}

impl ReqwestTransport {
    pub fn new() -> Result<Self, reqwest::Error> {
        Ok(Self::with_client(Client::builder().user_agent(USER_AGENT).build()?))
    }

    pub fn with_client(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl HttpTransport for ReqwestTransport {
    async fn send(&self, call: HttpCall) -> Result<HttpReply, ExternalCallError> {
        let method = Method::from_bytes(call.method.as_bytes()).map_err(|_| {
            ExternalCallError::Transport(format!("invalid http method `{}`", call.method))
        })?;

        let mut request = self.client.request(method, &call.url).timeout(call.timeout);
        let has_content_type =
            call.headers.keys().any(|name| name.eq_ignore_ascii_case("content-type"));
        for (name, value) in &call.headers {
            request = request.header(name.as_str(), value.as_str());
        }
        if let Some(body) = call.body {
            if !has_content_type && serde_json::from_str::<serde_json::Value>(&body).is_ok() {
                request = request.header("content-type", "application/json");
            }
            request = request.body(body);
        }

        let response = request.send().await.map_err(|error| classify(error, call.timeout))?;
        let status = response.status().as_u16();
        let body = response.text().await.map_err(|error| classify(error, call.timeout))?;
        debug!(
            event_name = "agent.http.completed",
            method = %call.method,
            url = %call.url,
            status,
            "http call completed"
        );
        Ok(HttpReply { status, body })
    }
}

pub(crate) fn classify(error: reqwest::Error, limit: Duration) -> ExternalCallError {
    if error.is_timeout() {
        ExternalCallError::Timeout(limit)
    } else {
        ExternalCallError::Transport(error.to_string())
    }
}
