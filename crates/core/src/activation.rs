//! Chooses which scenario and node an incoming turn enters.

use regex::RegexBuilder;
use tracing::warn;

use crate::domain::edge::{EntryEdge, EventName};
use crate::domain::session::SessionState;
use crate::domain::solution::{Scenario, Solution};
use crate::domain::turn::{ActivationTrace, InboundTurn, NluResult, TurnInput};

/// Score given to a synthesized `no_match` activation.
pub const NO_MATCH_SCORE: f64 = 0.01;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Signal<'a> {
    Init,
    Message(&'a str),
    Event(&'a str),
}

impl<'a> Signal<'a> {
    /// Signal carried by a turn: events stay events, a fresh session starts with `init`.
    pub fn for_turn(turn: &'a InboundTurn, state: &SessionState, solution: &Solution) -> Self {
        match &turn.input {
            TurnInput::Event(name) => Self::Event(name.as_str()),
            TurnInput::Message(text) if state.is_fresh() => {
                if !text.trim().is_empty() && !has_init_edge(solution) {
                    Self::Message(text.as_str())
                } else {
                    Self::Init
                }
            }
            TurnInput::Message(text) => Self::Message(text.as_str()),
        }
    }
}

fn has_init_edge(solution: &Solution) -> bool {
    solution
        .scenarios
        .iter()
        .flat_map(|scenario| scenario.entry_edges.iter())
        .any(|edge| edge.is_event(&EventName::Init))
}

#[derive(Clone, Debug, PartialEq)]
pub struct EntryPoint {
    pub scenario_slug: String,
    pub node_id: String,
    pub edge_id: Option<String>,
    pub score: f64,
    pub tier: u8,
    /// Capture groups of the winning `match` edge, whole match first.
    pub captures: Vec<String>,
}

#[derive(Clone, Debug, PartialEq)]
pub enum Resolution {
    Matched(EntryPoint),
    /// Nothing scored; carries the `no_match` edge entry if one exists.
    NoMatch(Option<EntryPoint>),
}

impl Resolution {
    pub fn entry(&self) -> Option<&EntryPoint> {
        match self {
            Self::Matched(entry) => Some(entry),
            Self::NoMatch(entry) => entry.as_ref(),
        }
    }

    pub fn trace(&self) -> ActivationTrace {
        let entry = self.entry();
        ActivationTrace {
            scenario_slug: entry.map(|entry| entry.scenario_slug.clone()),
            node_id: entry.map(|entry| entry.node_id.clone()),
            edge_id: entry.and_then(|entry| entry.edge_id.clone()),
            score: entry.map_or(0.0, |entry| entry.score),
            no_match: matches!(self, Self::NoMatch(_)),
            resumed: false,
        }
    }
}

pub struct ActivationResolver<'a> {
    solution: &'a Solution,
}

impl<'a> ActivationResolver<'a> {
    pub fn new(solution: &'a Solution) -> Self {
        Self { solution }
    }

    /// Resolves across every scenario with nesting precedence relative to `active`.
    pub fn resolve(
        &self,
        signal: &Signal<'_>,
        nlu: &NluResult,
        active: Option<&str>,
    ) -> Resolution {
        let candidates: Vec<&Scenario> = self.solution.scenarios.iter().collect();
        if let Some(entry) = self.best(signal, nlu, &candidates, active) {
            return Resolution::Matched(entry);
        }

        // Only the current scenario's no_match edge applies; main stands in when none is active.
        let current = active
            .and_then(|slug| self.solution.scenario_by_slug(slug))
            .or_else(|| self.solution.main_scenario());
        Resolution::NoMatch(current.and_then(no_match_entry))
    }

    /// Same scoring restricted to `candidates`, with no tiering and no fallback.
    pub fn resolve_within(
        &self,
        signal: &Signal<'_>,
        nlu: &NluResult,
        candidates: &[&Scenario],
    ) -> Option<EntryPoint> {
        self.best(signal, nlu, candidates, None)
    }

    fn best(
        &self,
        signal: &Signal<'_>,
        nlu: &NluResult,
        candidates: &[&Scenario],
        active: Option<&str>,
    ) -> Option<EntryPoint> {
        let active_scenario = active.and_then(|slug| self.solution.scenario_by_slug(slug));
        let ancestors = active_scenario
            .map(|scenario| self.solution.ancestors_of(scenario))
            .unwrap_or_default();

        let mut best: Option<EntryPoint> = None;
        for scenario in candidates {
            let tier = match active_scenario {
                Some(active) => {
                    let parent = self.solution.parent_of(scenario).map(|p| p.slug.as_str());
                    if parent == Some(active.slug.as_str()) && scenario.slug != active.slug {
                        0
                    } else if scenario.slug == active.slug {
                        1
                    } else if ancestors.contains(&scenario.slug.as_str()) {
                        2
                    } else {
                        3
                    }
                }
                None => 3,
            };

            for edge in &scenario.entry_edges {
                let Some((score, captures)) = score_edge(edge, signal, nlu) else {
                    continue;
                };
                let better = match &best {
                    None => true,
                    Some(current) => {
                        tier < current.tier || (tier == current.tier && score > current.score)
                    }
                };
                if better {
                    best = Some(EntryPoint {
                        scenario_slug: scenario.slug.clone(),
                        node_id: edge.target_node_id().to_owned(),
                        edge_id: edge.id().map(str::to_owned),
                        score,
                        tier,
                        captures,
                    });
                }
            }
        }
        best
    }
}

fn no_match_entry(scenario: &Scenario) -> Option<EntryPoint> {
    scenario.no_match_edge().map(|edge| EntryPoint {
        scenario_slug: scenario.slug.clone(),
        node_id: edge.target_node_id().to_owned(),
        edge_id: edge.id().map(str::to_owned),
        score: NO_MATCH_SCORE,
        tier: 3,
        captures: Vec::new(),
    })
}

/// Positive score of `edge` for `signal`, or `None` when it does not apply.
fn score_edge(
    edge: &EntryEdge,
    signal: &Signal<'_>,
    nlu: &NluResult,
) -> Option<(f64, Vec<String>)> {
    match (edge, signal) {
        (EntryEdge::Match(edge), Signal::Message(text)) => {
            let regex = match RegexBuilder::new(&edge.value).case_insensitive(true).build() {
                Ok(regex) => regex,
                Err(error) => {
                    warn!(
                        event_name = "activation.edge.invalid_pattern",
                        edge_id = edge.common.id.as_deref().unwrap_or(""),
                        error = %error,
                        "skipping match edge with invalid pattern"
                    );
                    return None;
                }
            };
            regex.captures(text).map(|captures| {
                let groups = captures
                    .iter()
                    .map(|group| group.map(|found| found.as_str().to_owned()).unwrap_or_default())
                    .collect();
                (1.0, groups)
            })
        }
        (EntryEdge::Intent(edge), Signal::Message(_)) => nlu
            .intent_confidence(&edge.value)
            .filter(|confidence| *confidence > 0.0 && *confidence >= edge.effective_threshold())
            .map(|confidence| (confidence, Vec::new())),
        (EntryEdge::Rule(edge), Signal::Message(_)) => nlu
            .rule_confidence(&edge.rule_ids)
            .filter(|confidence| *confidence > 0.0 && *confidence >= edge.effective_threshold())
            .map(|confidence| (confidence, Vec::new())),
        (EntryEdge::Event(edge), Signal::Init) => {
            (edge.value == EventName::Init).then(|| (1.0, Vec::new()))
        }
        (EntryEdge::Event(edge), Signal::Event(name)) => match &edge.value {
            EventName::Custom(custom) if custom == name => Some((1.0, Vec::new())),
            EventName::Init if *name == "init" => Some((1.0, Vec::new())),
            _ => None,
        },
        _ => None,
    }
}
