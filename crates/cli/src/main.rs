use std::process::ExitCode;

fn main() -> ExitCode {
    convoflow_cli::run()
}
