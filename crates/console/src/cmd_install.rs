//! `termfleet install`: run the app installer on a server and follow it.

use std::process::ExitCode;

use tracing::info;

use termfleet::installer::{run_installer, InstallerSettings};
use termfleet_protocol::InstallerEvent;

use crate::Env;

pub async fn run(env: &Env, app_id: String, server_id: String) -> anyhow::Result<ExitCode> {
    let settings = InstallerSettings {
        ws_base: env.config.ws_base()?,
        token: env.require_token()?,
        server_id,
        app_id,
    };

    let report = run_installer(&settings, |event| println!("{}", describe(event))).await?;
    info!(
        component = "cli",
        event = "cli.install_finished",
        app_id = %settings.app_id,
        server_id = %settings.server_id,
        succeeded = report.succeeded(),
    );

    if report.succeeded() {
        Ok(ExitCode::SUCCESS)
    } else {
        Ok(ExitCode::FAILURE)
    }
}

fn describe(event: &InstallerEvent) -> String {
    match event {
        InstallerEvent::Log(line) => format!("  {line}"),
        InstallerEvent::StepCompleted { step, details } if details.is_empty() => {
            format!("  Step {step} done")
        }
        InstallerEvent::StepCompleted { step, details } => {
            format!("  Step {step} done ({})", details.join(" "))
        }
        InstallerEvent::StepFailed(message) => format!("  Failed: {message}"),
        InstallerEvent::Progress(percent) => format!("  Downloading... {percent}%"),
    }
}
