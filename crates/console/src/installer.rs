//! App installer socket.
//!
//! The installer endpoint streams its own low-opcode text frames (log lines,
//! step completions, a failure, download progress) and closes when the run
//! ends. Frames are decoded into [`InstallerEvent`]s as they arrive and folded
//! into an [`InstallReport`].

use futures::StreamExt;
use thiserror::Error;
use tokio_tungstenite::tungstenite::{self, Message};
use tracing::{debug, info, warn};

use termfleet_protocol::InstallerEvent;

const INSTALLER_PATH: &str = "/api/apps/installer";

#[derive(Debug, Error)]
pub enum InstallerError {
    #[error("installer socket failed: {0}")]
    Socket(#[from] tungstenite::Error),

    /// Closed with an application code before any step ran.
    #[error("installer refused the request ({code}): {reason}")]
    Rejected { code: u16, reason: String },
}

#[derive(Debug, Clone)]
pub struct InstallerSettings {
    pub ws_base: String,
    pub token: String,
    pub server_id: String,
    pub app_id: String,
}

impl InstallerSettings {
    pub fn endpoint(&self) -> String {
        format!(
            "{}{}?sessionToken={}&serverId={}&appId={}",
            self.ws_base,
            INSTALLER_PATH,
            urlencoding::encode(&self.token),
            urlencoding::encode(&self.server_id),
            urlencoding::encode(&self.app_id),
        )
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InstallReport {
    pub last_step: Option<u32>,
    pub progress: Option<u8>,
    pub failure: Option<String>,
}

impl InstallReport {
    pub fn succeeded(&self) -> bool {
        self.failure.is_none() && self.last_step.is_some()
    }

    fn started(&self) -> bool {
        self.last_step.is_some() || self.failure.is_some()
    }

    fn record(&mut self, event: &InstallerEvent) {
        match event {
            InstallerEvent::Log(_) => {}
            InstallerEvent::StepCompleted { step, .. } => self.last_step = Some(*step),
            InstallerEvent::StepFailed(message) => self.failure = Some(message.clone()),
            InstallerEvent::Progress(percent) => self.progress = Some(*percent),
        }
    }
}

/// Run one installation to the end, handing every decoded event to
/// `on_event` in arrival order.
pub async fn run_installer(
    settings: &InstallerSettings,
    mut on_event: impl FnMut(&InstallerEvent),
) -> Result<InstallReport, InstallerError> {
    let (mut ws, _response) = tokio_tungstenite::connect_async(settings.endpoint()).await?;
    info!(
        component = "installer",
        event = "installer.opened",
        server_id = %settings.server_id,
        app_id = %settings.app_id,
        "Installer socket open"
    );

    let mut report = InstallReport::default();
    while let Some(frame) = ws.next().await {
        let payload = match frame? {
            Message::Text(text) => text.as_str().as_bytes().to_vec(),
            Message::Binary(data) => data.to_vec(),
            Message::Close(Some(close)) if u16::from(close.code) >= 4000 && !report.started() => {
                let code = u16::from(close.code);
                warn!(
                    component = "installer",
                    event = "installer.rejected",
                    code,
                    reason = %close.reason.as_str(),
                    "Installer refused the request"
                );
                return Err(InstallerError::Rejected {
                    code,
                    reason: close.reason.as_str().to_string(),
                });
            }
            Message::Close(_) => break,
            _ => continue,
        };

        match InstallerEvent::decode(&payload) {
            Ok(event) => {
                report.record(&event);
                on_event(&event);
            }
            Err(e) => debug!(
                component = "installer",
                event = "installer.frame_skipped",
                error = %e,
                bytes = payload.len(),
            ),
        }
    }

    info!(
        component = "installer",
        event = "installer.finished",
        last_step = ?report.last_step,
        failed = report.failure.is_some(),
    );
    Ok(report)
}
