//! `termfleet term`: bridge stdin/stdout to a terminal session socket.

use std::process::ExitCode;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::mpsc;
use tracing::info;

use termfleet::transport::{TerminalTransport, TransportEvent, TransportSettings};
use termfleet_protocol::{RendererKind, SessionId, TermSize};

use crate::Env;

pub async fn run(env: &Env, session_id: SessionId, cols: u16, rows: u16) -> anyhow::Result<ExitCode> {
    let settings = TransportSettings {
        ws_base: env.config.ws_base()?,
        token: env.require_token()?,
        resize_interval: env.config.resize_interval(),
    };
    let (events_tx, mut events) = mpsc::unbounded_channel();
    let (handle, mut output) = TerminalTransport::connect(
        &settings,
        session_id.clone(),
        RendererKind::Terminal,
        TermSize::new(cols, rows),
        events_tx,
    )?;
    handle.wait_open().await?;
    eprintln!("  Attached to session {session_id} ({cols}x{rows}), Ctrl-C to detach");

    let input = handle.clone();
    let stdin_task = tokio::spawn(async move {
        let mut stdin = tokio::io::stdin();
        let mut buf = [0u8; 4096];
        loop {
            match stdin.read(&mut buf).await {
                Ok(0) | Err(_) => break,
                Ok(n) => input.send_input(&buf[..n]),
            }
        }
    });

    let mut stdout = tokio::io::stdout();
    let code = loop {
        tokio::select! {
            frame = output.recv() => match frame {
                Some(data) => {
                    stdout.write_all(&data).await?;
                    stdout.flush().await?;
                }
                None => break ExitCode::FAILURE,
            },
            Some(TransportEvent::Terminated { code, .. }) = events.recv() => {
                eprintln!(
                    "\r\n  Session ended{}",
                    code.map(|c| format!(" (close code {c})")).unwrap_or_default()
                );
                break ExitCode::FAILURE;
            }
            _ = tokio::signal::ctrl_c() => {
                handle.dispose();
                break ExitCode::SUCCESS;
            }
        }
    };

    stdin_task.abort();
    info!(
        component = "cli",
        event = "cli.term_detached",
        session_id = %session_id,
    );
    Ok(code)
}
