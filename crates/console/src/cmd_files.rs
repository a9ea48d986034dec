//! `termfleet save` / `rm` / `mv`: file operations over a file-manager session.

use std::path::Path;
use std::process::ExitCode;
use std::time::Duration;

use tokio::sync::mpsc;
use tracing::info;

use termfleet::file_session::{FileReplyStream, FileSession};
use termfleet::transport::{TerminalTransport, TransportSettings};
use termfleet_protocol::{FileReply, RendererKind, SessionId, TermSize};

use crate::Env;

/// Connect, then wait for the server's ready signal.
async fn open(env: &Env, session_id: SessionId) -> anyhow::Result<(FileSession, FileReplyStream)> {
    let settings = TransportSettings {
        ws_base: env.config.ws_base()?,
        token: env.require_token()?,
        resize_interval: env.config.resize_interval(),
    };
    // Nobody needs termination reports for a one-shot command.
    let (events_tx, _) = mpsc::unbounded_channel();
    let (handle, inbound) = TerminalTransport::connect(
        &settings,
        session_id,
        RendererKind::Sftp,
        TermSize::default(),
        events_tx,
    )?;
    handle.wait_open().await?;

    let mut replies = FileReplyStream::new(inbound);
    let ready = tokio::time::timeout(env.config.watchdog(), replies.wait_ready()).await;
    anyhow::ensure!(
        matches!(ready, Ok(true)),
        "file session {} never became ready",
        handle.session_id()
    );
    Ok((FileSession::new(handle), replies))
}

/// First acknowledgement or error after an operation. Silence is not a failure:
/// the backend only answers some operations.
async fn outcome(replies: &mut FileReplyStream, wait: Duration) -> anyhow::Result<()> {
    let deadline = tokio::time::Instant::now() + wait;
    loop {
        match tokio::time::timeout_at(deadline, replies.next()).await {
            Ok(Some(FileReply::Error { message })) => anyhow::bail!("server refused: {message}"),
            Ok(Some(FileReply::Ack(_) | FileReply::Listing { .. })) => return Ok(()),
            Ok(Some(_)) => {}
            Ok(None) => anyhow::bail!("file session closed before replying"),
            Err(_) => return Ok(()),
        }
    }
}

pub async fn save(
    env: &Env,
    session_id: SessionId,
    remote_path: &str,
    local_file: &Path,
) -> anyhow::Result<ExitCode> {
    let content = tokio::fs::read(local_file).await?;
    let (files, mut replies) = open(env, session_id).await?;

    files.save(remote_path, &content).await?;
    outcome(&mut replies, env.config.watchdog()).await?;

    info!(
        component = "cli",
        event = "cli.file_saved",
        session_id = %files.session_id(),
        path = %remote_path,
        bytes = content.len(),
    );
    println!("  Saved {} bytes to {remote_path}", content.len());
    files.close();
    Ok(ExitCode::SUCCESS)
}

pub async fn remove(
    env: &Env,
    session_id: SessionId,
    path: &str,
    folder: bool,
) -> anyhow::Result<ExitCode> {
    let (files, mut replies) = open(env, session_id).await?;

    if folder {
        files.delete_folder(path)?;
    } else {
        files.delete_file(path)?;
    }
    files.flush().await?;
    outcome(&mut replies, env.config.watchdog()).await?;

    println!("  Removed {path}");
    files.close();
    Ok(ExitCode::SUCCESS)
}

pub async fn rename(
    env: &Env,
    session_id: SessionId,
    from: &str,
    to: &str,
) -> anyhow::Result<ExitCode> {
    let (files, mut replies) = open(env, session_id).await?;

    files.rename(from, to)?;
    files.flush().await?;
    outcome(&mut replies, env.config.watchdog()).await?;

    println!("  Renamed {from} -> {to}");
    files.close();
    Ok(ExitCode::SUCCESS)
}
