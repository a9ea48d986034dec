//! `termfleet login` / `termfleet logout`: edit the stored credential.

use std::process::ExitCode;

use tracing::info;

use crate::Env;

pub fn login(env: &Env, token: &str, as_override: bool) -> anyhow::Result<ExitCode> {
    let token = token.trim();
    anyhow::ensure!(!token.is_empty(), "token must not be empty");

    if as_override {
        env.credentials.set_override_token(Some(token))?;
    } else {
        env.credentials.set_session_token(token)?;
    }

    info!(
        component = "cli",
        event = "cli.login",
        as_override,
        path = %env.credentials.path().display(),
    );
    println!("  Token saved to {}", env.credentials.path().display());
    Ok(ExitCode::SUCCESS)
}

pub fn logout(env: &Env) -> anyhow::Result<ExitCode> {
    env.credentials.clear()?;
    info!(component = "cli", event = "cli.logout");
    println!("  Logged out");
    Ok(ExitCode::SUCCESS)
}
