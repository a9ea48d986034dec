//! termfleet
//!
//! Command-line front end for the console's realtime plumbing: manage the
//! stored credential, watch state pushes, attach to a terminal session, run
//! file operations against a file-manager session, and follow app installs.

mod cmd_auth;
mod cmd_files;
mod cmd_install;
mod cmd_term;
mod cmd_watch;

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use tracing::info;

use termfleet::config::{ConsoleConfig, HostKind};
use termfleet::credentials::{ClientIdentity, CredentialStore};
use termfleet::{logging, paths, VERSION};
use termfleet_protocol::{ChannelId, SessionId};

/// Exit code when the backend invalidated the credential.
pub const EXIT_FORCED_LOGOUT: u8 = 3;

#[derive(Parser, Debug)]
#[command(name = "termfleet")]
#[command(author, version, about = "Realtime session client for a remote infrastructure console", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Data directory (credentials, browser id, config, logs)
    #[arg(long, global = true, env = "TERMFLEET_DATA_DIR", value_name = "DIR")]
    data_dir: Option<PathBuf>,

    /// Backend base URL (overrides `server_url` in config.toml)
    #[arg(long, global = true, env = "TERMFLEET_SERVER", value_name = "URL")]
    server: Option<String>,

    /// Window host for popped-out sessions (overrides `host` in config.toml)
    #[arg(long, global = true, value_enum)]
    host: Option<HostKind>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Store a session token
    Login {
        token: String,

        /// Store as the override token instead
        #[arg(long = "override")]
        as_override: bool,
    },

    /// Forget every stored token
    Logout,

    /// Stream state pushes as JSON lines until interrupted
    Watch {
        /// Only print this channel
        #[arg(long, value_name = "CHANNEL")]
        channel: Option<ChannelId>,
    },

    /// Ask the backend to re-push state, print what arrives
    Refresh {
        /// Only refresh this channel
        #[arg(long, value_name = "CHANNEL")]
        channel: Option<ChannelId>,

        /// How long to collect pushes after the request
        #[arg(long, default_value_t = 2000, value_name = "MS")]
        wait_ms: u64,
    },

    /// Attach stdin/stdout to a terminal session
    Term {
        session_id: SessionId,

        #[arg(long, default_value_t = 80)]
        cols: u16,

        #[arg(long, default_value_t = 24)]
        rows: u16,
    },

    /// Upload a local file to a path on the remote host
    Save {
        session_id: SessionId,
        remote_path: String,
        local_file: PathBuf,
    },

    /// Delete a remote file or folder
    Rm {
        session_id: SessionId,
        path: String,

        #[arg(long)]
        folder: bool,
    },

    /// Rename a remote path
    Mv {
        session_id: SessionId,
        from: String,
        to: String,
    },

    /// Install an app on a server and print the installer's progress
    Install {
        app_id: String,

        #[arg(long, default_value = "1", value_name = "ID")]
        server_id: String,
    },
}

/// What every subcommand works from, resolved once.
pub struct Env {
    pub config: ConsoleConfig,
    pub credentials: CredentialStore,
    pub identity: ClientIdentity,
}

impl Env {
    fn load(cli: &Cli) -> anyhow::Result<Self> {
        let mut config = ConsoleConfig::load(&paths::config_path())?;
        if let Some(server) = &cli.server {
            config.server_url = server.clone();
        }
        if let Some(host) = cli.host {
            config.host = host;
        }
        Ok(Self {
            config,
            credentials: CredentialStore::new(paths::credentials_path()),
            identity: ClientIdentity::load(&paths::browser_id_path())?,
        })
    }

    /// The active token, or an error telling the user to log in.
    pub fn require_token(&self) -> anyhow::Result<String> {
        self.credentials
            .active_token()
            .ok_or_else(|| anyhow::anyhow!("not logged in (run `termfleet login <token>`)"))
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    let cli = Cli::parse();

    let data_dir = paths::init_data_dir(cli.data_dir.as_deref());
    paths::ensure_dirs()?;
    let _logging = logging::init_logging(&paths::log_dir())?;

    info!(
        component = "cli",
        event = "cli.started",
        version = VERSION,
        data_dir = %data_dir.display(),
        command = ?cli.command,
    );

    let env = Env::load(&cli)?;

    match cli.command {
        Command::Login { token, as_override } => cmd_auth::login(&env, &token, as_override),
        Command::Logout => cmd_auth::logout(&env),
        Command::Watch { channel } => cmd_watch::watch(env, channel).await,
        Command::Refresh { channel, wait_ms } => cmd_watch::refresh(env, channel, wait_ms).await,
        Command::Term {
            session_id,
            cols,
            rows,
        } => cmd_term::run(&env, session_id, cols, rows).await,
        Command::Save {
            session_id,
            remote_path,
            local_file,
        } => cmd_files::save(&env, session_id, &remote_path, &local_file).await,
        Command::Rm {
            session_id,
            path,
            folder,
        } => cmd_files::remove(&env, session_id, &path, folder).await,
        Command::Mv {
            session_id,
            from,
            to,
        } => cmd_files::rename(&env, session_id, &from, &to).await,
        Command::Install { app_id, server_id } => cmd_install::run(&env, app_id, server_id).await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_channel_names_case_insensitively() {
        let cli = Cli::try_parse_from(["termfleet", "watch", "--channel", "connections"]).unwrap();
        match cli.command {
            Command::Watch { channel } => assert_eq!(channel, Some(ChannelId::Connections)),
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn install_defaults_to_the_first_server() {
        let cli = Cli::try_parse_from(["termfleet", "install", "nextcloud"]).unwrap();
        match cli.command {
            Command::Install { app_id, server_id } => {
                assert_eq!(app_id, "nextcloud");
                assert_eq!(server_id, "1");
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn global_flags_follow_the_subcommand() {
        let cli = Cli::try_parse_from([
            "termfleet",
            "rm",
            "7",
            "/tmp/old",
            "--folder",
            "--server",
            "https://console.example.com",
        ])
        .unwrap();
        assert_eq!(cli.server.as_deref(), Some("https://console.example.com"));
        match cli.command {
            Command::Rm {
                session_id,
                path,
                folder,
            } => {
                assert_eq!(session_id, SessionId::from(7u64));
                assert_eq!(path, "/tmp/old");
                assert!(folder);
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }
}
