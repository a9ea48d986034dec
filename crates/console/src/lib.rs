//! termfleet console
//!
//! Client-side realtime plumbing for a remote-infrastructure console: the
//! state-sync socket and its subscription registry, per-session terminal
//! transports, the file-operation driver, the app installer follower, and
//! the multiplexer that moves sessions between windows.

pub mod bus;
pub mod config;
pub mod console;
pub mod credentials;
pub mod file_session;
pub mod installer;
pub mod logging;
pub mod multiplexer;
pub mod multiplexer_actor;
pub mod multiplexer_command;
pub mod paths;
pub mod registry;
pub mod state_sync;
pub mod sync_transition;
pub mod transport;
pub mod window_host;

pub use console::{Console, ConsoleError, ConsoleOptions, DetachedSession};
pub use multiplexer::{MultiplexError, MuxNotice, Session};
pub use multiplexer_actor::{MultiplexerHandle, SessionOutput};
pub use registry::{Subscription, SubscriptionRegistry};
pub use state_sync::{LogoutOrigin, StateSyncChannel, StateSyncHandle, SyncEvent};

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
