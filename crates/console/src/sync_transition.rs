//! Pure state transition function for the state-sync channel
//!
//! Lifecycle: `Idle → Connecting → Open → (Closed | Errored) → Connecting → …`
//! with `Invalidated` as the terminal state for a credential the server
//! revoked. All decisions live in `transition(state, input) -> (state, effects)`;
//! the socket task only executes the effects. No IO, no async, no clocks.
//!
//! Timers carry the `generation` they were armed in. Every credential change
//! or invalidation bumps the generation, so retries and watchdogs armed
//! before it fire into the void.

use termfleet_protocol::CLOSE_CREDENTIAL_INVALIDATED;

// ---------------------------------------------------------------------------
// SyncPhase
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncPhase {
    /// No credential, no socket
    Idle,
    /// Dialing
    Connecting,
    Open,
    /// Socket closed with an ordinary code; a retry is pending
    Closed,
    /// Socket or dial error; a retry is pending
    Errored,
    /// Credential revoked server-side; never reconnects
    Invalidated,
}

// ---------------------------------------------------------------------------
// SyncState
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncState {
    pub phase: SyncPhase,
    pub generation: u64,
    pub has_credential: bool,
    /// Reached `Open` at least once for the current credential
    pub has_connected: bool,
    /// Reached `Open` during the current dial attempt
    pub opened_this_attempt: bool,
    /// Degraded-connectivity indicator
    pub connection_error: bool,
}

impl Default for SyncState {
    fn default() -> Self {
        Self {
            phase: SyncPhase::Idle,
            generation: 0,
            has_credential: false,
            has_connected: false,
            opened_this_attempt: false,
            connection_error: false,
        }
    }
}

// ---------------------------------------------------------------------------
// Input / Effect
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncInput {
    CredentialSet,
    CredentialCleared,
    Opened,
    Closed { code: Option<u16> },
    /// Dial failure or transport error
    Failed,
    RetryElapsed { generation: u64 },
    WatchdogElapsed { generation: u64 },
    /// The server pushed a `LOGOUT` envelope
    LogoutPushed,
    /// Another context sharing the credential was logged out
    PeerLoggedOut,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncEffect {
    Dial,
    TearDown,
    ScheduleRetry { generation: u64 },
    ArmWatchdog { generation: u64 },
    ResetBuffers,
    ForcedLogout,
}

// ---------------------------------------------------------------------------
// Transition
// ---------------------------------------------------------------------------

/// Pure, synchronous state transition.
pub fn transition(mut state: SyncState, input: SyncInput) -> (SyncState, Vec<SyncEffect>) {
    let mut effects = Vec::new();

    match input {
        SyncInput::CredentialSet => {
            if matches!(state.phase, SyncPhase::Connecting | SyncPhase::Open) {
                effects.push(SyncEffect::TearDown);
            }
            state.generation += 1;
            state.has_credential = true;
            state.has_connected = false;
            state.opened_this_attempt = false;
            state.connection_error = false;
            state.phase = SyncPhase::Connecting;
            effects.push(SyncEffect::Dial);
            effects.push(SyncEffect::ArmWatchdog {
                generation: state.generation,
            });
        }

        SyncInput::CredentialCleared => {
            state.generation += 1;
            state.has_credential = false;
            state.has_connected = false;
            state.opened_this_attempt = false;
            state.connection_error = false;
            state.phase = SyncPhase::Idle;
            effects.push(SyncEffect::TearDown);
            effects.push(SyncEffect::ResetBuffers);
        }

        SyncInput::Opened => {
            if state.phase == SyncPhase::Connecting {
                state.phase = SyncPhase::Open;
                state.has_connected = true;
                state.opened_this_attempt = true;
                state.connection_error = false;
            }
        }

        SyncInput::Closed { code } if is_live(state.phase) => {
            if code == Some(CLOSE_CREDENTIAL_INVALIDATED) {
                invalidate(&mut state, &mut effects);
            } else {
                drop_socket(&mut state, SyncPhase::Closed, &mut effects);
            }
        }

        SyncInput::Failed if is_live(state.phase) => {
            drop_socket(&mut state, SyncPhase::Errored, &mut effects);
        }

        SyncInput::Closed { .. } | SyncInput::Failed => {}

        SyncInput::RetryElapsed { generation } => {
            let waiting = matches!(state.phase, SyncPhase::Closed | SyncPhase::Errored);
            if generation == state.generation && waiting && state.has_credential {
                state.phase = SyncPhase::Connecting;
                state.opened_this_attempt = false;
                effects.push(SyncEffect::Dial);
            }
        }

        SyncInput::WatchdogElapsed { generation } => {
            let active = !matches!(state.phase, SyncPhase::Idle | SyncPhase::Invalidated);
            if generation == state.generation && active && !state.has_connected {
                state.connection_error = true;
            }
        }

        SyncInput::LogoutPushed | SyncInput::PeerLoggedOut => {
            if state.phase != SyncPhase::Invalidated && state.has_credential {
                effects.push(SyncEffect::TearDown);
                invalidate(&mut state, &mut effects);
            }
        }
    }

    (state, effects)
}

fn is_live(phase: SyncPhase) -> bool {
    matches!(phase, SyncPhase::Connecting | SyncPhase::Open)
}

fn invalidate(state: &mut SyncState, effects: &mut Vec<SyncEffect>) {
    state.generation += 1;
    state.phase = SyncPhase::Invalidated;
    state.has_credential = false;
    state.opened_this_attempt = false;
    effects.push(SyncEffect::ResetBuffers);
    effects.push(SyncEffect::ForcedLogout);
}

fn drop_socket(state: &mut SyncState, next: SyncPhase, effects: &mut Vec<SyncEffect>) {
    if !state.opened_this_attempt {
        state.connection_error = true;
    }
    state.phase = next;
    state.opened_this_attempt = false;
    if state.has_credential {
        effects.push(SyncEffect::ScheduleRetry {
            generation: state.generation,
        });
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
