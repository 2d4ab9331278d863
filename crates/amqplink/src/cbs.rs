//! Claims-based-security token negotiation.
//!
//! The authenticator owns a dedicated session and a request/response link pair
//! on the `$cbs` node. Its status is computed on demand from the outstanding
//! PUT-token request, the last outcome and the token expiry; `handle_token` is
//! polled once per client iteration and advances the state machine by at most
//! one step.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::auth::SasTokenAuth;
use crate::config::SessionConfig;
use crate::connection::Connection;
use crate::constants::{CBS_DESCRIPTION_FIELD, CBS_NODE, CBS_PUT_TOKEN, CBS_STATUS_CODE_FIELD};
use crate::error::{AmqpError, Result};
use crate::message::Message;
use crate::mgmt::{MgmtOperation, MgmtOptions, MgmtResult};
use crate::session::Session;
use crate::tick::TickCounter;
use crate::value::AmqpValue;

/// Blocking sleep used for retry backoff.
pub trait Sleeper: Send + Sync {
    /// Blocks the calling thread for `duration`.
    fn sleep(&self, duration: Duration);
}

/// Sleeps the calling thread.
#[derive(Debug, Default, Clone, Copy)]
pub struct ThreadSleeper;

impl Sleeper for ThreadSleeper {
    fn sleep(&self, duration: Duration) {
        if !duration.is_zero() {
            std::thread::sleep(duration);
        }
    }
}

/// Token negotiation status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CbsStatus {
    /// No token has been sent.
    Idle,
    /// A PUT-token request is outstanding.
    InProgress,
    /// The token was accepted and is not close to expiry.
    Ok,
    /// The token is within the refresh window.
    RefreshRequired,
    /// The token has expired.
    Expired,
    /// The last request was not answered in time.
    Timeout,
    /// The last request was refused.
    Error,
    /// The CBS links could not be opened or have failed.
    Failure,
}

/// What the caller should do after `handle_token`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TokenProgress {
    /// Negotiation exceeded its timeout; the caller must fail.
    pub timed_out: bool,
    /// Negotiation is still running; tick the connection and check again.
    pub in_progress: bool,
}

#[derive(Debug, Clone)]
enum TokenOutcome {
    Accepted,
    Refused { status_code: u32, description: String },
    TimedOut,
}

#[derive(Debug)]
struct TokenRequest {
    operation_id: String,
    started_ms: u64,
}

struct CbsState {
    auth: SasTokenAuth,
    retries: u32,
    request: Option<TokenRequest>,
    outcome: Option<TokenOutcome>,
    expires_at_tick: u64,
    refresh_at_tick: u64,
    closed: bool,
}

/// Negotiates and renews a SAS token for one connection over the `$cbs` node.
pub struct CbsAuthenticator {
    session: Session,
    mgmt: MgmtOperation,
    counter: TickCounter,
    sleeper: Arc<dyn Sleeper>,
    state: Mutex<CbsState>,
}

impl CbsAuthenticator {
    /// Begins the CBS session on `connection` and attaches the `$cbs` link pair.
    pub fn create(connection: &Connection, auth: SasTokenAuth, sleeper: Arc<dyn Sleeper>) -> Result<Self> {
        let session = Session::begin(connection, SessionConfig::default()).map_err(|e| AmqpError::Connection {
            reason: format!("unable to open authentication session: {}; confirm target URI exists", e),
        })?;
        let options = MgmtOptions::node(CBS_NODE).with_status_fields(CBS_STATUS_CODE_FIELD, CBS_DESCRIPTION_FIELD);
        let mgmt = MgmtOperation::open(&session, options);
        debug!(audience = %auth.audience(), "CBS authenticator created");

        Ok(Self {
            session,
            mgmt,
            counter: connection.counter().clone(),
            sleeper,
            state: Mutex::new(CbsState {
                auth,
                retries: 0,
                request: None,
                outcome: None,
                expires_at_tick: 0,
                refresh_at_tick: 0,
                closed: false,
            }),
        })
    }

    /// The CBS session. Clients of this connection attach their links on it.
    pub fn session(&self) -> &Session {
        &self.session
    }

    /// Failed PUT-token attempts retried so far. Never reset.
    pub fn retries(&self) -> u32 {
        self.state.lock().retries
    }

    pub fn audience(&self) -> String {
        self.state.lock().auth.audience().to_string()
    }

    /// Current token expiry, seconds since epoch.
    pub fn expires_at(&self) -> u64 {
        self.state.lock().auth.expires_at()
    }

    /// Status code and description of the last refused request.
    pub fn failure_info(&self) -> Option<(u32, String)> {
        match &self.state.lock().outcome {
            Some(TokenOutcome::Refused { status_code, description }) => Some((*status_code, description.clone())),
            _ => None,
        }
    }

    /// Computes the current status without acting on it.
    pub fn status(&self) -> CbsStatus {
        let mut state = self.state.lock();
        self.refresh_status(&mut state)
    }

    /// Advances token negotiation by at most one step.
    ///
    /// Refused requests are retried per the retry policy, sleeping for its
    /// backoff first; once retries are exhausted this fails with
    /// `TokenAuthFailure`. A token inside the refresh window is regenerated and
    /// re-sent, which fails with `TokenExpired` when it cannot be regenerated.
    pub fn handle_token(&self) -> Result<TokenProgress> {
        let mut state = self.state.lock();
        let status = self.refresh_status(&mut state);
        let mut progress = TokenProgress::default();

        match status {
            CbsStatus::Error => {
                let policy = state.auth.retry_policy().clone();
                if !policy.allows(state.retries) {
                    warn!(retries = state.retries, "authentication Put-Token failed, retries exhausted");
                    let (status_code, description) = match &state.outcome {
                        Some(TokenOutcome::Refused { status_code, description }) => (*status_code, description.clone()),
                        _ => (0, "unknown failure".to_string()),
                    };
                    return Err(AmqpError::TokenAuthFailure { status_code, description });
                }
                let backoff = policy.backoff_for(state.retries);
                state.retries += 1;
                info!(retry = state.retries, backoff_ms = backoff.as_millis() as u64, "authentication Put-Token failed, retrying");
                self.sleeper.sleep(backoff);
                self.put_token(&mut state)?;
                progress.in_progress = true;
            }
            CbsStatus::Failure => {
                let reason = self
                    .mgmt
                    .error()
                    .map(|e| e.to_string())
                    .unwrap_or_else(|| "authenticator closed".to_string());
                return Err(AmqpError::Authentication {
                    reason: format!("failed to open CBS authentication link: {}", reason),
                });
            }
            CbsStatus::Expired => {
                return Err(AmqpError::TokenExpired {
                    reason: "CBS authentication expired".to_string(),
                });
            }
            CbsStatus::Timeout => progress.timed_out = true,
            CbsStatus::InProgress => progress.in_progress = true,
            CbsStatus::RefreshRequired => {
                info!("token will expire soon, attempting to refresh");
                state.auth.update_token()?;
                self.put_token(&mut state)?;
                progress.in_progress = true;
            }
            CbsStatus::Idle => {
                self.put_token(&mut state)?;
                progress.in_progress = true;
            }
            CbsStatus::Ok => {}
        }
        Ok(progress)
    }

    /// `handle_token` on the blocking pool.
    pub async fn handle_token_async(self: &Arc<Self>) -> Result<TokenProgress> {
        let cbs = Arc::clone(self);
        tokio::task::spawn_blocking(move || cbs.handle_token()).await?
    }

    /// Detaches the CBS links and ends the session. Further calls are no-ops.
    pub fn close(&self) {
        {
            let mut state = self.state.lock();
            if state.closed {
                return;
            }
            state.closed = true;
            state.request = None;
        }
        self.mgmt.destroy();
        self.session.destroy();
        debug!("CBS authenticator closed");
    }

    fn put_token(&self, state: &mut CbsState) -> Result<()> {
        let expires_at = state.auth.expires_at();
        let message = Message::new(Bytes::from(state.auth.token().to_string()))
            .with_application_property("name", state.auth.audience())
            .with_application_property("expiration", AmqpValue::UInt(expires_at));
        let token_type = state.auth.token_type().to_string();
        let operation_id = self.mgmt.submit(CBS_PUT_TOKEN, &token_type, message)?;

        state.request = Some(TokenRequest {
            operation_id,
            started_ms: self.counter.current_ms(),
        });
        state.outcome = None;
        state.expires_at_tick = self.counter.tick_for_epoch_secs(expires_at);
        state.refresh_at_tick = state
            .expires_at_tick
            .saturating_sub(state.auth.refresh_window().as_millis() as u64);
        debug!(audience = %state.auth.audience(), expires_at, "Put-Token sent");
        Ok(())
    }

    fn refresh_status(&self, state: &mut CbsState) -> CbsStatus {
        if state.closed {
            return CbsStatus::Failure;
        }
        self.mgmt.poll();
        if self.mgmt.has_failed() {
            return CbsStatus::Failure;
        }

        if let Some(request) = &state.request {
            if let Some(response) = self.mgmt.take_response(&request.operation_id) {
                state.request = None;
                state.outcome = Some(match response.result {
                    MgmtResult::Ok => {
                        info!(audience = %state.auth.audience(), "token accepted");
                        TokenOutcome::Accepted
                    }
                    _ => {
                        warn!(status_code = response.status_code, description = %response.description, "token refused");
                        TokenOutcome::Refused {
                            status_code: response.status_code,
                            description: response.description,
                        }
                    }
                });
            } else if self.counter.elapsed_since(request.started_ms) >= state.auth.timeout().as_millis() as u64 {
                warn!(timeout_ms = state.auth.timeout().as_millis() as u64, "token negotiation timed out");
                self.mgmt.cancel(&request.operation_id);
                state.request = None;
                state.outcome = Some(TokenOutcome::TimedOut);
            } else {
                return CbsStatus::InProgress;
            }
        }

        match &state.outcome {
            None => CbsStatus::Idle,
            Some(TokenOutcome::Accepted) => {
                let now = self.counter.current_ms();
                if now >= state.expires_at_tick {
                    CbsStatus::Expired
                } else if now >= state.refresh_at_tick {
                    CbsStatus::RefreshRequired
                } else {
                    CbsStatus::Ok
                }
            }
            Some(TokenOutcome::Refused { .. }) => CbsStatus::Error,
            Some(TokenOutcome::TimedOut) => CbsStatus::Timeout,
        }
    }
}

impl std::fmt::Debug for CbsAuthenticator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("CbsAuthenticator")
            .field("audience", &state.auth.audience())
            .field("retries", &state.retries)
            .field("closed", &state.closed)
            .finish()
    }
}
