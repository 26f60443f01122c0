//! Connection lifecycle and command correlation behind one event-loop actor.
//!
//! A [`Session`] is a cheap handle onto a single tokio task that owns the
//! aggregate state, the pending command slot and the streaming watchdog.
//! Requests, adapter events and timers are processed one at a time, so each
//! state transition is atomic with respect to the others.

mod actor;
mod lifecycle;

use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use std::time::Duration;

use bon::Builder;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, info, instrument};

use self::actor::SessionActor;
use crate::adapter::BleAdapter;
use crate::codec::ChunkedResponse;
use crate::correlator::Responder;
use crate::error::{AdapterError, ElmError};
use crate::profile::{ActiveProfile, ProfileCatalog};
use crate::store::{
    AggregateState, ConnectionState, DEFAULT_COMPATIBLE_KEYWORDS, StateEvent, reduce,
};
use crate::utils::lock;
use crate::watchdog::{DEFAULT_CHECK_INTERVAL, DEFAULT_INACTIVITY_THRESHOLD};

/// Default time a command may wait for its terminator.
pub const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_millis(5_000);

/// Settings fixed for the lifetime of a session.
#[derive(Debug, Clone, Builder)]
pub struct SessionConfig {
    #[builder(default = DEFAULT_COMMAND_TIMEOUT)]
    command_timeout: Duration,
    #[builder(default = DEFAULT_INACTIVITY_THRESHOLD)]
    inactivity_threshold: Duration,
    #[builder(default = DEFAULT_CHECK_INTERVAL)]
    watchdog_interval: Duration,
    #[builder(default)]
    catalog: ProfileCatalog,
    #[builder(default = DEFAULT_COMPATIBLE_KEYWORDS.iter().map(|keyword| (*keyword).to_string()).collect())]
    compatible_keywords: Vec<String>,
    /// Service UUIDs to filter scans by; empty scans for everything.
    #[builder(default)]
    scan_service_filters: Vec<String>,
    #[builder(default)]
    allow_duplicates: bool,
}

impl SessionConfig {
    #[must_use]
    pub fn command_timeout(&self) -> Duration {
        self.command_timeout
    }

    #[must_use]
    pub fn inactivity_threshold(&self) -> Duration {
        self.inactivity_threshold
    }

    #[must_use]
    pub fn watchdog_interval(&self) -> Duration {
        self.watchdog_interval
    }

    #[must_use]
    pub fn catalog(&self) -> &ProfileCatalog {
        &self.catalog
    }

    #[must_use]
    pub fn compatible_keywords(&self) -> &[String] {
        &self.compatible_keywords
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self::builder().build()
    }
}

/// Per-command overrides.
#[derive(Debug, Clone, Copy, Default, Eq, PartialEq)]
pub struct CommandOptions {
    timeout: Option<Duration>,
}

impl CommandOptions {
    /// Overrides the session's default command timeout.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    #[must_use]
    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }
}

/// Resolves once the session has finished the corresponding operation.
///
/// Fails with [`ElmError::SessionClosed`] if the session stops first.
#[derive(Debug)]
#[must_use = "futures do nothing unless awaited"]
pub struct ResponseFuture<T> {
    receiver: oneshot::Receiver<Result<T, ElmError>>,
}

impl<T> Future for ResponseFuture<T> {
    type Output = Result<T, ElmError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.receiver)
            .poll(cx)
            .map(|received| received.unwrap_or(Err(ElmError::SessionClosed)))
    }
}

type Reply<T> = oneshot::Sender<Result<T, ElmError>>;

/// Single-flight reservation shared by the handles and the actor.
///
/// Handles claim it before enqueueing a command; the actor releases it once
/// the command settles or is refused.
#[derive(Debug, Clone, Default)]
pub(crate) struct CommandSlot(Arc<Mutex<Option<String>>>);

impl CommandSlot {
    fn claim(&self, command: &str) -> Result<(), ElmError> {
        let mut held = lock(&self.0);
        if let Some(pending) = held.as_deref() {
            return Err(ElmError::CommandInProgress {
                requested: command.to_string(),
                pending: pending.to_string(),
            });
        }
        *held = Some(command.to_string());
        Ok(())
    }

    pub(crate) fn release(&self) {
        lock(&self.0).take();
    }
}

#[derive(Debug)]
pub(crate) enum Request {
    Scan {
        duration: Duration,
        reply: Reply<()>,
    },
    Connect {
        device_id: String,
        reply: Reply<ActiveProfile>,
    },
    Disconnect {
        reply: Reply<()>,
    },
    Command {
        command: String,
        timeout: Option<Duration>,
        responder: Responder,
    },
    SetStreaming {
        enabled: bool,
        reply: Reply<()>,
    },
    Close {
        reply: oneshot::Sender<()>,
    },
}

/// Handle onto a running session. Clones share the same session.
#[derive(Debug, Clone)]
pub struct Session {
    requests: mpsc::UnboundedSender<Request>,
    state: watch::Receiver<AggregateState>,
    command_slot: CommandSlot,
}

impl Session {
    /// Starts the adapter, reads its power and permission state and spawns
    /// the session actor.
    ///
    /// # Errors
    ///
    /// Returns an error if the adapter cannot be started or queried.
    #[instrument(skip_all, level = "debug")]
    pub async fn open(
        adapter: Arc<dyn BleAdapter>,
        config: SessionConfig,
    ) -> Result<Self, AdapterError> {
        let initial = reduce(AggregateState::default(), StateEvent::InitializationStarted);
        let (state_tx, state_rx) = watch::channel(initial);

        let events = adapter.start().await?;
        let has_permissions = adapter.permissions_granted().await?;
        let power = adapter.check_adapter_state().await?;
        state_tx.send_modify(|state| {
            *state = reduce(
                std::mem::take(state),
                StateEvent::InitializationFinished {
                    bluetooth_on: power.is_on(),
                    has_permissions,
                },
            );
        });
        info!(%power, has_permissions, "session initialised");

        let (requests_tx, requests_rx) = mpsc::unbounded_channel();
        let (outcomes_tx, outcomes_rx) = mpsc::unbounded_channel();
        let command_slot = CommandSlot::default();
        let actor = SessionActor::new(
            adapter,
            config,
            state_tx,
            outcomes_tx,
            command_slot.clone(),
        );
        tokio::spawn(actor.run(requests_rx, events, outcomes_rx));

        Ok(Self {
            requests: requests_tx,
            state: state_rx,
            command_slot,
        })
    }

    /// Returns a snapshot of the aggregate state.
    #[must_use]
    pub fn state(&self) -> AggregateState {
        self.state.borrow().clone()
    }

    /// Returns a receiver that observes every state change.
    #[must_use]
    pub fn watch_state(&self) -> watch::Receiver<AggregateState> {
        self.state.clone()
    }

    /// Scans for `duration`, or until the adapter reports the scan stopped.
    ///
    /// # Errors
    ///
    /// Fails when the adapter is off, permissions are missing, the session is
    /// not idle or the adapter rejects the scan.
    pub async fn scan(&self, duration: Duration) -> Result<(), ElmError> {
        self.request(|reply| Request::Scan { duration, reply }).await
    }

    /// Connects to `device_id` and negotiates a device profile. Connecting to
    /// the already connected device returns its profile.
    ///
    /// # Errors
    ///
    /// Fails when another connection attempt is running, a different device
    /// is connected, the device cannot be reached or no profile matches.
    pub async fn connect(&self, device_id: &str) -> Result<ActiveProfile, ElmError> {
        let device_id = device_id.to_string();
        self.request(|reply| Request::Connect { device_id, reply })
            .await
    }

    /// Disconnects the current device; a no-op when nothing is connected.
    ///
    /// # Errors
    ///
    /// Fails when the adapter cannot disconnect. The session state is
    /// cleared regardless.
    pub async fn disconnect(&self) -> Result<(), ElmError> {
        self.request(|reply| Request::Disconnect { reply }).await
    }

    /// Sends a command and resolves with its trimmed text response.
    ///
    /// # Errors
    ///
    /// Returns [`ElmError::NotConnected`] or [`ElmError::CommandInProgress`]
    /// immediately when the command cannot be accepted.
    pub fn send_command(
        &self,
        command: &str,
        options: CommandOptions,
    ) -> Result<ResponseFuture<String>, ElmError> {
        self.command(command, options, Responder::Text)
    }

    /// Sends a command and resolves with the raw response bytes.
    ///
    /// # Errors
    ///
    /// See [`Session::send_command`].
    pub fn send_command_bytes(
        &self,
        command: &str,
        options: CommandOptions,
    ) -> Result<ResponseFuture<Vec<u8>>, ElmError> {
        self.command(command, options, Responder::Bytes)
    }

    /// Sends a command and resolves with the response bytes and the
    /// notification fragments that carried them.
    ///
    /// # Errors
    ///
    /// See [`Session::send_command`].
    pub fn send_command_chunked(
        &self,
        command: &str,
        options: CommandOptions,
    ) -> Result<ResponseFuture<ChunkedResponse>, ElmError> {
        self.command(command, options, Responder::Chunked)
    }

    /// Turns streaming mode on or off.
    ///
    /// # Errors
    ///
    /// Returns [`ElmError::NotConnected`] immediately when enabling streaming
    /// without a connection.
    pub fn set_streaming(&self, enabled: bool) -> Result<ResponseFuture<()>, ElmError> {
        if enabled && self.state.borrow().connection() != ConnectionState::Connected {
            return Err(ElmError::NotConnected);
        }
        Ok(self.request(|reply| Request::SetStreaming { enabled, reply }))
    }

    /// Disconnects, stops any scan and ends the actor. Safe to call more
    /// than once and from any state.
    pub async fn close(&self) {
        let (reply, done) = oneshot::channel();
        if self.requests.send(Request::Close { reply }).is_err() {
            debug!("session already closed");
            return;
        }
        if done.await.is_err() {
            debug!("session stopped before acknowledging close");
        }
    }

    fn command<T>(
        &self,
        command: &str,
        options: CommandOptions,
        responder: fn(Reply<T>) -> Responder,
    ) -> Result<ResponseFuture<T>, ElmError> {
        if self.state.borrow().connection() != ConnectionState::Connected {
            return Err(ElmError::NotConnected);
        }
        self.command_slot.claim(command)?;

        let (reply, receiver) = oneshot::channel();
        let request = Request::Command {
            command: command.to_string(),
            timeout: options.timeout(),
            responder: responder(reply),
        };
        if self.requests.send(request).is_err() {
            self.command_slot.release();
            return Err(ElmError::SessionClosed);
        }
        Ok(ResponseFuture { receiver })
    }

    fn request<T>(&self, build: impl FnOnce(Reply<T>) -> Request) -> ResponseFuture<T> {
        let (reply, receiver) = oneshot::channel();
        if self.requests.send(build(reply)).is_err() {
            debug!("session actor has stopped; request dropped");
        }
        ResponseFuture { receiver }
    }
}
