use std::sync::Arc;

use tokio::sync::{mpsc, watch};
use tokio::time::{Instant, MissedTickBehavior, interval, sleep_until, timeout_at};
use tokio_stream::StreamExt;
use tracing::{debug, info, instrument, trace, warn};

use super::lifecycle::{ActiveScan, ConnectOutcome, PendingConnect, ScanEnd, TeardownOrigin};
use super::{CommandSlot, Reply, Request, SessionConfig};
use crate::adapter::{AdapterEvent, AdapterEventStream, BleAdapter};
use crate::codec::encode_command;
use crate::correlator::{Correlator, Responder, Settlement};
use crate::error::{ElmError, ErrorClass};
use crate::profile::WriteMode;
use crate::store::{AggregateState, ConnectionState, LastError, StateEvent, reduce};
use crate::watchdog::{StreamingStopReason, StreamingWatchdog, WatchdogVerdict};

/// Owns every piece of mutable session state. Runs on one task.
pub(super) struct SessionActor {
    pub(super) adapter: Arc<dyn BleAdapter>,
    pub(super) config: SessionConfig,
    state: watch::Sender<AggregateState>,
    correlator: Correlator,
    command_slot: CommandSlot,
    watchdog: StreamingWatchdog,
    pub(super) scan: Option<ActiveScan>,
    pub(super) connect: Option<PendingConnect>,
    pub(super) outcomes: mpsc::UnboundedSender<ConnectOutcome>,
}

impl SessionActor {
    pub(super) fn new(
        adapter: Arc<dyn BleAdapter>,
        config: SessionConfig,
        state: watch::Sender<AggregateState>,
        outcomes: mpsc::UnboundedSender<ConnectOutcome>,
        command_slot: CommandSlot,
    ) -> Self {
        let watchdog = StreamingWatchdog::new(config.inactivity_threshold);
        Self {
            adapter,
            config,
            state,
            correlator: Correlator::default(),
            command_slot,
            watchdog,
            scan: None,
            connect: None,
            outcomes,
        }
    }

    pub(super) async fn run(
        mut self,
        mut requests: mpsc::UnboundedReceiver<Request>,
        mut events: AdapterEventStream,
        mut outcomes: mpsc::UnboundedReceiver<ConnectOutcome>,
    ) {
        let mut watchdog_tick = interval(self.config.watchdog_interval);
        watchdog_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut events_open = true;

        loop {
            let command_deadline = self.correlator.deadline();
            let scan_deadline = self.scan.as_ref().map(ActiveScan::deadline);

            tokio::select! {
                biased;

                request = requests.recv() => match request {
                    Some(Request::Close { reply }) => {
                        self.shutdown(&mut outcomes).await;
                        if reply.send(()).is_err() {
                            trace!("close caller went away");
                        }
                        break;
                    }
                    Some(request) => self.handle_request(request).await,
                    None => {
                        debug!("all session handles dropped");
                        self.shutdown(&mut outcomes).await;
                        break;
                    }
                },
                Some(outcome) = outcomes.recv() => self.finish_connect(outcome).await,
                event = events.next(), if events_open => match event {
                    Some(event) => self.handle_event(event).await,
                    None => {
                        warn!("adapter event stream ended");
                        events_open = false;
                    }
                },
                () = wait_until(command_deadline) => self.expire_command(),
                () = wait_until(scan_deadline) => self.finish_scan(ScanEnd::Deadline).await,
                _ = watchdog_tick.tick() => self.check_watchdog(),
            }
        }

        info!("session closed");
    }

    pub(super) fn snapshot(&self) -> AggregateState {
        self.state.borrow().clone()
    }

    /// Runs one event through the reducer and publishes the result.
    pub(super) fn apply(&self, event: StateEvent) {
        self.state
            .send_modify(|state| *state = reduce(std::mem::take(state), event));
    }

    /// Records `error` on the state and returns it for the caller.
    pub(super) fn record(&self, class: ErrorClass, error: ElmError) -> ElmError {
        self.apply(StateEvent::ErrorRaised(LastError::new(class, &error)));
        error
    }

    pub(super) fn reply<T>(reply: Reply<T>, result: Result<T, ElmError>) {
        if reply.send(result).is_err() {
            trace!("caller dropped its response future");
        }
    }

    async fn handle_request(&mut self, request: Request) {
        match request {
            Request::Scan { duration, reply } => self.start_scan(duration, reply).await,
            Request::Connect { device_id, reply } => self.start_connect(device_id, reply).await,
            Request::Disconnect { reply } => {
                let result = self.teardown(TeardownOrigin::Local).await;
                Self::reply(reply, result);
            }
            Request::Command {
                command,
                timeout,
                responder,
            } => self.start_command(command, timeout, responder).await,
            Request::SetStreaming { enabled, reply } => {
                let result = self.set_streaming(enabled);
                Self::reply(reply, result);
            }
            Request::Close { reply } => {
                if reply.send(()).is_err() {
                    trace!("close caller went away");
                }
            }
        }
    }

    async fn handle_event(&mut self, event: AdapterEvent) {
        match event {
            AdapterEvent::AdapterStateChanged { powered_on } => {
                info!(powered_on, "adapter power changed");
                self.apply(StateEvent::AdapterPowerChanged { powered_on });
                if !powered_on {
                    self.finish_scan(ScanEnd::AdapterOff).await;
                    self.remote_teardown().await;
                }
            }
            AdapterEvent::PeripheralDiscovered { id, name, rssi } => {
                self.discover(id, name, rssi);
            }
            AdapterEvent::ScanStopped => self.finish_scan(ScanEnd::Adapter).await,
            AdapterEvent::PeripheralDisconnected { id, reason } => {
                let connected = self.snapshot().connected_device_id().map(str::to_string);
                if connected.as_deref() == Some(id.as_str()) {
                    info!(device_id = %id, reason = reason.as_deref().unwrap_or("unknown"), "device disconnected");
                    self.remote_teardown().await;
                } else {
                    debug!(device_id = %id, "ignoring disconnect of a device that is not connected");
                }
            }
            AdapterEvent::CharacteristicValueUpdated {
                id,
                service_id,
                characteristic_id,
                value,
            } => self.ingest(&id, &service_id, &characteristic_id, &value),
        }
    }

    fn ingest(&mut self, id: &str, service_id: &str, characteristic_id: &str, value: &[u8]) {
        let state = self.snapshot();
        let from_active_profile = state.connected_device_id() == Some(id)
            && state
                .active_profile()
                .is_some_and(|profile| profile.is_notify_source(service_id, characteristic_id));
        if !from_active_profile {
            trace!(id, characteristic_id, "ignoring notification from another source");
            return;
        }

        if let Some(settlement) = self.correlator.ingest(value) {
            self.settle(settlement);
        }
    }

    /// Publishes the outcome of a command, then wakes its caller.
    pub(super) fn settle(&self, settlement: Settlement) {
        match settlement.error() {
            None => {
                debug!(command = settlement.command(), "command resolved");
                self.apply(StateEvent::CommandSucceeded { at: Instant::now() });
            }
            Some(error) => {
                debug!(command = settlement.command(), kind = %error.kind(), "command failed");
                self.apply(StateEvent::CommandFailed);
                self.apply(StateEvent::ErrorRaised(error));
            }
        }
        self.command_slot.release();
        settlement.deliver();
    }

    pub(super) fn cancel_command(&mut self) {
        if let Some(settlement) = self.correlator.cancel() {
            self.settle(settlement);
        }
    }

    /// Gives the correlator a clean slot for a new connection.
    pub(super) fn reset_correlator(&mut self) {
        self.correlator = Correlator::default();
    }

    #[instrument(skip(self, responder), level = "debug", fields(shape = %responder.shape()))]
    async fn start_command(
        &mut self,
        command: String,
        timeout: Option<std::time::Duration>,
        responder: Responder,
    ) {
        let state = self.snapshot();
        let (Some(device_id), Some(profile)) = (state.connected_device_id(), state.active_profile())
        else {
            self.command_slot.release();
            responder.reject(ElmError::NotConnected);
            return;
        };

        let timeout = timeout.unwrap_or(self.config.command_timeout);
        if let Err((responder, error)) =
            self.correlator
                .install(command.clone(), timeout, Instant::now(), responder)
        {
            // The slot is still held by the installed command.
            debug!(%error, "rejecting command");
            responder.reject(error);
            return;
        }
        let Some(deadline) = self.correlator.deadline() else {
            return;
        };

        self.apply(StateEvent::ErrorsCleared(ErrorClass::Command));
        self.apply(StateEvent::CommandStarted {
            command: command.clone(),
        });

        let payload = encode_command(&command);
        let adapter = Arc::clone(&self.adapter);
        let write = match profile.write_mode() {
            WriteMode::WithAck => adapter.write(
                device_id,
                profile.service_id(),
                profile.write_characteristic_id(),
                &payload,
            ),
            WriteMode::NoAck => adapter.write_without_response(
                device_id,
                profile.service_id(),
                profile.write_characteristic_id(),
                &payload,
            ),
        };

        match timeout_at(deadline, write).await {
            Ok(Ok(())) => trace!(bytes = payload.len(), "command written"),
            Ok(Err(source)) => {
                warn!(error = %source, "command write failed");
                if let Some(settlement) = self.correlator.fail_write(source) {
                    self.settle(settlement);
                }
            }
            Err(_elapsed) => self.expire_command(),
        }
    }

    fn expire_command(&mut self) {
        if let Some(settlement) = self.correlator.expire(Instant::now()) {
            self.settle(settlement);
        }
    }

    fn set_streaming(&self, enabled: bool) -> Result<(), ElmError> {
        if !enabled {
            self.apply(StateEvent::StreamingStopped {
                reason: StreamingStopReason::User,
            });
            return Ok(());
        }

        if self.snapshot().connection() != ConnectionState::Connected {
            return Err(ElmError::NotConnected);
        }
        info!("streaming started");
        self.apply(StateEvent::StreamingStarted { at: Instant::now() });
        Ok(())
    }

    fn check_watchdog(&self) {
        let streaming = self.snapshot().streaming();
        match self.watchdog.check(&streaming, Instant::now()) {
            WatchdogVerdict::Off => {}
            WatchdogVerdict::Healthy { idle } => trace!(?idle, "streaming healthy"),
            WatchdogVerdict::Tripped { idle } => {
                warn!(?idle, threshold = ?self.watchdog.threshold(), "no successful command; stopping streaming");
                self.apply(StateEvent::StreamingStopped {
                    reason: StreamingStopReason::Inactivity,
                });
                self.record(
                    ErrorClass::Streaming,
                    ElmError::StreamingInactivity { idle },
                );
            }
        }
    }

    /// Ends the session: pending connects and scans are abandoned and the
    /// connected device, if any, is released.
    async fn shutdown(&mut self, outcomes: &mut mpsc::UnboundedReceiver<ConnectOutcome>) {
        self.finish_scan(ScanEnd::Closed).await;
        self.abandon_connect(outcomes).await;
        if let Err(error) = self.teardown(TeardownOrigin::Local).await {
            warn!(%error, "disconnect during close failed");
        }
    }
}

async fn wait_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
