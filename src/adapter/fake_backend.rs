use std::collections::HashMap;
use std::str::FromStr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bon::Builder;
use strum_macros::{Display, IntoStaticStr};
use tokio::sync::mpsc;
use tokio::time::sleep;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, trace};

use super::model::{AdapterEvent, AdapterPowerState, CharacteristicInfo, ServiceInfo};
use super::{AdapterEventStream, BleAdapter};
use crate::error::{AdapterError, FixtureError};
use crate::profile::{DeviceProfile, ProfileCatalog, WriteMode};
use crate::utils::lock;

const UNKNOWN_COMMAND_REPLY: &[u8] = b"?\r\r>";

/// A scripted peripheral known to the fake adapter.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct FakePeripheral {
    id: String,
    name: Option<String>,
    rssi: Option<i16>,
    services: Vec<ServiceInfo>,
}

impl FakePeripheral {
    /// Creates a peripheral that exposes no services.
    #[must_use]
    pub fn new(id: impl Into<String>, name: Option<&str>, rssi: Option<i16>) -> Self {
        Self {
            id: id.into(),
            name: name.map(str::to_string),
            rssi,
            services: Vec::new(),
        }
    }

    /// Adds the service layout described by `profile`.
    #[must_use]
    pub fn with_profile(mut self, profile: &DeviceProfile, write_mode: WriteMode) -> Self {
        let write_property = match write_mode {
            WriteMode::WithAck => "write",
            WriteMode::NoAck => "write_without_response",
        };
        let characteristics = if profile.write_uuid() == profile.notify_uuid() {
            vec![CharacteristicInfo::new(
                profile.write_uuid(),
                vec![write_property.to_string(), "notify".to_string()],
            )]
        } else {
            vec![
                CharacteristicInfo::new(profile.notify_uuid(), vec!["notify".to_string()]),
                CharacteristicInfo::new(profile.write_uuid(), vec![write_property.to_string()]),
            ]
        };
        self.services
            .push(ServiceInfo::new(profile.service_uuid(), characteristics));
        self
    }

    /// Replaces the exposed services.
    #[must_use]
    pub fn with_services(mut self, services: Vec<ServiceInfo>) -> Self {
        self.services = services;
        self
    }

    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }
}

/// Parsed `id|name|rssi[|profile]` records separated by `;`.
///
/// `-` marks an absent name, RSSI or profile. The profile is the 1-based
/// position in the built-in catalog.
#[derive(Debug, Clone, derive_more::Into)]
pub struct ScanFixture {
    peripherals: Vec<FakePeripheral>,
}

impl ScanFixture {
    /// Gives every peripheral without services the layout of the 1-based
    /// catalog entry `position`.
    ///
    /// # Errors
    ///
    /// Returns an error if `position` is outside the built-in catalog.
    pub fn with_default_profile(mut self, position: usize) -> Result<Self, FixtureError> {
        let profile = catalog_profile(position)?;
        self.peripherals = self
            .peripherals
            .into_iter()
            .map(|peripheral| {
                if peripheral.services.is_empty() {
                    peripheral.with_profile(&profile, WriteMode::NoAck)
                } else {
                    peripheral
                }
            })
            .collect();
        Ok(self)
    }
}

impl FromStr for ScanFixture {
    type Err = FixtureError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        if value.trim().is_empty() {
            return Err(FixtureError::EmptyFixture);
        }

        let peripherals = value
            .split(';')
            .map(parse_scan_record)
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { peripherals })
    }
}

fn parse_scan_record(raw_record: &str) -> Result<FakePeripheral, FixtureError> {
    let fields: Vec<&str> = raw_record.split('|').map(str::trim).collect();
    if !(3..=4).contains(&fields.len()) {
        return Err(FixtureError::InvalidRecordFieldCount);
    }
    if fields.iter().any(|field| field.is_empty()) {
        return Err(FixtureError::EmptyRecordField);
    }

    let name = (fields[1] != "-").then_some(fields[1]);
    let rssi = if fields[2] == "-" {
        None
    } else {
        Some(fields[2].parse::<i16>()?)
    };
    let peripheral = FakePeripheral::new(fields[0], name, rssi);

    match fields.get(3) {
        None | Some(&"-") => Ok(peripheral),
        Some(position) => {
            let position = position
                .parse::<usize>()
                .map_err(|_| FixtureError::InvalidProfileIndex {
                    value: (*position).to_string(),
                })?;
            Ok(peripheral.with_profile(&catalog_profile(position)?, WriteMode::NoAck))
        }
    }
}

fn catalog_profile(position: usize) -> Result<DeviceProfile, FixtureError> {
    position
        .checked_sub(1)
        .and_then(|index| ProfileCatalog::default().profiles().get(index).cloned())
        .ok_or_else(|| FixtureError::InvalidProfileIndex {
            value: position.to_string(),
        })
}

/// Scripted replies keyed by command, written as `CMD=chunk|chunk;CMD2=...`.
///
/// `\r` and `\n` escapes are expanded inside chunks. An empty chunk list
/// makes the fake stay silent for that command; unscripted commands get the
/// adapter's `?` reply.
#[derive(Debug, Clone, Default, Eq, PartialEq)]
pub struct ResponseScript {
    replies: HashMap<String, Vec<Vec<u8>>>,
}

impl ResponseScript {
    /// Adds or replaces the reply to `command`.
    #[must_use]
    pub fn with_reply<I, C>(mut self, command: &str, chunks: I) -> Self
    where
        I: IntoIterator<Item = C>,
        C: AsRef<[u8]>,
    {
        self.replies.insert(
            script_key(command),
            chunks
                .into_iter()
                .map(|chunk| chunk.as_ref().to_vec())
                .collect(),
        );
        self
    }

    fn reply(&self, command: &str) -> Vec<Vec<u8>> {
        self.replies
            .get(&script_key(command))
            .cloned()
            .unwrap_or_else(|| vec![UNKNOWN_COMMAND_REPLY.to_vec()])
    }
}

impl FromStr for ResponseScript {
    type Err = FixtureError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let mut script = Self::default();
        for record in value.split(';').filter(|record| !record.trim().is_empty()) {
            let Some((command, chunks)) = record.split_once('=') else {
                return Err(FixtureError::InvalidResponseRecord {
                    record: record.to_string(),
                });
            };
            if command.trim().is_empty() {
                return Err(FixtureError::InvalidResponseRecord {
                    record: record.to_string(),
                });
            }

            let chunks: Vec<String> = if chunks.is_empty() {
                Vec::new()
            } else {
                chunks.split('|').map(unescape).collect()
            };
            script = script.with_reply(command, chunks);
        }
        Ok(script)
    }
}

fn script_key(command: &str) -> String {
    command
        .trim_end_matches(['\r', '\n'])
        .trim()
        .to_ascii_uppercase()
}

fn unescape(chunk: &str) -> String {
    chunk.replace("\\r", "\r").replace("\\n", "\n")
}

/// Adapter operations that can be scripted to fail.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash, Display, IntoStaticStr)]
#[strum(serialize_all = "snake_case")]
pub enum FakeOperation {
    Start,
    Scan,
    Connect,
    Disconnect,
    RetrieveServices,
    Write,
    Subscribe,
    Unsubscribe,
}

/// One recorded adapter call.
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum FakeCall {
    Scan { duration: Duration },
    StopScan,
    Connect { id: String },
    Disconnect { id: String },
    RetrieveServices { id: String },
    Write { id: String, payload: Vec<u8>, with_response: bool },
    Subscribe { id: String, characteristic_id: String },
    Unsubscribe { id: String, characteristic_id: String },
}

/// Settings for a fake adapter.
#[derive(Debug, Builder)]
pub struct FakeAdapterConfig {
    #[builder(default)]
    peripherals: Vec<FakePeripheral>,
    #[builder(default)]
    responses: ResponseScript,
    #[builder(default = true)]
    powered_on: bool,
    #[builder(default = true)]
    permissions_granted: bool,
    /// Ends scans after this long instead of the requested duration.
    scan_stop_after: Option<Duration>,
    #[builder(default)]
    discovery_delay: Duration,
    #[builder(default)]
    response_delay: Duration,
    #[builder(default)]
    failing_operations: Vec<FakeOperation>,
}

#[derive(Debug)]
struct FakeState {
    config: FakeAdapterConfig,
    powered_on: Mutex<bool>,
    events: Mutex<Option<mpsc::UnboundedSender<AdapterEvent>>>,
    calls: Mutex<Vec<FakeCall>>,
    connected: Mutex<Vec<String>>,
    subscriptions: Mutex<Vec<Subscription>>,
    scan_timer: Mutex<Option<CancellationToken>>,
}

#[derive(Debug, Clone)]
struct Subscription {
    id: String,
    service_id: String,
    characteristic_id: String,
}

impl FakeState {
    fn emit(&self, event: AdapterEvent) {
        if let Some(events) = lock(&self.events).as_ref() {
            if events.send(event).is_err() {
                trace!("fake adapter event receiver dropped");
            }
        }
    }

    fn record(&self, call: FakeCall) {
        lock(&self.calls).push(call);
    }

    fn check(&self, operation: FakeOperation) -> Result<(), AdapterError> {
        if self.config.failing_operations.contains(&operation) {
            debug!(%operation, "fake adapter refusing operation");
            return Err(AdapterError::Refused {
                operation: operation.into(),
            });
        }
        Ok(())
    }

    fn ensure_connected(&self, id: &str) -> Result<(), AdapterError> {
        if lock(&self.connected).iter().any(|connected| connected == id) {
            Ok(())
        } else {
            Err(AdapterError::UnknownPeripheral { id: id.to_string() })
        }
    }

    fn peripheral(&self, id: &str) -> Result<&FakePeripheral, AdapterError> {
        self.config
            .peripherals
            .iter()
            .find(|peripheral| peripheral.id == id)
            .ok_or_else(|| AdapterError::UnknownPeripheral { id: id.to_string() })
    }

    fn notification_target(&self, id: &str) -> Option<Subscription> {
        lock(&self.subscriptions)
            .iter()
            .find(|subscription| subscription.id == id)
            .cloned()
    }

    fn deliver(&self, id: &str, chunk: Vec<u8>) {
        let Some(target) = self.notification_target(id) else {
            debug!(id, "no notification subscription; dropping fake chunk");
            return;
        };
        self.emit(AdapterEvent::CharacteristicValueUpdated {
            id: target.id,
            service_id: target.service_id,
            characteristic_id: target.characteristic_id,
            value: chunk,
        });
    }

    fn emit_discoveries(&self) {
        for peripheral in &self.config.peripherals {
            self.emit(AdapterEvent::PeripheralDiscovered {
                id: peripheral.id.clone(),
                name: peripheral.name.clone(),
                rssi: peripheral.rssi,
            });
        }
    }

    fn drop_link(&self, id: &str) -> bool {
        let mut connected = lock(&self.connected);
        let before = connected.len();
        connected.retain(|candidate| candidate != id);
        lock(&self.subscriptions).retain(|subscription| subscription.id != id);
        connected.len() != before
    }
}

/// Fixture-driven [`BleAdapter`] used in tests and non-hardware runs.
#[derive(Debug, Clone)]
pub struct FakeAdapter {
    state: Arc<FakeState>,
}

impl FakeAdapter {
    #[must_use]
    pub fn new(config: FakeAdapterConfig) -> Self {
        info!(peripherals = config.peripherals.len(), "using fake BLE adapter");
        let powered_on = config.powered_on;
        Self {
            state: Arc::new(FakeState {
                config,
                powered_on: Mutex::new(powered_on),
                events: Mutex::new(None),
                calls: Mutex::new(Vec::new()),
                connected: Mutex::new(Vec::new()),
                subscriptions: Mutex::new(Vec::new()),
                scan_timer: Mutex::new(None),
            }),
        }
    }

    /// Returns a handle for injecting events and inspecting recorded calls.
    #[must_use]
    pub fn handle(&self) -> FakeAdapterHandle {
        FakeAdapterHandle {
            state: Arc::clone(&self.state),
        }
    }

    fn write_scripted(
        &self,
        id: &str,
        payload: &[u8],
        with_response: bool,
    ) -> Result<(), AdapterError> {
        self.state.record(FakeCall::Write {
            id: id.to_string(),
            payload: payload.to_vec(),
            with_response,
        });
        self.state.check(FakeOperation::Write)?;
        self.state.ensure_connected(id)?;

        let command = String::from_utf8_lossy(payload);
        let chunks = self.state.config.responses.reply(&command);
        debug!(command = %command.trim_end(), chunks = chunks.len(), "fake adapter replying");

        let delay = self.state.config.response_delay;
        if delay.is_zero() {
            for chunk in chunks {
                self.state.deliver(id, chunk);
            }
        } else {
            let state = Arc::clone(&self.state);
            let id = id.to_string();
            tokio::spawn(async move {
                sleep(delay).await;
                for chunk in chunks {
                    state.deliver(&id, chunk);
                }
            });
        }
        Ok(())
    }
}

#[async_trait]
impl BleAdapter for FakeAdapter {
    async fn start(&self) -> Result<AdapterEventStream, AdapterError> {
        self.state.check(FakeOperation::Start)?;
        let (sender, receiver) = mpsc::unbounded_channel();
        {
            let mut events = lock(&self.state.events);
            if events.is_some() {
                return Err(AdapterError::EventsAlreadyTaken);
            }
            *events = Some(sender);
        }
        Ok(Box::pin(UnboundedReceiverStream::new(receiver)))
    }

    async fn check_adapter_state(&self) -> Result<AdapterPowerState, AdapterError> {
        if *lock(&self.state.powered_on) {
            Ok(AdapterPowerState::PoweredOn)
        } else {
            Ok(AdapterPowerState::PoweredOff)
        }
    }

    async fn permissions_granted(&self) -> Result<bool, AdapterError> {
        Ok(self.state.config.permissions_granted)
    }

    #[instrument(skip(self), level = "debug", fields(?duration))]
    async fn scan(
        &self,
        _service_filters: &[String],
        duration: Duration,
        _allow_duplicates: bool,
    ) -> Result<(), AdapterError> {
        self.state.record(FakeCall::Scan { duration });
        self.state.check(FakeOperation::Scan)?;

        let cancel = CancellationToken::new();
        if let Some(previous) = lock(&self.state.scan_timer).replace(cancel.clone()) {
            previous.cancel();
        }

        let discovery_delay = self.state.config.discovery_delay;
        if discovery_delay.is_zero() {
            self.state.emit_discoveries();
        }

        let stop_after = self.state.config.scan_stop_after.unwrap_or(duration);
        let state = Arc::clone(&self.state);
        tokio::spawn(async move {
            if !discovery_delay.is_zero() {
                tokio::select! {
                    () = cancel.cancelled() => return,
                    () = sleep(discovery_delay) => state.emit_discoveries(),
                }
            }
            tokio::select! {
                () = cancel.cancelled() => {}
                () = sleep(stop_after.saturating_sub(discovery_delay)) => {
                    lock(&state.scan_timer).take();
                    state.emit(AdapterEvent::ScanStopped);
                }
            }
        });

        Ok(())
    }

    async fn stop_scan(&self) -> Result<(), AdapterError> {
        self.state.record(FakeCall::StopScan);
        if let Some(timer) = lock(&self.state.scan_timer).take() {
            timer.cancel();
            self.state.emit(AdapterEvent::ScanStopped);
        }
        Ok(())
    }

    async fn connect(&self, id: &str) -> Result<(), AdapterError> {
        self.state.record(FakeCall::Connect { id: id.to_string() });
        self.state.check(FakeOperation::Connect)?;
        self.state.peripheral(id)?;

        let mut connected = lock(&self.state.connected);
        if !connected.iter().any(|candidate| candidate == id) {
            connected.push(id.to_string());
        }
        Ok(())
    }

    async fn disconnect(&self, id: &str) -> Result<(), AdapterError> {
        self.state.record(FakeCall::Disconnect { id: id.to_string() });
        self.state.check(FakeOperation::Disconnect)?;
        if self.state.drop_link(id) {
            self.state.emit(AdapterEvent::PeripheralDisconnected {
                id: id.to_string(),
                reason: None,
            });
        }
        Ok(())
    }

    async fn retrieve_services(&self, id: &str) -> Result<Vec<ServiceInfo>, AdapterError> {
        self.state
            .record(FakeCall::RetrieveServices { id: id.to_string() });
        self.state.check(FakeOperation::RetrieveServices)?;
        self.state.ensure_connected(id)?;
        Ok(self.state.peripheral(id)?.services.clone())
    }

    async fn write(
        &self,
        id: &str,
        _service_id: &str,
        _characteristic_id: &str,
        payload: &[u8],
    ) -> Result<(), AdapterError> {
        self.write_scripted(id, payload, true)
    }

    async fn write_without_response(
        &self,
        id: &str,
        _service_id: &str,
        _characteristic_id: &str,
        payload: &[u8],
    ) -> Result<(), AdapterError> {
        self.write_scripted(id, payload, false)
    }

    async fn subscribe_notifications(
        &self,
        id: &str,
        service_id: &str,
        characteristic_id: &str,
    ) -> Result<(), AdapterError> {
        self.state.record(FakeCall::Subscribe {
            id: id.to_string(),
            characteristic_id: characteristic_id.to_string(),
        });
        self.state.check(FakeOperation::Subscribe)?;
        self.state.ensure_connected(id)?;

        lock(&self.state.subscriptions).push(Subscription {
            id: id.to_string(),
            service_id: service_id.to_string(),
            characteristic_id: characteristic_id.to_string(),
        });
        Ok(())
    }

    async fn unsubscribe_notifications(
        &self,
        id: &str,
        _service_id: &str,
        characteristic_id: &str,
    ) -> Result<(), AdapterError> {
        self.state.record(FakeCall::Unsubscribe {
            id: id.to_string(),
            characteristic_id: characteristic_id.to_string(),
        });
        self.state.check(FakeOperation::Unsubscribe)?;

        lock(&self.state.subscriptions).retain(|subscription| {
            subscription.id != id || subscription.characteristic_id != characteristic_id
        });
        Ok(())
    }
}

/// Test-side view of a [`FakeAdapter`].
#[derive(Debug, Clone)]
pub struct FakeAdapterHandle {
    state: Arc<FakeState>,
}

impl FakeAdapterHandle {
    /// Injects an arbitrary adapter event.
    pub fn emit(&self, event: AdapterEvent) {
        self.state.emit(event);
    }

    /// Delivers `chunk` on the notify characteristic subscribed for `id`.
    pub fn notify(&self, id: &str, chunk: impl AsRef<[u8]>) {
        self.state.deliver(id, chunk.as_ref().to_vec());
    }

    /// Drops the link as if the peripheral went out of range.
    pub fn drop_connection(&self, id: &str) {
        self.state.drop_link(id);
        self.state.emit(AdapterEvent::PeripheralDisconnected {
            id: id.to_string(),
            reason: Some("link lost".to_string()),
        });
    }

    /// Changes the adapter power state and reports it.
    pub fn set_powered(&self, powered_on: bool) {
        *lock(&self.state.powered_on) = powered_on;
        if !powered_on {
            lock(&self.state.connected).clear();
            lock(&self.state.subscriptions).clear();
        }
        self.state
            .emit(AdapterEvent::AdapterStateChanged { powered_on });
    }

    #[must_use]
    pub fn calls(&self) -> Vec<FakeCall> {
        lock(&self.state.calls).clone()
    }

    /// Commands written so far, terminators included.
    #[must_use]
    pub fn writes(&self) -> Vec<String> {
        lock(&self.state.calls)
            .iter()
            .filter_map(|call| match call {
                FakeCall::Write { payload, .. } => {
                    Some(String::from_utf8_lossy(payload).into_owned())
                }
                _ => None,
            })
            .collect()
    }

    #[must_use]
    pub fn is_connected(&self, id: &str) -> bool {
        lock(&self.state.connected)
            .iter()
            .any(|candidate| candidate == id)
    }
}
