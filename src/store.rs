use std::collections::BTreeMap;

use serde::Serialize;
use strum_macros::Display;
use tokio::time::Instant;
use tracing::{debug, info};

use crate::error::{ElmError, ErrorClass, ErrorKind};
use crate::profile::ActiveProfile;
use crate::watchdog::{StreamingState, StreamingStopReason};

/// Name fragments that mark a peripheral as a likely ELM327 adapter.
pub const DEFAULT_COMPATIBLE_KEYWORDS: [&str; 10] = [
    "obd", "elm", "vlink", "v-link", "vgate", "icar", "veepeak", "konnwei", "carista", "obdlink",
];

/// Session connection phase. Scanning, connecting and disconnecting are
/// mutually exclusive by construction.
#[derive(Debug, Clone, Copy, Default, Eq, PartialEq, Display, Serialize)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ConnectionState {
    #[default]
    Idle,
    Scanning,
    Connecting,
    Connected,
    Disconnecting,
}

/// A peripheral reported during the current scan.
#[derive(Debug, Clone, Eq, PartialEq, Serialize)]
pub struct DiscoveredDevice {
    id: String,
    name: Option<String>,
    rssi: Option<i16>,
    likely_compatible: bool,
}

impl DiscoveredDevice {
    /// Creates a record, classifying the name against `keywords`
    /// (case-insensitive substring match).
    ///
    /// ```
    /// let device = elmble::DiscoveredDevice::classify(
    ///     "AA:BB",
    ///     Some("OBD-II Adapter".into()),
    ///     Some(-60),
    ///     &elmble::DEFAULT_COMPATIBLE_KEYWORDS,
    /// );
    /// assert!(device.likely_compatible());
    /// ```
    #[must_use]
    pub fn classify(
        id: impl Into<String>,
        name: Option<String>,
        rssi: Option<i16>,
        keywords: &[impl AsRef<str>],
    ) -> Self {
        let likely_compatible = name.as_deref().is_some_and(|name| {
            let name = name.to_lowercase();
            keywords
                .iter()
                .any(|keyword| name.contains(&keyword.as_ref().to_lowercase()))
        });

        Self {
            id: id.into(),
            name,
            rssi,
            likely_compatible,
        }
    }

    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    #[must_use]
    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    #[must_use]
    pub fn rssi(&self) -> Option<i16> {
        self.rssi
    }

    #[must_use]
    pub fn likely_compatible(&self) -> bool {
        self.likely_compatible
    }
}

/// The most recent error, kept for passive observers.
#[derive(Debug, Clone, Eq, PartialEq, Serialize)]
pub struct LastError {
    class: ErrorClass,
    kind: ErrorKind,
    message: String,
}

impl LastError {
    /// Records `error` as raised by an operation of `class`.
    #[must_use]
    pub fn new(class: ErrorClass, error: &ElmError) -> Self {
        Self {
            class,
            kind: error.kind(),
            message: error.to_string(),
        }
    }

    #[must_use]
    pub fn class(&self) -> ErrorClass {
        self.class
    }

    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    #[must_use]
    pub fn message(&self) -> &str {
        &self.message
    }
}

/// Everything a presentation layer needs to render the session.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct AggregateState {
    connection: ConnectionState,
    is_initializing: bool,
    has_permissions: bool,
    is_bluetooth_on: bool,
    discovered_devices: BTreeMap<String, DiscoveredDevice>,
    target_device_id: Option<String>,
    connected_device_id: Option<String>,
    active_profile: Option<ActiveProfile>,
    pending_command: Option<String>,
    streaming: StreamingState,
    last_error: Option<LastError>,
}

impl AggregateState {
    #[must_use]
    pub fn connection(&self) -> ConnectionState {
        self.connection
    }

    #[must_use]
    pub fn is_initializing(&self) -> bool {
        self.is_initializing
    }

    #[must_use]
    pub fn has_permissions(&self) -> bool {
        self.has_permissions
    }

    #[must_use]
    pub fn is_bluetooth_on(&self) -> bool {
        self.is_bluetooth_on
    }

    /// Devices from the current or last scan, ordered by identifier.
    pub fn discovered_devices(&self) -> impl Iterator<Item = &DiscoveredDevice> {
        self.discovered_devices.values()
    }

    #[must_use]
    pub fn discovered_device(&self, id: &str) -> Option<&DiscoveredDevice> {
        self.discovered_devices.get(id)
    }

    /// Device a connection attempt is in flight for.
    #[must_use]
    pub fn target_device_id(&self) -> Option<&str> {
        self.target_device_id.as_deref()
    }

    #[must_use]
    pub fn connected_device_id(&self) -> Option<&str> {
        self.connected_device_id.as_deref()
    }

    #[must_use]
    pub fn active_profile(&self) -> Option<&ActiveProfile> {
        self.active_profile.as_ref()
    }

    #[must_use]
    pub fn is_awaiting_response(&self) -> bool {
        self.pending_command.is_some()
    }

    #[must_use]
    pub fn pending_command(&self) -> Option<&str> {
        self.pending_command.as_deref()
    }

    #[must_use]
    pub fn streaming(&self) -> StreamingState {
        self.streaming
    }

    #[must_use]
    pub fn is_streaming(&self) -> bool {
        self.streaming.is_active()
    }

    #[must_use]
    pub fn last_error(&self) -> Option<&LastError> {
        self.last_error.as_ref()
    }
}

/// Inputs to [`reduce`].
#[derive(Debug, Clone, PartialEq)]
pub enum StateEvent {
    InitializationStarted,
    InitializationFinished {
        bluetooth_on: bool,
        has_permissions: bool,
    },
    AdapterPowerChanged {
        powered_on: bool,
    },
    PermissionsChanged {
        granted: bool,
    },
    ScanStarted,
    DeviceDiscovered(DiscoveredDevice),
    ScanStopped,
    ConnectStarted {
        device_id: String,
    },
    ConnectSucceeded {
        device_id: String,
        profile: ActiveProfile,
    },
    ConnectFailed,
    DisconnectStarted,
    Disconnected,
    CommandStarted {
        command: String,
    },
    CommandSucceeded {
        at: Instant,
    },
    CommandFailed,
    StreamingStarted {
        at: Instant,
    },
    StreamingStopped {
        reason: StreamingStopReason,
    },
    ErrorRaised(LastError),
    ErrorsCleared(ErrorClass),
}

/// Applies one event to the state.
///
/// Events that do not apply in the current phase leave the state unchanged.
#[must_use]
pub fn reduce(mut state: AggregateState, event: StateEvent) -> AggregateState {
    match event {
        StateEvent::InitializationStarted => {
            state.is_initializing = true;
        }
        StateEvent::InitializationFinished {
            bluetooth_on,
            has_permissions,
        } => {
            state.is_initializing = false;
            state.is_bluetooth_on = bluetooth_on;
            state.has_permissions = has_permissions;
        }
        StateEvent::AdapterPowerChanged { powered_on } => {
            state.is_bluetooth_on = powered_on;
        }
        StateEvent::PermissionsChanged { granted } => {
            state.has_permissions = granted;
        }
        StateEvent::ScanStarted => {
            if state.connection != ConnectionState::Idle {
                return ignored(state, "scan_started");
            }
            state.connection = ConnectionState::Scanning;
            state.discovered_devices.clear();
        }
        StateEvent::DeviceDiscovered(device) => {
            if state.connection != ConnectionState::Scanning {
                return ignored(state, "device_discovered");
            }
            state
                .discovered_devices
                .insert(device.id().to_string(), device);
        }
        StateEvent::ScanStopped => {
            if state.connection != ConnectionState::Scanning {
                return ignored(state, "scan_stopped");
            }
            state.connection = ConnectionState::Idle;
        }
        StateEvent::ConnectStarted { device_id } => {
            if state.connection != ConnectionState::Idle {
                return ignored(state, "connect_started");
            }
            state.connection = ConnectionState::Connecting;
            state.target_device_id = Some(device_id);
        }
        StateEvent::ConnectSucceeded { device_id, profile } => {
            if state.connection != ConnectionState::Connecting
                || state.target_device_id.as_deref() != Some(device_id.as_str())
            {
                return ignored(state, "connect_succeeded");
            }
            state.connection = ConnectionState::Connected;
            state.target_device_id = None;
            state.connected_device_id = Some(device_id);
            state.active_profile = Some(profile);
            state.pending_command = None;
            state.streaming = StreamingState::Off;
        }
        StateEvent::ConnectFailed => {
            if state.connection != ConnectionState::Connecting {
                return ignored(state, "connect_failed");
            }
            state.connection = ConnectionState::Idle;
            state.target_device_id = None;
        }
        StateEvent::DisconnectStarted => {
            if state.connection != ConnectionState::Connected {
                return ignored(state, "disconnect_started");
            }
            state.connection = ConnectionState::Disconnecting;
        }
        StateEvent::Disconnected => {
            if !matches!(
                state.connection,
                ConnectionState::Connected | ConnectionState::Disconnecting
            ) {
                return ignored(state, "disconnected");
            }
            if state.streaming.is_active() {
                info!(
                    reason = %StreamingStopReason::DisconnectCleanup,
                    "streaming stopped"
                );
            }
            state.connection = ConnectionState::Idle;
            state.connected_device_id = None;
            state.active_profile = None;
            state.pending_command = None;
            state.streaming = StreamingState::Off;
        }
        StateEvent::CommandStarted { command } => {
            if state.connection != ConnectionState::Connected || state.pending_command.is_some() {
                return ignored(state, "command_started");
            }
            state.pending_command = Some(command);
        }
        StateEvent::CommandSucceeded { at } => {
            if state.pending_command.take().is_none() {
                return ignored(state, "command_succeeded");
            }
            if state.streaming.is_active() {
                state.streaming = StreamingState::Active {
                    last_success_at: at,
                };
            }
        }
        StateEvent::CommandFailed => {
            if state.pending_command.take().is_none() {
                return ignored(state, "command_failed");
            }
        }
        StateEvent::StreamingStarted { at } => {
            if state.connection != ConnectionState::Connected {
                return ignored(state, "streaming_started");
            }
            state.streaming = StreamingState::Active {
                last_success_at: at,
            };
            clear_errors(&mut state, ErrorClass::Streaming);
        }
        StateEvent::StreamingStopped { reason } => {
            if state.streaming.is_active() {
                info!(%reason, "streaming stopped");
            }
            state.streaming = StreamingState::Off;
            if reason == StreamingStopReason::User {
                clear_errors(&mut state, ErrorClass::Streaming);
            }
        }
        StateEvent::ErrorRaised(error) => {
            state.last_error = Some(error);
        }
        StateEvent::ErrorsCleared(class) => {
            clear_errors(&mut state, class);
        }
    }

    state
}

fn clear_errors(state: &mut AggregateState, class: ErrorClass) {
    if state
        .last_error
        .as_ref()
        .is_some_and(|error| error.class() == class)
    {
        state.last_error = None;
    }
}

fn ignored(state: AggregateState, event: &'static str) -> AggregateState {
    debug!(event, connection = %state.connection, "event does not apply; state unchanged");
    state
}
