use std::string::FromUtf8Error;
use std::time::Duration;

use serde::Serialize;
use strum_macros::Display;
use thiserror::Error;

use crate::store::ConnectionState;

/// Errors surfaced by session operations.
#[derive(Debug, Error)]
pub enum ElmError {
    #[error("the Bluetooth adapter is powered off")]
    AdapterOff,
    #[error("Bluetooth permissions have not been granted")]
    PermissionMissing,
    #[error("cannot start a scan while the session is {state}")]
    ScanRejected { state: ConnectionState },
    #[error("BLE scan failed")]
    Scan {
        #[source]
        source: AdapterError,
    },
    #[error("cannot connect to `{device_id}` while the session is {state}")]
    ConnectRejected {
        device_id: String,
        state: ConnectionState,
    },
    #[error("already connected to `{connected}`; disconnect before connecting to `{requested}`")]
    ConnectedToOtherDevice { connected: String, requested: String },
    #[error("failed to connect to `{device_id}`")]
    Connection {
        device_id: String,
        #[source]
        source: AdapterError,
    },
    #[error("device `{device_id}` exposes no known ELM327 profile (services: {services})")]
    IncompatibleDevice { device_id: String, services: String },
    #[error("no device is connected")]
    NotConnected,
    #[error("failed to write command `{command}`")]
    Write {
        command: String,
        #[source]
        source: AdapterError,
    },
    #[error(
        "command `{command}` timed out after {elapsed}",
        elapsed = humantime::format_duration(*timeout)
    )]
    CommandTimeout { command: String, timeout: Duration },
    #[error("command `{requested}` rejected: `{pending}` is still awaiting a response")]
    CommandInProgress { requested: String, pending: String },
    #[error("device disconnected while `{command}` was awaiting a response")]
    DisconnectedDuringCommand { command: String },
    #[error("response to `{command}` is not valid text")]
    ResponseDecode {
        command: String,
        #[source]
        source: FromUtf8Error,
    },
    #[error(
        "streaming stopped: no successful command for {elapsed}",
        elapsed = humantime::format_duration(*idle)
    )]
    StreamingInactivity { idle: Duration },
    #[error("failed to disconnect from `{device_id}`")]
    Disconnection {
        device_id: String,
        #[source]
        source: AdapterError,
    },
    #[error("the session has been closed")]
    SessionClosed,
}

impl ElmError {
    /// Returns the stable kind used when recording this error on the
    /// aggregate state.
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::AdapterOff => ErrorKind::AdapterOff,
            Self::PermissionMissing => ErrorKind::PermissionMissing,
            Self::ScanRejected { .. } | Self::Scan { .. } => ErrorKind::Scan,
            Self::ConnectRejected { .. }
            | Self::ConnectedToOtherDevice { .. }
            | Self::Connection { .. } => ErrorKind::Connection,
            Self::IncompatibleDevice { .. } => ErrorKind::IncompatibleDevice,
            Self::NotConnected => ErrorKind::NotConnected,
            Self::Write { .. } => ErrorKind::Write,
            Self::CommandTimeout { .. } => ErrorKind::CommandTimeout,
            Self::CommandInProgress { .. } => ErrorKind::CommandInProgress,
            Self::DisconnectedDuringCommand { .. } => ErrorKind::DisconnectedDuringCommand,
            Self::ResponseDecode { .. } => ErrorKind::ResponseDecode,
            Self::StreamingInactivity { .. } => ErrorKind::StreamingInactivity,
            Self::Disconnection { .. } => ErrorKind::Disconnection,
            Self::SessionClosed => ErrorKind::SessionClosed,
        }
    }
}

/// Serializable discriminant of [`ElmError`].
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash, Display, Serialize)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ErrorKind {
    AdapterOff,
    PermissionMissing,
    Scan,
    Connection,
    IncompatibleDevice,
    NotConnected,
    Write,
    CommandTimeout,
    CommandInProgress,
    DisconnectedDuringCommand,
    ResponseDecode,
    StreamingInactivity,
    Disconnection,
    SessionClosed,
}

/// The operation family an error was raised by. Starting an operation clears
/// only errors of its own class.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash, Display, Serialize)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ErrorClass {
    Scan,
    Connect,
    Command,
    Streaming,
    Disconnect,
}

/// Errors reported by a BLE adapter backend.
#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("BLE operation failed")]
    Ble(#[from] btleplug::Error),
    #[error("no BLE adapters were found")]
    NoAdapters,
    #[error("the adapter event stream has already been taken")]
    EventsAlreadyTaken,
    #[error("peripheral `{id}` is not known to the adapter")]
    UnknownPeripheral { id: String },
    #[error("characteristic `{characteristic}` of service `{service}` was not found")]
    MissingCharacteristic {
        service: String,
        characteristic: String,
    },
    #[error("`{value}` is not a valid service UUID")]
    InvalidUuid {
        value: String,
        #[source]
        source: uuid::Error,
    },
    #[error("fake adapter refused `{operation}`")]
    Refused { operation: &'static str },
}

/// Errors returned when parsing fake adapter fixtures.
#[derive(Debug, Error)]
pub enum FixtureError {
    #[error("the fake scan fixture is empty")]
    EmptyFixture,
    #[error("scan records must contain three or four pipe-delimited fields")]
    InvalidRecordFieldCount,
    #[error("scan records cannot contain empty mandatory fields")]
    EmptyRecordField,
    #[error("failed to parse RSSI value")]
    InvalidRssi(#[from] std::num::ParseIntError),
    #[error("`{value}` is not a profile position in the built-in catalog")]
    InvalidProfileIndex { value: String },
    #[error("response records must look like `COMMAND=chunk|chunk`, got `{record}`")]
    InvalidResponseRecord { record: String },
}

/// Errors returned when validating runtime backend options.
#[derive(Debug, Error)]
pub(crate) enum CliConfigError {
    #[error("missing fake scan fixture while fake mode is enabled")]
    MissingFakeScanFixture,
}

/// Errors returned by CLI commands after the session has done its part.
#[derive(Debug, Error)]
pub(crate) enum CliRunError {
    #[error("no likely ELM327 adapter found among {seen} discovered devices")]
    NoCompatibleDevice { seen: usize },
    #[error("device `{device_id}` was not seen during the scan")]
    DeviceNotFound { device_id: String },
    #[error("{failed} of {total} commands failed")]
    CommandsFailed { failed: usize, total: usize },
}

/// Errors returned by telemetry initialisation.
#[derive(Debug, Error)]
pub(crate) enum TelemetryError {
    #[error("failed to install tracing subscriber")]
    Subscriber(#[from] tracing_subscriber::util::TryInitError),
}
