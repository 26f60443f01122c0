mod adapter;
mod app;
mod cli;
mod codec;
mod correlator;
mod error;
mod profile;
mod session;
mod store;
mod telemetry;
mod terminal;
mod utils;
mod watchdog;

pub use adapter::{
    AdapterEvent, AdapterEventStream, AdapterPowerState, BleAdapter, BtleplugAdapter,
    CharacteristicInfo, FakeAdapter, FakeAdapterConfig, FakeAdapterHandle, FakeCall,
    FakeOperation, FakePeripheral, ResponseScript, ScanFixture, ServiceInfo,
};
pub use app::{
    fake_adapter, real_adapter, run, run_with_clients_and_log_level, run_with_log_level,
};
pub use cli::{
    Args, Command, FakeArgs, LogLevel, MonitorArgs, OutputFormat, ScanArgs, SendArgs, ShapeArg,
    TargetArgs,
};
pub use codec::{
    COMMAND_TERMINATOR, ChunkedResponse, RESPONSE_TERMINATOR, ResponseShape, decode_text,
    encode_command,
};
pub use error::{AdapterError, ElmError, ErrorClass, ErrorKind, FixtureError};
pub use profile::{ActiveProfile, DeviceProfile, ProfileCatalog, WriteMode};
pub use session::{
    CommandOptions, DEFAULT_COMMAND_TIMEOUT, ResponseFuture, Session, SessionConfig,
};
pub use store::{
    AggregateState, ConnectionState, DEFAULT_COMPATIBLE_KEYWORDS, DiscoveredDevice, LastError,
    StateEvent, reduce,
};
pub use terminal::TerminalClient;
pub use watchdog::{
    DEFAULT_CHECK_INTERVAL, DEFAULT_INACTIVITY_THRESHOLD, StreamingState, StreamingStopReason,
    StreamingWatchdog, WatchdogVerdict,
};
