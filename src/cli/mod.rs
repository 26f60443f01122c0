pub(crate) mod command;
pub(crate) mod monitor;
pub(crate) mod scan;
pub(crate) mod send;
pub(crate) mod target;
pub(crate) mod ui;

pub use self::command::{Args, Command, FakeArgs, LogLevel, OutputFormat};
pub use self::monitor::MonitorArgs;
pub use self::scan::ScanArgs;
pub use self::send::{SendArgs, ShapeArg};
pub use self::target::TargetArgs;
