use std::time::Duration;

use bon::Builder;
use clap::{Parser, Subcommand, ValueEnum};
use tracing::level_filters::LevelFilter;

use crate::adapter::{FakeAdapterConfig, ResponseScript, ScanFixture};
use crate::cli::monitor::MonitorArgs;
use crate::cli::scan::ScanArgs;
use crate::cli::send::SendArgs;
use crate::error::{CliConfigError, FixtureError};

/// Command-line options for the ELM327 BLE tool.
#[derive(Debug, Parser)]
#[command(
    name = "elmble",
    about = "Talk to ELM327 OBD-II adapters over Bluetooth LE."
)]
pub struct Args {
    /// Log verbosity; overrides `RUST_LOG`.
    #[arg(long, global = true, value_enum)]
    log_level: Option<LogLevel>,
    /// Output format; defaults to `pretty` on a terminal and `json` otherwise.
    #[arg(long, global = true, value_enum)]
    output: Option<OutputFormat>,
    /// Uses the fake BLE backend with fixture-driven devices and responses.
    #[arg(long, global = true)]
    fake: bool,
    /// Fake scan fixtures in the form `device_id|name|rssi[|profile];...`.
    #[arg(long, global = true, requires = "fake", required_if_eq("fake", "true"))]
    fake_scan: Option<ScanFixture>,
    /// Fake command replies in the form `COMMAND=chunk|chunk;...`.
    #[arg(long, global = true, requires = "fake")]
    fake_responses: Option<ResponseScript>,
    /// Catalog position (1-based) given to fake devices without a profile.
    #[arg(long, global = true, requires = "fake")]
    fake_profile: Option<usize>,
    /// Artificial delay before fake devices are discovered (e.g. `250ms`).
    #[arg(long, global = true, requires = "fake", value_parser = parse_duration)]
    fake_discovery_delay: Option<Duration>,
    /// Artificial delay before each fake response is delivered.
    #[arg(long, global = true, requires = "fake", value_parser = parse_duration)]
    fake_response_delay: Option<Duration>,
    #[command(subcommand)]
    command: Command,
}

impl Args {
    /// Creates argument values directly without CLI parsing.
    ///
    /// ```
    /// use elmble::{Args, Command, ScanArgs};
    ///
    /// let scan = Args::new(Command::Scan(ScanArgs::default()));
    /// let _ = scan;
    /// ```
    #[must_use]
    pub fn new(command: Command) -> Self {
        Self {
            log_level: None,
            output: None,
            fake: false,
            fake_scan: None,
            fake_responses: None,
            fake_profile: None,
            fake_discovery_delay: None,
            fake_response_delay: None,
            command,
        }
    }

    /// Enables fake backend mode with pre-parsed fake configuration.
    #[must_use]
    pub fn with_fake(mut self, fake: FakeArgs) -> Self {
        let FakeArgs {
            scan_fixture,
            responses,
            profile,
            discovery_delay,
            response_delay,
        } = fake;

        self.fake = true;
        self.fake_scan = Some(scan_fixture);
        self.fake_responses = responses;
        self.fake_profile = profile;
        self.fake_discovery_delay = Some(discovery_delay);
        self.fake_response_delay = Some(response_delay);
        self
    }

    #[must_use]
    pub fn log_level(&self) -> Option<LogLevel> {
        self.log_level
    }

    #[must_use]
    pub fn output_format(&self) -> Option<OutputFormat> {
        self.output
    }

    /// Splits parsed CLI arguments into command and optional fake-client settings.
    ///
    /// # Errors
    ///
    /// Returns an error if CLI backend configuration is invalid.
    pub fn into_command_and_fake_args(self) -> anyhow::Result<(Command, Option<FakeArgs>)> {
        let Args {
            fake,
            fake_scan,
            fake_responses,
            fake_profile,
            fake_discovery_delay,
            fake_response_delay,
            command,
            ..
        } = self;

        let fake_args = if fake {
            let Some(scan_fixture) = fake_scan else {
                return Err(CliConfigError::MissingFakeScanFixture.into());
            };
            Some(FakeArgs {
                scan_fixture,
                responses: fake_responses,
                profile: fake_profile,
                discovery_delay: fake_discovery_delay.unwrap_or(Duration::ZERO),
                response_delay: fake_response_delay.unwrap_or(Duration::ZERO),
            })
        } else {
            None
        };

        Ok((command, fake_args))
    }
}

/// Fake backend arguments for programmatic runs.
#[derive(Debug, Builder)]
pub struct FakeArgs {
    #[builder(with = |value: &str| -> std::result::Result<_, FixtureError> { value.parse() })]
    scan_fixture: ScanFixture,
    #[builder(with = |value: &str| -> std::result::Result<_, FixtureError> { value.parse() })]
    responses: Option<ResponseScript>,
    profile: Option<usize>,
    #[builder(default)]
    discovery_delay: Duration,
    #[builder(default)]
    response_delay: Duration,
}

impl FakeArgs {
    pub(crate) fn into_adapter_config(self) -> Result<FakeAdapterConfig, FixtureError> {
        let Self {
            scan_fixture,
            responses,
            profile,
            discovery_delay,
            response_delay,
        } = self;

        let scan_fixture = match profile {
            Some(position) => scan_fixture.with_default_profile(position)?,
            None => scan_fixture,
        };

        Ok(FakeAdapterConfig::builder()
            .peripherals(scan_fixture.into())
            .responses(responses.unwrap_or_default())
            .discovery_delay(discovery_delay)
            .response_delay(response_delay)
            .build())
    }
}

/// Supported CLI commands.
#[derive(Debug, Subcommand)]
pub enum Command {
    /// Scan for nearby BLE devices and flag the ones that look like ELM327 adapters.
    Scan(ScanArgs),
    /// Connect to an adapter, send commands one at a time and print the responses.
    Send(SendArgs),
    /// Connect, enable streaming and poll a command until stopped.
    Monitor(MonitorArgs),
}

/// How command results are written to stdout.
#[derive(Debug, Clone, Copy, Eq, PartialEq, ValueEnum)]
pub enum OutputFormat {
    /// Coloured tables for people.
    Pretty,
    /// One JSON document per result.
    Json,
}

/// Log verbosity accepted by `--log-level`.
#[derive(Debug, Clone, Copy, Eq, PartialEq, ValueEnum)]
pub enum LogLevel {
    Off,
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl LogLevel {
    pub(crate) fn as_level_filter(self) -> LevelFilter {
        match self {
            Self::Off => LevelFilter::OFF,
            Self::Error => LevelFilter::ERROR,
            Self::Warn => LevelFilter::WARN,
            Self::Info => LevelFilter::INFO,
            Self::Debug => LevelFilter::DEBUG,
            Self::Trace => LevelFilter::TRACE,
        }
    }
}

pub(crate) fn parse_duration(value: &str) -> Result<Duration, String> {
    humantime::parse_duration(value).map_err(|error| error.to_string())
}
