use std::io;
use std::sync::Arc;

use anyhow::Result;
use tracing::{instrument, warn};

use crate::adapter::{BleAdapter, BtleplugAdapter, FakeAdapter};
use crate::cli::{Command, FakeArgs, LogLevel, OutputFormat};
use crate::error::{AdapterError, FixtureError};
use crate::session::{Session, SessionConfig};
use crate::telemetry;
use crate::terminal::{SystemTerminalClient, TerminalClient};

/// Creates an adapter backed by the first Bluetooth LE adapter on the host.
///
/// # Errors
///
/// Returns an error if the Bluetooth stack cannot be reached or no adapter
/// is present.
pub async fn real_adapter() -> Result<Arc<dyn BleAdapter>, AdapterError> {
    Ok(Arc::new(BtleplugAdapter::new().await?))
}

/// Creates an adapter backed by fake fixtures.
///
/// # Errors
///
/// Returns an error if the fixture names a profile outside the built-in
/// catalog.
pub fn fake_adapter(fake_args: FakeArgs) -> Result<Arc<dyn BleAdapter>, FixtureError> {
    Ok(Arc::new(FakeAdapter::new(fake_args.into_adapter_config()?)))
}

/// Runs the CLI command against `adapter`.
///
/// ```
/// # async fn run() -> anyhow::Result<()> {
/// use clap::Parser;
///
/// let args = elmble::Args::try_parse_from([
///     "elmble",
///     "--fake",
///     "--fake-scan",
///     "AA:BB:CC|OBDII|-43",
///     "scan",
///     "--duration",
///     "1s",
/// ])?;
/// let (command, maybe_fake_args) = args.into_command_and_fake_args()?;
/// let adapter = match maybe_fake_args {
///     Some(fake_args) => elmble::fake_adapter(fake_args)?,
///     None => elmble::real_adapter().await?,
/// };
/// let mut out = Vec::new();
/// elmble::run(command, &mut out, adapter, elmble::OutputFormat::Json).await?;
/// # Ok(())
/// # }
/// ```
///
/// # Errors
///
/// Returns an error if tracing initialisation fails, BLE interaction fails, or
/// output writing fails.
pub async fn run<W>(
    command: Command,
    out: &mut W,
    adapter: Arc<dyn BleAdapter>,
    output_format: OutputFormat,
) -> Result<()>
where
    W: io::Write,
{
    run_with_log_level(command, out, adapter, None, output_format).await
}

/// Runs the CLI command with an explicit telemetry log-level override.
///
/// # Errors
///
/// Returns an error if tracing initialisation fails, BLE interaction fails, or
/// output writing fails.
pub async fn run_with_log_level<W>(
    command: Command,
    out: &mut W,
    adapter: Arc<dyn BleAdapter>,
    log_level: Option<LogLevel>,
    output_format: OutputFormat,
) -> Result<()>
where
    W: io::Write,
{
    run_with_clients_and_log_level(
        command,
        out,
        &SystemTerminalClient,
        adapter,
        log_level,
        output_format,
    )
    .await
}

/// Runs the CLI command with injected clients and explicit telemetry settings.
///
/// ```
/// # async fn run() -> anyhow::Result<()> {
/// use clap::Parser;
///
/// struct FakeTerminal;
/// impl elmble::TerminalClient for FakeTerminal {
///     fn stdout_is_terminal(&self) -> bool { false }
///     fn stderr_is_terminal(&self) -> bool { false }
/// }
///
/// let args = elmble::Args::try_parse_from([
///     "elmble",
///     "--log-level",
///     "trace",
///     "--fake",
///     "--fake-scan",
///     "AA:BB:CC|OBDII|-43|1",
///     "--fake-responses",
///     "ATZ=ELM327 v1.5\\r\\r>",
///     "send",
///     "--device",
///     "AA:BB:CC",
///     "ATZ",
/// ])?;
/// let log_level = args.log_level();
/// let (command, maybe_fake_args) = args.into_command_and_fake_args()?;
/// let adapter = match maybe_fake_args {
///     Some(fake_args) => elmble::fake_adapter(fake_args)?,
///     None => elmble::real_adapter().await?,
/// };
/// let mut out = Vec::new();
/// elmble::run_with_clients_and_log_level(
///     command,
///     &mut out,
///     &FakeTerminal,
///     adapter,
///     log_level,
///     elmble::OutputFormat::Pretty,
/// ).await?;
/// # Ok(())
/// # }
/// ```
///
/// # Errors
///
/// Returns an error if tracing initialisation fails, BLE interaction fails, or
/// output writing fails.
#[instrument(
    skip(out, terminal_client, adapter),
    level = "info",
    fields(command = %command_name(&command), ?log_level)
)]
pub async fn run_with_clients_and_log_level<W>(
    command: Command,
    out: &mut W,
    terminal_client: &dyn TerminalClient,
    adapter: Arc<dyn BleAdapter>,
    log_level: Option<LogLevel>,
    output_format: OutputFormat,
) -> Result<()>
where
    W: io::Write,
{
    telemetry::initialise_tracing(
        "elmble",
        terminal_client.stderr_is_terminal(),
        log_level.map(LogLevel::as_level_filter),
    )?;

    let session = Session::open(adapter, SessionConfig::default()).await?;
    let result = match &command {
        Command::Scan(args) => {
            crate::cli::scan::run(&session, args, out, terminal_client, output_format).await
        }
        Command::Send(args) => {
            crate::cli::send::run(&session, args, out, terminal_client, output_format).await
        }
        Command::Monitor(args) => {
            crate::cli::monitor::run(&session, args, out, terminal_client, output_format).await
        }
    };
    if let Err(error) = &result {
        warn!(error = %error, "command failed; closing session");
    }
    session.close().await;

    result
}

fn command_name(command: &Command) -> &'static str {
    match command {
        Command::Scan(_args) => "scan",
        Command::Send(_args) => "send",
        Command::Monitor(_args) => "monitor",
    }
}
