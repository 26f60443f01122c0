use std::io;
use std::time::Duration;

use anyhow::Result;
use clap::Args;
use tracing::instrument;

use crate::session::Session;
use crate::store::DiscoveredDevice;
use crate::terminal::TerminalClient;

use super::OutputFormat;
use super::command::parse_duration;
use super::ui::{DeviceListView, Painter, Spinner};

/// Arguments for the `scan` command.
#[derive(Debug, Args)]
pub struct ScanArgs {
    /// How long to scan (e.g. `5s`).
    #[arg(long, default_value = "5s", value_parser = parse_duration)]
    duration: Duration,
    /// Only list devices whose name looks like an ELM327 adapter.
    #[arg(long)]
    compatible_only: bool,
}

impl ScanArgs {
    /// Creates scan arguments with an explicit duration.
    #[must_use]
    pub fn new(duration: Duration) -> Self {
        Self {
            duration,
            compatible_only: false,
        }
    }

    #[must_use]
    pub fn compatible_only(mut self) -> Self {
        self.compatible_only = true;
        self
    }
}

impl Default for ScanArgs {
    fn default() -> Self {
        Self::new(Duration::from_secs(5))
    }
}

/// Executes the `scan` command.
#[instrument(skip_all, level = "info", fields(duration = ?args.duration))]
pub(crate) async fn run<W>(
    session: &Session,
    args: &ScanArgs,
    out: &mut W,
    terminal_client: &dyn TerminalClient,
    output_format: OutputFormat,
) -> Result<()>
where
    W: io::Write,
{
    let spinner = Spinner::new(
        output_format == OutputFormat::Pretty && terminal_client.stderr_is_terminal(),
    );
    spinner
        .run("Scanning for BLE devices", session.scan(args.duration))
        .await?;

    let devices: Vec<DiscoveredDevice> = session
        .state()
        .discovered_devices()
        .filter(|device| !args.compatible_only || device.likely_compatible())
        .cloned()
        .collect();

    match output_format {
        OutputFormat::Pretty => {
            let painter = Painter::new(terminal_client.stdout_is_terminal());
            writeln!(out, "{}", DeviceListView::new(&devices, &painter))?;
        }
        OutputFormat::Json => {
            serde_json::to_writer_pretty(&mut *out, &devices)?;
            writeln!(out)?;
        }
    }

    Ok(())
}
