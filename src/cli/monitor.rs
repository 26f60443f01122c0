use std::io;
use std::time::Duration;

use anyhow::Result;
use clap::Args;
use serde::Serialize;
use strum_macros::Display;
use tokio::time::{MissedTickBehavior, interval};
use tracing::{info, instrument};

use crate::session::Session;
use crate::store::{AggregateState, ConnectionState};
use crate::terminal::TerminalClient;

use super::OutputFormat;
use super::command::parse_duration;
use super::send::{CommandOutcome, ShapeArg, command_options, exchange};
use super::target::{self, TargetArgs};
use super::ui::{ConnectionView, MonitorSampleView, MonitorSummaryView, Painter, Spinner};

/// Arguments for the `monitor` command.
#[derive(Debug, Args)]
pub struct MonitorArgs {
    #[command(flatten)]
    target: TargetArgs,
    /// Command polled on every tick.
    #[arg(long, default_value = "010C")]
    command: String,
    /// Time between polls (e.g. `250ms`).
    #[arg(long, default_value = "250ms", value_parser = parse_duration)]
    interval: Duration,
    /// Stop after this many polls. If omitted, poll until the watchdog trips
    /// or Ctrl+C.
    #[arg(long)]
    count: Option<usize>,
    /// Per-command response timeout.
    #[arg(long, value_parser = parse_duration)]
    timeout: Option<Duration>,
}

impl MonitorArgs {
    /// Creates monitor arguments polling `command` against `target`.
    #[must_use]
    pub fn new(target: TargetArgs, command: impl Into<String>) -> Self {
        Self {
            target,
            command: command.into(),
            interval: Duration::from_millis(250),
            count: None,
            timeout: None,
        }
    }

    #[must_use]
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    #[must_use]
    pub fn with_count(mut self, count: usize) -> Self {
        self.count = Some(count);
        self
    }

    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// Why a monitor run ended.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Display, Serialize)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub(crate) enum MonitorStopReason {
    CountReached,
    /// The streaming watchdog stopped streaming.
    Inactivity,
    Disconnected,
    Interrupted,
}

#[derive(Debug, Clone, Serialize)]
pub(crate) struct MonitorSample {
    index: usize,
    command: String,
    #[serde(flatten)]
    outcome: CommandOutcome,
}

impl MonitorSample {
    pub(crate) fn index(&self) -> usize {
        self.index
    }

    pub(crate) fn outcome(&self) -> &CommandOutcome {
        &self.outcome
    }
}

#[derive(Debug, Clone, Serialize)]
pub(crate) struct MonitorSummary {
    samples: usize,
    succeeded: usize,
    failed: usize,
    stop_reason: MonitorStopReason,
}

impl MonitorSummary {
    pub(crate) fn samples(&self) -> usize {
        self.samples
    }

    pub(crate) fn succeeded(&self) -> usize {
        self.succeeded
    }

    pub(crate) fn failed(&self) -> usize {
        self.failed
    }

    pub(crate) fn stop_reason(&self) -> MonitorStopReason {
        self.stop_reason
    }
}

/// Executes the `monitor` command.
#[instrument(skip_all, level = "info", fields(command = %args.command, interval = ?args.interval))]
pub(crate) async fn run<W>(
    session: &Session,
    args: &MonitorArgs,
    out: &mut W,
    terminal_client: &dyn TerminalClient,
    output_format: OutputFormat,
) -> Result<()>
where
    W: io::Write,
{
    let pretty = output_format == OutputFormat::Pretty;
    let painter = Painter::new(terminal_client.stdout_is_terminal());
    let spinner = Spinner::new(pretty && terminal_client.stderr_is_terminal());

    let (device_id, profile) = target::connect(session, &args.target, &spinner).await?;
    if pretty {
        writeln!(out, "{}", ConnectionView::new(&device_id, &profile, &painter))?;
        writeln!(out)?;
    }

    session.set_streaming(true)?.await?;
    info!("monitoring started");

    let options = command_options(args.timeout);
    let mut ticker = interval(args.interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut state = session.watch_state();
    let interrupted = tokio::signal::ctrl_c();
    tokio::pin!(interrupted);

    let mut samples = 0;
    let mut failed = 0;
    let stop_reason = loop {
        if args.count.is_some_and(|count| samples >= count) {
            break MonitorStopReason::CountReached;
        }

        tokio::select! {
            biased;

            result = &mut interrupted => {
                result?;
                break MonitorStopReason::Interrupted;
            }
            changed = state.changed() => {
                changed?;
                if let Some(reason) = stopped(&state.borrow_and_update()) {
                    break reason;
                }
            }
            _ = ticker.tick() => {
                samples += 1;
                let outcome = match exchange(session, &args.command, ShapeArg::Text, options).await {
                    Ok(outcome) => outcome,
                    Err(error) => CommandOutcome::failed(&error),
                };
                if outcome.is_failure() {
                    failed += 1;
                }

                let sample = MonitorSample {
                    index: samples,
                    command: args.command.clone(),
                    outcome,
                };
                if pretty {
                    writeln!(out, "{}", MonitorSampleView::new(&sample, &painter))?;
                } else {
                    serde_json::to_writer(&mut *out, &sample)?;
                    writeln!(out)?;
                }
            }
        }
    };
    info!(%stop_reason, samples, failed, "monitoring stopped");

    if session.state().is_streaming() {
        session.set_streaming(false)?.await?;
    }
    session.disconnect().await?;

    let summary = MonitorSummary {
        samples,
        succeeded: samples - failed,
        failed,
        stop_reason,
    };
    if pretty {
        writeln!(out)?;
        writeln!(out, "{}", MonitorSummaryView::new(&summary, &painter))?;
    } else {
        serde_json::to_writer(&mut *out, &summary)?;
        writeln!(out)?;
    }

    Ok(())
}

fn stopped(state: &AggregateState) -> Option<MonitorStopReason> {
    if state.connection() != ConnectionState::Connected {
        Some(MonitorStopReason::Disconnected)
    } else if !state.is_streaming() {
        Some(MonitorStopReason::Inactivity)
    } else {
        None
    }
}
