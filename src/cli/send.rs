use std::io;
use std::time::Duration;

use anyhow::Result;
use clap::{Args, ValueEnum};
use serde::Serialize;
use tracing::{debug, instrument};

use crate::codec::ResponseShape;
use crate::error::{CliRunError, ElmError, ErrorKind};
use crate::session::{CommandOptions, Session};
use crate::terminal::TerminalClient;
use crate::utils::{format_escaped, format_hex};

use super::OutputFormat;
use super::command::parse_duration;
use super::target::{self, TargetArgs};
use super::ui::{CommandReportView, ConnectionView, Painter, Spinner};

/// Response projection selectable from the command line.
#[derive(Debug, Clone, Copy, Default, Eq, PartialEq, ValueEnum)]
pub enum ShapeArg {
    /// Trimmed text.
    #[default]
    Text,
    /// Raw bytes.
    Bytes,
    /// Raw bytes and the notification fragments that carried them.
    Chunked,
}

impl From<ShapeArg> for ResponseShape {
    fn from(shape: ShapeArg) -> Self {
        match shape {
            ShapeArg::Text => Self::Text,
            ShapeArg::Bytes => Self::Bytes,
            ShapeArg::Chunked => Self::ChunkedBytes,
        }
    }
}

/// Arguments for the `send` command.
#[derive(Debug, Args)]
pub struct SendArgs {
    #[command(flatten)]
    target: TargetArgs,
    /// Commands to send in order, e.g. `ATZ 010C`.
    #[arg(required = true)]
    commands: Vec<String>,
    /// How each response is returned.
    #[arg(long, value_enum, default_value_t)]
    shape: ShapeArg,
    /// Per-command response timeout (e.g. `2s`).
    #[arg(long, value_parser = parse_duration)]
    timeout: Option<Duration>,
}

impl SendArgs {
    /// Creates send arguments for `commands` against `target`.
    #[must_use]
    pub fn new(target: TargetArgs, commands: Vec<String>) -> Self {
        Self {
            target,
            commands,
            shape: ShapeArg::default(),
            timeout: None,
        }
    }

    #[must_use]
    pub fn with_shape(mut self, shape: ShapeArg) -> Self {
        self.shape = shape;
        self
    }

    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// Result of one command as printed by `send` and `monitor`.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub(crate) enum CommandOutcome {
    Text { text: String },
    Bytes { hex: String, ascii: String },
    Chunked { hex: String, chunks: Vec<String> },
    Failed { kind: ErrorKind, message: String },
}

impl CommandOutcome {
    pub(crate) fn failed(error: &ElmError) -> Self {
        Self::Failed {
            kind: error.kind(),
            message: error.to_string(),
        }
    }

    pub(crate) fn is_failure(&self) -> bool {
        matches!(self, Self::Failed { .. })
    }
}

#[derive(Debug, Clone, Serialize)]
pub(crate) struct CommandReport {
    command: String,
    shape: ResponseShape,
    #[serde(flatten)]
    outcome: CommandOutcome,
}

impl CommandReport {
    pub(crate) fn command(&self) -> &str {
        &self.command
    }

    pub(crate) fn outcome(&self) -> &CommandOutcome {
        &self.outcome
    }
}

/// Sends one command and projects the response for printing.
pub(crate) async fn exchange(
    session: &Session,
    command: &str,
    shape: ShapeArg,
    options: CommandOptions,
) -> Result<CommandOutcome, ElmError> {
    let outcome = match shape {
        ShapeArg::Text => CommandOutcome::Text {
            text: session.send_command(command, options)?.await?,
        },
        ShapeArg::Bytes => {
            let bytes = session.send_command_bytes(command, options)?.await?;
            CommandOutcome::Bytes {
                hex: format_hex(&bytes),
                ascii: format_escaped(&bytes),
            }
        }
        ShapeArg::Chunked => {
            let response = session.send_command_chunked(command, options)?.await?;
            CommandOutcome::Chunked {
                hex: format_hex(response.data()),
                chunks: response.chunks().iter().map(|chunk| format_hex(chunk)).collect(),
            }
        }
    };
    Ok(outcome)
}

pub(crate) fn command_options(timeout: Option<Duration>) -> CommandOptions {
    match timeout {
        Some(timeout) => CommandOptions::default().with_timeout(timeout),
        None => CommandOptions::default(),
    }
}

/// Executes the `send` command.
#[instrument(skip_all, level = "info", fields(commands = args.commands.len(), shape = ?args.shape))]
pub(crate) async fn run<W>(
    session: &Session,
    args: &SendArgs,
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

    let options = command_options(args.timeout);
    let mut failed = 0;
    for command in &args.commands {
        let outcome = match exchange(session, command, args.shape, options).await {
            Ok(outcome) => outcome,
            Err(error) => {
                debug!(%command, %error, "command failed");
                CommandOutcome::failed(&error)
            }
        };
        if outcome.is_failure() {
            failed += 1;
        }

        let report = CommandReport {
            command: command.clone(),
            shape: args.shape.into(),
            outcome,
        };
        if pretty {
            writeln!(out, "{}", CommandReportView::new(&report, &painter))?;
        } else {
            serde_json::to_writer(&mut *out, &report)?;
            writeln!(out)?;
        }
    }

    session.disconnect().await?;

    if failed > 0 {
        return Err(CliRunError::CommandsFailed {
            failed,
            total: args.commands.len(),
        }
        .into());
    }
    Ok(())
}
