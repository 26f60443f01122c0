use std::fmt::{self, Display, Formatter};

use crate::cli::send::{CommandOutcome, CommandReport};

use super::painter::Painter;

/// Renders one command and its response.
pub(crate) struct CommandReportView<'a> {
    report: &'a CommandReport,
    painter: &'a Painter,
}

impl<'a> CommandReportView<'a> {
    pub(crate) fn new(report: &'a CommandReport, painter: &'a Painter) -> Self {
        Self { report, painter }
    }
}

impl Display for CommandReportView<'_> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} ",
            self.painter.muted(">"),
            self.painter.value(self.report.command())
        )?;
        write!(f, "{}", OutcomeView::new(self.report.outcome(), self.painter))
    }
}

/// Renders a response body, or the failure in its place.
pub(crate) struct OutcomeView<'a> {
    outcome: &'a CommandOutcome,
    painter: &'a Painter,
}

impl<'a> OutcomeView<'a> {
    pub(crate) fn new(outcome: &'a CommandOutcome, painter: &'a Painter) -> Self {
        Self { outcome, painter }
    }
}

impl Display for OutcomeView<'_> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self.outcome {
            CommandOutcome::Text { text } if text.is_empty() => {
                write!(f, "{}", self.painter.muted("<empty>"))
            }
            CommandOutcome::Text { text } => write!(f, "{}", self.painter.positive(text)),
            CommandOutcome::Bytes { hex, ascii } => write!(
                f,
                "{} {}",
                self.painter.positive(hex),
                self.painter.muted(format!("({ascii})"))
            ),
            CommandOutcome::Chunked { hex, chunks } => {
                write!(f, "{}", self.painter.positive(hex))?;
                for (index, chunk) in chunks.iter().enumerate() {
                    write!(
                        f,
                        "\n    {} {chunk}",
                        self.painter.muted(format!("chunk {}:", index + 1))
                    )?;
                }
                Ok(())
            }
            CommandOutcome::Failed { kind, message } => write!(
                f,
                "{} {}",
                self.painter.failure(format!("{kind}:")),
                message
            ),
        }
    }
}
