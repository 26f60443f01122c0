use std::fmt::{self, Display, Formatter};

use crate::cli::monitor::{MonitorSample, MonitorSummary};

use super::painter::Painter;
use super::response_view::OutcomeView;
use super::table::Table;

/// Renders a single monitor poll line.
pub(crate) struct MonitorSampleView<'a> {
    sample: &'a MonitorSample,
    painter: &'a Painter,
}

impl<'a> MonitorSampleView<'a> {
    pub(crate) fn new(sample: &'a MonitorSample, painter: &'a Painter) -> Self {
        Self { sample, painter }
    }
}

impl Display for MonitorSampleView<'_> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {}",
            self.painter.muted(format!("#{:<4}", self.sample.index())),
            OutcomeView::new(self.sample.outcome(), self.painter)
        )
    }
}

/// Renders the end-of-run monitor summary.
pub(crate) struct MonitorSummaryView<'a> {
    summary: &'a MonitorSummary,
    painter: &'a Painter,
}

impl<'a> MonitorSummaryView<'a> {
    pub(crate) fn new(summary: &'a MonitorSummary, painter: &'a Painter) -> Self {
        Self { summary, painter }
    }
}

impl Display for MonitorSummaryView<'_> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let failed = self.summary.failed().to_string();
        let table = Table::key_value(
            self.painter,
            vec![
                ("samples", self.painter.value(self.summary.samples().to_string())),
                ("succeeded", self.painter.positive(self.summary.succeeded().to_string())),
                (
                    "failed",
                    if self.summary.failed() > 0 {
                        self.painter.failure(&failed)
                    } else {
                        self.painter.value(&failed)
                    },
                ),
                ("stop_reason", self.painter.value(self.summary.stop_reason().to_string())),
            ],
        );
        write!(f, "{}", self.painter.heading("Monitor summary:"))?;
        write!(f, "\n{table}")
    }
}
