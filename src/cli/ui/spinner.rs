use std::borrow::Cow;
use std::future::Future;
use std::time::Duration;

use indicatif::{ProgressBar, ProgressStyle};

/// Indefinite stderr spinner shown while the CLI waits on the adapter.
#[derive(Debug)]
pub(crate) struct Spinner {
    enabled: bool,
}

impl Spinner {
    pub(crate) fn new(enabled: bool) -> Self {
        Self { enabled }
    }

    /// Awaits `operation`, ticking a spinner labelled `message` meanwhile.
    pub(crate) async fn run<T>(
        &self,
        message: impl Into<Cow<'static, str>>,
        operation: impl Future<Output = T>,
    ) -> T {
        let Some(bar) = self.start(message) else {
            return operation.await;
        };

        let result = operation.await;
        bar.finish_and_clear();
        result
    }

    fn start(&self, message: impl Into<Cow<'static, str>>) -> Option<ProgressBar> {
        if !self.enabled {
            return None;
        }

        let bar = ProgressBar::new_spinner().with_style(style());
        bar.set_message(message);
        bar.enable_steady_tick(Duration::from_millis(100));
        Some(bar)
    }
}

fn style() -> ProgressStyle {
    ProgressStyle::with_template("{spinner:.cyan.bold} {msg} {elapsed:.dim}")
        .unwrap_or_else(|_| ProgressStyle::default_spinner())
        .tick_chars("◐◓◑◒ ")
}
