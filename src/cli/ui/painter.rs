use owo_colors::{OwoColorize, Style};

use crate::utils::format_rssi;

/// RSSI at or above which a link is drawn as strong.
const STRONG_SIGNAL_DBM: i16 = -65;
/// RSSI below which a link is drawn as poor.
const POOR_SIGNAL_DBM: i16 = -85;

/// Styles terminal output; a no-op when colour is disabled.
#[derive(Debug)]
pub(crate) struct Painter {
    use_colour: bool,
}

impl Painter {
    pub(crate) fn new(use_colour: bool) -> Self {
        Self { use_colour }
    }

    pub(crate) fn heading(&self, text: impl AsRef<str>) -> String {
        self.paint(text.as_ref(), Style::new().bold().cyan())
    }

    /// Adapter replies and other good news.
    pub(crate) fn positive(&self, text: impl AsRef<str>) -> String {
        self.paint(text.as_ref(), Style::new().green())
    }

    pub(crate) fn attention(&self, text: impl AsRef<str>) -> String {
        self.paint(text.as_ref(), Style::new().bold().yellow())
    }

    pub(crate) fn failure(&self, text: impl AsRef<str>) -> String {
        self.paint(text.as_ref(), Style::new().bold().red())
    }

    pub(crate) fn muted(&self, text: impl AsRef<str>) -> String {
        self.paint(text.as_ref(), Style::new().dimmed())
    }

    pub(crate) fn value(&self, text: impl AsRef<str>) -> String {
        self.paint(text.as_ref(), Style::new().bold())
    }

    /// Renders an RSSI reading coloured by link quality.
    pub(crate) fn signal(&self, rssi: Option<i16>) -> String {
        let text = format_rssi(rssi);
        match rssi {
            None => self.muted(text),
            Some(value) if value >= STRONG_SIGNAL_DBM => self.positive(text),
            Some(value) if value < POOR_SIGNAL_DBM => self.failure(text),
            Some(_) => self.attention(text),
        }
    }

    fn paint(&self, text: &str, style: Style) -> String {
        if !self.use_colour {
            return text.to_string();
        }
        text.style(style).to_string()
    }
}
