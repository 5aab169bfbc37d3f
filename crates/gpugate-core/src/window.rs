//! Time-of-day availability windows

use chrono::{NaiveTime, Timelike};
use serde::{Deserialize, Serialize};

const MINUTES_PER_DAY: u32 = 24 * 60;

/// Time-of-day range during which a model may run.
///
/// In TOML a window is either the string `"always"` or a table
/// `{ start = 2, end = 6 }` of whole hours. The range is half-open
/// (`[start, end)`) and wraps across midnight when `end < start`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(try_from = "WindowRepr", into = "WindowRepr")]
pub enum AvailabilityWindow {
    /// No restriction
    #[default]
    Always,
    /// Hour range `[start, end)`
    Hours { start: u8, end: u8 },
}

impl AvailabilityWindow {
    /// Whether the window is open at `minute` (0..1440) of the day.
    pub fn contains_minute(&self, minute: u32) -> bool {
        let minute = minute % MINUTES_PER_DAY;
        match *self {
            AvailabilityWindow::Always => true,
            AvailabilityWindow::Hours { start, end } => {
                let start = u32::from(start) * 60;
                let end = u32::from(end) * 60;
                if start == end {
                    true
                } else if start < end {
                    minute >= start && minute < end
                } else {
                    // wraps past midnight, e.g. 22..6
                    minute >= start || minute < end
                }
            }
        }
    }

    /// Whether the window is open at the given wall-clock time.
    pub fn is_open_at(&self, time: NaiveTime) -> bool {
        self.contains_minute(time.hour() * 60 + time.minute())
    }

    /// Whether the window never closes.
    pub fn is_always(&self) -> bool {
        matches!(self, AvailabilityWindow::Always)
    }
}

impl std::fmt::Display for AvailabilityWindow {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AvailabilityWindow::Always => write!(f, "always"),
            AvailabilityWindow::Hours { start, end } => {
                write!(f, "{:02}:00-{:02}:00", start, end)
            }
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
enum WindowRepr {
    Keyword(String),
    Hours { start: u8, end: u8 },
}

impl TryFrom<WindowRepr> for AvailabilityWindow {
    type Error = String;

    fn try_from(repr: WindowRepr) -> Result<Self, Self::Error> {
        match repr {
            WindowRepr::Keyword(k) if k.eq_ignore_ascii_case("always") => {
                Ok(AvailabilityWindow::Always)
            }
            WindowRepr::Keyword(k) => Err(format!("unknown availability window '{}'", k)),
            WindowRepr::Hours { start, end } => Ok(AvailabilityWindow::Hours { start, end }),
        }
    }
}

impl From<AvailabilityWindow> for WindowRepr {
    fn from(window: AvailabilityWindow) -> Self {
        match window {
            AvailabilityWindow::Always => WindowRepr::Keyword("always".to_string()),
            AvailabilityWindow::Hours { start, end } => WindowRepr::Hours { start, end },
        }
    }
}
