//! Process-wide backend selection

use std::{fmt, str::FromStr};

use crate::error::ConfigError;

/// Which browser backend owns every solve in this process.
///
/// Read once from `DRIVER` at startup and never changed afterwards.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BackendChoice {
    /// Blocking W3C WebDriver client, one worker thread per solve
    #[default]
    WebDriver,
    /// Chrome DevTools Protocol on a dedicated single-threaded event loop
    Cdp,
}

impl BackendChoice {
    pub fn as_str(&self) -> &'static str {
        match self {
            BackendChoice::WebDriver => "webdriver",
            BackendChoice::Cdp => "cdp",
        }
    }
}

impl FromStr for BackendChoice {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "webdriver" => Ok(BackendChoice::WebDriver),
            "cdp" => Ok(BackendChoice::Cdp),
            _ => Err(ConfigError::UnknownBackend(s.to_string())),
        }
    }
}

impl fmt::Display for BackendChoice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
