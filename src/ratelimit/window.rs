//! Time windows used by the sliding-window gate.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::PolicyError;

/// A fixed time span with its own request ceiling.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum Window {
    /// Per-second rate limiting
    Second,
    /// Per-minute rate limiting
    Minute,
    /// Per-hour rate limiting
    Hour,
    /// Per-day rate limiting
    Day,
    /// Arbitrary span in whole seconds
    Seconds(u64),
}

impl Window {
    /// Get the duration of this time window.
    pub fn duration(&self) -> Duration {
        Duration::from_secs(self.as_secs())
    }

    pub fn as_secs(&self) -> u64 {
        match self {
            Window::Second => 1,
            Window::Minute => 60,
            Window::Hour => 3600,
            Window::Day => 86400,
            Window::Seconds(secs) => *secs,
        }
    }

    pub fn as_millis(&self) -> u64 {
        self.as_secs().saturating_mul(1000)
    }

    /// Name reported in response headers and events.
    pub fn name(&self) -> String {
        match self {
            Window::Second => "second".to_string(),
            Window::Minute => "minute".to_string(),
            Window::Hour => "hour".to_string(),
            Window::Day => "day".to_string(),
            Window::Seconds(secs) => format!("{}s", secs),
        }
    }
}

impl fmt::Display for Window {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name())
    }
}

impl FromStr for Window {
    type Err = PolicyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "second" => Ok(Window::Second),
            "minute" => Ok(Window::Minute),
            "hour" => Ok(Window::Hour),
            "day" => Ok(Window::Day),
            other => {
                let secs = other
                    .strip_suffix('s')
                    .and_then(|n| n.parse::<u64>().ok())
                    .ok_or_else(|| PolicyError::InvalidWindow(s.to_string()))?;
                // Normalise so `60s` and `minute` share counters.
                Ok(match secs {
                    1 => Window::Second,
                    60 => Window::Minute,
                    3600 => Window::Hour,
                    86400 => Window::Day,
                    n => Window::Seconds(n),
                })
            }
        }
    }
}

impl TryFrom<String> for Window {
    type Error = PolicyError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Window> for String {
    fn from(window: Window) -> Self {
        window.name()
    }
}

/// A `(window, max_requests)` pair; every pair in a policy must hold at once.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WindowLimit {
    pub window: Window,
    pub max_requests: u64,
}

impl WindowLimit {
    pub fn new(window: Window, max_requests: u64) -> Self {
        Self {
            window,
            max_requests,
        }
    }
}
