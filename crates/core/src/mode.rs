//! Operating modes.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// The runtime's operating mode.
///
/// `Normal` allows every registered tool; `Plan` restricts dispatch to tools
/// tagged read-only so the model can explore without side effects.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperatingMode {
    #[default]
    Normal,
    Plan,
}

impl OperatingMode {
    /// Whether a tool with the given read-only tag may run in this mode.
    pub fn permits(self, read_only: bool) -> bool {
        match self {
            OperatingMode::Normal => true,
            OperatingMode::Plan => read_only,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            OperatingMode::Normal => "normal",
            OperatingMode::Plan => "plan",
        }
    }
}

impl fmt::Display for OperatingMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OperatingMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "normal" => Ok(OperatingMode::Normal),
            "plan" => Ok(OperatingMode::Plan),
            other => Err(format!("unknown mode '{other}'")),
        }
    }
}
