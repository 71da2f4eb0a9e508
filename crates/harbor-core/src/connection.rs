use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Canonical gateway connection state as seen by the shell.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    Degraded,
}

impl ConnectionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Degraded => "degraded",
        }
    }

    pub fn is_usable(&self) -> bool {
        matches!(self, ConnectionState::Connected | ConnectionState::Degraded)
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ConnectionState {
    type Err = String;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        let normalized = input.trim().to_lowercase();
        match normalized.as_str() {
            "disconnected" => Ok(ConnectionState::Disconnected),
            "connecting" => Ok(ConnectionState::Connecting),
            "connected" => Ok(ConnectionState::Connected),
            "degraded" => Ok(ConnectionState::Degraded),
            other => Err(format!("Unknown connection state: {other}")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_case_insensitively_and_rejects_unknown() {
        assert_eq!(
            "Connected".parse::<ConnectionState>(),
            Ok(ConnectionState::Connected)
        );
        assert_eq!(
            " degraded ".parse::<ConnectionState>(),
            Ok(ConnectionState::Degraded)
        );
        assert!("online".parse::<ConnectionState>().is_err());
    }

    #[test]
    fn serializes_lowercase() {
        let raw = serde_json::to_string(&ConnectionState::Connecting).expect("encode");
        assert_eq!(raw, "\"connecting\"");
    }
}
