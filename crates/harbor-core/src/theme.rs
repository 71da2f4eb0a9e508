use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum ThemeMode {
    #[default]
    System,
    Light,
    Dark,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum ResolvedTheme {
    #[default]
    Light,
    Dark,
}

impl ThemeMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ThemeMode::System => "system",
            ThemeMode::Light => "light",
            ThemeMode::Dark => "dark",
        }
    }

    /// Resolves the mode against the current OS signal.
    pub fn resolve(&self, os_theme: ResolvedTheme) -> ResolvedTheme {
        match self {
            ThemeMode::System => os_theme,
            ThemeMode::Light => ResolvedTheme::Light,
            ThemeMode::Dark => ResolvedTheme::Dark,
        }
    }
}

impl From<ResolvedTheme> for ThemeMode {
    fn from(theme: ResolvedTheme) -> Self {
        match theme {
            ResolvedTheme::Light => ThemeMode::Light,
            ResolvedTheme::Dark => ThemeMode::Dark,
        }
    }
}

impl ResolvedTheme {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResolvedTheme::Light => "light",
            ResolvedTheme::Dark => "dark",
        }
    }
}

impl fmt::Display for ThemeMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl fmt::Display for ResolvedTheme {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ThemeMode {
    type Err = String;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        let normalized = input.trim().to_lowercase();
        match normalized.as_str() {
            "system" | "auto" => Ok(ThemeMode::System),
            "light" => Ok(ThemeMode::Light),
            "dark" => Ok(ThemeMode::Dark),
            other => Err(format!("Unknown theme mode: {other}")),
        }
    }
}

/// Theme mode plus the concrete theme it currently resolves to.
///
/// `resolved` is always `mode.resolve(os_theme)` for the last OS signal seen;
/// only `mode` is ever persisted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ThemeSetting {
    pub mode: ThemeMode,
    pub resolved: ResolvedTheme,
}

impl ThemeSetting {
    pub fn new(mode: ThemeMode, os_theme: ResolvedTheme) -> Self {
        Self {
            mode,
            resolved: mode.resolve(os_theme),
        }
    }
}
