use crate::theme::ThemeMode;
use serde::{Deserialize, Serialize};

pub const DEFAULT_LOCAL_GATEWAY_URL: &str = "ws://127.0.0.1:18789";
pub const DEFAULT_HISTORY_LIMIT: u32 = 200;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionMode {
    #[default]
    Local,
    Remote,
}

/// Flat snapshot of user-configurable options.
///
/// Every field is a primitive so the persisted record stays a plain
/// name → value map. Holders treat their copy as immutable; the settings
/// service publishes a fresh snapshot after each save.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase", default)]
pub struct Settings {
    pub connection_mode: ConnectionMode,
    pub remote_url: String,
    pub session_key: String,
    pub history_limit: u32,
    pub theme_mode: ThemeMode,
    pub close_to_tray: bool,
    pub debug: bool,
    pub gateway_path: String,
    pub log_dir: String,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            connection_mode: ConnectionMode::Local,
            remote_url: String::new(),
            session_key: "main".to_string(),
            history_limit: DEFAULT_HISTORY_LIMIT,
            theme_mode: ThemeMode::System,
            close_to_tray: true,
            debug: false,
            gateway_path: String::new(),
            log_dir: String::new(),
        }
    }
}

impl Settings {
    pub fn gateway_url(&self) -> String {
        match self.connection_mode {
            ConnectionMode::Remote if !self.remote_url.trim().is_empty() => {
                self.remote_url.trim().to_string()
            }
            _ => DEFAULT_LOCAL_GATEWAY_URL.to_string(),
        }
    }
}

/// A monitor work area in virtual-desktop coordinates.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct ScreenRect {
    pub left: i32,
    pub top: i32,
    pub width: u32,
    pub height: u32,
}

impl ScreenRect {
    fn right(&self) -> i64 {
        i64::from(self.left) + i64::from(self.width)
    }

    fn bottom(&self) -> i64 {
        i64::from(self.top) + i64::from(self.height)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct WindowGeometry {
    pub left: i32,
    pub top: i32,
    pub width: u32,
    pub height: u32,
    #[serde(default)]
    pub is_maximized: bool,
}

impl WindowGeometry {
    fn as_rect(&self) -> ScreenRect {
        ScreenRect {
            left: self.left,
            top: self.top,
            width: self.width,
            height: self.height,
        }
    }

    /// Returns the geometry when it overlaps at least one screen.
    ///
    /// A position fully outside every screen is dropped, never clamped.
    pub fn restorable(&self, screens: &[ScreenRect]) -> Option<WindowGeometry> {
        if self.width == 0 || self.height == 0 {
            return None;
        }
        let rect = self.as_rect();
        let visible = screens.iter().any(|screen| {
            i64::from(rect.left) < screen.right()
                && rect.right() > i64::from(screen.left)
                && i64::from(rect.top) < screen.bottom()
                && rect.bottom() > i64::from(screen.top)
        });
        visible.then_some(*self)
    }
}
