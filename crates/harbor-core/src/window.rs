use serde::{Deserialize, Serialize};

/// Observed native window state. Written only by the focus tracker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowFocusState {
    pub visible: bool,
    pub minimized: bool,
    pub focused: bool,
}

impl Default for WindowFocusState {
    fn default() -> Self {
        Self {
            visible: true,
            minimized: false,
            focused: false,
        }
    }
}

impl WindowFocusState {
    /// True when the user is looking at the window right now.
    pub fn is_attended(&self) -> bool {
        self.visible && !self.minimized && self.focused
    }

    pub fn kind(&self) -> WindowStateKind {
        if self.minimized || !self.visible {
            WindowStateKind::Minimized
        } else if self.focused {
            WindowStateKind::Focused
        } else {
            WindowStateKind::Blurred
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum WindowStateKind {
    Focused,
    Blurred,
    Minimized,
}
