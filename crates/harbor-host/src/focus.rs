use harbor_core::{WindowFocusState, WindowStateKind};
use tracing::debug;

/// Native window lifecycle signals.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WindowEvent {
    Focused,
    Blurred,
    Minimized,
    Restored,
    Shown,
    Hidden,
}

/// Folds window events into [`WindowFocusState`] and reports when the
/// derived focused/blurred/minimized label moves.
#[derive(Debug, Clone)]
pub struct FocusTracker {
    state: WindowFocusState,
    last_kind: WindowStateKind,
}

impl Default for FocusTracker {
    fn default() -> Self {
        Self::new(WindowFocusState::default())
    }
}

impl FocusTracker {
    pub fn new(initial: WindowFocusState) -> Self {
        Self {
            state: initial,
            last_kind: initial.kind(),
        }
    }

    pub fn state(&self) -> WindowFocusState {
        self.state
    }

    /// True when an alert should go through the OS instead of the window.
    pub fn should_alert(&self) -> bool {
        !self.state.is_attended()
    }

    pub fn observe(&mut self, event: WindowEvent) -> Option<WindowStateKind> {
        let state = &mut self.state;
        match event {
            WindowEvent::Focused => {
                state.focused = true;
                state.visible = true;
                state.minimized = false;
            }
            WindowEvent::Blurred => state.focused = false,
            WindowEvent::Minimized => {
                state.minimized = true;
                state.focused = false;
            }
            WindowEvent::Restored => {
                state.minimized = false;
                state.visible = true;
            }
            WindowEvent::Shown => state.visible = true,
            WindowEvent::Hidden => {
                state.visible = false;
                state.focused = false;
            }
        }

        let kind = self.state.kind();
        debug!(event = "window_event", window_event = ?event, kind = ?kind);
        if kind == self.last_kind {
            return None;
        }
        self.last_kind = kind;
        Some(kind)
    }
}
