use crate::focus::WindowEvent;
use crate::gateway::{GatewayError, GatewayEvent};
use crate::native::DialogChoice;
use harbor_core::bridge::DroppedFile;
use harbor_core::{ResolvedTheme, Settings, ThemeMode};
use tokio::sync::mpsc;

/// Everything the coordinator reacts to.
///
/// Transports, timers, native callbacks and background I/O all post here;
/// the coordinator drains the queue one event at a time.
#[derive(Debug)]
pub enum HostEvent {
    SurfaceAttached {
        surface_id: u64,
        outbound: mpsc::Sender<String>,
    },
    SurfaceFrame {
        surface_id: u64,
        raw: String,
    },
    SurfaceDetached {
        surface_id: u64,
    },
    Gateway(GatewayEvent),
    Window(WindowEvent),
    OsThemeChanged(ResolvedTheme),
    SetThemeMode(ThemeMode),
    ApplySettings(Settings),
    Navigate(String),
    Focus(String),
    FilesDropped(Vec<DroppedFile>),
    ApprovalDecided {
        request_id: String,
        choice: DialogChoice,
    },
    ApprovalDeadline {
        request_id: String,
    },
    NotificationActivated {
        tag: Option<String>,
    },
    ResolutionDispatched {
        request_id: String,
        result: Result<(), GatewayError>,
    },
    Shutdown,
}
