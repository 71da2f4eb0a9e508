pub mod approval;
pub mod bridge;
pub mod connection;
pub mod settings;
pub mod theme;
pub mod window;

pub use approval::{
    ApprovalDetails, ApprovalKind, ApprovalRequest, ApprovalStateError, Decision,
    DevicePairDetails, ExecDetails, Resolution, ResolutionCause, RiskLevel, APPROVAL_WINDOW_SECS,
};
pub use bridge::{DecodeError, EncodeError, Envelope, HostMessage, SurfaceMessage, SurfaceMessageKind};
pub use connection::ConnectionState;
pub use settings::{ConnectionMode, ScreenRect, Settings, WindowGeometry};
pub use theme::{ResolvedTheme, ThemeMode, ThemeSetting};
pub use window::{WindowFocusState, WindowStateKind};
