//! Seams to the native shell: notifications, the decision dialog, tray and
//! titlebar indicators, and window chrome.
//!
//! The coordinator only talks to these traits. The headless implementations
//! at the bottom log what a desktop shell would render.

use crate::events::HostEvent;
use chrono::{DateTime, Utc};
use harbor_core::{
    ApprovalDetails, ApprovalKind, ApprovalRequest, ConnectionState, ResolvedTheme, RiskLevel,
    ScreenRect, WindowGeometry,
};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use url::Url;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    pub title: String,
    pub body: String,
    pub tag: Option<String>,
    pub urgent: bool,
}

pub trait Notifier: Send + Sync {
    fn notify(&mut self, notification: &Notification);
}

/// How the user (or the dialog itself) ended a prompt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DialogChoice {
    Approve { remember: bool },
    Reject,
    /// Dialog dismissed without a choice; treated as a rejection.
    Closed,
}

/// What the decision dialog renders for one request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecisionPrompt {
    pub request_id: String,
    pub kind: ApprovalKind,
    pub title: String,
    pub summary: String,
    pub details: ApprovalDetails,
    pub risk: Option<RiskLevel>,
    pub offers_remember: bool,
    pub default_choice: DialogChoice,
    pub deadline: DateTime<Utc>,
    pub topmost: bool,
}

impl DecisionPrompt {
    pub fn for_request(request: &ApprovalRequest) -> Self {
        let (title, risk) = match &request.details {
            ApprovalDetails::Exec(exec) => ("Allow command?".to_string(), Some(exec.risk_level)),
            ApprovalDetails::DevicePair(_) => ("Pair new device?".to_string(), None),
        };
        Self {
            request_id: request.request_id.clone(),
            kind: request.kind(),
            title,
            summary: request.details.summary(),
            details: request.details.clone(),
            risk,
            offers_remember: request.kind() == ApprovalKind::Exec,
            default_choice: DialogChoice::Reject,
            deadline: request.deadline,
            topmost: true,
        }
    }
}

/// One-shot answer channel handed to the dialog with each prompt.
#[derive(Debug)]
pub struct DecisionReply {
    request_id: String,
    events: mpsc::Sender<HostEvent>,
}

impl DecisionReply {
    pub fn new(request_id: impl Into<String>, events: mpsc::Sender<HostEvent>) -> Self {
        Self {
            request_id: request_id.into(),
            events,
        }
    }

    pub fn request_id(&self) -> &str {
        &self.request_id
    }

    pub fn approve(self, remember: bool) -> bool {
        self.post(DialogChoice::Approve { remember })
    }

    pub fn reject(self) -> bool {
        self.post(DialogChoice::Reject)
    }

    pub fn close(self) -> bool {
        self.post(DialogChoice::Closed)
    }

    fn post(self, choice: DialogChoice) -> bool {
        let event = HostEvent::ApprovalDecided {
            request_id: self.request_id,
            choice,
        };
        match self.events.try_send(event) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(event)) => {
                warn!(event = "decision_dropped", reason = "queue_full", detail = ?event);
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                debug!(event = "decision_dropped", reason = "closed");
                false
            }
        }
    }
}

pub trait DecisionSurface: Send + Sync {
    fn present(&mut self, prompt: DecisionPrompt, reply: DecisionReply);
    fn dismiss(&mut self, request_id: &str);
}

/// Tray icon, titlebar dot, or anything else that mirrors the link state.
pub trait ConnectionIndicator: Send + Sync {
    fn show_connection_state(&mut self, state: ConnectionState);
}

pub trait ShellChrome: Send + Sync {
    fn system_theme(&self) -> ResolvedTheme;
    fn repaint(&mut self, theme: ResolvedTheme);
    fn set_title(&mut self, title: &str);
    fn set_badge(&mut self, count: u32);
    fn bring_to_front(&mut self);
    fn open_external(&mut self, url: &Url);
    /// Work areas of the attached displays.
    fn screens(&self) -> Vec<ScreenRect>;
    fn place_window(&mut self, geometry: WindowGeometry);
    fn window_geometry(&self) -> Option<WindowGeometry>;
}

pub struct NativeServices {
    pub notifier: Box<dyn Notifier>,
    pub decisions: Box<dyn DecisionSurface>,
    pub chrome: Box<dyn ShellChrome>,
}

impl NativeServices {
    /// Headless services that log instead of rendering.
    pub fn headless(system_theme: ResolvedTheme) -> Self {
        Self {
            notifier: Box::new(LogNotifier),
            decisions: Box::new(LogDecisionSurface::default()),
            chrome: Box::new(LogChrome::new(system_theme)),
        }
    }
}

pub struct LogNotifier;

impl Notifier for LogNotifier {
    fn notify(&mut self, notification: &Notification) {
        info!(
            event = "notification",
            title = %notification.title,
            body = %notification.body,
            tag = ?notification.tag,
            urgent = notification.urgent
        );
    }
}

/// Logs prompts and leaves them open; the deadline resolves them.
#[derive(Default)]
pub struct LogDecisionSurface {
    open: Vec<DecisionReply>,
}

impl DecisionSurface for LogDecisionSurface {
    fn present(&mut self, prompt: DecisionPrompt, reply: DecisionReply) {
        info!(
            event = "decision_prompt",
            request_id = %prompt.request_id,
            kind = %prompt.kind,
            summary = %prompt.summary,
            risk = ?prompt.risk,
            deadline = %prompt.deadline
        );
        self.open.push(reply);
    }

    fn dismiss(&mut self, request_id: &str) {
        self.open.retain(|reply| reply.request_id() != request_id);
        debug!(event = "decision_dismissed", request_id = %request_id);
    }
}

pub struct LogIndicator {
    name: &'static str,
}

impl LogIndicator {
    pub fn new(name: &'static str) -> Self {
        Self { name }
    }
}

impl ConnectionIndicator for LogIndicator {
    fn show_connection_state(&mut self, state: ConnectionState) {
        info!(event = "indicator_update", indicator = self.name, state = %state);
    }
}

pub struct LogChrome {
    system_theme: ResolvedTheme,
    placed: Option<WindowGeometry>,
}

impl LogChrome {
    pub fn new(system_theme: ResolvedTheme) -> Self {
        Self {
            system_theme,
            placed: None,
        }
    }
}

impl ShellChrome for LogChrome {
    fn system_theme(&self) -> ResolvedTheme {
        self.system_theme
    }

    fn repaint(&mut self, theme: ResolvedTheme) {
        info!(event = "repaint", theme = %theme);
    }

    fn set_title(&mut self, title: &str) {
        debug!(event = "set_title", title = %title);
    }

    fn set_badge(&mut self, count: u32) {
        debug!(event = "set_badge", count);
    }

    fn bring_to_front(&mut self) {
        debug!(event = "bring_to_front");
    }

    fn open_external(&mut self, url: &Url) {
        info!(event = "open_external", url = %url);
    }

    // No displays without a window system, so nothing is ever restored.
    fn screens(&self) -> Vec<ScreenRect> {
        Vec::new()
    }

    fn place_window(&mut self, geometry: WindowGeometry) {
        debug!(event = "place_window", left = geometry.left, top = geometry.top);
        self.placed = Some(geometry);
    }

    fn window_geometry(&self) -> Option<WindowGeometry> {
        self.placed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use harbor_core::{DevicePairDetails, ExecDetails};

    #[test]
    fn exec_prompt_defaults_to_reject_and_offers_memory() {
        let request = ApprovalRequest::new(
            "r-1",
            ApprovalDetails::Exec(ExecDetails {
                command: "make deploy".to_string(),
                cwd: "/srv".to_string(),
                reason: String::new(),
                risk_level: RiskLevel::Critical,
            }),
            Utc::now(),
        );
        let prompt = DecisionPrompt::for_request(&request);
        assert_eq!(prompt.default_choice, DialogChoice::Reject);
        assert_eq!(prompt.risk, Some(RiskLevel::Critical));
        assert!(prompt.offers_remember);
        assert!(prompt.topmost);
        assert_eq!(prompt.deadline, request.deadline);
    }

    #[test]
    fn pairing_prompt_has_no_risk_or_memory() {
        let request = ApprovalRequest::new(
            "p-1",
            ApprovalDetails::DevicePair(DevicePairDetails {
                device_name: "Tablet".to_string(),
                platform: String::new(),
                ip: String::new(),
            }),
            Utc::now(),
        );
        let prompt = DecisionPrompt::for_request(&request);
        assert_eq!(prompt.risk, None);
        assert!(!prompt.offers_remember);
        assert_eq!(prompt.summary, "Pair device Tablet");
    }

    #[tokio::test]
    async fn reply_posts_a_single_decision() {
        let (tx, mut rx) = mpsc::channel(4);
        let reply = DecisionReply::new("r-2", tx);
        assert!(reply.approve(true));
        match rx.recv().await {
            Some(HostEvent::ApprovalDecided { request_id, choice }) => {
                assert_eq!(request_id, "r-2");
                assert_eq!(choice, DialogChoice::Approve { remember: true });
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }
}
