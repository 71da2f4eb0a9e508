//! Human-in-the-loop approval workflow.
//!
//! Requests are queued in arrival order and shown one at a time. Each
//! request gets its own deadline timer from the moment it arrives, and a
//! [`ResolutionLatch`] that the timer and the user race for: whoever claims
//! it first decides the outcome, the other side becomes a no-op.

use crate::events::HostEvent;
use crate::native::{DecisionPrompt, DecisionReply, DialogChoice, NativeServices, Notification};
use chrono::Utc;
use harbor_core::{
    ApprovalKind, ApprovalRequest, ApprovalStateError, Resolution, ResolutionCause,
};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::AbortHandle;
use tracing::{debug, error, info};

/// Where a request came from, and therefore where its answer goes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApprovalOrigin {
    Gateway,
    Surface { correlation_id: Option<String> },
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ApprovalError {
    #[error("approval request id is empty")]
    EmptyId,
    #[error("approval {0} is already pending")]
    Duplicate(String),
}

/// Single-use claim on the right to resolve one request.
#[derive(Debug, Clone, Default)]
pub struct ResolutionLatch(Arc<AtomicBool>);

impl ResolutionLatch {
    /// True for exactly one caller.
    pub fn claim(&self) -> bool {
        self.0
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub fn is_claimed(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resolved {
    pub resolution: Resolution,
    pub origin: ApprovalOrigin,
}

struct Pending {
    request: ApprovalRequest,
    origin: ApprovalOrigin,
    latch: ResolutionLatch,
    timer: AbortHandle,
}

pub struct ApprovalWorkflow {
    pending: HashMap<String, Pending>,
    queue: VecDeque<String>,
    showing: Option<String>,
    events: mpsc::Sender<HostEvent>,
}

impl ApprovalWorkflow {
    pub fn new(events: mpsc::Sender<HostEvent>) -> Self {
        Self {
            pending: HashMap::new(),
            queue: VecDeque::new(),
            showing: None,
            events,
        }
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Request currently on screen.
    pub fn showing(&self) -> Option<&str> {
        self.showing.as_deref()
    }

    pub fn latch(&self, request_id: &str) -> Option<ResolutionLatch> {
        self.pending.get(request_id).map(|entry| entry.latch.clone())
    }

    /// Accepts a new request, starts its deadline, and shows it if nothing
    /// else is on screen. `alert` raises an OS notification first.
    pub fn admit(
        &mut self,
        request: ApprovalRequest,
        origin: ApprovalOrigin,
        alert: bool,
        natives: &mut NativeServices,
    ) -> Result<(), ApprovalError> {
        let request_id = request.request_id.clone();
        if request_id.trim().is_empty() {
            return Err(ApprovalError::EmptyId);
        }
        if self.pending.contains_key(&request_id) {
            error!(event = "approval_duplicate", request_id = %request_id);
            return Err(ApprovalError::Duplicate(request_id));
        }

        let latch = ResolutionLatch::default();
        let timer = self.spawn_deadline(&request, latch.clone());

        if alert {
            natives.notifier.notify(&Notification {
                title: alert_title(request.kind()).to_string(),
                body: request.details.summary(),
                tag: Some(format!("approval:{}:{request_id}", request.kind())),
                urgent: true,
            });
        }

        info!(
            event = "approval_admitted",
            request_id = %request_id,
            kind = %request.kind(),
            origin = ?origin,
            deadline = %request.deadline,
            queued = self.queue.len()
        );
        self.pending.insert(
            request_id.clone(),
            Pending {
                request,
                origin,
                latch,
                timer,
            },
        );
        self.queue.push_back(request_id);
        self.present_next(natives);
        Ok(())
    }

    /// Applies the user's dialog choice, unless the deadline already won.
    pub fn decide(
        &mut self,
        request_id: &str,
        choice: DialogChoice,
        natives: &mut NativeServices,
    ) -> Option<Resolved> {
        let Some(entry) = self.pending.get(request_id) else {
            debug!(event = "approval_decision_late", request_id = %request_id);
            return None;
        };
        if !entry.latch.claim() {
            debug!(event = "approval_decision_lost", request_id = %request_id);
            return None;
        }
        let (approved, remember, cause) = match choice {
            DialogChoice::Approve { remember } => (true, remember, ResolutionCause::User),
            DialogChoice::Reject => (false, false, ResolutionCause::User),
            DialogChoice::Closed => (false, false, ResolutionCause::DialogClosed),
        };
        self.finish(request_id, natives, |request| {
            request.resolve(approved, remember, cause)
        })
    }

    /// Rejects a request whose deadline timer claimed the latch.
    pub fn expire(&mut self, request_id: &str, natives: &mut NativeServices) -> Option<Resolved> {
        self.finish(request_id, natives, ApprovalRequest::expire)
    }

    /// Rejects everything still open. Used when the host shuts down.
    pub fn drain(&mut self, natives: &mut NativeServices) -> Vec<Resolved> {
        let order: Vec<String> = self.queue.drain(..).collect();
        let mut resolved = Vec::with_capacity(order.len());
        for request_id in order {
            if let Some(entry) = self.pending.get(&request_id) {
                entry.latch.claim();
            }
            let outcome = self.finish(&request_id, natives, |request| {
                request.resolve(false, false, ResolutionCause::DialogClosed)
            });
            resolved.extend(outcome);
        }
        resolved
    }

    fn finish(
        &mut self,
        request_id: &str,
        natives: &mut NativeServices,
        resolve: impl FnOnce(&mut ApprovalRequest) -> Result<Resolution, ApprovalStateError>,
    ) -> Option<Resolved> {
        let mut entry = self.pending.remove(request_id)?;
        entry.timer.abort();
        self.queue.retain(|id| id != request_id);
        if self.showing.as_deref() == Some(request_id) {
            self.showing = None;
            natives.decisions.dismiss(request_id);
        }

        let outcome = match resolve(&mut entry.request) {
            Ok(resolution) => {
                info!(
                    event = "approval_resolved",
                    request_id = %request_id,
                    approved = resolution.approved,
                    remember = resolution.remember,
                    cause = ?resolution.cause
                );
                Some(Resolved {
                    resolution,
                    origin: entry.origin,
                })
            }
            Err(err) => {
                error!(event = "approval_state_error", error = %err);
                None
            }
        };
        self.present_next(natives);
        outcome
    }

    fn present_next(&mut self, natives: &mut NativeServices) {
        if self.showing.is_some() {
            return;
        }
        while let Some(request_id) = self.queue.front().cloned() {
            let Some(entry) = self.pending.get(&request_id) else {
                self.queue.pop_front();
                continue;
            };
            let prompt = DecisionPrompt::for_request(&entry.request);
            let reply = DecisionReply::new(request_id.clone(), self.events.clone());
            self.showing = Some(request_id);
            natives.decisions.present(prompt, reply);
            return;
        }
    }

    fn spawn_deadline(&self, request: &ApprovalRequest, latch: ResolutionLatch) -> AbortHandle {
        let remaining = request.remaining(Utc::now());
        let request_id = request.request_id.clone();
        let events = self.events.clone();
        tokio::spawn(async move {
            tokio::time::sleep(remaining).await;
            if latch.claim() {
                let _ = events
                    .send(HostEvent::ApprovalDeadline { request_id })
                    .await;
            }
        })
        .abort_handle()
    }
}

impl Drop for ApprovalWorkflow {
    fn drop(&mut self) {
        for entry in self.pending.values() {
            entry.timer.abort();
        }
    }
}

fn alert_title(kind: ApprovalKind) -> &'static str {
    match kind {
        ApprovalKind::Exec => "Command approval needed",
        ApprovalKind::DevicePair => "Device pairing request",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::native::{DecisionSurface, LogChrome, Notifier};
    use harbor_core::{ApprovalDetails, ExecDetails, ResolvedTheme, RiskLevel};
    use std::sync::Mutex;

    #[derive(Default)]
    struct Seen {
        presented: Vec<String>,
        dismissed: Vec<String>,
        notified: Vec<Notification>,
        order: Vec<String>,
    }

    struct FakeDialog(Arc<Mutex<Seen>>);

    impl DecisionSurface for FakeDialog {
        fn present(&mut self, prompt: DecisionPrompt, _reply: DecisionReply) {
            let mut seen = self.0.lock().expect("lock");
            seen.order.push(format!("present:{}", prompt.request_id));
            seen.presented.push(prompt.request_id);
        }

        fn dismiss(&mut self, request_id: &str) {
            self.0.lock().expect("lock").dismissed.push(request_id.to_string());
        }
    }

    struct FakeNotifier(Arc<Mutex<Seen>>);

    impl Notifier for FakeNotifier {
        fn notify(&mut self, notification: &Notification) {
            let mut seen = self.0.lock().expect("lock");
            seen.order.push(format!(
                "notify:{}",
                notification.tag.as_deref().unwrap_or_default()
            ));
            seen.notified.push(notification.clone());
        }
    }

    fn natives() -> (NativeServices, Arc<Mutex<Seen>>) {
        let seen = Arc::new(Mutex::new(Seen::default()));
        let natives = NativeServices {
            notifier: Box::new(FakeNotifier(seen.clone())),
            decisions: Box::new(FakeDialog(seen.clone())),
            chrome: Box::new(LogChrome::new(ResolvedTheme::Light)),
        };
        (natives, seen)
    }

    fn exec(request_id: &str) -> ApprovalRequest {
        ApprovalRequest::new(
            request_id,
            ApprovalDetails::Exec(ExecDetails {
                command: "cargo publish".to_string(),
                cwd: "/repo".to_string(),
                reason: String::new(),
                risk_level: RiskLevel::High,
            }),
            Utc::now(),
        )
    }

    #[tokio::test]
    async fn requests_are_shown_one_at_a_time_in_arrival_order() {
        let (events, _rx) = mpsc::channel(8);
        let (mut natives, seen) = natives();
        let mut workflow = ApprovalWorkflow::new(events);

        workflow
            .admit(exec("a"), ApprovalOrigin::Gateway, false, &mut natives)
            .expect("admit a");
        workflow
            .admit(exec("b"), ApprovalOrigin::Gateway, false, &mut natives)
            .expect("admit b");
        assert_eq!(workflow.showing(), Some("a"));
        assert_eq!(seen.lock().expect("lock").presented, vec!["a"]);

        let resolved = workflow
            .decide("a", DialogChoice::Approve { remember: true }, &mut natives)
            .expect("resolved");
        assert!(resolved.resolution.approved && resolved.resolution.remember);
        assert_eq!(workflow.showing(), Some("b"));

        let seen = seen.lock().expect("lock");
        assert_eq!(seen.presented, vec!["a", "b"]);
        assert_eq!(seen.dismissed, vec!["a"]);
    }

    #[tokio::test]
    async fn duplicate_and_empty_ids_are_refused() {
        let (events, _rx) = mpsc::channel(8);
        let (mut natives, _seen) = natives();
        let mut workflow = ApprovalWorkflow::new(events);
        workflow
            .admit(exec("a"), ApprovalOrigin::Gateway, false, &mut natives)
            .expect("admit");
        assert_eq!(
            workflow.admit(exec("a"), ApprovalOrigin::Gateway, false, &mut natives),
            Err(ApprovalError::Duplicate("a".to_string()))
        );
        assert_eq!(
            workflow.admit(exec(" "), ApprovalOrigin::Gateway, false, &mut natives),
            Err(ApprovalError::EmptyId)
        );
        assert_eq!(workflow.pending_count(), 1);
    }

    #[tokio::test]
    async fn deadline_claim_beats_a_late_user_choice() {
        let (events, _rx) = mpsc::channel(8);
        let (mut natives, _seen) = natives();
        let mut workflow = ApprovalWorkflow::new(events);
        let origin = ApprovalOrigin::Surface {
            correlation_id: Some("c-1".to_string()),
        };
        workflow
            .admit(exec("a"), origin.clone(), false, &mut natives)
            .expect("admit");

        let latch = workflow.latch("a").expect("latch");
        assert!(latch.claim());
        assert_eq!(
            workflow.decide("a", DialogChoice::Approve { remember: false }, &mut natives),
            None
        );

        let resolved = workflow.expire("a", &mut natives).expect("expired");
        assert!(!resolved.resolution.approved);
        assert_eq!(resolved.resolution.cause, ResolutionCause::Deadline);
        assert_eq!(resolved.origin, origin);
        assert_eq!(workflow.expire("a", &mut natives), None);
    }

    #[tokio::test]
    async fn closing_the_dialog_rejects() {
        let (events, _rx) = mpsc::channel(8);
        let (mut natives, _seen) = natives();
        let mut workflow = ApprovalWorkflow::new(events);
        workflow
            .admit(exec("a"), ApprovalOrigin::Gateway, false, &mut natives)
            .expect("admit");
        let resolved = workflow
            .decide("a", DialogChoice::Closed, &mut natives)
            .expect("resolved");
        assert!(!resolved.resolution.approved);
        assert!(!resolved.resolution.remember);
        assert_eq!(resolved.resolution.cause, ResolutionCause::DialogClosed);
    }

    #[tokio::test]
    async fn alert_is_raised_before_the_dialog() {
        let (events, _rx) = mpsc::channel(8);
        let (mut natives, seen) = natives();
        let mut workflow = ApprovalWorkflow::new(events);
        workflow
            .admit(exec("a"), ApprovalOrigin::Gateway, true, &mut natives)
            .expect("admit");
        let seen = seen.lock().expect("lock");
        assert_eq!(seen.notified.len(), 1);
        assert!(seen.notified[0].urgent);
        assert_eq!(seen.notified[0].tag.as_deref(), Some("approval:exec:a"));
        assert_eq!(seen.order, vec!["notify:approval:exec:a", "present:a"]);
    }

    #[tokio::test]
    async fn drain_rejects_everything_in_queue_order() {
        let (events, _rx) = mpsc::channel(8);
        let (mut natives, _seen) = natives();
        let mut workflow = ApprovalWorkflow::new(events);
        for id in ["a", "b", "c"] {
            workflow
                .admit(exec(id), ApprovalOrigin::Gateway, false, &mut natives)
                .expect("admit");
        }
        let drained = workflow.drain(&mut natives);
        let ids: Vec<&str> = drained
            .iter()
            .map(|resolved| resolved.resolution.request_id.as_str())
            .collect();
        assert_eq!(ids, vec!["a", "b", "c"]);
        assert!(drained.iter().all(|resolved| !resolved.resolution.approved));
        assert_eq!(workflow.pending_count(), 0);
        assert_eq!(workflow.showing(), None);
    }
}
