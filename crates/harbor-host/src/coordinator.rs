//! The single-threaded host coordinator.
//!
//! Owns every piece of mutable host state and drains [`HostEvent`]s one at
//! a time. Anything slow (gateway calls, disk writes) runs as its own task
//! and reports back through the same queue.

use crate::approval::{ApprovalOrigin, ApprovalWorkflow, Resolved};
use crate::connection::{ConnectionSync, TransitionOrigin};
use crate::events::HostEvent;
use crate::focus::FocusTracker;
use crate::gateway::{GatewayError, GatewayEvent, GatewayHandle};
use crate::native::{ConnectionIndicator, NativeServices, Notification};
use crate::router::{Inbound, Router};
use crate::settings::SettingsService;
use crate::theme::{ThemeChange, ThemeSync};
use chrono::Utc;
use futures_util::future::join_all;
use harbor_core::bridge::{
    ConnectionStatePayload, DevicePairResultPayload, ExecApprovalResultPayload, FileDropPayload,
    FocusPayload, GatewayAction, InitPayload, NavigatePayload, ThemePayload, WindowStatePayload,
};
use harbor_core::{
    ApprovalDetails, ApprovalKind, ApprovalRequest, ConnectionState, HostMessage, Resolution,
    Settings, SurfaceMessage,
};
use harbor_storage::GeometryStore;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};
use url::Url;

const EXTERNAL_SCHEMES: [&str; 3] = ["http", "https", "mailto"];
const SHUTDOWN_DISPATCH: Duration = Duration::from_secs(3);

#[derive(Debug, Clone, Default)]
pub struct HostOptions {
    /// Set when a flag or env var pinned the gateway URL. Otherwise the URL
    /// follows the current settings snapshot.
    pub gateway_url: Option<String>,
    pub token: String,
}

pub struct Coordinator {
    options: HostOptions,
    router: Router,
    connection: ConnectionSync,
    approvals: ApprovalWorkflow,
    theme: ThemeSync,
    focus: FocusTracker,
    settings: SettingsService,
    natives: NativeServices,
    gateway: GatewayHandle,
    events: mpsc::Sender<HostEvent>,
    geometry: Option<GeometryStore>,
}

impl Coordinator {
    pub fn new(
        options: HostOptions,
        settings: SettingsService,
        natives: NativeServices,
        gateway: GatewayHandle,
        events: mpsc::Sender<HostEvent>,
    ) -> Self {
        let theme = ThemeSync::new(settings.snapshot().theme_mode, natives.chrome.system_theme());
        Self {
            options,
            router: Router::new(),
            connection: ConnectionSync::new(),
            approvals: ApprovalWorkflow::new(events.clone()),
            theme,
            focus: FocusTracker::default(),
            settings,
            natives,
            gateway,
            events,
            geometry: None,
        }
    }

    /// Restores window placement from `store` on start and saves it on stop.
    pub fn with_geometry(mut self, store: GeometryStore) -> Self {
        self.geometry = Some(store);
        self
    }

    pub fn router_mut(&mut self) -> &mut Router {
        &mut self.router
    }

    pub fn connection(&self) -> &ConnectionSync {
        &self.connection
    }

    pub fn add_indicator(&mut self, indicator: Box<dyn ConnectionIndicator>) {
        self.connection.add_indicator(indicator);
    }

    pub fn theme(&self) -> &ThemeSync {
        &self.theme
    }

    pub fn focus(&self) -> &FocusTracker {
        &self.focus
    }

    pub fn approvals(&self) -> &ApprovalWorkflow {
        &self.approvals
    }

    pub fn settings(&self) -> &SettingsService {
        &self.settings
    }

    pub async fn run(mut self, mut events: mpsc::Receiver<HostEvent>) {
        self.natives.chrome.repaint(self.theme.setting().resolved);
        self.restore_geometry();
        info!(event = "coordinator_start");
        while let Some(event) = events.recv().await {
            if matches!(event, HostEvent::Shutdown) {
                let outstanding = self.drain_approvals();
                self.flush_gateway_resolutions(outstanding).await;
                break;
            }
            self.handle_event(event);
        }
        self.save_geometry();
        info!(event = "coordinator_stop");
    }

    pub fn handle_event(&mut self, event: HostEvent) {
        match event {
            HostEvent::SurfaceAttached {
                surface_id,
                outbound,
            } => {
                if let Err(err) = self.router.attach(surface_id, outbound) {
                    warn!(event = "surface_refused", surface_id, error = %err);
                }
            }
            HostEvent::SurfaceFrame { surface_id, raw } => {
                if !self.router.is_current(surface_id) {
                    debug!(event = "stale_surface_frame", surface_id);
                    return;
                }
                if let Inbound::Message {
                    message,
                    correlation_id,
                    ..
                } = self.router.receive(&raw)
                {
                    self.handle_surface_message(message, correlation_id);
                }
            }
            HostEvent::SurfaceDetached { surface_id } => {
                self.router.detach(surface_id);
            }
            HostEvent::Gateway(event) => self.handle_gateway_event(event),
            HostEvent::Window(window_event) => {
                if let Some(state) = self.focus.observe(window_event) {
                    let _ = self
                        .router
                        .send(&HostMessage::WindowState(WindowStatePayload { state }));
                }
            }
            HostEvent::OsThemeChanged(os_theme) => {
                let change = self.theme.on_os_theme(os_theme);
                self.apply_theme_change(change);
            }
            HostEvent::SetThemeMode(mode) => {
                let change = self.theme.set_mode(mode);
                self.apply_theme_change(change);
            }
            HostEvent::ApplySettings(next) => self.apply_settings(next),
            HostEvent::Navigate(tab) => {
                let _ = self
                    .router
                    .send(&HostMessage::Navigate(NavigatePayload { tab }));
            }
            HostEvent::Focus(target) => {
                self.natives.chrome.bring_to_front();
                let _ = self
                    .router
                    .send(&HostMessage::Focus(FocusPayload { target }));
            }
            HostEvent::FilesDropped(files) => {
                let _ = self
                    .router
                    .send(&HostMessage::FileDrop(FileDropPayload { files }));
            }
            HostEvent::ApprovalDecided { request_id, choice } => {
                let resolved = self.approvals.decide(&request_id, choice, &mut self.natives);
                if let Some(resolved) = resolved {
                    self.dispatch_resolution(resolved);
                }
            }
            HostEvent::ApprovalDeadline { request_id } => {
                info!(event = "approval_deadline", request_id = %request_id);
                if let Some(resolved) = self.approvals.expire(&request_id, &mut self.natives) {
                    self.dispatch_resolution(resolved);
                }
            }
            HostEvent::NotificationActivated { tag } => {
                debug!(event = "notification_activated", tag = ?tag);
                self.natives.chrome.bring_to_front();
            }
            HostEvent::ResolutionDispatched { request_id, result } => {
                log_dispatch(&request_id, &result);
            }
            HostEvent::Shutdown => {
                for resolution in self.drain_approvals() {
                    self.spawn_gateway_resolve(resolution);
                }
            }
        }
    }

    fn handle_surface_message(&mut self, message: SurfaceMessage, correlation_id: Option<String>) {
        match message {
            SurfaceMessage::Ready(ready) => {
                if self.router.init_sent() {
                    warn!(event = "duplicate_ready", version = %ready.version);
                    return;
                }
                let settings = self.settings.snapshot();
                let gateway_url = match &self.options.gateway_url {
                    Some(url) => url.clone(),
                    None => settings.gateway_url(),
                };
                let init = HostMessage::Init(InitPayload {
                    theme: self.theme.setting().resolved,
                    gateway_url,
                    token: self.options.token.clone(),
                    settings: (*settings).clone(),
                });
                if self.router.send(&init).is_ok() {
                    info!(event = "surface_initialized", version = %ready.version);
                    let state = self.connection.current();
                    let _ = self.router.send(&HostMessage::ConnectionStateChanged(
                        ConnectionStatePayload { state },
                    ));
                }
            }
            SurfaceMessage::ConnectionStateChanged(payload) => {
                self.transition(payload.state, TransitionOrigin::Surface);
            }
            SurfaceMessage::Notify(notify) => {
                if !self.focus.should_alert() {
                    debug!(event = "notification_suppressed", title = %notify.title);
                    return;
                }
                self.natives.notifier.notify(&Notification {
                    title: notify.title,
                    body: notify.body,
                    tag: notify.tag,
                    urgent: false,
                });
            }
            SurfaceMessage::ThemeChanged(payload) => {
                let change = self.theme.apply_surface(payload.theme);
                self.apply_theme_change(change);
            }
            SurfaceMessage::TabChanged(tab) => {
                let title = if tab.title.trim().is_empty() {
                    tab.tab
                } else {
                    tab.title
                };
                self.natives.chrome.set_title(&title);
            }
            SurfaceMessage::RequestExecApproval(payload) => {
                let request = ApprovalRequest::new(
                    payload.request_id,
                    ApprovalDetails::Exec(payload.details),
                    Utc::now(),
                );
                self.admit(request, ApprovalOrigin::Surface { correlation_id });
            }
            SurfaceMessage::RequestDevicePair(payload) => {
                let request = ApprovalRequest::new(
                    payload.request_id,
                    ApprovalDetails::DevicePair(payload.details),
                    Utc::now(),
                );
                self.admit(request, ApprovalOrigin::Surface { correlation_id });
            }
            SurfaceMessage::OpenExternal(payload) => match Url::parse(&payload.url) {
                Ok(url) if EXTERNAL_SCHEMES.contains(&url.scheme()) => {
                    self.natives.chrome.open_external(&url);
                }
                Ok(url) => warn!(event = "open_external_refused", scheme = %url.scheme()),
                Err(err) => warn!(event = "open_external_refused", error = %err),
            },
            SurfaceMessage::Badge(badge) => self.natives.chrome.set_badge(badge.count),
            SurfaceMessage::GatewayAction(payload) => match payload.action {
                GatewayAction::Restart => {
                    self.gateway.restart();
                    self.transition(ConnectionState::Connecting, TransitionOrigin::User);
                }
                GatewayAction::Stop => {
                    self.gateway.stop();
                    self.transition(ConnectionState::Disconnected, TransitionOrigin::User);
                }
            },
        }
    }

    fn handle_gateway_event(&mut self, event: GatewayEvent) {
        match event {
            GatewayEvent::Transition(state) => self.transition(state, TransitionOrigin::Gateway),
            GatewayEvent::ExecApprovalRequested {
                request_id,
                details,
            } => {
                let request =
                    ApprovalRequest::new(request_id, ApprovalDetails::Exec(details), Utc::now());
                self.admit(request, ApprovalOrigin::Gateway);
            }
            GatewayEvent::DevicePairRequested {
                request_id,
                details,
            } => {
                let request = ApprovalRequest::new(
                    request_id,
                    ApprovalDetails::DevicePair(details),
                    Utc::now(),
                );
                self.admit(request, ApprovalOrigin::Gateway);
            }
        }
    }

    fn transition(&mut self, state: ConnectionState, origin: TransitionOrigin) {
        let update = self.connection.apply(state, origin);
        let _ = self.router.send(&update.to_message());
    }

    fn admit(&mut self, request: ApprovalRequest, origin: ApprovalOrigin) {
        let alert = self.focus.should_alert();
        if let Err(err) = self
            .approvals
            .admit(request, origin, alert, &mut self.natives)
        {
            warn!(event = "approval_refused", error = %err);
        }
    }

    fn dispatch_resolution(&mut self, resolved: Resolved) {
        let Resolved { resolution, origin } = resolved;
        match origin {
            ApprovalOrigin::Gateway => self.spawn_gateway_resolve(resolution),
            ApprovalOrigin::Surface { correlation_id } => {
                let message = match resolution.kind {
                    ApprovalKind::Exec => HostMessage::ExecApprovalResult(ExecApprovalResultPayload {
                        request_id: resolution.request_id.clone(),
                        approved: resolution.approved,
                        remember: resolution.remember,
                    }),
                    ApprovalKind::DevicePair => {
                        HostMessage::DevicePairResult(DevicePairResultPayload {
                            request_id: resolution.request_id.clone(),
                            approved: resolution.approved,
                        })
                    }
                };
                if let Err(err) = self
                    .router
                    .send_correlated(&message, correlation_id.as_deref())
                {
                    error!(
                        event = "resolution_dispatch_error",
                        request_id = %resolution.request_id,
                        error = %err
                    );
                }
            }
        }
    }

    fn apply_theme_change(&mut self, change: Option<ThemeChange>) {
        let Some(change) = change else {
            return;
        };
        if change.resolved_changed {
            self.natives.chrome.repaint(change.setting.resolved);
        }
        if change.notify_surface {
            let _ = self.router.send(&HostMessage::ThemeChanged(ThemePayload {
                theme: change.setting.resolved,
            }));
        }
        if change.persist {
            let mode = change.setting.mode;
            if let Some(snapshot) = self.settings.update(|settings| settings.theme_mode = mode) {
                let _ = self
                    .router
                    .send(&HostMessage::SettingsChanged((*snapshot).clone()));
            }
        }
    }

    fn apply_settings(&mut self, next: Settings) {
        let mode = next.theme_mode;
        let Some(snapshot) = self.settings.replace(next) else {
            return;
        };
        let _ = self
            .router
            .send(&HostMessage::SettingsChanged((*snapshot).clone()));
        // Mode already persisted with the snapshot above; only repaint and notify.
        let change = self.theme.set_mode(mode).map(|change| ThemeChange {
            persist: false,
            ..change
        });
        self.apply_theme_change(change);
    }

    fn restore_geometry(&mut self) {
        let Some(store) = &self.geometry else {
            return;
        };
        let screens = self.natives.chrome.screens();
        if let Some(geometry) = store.restore(&screens) {
            info!(
                event = "geometry_restored",
                left = geometry.left,
                top = geometry.top,
                width = geometry.width,
                height = geometry.height
            );
            self.natives.chrome.place_window(geometry);
        }
    }

    fn save_geometry(&self) {
        let (Some(store), Some(geometry)) = (&self.geometry, self.natives.chrome.window_geometry())
        else {
            return;
        };
        if let Err(err) = store.save(&geometry) {
            warn!(event = "persistence_error", error = %err);
        }
    }

    fn spawn_gateway_resolve(&self, resolution: Resolution) {
        let gateway = self.gateway.clone();
        let events = self.events.clone();
        tokio::spawn(async move {
            let request_id = resolution.request_id.clone();
            let result = gateway.resolve(resolution).await;
            // Coordinator gone: nobody else will log the outcome.
            if let Err(mpsc::error::SendError(HostEvent::ResolutionDispatched {
                request_id,
                result,
            })) = events
                .send(HostEvent::ResolutionDispatched { request_id, result })
                .await
            {
                log_dispatch(&request_id, &result);
            }
        });
    }

    /// Rejects every open approval. Surface-origin answers go out right
    /// away; gateway-origin ones are returned for the caller to deliver.
    fn drain_approvals(&mut self) -> Vec<Resolution> {
        let mut outstanding = Vec::new();
        for resolved in self.approvals.drain(&mut self.natives) {
            match resolved.origin {
                ApprovalOrigin::Gateway => outstanding.push(resolved.resolution),
                ApprovalOrigin::Surface { .. } => self.dispatch_resolution(resolved),
            }
        }
        info!(
            event = "coordinator_shutdown",
            connection = %self.connection.current(),
            outstanding = outstanding.len()
        );
        outstanding
    }

    /// Delivers shutdown rejections before the gateway link is torn down.
    async fn flush_gateway_resolutions(&self, resolutions: Vec<Resolution>) {
        if resolutions.is_empty() {
            return;
        }
        let calls = resolutions.into_iter().map(|resolution| {
            let gateway = self.gateway.clone();
            async move {
                let request_id = resolution.request_id.clone();
                (request_id, gateway.resolve(resolution).await)
            }
        });
        match tokio::time::timeout(SHUTDOWN_DISPATCH, join_all(calls)).await {
            Ok(results) => {
                for (request_id, result) in results {
                    log_dispatch(&request_id, &result);
                }
            }
            Err(_) => error!(event = "resolution_dispatch_error", reason = "shutdown_timeout"),
        }
    }
}

fn log_dispatch(request_id: &str, result: &Result<(), GatewayError>) {
    match result {
        Ok(()) => debug!(event = "resolution_dispatched", request_id = %request_id),
        Err(err) => error!(event = "resolution_dispatch_error", request_id = %request_id, error = %err),
    }
}
