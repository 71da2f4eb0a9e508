//! Client link to the gateway service.
//!
//! One task owns the websocket. It reconnects with capped backoff, turns
//! gateway events into [`GatewayEvent`]s for the coordinator, and answers
//! [`GatewayCommand`]s that arrive through a cloneable [`GatewayHandle`].

use crate::events::HostEvent;
use futures_util::{SinkExt, StreamExt};
use harbor_core::bridge::{DevicePairRequestPayload, ExecApprovalRequestPayload};
use harbor_core::{ApprovalKind, ConnectionState, DevicePairDetails, ExecDetails, Resolution};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::time::Duration;
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::{Instant, MissedTickBehavior};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::header::AUTHORIZATION;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};
use url::Url;
use uuid::Uuid;

pub const CALL_TIMEOUT: Duration = Duration::from_secs(10);
const INITIAL_BACKOFF: Duration = Duration::from_secs(1);
const MAX_BACKOFF: Duration = Duration::from_secs(10);
const SWEEP_INTERVAL: Duration = Duration::from_millis(250);
const COMMAND_QUEUE: usize = 32;

type GatewaySocket = WebSocketStream<MaybeTlsStream<TcpStream>>;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GatewayError {
    #[error("gateway link is not running")]
    LinkClosed,
    #[error("gateway is not connected")]
    NotConnected,
    #[error("gateway call timed out")]
    Timeout,
    #[error("gateway rejected the call: {0}")]
    Rejected(String),
    #[error("gateway transport error: {0}")]
    Transport(String),
    #[error("invalid gateway frame: {0}")]
    Protocol(String),
}

#[derive(Debug, Clone, PartialEq)]
pub enum GatewayEvent {
    Transition(ConnectionState),
    ExecApprovalRequested {
        request_id: String,
        details: ExecDetails,
    },
    DevicePairRequested {
        request_id: String,
        details: DevicePairDetails,
    },
}

type CallReply = oneshot::Sender<Result<(), GatewayError>>;

#[derive(Debug)]
pub enum GatewayCommand {
    Resolve {
        resolution: Resolution,
        reply: CallReply,
    },
    HealthCheck {
        reply: CallReply,
    },
    Restart,
    Stop,
}

/// Wire frames exchanged with the gateway.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum GatewayFrame {
    Event {
        event: String,
        #[serde(default)]
        payload: Value,
    },
    Req {
        id: String,
        method: String,
        #[serde(default)]
        params: Value,
    },
    Res {
        id: String,
        ok: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<Value>,
    },
}

#[derive(Debug, Clone)]
pub struct GatewayHandle {
    commands: mpsc::Sender<GatewayCommand>,
    call_timeout: Duration,
}

impl GatewayHandle {
    pub fn channel() -> (Self, mpsc::Receiver<GatewayCommand>) {
        let (commands, rx) = mpsc::channel(COMMAND_QUEUE);
        (
            Self {
                commands,
                call_timeout: CALL_TIMEOUT,
            },
            rx,
        )
    }

    /// Sends an approval outcome back to the gateway.
    pub async fn resolve(&self, resolution: Resolution) -> Result<(), GatewayError> {
        self.call(|reply| GatewayCommand::Resolve { resolution, reply })
            .await
    }

    /// Round-trips a `health` request.
    pub async fn health_check(&self) -> Result<(), GatewayError> {
        self.call(|reply| GatewayCommand::HealthCheck { reply }).await
    }

    pub fn restart(&self) -> bool {
        self.post(GatewayCommand::Restart)
    }

    pub fn stop(&self) -> bool {
        self.post(GatewayCommand::Stop)
    }

    async fn call(
        &self,
        build: impl FnOnce(CallReply) -> GatewayCommand,
    ) -> Result<(), GatewayError> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(build(reply))
            .await
            .map_err(|_| GatewayError::LinkClosed)?;
        match tokio::time::timeout(self.call_timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(GatewayError::LinkClosed),
            Err(_) => Err(GatewayError::Timeout),
        }
    }

    fn post(&self, command: GatewayCommand) -> bool {
        match self.commands.try_send(command) {
            Ok(()) => true,
            Err(err) => {
                warn!(event = "gateway_command_dropped", error = %err);
                false
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct GatewayLinkConfig {
    pub url: Url,
    pub token: String,
    pub call_timeout: Duration,
}

impl GatewayLinkConfig {
    pub fn new(url: Url, token: impl Into<String>) -> Self {
        Self {
            url,
            token: token.into(),
            call_timeout: CALL_TIMEOUT,
        }
    }
}

enum Interrupt {
    Elapsed,
    Restart,
    Stop,
    Shutdown,
}

enum CallKind {
    Resolve,
    HealthCheck,
}

struct PendingCall {
    kind: CallKind,
    sent_at: Instant,
    reply: CallReply,
}

pub async fn run_link(
    config: GatewayLinkConfig,
    events: mpsc::Sender<HostEvent>,
    mut commands: mpsc::Receiver<GatewayCommand>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut backoff = INITIAL_BACKOFF;
    let mut stopped = false;
    info!(event = "gateway_link_start", url = %config.url);

    loop {
        if *shutdown.borrow() {
            break;
        }
        if stopped {
            match wait_for_restart(&mut commands, &mut shutdown).await {
                Interrupt::Restart => {
                    stopped = false;
                    backoff = INITIAL_BACKOFF;
                    continue;
                }
                _ => break,
            }
        }

        emit(&events, GatewayEvent::Transition(ConnectionState::Connecting)).await;
        let interrupt = match connect(&config).await {
            Ok(ws) => {
                backoff = INITIAL_BACKOFF;
                emit(&events, GatewayEvent::Transition(ConnectionState::Connected)).await;
                let exit = run_session(ws, &config, &events, &mut commands, &mut shutdown).await;
                emit(&events, GatewayEvent::Transition(ConnectionState::Disconnected)).await;
                match exit {
                    Interrupt::Elapsed => wait_backoff(backoff, &mut commands, &mut shutdown).await,
                    other => other,
                }
            }
            Err(err) => {
                warn!(
                    event = "gateway_connect_error",
                    url = %config.url,
                    error = %err,
                    backoff_ms = backoff.as_millis() as u64
                );
                emit(&events, GatewayEvent::Transition(ConnectionState::Disconnected)).await;
                let interrupt = wait_backoff(backoff, &mut commands, &mut shutdown).await;
                backoff = next_backoff(backoff);
                interrupt
            }
        };

        match interrupt {
            Interrupt::Elapsed => {}
            Interrupt::Restart => backoff = INITIAL_BACKOFF,
            Interrupt::Stop => stopped = true,
            Interrupt::Shutdown => break,
        }
    }
    info!(event = "gateway_link_stopped");
}

async fn connect(config: &GatewayLinkConfig) -> Result<GatewaySocket, GatewayError> {
    let mut request = config
        .url
        .as_str()
        .into_client_request()
        .map_err(|err| GatewayError::Transport(err.to_string()))?;
    if !config.token.is_empty() {
        let value = HeaderValue::from_str(&format!("Bearer {}", config.token))
            .map_err(|err| GatewayError::Transport(err.to_string()))?;
        request.headers_mut().insert(AUTHORIZATION, value);
    }
    let (ws, _) = tokio::time::timeout(config.call_timeout, connect_async(request))
        .await
        .map_err(|_| GatewayError::Timeout)?
        .map_err(|err| GatewayError::Transport(err.to_string()))?;
    Ok(ws)
}

/// Drives one connected session. `Interrupt::Elapsed` means the socket was lost.
async fn run_session(
    mut ws: GatewaySocket,
    config: &GatewayLinkConfig,
    events: &mpsc::Sender<HostEvent>,
    commands: &mut mpsc::Receiver<GatewayCommand>,
    shutdown: &mut watch::Receiver<bool>,
) -> Interrupt {
    let mut pending: HashMap<String, PendingCall> = HashMap::new();
    let mut degraded = false;
    let mut sweep = tokio::time::interval(SWEEP_INTERVAL);
    sweep.set_missed_tick_behavior(MissedTickBehavior::Skip);

    let exit = loop {
        tokio::select! {
            incoming = ws.next() => {
                let text = match incoming {
                    Some(Ok(Message::Text(text))) => text,
                    Some(Ok(Message::Close(_))) | None => {
                        info!(event = "gateway_closed");
                        break Interrupt::Elapsed;
                    }
                    Some(Ok(_)) => continue,
                    Some(Err(err)) => {
                        warn!(event = "gateway_read_error", error = %err);
                        break Interrupt::Elapsed;
                    }
                };
                match serde_json::from_str::<GatewayFrame>(&text) {
                    Ok(GatewayFrame::Event { event, payload }) => match parse_event(&event, payload) {
                        Ok(Some(parsed)) => emit(events, parsed).await,
                        Ok(None) => debug!(event = "gateway_event_ignored", name = %event),
                        Err(err) => warn!(event = "gateway_frame_invalid", name = %event, error = %err),
                    },
                    Ok(GatewayFrame::Res { id, ok, error }) => {
                        let Some(call) = pending.remove(&id) else {
                            debug!(event = "gateway_late_response", id = %id);
                            continue;
                        };
                        if ok && degraded && matches!(call.kind, CallKind::HealthCheck) {
                            degraded = false;
                            info!(event = "gateway_recovered");
                            emit(events, GatewayEvent::Transition(ConnectionState::Connected)).await;
                        }
                        let result = if ok {
                            Ok(())
                        } else {
                            Err(GatewayError::Rejected(describe_error(error)))
                        };
                        let _ = call.reply.send(result);
                    }
                    Ok(GatewayFrame::Req { method, .. }) => {
                        debug!(event = "gateway_request_ignored", method = %method);
                    }
                    Err(err) => warn!(event = "gateway_frame_invalid", error = %err),
                }
            }
            command = commands.recv() => {
                let Some(command) = command else {
                    break Interrupt::Shutdown;
                };
                let id = Uuid::new_v4().to_string();
                let (kind, reply, frame) = match command {
                    GatewayCommand::Resolve { resolution, reply } => {
                        (CallKind::Resolve, reply, resolution_request(&id, &resolution))
                    }
                    GatewayCommand::HealthCheck { reply } => {
                        (CallKind::HealthCheck, reply, health_request(&id))
                    }
                    GatewayCommand::Restart => break Interrupt::Restart,
                    GatewayCommand::Stop => break Interrupt::Stop,
                };
                if let Err(err) = send_frame(&mut ws, &frame).await {
                    warn!(event = "gateway_write_error", error = %err);
                    let _ = reply.send(Err(err));
                    break Interrupt::Elapsed;
                }
                pending.insert(id, PendingCall { kind, sent_at: Instant::now(), reply });
            }
            _ = sweep.tick() => {
                let now = Instant::now();
                let expired: Vec<String> = pending
                    .iter()
                    .filter(|(_, call)| now.duration_since(call.sent_at) >= config.call_timeout)
                    .map(|(id, _)| id.clone())
                    .collect();
                for id in expired {
                    let Some(call) = pending.remove(&id) else {
                        continue;
                    };
                    if matches!(call.kind, CallKind::HealthCheck) && !degraded {
                        degraded = true;
                        warn!(event = "gateway_degraded", id = %id);
                        emit(events, GatewayEvent::Transition(ConnectionState::Degraded)).await;
                    }
                    let _ = call.reply.send(Err(GatewayError::Timeout));
                }
            }
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break Interrupt::Shutdown;
                }
            }
        }
    };

    for (_, call) in pending.drain() {
        let _ = call
            .reply
            .send(Err(GatewayError::Transport("connection closed".to_string())));
    }
    let _ = ws.close(None).await;
    exit
}

async fn wait_backoff(
    delay: Duration,
    commands: &mut mpsc::Receiver<GatewayCommand>,
    shutdown: &mut watch::Receiver<bool>,
) -> Interrupt {
    let sleep = tokio::time::sleep(delay);
    tokio::pin!(sleep);
    loop {
        tokio::select! {
            _ = &mut sleep => return Interrupt::Elapsed,
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    return Interrupt::Shutdown;
                }
            }
            command = commands.recv() => match command {
                None => return Interrupt::Shutdown,
                Some(GatewayCommand::Restart) => return Interrupt::Restart,
                Some(GatewayCommand::Stop) => return Interrupt::Stop,
                Some(other) => refuse(other, GatewayError::NotConnected),
            },
        }
    }
}

async fn wait_for_restart(
    commands: &mut mpsc::Receiver<GatewayCommand>,
    shutdown: &mut watch::Receiver<bool>,
) -> Interrupt {
    loop {
        tokio::select! {
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    return Interrupt::Shutdown;
                }
            }
            command = commands.recv() => match command {
                None => return Interrupt::Shutdown,
                Some(GatewayCommand::Restart) => return Interrupt::Restart,
                Some(GatewayCommand::Stop) => {}
                Some(other) => refuse(other, GatewayError::NotConnected),
            },
        }
    }
}

fn refuse(command: GatewayCommand, error: GatewayError) {
    match command {
        GatewayCommand::Resolve { reply, .. } | GatewayCommand::HealthCheck { reply } => {
            let _ = reply.send(Err(error));
        }
        GatewayCommand::Restart | GatewayCommand::Stop => {}
    }
}

async fn emit(events: &mpsc::Sender<HostEvent>, event: GatewayEvent) {
    if events.send(HostEvent::Gateway(event)).await.is_err() {
        debug!(event = "gateway_event_dropped", reason = "coordinator_closed");
    }
}

async fn send_frame(ws: &mut GatewaySocket, frame: &GatewayFrame) -> Result<(), GatewayError> {
    let text =
        serde_json::to_string(frame).map_err(|err| GatewayError::Protocol(err.to_string()))?;
    ws.send(Message::Text(text))
        .await
        .map_err(|err| GatewayError::Transport(err.to_string()))
}

pub fn parse_event(event: &str, payload: Value) -> Result<Option<GatewayEvent>, GatewayError> {
    match event {
        "exec.approval.requested" => {
            let payload: ExecApprovalRequestPayload = serde_json::from_value(payload)
                .map_err(|err| GatewayError::Protocol(err.to_string()))?;
            Ok(Some(GatewayEvent::ExecApprovalRequested {
                request_id: payload.request_id,
                details: payload.details,
            }))
        }
        "device.pair.requested" => {
            let payload: DevicePairRequestPayload = serde_json::from_value(payload)
                .map_err(|err| GatewayError::Protocol(err.to_string()))?;
            Ok(Some(GatewayEvent::DevicePairRequested {
                request_id: payload.request_id,
                details: payload.details,
            }))
        }
        _ => Ok(None),
    }
}

pub fn resolution_request(id: &str, resolution: &Resolution) -> GatewayFrame {
    let (method, params) = match resolution.kind {
        ApprovalKind::Exec => (
            "exec.approval.resolve",
            json!({
                "requestId": resolution.request_id,
                "approved": resolution.approved,
                "remember": resolution.remember,
            }),
        ),
        ApprovalKind::DevicePair => (
            "device.pair.resolve",
            json!({
                "requestId": resolution.request_id,
                "approved": resolution.approved,
            }),
        ),
    };
    GatewayFrame::Req {
        id: id.to_string(),
        method: method.to_string(),
        params,
    }
}

fn health_request(id: &str) -> GatewayFrame {
    GatewayFrame::Req {
        id: id.to_string(),
        method: "health".to_string(),
        params: json!({}),
    }
}

fn describe_error(error: Option<Value>) -> String {
    match error {
        None => "unspecified error".to_string(),
        Some(Value::String(message)) => message,
        Some(Value::Object(fields)) => match fields.get("message") {
            Some(Value::String(message)) => message.clone(),
            _ => Value::Object(fields).to_string(),
        },
        Some(other) => other.to_string(),
    }
}

fn next_backoff(current: Duration) -> Duration {
    let next = current + current;
    if next > MAX_BACKOFF {
        MAX_BACKOFF
    } else {
        next
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use harbor_core::approval::ResolutionCause;
    use tokio::net::TcpListener;

    fn exec_resolution(request_id: &str) -> Resolution {
        Resolution {
            request_id: request_id.to_string(),
            kind: ApprovalKind::Exec,
            approved: true,
            remember: false,
            cause: ResolutionCause::User,
        }
    }

    async fn next_gateway_event(rx: &mut mpsc::Receiver<HostEvent>) -> GatewayEvent {
        let event = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("event in time")
            .expect("channel open");
        match event {
            HostEvent::Gateway(event) => event,
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn backoff_doubles_up_to_the_cap() {
        assert_eq!(next_backoff(Duration::from_secs(1)), Duration::from_secs(2));
        assert_eq!(next_backoff(Duration::from_secs(8)), Duration::from_secs(10));
        assert_eq!(next_backoff(MAX_BACKOFF), MAX_BACKOFF);
    }

    #[test]
    fn approval_events_are_typed_and_unknown_events_ignored() {
        let parsed = parse_event(
            "device.pair.requested",
            json!({"requestId": "p-1", "deviceName": "Phone", "platform": "ios"}),
        )
        .expect("parse");
        assert_eq!(
            parsed,
            Some(GatewayEvent::DevicePairRequested {
                request_id: "p-1".to_string(),
                details: DevicePairDetails {
                    device_name: "Phone".to_string(),
                    platform: "ios".to_string(),
                    ip: String::new(),
                },
            })
        );
        assert_eq!(parse_event("chat.message", json!({})), Ok(None));
        assert!(matches!(
            parse_event("exec.approval.requested", json!({"requestId": "x"})),
            Err(GatewayError::Protocol(_))
        ));
    }

    #[test]
    fn pairing_resolution_carries_no_memory_flag() {
        let resolution = Resolution {
            kind: ApprovalKind::DevicePair,
            ..exec_resolution("p-2")
        };
        let frame = serde_json::to_value(resolution_request("id-1", &resolution)).expect("json");
        assert_eq!(frame["type"], "req");
        assert_eq!(frame["method"], "device.pair.resolve");
        assert_eq!(frame["params"]["requestId"], "p-2");
        assert!(frame["params"].get("remember").is_none());
    }

    #[test]
    fn error_descriptions_prefer_the_message_field() {
        assert_eq!(describe_error(Some(json!({"message": "denied"}))), "denied");
        assert_eq!(describe_error(Some(json!("nope"))), "nope");
        assert_eq!(describe_error(None), "unspecified error");
    }

    #[tokio::test]
    async fn calls_fail_fast_once_the_link_is_gone() {
        let (handle, commands) = GatewayHandle::channel();
        drop(commands);
        assert_eq!(
            handle.resolve(exec_resolution("r-1")).await,
            Err(GatewayError::LinkClosed)
        );
        assert!(!handle.restart());
    }

    #[tokio::test]
    async fn link_delivers_events_and_round_trips_a_resolution() {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("addr");
        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.expect("accept");
            let mut ws = tokio_tungstenite::accept_async(stream).await.expect("handshake");
            let event = json!({
                "type": "event",
                "event": "exec.approval.requested",
                "payload": {"requestId": "g-1", "command": "ls", "riskLevel": "low"}
            });
            ws.send(Message::Text(event.to_string())).await.expect("send event");
            while let Some(Ok(message)) = ws.next().await {
                let Message::Text(text) = message else {
                    continue;
                };
                let frame: Value = serde_json::from_str(&text).expect("json");
                assert_eq!(frame["method"], "exec.approval.resolve");
                assert_eq!(frame["params"]["requestId"], "g-1");
                let res = json!({"type": "res", "id": frame["id"], "ok": true});
                ws.send(Message::Text(res.to_string())).await.expect("send res");
                break;
            }
            while let Some(Ok(_)) = ws.next().await {}
        });

        let (handle, commands) = GatewayHandle::channel();
        let (events_tx, mut events_rx) = mpsc::channel(16);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let url = Url::parse(&format!("ws://{addr}/")).expect("url");
        let link = tokio::spawn(run_link(
            GatewayLinkConfig::new(url, "secret"),
            events_tx,
            commands,
            shutdown_rx,
        ));

        assert_eq!(
            next_gateway_event(&mut events_rx).await,
            GatewayEvent::Transition(ConnectionState::Connecting)
        );
        assert_eq!(
            next_gateway_event(&mut events_rx).await,
            GatewayEvent::Transition(ConnectionState::Connected)
        );
        match next_gateway_event(&mut events_rx).await {
            GatewayEvent::ExecApprovalRequested { request_id, details } => {
                assert_eq!(request_id, "g-1");
                assert_eq!(details.command, "ls");
            }
            other => panic!("unexpected event: {other:?}"),
        }

        assert_eq!(handle.resolve(exec_resolution("g-1")).await, Ok(()));

        shutdown_tx.send(true).expect("shutdown");
        link.await.expect("link task");
        server.await.expect("server task");
    }

    #[tokio::test]
    async fn unanswered_health_check_degrades_and_an_answer_recovers() {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("addr");
        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.expect("accept");
            let mut ws = tokio_tungstenite::accept_async(stream).await.expect("handshake");
            let mut checks = 0;
            while let Some(Ok(message)) = ws.next().await {
                let Message::Text(text) = message else {
                    continue;
                };
                let frame: Value = serde_json::from_str(&text).expect("json");
                if frame["method"] != "health" {
                    continue;
                }
                checks += 1;
                if checks > 1 {
                    let res = json!({"type": "res", "id": frame["id"], "ok": true});
                    ws.send(Message::Text(res.to_string())).await.expect("send res");
                }
            }
        });

        let (handle, commands) = GatewayHandle::channel();
        let (events_tx, mut events_rx) = mpsc::channel(16);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let url = Url::parse(&format!("ws://{addr}/")).expect("url");
        let config = GatewayLinkConfig {
            call_timeout: Duration::from_millis(300),
            ..GatewayLinkConfig::new(url, "")
        };
        let link = tokio::spawn(run_link(config, events_tx, commands, shutdown_rx));

        assert_eq!(
            next_gateway_event(&mut events_rx).await,
            GatewayEvent::Transition(ConnectionState::Connecting)
        );
        assert_eq!(
            next_gateway_event(&mut events_rx).await,
            GatewayEvent::Transition(ConnectionState::Connected)
        );

        assert_eq!(handle.health_check().await, Err(GatewayError::Timeout));
        assert_eq!(
            next_gateway_event(&mut events_rx).await,
            GatewayEvent::Transition(ConnectionState::Degraded)
        );

        assert_eq!(handle.health_check().await, Ok(()));
        assert_eq!(
            next_gateway_event(&mut events_rx).await,
            GatewayEvent::Transition(ConnectionState::Connected)
        );

        shutdown_tx.send(true).expect("shutdown");
        link.await.expect("link task");
        server.await.expect("server task");
    }
}
