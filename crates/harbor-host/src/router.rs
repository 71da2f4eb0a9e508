//! Typed message routing between the host and one embedded surface.
//!
//! The router owns the surface lifecycle (`Detached → Attached → Ready`),
//! decodes inbound frames, fans them out to subscribers keyed by message
//! kind, and gates every outbound message on readiness.

use harbor_core::bridge::{self, DecodeError, EncodeError, HostMessage, SurfaceMessage, SurfaceMessageKind};
use std::collections::HashMap;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouterState {
    Detached,
    Attached,
    Ready,
}

#[derive(Debug, Error)]
#[error("{0}")]
pub struct HandlerError(pub String);

#[derive(Debug, Error)]
pub enum SendError {
    #[error("no surface is attached")]
    NotAttached,
    #[error("surface has not announced readiness")]
    NotReady,
    #[error("host.init was already sent to this surface")]
    InitAlreadySent,
    #[error("surface outbound queue is full")]
    QueueFull,
    #[error("surface transport closed")]
    Closed,
    #[error(transparent)]
    Encode(#[from] EncodeError),
}

impl SendError {
    /// Transport not there yet (or any more). Expected during startup and teardown.
    pub fn is_unavailable(&self) -> bool {
        matches!(self, SendError::NotAttached | SendError::NotReady | SendError::Closed)
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum AttachError {
    #[error("surface {current} is already attached")]
    Occupied { current: u64 },
}

/// Subscriber for one inbound message kind.
pub trait SurfaceHandler: Send + Sync {
    fn handle(&mut self, message: &SurfaceMessage) -> Result<(), HandlerError>;
}

impl<F> SurfaceHandler for F
where
    F: FnMut(&SurfaceMessage) -> Result<(), HandlerError> + Send + Sync,
{
    fn handle(&mut self, message: &SurfaceMessage) -> Result<(), HandlerError> {
        self(message)
    }
}

#[derive(Debug)]
pub enum DropReason {
    Decode(DecodeError),
    UnknownType(String),
    NotReady(SurfaceMessageKind),
    Detached,
}

#[derive(Debug)]
pub enum Inbound {
    Message {
        message: SurfaceMessage,
        correlation_id: Option<String>,
        handler_failures: usize,
    },
    Dropped(DropReason),
}

pub struct Router {
    state: RouterState,
    surface_id: Option<u64>,
    outbound: Option<mpsc::Sender<String>>,
    init_sent: bool,
    handlers: HashMap<SurfaceMessageKind, Vec<Box<dyn SurfaceHandler>>>,
}

impl Default for Router {
    fn default() -> Self {
        Self::new()
    }
}

impl Router {
    pub fn new() -> Self {
        Self {
            state: RouterState::Detached,
            surface_id: None,
            outbound: None,
            init_sent: false,
            handlers: HashMap::new(),
        }
    }

    pub fn state(&self) -> RouterState {
        self.state
    }

    pub fn init_sent(&self) -> bool {
        self.init_sent
    }

    pub fn is_current(&self, surface_id: u64) -> bool {
        self.surface_id == Some(surface_id)
    }

    /// Handlers for a kind run in registration order.
    pub fn subscribe<H>(&mut self, kind: SurfaceMessageKind, handler: H)
    where
        H: SurfaceHandler + 'static,
    {
        self.handlers.entry(kind).or_default().push(Box::new(handler));
    }

    pub fn subscriber_count(&self, kind: SurfaceMessageKind) -> usize {
        self.handlers.get(&kind).map_or(0, Vec::len)
    }

    pub fn attach(&mut self, surface_id: u64, outbound: mpsc::Sender<String>) -> Result<(), AttachError> {
        if let Some(current) = self.surface_id {
            return Err(AttachError::Occupied { current });
        }
        self.surface_id = Some(surface_id);
        self.outbound = Some(outbound);
        self.state = RouterState::Attached;
        self.init_sent = false;
        debug!(event = "surface_attached", surface_id);
        Ok(())
    }

    /// Ends the current surface lifetime. Returns false for a stale id.
    pub fn detach(&mut self, surface_id: u64) -> bool {
        if !self.is_current(surface_id) {
            return false;
        }
        self.surface_id = None;
        self.outbound = None;
        self.state = RouterState::Detached;
        self.init_sent = false;
        debug!(event = "surface_detached", surface_id);
        true
    }

    /// Decodes one inbound frame and fans it out to subscribers.
    pub fn receive(&mut self, raw: &str) -> Inbound {
        if self.state == RouterState::Detached {
            return Inbound::Dropped(DropReason::Detached);
        }

        let envelope = match bridge::decode(raw) {
            Ok(envelope) => envelope,
            Err(err) => {
                warn!(event = "decode_error", error = %err, size = raw.len());
                return Inbound::Dropped(DropReason::Decode(err));
            }
        };
        let message = match SurfaceMessage::from_envelope(&envelope) {
            Ok(Some(message)) => message,
            Ok(None) => {
                debug!(event = "unknown_message_type", kind = %envelope.kind);
                return Inbound::Dropped(DropReason::UnknownType(envelope.kind));
            }
            Err(err) => {
                warn!(event = "decode_error", kind = %envelope.kind, error = %err);
                return Inbound::Dropped(DropReason::Decode(err));
            }
        };

        let kind = message.kind();
        match (self.state, kind) {
            (RouterState::Attached, SurfaceMessageKind::Ready) => {
                self.state = RouterState::Ready;
                debug!(event = "surface_ready", surface_id = ?self.surface_id);
            }
            (RouterState::Attached, _) => {
                debug!(event = "message_before_ready", kind = %kind);
                return Inbound::Dropped(DropReason::NotReady(kind));
            }
            _ => {}
        }

        let mut handler_failures = 0;
        if let Some(handlers) = self.handlers.get_mut(&kind) {
            for handler in handlers.iter_mut() {
                if let Err(err) = handler.handle(&message) {
                    handler_failures += 1;
                    warn!(event = "dispatch_error", kind = %kind, error = %err);
                }
            }
        }

        Inbound::Message {
            message,
            correlation_id: envelope.correlation_id,
            handler_failures,
        }
    }

    pub fn send(&mut self, message: &HostMessage) -> Result<(), SendError> {
        self.send_correlated(message, None)
    }

    /// Fire-and-forget delivery to the attached surface.
    ///
    /// Only a ready surface receives anything, and `host.init` at most once
    /// per surface lifetime.
    pub fn send_correlated(
        &mut self,
        message: &HostMessage,
        correlation_id: Option<&str>,
    ) -> Result<(), SendError> {
        let result = self.try_deliver(message, correlation_id);
        match &result {
            Ok(()) => {
                if matches!(message, HostMessage::Init(_)) {
                    self.init_sent = true;
                }
            }
            Err(err) if err.is_unavailable() => {
                debug!(event = "transport_unavailable", kind = message.kind(), error = %err);
            }
            Err(err) => {
                warn!(event = "send_error", kind = message.kind(), error = %err);
            }
        }
        result
    }

    fn try_deliver(
        &self,
        message: &HostMessage,
        correlation_id: Option<&str>,
    ) -> Result<(), SendError> {
        let outbound = match (&self.outbound, self.state) {
            (None, _) => return Err(SendError::NotAttached),
            (Some(_), RouterState::Attached | RouterState::Detached) => {
                return Err(SendError::NotReady)
            }
            (Some(outbound), RouterState::Ready) => outbound,
        };
        if matches!(message, HostMessage::Init(_)) && self.init_sent {
            return Err(SendError::InitAlreadySent);
        }
        let raw = message.encode(correlation_id)?;
        outbound.try_send(raw).map_err(|err| match err {
            mpsc::error::TrySendError::Full(_) => SendError::QueueFull,
            mpsc::error::TrySendError::Closed(_) => SendError::Closed,
        })
    }
}
