use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Time a request stays open before it resolves as rejected.
pub const APPROVAL_WINDOW_SECS: i64 = 60;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalKind {
    Exec,
    DevicePair,
}

impl ApprovalKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ApprovalKind::Exec => "exec",
            ApprovalKind::DevicePair => "device_pair",
        }
    }
}

impl fmt::Display for ApprovalKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Risk label attached by whoever produced the request. Rendered, never computed here.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum RiskLevel {
    Low,
    Medium,
    High,
    Critical,
    #[default]
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ExecDetails {
    pub command: String,
    #[serde(default)]
    pub cwd: String,
    #[serde(default)]
    pub reason: String,
    #[serde(default)]
    pub risk_level: RiskLevel,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct DevicePairDetails {
    pub device_name: String,
    #[serde(default)]
    pub platform: String,
    #[serde(default)]
    pub ip: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApprovalDetails {
    Exec(ExecDetails),
    DevicePair(DevicePairDetails),
}

impl ApprovalDetails {
    pub fn kind(&self) -> ApprovalKind {
        match self {
            ApprovalDetails::Exec(_) => ApprovalKind::Exec,
            ApprovalDetails::DevicePair(_) => ApprovalKind::DevicePair,
        }
    }

    /// One-line description used for notifications and logs.
    pub fn summary(&self) -> String {
        match self {
            ApprovalDetails::Exec(exec) => format!("Run `{}`", exec.command),
            ApprovalDetails::DevicePair(pair) if pair.platform.is_empty() => {
                format!("Pair device {}", pair.device_name)
            }
            ApprovalDetails::DevicePair(pair) => {
                format!("Pair device {} ({})", pair.device_name, pair.platform)
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Pending,
    Approved,
    Rejected,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResolutionCause {
    User,
    DialogClosed,
    Deadline,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resolution {
    pub request_id: String,
    pub kind: ApprovalKind,
    pub approved: bool,
    pub remember: bool,
    pub cause: ResolutionCause,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ApprovalStateError {
    #[error("approval {request_id} already resolved as {decision:?}")]
    AlreadyResolved {
        request_id: String,
        decision: Decision,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApprovalRequest {
    pub request_id: String,
    pub details: ApprovalDetails,
    pub created_at: DateTime<Utc>,
    pub deadline: DateTime<Utc>,
    pub decision: Decision,
    pub remember: bool,
}

impl ApprovalRequest {
    pub fn new(request_id: impl Into<String>, details: ApprovalDetails, now: DateTime<Utc>) -> Self {
        Self {
            request_id: request_id.into(),
            details,
            created_at: now,
            deadline: now + Duration::seconds(APPROVAL_WINDOW_SECS),
            decision: Decision::Pending,
            remember: false,
        }
    }

    pub fn kind(&self) -> ApprovalKind {
        self.details.kind()
    }

    pub fn is_pending(&self) -> bool {
        self.decision == Decision::Pending
    }

    /// Time left before the deadline, clamped at zero.
    pub fn remaining(&self, now: DateTime<Utc>) -> std::time::Duration {
        (self.deadline - now).to_std().unwrap_or_default()
    }

    /// Records the single decision for this request.
    ///
    /// `remember` only sticks for exec requests; device pairing has no memory.
    pub fn resolve(
        &mut self,
        approved: bool,
        remember: bool,
        cause: ResolutionCause,
    ) -> Result<Resolution, ApprovalStateError> {
        if !self.is_pending() {
            return Err(ApprovalStateError::AlreadyResolved {
                request_id: self.request_id.clone(),
                decision: self.decision,
            });
        }
        let remember = remember && self.kind() == ApprovalKind::Exec && cause == ResolutionCause::User;
        self.decision = if approved {
            Decision::Approved
        } else {
            Decision::Rejected
        };
        self.remember = remember;
        Ok(Resolution {
            request_id: self.request_id.clone(),
            kind: self.kind(),
            approved,
            remember,
            cause,
        })
    }

    pub fn expire(&mut self) -> Result<Resolution, ApprovalStateError> {
        self.resolve(false, false, ResolutionCause::Deadline)
    }
}
