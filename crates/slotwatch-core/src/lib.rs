//! Core domain model and target lifecycle for slotwatch.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

pub const CRATE_NAME: &str = "slotwatch-core";

pub type TargetId = Uuid;

/// Portal keys that force a two-factor confirmation step before a booking is final.
pub const PORTALS_REQUIRING_CONFIRMATION: &[&str] = &["idata", "vfs", "asvize", "tlscontact", "cosmos"];

pub fn portal_requires_confirmation(portal: &str) -> bool {
    let portal = portal.trim();
    PORTALS_REQUIRING_CONFIRMATION
        .iter()
        .any(|p| p.eq_ignore_ascii_case(portal))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TargetStatus {
    Stopped,
    Running,
    Paused,
    AwaitingConfirmation,
    Completed,
}

impl TargetStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Stopped => "STOPPED",
            Self::Running => "RUNNING",
            Self::Paused => "PAUSED",
            Self::AwaitingConfirmation => "AWAITING_CONFIRMATION",
            Self::Completed => "COMPLETED",
        }
    }
}

impl fmt::Display for TargetStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TargetStatus {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "stopped" => Ok(Self::Stopped),
            "running" => Ok(Self::Running),
            "paused" => Ok(Self::Paused),
            "awaiting_confirmation" => Ok(Self::AwaitingConfirmation),
            "completed" => Ok(Self::Completed),
            _ => Err(ParseEnumError {
                kind: "target status",
                value: s.to_string(),
            }),
        }
    }
}

/// Process-wide monitoring state, as opposed to the per-target [`TargetStatus`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum GlobalStatus {
    Running,
    Paused,
    #[default]
    Stopped,
}

impl fmt::Display for GlobalStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Running => "RUNNING",
            Self::Paused => "PAUSED",
            Self::Stopped => "STOPPED",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum AgentModel {
    Rule,
    AiHeuristic,
    #[default]
    Hybrid,
}

impl AgentModel {
    /// Whether the remote ranking collaborator is consulted before the local scorer.
    pub fn uses_remote_ranking(self) -> bool {
        !matches!(self, Self::Rule)
    }
}

impl fmt::Display for AgentModel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Rule => "rule",
            Self::AiHeuristic => "ai_heuristic",
            Self::Hybrid => "hybrid",
        })
    }
}

impl FromStr for AgentModel {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "rule" => Ok(Self::Rule),
            "ai_heuristic" | "aiheuristic" => Ok(Self::AiHeuristic),
            "hybrid" => Ok(Self::Hybrid),
            _ => Err(ParseEnumError {
                kind: "agent model",
                value: s.to_string(),
            }),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown {kind}: {value:?}")]
pub struct ParseEnumError {
    pub kind: &'static str,
    pub value: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct PortalCredentials {
    pub username: Option<String>,
    pub secret: Option<String>,
}

impl PortalCredentials {
    pub fn is_complete(&self) -> bool {
        let filled = |v: &Option<String>| v.as_deref().map(|s| !s.trim().is_empty()).unwrap_or(false);
        filled(&self.username) && filled(&self.secret)
    }
}

/// One applicant being monitored. Identity and routing fields are opaque to the agent
/// and handed to the source client untouched.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Target {
    pub id: TargetId,
    pub display_name: String,
    #[serde(default)]
    pub document_no: String,
    #[serde(default)]
    pub birth_date: String,
    #[serde(default)]
    pub phone: String,
    #[serde(default)]
    pub email: String,
    #[serde(default)]
    pub telegram_id: String,
    #[serde(default)]
    pub country: String,
    #[serde(default)]
    pub portal: String,
    #[serde(default)]
    pub city: String,
    #[serde(default)]
    pub center: String,
    #[serde(default)]
    pub visa_type: String,
    pub earliest_date: Option<NaiveDate>,
    pub latest_date: Option<NaiveDate>,
    #[serde(default)]
    pub portal_credentials: Option<PortalCredentials>,
    pub status: TargetStatus,
    pub found_date: Option<NaiveDate>,
    #[serde(default)]
    pub pending_date: Option<NaiveDate>,
    #[serde(default)]
    pub confirmation_id: Option<String>,
    #[serde(default)]
    pub reminder_set: bool,
    #[serde(default)]
    pub reminder_sent: bool,
}

impl Target {
    pub fn new(display_name: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            display_name: display_name.into(),
            document_no: String::new(),
            birth_date: String::new(),
            phone: String::new(),
            email: String::new(),
            telegram_id: String::new(),
            country: String::new(),
            portal: String::new(),
            city: String::new(),
            center: String::new(),
            visa_type: String::new(),
            earliest_date: None,
            latest_date: None,
            portal_credentials: None,
            status: TargetStatus::Stopped,
            found_date: None,
            pending_date: None,
            confirmation_id: None,
            reminder_set: false,
            reminder_sent: false,
        }
    }

    pub fn with_route(
        mut self,
        country: impl Into<String>,
        portal: impl Into<String>,
        city: impl Into<String>,
        center: impl Into<String>,
    ) -> Self {
        self.country = country.into();
        self.portal = portal.into();
        self.city = city.into();
        self.center = center.into();
        self
    }

    pub fn with_visa_type(mut self, visa_type: impl Into<String>) -> Self {
        self.visa_type = visa_type.into();
        self
    }

    pub fn with_window(mut self, earliest: Option<NaiveDate>, latest: Option<NaiveDate>) -> Self {
        self.earliest_date = earliest;
        self.latest_date = latest;
        self
    }

    pub fn with_credentials(mut self, username: impl Into<String>, secret: impl Into<String>) -> Self {
        self.portal_credentials = Some(PortalCredentials {
            username: Some(username.into()),
            secret: Some(secret.into()),
        });
        self
    }

    pub fn requires_confirmation(&self) -> bool {
        portal_requires_confirmation(&self.portal)
    }

    pub fn has_portal_credentials(&self) -> bool {
        self.portal_credentials
            .as_ref()
            .map(PortalCredentials::is_complete)
            .unwrap_or(false)
    }

    pub fn window_is_valid(&self) -> bool {
        match (self.earliest_date, self.latest_date) {
            (Some(earliest), Some(latest)) => earliest <= latest,
            _ => true,
        }
    }

    /// Bulk start/pause/stop commands leave a suspended booking alone.
    pub fn is_bulk_exempt(&self) -> bool {
        self.status == TargetStatus::AwaitingConfirmation
    }

    /// Drive the target through one lifecycle step. The target is left untouched on error.
    pub fn apply(&mut self, event: LifecycleEvent) -> Result<Transition, TransitionError> {
        let from = self.status;
        let to = next_status(from, &event)?;
        match event {
            LifecycleEvent::SlotHeld { date } => {
                self.pending_date = Some(date);
            }
            LifecycleEvent::Booked { date, confirmation_id } => {
                self.found_date = Some(date);
                self.pending_date = None;
                self.confirmation_id = confirmation_id;
            }
            LifecycleEvent::ConfirmationCancelled | LifecycleEvent::ConfirmationRejected => {
                self.pending_date = None;
            }
            LifecycleEvent::Start | LifecycleEvent::Pause | LifecycleEvent::Stop => {}
        }
        self.status = to;
        Ok(Transition { from, to })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LifecycleEvent {
    Start,
    Pause,
    Stop,
    /// Slot found on a confirmation portal; booking waits for an external code.
    SlotHeld { date: NaiveDate },
    /// Booking succeeded, or was accepted in simulation mode (no confirmation id).
    Booked {
        date: NaiveDate,
        confirmation_id: Option<String>,
    },
    ConfirmationCancelled,
    /// Booking failed or was rejected after a confirmation code was supplied.
    ConfirmationRejected,
}

impl LifecycleEvent {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Start => "start",
            Self::Pause => "pause",
            Self::Stop => "stop",
            Self::SlotHeld { .. } => "slot_held",
            Self::Booked { .. } => "booked",
            Self::ConfirmationCancelled => "confirmation_cancelled",
            Self::ConfirmationRejected => "confirmation_rejected",
        }
    }

    /// Map an operator's requested status onto the event that reaches it from `current`.
    pub fn for_requested_status(
        current: TargetStatus,
        requested: TargetStatus,
    ) -> Result<Self, TransitionError> {
        match requested {
            TargetStatus::Running if current == TargetStatus::AwaitingConfirmation => {
                Ok(Self::ConfirmationCancelled)
            }
            TargetStatus::Running => Ok(Self::Start),
            TargetStatus::Paused => Ok(Self::Pause),
            TargetStatus::Stopped => Ok(Self::Stop),
            TargetStatus::AwaitingConfirmation | TargetStatus::Completed => {
                Err(TransitionError::NotOperatorSettable { requested })
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition {
    pub from: TargetStatus,
    pub to: TargetStatus,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransitionError {
    #[error("{event} is not allowed from {from}")]
    Illegal { from: TargetStatus, event: &'static str },
    #[error("{requested} can only be reached through a probe or booking outcome")]
    NotOperatorSettable { requested: TargetStatus },
}

pub fn next_status(from: TargetStatus, event: &LifecycleEvent) -> Result<TargetStatus, TransitionError> {
    use TargetStatus::*;

    let to = match (from, event) {
        (Stopped | Paused, LifecycleEvent::Start) => Running,
        (Running, LifecycleEvent::Pause) => Paused,
        (Running | Paused, LifecycleEvent::Stop) => Stopped,
        (Running, LifecycleEvent::SlotHeld { .. }) => AwaitingConfirmation,
        (Running | AwaitingConfirmation, LifecycleEvent::Booked { .. }) => Completed,
        (AwaitingConfirmation, LifecycleEvent::ConfirmationCancelled)
        | (AwaitingConfirmation, LifecycleEvent::ConfirmationRejected) => Running,
        _ => {
            return Err(TransitionError::Illegal {
                from,
                event: event.name(),
            })
        }
    };
    Ok(to)
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunConfig {
    pub poll_interval_seconds: u64,
    pub poll_jitter_seconds: u64,
    pub agent_model: AgentModel,
    pub global_status: GlobalStatus,
    pub next_run_at: Option<DateTime<Utc>>,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            poll_interval_seconds: 120,
            poll_jitter_seconds: 30,
            agent_model: AgentModel::default(),
            global_status: GlobalStatus::Stopped,
            next_run_at: None,
        }
    }
}

impl RunConfig {
    pub fn next_run_at_epoch_ms(&self) -> Option<i64> {
        self.next_run_at.map(|at| at.timestamp_millis())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProbeResult {
    pub found: bool,
    pub date: Option<NaiveDate>,
    pub message: String,
}

impl ProbeResult {
    pub fn not_found(message: impl Into<String>) -> Self {
        Self {
            found: false,
            date: None,
            message: message.into(),
        }
    }

    pub fn found(date: NaiveDate, message: impl Into<String>) -> Self {
        Self {
            found: true,
            date: Some(date),
            message: message.into(),
        }
    }

    /// The slot date, when the probe reported one.
    pub fn slot(&self) -> Option<NaiveDate> {
        if self.found {
            self.date
        } else {
            None
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BookingResult {
    pub success: bool,
    pub confirmation_id: Option<String>,
    pub error: Option<String>,
}

impl BookingResult {
    pub fn confirmed(confirmation_id: impl Into<String>) -> Self {
        Self {
            success: true,
            confirmation_id: Some(confirmation_id.into()),
            error: None,
        }
    }

    pub fn rejected(error: impl Into<String>) -> Self {
        Self {
            success: false,
            confirmation_id: None,
            error: Some(error.into()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Success,
    Warning,
    Error,
}

/// Structured activity record emitted for every transition and probe/booking outcome.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActivityEntry {
    pub timestamp: DateTime<Utc>,
    pub severity: Severity,
    pub message: String,
    pub target_id: Option<TargetId>,
}
