//! Source and ranking collaborator contracts + simulated implementations.

use std::fs;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{Days, NaiveDate, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value as JsonValue};
use slotwatch_core::{BookingResult, PortalCredentials, ProbeResult, Target, TargetId};
use slotwatch_storage::{RetryClassify, RetryDisposition};
use thiserror::Error;
use tracing::debug;
use uuid::Uuid;

pub const CRATE_NAME: &str = "slotwatch-adapters";

/// Failure reported by the appointment source, classified for retry.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SourceError {
    /// Overloaded or flaky source; expected to clear up after a wait.
    #[error("{message}")]
    Transient { message: String },
    /// Missing token, credentials or confirmation code. Waiting will not fix it.
    #[error("{message}")]
    Permanent { message: String },
}

impl SourceError {
    pub fn transient(message: impl Into<String>) -> Self {
        Self::Transient {
            message: message.into(),
        }
    }

    pub fn permanent(message: impl Into<String>) -> Self {
        Self::Permanent {
            message: message.into(),
        }
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient { .. })
    }

    pub fn message(&self) -> &str {
        match self {
            Self::Transient { message } | Self::Permanent { message } => message,
        }
    }
}

impl RetryClassify for SourceError {
    fn disposition(&self) -> RetryDisposition {
        if self.is_transient() {
            RetryDisposition::Retryable
        } else {
            RetryDisposition::NonRetryable
        }
    }
}

#[async_trait]
pub trait SourceClient: Send + Sync {
    fn name(&self) -> &'static str;

    async fn probe(&self, target: &Target) -> Result<ProbeResult, SourceError>;

    async fn book(
        &self,
        target: &Target,
        date: NaiveDate,
        confirmation_code: Option<&str>,
    ) -> Result<BookingResult, SourceError>;
}

/// Minimal projection of a target handed to the remote ranking model.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RankCandidate {
    pub id: TargetId,
    pub latest_date: Option<NaiveDate>,
    pub visa_type: String,
    pub city: String,
}

impl From<&Target> for RankCandidate {
    fn from(target: &Target) -> Self {
        Self {
            id: target.id,
            latest_date: target.latest_date,
            visa_type: target.visa_type.clone(),
            city: target.city.clone(),
        }
    }
}

#[derive(Debug, Error)]
pub enum RankError {
    #[error("ranking transport failed: {0}")]
    Transport(String),
    #[error("ranking response has no usable chosenId: {0}")]
    BadShape(String),
    #[error("ranking chose an id that was not offered: {0}")]
    UnknownId(TargetId),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Remote prioritization collaborator. Answers with a JSON object carrying `chosenId`.
#[async_trait]
pub trait RemoteRanker: Send + Sync {
    fn name(&self) -> &'static str;

    async fn rank(&self, candidates: &[RankCandidate]) -> Result<JsonValue, RankError>;
}

/// Accept only `{"chosenId": "<uuid>"}` naming one of the offered candidates.
pub fn parse_choice(response: &JsonValue, candidates: &[RankCandidate]) -> Result<TargetId, RankError> {
    let raw = response
        .get("chosenId")
        .and_then(JsonValue::as_str)
        .ok_or_else(|| RankError::BadShape(response.to_string()))?;
    let id = Uuid::parse_str(raw.trim()).map_err(|e| RankError::BadShape(format!("{raw}: {e}")))?;
    if candidates.iter().any(|c| c.id == id) {
        Ok(id)
    } else {
        Err(RankError::UnknownId(id))
    }
}

/// Knobs for the simulated source. Rates are probabilities in `0.0..=1.0`.
#[derive(Debug, Clone)]
pub struct SimulationProfile {
    pub hit_rate: f64,
    pub probe_overload_rate: f64,
    pub booking_overload_rate: f64,
    pub rejection_rate: f64,
    pub probe_latency: (Duration, Duration),
    pub booking_latency: (Duration, Duration),
    pub open_window_days: u64,
    pub min_code_len: usize,
}

impl Default for SimulationProfile {
    fn default() -> Self {
        Self {
            hit_rate: 0.10,
            probe_overload_rate: 0.05,
            booking_overload_rate: 0.15,
            rejection_rate: 0.05,
            probe_latency: (Duration::from_millis(500), Duration::from_millis(1500)),
            booking_latency: (Duration::from_millis(1500), Duration::from_millis(2500)),
            open_window_days: 90,
            min_code_len: 4,
        }
    }
}

impl SimulationProfile {
    /// Deterministic profile: no latency, no overloads, every probe hits.
    pub fn always_hit() -> Self {
        Self {
            hit_rate: 1.0,
            probe_overload_rate: 0.0,
            booking_overload_rate: 0.0,
            rejection_rate: 0.0,
            probe_latency: (Duration::ZERO, Duration::ZERO),
            booking_latency: (Duration::ZERO, Duration::ZERO),
            ..Self::default()
        }
    }
}

/// Stand-in appointment source used when no real portal client is wired in.
#[derive(Debug, Clone)]
pub struct SimulatedSource {
    profile: SimulationProfile,
    api_token: Option<String>,
}

impl SimulatedSource {
    pub fn new(profile: SimulationProfile, api_token: Option<String>) -> Self {
        Self { profile, api_token }
    }

    fn slot_date_for(&self, target: &Target) -> NaiveDate {
        let today = Utc::now().date_naive();
        let earliest = target.earliest_date.unwrap_or(today);
        let latest = target.latest_date.unwrap_or_else(|| {
            today
                .checked_add_days(Days::new(self.profile.open_window_days))
                .unwrap_or(today)
        });
        let span = (latest - earliest).num_days().max(0) as u64;
        let offset = if span == 0 {
            0
        } else {
            rand::thread_rng().gen_range(0..=span)
        };
        earliest.checked_add_days(Days::new(offset)).unwrap_or(earliest)
    }
}

fn roll(probability: f64) -> bool {
    rand::thread_rng().gen_bool(probability.clamp(0.0, 1.0))
}

fn latency_between((min, max): (Duration, Duration)) -> Duration {
    if max <= min {
        return min;
    }
    rand::thread_rng().gen_range(min..=max)
}

#[async_trait]
impl SourceClient for SimulatedSource {
    fn name(&self) -> &'static str {
        "simulated"
    }

    async fn probe(&self, target: &Target) -> Result<ProbeResult, SourceError> {
        tokio::time::sleep(latency_between(self.profile.probe_latency)).await;

        if roll(self.profile.probe_overload_rate) {
            return Err(SourceError::transient("503 Service Unavailable: source is overloaded"));
        }

        if roll(self.profile.hit_rate) {
            let date = self.slot_date_for(target);
            debug!(target_id = %target.id, %date, "simulated slot released");
            return Ok(ProbeResult::found(
                date,
                format!("slot found for {}: {}", target.display_name, date),
            ));
        }

        Ok(ProbeResult::not_found(format!(
            "no slot for {} at {}/{}",
            target.display_name, target.city, target.center
        )))
    }

    async fn book(
        &self,
        target: &Target,
        date: NaiveDate,
        confirmation_code: Option<&str>,
    ) -> Result<BookingResult, SourceError> {
        tokio::time::sleep(latency_between(self.profile.booking_latency)).await;

        if self
            .api_token
            .as_deref()
            .map(|t| t.trim().is_empty())
            .unwrap_or(true)
        {
            return Err(SourceError::permanent("API token is missing"));
        }

        if target.requires_confirmation() {
            if !target.has_portal_credentials() {
                return Err(SourceError::permanent(format!(
                    "portal credentials are required for {}",
                    target.portal
                )));
            }
            let code_ok = confirmation_code
                .map(|c| c.trim().len() >= self.profile.min_code_len)
                .unwrap_or(false);
            if !code_ok {
                return Err(SourceError::permanent("confirmation code is missing or too short"));
            }
        }

        if roll(self.profile.booking_overload_rate) {
            return Err(SourceError::transient("500 Internal Server Error"));
        }

        if roll(self.profile.rejection_rate) {
            return Ok(BookingResult::rejected(format!(
                "slot on {date} was taken before the booking completed"
            )));
        }

        Ok(BookingResult::confirmed(format!(
            "CONF-{}",
            Utc::now().timestamp_millis()
        )))
    }
}

/// Stand-in for the AI ranking model: picks the most urgent deadline.
#[derive(Debug, Clone, Default)]
pub struct SimulatedRanker {
    pub failure_rate: f64,
}

#[async_trait]
impl RemoteRanker for SimulatedRanker {
    fn name(&self) -> &'static str {
        "simulated-ranker"
    }

    async fn rank(&self, candidates: &[RankCandidate]) -> Result<JsonValue, RankError> {
        if roll(self.failure_rate) {
            return Err(RankError::Transport("ranking model unavailable".into()));
        }

        let mut best: Option<&RankCandidate> = None;
        for candidate in candidates {
            best = match best {
                None => Some(candidate),
                Some(current) => match (candidate.latest_date, current.latest_date) {
                    (Some(a), Some(b)) if a < b => Some(candidate),
                    (Some(_), None) => Some(candidate),
                    _ => Some(current),
                },
            };
        }

        let best = best.ok_or_else(|| RankError::BadShape("no candidates offered".into()))?;
        Ok(json!({ "chosenId": best.id.to_string() }))
    }
}

/// Seed record for importing targets from a JSON file.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TargetSeed {
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
    #[serde(default)]
    pub reminder_set: bool,
}

impl TargetSeed {
    pub fn into_target(self) -> Target {
        let mut target = Target::new(self.display_name)
            .with_route(self.country, self.portal, self.city, self.center)
            .with_visa_type(self.visa_type)
            .with_window(self.earliest_date, self.latest_date);
        target.document_no = self.document_no;
        target.birth_date = self.birth_date;
        target.phone = self.phone;
        target.email = self.email;
        target.telegram_id = self.telegram_id;
        target.portal_credentials = self.portal_credentials;
        target.reminder_set = self.reminder_set;
        target
    }
}

pub fn load_target_seed(path: impl AsRef<Path>) -> Result<Vec<Target>> {
    let path = path.as_ref();
    let data = fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    let seeds: Vec<TargetSeed> =
        serde_json::from_str(&data).with_context(|| format!("parsing {}", path.display()))?;
    Ok(seeds.into_iter().map(TargetSeed::into_target).collect())
}
