//! Monitoring-and-booking agent: prioritization, the recurring probe cycle and operator commands.

use std::collections::{HashSet, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, NaiveDate, NaiveTime, Utc};
use parking_lot::Mutex;
use rand::Rng;
use serde::{Deserialize, Serialize};
use slotwatch_adapters::{parse_choice, RankCandidate, RemoteRanker, SourceClient, SourceError};
use slotwatch_core::{
    ActivityEntry, AgentModel, GlobalStatus, LifecycleEvent, RunConfig, Severity, Target, TargetId,
    TargetStatus, Transition, TransitionError,
};
use slotwatch_storage::{RetryPolicy, StoredState, TargetStore};
use thiserror::Error;
use tokio::sync::broadcast;
use tokio_cron_scheduler::{Job, JobScheduler};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "slotwatch-agent";

/// Reminders fire for appointments at most this many days ahead.
pub const REMINDER_LEAD_DAYS: i64 = 1;

const ACTIVITY_BROADCAST_CAPACITY: usize = 256;

/// Upper bound for the poll interval and the jitter, one week.
pub const MAX_POLL_SECS: u64 = 7 * 24 * 60 * 60;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BookingSettings {
    pub enabled: bool,
    pub api_url: String,
    pub api_token: Option<String>,
}

impl Default for BookingSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            api_url: "http://localhost:8000".to_string(),
            api_token: None,
        }
    }
}

/// Delays and retry budgets used while iterating targets.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CycleTuning {
    pub probe_retry: RetryPolicy,
    pub booking_retry: RetryPolicy,
    /// Pause between consecutive targets so the source never sees a burst.
    pub pacing: Duration,
    /// Delay before the first cycle after an operator start.
    pub start_delay: Duration,
    pub activity_capacity: usize,
}

impl Default for CycleTuning {
    fn default() -> Self {
        Self {
            probe_retry: RetryPolicy::new(3, Duration::from_millis(1500)),
            booking_retry: RetryPolicy::new(3, Duration::from_millis(2000)),
            pacing: Duration::from_secs(1),
            start_delay: Duration::from_secs(5),
            activity_capacity: 100,
        }
    }
}

impl CycleTuning {
    /// No backoff and no pacing; the start delay is kept.
    pub fn without_pacing() -> Self {
        Self {
            probe_retry: RetryPolicy::new(3, Duration::ZERO),
            booking_retry: RetryPolicy::new(3, Duration::ZERO),
            pacing: Duration::ZERO,
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone)]
pub struct AgentConfig {
    pub targets_path: PathBuf,
    pub poll_interval_secs: u64,
    pub poll_jitter_secs: u64,
    pub agent_model: AgentModel,
    pub booking: BookingSettings,
    pub reminder_enabled: bool,
    pub reminder_cron: String,
    pub tuning: CycleTuning,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            targets_path: PathBuf::from("./slotwatch-targets.json"),
            poll_interval_secs: 120,
            poll_jitter_secs: 30,
            agent_model: AgentModel::Hybrid,
            booking: BookingSettings::default(),
            reminder_enabled: false,
            reminder_cron: "0 0 9 * * *".to_string(),
            tuning: CycleTuning::default(),
        }
    }
}

fn env_flag(name: &str) -> Option<bool> {
    std::env::var(name)
        .ok()
        .map(|v| matches!(v.trim(), "1" | "true" | "TRUE" | "True" | "yes"))
}

/// Seconds from the environment within `min..=MAX_POLL_SECS`; anything else keeps the default.
fn env_secs(name: &str, min: u64) -> Option<u64> {
    let raw = std::env::var(name).ok()?;
    match raw.trim().parse::<u64>() {
        Ok(v) if (min..=MAX_POLL_SECS).contains(&v) => Some(v),
        _ => {
            warn!(name, value = %raw, max = MAX_POLL_SECS, "ignoring out-of-range setting");
            None
        }
    }
}

fn check_secs(name: &str, value: u64, min: u64) -> Result<u64> {
    anyhow::ensure!(
        (min..=MAX_POLL_SECS).contains(&value),
        "{name} must be between {min} and {MAX_POLL_SECS} seconds, got {value}"
    );
    Ok(value)
}

impl AgentConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            targets_path: std::env::var("SLOTWATCH_TARGETS_PATH")
                .map(PathBuf::from)
                .unwrap_or(defaults.targets_path),
            poll_interval_secs: env_secs("SLOTWATCH_POLL_INTERVAL_SECS", 1)
                .unwrap_or(defaults.poll_interval_secs),
            poll_jitter_secs: env_secs("SLOTWATCH_POLL_JITTER_SECS", 0)
                .unwrap_or(defaults.poll_jitter_secs),
            agent_model: std::env::var("SLOTWATCH_AGENT_MODEL")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.agent_model),
            booking: BookingSettings {
                enabled: env_flag("SLOTWATCH_BOOKING_ENABLED").unwrap_or(false),
                api_url: std::env::var("SLOTWATCH_API_URL").unwrap_or(defaults.booking.api_url),
                api_token: std::env::var("SLOTWATCH_API_TOKEN")
                    .ok()
                    .filter(|t| !t.trim().is_empty()),
            },
            reminder_enabled: env_flag("SLOTWATCH_REMINDER_ENABLED").unwrap_or(false),
            reminder_cron: std::env::var("SLOTWATCH_REMINDER_CRON").unwrap_or(defaults.reminder_cron),
            tuning: defaults.tuning,
        }
    }

    /// Environment first, then the YAML file named by `SLOTWATCH_CONFIG` when set.
    pub fn load() -> Result<Self> {
        let config = Self::from_env();
        match std::env::var("SLOTWATCH_CONFIG") {
            Ok(path) if !path.trim().is_empty() => config.with_yaml_overrides(path.trim()),
            _ => Ok(config),
        }
    }

    pub fn with_yaml_overrides(mut self, path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
        let file: ConfigFile =
            serde_yaml::from_str(&text).with_context(|| format!("parsing {}", path.display()))?;

        if let Some(v) = file.targets_path {
            self.targets_path = v;
        }
        if let Some(v) = file.poll_interval_secs {
            self.poll_interval_secs = check_secs("poll_interval_secs", v, 1)?;
        }
        if let Some(v) = file.poll_jitter_secs {
            self.poll_jitter_secs = check_secs("poll_jitter_secs", v, 0)?;
        }
        if let Some(v) = file.agent_model {
            self.agent_model = v;
        }
        if let Some(v) = file.booking_enabled {
            self.booking.enabled = v;
        }
        if let Some(v) = file.api_url {
            self.booking.api_url = v;
        }
        if let Some(v) = file.api_token {
            self.booking.api_token = Some(v).filter(|t| !t.trim().is_empty());
        }
        if let Some(v) = file.reminder_enabled {
            self.reminder_enabled = v;
        }
        if let Some(v) = file.reminder_cron {
            self.reminder_cron = v;
        }
        Ok(self)
    }

    pub fn apply_to(&self, run: &mut RunConfig) {
        run.poll_interval_seconds = self.poll_interval_secs;
        run.poll_jitter_seconds = self.poll_jitter_secs;
        run.agent_model = self.agent_model;
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct ConfigFile {
    targets_path: Option<PathBuf>,
    poll_interval_secs: Option<u64>,
    poll_jitter_secs: Option<u64>,
    agent_model: Option<AgentModel>,
    booking_enabled: Option<bool>,
    api_url: Option<String>,
    api_token: Option<String>,
    reminder_enabled: Option<bool>,
    reminder_cron: Option<String>,
}

/// Activity stream for the host: a broadcast channel plus a bounded buffer of recent entries.
/// Every entry is mirrored to `tracing`.
#[derive(Debug, Clone)]
pub struct ActivityLog {
    tx: broadcast::Sender<ActivityEntry>,
    recent: Arc<Mutex<VecDeque<ActivityEntry>>>,
    capacity: usize,
}

impl ActivityLog {
    pub fn new(capacity: usize) -> Self {
        let (tx, _rx) = broadcast::channel(ACTIVITY_BROADCAST_CAPACITY);
        Self {
            tx,
            recent: Arc::new(Mutex::new(VecDeque::with_capacity(capacity))),
            capacity: capacity.max(1),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ActivityEntry> {
        self.tx.subscribe()
    }

    pub fn record(
        &self,
        severity: Severity,
        target_id: Option<TargetId>,
        message: impl Into<String>,
    ) -> ActivityEntry {
        let entry = ActivityEntry {
            timestamp: Utc::now(),
            severity,
            message: message.into(),
            target_id,
        };

        match severity {
            Severity::Info | Severity::Success => {
                info!(target: "slotwatch::activity", target_id = ?entry.target_id, severity = ?severity, "{}", entry.message)
            }
            Severity::Warning => {
                warn!(target: "slotwatch::activity", target_id = ?entry.target_id, "{}", entry.message)
            }
            Severity::Error => {
                error!(target: "slotwatch::activity", target_id = ?entry.target_id, "{}", entry.message)
            }
        }

        {
            let mut recent = self.recent.lock();
            if recent.len() >= self.capacity {
                recent.pop_back();
            }
            recent.push_front(entry.clone());
        }
        let _ = self.tx.send(entry.clone());
        entry
    }

    pub fn info(&self, target_id: Option<TargetId>, message: impl Into<String>) {
        self.record(Severity::Info, target_id, message);
    }

    pub fn success(&self, target_id: Option<TargetId>, message: impl Into<String>) {
        self.record(Severity::Success, target_id, message);
    }

    pub fn warning(&self, target_id: Option<TargetId>, message: impl Into<String>) {
        self.record(Severity::Warning, target_id, message);
    }

    pub fn error(&self, target_id: Option<TargetId>, message: impl Into<String>) {
        self.record(Severity::Error, target_id, message);
    }

    /// Newest first.
    pub fn recent(&self) -> Vec<ActivityEntry> {
        self.recent.lock().iter().cloned().collect()
    }
}

pub fn visa_type_weight(visa_type: &str) -> f64 {
    match visa_type.trim().to_ascii_lowercase().as_str() {
        "business" => 10.0,
        "education" => 8.0,
        "family" => 5.0,
        "tourism" => 3.0,
        _ => 1.0,
    }
}

/// Demand tiers for the busiest visa-center cities.
pub fn city_weight(city: &str) -> f64 {
    match city.trim().to_ascii_lowercase().as_str() {
        "istanbul" => 10.0,
        "ankara" => 7.0,
        "izmir" => 5.0,
        _ => 3.0,
    }
}

pub fn urgency(latest_date: Option<NaiveDate>, now: DateTime<Utc>) -> f64 {
    let Some(deadline) = latest_date else {
        return 1.0;
    };
    let deadline = deadline.and_time(NaiveTime::MIN).and_utc();
    let days = (deadline - now).num_milliseconds() as f64 / 86_400_000.0;
    (10.0 - days / 9.0).max(0.0)
}

pub fn local_score(target: &Target, now: DateTime<Utc>) -> f64 {
    5.0 * urgency(target.latest_date, now)
        + 3.0 * visa_type_weight(&target.visa_type)
        + 2.0 * city_weight(&target.city)
}

/// Highest local score among running targets; the earlier target wins a tie.
pub fn rank_locally(targets: &[Target], now: DateTime<Utc>) -> Option<&Target> {
    let mut best: Option<(&Target, f64)> = None;
    for target in targets.iter().filter(|t| t.status == TargetStatus::Running) {
        let score = local_score(target, now);
        match best {
            Some((_, best_score)) if score <= best_score => {}
            _ => best = Some((target, score)),
        }
    }
    best.map(|(target, _)| target)
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum RankingMode {
    Local,
    Remote,
    /// The remote ranker failed and the local scorer chose instead.
    Fallback { reason: String },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RankingDecision {
    pub chosen: Option<TargetId>,
    pub mode: RankingMode,
}

/// Remote ranking composed with the local scorer. Never fails: any remote problem,
/// including a panic inside the ranker, degrades to local scoring.
#[derive(Clone, Default)]
pub struct Prioritizer {
    remote: Option<Arc<dyn RemoteRanker>>,
}

impl Prioritizer {
    pub fn local_only() -> Self {
        Self { remote: None }
    }

    pub fn with_remote(remote: Arc<dyn RemoteRanker>) -> Self {
        Self {
            remote: Some(remote),
        }
    }

    pub async fn choose(&self, model: AgentModel, targets: &[Target], now: DateTime<Utc>) -> RankingDecision {
        let running: Vec<Target> = targets
            .iter()
            .filter(|t| t.status == TargetStatus::Running)
            .cloned()
            .collect();
        if running.is_empty() {
            return RankingDecision {
                chosen: None,
                mode: RankingMode::Local,
            };
        }

        // Without a configured ranker every model scores locally; that is not a degradation.
        let mut mode = RankingMode::Local;
        if model.uses_remote_ranking() && self.remote.is_some() {
            match self.choose_remotely(&running).await {
                Ok(id) => {
                    return RankingDecision {
                        chosen: Some(id),
                        mode: RankingMode::Remote,
                    }
                }
                Err(reason) => {
                    debug!(%reason, "remote ranking unavailable, using local scores");
                    mode = RankingMode::Fallback { reason };
                }
            }
        }

        RankingDecision {
            chosen: rank_locally(&running, now).map(|t| t.id),
            mode,
        }
    }

    async fn choose_remotely(&self, running: &[Target]) -> std::result::Result<TargetId, String> {
        let Some(remote) = self.remote.clone() else {
            return Err("no remote ranker configured".to_string());
        };
        let candidates: Vec<RankCandidate> = running.iter().map(RankCandidate::from).collect();
        let offered = candidates.clone();

        let response = tokio::spawn(async move { remote.rank(&offered).await })
            .await
            .map_err(|e| format!("ranker aborted: {e}"))?
            .map_err(|e| e.to_string())?;
        parse_choice(&response, &candidates).map_err(|e| e.to_string())
    }
}

#[derive(Debug, Error)]
pub enum AgentError {
    #[error("unknown target {0}")]
    UnknownTarget(TargetId),
    #[error(transparent)]
    Transition(#[from] TransitionError),
    #[error("target {id} is {status}, not awaiting confirmation")]
    NotAwaitingConfirmation { id: TargetId, status: TargetStatus },
    #[error("a confirmation for target {0} is already being submitted")]
    ConfirmationInFlight(TargetId),
    #[error("target {0} is being checked right now; try again after the cycle")]
    TargetBusy(TargetId),
    #[error("earliest date is after latest date")]
    InvalidWindow,
    #[error("{0} cannot be applied to all targets")]
    NotBulkStatus(TargetStatus),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TargetOutcome {
    NoSlot,
    ProbeFailed { error: String },
    /// Booking disabled: the found slot was accepted without calling the source.
    Simulated { date: NaiveDate },
    AwaitingConfirmation { date: NaiveDate },
    Booked {
        date: NaiveDate,
        confirmation_id: Option<String>,
    },
    BookingFailed { date: NaiveDate, error: String },
    /// The target left the running pool while the cycle was under way.
    Skipped { status: TargetStatus },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TargetReport {
    pub target_id: TargetId,
    pub outcome: TargetOutcome,
}

#[derive(Debug, Clone, Serialize)]
pub struct CycleReport {
    pub cycle_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub ranking: Option<RankingDecision>,
    pub targets: Vec<TargetReport>,
    pub auto_paused: bool,
    pub cancelled: bool,
    pub rescheduled: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ConfirmationOutcome {
    Confirmed { confirmation_id: Option<String> },
    /// The booking failed; the target is back in the running pool.
    Rejected { error: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BulkOutcome {
    pub changed: usize,
    pub exempt: usize,
    pub unchanged: usize,
    /// Held back until the target's in-flight probe or booking is recorded.
    pub deferred: usize,
}

/// The target currently being probed or booked, and the bulk command that arrived meanwhile.
#[derive(Debug)]
struct InFlight {
    id: TargetId,
    deferred: Option<LifecycleEvent>,
}

#[derive(Debug)]
struct PendingTimer {
    generation: u64,
    token: CancellationToken,
}

/// Scheduler-owned mutable state. Only the agent mutates it, through the methods below.
#[derive(Debug, Default)]
pub struct SchedulerState {
    targets: Vec<Target>,
    run: RunConfig,
    timer: Option<PendingTimer>,
    timer_generation: u64,
    confirming: HashSet<TargetId>,
    in_flight: Option<InFlight>,
}

impl SchedulerState {
    pub fn new(targets: Vec<Target>, run: RunConfig) -> Self {
        Self {
            targets,
            run,
            ..Self::default()
        }
    }

    pub fn targets(&self) -> &[Target] {
        &self.targets
    }

    pub fn run(&self) -> &RunConfig {
        &self.run
    }

    pub fn target(&self, id: TargetId) -> Option<&Target> {
        self.targets.iter().find(|t| t.id == id)
    }

    fn target_mut(&mut self, id: TargetId) -> Result<&mut Target, AgentError> {
        self.targets
            .iter_mut()
            .find(|t| t.id == id)
            .ok_or(AgentError::UnknownTarget(id))
    }

    fn running_targets(&self) -> Vec<Target> {
        self.targets
            .iter()
            .filter(|t| t.status == TargetStatus::Running)
            .cloned()
            .collect()
    }

    fn apply(&mut self, id: TargetId, event: LifecycleEvent) -> Result<(String, Transition), AgentError> {
        let target = self.target_mut(id)?;
        let transition = target.apply(event)?;
        Ok((target.display_name.clone(), transition))
    }

    /// Apply an operator command to every target except those awaiting confirmation.
    /// A target whose probe or booking is in flight is left alone; the command is
    /// replayed on it once the outcome is recorded.
    fn apply_bulk(&mut self, event: &LifecycleEvent) -> BulkOutcome {
        let mut outcome = BulkOutcome::default();
        for target in &mut self.targets {
            if target.is_bulk_exempt() {
                outcome.exempt += 1;
                continue;
            }
            if let Some(flight) = self.in_flight.as_mut().filter(|f| f.id == target.id) {
                flight.deferred = Some(event.clone());
                outcome.deferred += 1;
                continue;
            }
            match target.apply(event.clone()) {
                Ok(_) => outcome.changed += 1,
                Err(_) => outcome.unchanged += 1,
            }
        }
        outcome
    }

    fn is_busy(&self, id: TargetId) -> bool {
        self.confirming.contains(&id) || self.in_flight.as_ref().is_some_and(|f| f.id == id)
    }

    fn begin_flight(&mut self, id: TargetId) {
        self.in_flight = Some(InFlight { id, deferred: None });
    }

    /// Close the in-flight window and replay a bulk command that arrived during it.
    /// A replay that is no longer legal (the target completed or was held) is dropped.
    fn end_flight(&mut self, id: TargetId) -> Option<Transition> {
        let flight = self.in_flight.take().filter(|f| f.id == id)?;
        let event = flight.deferred?;
        let target = self.target_mut(id).ok()?;
        if target.is_bulk_exempt() {
            return None;
        }
        target.apply(event).ok()
    }

    fn cancel_timer(&mut self) {
        if let Some(timer) = self.timer.take() {
            timer.token.cancel();
        }
        self.run.next_run_at = None;
    }

    fn arm_timer(&mut self, wake_at: DateTime<Utc>) -> (u64, CancellationToken) {
        self.cancel_timer();
        self.timer_generation += 1;
        let token = CancellationToken::new();
        self.timer = Some(PendingTimer {
            generation: self.timer_generation,
            token: token.clone(),
        });
        self.run.next_run_at = Some(wake_at);
        (self.timer_generation, token)
    }

    /// Called when a timer fires; a stale timer must not clear a newer one.
    fn disarm_fired(&mut self, generation: u64) -> bool {
        match &self.timer {
            Some(timer) if timer.generation == generation => {
                self.timer = None;
                self.run.next_run_at = None;
                true
            }
            _ => false,
        }
    }

    fn snapshot(&self) -> StoredState {
        StoredState {
            targets: self.targets.clone(),
            run: self.run.clone(),
            ..StoredState::default()
        }
    }
}

/// `interval ± jitter` seconds, never negative. Both inputs are capped at [`MAX_POLL_SECS`].
pub fn jittered_delay(interval_secs: u64, jitter_secs: u64) -> Duration {
    let interval_secs = interval_secs.min(MAX_POLL_SECS);
    let jitter_secs = jitter_secs.min(MAX_POLL_SECS);
    let offset = if jitter_secs == 0 {
        0.0
    } else {
        let bound = jitter_secs as f64;
        rand::thread_rng().gen_range(-bound..=bound)
    };
    Duration::from_secs_f64((interval_secs as f64 + offset).max(0.0))
}

struct AgentInner {
    state: Mutex<SchedulerState>,
    cycle_guard: tokio::sync::Mutex<()>,
    source: Arc<dyn SourceClient>,
    prioritizer: Prioritizer,
    booking: BookingSettings,
    tuning: CycleTuning,
    activity: ActivityLog,
    store: Option<Arc<TargetStore>>,
}

pub struct AgentBuilder {
    source: Arc<dyn SourceClient>,
    prioritizer: Prioritizer,
    booking: BookingSettings,
    tuning: CycleTuning,
    store: Option<Arc<TargetStore>>,
    targets: Vec<Target>,
    run: RunConfig,
}

impl AgentBuilder {
    pub fn prioritizer(mut self, prioritizer: Prioritizer) -> Self {
        self.prioritizer = prioritizer;
        self
    }

    pub fn booking(mut self, booking: BookingSettings) -> Self {
        self.booking = booking;
        self
    }

    pub fn tuning(mut self, tuning: CycleTuning) -> Self {
        self.tuning = tuning;
        self
    }

    pub fn store(mut self, store: Arc<TargetStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn state(mut self, targets: Vec<Target>, run: RunConfig) -> Self {
        self.targets = targets;
        self.run = run;
        self
    }

    pub fn build(self) -> MonitoringAgent {
        let activity = ActivityLog::new(self.tuning.activity_capacity);
        MonitoringAgent {
            inner: Arc::new(AgentInner {
                state: Mutex::new(SchedulerState::new(self.targets, self.run)),
                cycle_guard: tokio::sync::Mutex::new(()),
                source: self.source,
                prioritizer: self.prioritizer,
                booking: self.booking,
                tuning: self.tuning,
                activity,
                store: self.store,
            }),
        }
    }
}

enum NextStep {
    Stop,
    Skip(TargetStatus),
    Probe(Target),
}

/// The scheduler. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct MonitoringAgent {
    inner: Arc<AgentInner>,
}

impl MonitoringAgent {
    pub fn builder(source: Arc<dyn SourceClient>) -> AgentBuilder {
        AgentBuilder {
            source,
            prioritizer: Prioritizer::local_only(),
            booking: BookingSettings::default(),
            tuning: CycleTuning::default(),
            store: None,
            targets: Vec::new(),
            run: RunConfig::default(),
        }
    }

    /// Build an agent over the configured target store. Schedule settings from the
    /// config replace the stored ones.
    pub async fn from_config(
        config: &AgentConfig,
        source: Arc<dyn SourceClient>,
        remote: Option<Arc<dyn RemoteRanker>>,
    ) -> Result<Self> {
        let store = Arc::new(TargetStore::new(&config.targets_path));
        let StoredState { targets, mut run, .. } = store
            .load()
            .await
            .with_context(|| format!("loading targets from {}", config.targets_path.display()))?;
        config.apply_to(&mut run);

        let prioritizer = match remote {
            Some(remote) => Prioritizer::with_remote(remote),
            None => Prioritizer::local_only(),
        };
        Ok(Self::builder(source)
            .prioritizer(prioritizer)
            .booking(config.booking.clone())
            .tuning(config.tuning.clone())
            .store(store)
            .state(targets, run)
            .build())
    }

    pub fn activity(&self) -> &ActivityLog {
        &self.inner.activity
    }

    pub fn booking(&self) -> &BookingSettings {
        &self.inner.booking
    }

    pub fn targets(&self) -> Vec<Target> {
        self.inner.state.lock().targets.clone()
    }

    pub fn target(&self, id: TargetId) -> Option<Target> {
        self.inner.state.lock().target(id).cloned()
    }

    pub fn run_config(&self) -> RunConfig {
        self.inner.state.lock().run.clone()
    }

    /// Countdown derived from the recorded wake time; display only.
    pub fn seconds_until_next_run(&self, now: DateTime<Utc>) -> Option<i64> {
        let state = self.inner.state.lock();
        if state.run.global_status != GlobalStatus::Running {
            return None;
        }
        state
            .run
            .next_run_at
            .map(|at| (at - now).num_seconds().max(0))
    }

    pub async fn set_schedule(&self, poll_interval_secs: u64, poll_jitter_secs: u64, model: AgentModel) {
        let poll_interval_secs = poll_interval_secs.clamp(1, MAX_POLL_SECS);
        let poll_jitter_secs = poll_jitter_secs.min(MAX_POLL_SECS);
        {
            let mut state = self.inner.state.lock();
            state.run.poll_interval_seconds = poll_interval_secs;
            state.run.poll_jitter_seconds = poll_jitter_secs;
            state.run.agent_model = model;
        }
        self.inner.activity.info(
            None,
            format!("schedule updated: every {poll_interval_secs}s ±{poll_jitter_secs}s, model {model}"),
        );
        self.persist().await;
    }

    pub async fn add_target(&self, mut target: Target) -> Result<TargetId, AgentError> {
        if !target.window_is_valid() {
            return Err(AgentError::InvalidWindow);
        }
        target.status = TargetStatus::Stopped;
        target.found_date = None;
        target.pending_date = None;
        target.confirmation_id = None;
        target.reminder_sent = false;

        let id = {
            let mut state = self.inner.state.lock();
            if state.target(target.id).is_some() {
                target.id = Uuid::new_v4();
            }
            let id = target.id;
            state.targets.push(target.clone());
            id
        };
        self.inner
            .activity
            .success(Some(id), format!("target added: {}", target.display_name));
        self.persist().await;
        Ok(id)
    }

    pub async fn remove_target(&self, id: TargetId) -> Result<Target, AgentError> {
        let removed = {
            let mut state = self.inner.state.lock();
            if state.confirming.contains(&id) {
                return Err(AgentError::ConfirmationInFlight(id));
            }
            if state.is_busy(id) {
                return Err(AgentError::TargetBusy(id));
            }
            let index = state
                .targets
                .iter()
                .position(|t| t.id == id)
                .ok_or(AgentError::UnknownTarget(id))?;
            state.targets.remove(index)
        };
        self.inner
            .activity
            .warning(Some(id), format!("target removed: {}", removed.display_name));
        self.persist().await;
        Ok(removed)
    }

    pub async fn set_reminder(&self, id: TargetId, enabled: bool) -> Result<(), AgentError> {
        let name = {
            let mut state = self.inner.state.lock();
            let target = state.target_mut(id)?;
            target.reminder_set = enabled;
            target.display_name.clone()
        };
        let verb = if enabled { "set" } else { "cleared" };
        self.inner
            .activity
            .info(Some(id), format!("reminder {verb} for {name}"));
        self.persist().await;
        Ok(())
    }

    pub async fn start(&self) {
        let outcome = {
            let mut state = self.inner.state.lock();
            state.run.global_status = GlobalStatus::Running;
            state.apply_bulk(&LifecycleEvent::Start)
        };
        self.inner.activity.info(
            None,
            format!(
                "monitoring started ({} started, {} awaiting confirmation left as is)",
                outcome.changed, outcome.exempt
            ),
        );
        self.schedule_next(Some(self.inner.tuning.start_delay));
        self.persist().await;
    }

    pub async fn pause(&self) {
        let outcome = {
            let mut state = self.inner.state.lock();
            state.run.global_status = GlobalStatus::Paused;
            state.cancel_timer();
            state.apply_bulk(&LifecycleEvent::Pause)
        };
        self.inner
            .activity
            .warning(None, format!("monitoring paused ({} targets paused)", outcome.changed));
        self.persist().await;
    }

    pub async fn stop(&self) {
        let outcome = {
            let mut state = self.inner.state.lock();
            state.run.global_status = GlobalStatus::Stopped;
            state.cancel_timer();
            state.apply_bulk(&LifecycleEvent::Stop)
        };
        self.inner
            .activity
            .error(None, format!("monitoring stopped ({} targets stopped)", outcome.changed));
        self.persist().await;
    }

    /// Bulk variant of [`MonitoringAgent::set_target_status`], routed through the operator commands.
    pub async fn set_all_status(&self, status: TargetStatus) -> Result<(), AgentError> {
        match status {
            TargetStatus::Running => self.start().await,
            TargetStatus::Paused => self.pause().await,
            TargetStatus::Stopped => self.stop().await,
            other => return Err(AgentError::NotBulkStatus(other)),
        }
        Ok(())
    }

    /// Operator override for one target, limited to the legal lifecycle transitions.
    /// Requesting the current status is a no-op.
    pub async fn set_target_status(&self, id: TargetId, requested: TargetStatus) -> Result<TargetStatus, AgentError> {
        let (name, transition) = {
            let mut state = self.inner.state.lock();
            if state.confirming.contains(&id) {
                return Err(AgentError::ConfirmationInFlight(id));
            }
            if state.is_busy(id) {
                return Err(AgentError::TargetBusy(id));
            }
            let target = state.target_mut(id)?;
            if target.status == requested {
                return Ok(requested);
            }
            let event = LifecycleEvent::for_requested_status(target.status, requested)?;
            let transition = target.apply(event)?;
            (target.display_name.clone(), transition)
        };
        self.inner.activity.info(
            Some(id),
            format!("{name} status changed: {} -> {}", transition.from, transition.to),
        );
        self.persist().await;
        Ok(transition.to)
    }

    pub async fn cancel_confirmation(&self, id: TargetId) -> Result<(), AgentError> {
        let (name, _) = {
            let mut state = self.inner.state.lock();
            if state.confirming.contains(&id) {
                return Err(AgentError::ConfirmationInFlight(id));
            }
            state.apply(id, LifecycleEvent::ConfirmationCancelled)?
        };
        self.inner.activity.warning(
            Some(id),
            format!("confirmation cancelled for {name}; back to monitoring"),
        );
        self.persist().await;
        Ok(())
    }

    /// Resolve a held slot with the externally supplied confirmation code.
    pub async fn submit_confirmation(&self, id: TargetId, code: &str) -> Result<ConfirmationOutcome, AgentError> {
        let (target, date) = {
            let mut state = self.inner.state.lock();
            if state.confirming.contains(&id) {
                return Err(AgentError::ConfirmationInFlight(id));
            }
            let target = state.target(id).ok_or(AgentError::UnknownTarget(id))?;
            let date = match (target.status, target.pending_date) {
                (TargetStatus::AwaitingConfirmation, Some(date)) => date,
                (status, _) => return Err(AgentError::NotAwaitingConfirmation { id, status }),
            };
            let target = target.clone();
            state.confirming.insert(id);
            (target, date)
        };

        let activity = &self.inner.activity;
        activity.info(
            Some(id),
            format!("submitting confirmation code for {} ({date})", target.display_name),
        );

        let source = self.inner.source.as_ref();
        let target_ref = &target;
        let code = code.trim();
        let booking = self
            .inner
            .tuning
            .booking_retry
            .execute_with(
                move || source.book(target_ref, date, Some(code)),
                |err: &SourceError, n| {
                    activity.warning(Some(id), format!("booking attempt failed ({err}); retry {n}"))
                },
            )
            .await;

        let (event, outcome) = match booking {
            Ok(result) if result.success => (
                LifecycleEvent::Booked {
                    date,
                    confirmation_id: result.confirmation_id.clone(),
                },
                ConfirmationOutcome::Confirmed {
                    confirmation_id: result.confirmation_id,
                },
            ),
            Ok(result) => (
                LifecycleEvent::ConfirmationRejected,
                ConfirmationOutcome::Rejected {
                    error: result.error.unwrap_or_else(|| "booking rejected".to_string()),
                },
            ),
            Err(err) => (
                LifecycleEvent::ConfirmationRejected,
                ConfirmationOutcome::Rejected {
                    error: err.message().to_string(),
                },
            ),
        };

        let applied = {
            let mut state = self.inner.state.lock();
            state.confirming.remove(&id);
            state.apply(id, event)
        };

        match (&outcome, applied) {
            (ConfirmationOutcome::Confirmed { confirmation_id }, Ok(_)) => activity.success(
                Some(id),
                format!(
                    "booked {} on {date} (confirmation {})",
                    target.display_name,
                    confirmation_id.as_deref().unwrap_or("n/a")
                ),
            ),
            (ConfirmationOutcome::Rejected { error }, Ok(_)) => activity.error(
                Some(id),
                format!(
                    "booking failed for {} after confirmation: {error}; back to monitoring",
                    target.display_name
                ),
            ),
            (_, Err(err)) => {
                activity.error(
                    Some(id),
                    format!("could not record confirmation result for {}: {err}", target.display_name),
                );
                self.persist().await;
                return Err(err);
            }
        }

        self.persist().await;
        Ok(outcome)
    }

    /// Arm the one-shot timer for the next cycle, replacing any pending one.
    pub fn schedule_next(&self, initial_delay: Option<Duration>) -> DateTime<Utc> {
        let delay = match initial_delay {
            Some(delay) => delay,
            None => {
                let state = self.inner.state.lock();
                jittered_delay(state.run.poll_interval_seconds, state.run.poll_jitter_seconds)
            }
        };
        let delay = delay.min(Duration::from_secs(2 * MAX_POLL_SECS));
        let now = Utc::now();
        let wake_at = chrono::Duration::from_std(delay)
            .ok()
            .and_then(|d| now.checked_add_signed(d))
            .unwrap_or(now);

        let (generation, token) = self.inner.state.lock().arm_timer(wake_at);

        let agent = self.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = token.cancelled() => {
                    debug!(generation, "pending cycle cancelled");
                }
                _ = tokio::time::sleep(delay) => {
                    let current = agent.inner.state.lock().disarm_fired(generation);
                    if current {
                        agent.run_cycle().await;
                    }
                }
            }
        });

        self.inner
            .activity
            .info(None, format!("next check in {}s", delay.as_secs()));
        wake_at
    }

    /// One pass over the running targets. Cycles never overlap; a status change by the
    /// operator is honoured between targets, never in the middle of a probe or booking.
    pub async fn run_cycle(&self) -> CycleReport {
        let _cycle = self.inner.cycle_guard.lock().await;
        let cycle_id = Uuid::new_v4();
        let span = info_span!("cycle", %cycle_id);
        self.run_cycle_inner(cycle_id).instrument(span).await
    }

    async fn run_cycle_inner(&self, cycle_id: Uuid) -> CycleReport {
        let started_at = Utc::now();
        let activity = &self.inner.activity;
        activity.info(None, "availability check starting");

        let (running, model, initial_status) = {
            let state = self.inner.state.lock();
            (state.running_targets(), state.run.agent_model, state.run.global_status)
        };

        let mut report = CycleReport {
            cycle_id,
            started_at,
            finished_at: started_at,
            ranking: None,
            targets: Vec::new(),
            auto_paused: false,
            cancelled: false,
            rescheduled: false,
        };

        if running.is_empty() {
            if initial_status == GlobalStatus::Running {
                {
                    let mut state = self.inner.state.lock();
                    state.run.global_status = GlobalStatus::Paused;
                    state.cancel_timer();
                }
                report.auto_paused = true;
                activity.warning(None, "no running targets left; monitoring paused");
                self.persist().await;
            } else {
                activity.warning(None, "no running targets to check");
            }
            report.finished_at = Utc::now();
            return report;
        }

        let mut order: Vec<TargetId> = running.iter().map(|t| t.id).collect();
        let decision = self.inner.prioritizer.choose(model, &running, Utc::now()).await;
        if let Some(chosen) = decision.chosen {
            if let Some(pos) = order.iter().position(|id| *id == chosen) {
                let id = order.remove(pos);
                order.insert(0, id);
            }
            let name = running
                .iter()
                .find(|t| t.id == chosen)
                .map(|t| t.display_name.as_str())
                .unwrap_or_default();
            match &decision.mode {
                RankingMode::Remote => activity.info(Some(chosen), format!("AI prioritization picked {name}")),
                RankingMode::Local => activity.info(Some(chosen), format!("rule-based prioritization picked {name}")),
                RankingMode::Fallback { reason } => activity.warning(
                    Some(chosen),
                    format!("AI prioritization failed ({reason}); local scoring picked {name}"),
                ),
            }
        }
        report.ranking = Some(decision);

        for id in order.iter().copied() {
            let step = {
                let mut state = self.inner.state.lock();
                if state.run.global_status != initial_status {
                    NextStep::Stop
                } else {
                    match state.target(id).cloned() {
                        Some(t) if t.status == TargetStatus::Running => {
                            state.begin_flight(id);
                            NextStep::Probe(t)
                        }
                        Some(t) => NextStep::Skip(t.status),
                        None => NextStep::Skip(TargetStatus::Stopped),
                    }
                }
            };

            let target = match step {
                NextStep::Stop => {
                    report.cancelled = true;
                    activity.warning(None, "monitoring status changed; cycle stopped early");
                    break;
                }
                NextStep::Skip(status) => {
                    debug!(target_id = %id, %status, "target left the running pool, skipping");
                    report.targets.push(TargetReport {
                        target_id: id,
                        outcome: TargetOutcome::Skipped { status },
                    });
                    continue;
                }
                NextStep::Probe(target) => target,
            };

            let outcome = self.process_target(&target).await;
            let replayed = self.inner.state.lock().end_flight(id);
            if let Some(transition) = replayed {
                activity.info(
                    Some(id),
                    format!(
                        "{} status changed after its check: {} -> {}",
                        target.display_name, transition.from, transition.to
                    ),
                );
            }
            report.targets.push(TargetReport {
                target_id: id,
                outcome,
            });

            if !self.inner.tuning.pacing.is_zero() {
                tokio::time::sleep(self.inner.tuning.pacing).await;
            }
        }

        let still_running = self.inner.state.lock().run.global_status == GlobalStatus::Running;
        if still_running && !report.cancelled {
            self.schedule_next(None);
            report.rescheduled = true;
        }

        self.persist().await;
        report.finished_at = Utc::now();
        report
    }

    async fn process_target(&self, target: &Target) -> TargetOutcome {
        let activity = &self.inner.activity;
        let id = target.id;
        let name = target.display_name.as_str();
        activity.info(Some(id), format!("checking availability for {name}"));

        let source = self.inner.source.as_ref();
        let probe = self
            .inner
            .tuning
            .probe_retry
            .execute_with(
                move || source.probe(target),
                |err: &SourceError, n| activity.warning(Some(id), format!("probe for {name} failed ({err}); retry {n}")),
            )
            .await;

        let result = match probe {
            Ok(result) => result,
            Err(err) => {
                activity.error(Some(id), format!("probe failed for {name}: {err}"));
                return TargetOutcome::ProbeFailed {
                    error: err.message().to_string(),
                };
            }
        };

        let Some(date) = result.slot() else {
            activity.info(Some(id), result.message);
            return TargetOutcome::NoSlot;
        };
        activity.success(Some(id), result.message);

        if !self.inner.booking.enabled {
            return match self.record(id, LifecycleEvent::Booked { date, confirmation_id: None }) {
                Ok(()) => {
                    activity.warning(
                        Some(id),
                        format!("simulation mode: slot on {date} accepted for {name} without booking"),
                    );
                    TargetOutcome::Simulated { date }
                }
                Err(err) => self.unrecorded(id, name, date, err),
            };
        }

        if target.requires_confirmation() {
            return match self.record(id, LifecycleEvent::SlotHeld { date }) {
                Ok(()) => {
                    activity.warning(
                        Some(id),
                        format!("slot on {date} for {name} needs a confirmation code; booking suspended"),
                    );
                    TargetOutcome::AwaitingConfirmation { date }
                }
                Err(err) => self.unrecorded(id, name, date, err),
            };
        }

        activity.info(Some(id), format!("booking slot on {date} for {name}"));
        let booking = self
            .inner
            .tuning
            .booking_retry
            .execute_with(
                move || source.book(target, date, None),
                |err: &SourceError, n| activity.warning(Some(id), format!("booking for {name} failed ({err}); retry {n}")),
            )
            .await;

        match booking {
            Ok(result) if result.success => {
                let confirmation_id = result.confirmation_id;
                match self.record(
                    id,
                    LifecycleEvent::Booked {
                        date,
                        confirmation_id: confirmation_id.clone(),
                    },
                ) {
                    Ok(()) => {
                        activity.success(
                            Some(id),
                            format!(
                                "booked {name} on {date} (confirmation {})",
                                confirmation_id.as_deref().unwrap_or("n/a")
                            ),
                        );
                        TargetOutcome::Booked { date, confirmation_id }
                    }
                    Err(err) => self.unrecorded(id, name, date, err),
                }
            }
            Ok(result) => {
                let error = result.error.unwrap_or_else(|| "booking rejected".to_string());
                activity.error(Some(id), format!("booking failed for {name}: {error}"));
                TargetOutcome::BookingFailed { date, error }
            }
            Err(err) => {
                activity.error(Some(id), format!("booking failed for {name}: {err}"));
                TargetOutcome::BookingFailed {
                    date,
                    error: err.message().to_string(),
                }
            }
        }
    }

    fn record(&self, id: TargetId, event: LifecycleEvent) -> Result<(), AgentError> {
        self.inner.state.lock().apply(id, event).map(|_| ())
    }

    /// The lifecycle refused the transition for a found slot.
    fn unrecorded(&self, id: TargetId, name: &str, date: NaiveDate, err: AgentError) -> TargetOutcome {
        self.inner
            .activity
            .error(Some(id), format!("slot on {date} for {name} could not be recorded: {err}"));
        let status = self
            .target(id)
            .map(|t| t.status)
            .unwrap_or(TargetStatus::Stopped);
        TargetOutcome::Skipped { status }
    }

    /// Flag completed bookings coming up within [`REMINDER_LEAD_DAYS`] and emit one reminder each.
    pub async fn send_due_reminders(&self, today: NaiveDate) -> Vec<TargetId> {
        let due: Vec<(TargetId, String, NaiveDate)> = {
            let mut state = self.inner.state.lock();
            state
                .targets
                .iter_mut()
                .filter(|t| t.status == TargetStatus::Completed && t.reminder_set && !t.reminder_sent)
                .filter_map(|t| {
                    let date = t.found_date?;
                    let days = (date - today).num_days();
                    if (0..=REMINDER_LEAD_DAYS).contains(&days) {
                        t.reminder_sent = true;
                        Some((t.id, t.display_name.clone(), date))
                    } else {
                        None
                    }
                })
                .collect()
        };

        for (id, name, date) in &due {
            self.inner
                .activity
                .success(Some(*id), format!("reminder: {name} has an appointment on {date}"));
        }
        if !due.is_empty() {
            self.persist().await;
        }
        due.into_iter().map(|(id, _, _)| id).collect()
    }

    pub async fn build_reminder_scheduler(&self, cron: &str) -> Result<JobScheduler> {
        let sched = JobScheduler::new().await.context("creating reminder scheduler")?;
        let agent = self.clone();
        let job = Job::new_async(cron, move |_uuid, _l| {
            let agent = agent.clone();
            Box::pin(async move {
                let sent = agent.send_due_reminders(Utc::now().date_naive()).await;
                debug!(count = sent.len(), "reminder sweep finished");
            })
        })
        .with_context(|| format!("creating reminder job for cron {cron}"))?;
        sched.add(job).await.context("adding reminder job")?;
        Ok(sched)
    }

    pub async fn persist(&self) {
        let Some(store) = &self.inner.store else {
            return;
        };
        let snapshot = self.inner.state.lock().snapshot();
        if let Err(err) = store.save(&snapshot).await {
            warn!(error = %err, path = %store.path().display(), "failed to persist targets");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use chrono::Days;
    use serde_json::{json, Value as JsonValue};
    use slotwatch_adapters::RankError;
    use slotwatch_core::{BookingResult, ProbeResult};
    use std::collections::HashMap;
    use std::sync::Mutex as StdMutex;
    use tokio::sync::Notify;

    #[derive(Debug, Clone, PartialEq)]
    enum Call {
        Probe(TargetId),
        Book(TargetId, Option<String>),
    }

    #[derive(Default)]
    struct ScriptedSource {
        probes: StdMutex<HashMap<TargetId, VecDeque<Result<ProbeResult, SourceError>>>>,
        bookings: StdMutex<VecDeque<Result<BookingResult, SourceError>>>,
        calls: StdMutex<Vec<Call>>,
    }

    impl ScriptedSource {
        fn probe_returns(&self, id: TargetId, result: Result<ProbeResult, SourceError>) {
            self.probes.lock().unwrap().entry(id).or_default().push_back(result);
        }

        fn book_returns(&self, result: Result<BookingResult, SourceError>) {
            self.bookings.lock().unwrap().push_back(result);
        }

        fn calls(&self) -> Vec<Call> {
            self.calls.lock().unwrap().clone()
        }

        fn probed(&self) -> Vec<TargetId> {
            self.calls()
                .into_iter()
                .filter_map(|c| match c {
                    Call::Probe(id) => Some(id),
                    Call::Book(..) => None,
                })
                .collect()
        }

        fn bookings_made(&self) -> usize {
            self.calls().iter().filter(|c| matches!(c, Call::Book(..))).count()
        }
    }

    #[async_trait]
    impl SourceClient for ScriptedSource {
        fn name(&self) -> &'static str {
            "scripted"
        }

        async fn probe(&self, target: &Target) -> Result<ProbeResult, SourceError> {
            self.calls.lock().unwrap().push(Call::Probe(target.id));
            self.probes
                .lock()
                .unwrap()
                .get_mut(&target.id)
                .and_then(|q| q.pop_front())
                .unwrap_or_else(|| Ok(ProbeResult::not_found(format!("nothing for {}", target.display_name))))
        }

        async fn book(
            &self,
            target: &Target,
            _date: NaiveDate,
            confirmation_code: Option<&str>,
        ) -> Result<BookingResult, SourceError> {
            self.calls
                .lock()
                .unwrap()
                .push(Call::Book(target.id, confirmation_code.map(str::to_string)));
            self.bookings
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Ok(BookingResult::confirmed("CONF-TEST")))
        }
    }

    struct FixedRanker(JsonValue);

    #[async_trait]
    impl RemoteRanker for FixedRanker {
        fn name(&self) -> &'static str {
            "fixed"
        }

        async fn rank(&self, _candidates: &[RankCandidate]) -> Result<JsonValue, RankError> {
            Ok(self.0.clone())
        }
    }

    struct PanickingRanker;

    #[async_trait]
    impl RemoteRanker for PanickingRanker {
        fn name(&self) -> &'static str {
            "panicking"
        }

        async fn rank(&self, _candidates: &[RankCandidate]) -> Result<JsonValue, RankError> {
            panic!("model crashed");
        }
    }

    fn today() -> NaiveDate {
        Utc::now().date_naive()
    }

    fn in_days(days: u64) -> NaiveDate {
        today().checked_add_days(Days::new(days)).unwrap()
    }

    fn running(name: &str) -> Target {
        let mut target = Target::new(name).with_route("NL", "embassy", "Bursa", "Bursa");
        target.status = TargetStatus::Running;
        target
    }

    fn running_run_config(model: AgentModel) -> RunConfig {
        RunConfig {
            agent_model: model,
            global_status: GlobalStatus::Running,
            ..RunConfig::default()
        }
    }

    fn agent_with(source: Arc<ScriptedSource>, targets: Vec<Target>, model: AgentModel) -> MonitoringAgent {
        MonitoringAgent::builder(source)
            .tuning(CycleTuning::without_pacing())
            .state(targets, running_run_config(model))
            .build()
    }

    fn booking_on() -> BookingSettings {
        BookingSettings {
            enabled: true,
            api_token: Some("token".into()),
            ..BookingSettings::default()
        }
    }

    #[test]
    fn local_ranking_prefers_urgent_business_in_top_city() {
        let now = Utc::now();
        let b = running("B")
            .with_route("FR", "vfs", "Bursa", "Bursa")
            .with_visa_type("tourism")
            .with_window(None, Some(in_days(60)));
        let a = running("A")
            .with_route("DE", "idata", "Istanbul", "Istanbul (Avrupa)")
            .with_visa_type("business")
            .with_window(None, Some(in_days(1)));
        let targets = vec![b, a.clone()];

        assert_eq!(rank_locally(&targets, now).map(|t| t.id), Some(a.id));
        for _ in 0..5 {
            assert_eq!(rank_locally(&targets, now).map(|t| t.id), Some(a.id));
        }
    }

    #[test]
    fn earlier_deadline_never_scores_lower() {
        let now = Utc::now();
        let sooner = running("sooner").with_window(None, Some(in_days(3)));
        let later = running("later").with_window(None, Some(in_days(40)));
        assert!(local_score(&sooner, now) >= local_score(&later, now));
        assert_eq!(urgency(None, now), 1.0);
        assert_eq!(urgency(Some(in_days(400)), now), 0.0);
    }

    #[test]
    fn ties_keep_input_order() {
        let now = Utc::now();
        let first = running("first");
        let second = running("second");
        let targets = vec![first.clone(), second];
        assert_eq!(rank_locally(&targets, now).map(|t| t.id), Some(first.id));
        assert!(rank_locally(&[], now).is_none());
    }

    #[test]
    fn weights_are_case_insensitive() {
        assert_eq!(visa_type_weight("Business"), 10.0);
        assert_eq!(visa_type_weight("medical"), 1.0);
        assert_eq!(city_weight("ISTANBUL"), 10.0);
        assert_eq!(city_weight("Trabzon"), 3.0);
    }

    #[test]
    fn jitter_is_capped_for_huge_settings() {
        assert!(jittered_delay(u64::MAX, u64::MAX) <= Duration::from_secs(2 * MAX_POLL_SECS));
        assert_eq!(jittered_delay(u64::MAX, 0), Duration::from_secs(MAX_POLL_SECS));
    }

    #[test]
    fn jitter_stays_within_bounds() {
        for _ in 0..200 {
            let delay = jittered_delay(100, 10);
            assert!(delay >= Duration::from_secs(90) && delay <= Duration::from_secs(110));
        }
        for _ in 0..50 {
            assert!(jittered_delay(5, 30) <= Duration::from_secs(35));
        }
        assert_eq!(jittered_delay(120, 0), Duration::from_secs(120));
    }

    #[tokio::test]
    async fn remote_failure_falls_back_to_local_scoring() {
        let now = Utc::now();
        let low = running("low").with_visa_type("tourism");
        let high = running("high").with_visa_type("business");
        let targets = vec![low, high.clone()];

        let rankers: Vec<Arc<dyn RemoteRanker>> = vec![
            Arc::new(FixedRanker(json!({ "chosenId": Uuid::new_v4().to_string() }))),
            Arc::new(FixedRanker(json!("not an object"))),
            Arc::new(PanickingRanker),
        ];
        for ranker in rankers {
            let decision = Prioritizer::with_remote(ranker)
                .choose(AgentModel::Hybrid, &targets, now)
                .await;
            assert_eq!(decision.chosen, Some(high.id));
            assert!(matches!(decision.mode, RankingMode::Fallback { .. }));
        }
    }

    #[tokio::test]
    async fn rule_model_never_consults_remote() {
        let first = running("first");
        let second = running("second").with_visa_type("business");
        let ranker = Arc::new(FixedRanker(json!({ "chosenId": first.id.to_string() })));
        let decision = Prioritizer::with_remote(ranker)
            .choose(AgentModel::Rule, &[first, second.clone()], Utc::now())
            .await;
        assert_eq!(decision, RankingDecision { chosen: Some(second.id), mode: RankingMode::Local });
    }

    #[tokio::test(start_paused = true)]
    async fn cycle_only_probes_running_targets() {
        let source = Arc::new(ScriptedSource::default());
        let live = running("live");
        let mut stopped = running("stopped");
        stopped.status = TargetStatus::Stopped;
        let mut paused = running("paused");
        paused.status = TargetStatus::Paused;
        let mut held = running("held");
        held.status = TargetStatus::AwaitingConfirmation;
        held.pending_date = Some(in_days(5));
        let mut done = running("done");
        done.status = TargetStatus::Completed;
        done.found_date = Some(in_days(2));

        let agent = agent_with(
            source.clone(),
            vec![stopped, paused, held, done, live.clone()],
            AgentModel::Rule,
        );
        let report = agent.run_cycle().await;

        assert_eq!(source.probed(), vec![live.id]);
        assert_eq!(source.bookings_made(), 0);
        assert_eq!(report.targets.len(), 1);
        assert_eq!(report.targets[0].outcome, TargetOutcome::NoSlot);
        assert!(report.rescheduled);
        assert!(agent.run_config().next_run_at.is_some());
        agent.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn empty_pool_pauses_and_does_not_reschedule() {
        let source = Arc::new(ScriptedSource::default());
        let mut idle = running("idle");
        idle.status = TargetStatus::Stopped;
        let agent = agent_with(source.clone(), vec![idle], AgentModel::Hybrid);

        let report = agent.run_cycle().await;

        assert!(report.auto_paused);
        assert!(!report.rescheduled);
        let run = agent.run_config();
        assert_eq!(run.global_status, GlobalStatus::Paused);
        assert_eq!(run.next_run_at, None);
        assert!(source.calls().is_empty());
        assert!(agent
            .activity()
            .recent()
            .iter()
            .any(|e| e.severity == Severity::Warning && e.message.contains("paused")));
    }

    #[tokio::test(start_paused = true)]
    async fn rule_model_probes_urgent_target_first() {
        let source = Arc::new(ScriptedSource::default());
        let b = running("B")
            .with_visa_type("tourism")
            .with_window(None, Some(in_days(60)));
        let a = running("A")
            .with_route("DE", "idata", "Istanbul", "Istanbul (Asya)")
            .with_visa_type("business")
            .with_window(None, Some(in_days(1)));
        let agent = agent_with(source.clone(), vec![b.clone(), a.clone()], AgentModel::Rule);

        let report = agent.run_cycle().await;

        assert_eq!(source.probed(), vec![a.id, b.id]);
        assert_eq!(report.ranking.unwrap().mode, RankingMode::Local);
        agent.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn remote_choice_moves_to_front_and_keeps_the_rest_in_order() {
        let source = Arc::new(ScriptedSource::default());
        let one = running("one");
        let two = running("two");
        let three = running("three");
        let ranker = Arc::new(FixedRanker(json!({ "chosenId": three.id.to_string() })));
        let agent = MonitoringAgent::builder(source.clone())
            .prioritizer(Prioritizer::with_remote(ranker))
            .tuning(CycleTuning::without_pacing())
            .state(
                vec![one.clone(), two.clone(), three.clone()],
                running_run_config(AgentModel::AiHeuristic),
            )
            .build();

        agent.run_cycle().await;

        assert_eq!(source.probed(), vec![three.id, one.id, two.id]);
        agent.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn booking_disabled_completes_without_booking() {
        let source = Arc::new(ScriptedSource::default());
        let target = running("sim");
        let slot = in_days(9);
        source.probe_returns(target.id, Ok(ProbeResult::found(slot, "slot!")));
        let agent = agent_with(source.clone(), vec![target.clone()], AgentModel::Rule);

        let report = agent.run_cycle().await;

        let after = agent.target(target.id).unwrap();
        assert_eq!(after.status, TargetStatus::Completed);
        assert_eq!(after.found_date, Some(slot));
        assert_eq!(source.bookings_made(), 0);
        assert_eq!(report.targets[0].outcome, TargetOutcome::Simulated { date: slot });
    }

    #[tokio::test(start_paused = true)]
    async fn confirmation_portal_suspends_then_completes() {
        let source = Arc::new(ScriptedSource::default());
        let target = running("held")
            .with_route("ES", "vfs", "Ankara", "Ankara")
            .with_credentials("user", "pw");
        let slot = in_days(12);
        source.probe_returns(target.id, Ok(ProbeResult::found(slot, "slot!")));
        source.book_returns(Ok(BookingResult::confirmed("CONF-42")));

        let agent = MonitoringAgent::builder(source.clone())
            .booking(booking_on())
            .tuning(CycleTuning::without_pacing())
            .state(vec![target.clone()], running_run_config(AgentModel::Rule))
            .build();

        agent.run_cycle().await;
        let held = agent.target(target.id).unwrap();
        assert_eq!(held.status, TargetStatus::AwaitingConfirmation);
        assert_eq!(held.pending_date, Some(slot));
        assert_eq!(held.found_date, None);
        assert_eq!(source.bookings_made(), 0);

        agent.start().await;
        assert_eq!(
            agent.target(target.id).unwrap().status,
            TargetStatus::AwaitingConfirmation,
            "bulk start leaves held slots alone"
        );

        let outcome = agent.submit_confirmation(target.id, "123456").await.unwrap();
        assert_eq!(
            outcome,
            ConfirmationOutcome::Confirmed {
                confirmation_id: Some("CONF-42".into())
            }
        );
        let done = agent.target(target.id).unwrap();
        assert_eq!(done.status, TargetStatus::Completed);
        assert_eq!(done.found_date, Some(slot));
        assert_eq!(done.confirmation_id.as_deref(), Some("CONF-42"));
        assert!(source
            .calls()
            .contains(&Call::Book(target.id, Some("123456".into()))));
        agent.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn rejected_confirmation_returns_target_to_pool() {
        let source = Arc::new(ScriptedSource::default());
        let mut target = running("held").with_route("CH", "tlscontact", "Ankara", "Ankara");
        target.status = TargetStatus::AwaitingConfirmation;
        target.pending_date = Some(in_days(4));
        source.book_returns(Ok(BookingResult::rejected("slot gone")));

        let agent = MonitoringAgent::builder(source.clone())
            .booking(booking_on())
            .tuning(CycleTuning::without_pacing())
            .state(vec![target.clone()], running_run_config(AgentModel::Rule))
            .build();

        let outcome = agent.submit_confirmation(target.id, "999999").await.unwrap();
        assert_eq!(outcome, ConfirmationOutcome::Rejected { error: "slot gone".into() });
        let after = agent.target(target.id).unwrap();
        assert_eq!(after.status, TargetStatus::Running);
        assert_eq!(after.pending_date, None);

        let err = agent.submit_confirmation(target.id, "999999").await.unwrap_err();
        assert!(matches!(err, AgentError::NotAwaitingConfirmation { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn permanent_booking_failure_keeps_running_and_moves_on() {
        let source = Arc::new(ScriptedSource::default());
        let first = running("first").with_visa_type("business");
        let second = running("second");
        let slot = in_days(20);
        source.probe_returns(first.id, Ok(ProbeResult::found(slot, "slot!")));
        source.book_returns(Err(SourceError::permanent("API token is missing")));

        let agent = MonitoringAgent::builder(source.clone())
            .booking(booking_on())
            .tuning(CycleTuning::without_pacing())
            .state(vec![first.clone(), second.clone()], running_run_config(AgentModel::Rule))
            .build();

        let report = agent.run_cycle().await;

        assert_eq!(source.bookings_made(), 1, "permanent failures are not retried");
        assert_eq!(agent.target(first.id).unwrap().status, TargetStatus::Running);
        assert_eq!(source.probed(), vec![first.id, second.id]);
        assert!(matches!(report.targets[0].outcome, TargetOutcome::BookingFailed { .. }));
        agent.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn direct_booking_records_confirmation_id() {
        let source = Arc::new(ScriptedSource::default());
        let target = running("direct");
        let slot = in_days(7);
        source.probe_returns(target.id, Ok(ProbeResult::found(slot, "slot!")));
        source.book_returns(Err(SourceError::transient("500 Internal Server Error")));
        source.book_returns(Ok(BookingResult::confirmed("CONF-7")));

        let agent = MonitoringAgent::builder(source.clone())
            .booking(booking_on())
            .tuning(CycleTuning::without_pacing())
            .state(vec![target.clone()], running_run_config(AgentModel::Rule))
            .build();

        let report = agent.run_cycle().await;

        assert_eq!(source.bookings_made(), 2);
        assert_eq!(
            report.targets[0].outcome,
            TargetOutcome::Booked {
                date: slot,
                confirmation_id: Some("CONF-7".into())
            }
        );
        let after = agent.target(target.id).unwrap();
        assert_eq!(after.status, TargetStatus::Completed);
        assert_eq!(after.confirmation_id.as_deref(), Some("CONF-7"));
    }

    #[tokio::test(start_paused = true)]
    async fn transient_probe_errors_are_retried_then_logged() {
        let source = Arc::new(ScriptedSource::default());
        let target = running("flaky");
        for _ in 0..3 {
            source.probe_returns(target.id, Err(SourceError::transient("503")));
        }
        let agent = agent_with(source.clone(), vec![target.clone()], AgentModel::Rule);

        let report = agent.run_cycle().await;

        assert_eq!(source.probed().len(), 3);
        assert_eq!(
            report.targets[0].outcome,
            TargetOutcome::ProbeFailed { error: "503".into() }
        );
        assert_eq!(agent.target(target.id).unwrap().status, TargetStatus::Running);
        assert!(report.rescheduled, "a failed probe never stops the agent");
        agent.stop().await;
    }

    struct GatedSource {
        started: Notify,
        release: Notify,
        probes: StdMutex<Vec<TargetId>>,
    }

    #[async_trait]
    impl SourceClient for GatedSource {
        fn name(&self) -> &'static str {
            "gated"
        }

        async fn probe(&self, target: &Target) -> Result<ProbeResult, SourceError> {
            self.probes.lock().unwrap().push(target.id);
            self.started.notify_one();
            self.release.notified().await;
            Ok(ProbeResult::not_found("nothing"))
        }

        async fn book(&self, _: &Target, _: NaiveDate, _: Option<&str>) -> Result<BookingResult, SourceError> {
            Ok(BookingResult::confirmed("CONF"))
        }
    }

    #[tokio::test(start_paused = true)]
    async fn pause_is_observed_between_targets() {
        let source = Arc::new(GatedSource {
            started: Notify::new(),
            release: Notify::new(),
            probes: StdMutex::new(Vec::new()),
        });
        let first = running("first").with_visa_type("business");
        let second = running("second");
        let agent = MonitoringAgent::builder(source.clone())
            .tuning(CycleTuning::without_pacing())
            .state(vec![first.clone(), second], running_run_config(AgentModel::Rule))
            .build();

        let cycle = tokio::spawn({
            let agent = agent.clone();
            async move { agent.run_cycle().await }
        });
        source.started.notified().await;
        agent.pause().await;
        source.release.notify_one();
        let report = cycle.await.unwrap();

        assert_eq!(*source.probes.lock().unwrap(), vec![first.id]);
        assert!(report.cancelled);
        assert!(!report.rescheduled);
        assert_eq!(agent.run_config().next_run_at, None);
        assert_eq!(
            agent.target(first.id).unwrap().status,
            TargetStatus::Paused,
            "pause reaches the checked target once its probe is recorded"
        );
    }

    struct GatedBooking {
        slot: NaiveDate,
        booking_started: Notify,
        release: Notify,
        books: StdMutex<usize>,
    }

    #[async_trait]
    impl SourceClient for GatedBooking {
        fn name(&self) -> &'static str {
            "gated-booking"
        }

        async fn probe(&self, _: &Target) -> Result<ProbeResult, SourceError> {
            Ok(ProbeResult::found(self.slot, "slot!"))
        }

        async fn book(&self, _: &Target, _: NaiveDate, _: Option<&str>) -> Result<BookingResult, SourceError> {
            *self.books.lock().unwrap() += 1;
            self.booking_started.notify_one();
            self.release.notified().await;
            Ok(BookingResult::confirmed("CONF-HELD"))
        }
    }

    #[tokio::test(start_paused = true)]
    async fn pause_during_booking_keeps_the_accepted_booking() {
        let slot = in_days(15);
        let source = Arc::new(GatedBooking {
            slot,
            booking_started: Notify::new(),
            release: Notify::new(),
            books: StdMutex::new(0),
        });
        let first = running("first").with_visa_type("business");
        let second = running("second");
        let agent = MonitoringAgent::builder(source.clone())
            .booking(booking_on())
            .tuning(CycleTuning::without_pacing())
            .state(vec![first.clone(), second.clone()], running_run_config(AgentModel::Rule))
            .build();

        let cycle = tokio::spawn({
            let agent = agent.clone();
            async move { agent.run_cycle().await }
        });
        source.booking_started.notified().await;
        agent.pause().await;

        assert_eq!(agent.target(first.id).unwrap().status, TargetStatus::Running);
        assert_eq!(agent.target(second.id).unwrap().status, TargetStatus::Paused);
        assert!(matches!(
            agent.set_target_status(first.id, TargetStatus::Stopped).await,
            Err(AgentError::TargetBusy(_))
        ));
        assert!(matches!(agent.remove_target(first.id).await, Err(AgentError::TargetBusy(_))));

        source.release.notify_one();
        let report = cycle.await.unwrap();

        assert_eq!(*source.books.lock().unwrap(), 1);
        assert_eq!(
            report.targets[0].outcome,
            TargetOutcome::Booked {
                date: slot,
                confirmation_id: Some("CONF-HELD".into())
            }
        );
        let booked = agent.target(first.id).unwrap();
        assert_eq!(booked.status, TargetStatus::Completed);
        assert_eq!(booked.found_date, Some(slot));
        assert_eq!(booked.confirmation_id.as_deref(), Some("CONF-HELD"));
        assert_eq!(agent.run_config().global_status, GlobalStatus::Paused);

        agent.start().await;
        assert_eq!(agent.target(first.id).unwrap().status, TargetStatus::Completed);
        agent.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_confirmation_returns_held_target_to_pool() {
        let source = Arc::new(ScriptedSource::default());
        let mut held = running("held").with_route("IT", "vfs", "Izmir", "Izmir");
        held.status = TargetStatus::AwaitingConfirmation;
        held.pending_date = Some(in_days(6));
        let agent = agent_with(source.clone(), vec![held.clone()], AgentModel::Rule);

        agent.cancel_confirmation(held.id).await.unwrap();

        let after = agent.target(held.id).unwrap();
        assert_eq!(after.status, TargetStatus::Running);
        assert_eq!(after.pending_date, None);
        assert_eq!(after.found_date, None);
        assert!(matches!(
            agent.cancel_confirmation(held.id).await,
            Err(AgentError::Transition(TransitionError::Illegal { .. }))
        ));

        agent.run_cycle().await;
        assert_eq!(source.probed(), vec![held.id]);
        agent.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn pause_and_stop_leave_held_targets_alone() {
        let source = Arc::new(ScriptedSource::default());
        let pending = in_days(3);
        let mut held = running("held").with_route("FR", "tlscontact", "Istanbul", "Istanbul");
        held.status = TargetStatus::AwaitingConfirmation;
        held.pending_date = Some(pending);
        let other = running("other");
        let agent = agent_with(source, vec![held.clone(), other.clone()], AgentModel::Rule);

        agent.pause().await;
        let after_pause = agent.target(held.id).unwrap();
        assert_eq!(after_pause.status, TargetStatus::AwaitingConfirmation);
        assert_eq!(after_pause.pending_date, Some(pending));
        assert_eq!(agent.target(other.id).unwrap().status, TargetStatus::Paused);

        agent.stop().await;
        let after_stop = agent.target(held.id).unwrap();
        assert_eq!(after_stop.status, TargetStatus::AwaitingConfirmation);
        assert_eq!(after_stop.pending_date, Some(pending));
        assert_eq!(agent.target(other.id).unwrap().status, TargetStatus::Stopped);
    }

    #[tokio::test(start_paused = true)]
    async fn oversized_poll_interval_is_capped() {
        let source = Arc::new(ScriptedSource::default());
        let run = RunConfig {
            poll_interval_seconds: 1_000_000_000_000_000,
            poll_jitter_seconds: u64::MAX,
            ..running_run_config(AgentModel::Rule)
        };
        let agent = MonitoringAgent::builder(source)
            .tuning(CycleTuning::without_pacing())
            .state(vec![running("t")], run)
            .build();

        let before = Utc::now();
        let wake_at = agent.schedule_next(None);
        let cap = chrono::Duration::seconds(2 * MAX_POLL_SECS as i64 + 60);
        assert!(wake_at <= before + cap);
        assert_eq!(agent.run_config().next_run_at, Some(wake_at));
        agent.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn pause_twice_equals_pause_once() {
        let source = Arc::new(ScriptedSource::default());
        let agent = agent_with(source, vec![running("a"), running("b")], AgentModel::Rule);
        agent.start().await;

        agent.pause().await;
        let once = (agent.targets(), agent.run_config());
        agent.pause().await;
        let twice = (agent.targets(), agent.run_config());

        assert_eq!(once, twice);
        assert_eq!(once.1.global_status, GlobalStatus::Paused);
        assert!(once.0.iter().all(|t| t.status == TargetStatus::Paused));
    }

    #[tokio::test(start_paused = true)]
    async fn start_runs_first_cycle_after_short_delay_and_stop_cancels() {
        let source = Arc::new(ScriptedSource::default());
        let mut target = running("t");
        target.status = TargetStatus::Stopped;
        let agent = MonitoringAgent::builder(source.clone())
            .tuning(CycleTuning::without_pacing())
            .state(vec![target.clone()], RunConfig::default())
            .build();

        agent.start().await;
        let countdown = agent.seconds_until_next_run(Utc::now()).unwrap();
        assert!(countdown <= 5);
        tokio::time::sleep(Duration::from_secs(6)).await;
        assert_eq!(source.probed(), vec![target.id]);

        agent.stop().await;
        assert_eq!(agent.run_config().next_run_at, None);
        assert_eq!(agent.seconds_until_next_run(Utc::now()), None);
        tokio::time::sleep(Duration::from_secs(600)).await;
        assert_eq!(source.probed().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn operator_overrides_follow_the_lifecycle() {
        let source = Arc::new(ScriptedSource::default());
        let mut target = running("t");
        target.status = TargetStatus::Stopped;
        let agent = agent_with(source, vec![target.clone()], AgentModel::Rule);

        assert_eq!(
            agent.set_target_status(target.id, TargetStatus::Running).await.unwrap(),
            TargetStatus::Running
        );
        assert!(matches!(
            agent.set_target_status(target.id, TargetStatus::Completed).await,
            Err(AgentError::Transition(TransitionError::NotOperatorSettable { .. }))
        ));
        assert!(matches!(
            agent.set_target_status(Uuid::new_v4(), TargetStatus::Paused).await,
            Err(AgentError::UnknownTarget(_))
        ));
        assert!(matches!(
            agent.set_all_status(TargetStatus::AwaitingConfirmation).await,
            Err(AgentError::NotBulkStatus(_))
        ));
    }

    #[tokio::test]
    async fn reminders_fire_once_for_upcoming_bookings() {
        let source = Arc::new(ScriptedSource::default());
        let mut soon = running("soon");
        soon.status = TargetStatus::Completed;
        soon.found_date = Some(in_days(1));
        soon.reminder_set = true;
        let mut far = soon.clone();
        far.id = Uuid::new_v4();
        far.found_date = Some(in_days(30));

        let agent = agent_with(source, vec![soon.clone(), far], AgentModel::Rule);

        assert_eq!(agent.send_due_reminders(today()).await, vec![soon.id]);
        assert!(agent.target(soon.id).unwrap().reminder_sent);
        assert!(agent.send_due_reminders(today()).await.is_empty());
    }

    #[tokio::test]
    async fn added_targets_persist_through_the_store() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = Arc::new(TargetStore::new(dir.path().join("targets.json")));
        let agent = MonitoringAgent::builder(Arc::new(ScriptedSource::default()))
            .store(store.clone())
            .build();

        let mut incoming = Target::new("new").with_window(Some(in_days(1)), Some(in_days(10)));
        incoming.status = TargetStatus::Completed;
        incoming.found_date = Some(in_days(2));
        let id = agent.add_target(incoming).await.unwrap();

        let stored = store.load().await.unwrap();
        assert_eq!(stored.targets.len(), 1);
        assert_eq!(stored.targets[0].id, id);
        assert_eq!(stored.targets[0].status, TargetStatus::Stopped);
        assert_eq!(stored.targets[0].found_date, None);

        let bad = Target::new("bad").with_window(Some(in_days(10)), Some(in_days(1)));
        assert!(matches!(agent.add_target(bad).await, Err(AgentError::InvalidWindow)));

        agent.remove_target(id).await.unwrap();
        assert!(store.load().await.unwrap().targets.is_empty());
    }

    #[test]
    fn yaml_overrides_replace_env_values() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("slotwatch.yaml");
        std::fs::write(
            &path,
            "poll_interval_secs: 45\nagent_model: rule\nbooking_enabled: true\napi_token: abc\n",
        )
        .unwrap();

        let config = AgentConfig::default().with_yaml_overrides(&path).unwrap();
        assert_eq!(config.poll_interval_secs, 45);
        assert_eq!(config.poll_jitter_secs, 30);
        assert_eq!(config.agent_model, AgentModel::Rule);
        assert!(config.booking.enabled);
        assert_eq!(config.booking.api_token.as_deref(), Some("abc"));

        std::fs::write(&path, "poll_every: 3\n").unwrap();
        assert!(AgentConfig::default().with_yaml_overrides(&path).is_err());

        for bad in ["poll_interval_secs: 1000000000000000\n", "poll_interval_secs: 0\n", "poll_jitter_secs: 99999999\n"] {
            std::fs::write(&path, bad).unwrap();
            assert!(AgentConfig::default().with_yaml_overrides(&path).is_err(), "{bad}");
        }
    }
}
