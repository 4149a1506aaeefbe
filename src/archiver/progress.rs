use crate::archiver::config::ProgressConfig;
use crate::archiver::util::format_rate;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StepStatus {
    #[default]
    Pending,
    Running,
    Done,
    Error,
    Skipped,
}

impl StepStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Done => "done",
            Self::Error => "error",
            Self::Skipped => "skipped",
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StepState {
    pub status: StepStatus,
    pub message: String,
}

impl StepState {
    pub fn new(status: StepStatus, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }
}

/// One tick of a long-running sub-operation.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ProgressEvent {
    pub message: String,
    pub percent: Option<f64>,
    pub bytes_per_sec: Option<f64>,
}

/// Receives step transitions and progress ticks from a running item.
pub trait PipelineObserver {
    fn step(&mut self, name: &str, state: &StepState);

    fn progress(&mut self, _name: &str, _event: &ProgressEvent) {}
}

/// Bounded window of `(time, bytes)` samples.
///
/// The rate is measured from an anchor sample to the newest one. The anchor
/// is the most recent sample at least `anchor` older than the newest, or the
/// oldest sample while the window is still shorter than that.
#[derive(Debug, Clone)]
pub struct RateEstimator {
    samples: VecDeque<(Instant, u64)>,
    capacity: usize,
    anchor: Duration,
}

impl RateEstimator {
    pub fn new(capacity: usize, anchor: Duration) -> Self {
        Self {
            samples: VecDeque::with_capacity(capacity.max(2)),
            capacity: capacity.max(2),
            anchor,
        }
    }

    pub fn from_config(cfg: &ProgressConfig) -> Self {
        Self::new(cfg.window_samples, Duration::from_secs(cfg.anchor_secs))
    }

    pub fn push(&mut self, at: Instant, bytes: u64) {
        if self.samples.len() == self.capacity {
            self.samples.pop_front();
        }
        self.samples.push_back((at, bytes));
    }

    /// Bytes per second over the anchored window, once two samples exist.
    pub fn rate(&self) -> Option<f64> {
        let (now, latest) = *self.samples.back()?;
        if self.samples.len() < 2 {
            return None;
        }
        let (t0, s0) = self
            .samples
            .iter()
            .rev()
            .find(|(t, _)| now.duration_since(*t) >= self.anchor)
            .or_else(|| self.samples.front())
            .copied()?;
        let dt = now.duration_since(t0).as_secs_f64().max(0.001);
        Some(latest.saturating_sub(s0) as f64 / dt)
    }
}

pub fn percent_of(bytes: u64, total: Option<u64>) -> Option<f64> {
    match total {
        Some(total) if total > 0 => Some((bytes as f64 / total as f64 * 100.0).min(100.0)),
        _ => None,
    }
}

/// Size-polling progress for a file being written.
#[derive(Debug, Clone)]
pub struct SizeProgress {
    estimator: RateEstimator,
    total: Option<u64>,
}

impl SizeProgress {
    pub fn new(cfg: &ProgressConfig, total: Option<u64>) -> Self {
        Self {
            estimator: RateEstimator::from_config(cfg),
            total: total.filter(|t| *t > 0),
        }
    }

    pub fn observe(&mut self, at: Instant, bytes: u64) -> ProgressEvent {
        self.estimator.push(at, bytes);
        let rate = self.estimator.rate();
        let percent = percent_of(bytes, self.total);
        let mut message = format_rate(rate.unwrap_or(0.0));
        if let Some(pct) = percent {
            message.push_str(&format!(", {pct:.2}%"));
        }
        ProgressEvent {
            message,
            percent,
            bytes_per_sec: rate,
        }
    }
}

/// Observer that logs steps, with progress ticks throttled to one line per
/// `every`.
pub struct LogObserver {
    label: String,
    every: Duration,
    last_tick: Option<Instant>,
}

impl LogObserver {
    pub fn new(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            every: Duration::from_secs(5),
            last_tick: None,
        }
    }
}

impl PipelineObserver for LogObserver {
    fn step(&mut self, name: &str, state: &StepState) {
        match state.status {
            StepStatus::Error => {
                tracing::error!("[{}] {name}: {} {}", self.label, state.status.as_str(), state.message)
            }
            StepStatus::Skipped => {
                tracing::warn!("[{}] {name}: {} {}", self.label, state.status.as_str(), state.message)
            }
            _ => tracing::info!("[{}] {name}: {} {}", self.label, state.status.as_str(), state.message),
        }
        self.last_tick = None;
    }

    fn progress(&mut self, name: &str, event: &ProgressEvent) {
        let now = Instant::now();
        let due = self
            .last_tick
            .is_none_or(|last| now.duration_since(last) >= self.every);
        if due {
            tracing::info!("[{}] {name}: {}", self.label, event.message);
            self.last_tick = Some(now);
        } else {
            tracing::debug!("[{}] {name}: {}", self.label, event.message);
        }
    }
}
