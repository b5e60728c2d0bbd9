//! Per-process health monitoring
//!
//! One [`HealthMonitor`] per agent process runs a failure-threshold state
//! machine: consecutive probe failures move healthy → degraded → down, a
//! single success snaps back to healthy. The observer fires only on the
//! degraded→down and down→healthy edges; `degraded` is internal
//! hysteresis and never produces a callback.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

use tether_core::config::HealthConfig;

/// Liveness state of one agent process
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthState {
    /// Last probe succeeded
    Healthy,
    /// Some probes failed, below the threshold
    Degraded,
    /// Failure threshold reached
    Down,
}

impl std::fmt::Display for HealthState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HealthState::Healthy => write!(f, "healthy"),
            HealthState::Degraded => write!(f, "degraded"),
            HealthState::Down => write!(f, "down"),
        }
    }
}

/// Mutable monitoring state, one per monitored process
#[derive(Debug, Clone)]
pub struct HealthRecord {
    /// Current state
    pub state: HealthState,
    /// Consecutive probe failures
    pub consecutive_failures: u32,
    /// A recovery action has been triggered and has not yet succeeded
    pub recovering: bool,
}

impl HealthRecord {
    fn new() -> Self {
        Self {
            state: HealthState::Healthy,
            consecutive_failures: 0,
            recovering: false,
        }
    }
}

/// A single liveness probe
#[async_trait]
pub trait Probe: Send + Sync {
    /// Run one probe; `true` means the process answered
    async fn probe(&self) -> bool;
}

/// Action taken once when a process goes down
#[async_trait]
pub trait Recovery: Send + Sync {
    /// Attempt to bring the process back (e.g. restart it)
    async fn recover(&self);
}

/// No-op recovery for attached processes the daemon must never touch
pub struct NoRecovery;

#[async_trait]
impl Recovery for NoRecovery {
    async fn recover(&self) {}
}

/// Observer invoked on down/recovered edges with `(state, ready)`
pub type HealthObserver = Box<dyn Fn(HealthState, bool) + Send + Sync>;

/// Failure-threshold liveness monitor for one agent process
pub struct HealthMonitor {
    name: String,
    record: std::sync::Mutex<HealthRecord>,
    /// Serializes probe execution: a manual `check_now` must not overlap a
    /// timer-driven probe for the same process, since both mutate the
    /// failure counter.
    probe_guard: Mutex<()>,
    probe: Arc<dyn Probe>,
    recovery: Arc<dyn Recovery>,
    observer: Option<HealthObserver>,
    threshold: u32,
    probe_timeout: Duration,
}

impl HealthMonitor {
    /// Create a monitor with the given probe, recovery action, and observer
    pub fn new(
        name: impl Into<String>,
        config: &HealthConfig,
        probe: Arc<dyn Probe>,
        recovery: Arc<dyn Recovery>,
        observer: Option<HealthObserver>,
    ) -> Self {
        Self {
            name: name.into(),
            record: std::sync::Mutex::new(HealthRecord::new()),
            probe_guard: Mutex::new(()),
            probe,
            recovery,
            observer,
            threshold: config.failure_threshold.max(1),
            probe_timeout: config.probe_timeout,
        }
    }

    /// Current record snapshot
    pub fn record(&self) -> HealthRecord {
        self.record.lock().expect("health record lock poisoned").clone()
    }

    /// Current state
    pub fn state(&self) -> HealthState {
        self.record().state
    }

    /// Force `(healthy, 0, recovering=false)` after a manual restart
    pub fn reset(&self) {
        let mut record = self.record.lock().expect("health record lock poisoned");
        record.state = HealthState::Healthy;
        record.consecutive_failures = 0;
        record.recovering = false;
    }

    /// Run one probe now. Safe to call concurrently with the timer; probe
    /// executions for this process are serialized.
    pub async fn check_now(self: &Arc<Self>) {
        let _flight = self.probe_guard.lock().await;

        let ok = tokio::time::timeout(self.probe_timeout, self.probe.probe())
            .await
            .unwrap_or(false);

        if ok {
            self.on_success();
        } else {
            self.on_failure();
        }
    }

    /// Spawn the interval-driven probe loop
    pub fn spawn_timer(self: &Arc<Self>, interval: Duration) -> JoinHandle<()> {
        let monitor = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            // The immediate first tick would race startup; skip it.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                monitor.check_now().await;
            }
        })
    }

    fn on_success(self: &Arc<Self>) {
        let recovered = {
            let mut record = self.record.lock().expect("health record lock poisoned");
            let was_down = record.state == HealthState::Down;
            record.state = HealthState::Healthy;
            record.consecutive_failures = 0;
            record.recovering = false;
            was_down
        };

        if recovered {
            tracing::info!("Agent process '{}' recovered", self.name);
            if let Some(observer) = &self.observer {
                observer(HealthState::Healthy, true);
            }
        }
    }

    fn on_failure(self: &Arc<Self>) {
        let (went_down, trigger_recovery) = {
            let mut record = self.record.lock().expect("health record lock poisoned");
            match record.state {
                HealthState::Down => {
                    record.consecutive_failures += 1;
                    (false, false)
                }
                _ => {
                    record.consecutive_failures += 1;
                    if record.consecutive_failures >= self.threshold {
                        record.state = HealthState::Down;
                        let trigger = !record.recovering;
                        record.recovering = true;
                        (true, trigger)
                    } else {
                        record.state = HealthState::Degraded;
                        tracing::debug!(
                            "Agent process '{}' degraded ({}/{} failures)",
                            self.name,
                            record.consecutive_failures,
                            self.threshold
                        );
                        (false, false)
                    }
                }
            }
        };

        if went_down {
            tracing::warn!("Agent process '{}' is down", self.name);
            if let Some(observer) = &self.observer {
                observer(HealthState::Down, false);
            }
        }

        if trigger_recovery {
            let monitor = Arc::clone(self);
            tokio::spawn(async move {
                monitor.recovery.recover().await;
            });
        }
    }
}
