//! Resource admission monitor
//!
//! Samples host CPU, memory and free disk on a fixed period and publishes an
//! [`Admission`] signal. A breach pauses admission immediately; admission is
//! restored only after `recovery_samples` consecutive healthy samples.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use warden_config::MonitorConfig;

mod sampler;

pub use sampler::{Sampler, SystemSampler};

/// Breaches kept for diagnostics
const MAX_BREACH_HISTORY: usize = 20;

/// Point-in-time host utilisation
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ResourceSample {
    pub cpu_pct: f32,
    pub mem_pct: f32,
    pub disk_free_bytes: u64,
    pub timestamp: DateTime<Utc>,
}

impl ResourceSample {
    pub fn new(cpu_pct: f32, mem_pct: f32, disk_free_bytes: u64) -> Self {
        Self {
            cpu_pct,
            mem_pct,
            disk_free_bytes,
            timestamp: Utc::now(),
        }
    }
}

/// Admission limits
#[derive(Debug, Clone, PartialEq)]
pub struct Thresholds {
    pub cpu_pct: f32,
    pub mem_pct: f32,
    pub disk_min_free_bytes: u64,
}

impl Default for Thresholds {
    fn default() -> Self {
        Self::from(&MonitorConfig::default())
    }
}

impl From<&MonitorConfig> for Thresholds {
    fn from(config: &MonitorConfig) -> Self {
        Self {
            cpu_pct: config.cpu_threshold,
            mem_pct: config.mem_threshold,
            disk_min_free_bytes: config.disk_min_free_bytes(),
        }
    }
}

impl Thresholds {
    /// Every limit the sample violates
    pub fn breaches(&self, sample: &ResourceSample) -> Vec<Breach> {
        let mut breaches = Vec::new();
        if sample.cpu_pct > self.cpu_pct {
            breaches.push(Breach::new(
                BreachKind::Cpu,
                sample.cpu_pct as f64,
                self.cpu_pct as f64,
                sample.timestamp,
            ));
        }
        if sample.mem_pct > self.mem_pct {
            breaches.push(Breach::new(
                BreachKind::Memory,
                sample.mem_pct as f64,
                self.mem_pct as f64,
                sample.timestamp,
            ));
        }
        if sample.disk_free_bytes < self.disk_min_free_bytes {
            breaches.push(Breach::new(
                BreachKind::Disk,
                sample.disk_free_bytes as f64,
                self.disk_min_free_bytes as f64,
                sample.timestamp,
            ));
        }
        breaches
    }

    pub fn admits(&self, sample: &ResourceSample) -> bool {
        self.breaches(sample).is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum BreachKind {
    Cpu,
    Memory,
    Disk,
}

/// One violated limit
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Breach {
    pub kind: BreachKind,
    pub observed: f64,
    pub limit: f64,
    pub at: DateTime<Utc>,
}

impl Breach {
    fn new(kind: BreachKind, observed: f64, limit: f64, at: DateTime<Utc>) -> Self {
        Self {
            kind,
            observed,
            limit,
            at,
        }
    }

    pub fn message(&self) -> String {
        match self.kind {
            BreachKind::Cpu => format!(
                "CPU usage {:.1}% exceeds threshold {:.1}%",
                self.observed, self.limit
            ),
            BreachKind::Memory => format!(
                "memory usage {:.1}% exceeds threshold {:.1}%",
                self.observed, self.limit
            ),
            BreachKind::Disk => format!(
                "free disk {:.2} GB below minimum {:.2} GB",
                self.observed / GIB,
                self.limit / GIB
            ),
        }
    }
}

const GIB: f64 = 1024.0 * 1024.0 * 1024.0;

/// Published admission signal
#[derive(Debug, Clone, PartialEq)]
pub enum Admission {
    Admitted,
    Paused(Vec<Breach>),
}

impl Admission {
    pub fn is_admitted(&self) -> bool {
        matches!(self, Admission::Admitted)
    }
}

#[derive(Debug, Default)]
struct Hysteresis {
    paused: bool,
    consecutive_ok: u32,
    last_breaches: Vec<Breach>,
}

/// Periodic host sampler with hysteresis
pub struct ResourceMonitor {
    thresholds: Thresholds,
    recovery_samples: u32,
    interval: Duration,
    sampler: Mutex<Box<dyn Sampler>>,
    hysteresis: Mutex<Hysteresis>,
    history: Mutex<VecDeque<Breach>>,
    sample_tx: watch::Sender<Option<ResourceSample>>,
    admission_tx: watch::Sender<Admission>,
}

impl ResourceMonitor {
    pub fn new(config: &MonitorConfig, sampler: Box<dyn Sampler>) -> Self {
        Self::with_thresholds(
            Thresholds::from(config),
            config.recovery_samples,
            config.interval(),
            sampler,
        )
    }

    pub fn with_thresholds(
        thresholds: Thresholds,
        recovery_samples: u32,
        interval: Duration,
        sampler: Box<dyn Sampler>,
    ) -> Self {
        let (sample_tx, _) = watch::channel(None);
        let (admission_tx, _) = watch::channel(Admission::Admitted);
        Self {
            thresholds,
            recovery_samples: recovery_samples.max(1),
            interval,
            sampler: Mutex::new(sampler),
            hysteresis: Mutex::new(Hysteresis::default()),
            history: Mutex::new(VecDeque::with_capacity(MAX_BREACH_HISTORY)),
            sample_tx,
            admission_tx,
        }
    }

    pub fn thresholds(&self) -> &Thresholds {
        &self.thresholds
    }

    /// Take a sample now and fold it into the admission signal
    pub fn sample(&self) -> ResourceSample {
        let sample = match self.sampler.lock() {
            Ok(mut sampler) => sampler.sample(),
            Err(poisoned) => poisoned.into_inner().sample(),
        };
        self.ingest(sample.clone());
        sample
    }

    /// Fold an externally produced sample into the admission signal
    pub fn ingest(&self, sample: ResourceSample) {
        let breaches = self.thresholds.breaches(&sample);
        let admission = {
            let mut state = match self.hysteresis.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            if !breaches.is_empty() {
                if !state.paused {
                    for breach in &breaches {
                        warn!("◆ RESOURCE BREACH: {}", breach.message());
                    }
                }
                state.paused = true;
                state.consecutive_ok = 0;
                state.last_breaches = breaches.clone();
                self.record_history(&breaches);
                Admission::Paused(breaches)
            } else if state.paused {
                state.consecutive_ok += 1;
                if state.consecutive_ok >= self.recovery_samples {
                    info!(
                        "◆ RESOURCES RECOVERED AFTER {} HEALTHY SAMPLES",
                        state.consecutive_ok
                    );
                    state.paused = false;
                    state.consecutive_ok = 0;
                    state.last_breaches.clear();
                    Admission::Admitted
                } else {
                    debug!(
                        healthy = state.consecutive_ok,
                        required = self.recovery_samples,
                        "◆ RECOVERY PENDING"
                    );
                    Admission::Paused(state.last_breaches.clone())
                }
            } else {
                Admission::Admitted
            }
        };

        self.sample_tx.send_replace(Some(sample));
        self.admission_tx.send_if_modified(|current| {
            if *current != admission {
                *current = admission;
                true
            } else {
                false
            }
        });
    }

    fn record_history(&self, breaches: &[Breach]) {
        let mut history = match self.history.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        for breach in breaches {
            if history.len() >= MAX_BREACH_HISTORY {
                history.pop_front();
            }
            history.push_back(breach.clone());
        }
    }

    /// Last published sample, if any
    pub fn last_sample(&self) -> Option<ResourceSample> {
        self.sample_tx.borrow().clone()
    }

    /// Stateless check of the last sample against arbitrary thresholds
    pub fn is_admissible(&self, thresholds: &Thresholds) -> bool {
        match self.sample_tx.borrow().as_ref() {
            Some(sample) => thresholds.admits(sample),
            None => true,
        }
    }

    /// Current hysteresis-aware admission
    pub fn admission(&self) -> Admission {
        self.admission_tx.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<Admission> {
        self.admission_tx.subscribe()
    }

    pub fn subscribe_samples(&self) -> watch::Receiver<Option<ResourceSample>> {
        self.sample_tx.subscribe()
    }

    /// Most recent breaches, oldest first
    pub fn recent_breaches(&self) -> Vec<Breach> {
        match self.history.lock() {
            Ok(history) => history.iter().cloned().collect(),
            Err(poisoned) => poisoned.into_inner().iter().cloned().collect(),
        }
    }

    /// Sample on the configured period until cancelled
    pub async fn run(&self, cancel: CancellationToken) {
        info!("◆ RESOURCE MONITOR STARTED (every {:?})", self.interval);

        let mut interval = tokio::time::interval(self.interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("◆ RESOURCE MONITOR STOPPED");
                    return;
                }
                _ = interval.tick() => {
                    let sample = self.sample();
                    debug!(
                        cpu = sample.cpu_pct,
                        mem = sample.mem_pct,
                        disk_free = sample.disk_free_bytes,
                        "◆ SAMPLE"
                    );
                }
            }
        }
    }
}
