//! Model load state machine backing the liveness and readiness probes.
//!
//! Phases:
//! - NotLoaded
//! - Loading
//! - Ready (terminal)
//! - LoadFailed (terminal)
//!
//! Readiness is a one-time process-lifetime fact: once `Ready`, nothing a
//! request does can take it away. Liveness is independent of the phase.

use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum LoadPhase { NotLoaded, Loading, Ready, LoadFailed }

impl LoadPhase {
    fn from_u8(v: u8) -> Self {
        match v { 1 => LoadPhase::Loading, 2 => LoadPhase::Ready, 3 => LoadPhase::LoadFailed, _ => LoadPhase::NotLoaded }
    }
    fn as_u8(self) -> u8 {
        match self { LoadPhase::NotLoaded => 0, LoadPhase::Loading => 1, LoadPhase::Ready => 2, LoadPhase::LoadFailed => 3 }
    }
    pub fn is_terminal(self) -> bool { matches!(self, LoadPhase::Ready | LoadPhase::LoadFailed) }
}

/// Startup stage whose failure left the process unready.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum FailureStage { Config, Fetch, Load }

#[derive(Debug, Clone, Serialize)]
pub struct Failure { pub stage: FailureStage, pub message: String }

#[derive(Debug, Clone, Serialize)]
pub struct HealthSnapshot {
    pub live: bool,
    pub ready: bool,
    pub phase: LoadPhase,
    pub uptime_ms: u64,
    pub startup_ms: Option<u64>,
    pub failure: Option<Failure>,
}

#[derive(Debug)]
struct Inner {
    phase: AtomicU8,
    live: AtomicBool,
    started_at: Instant,
    loading_started_at: Mutex<Option<Instant>>,
    settled_after: Mutex<Option<Duration>>,
    failure: Mutex<Option<Failure>>,
}

/// Cloneable handle shared by the startup sequence and the probe endpoints.
#[derive(Debug, Clone)]
pub struct HealthReporter { inner: Arc<Inner> }

impl Default for HealthReporter { fn default() -> Self { Self::new() } }

impl HealthReporter {
    pub fn new() -> Self {
        Self { inner: Arc::new(Inner {
            phase: AtomicU8::new(LoadPhase::NotLoaded.as_u8()),
            live: AtomicBool::new(true),
            started_at: Instant::now(),
            loading_started_at: Mutex::new(None),
            settled_after: Mutex::new(None),
            failure: Mutex::new(None),
        }) }
    }

    pub fn phase(&self) -> LoadPhase { LoadPhase::from_u8(self.inner.phase.load(Ordering::SeqCst)) }
    pub fn is_ready(&self) -> bool { self.phase() == LoadPhase::Ready }
    pub fn is_live(&self) -> bool { self.inner.live.load(Ordering::SeqCst) }

    /// Only called once shutdown has begun; the accept path is going away.
    pub fn mark_not_live(&self) { self.inner.live.store(false, Ordering::SeqCst); }

    /// NotLoaded -> Loading.
    pub fn begin_loading(&self) -> bool {
        let ok = self.transition(LoadPhase::NotLoaded, LoadPhase::Loading);
        if ok { *self.inner.loading_started_at.lock() = Some(Instant::now()); }
        ok
    }

    /// Loading -> Ready.
    pub fn mark_ready(&self) -> bool {
        let ok = self.transition(LoadPhase::Loading, LoadPhase::Ready);
        if ok { self.settle(); info!(startup_ms = ?self.startup_ms(), "model ready"); }
        ok
    }

    /// Loading -> LoadFailed. A failure before loading began (bad configuration)
    /// passes through Loading so the recorded history stays on the documented path.
    pub fn mark_failed(&self, stage: FailureStage, message: impl Into<String>) -> bool {
        if self.phase() == LoadPhase::NotLoaded { self.begin_loading(); }
        let ok = self.transition(LoadPhase::Loading, LoadPhase::LoadFailed);
        if ok {
            let failure = Failure { stage, message: message.into() };
            warn!(stage = ?failure.stage, message = %failure.message, "startup failed, readiness permanently false");
            *self.inner.failure.lock() = Some(failure);
            self.settle();
        }
        ok
    }

    pub fn failure(&self) -> Option<Failure> { self.inner.failure.lock().clone() }

    pub fn snapshot(&self) -> HealthSnapshot {
        let phase = self.phase();
        HealthSnapshot {
            live: self.is_live(),
            ready: phase == LoadPhase::Ready,
            phase,
            uptime_ms: self.inner.started_at.elapsed().as_millis() as u64,
            startup_ms: self.startup_ms(),
            failure: self.failure(),
        }
    }

    fn startup_ms(&self) -> Option<u64> { self.inner.settled_after.lock().map(|d| d.as_millis() as u64) }

    fn settle(&self) {
        let started = self.inner.loading_started_at.lock().unwrap_or(self.inner.started_at);
        *self.inner.settled_after.lock() = Some(started.elapsed());
    }

    fn transition(&self, from: LoadPhase, to: LoadPhase) -> bool {
        match self.inner.phase.compare_exchange(from.as_u8(), to.as_u8(), Ordering::SeqCst, Ordering::SeqCst) {
            Ok(_) => true,
            Err(actual) => {
                warn!(from = ?LoadPhase::from_u8(actual), to = ?to, "ignoring illegal load phase transition");
                false
            }
        }
    }
}
