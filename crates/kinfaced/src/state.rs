use chrono::{DateTime, Utc};
use kinface_core::FamilyAnalyzer;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::config::Config;
use crate::engine::EngineHandle;
use crate::response::ApiError;

/// Shared by every handler behind an `Arc`.
pub struct AppState {
    pub config: Config,
    /// `None` when the models failed to load; face routes then answer 503.
    pub engine: Option<EngineHandle>,
    pub analyzer: Arc<FamilyAnalyzer>,
    pub stats: RequestStats,
    pub started_at: Instant,
    pub started_utc: DateTime<Utc>,
}

impl AppState {
    pub fn new(config: Config, engine: Option<EngineHandle>, analyzer: Arc<FamilyAnalyzer>) -> Self {
        Self {
            config,
            engine,
            analyzer,
            stats: RequestStats::default(),
            started_at: Instant::now(),
            started_utc: Utc::now(),
        }
    }

    pub fn engine(&self) -> Result<&EngineHandle, ApiError> {
        self.engine.as_ref().ok_or(ApiError::ModelUnavailable)
    }

    pub fn model_loaded(&self) -> bool {
        self.engine.is_some()
    }

    pub fn uptime(&self) -> Duration {
        self.started_at.elapsed()
    }
}

/// Request counters for `/metrics`.
#[derive(Default)]
pub struct RequestStats {
    total: AtomicU64,
    failed: AtomicU64,
    slow: AtomicU64,
    total_micros: AtomicU64,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct StatsSnapshot {
    pub total_requests: u64,
    pub successful_requests: u64,
    pub failed_requests: u64,
    pub slow_requests: u64,
    pub avg_processing_time_ms: f64,
    pub error_rate: f64,
}

impl RequestStats {
    pub fn record(&self, elapsed: Duration, failed: bool, slow: bool) {
        self.total.fetch_add(1, Ordering::Relaxed);
        self.total_micros
            .fetch_add(elapsed.as_micros().min(u64::MAX as u128) as u64, Ordering::Relaxed);
        if failed {
            self.failed.fetch_add(1, Ordering::Relaxed);
        }
        if slow {
            self.slow.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        let total = self.total.load(Ordering::Relaxed);
        let failed = self.failed.load(Ordering::Relaxed);
        let micros = self.total_micros.load(Ordering::Relaxed);
        let (avg_ms, error_rate) = if total == 0 {
            (0.0, 0.0)
        } else {
            (micros as f64 / total as f64 / 1000.0, failed as f64 / total as f64)
        };
        StatsSnapshot {
            total_requests: total,
            successful_requests: total - failed,
            failed_requests: failed,
            slow_requests: self.slow.load(Ordering::Relaxed),
            avg_processing_time_ms: avg_ms,
            error_rate,
        }
    }
}
