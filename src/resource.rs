use serde::Serialize;

use crate::cache::{CacheClient, CachePool};
use crate::config::AppSettings;
use crate::db::Database;
use crate::logging::{LoggerHandle, LogId};
use crate::trace::TraceExporter;

/// Everything the initialization pipeline produced, in one place. Built once
/// at startup, wrapped in an `Arc` and passed to whoever needs it; nothing
/// here lives in a global.
#[derive(Debug)]
pub struct Resources {
    pub settings: AppSettings,
    pub logger: LoggerHandle,
    pub db: Database,
    pub cache_pool: CachePool,
    pub cache: CacheClient,
    pub tracer: TraceExporter,
}

impl Resources {
    /// Ask every backing service whether it still answers.
    pub async fn probe(&self, log_id: &LogId) -> ProbeReport {
        ProbeReport {
            database: self.db.ping(log_id).await.is_ok(),
            cache: self.cache.ping(log_id).await.is_ok(),
            tracer_active: self.tracer.is_active(),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize)]
pub struct ProbeReport {
    pub database: bool,
    pub cache: bool,
    pub tracer_active: bool,
}

impl ProbeReport {
    /// Healthy means both stores answer; an inactive tracer is fine.
    pub fn ok(&self) -> bool {
        self.database && self.cache
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tracer_state_does_not_gate_health() {
        let report = ProbeReport {
            database: true,
            cache: true,
            tracer_active: false,
        };
        assert!(report.ok());

        let degraded = ProbeReport {
            database: true,
            cache: false,
            tracer_active: true,
        };
        assert!(!degraded.ok());
    }
}
