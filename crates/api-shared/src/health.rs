use consent_core::QueryService;

use crate::dto::{HealthRes, LedgerInfoRes};

/// Liveness and ledger connectivity checks shared by the REST API and the CLI.
#[derive(Clone)]
pub struct HealthService {
    queries: QueryService,
}

impl HealthService {
    pub fn new(queries: QueryService) -> Self {
        Self { queries }
    }

    /// Liveness only; never touches the ledger.
    pub fn check_health() -> HealthRes {
        HealthRes {
            ok: true,
            message: "Consent ledger is alive".into(),
        }
    }

    /// Probes the ledger with a short deadline.
    ///
    /// # Returns
    /// A `LedgerInfoRes` with `reachable == false` and a generic message if the probe failed.
    pub async fn ledger_info(&self) -> LedgerInfoRes {
        self.queries.ledger_info().await.into()
    }
}

#[cfg(test)]
mod tests {
    use consent_core::testutil::memory_core;
    use consent_core::CacheConfig;

    use super::*;

    #[tokio::test]
    async fn test_ledger_info_reports_empty_memory_ledger() {
        let (core, _, _) = memory_core(CacheConfig::default());
        let health = HealthService::new(core.queries().clone());
        let info = health.ledger_info().await;
        assert!(info.reachable);
        assert_eq!(info.backend, "memory");
        assert_eq!(info.head_sequence, Some(0));
        assert!(HealthService::check_health().ok);
    }
}
