//! Member selection and relay feedback

use std::sync::Arc;

use rand::seq::SliceRandom;
use tracing::{debug, warn};

use crate::config::DispatchPolicy;
use crate::error::{PoolError, Result};
use crate::models::{FilterSpec, ProxyKey, ProxyRecord};
use crate::store::{ProxyStore, ScoreOutcome};

/// Picks pool members for the dispatcher and reports how they did
#[derive(Clone)]
pub struct PoolSelector {
    store: Arc<dyn ProxyStore>,
    filter: Option<FilterSpec>,
    success_delta: i32,
    failure_delta: i32,
}

impl PoolSelector {
    pub fn new(
        store: Arc<dyn ProxyStore>,
        policy: &DispatchPolicy,
        success_delta: i32,
        failure_delta: i32,
    ) -> Result<Self> {
        let filter = match policy {
            DispatchPolicy::Random => None,
            DispatchPolicy::Filtered { schema, min_score } => {
                let schema = schema.map(|s| s.as_str().to_string()).unwrap_or_default();
                let score = min_score.map(|s| s.to_string()).unwrap_or_default();
                Some(FilterSpec::from_options([("schema", schema), ("score", score)])?)
            }
        };

        Ok(Self {
            store,
            filter,
            success_delta,
            failure_delta,
        })
    }

    /// Uniform pick among the members the policy allows
    pub async fn select(&self) -> Result<ProxyRecord> {
        let Some(filter) = &self.filter else {
            return self.store.random().await;
        };

        let candidates = self.store.query(filter).await?;
        candidates
            .choose(&mut rand::thread_rng())
            .cloned()
            .ok_or(PoolError::NoProxiesAvailable)
    }

    pub async fn report_success(&self, key: ProxyKey) {
        self.report(key, self.success_delta).await;
    }

    pub async fn report_failure(&self, key: ProxyKey) {
        self.report(key, self.failure_delta).await;
    }

    async fn report(&self, key: ProxyKey, delta: i32) {
        match self.store.adjust_score(key, delta).await {
            Ok(ScoreOutcome::Evicted) => debug!(proxy = %key, "Member evicted after relay"),
            Ok(outcome) => debug!(proxy = %key, delta, outcome = ?outcome, "Relay feedback"),
            Err(e) => warn!(proxy = %key, error = %e, "Failed to record relay feedback"),
        }
    }
}
