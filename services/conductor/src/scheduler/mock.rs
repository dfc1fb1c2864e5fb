//! Scripted scheduler for testing and development.

use std::collections::VecDeque;
use std::sync::Mutex;

use async_trait::async_trait;
use tracing::debug;

use super::{SchedulerClient, SchedulerError, NOT_ENOUGH_HOSTS};
use crate::model::{Candidate, FilterProperties, RequestSpec};

/// One recorded `select_destinations` call.
#[derive(Debug, Clone)]
pub struct SchedulerCall {
    pub spec: RequestSpec,
    pub filter_properties: FilterProperties,
}

/// Mock scheduler.
///
/// Scripted responses are returned first, in order. Once the script runs
/// dry, candidates come from the host pool, skipping excluded hosts. An
/// empty pool answers `NoValidHost`.
#[derive(Debug, Default)]
pub struct MockScheduler {
    script: Mutex<VecDeque<Result<Vec<Candidate>, SchedulerError>>>,
    pool: Vec<Candidate>,
    calls: Mutex<Vec<SchedulerCall>>,
}

impl MockScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Answers from `pool` once the script is exhausted.
    pub fn with_hosts(pool: impl IntoIterator<Item = Candidate>) -> Self {
        Self {
            pool: pool.into_iter().collect(),
            ..Default::default()
        }
    }

    /// Appends a scripted response.
    pub fn then(self, response: Result<Vec<Candidate>, SchedulerError>) -> Self {
        self.push(response);
        self
    }

    pub fn push(&self, response: Result<Vec<Candidate>, SchedulerError>) {
        if let Ok(mut script) = self.script.lock() {
            script.push_back(response);
        }
    }

    pub fn calls(&self) -> Vec<SchedulerCall> {
        self.calls.lock().map(|c| c.clone()).unwrap_or_default()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().map(|c| c.len()).unwrap_or_default()
    }

    fn from_pool(
        &self,
        spec: &RequestSpec,
        filter_properties: &FilterProperties,
    ) -> Result<Vec<Candidate>, SchedulerError> {
        let excluded = filter_properties.excluded_hosts();
        let wanted = spec.num_instances.max(1) as usize;
        let picked: Vec<Candidate> = self
            .pool
            .iter()
            .filter(|c| !excluded.contains(&c.host))
            .take(wanted)
            .cloned()
            .collect();
        if picked.len() < wanted {
            return Err(SchedulerError::NoValidHost {
                reason: NOT_ENOUGH_HOSTS.to_string(),
            });
        }
        Ok(picked)
    }
}

#[async_trait]
impl SchedulerClient for MockScheduler {
    async fn select_destinations(
        &self,
        spec: &RequestSpec,
        filter_properties: &FilterProperties,
    ) -> Result<Vec<Candidate>, SchedulerError> {
        if let Ok(mut calls) = self.calls.lock() {
            calls.push(SchedulerCall {
                spec: spec.clone(),
                filter_properties: filter_properties.clone(),
            });
        }

        let scripted = self.script.lock().ok().and_then(|mut s| s.pop_front());
        let response = match scripted {
            Some(response) => response,
            None => self.from_pool(spec, filter_properties),
        };

        debug!(
            instance_id = %spec.instance_properties.uuid,
            ok = response.is_ok(),
            "[MOCK] select_destinations"
        );
        response
    }
}
