//! Per-invocation placement state and the selector around the scheduler.

use std::collections::BTreeSet;
use std::sync::Arc;

use fleet_id::InstanceId;
use tracing::{debug, instrument, warn};

use super::{SchedulerClient, AFFINITY_FILTER, ANTI_AFFINITY_FILTER, NOT_ENOUGH_HOSTS};
use crate::config::ConductorConfig;
use crate::error::{ExpectedError, TaskError, TaskResult};
use crate::model::{Candidate, FilterProperties, GroupHints, RequestSpec, RetryRecord};

/// Placement state owned by one workflow invocation.
///
/// The exclusion set only grows: hosts land in it through the retry record
/// once tried, or explicitly through [`PlacementRequest::exclude`].
#[derive(Debug, Clone)]
pub struct PlacementRequest {
    pub spec: RequestSpec,
    pub filter_properties: FilterProperties,
    max_attempts: u32,
    attempts_made: u32,
    last_error: Option<String>,
    history: Vec<BTreeSet<String>>,
}

impl PlacementRequest {
    /// Carries forward any retry record already in `filter_properties`.
    pub fn new(spec: RequestSpec, filter_properties: FilterProperties, max_attempts: u32) -> Self {
        let attempts_made = filter_properties
            .retry
            .as_ref()
            .map_or(0, |retry| retry.num_attempts);
        Self {
            spec,
            filter_properties,
            max_attempts: max_attempts.max(1),
            attempts_made,
            last_error: None,
            history: Vec::new(),
        }
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    pub fn attempts_made(&self) -> u32 {
        self.attempts_made
    }

    /// Hosts that must not be selected.
    pub fn excluded(&self) -> BTreeSet<String> {
        self.filter_properties.excluded_hosts()
    }

    /// Exclusion set seen by each selection, in order.
    pub fn history(&self) -> &[BTreeSet<String>] {
        &self.history
    }

    /// Adds `host` to the exclusion set.
    pub fn exclude(&mut self, host: &str) {
        if !self.excluded().contains(host) {
            self.filter_properties.ignore_hosts.push(host.to_string());
        }
    }

    /// Remembers why the last attempt failed.
    pub fn note_failure(&mut self, reason: impl Into<String>) {
        let reason = reason.into();
        if let Some(retry) = self.filter_properties.retry.as_mut() {
            retry.exc = Some(reason.clone());
        }
        self.last_error = Some(reason);
    }

    /// Counts one more scheduling attempt.
    ///
    /// With more than one attempt allowed, the count is mirrored into the
    /// retry record forwarded to the scheduler and the destination host.
    /// Fails with `NoValidHost` once the bound is exceeded.
    pub fn populate_retry(&mut self, instance_id: InstanceId) -> TaskResult<()> {
        self.attempts_made += 1;

        if self.max_attempts > 1 {
            let retry = self
                .filter_properties
                .retry
                .get_or_insert_with(RetryRecord::default);
            retry.num_attempts = self.attempts_made;
        }

        if self.attempts_made > self.max_attempts {
            let reason = format!(
                "Exceeded max scheduling attempts {} for instance {}. Last exception: {}",
                self.max_attempts,
                instance_id,
                self.last_error.as_deref().unwrap_or_default()
            );
            warn!(instance_id = %instance_id, attempts = self.attempts_made, "{}", reason);
            return Err(TaskError::no_valid_host(reason));
        }
        Ok(())
    }
}

/// Records `candidate` in the retry record and forwards its limits.
pub fn populate_filter_properties(filter_properties: &mut FilterProperties, candidate: &Candidate) {
    if let Some(retry) = filter_properties.retry.as_mut() {
        retry
            .hosts
            .push((candidate.host.clone(), candidate.node.clone()));
    }
    filter_properties.limits = Some(candidate.limits.clone());
}

/// Copies server-group constraints into the filter properties.
///
/// A policy is only usable when the filter enforcing it is configured.
pub fn setup_instance_group(
    config: &ConductorConfig,
    placement: &mut PlacementRequest,
) -> TaskResult<()> {
    let Some(group) = placement.spec.group.as_ref() else {
        return Ok(());
    };

    for policy in &group.policies {
        let required = match policy.as_str() {
            "anti-affinity" => ANTI_AFFINITY_FILTER,
            "affinity" => AFFINITY_FILTER,
            other => {
                return Err(ExpectedError::UnsupportedPolicy {
                    reason: format!("unknown policy {other:?}"),
                }
                .into())
            }
        };
        if !config.has_filter(required) {
            return Err(ExpectedError::UnsupportedPolicy {
                reason: format!("{required} not configured"),
            }
            .into());
        }
    }

    placement.filter_properties.group = Some(GroupHints {
        group_id: group.id.clone(),
        policies: group.policies.clone(),
        hosts: group.hosts.clone(),
    });
    Ok(())
}

/// Wraps the scheduler and enforces the exclusion set on its answers.
#[derive(Clone)]
pub struct PlacementSelector {
    client: Arc<dyn SchedulerClient>,
}

impl PlacementSelector {
    pub fn new(client: Arc<dyn SchedulerClient>) -> Self {
        Self { client }
    }

    /// Asks the scheduler for destinations.
    ///
    /// Returns one candidate per requested instance, primaries first.
    /// Excluded hosts are dropped even if the scheduler returned them.
    #[instrument(skip_all, fields(instance_id = %placement.spec.instance_properties.uuid))]
    pub async fn select(&self, placement: &mut PlacementRequest) -> TaskResult<Vec<Candidate>> {
        let excluded = placement.excluded();
        placement.history.push(excluded.clone());
        debug!(
            attempt = placement.history.len(),
            excluded = excluded.len(),
            "Selecting destinations"
        );

        let result = self
            .client
            .select_destinations(&placement.spec, &placement.filter_properties)
            .await;
        let candidates = match result {
            Ok(candidates) => candidates,
            Err(e) => {
                placement.note_failure(e.to_string());
                return Err(e.into());
            }
        };

        let wanted = placement.spec.num_instances.max(1) as usize;
        let usable: Vec<Candidate> = candidates
            .into_iter()
            .filter(|c| !excluded.contains(&c.host))
            .collect();
        if usable.len() < wanted {
            placement.note_failure(NOT_ENOUGH_HOSTS);
            return Err(TaskError::no_valid_host(NOT_ENOUGH_HOSTS));
        }

        debug!(primary = %usable[0].host, count = usable.len(), "Destinations selected");
        Ok(usable)
    }
}

impl std::fmt::Debug for PlacementSelector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PlacementSelector").finish_non_exhaustive()
    }
}
