//! Capacity-based scheduler backing dev mode.
//!
//! Filters out unavailable, excluded and too-small hosts, honours group
//! policies, then prefers hosts with more free RAM, then more free vCPUs,
//! then the lowest name for determinism.

use std::cmp::Ordering;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;

use super::{SchedulerClient, SchedulerError, NOT_ENOUGH_HOSTS};
use crate::model::{Candidate, FilterProperties, Flavor, HostRecord, Limits, RequestSpec};
use crate::registry::HostRegistry;

pub struct CapacityScheduler {
    hosts: Arc<dyn HostRegistry>,
}

impl CapacityScheduler {
    pub fn new(hosts: Arc<dyn HostRegistry>) -> Self {
        Self { hosts }
    }
}

fn fits(host: &HostRecord, flavor: &Flavor) -> bool {
    host.free_ram_mb() >= flavor.memory_mb
        && host.free_vcpus() >= flavor.vcpus
        && host.free_disk_gb() >= flavor.disk_gb()
}

fn allowed_by_group(host: &HostRecord, filter_properties: &FilterProperties) -> bool {
    let Some(group) = &filter_properties.group else {
        return true;
    };
    let member_host = group.hosts.contains(&host.host);
    group.policies.iter().all(|policy| match policy.as_str() {
        "anti-affinity" => !member_host,
        "affinity" => group.hosts.is_empty() || member_host,
        _ => true,
    })
}

fn preference(a: &HostRecord, b: &HostRecord) -> Ordering {
    b.free_ram_mb()
        .cmp(&a.free_ram_mb())
        .then_with(|| b.free_vcpus().cmp(&a.free_vcpus()))
        .then_with(|| a.host.cmp(&b.host))
}

fn limits(host: &HostRecord) -> Limits {
    Limits {
        memory_mb: Some((host.memory_mb as f64 * host.ram_allocation_ratio) as u64),
        disk_gb: Some(host.local_gb),
        vcpu: Some((host.vcpus as f64 * host.cpu_allocation_ratio) as u32),
    }
}

#[async_trait]
impl SchedulerClient for CapacityScheduler {
    async fn select_destinations(
        &self,
        spec: &RequestSpec,
        filter_properties: &FilterProperties,
    ) -> Result<Vec<Candidate>, SchedulerError> {
        let excluded = filter_properties.excluded_hosts();
        let flavor = &spec.instance_type;

        let mut pool: Vec<HostRecord> = self
            .hosts
            .list_hosts()
            .await
            .map_err(|e| SchedulerError::Internal(e.to_string()))?
            .into_iter()
            .filter(|h| h.is_available() && !excluded.contains(&h.host))
            .filter(|h| allowed_by_group(h, filter_properties))
            .collect();

        let wanted = spec.num_instances.max(1) as usize;
        let mut chosen = Vec::with_capacity(wanted);
        for _ in 0..wanted {
            pool.sort_by(preference);
            let Some(best) = pool.iter_mut().find(|h| fits(h, flavor)) else {
                break;
            };
            let candidate =
                Candidate::new(best.host.clone(), Some(best.node.as_str())).with_limits(limits(best));
            chosen.push(candidate);
            // Claim capacity so the rest of the batch sees it
            best.vcpus_used += flavor.vcpus;
            best.memory_mb_used += flavor.memory_mb;
            best.local_gb_used += flavor.disk_gb();
        }

        if chosen.len() < wanted {
            debug!(wanted, found = chosen.len(), "Not enough capacity");
            return Err(SchedulerError::NoValidHost {
                reason: NOT_ENOUGH_HOSTS.to_string(),
            });
        }
        Ok(chosen)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{GroupHints, Instance, VmState};
    use crate::registry::InMemoryHostRegistry;
    use fleet_id::InstanceId;

    fn flavor() -> Flavor {
        Flavor {
            id: 1,
            name: "m1.small".to_string(),
            vcpus: 1,
            memory_mb: 1024,
            root_gb: 10,
            ephemeral_gb: 0,
            extra_specs: Default::default(),
        }
    }

    fn instance() -> Instance {
        Instance {
            id: InstanceId::new(),
            host: None,
            node: None,
            vm_state: VmState::Building,
            task_state: None,
            flavor: flavor(),
            instance_type_id: 1,
            image_ref: None,
            system_metadata: Default::default(),
            metadata: Default::default(),
            revision: 0,
        }
    }

    fn scheduler(hosts: Vec<HostRecord>) -> CapacityScheduler {
        CapacityScheduler::new(Arc::new(InMemoryHostRegistry::with_hosts(hosts)))
    }

    #[tokio::test]
    async fn test_prefers_free_memory_then_name() {
        let scheduler = scheduler(vec![
            HostRecord::new("host-c", 4, 4096, 100),
            HostRecord::new("host-b", 4, 8192, 100),
            HostRecord::new("host-a", 4, 8192, 100),
        ]);
        let spec = RequestSpec::for_instance(&instance(), &flavor(), None);

        let chosen = scheduler
            .select_destinations(&spec, &FilterProperties::default())
            .await
            .unwrap();
        assert_eq!(chosen[0].host, "host-a");
        assert_eq!(chosen[0].limits.memory_mb, Some(8192));
    }

    #[tokio::test]
    async fn test_skips_excluded_and_down_hosts() {
        let mut down = HostRecord::new("host-a", 4, 8192, 100);
        down.service_up = false;
        let scheduler = scheduler(vec![
            down,
            HostRecord::new("host-b", 4, 8192, 100),
            HostRecord::new("host-c", 4, 2048, 100),
        ]);
        let spec = RequestSpec::for_instance(&instance(), &flavor(), None);

        let chosen = scheduler
            .select_destinations(&spec, &FilterProperties::ignoring(["host-b"]))
            .await
            .unwrap();
        assert_eq!(chosen[0].host, "host-c");
    }

    #[tokio::test]
    async fn test_batch_claims_capacity() {
        let scheduler = scheduler(vec![
            HostRecord::new("host-a", 1, 1024, 10),
            HostRecord::new("host-b", 1, 1024, 10),
        ]);
        let instances = vec![instance(), instance()];
        let spec = RequestSpec::for_batch(&instances, None).unwrap();

        let chosen = scheduler
            .select_destinations(&spec, &FilterProperties::default())
            .await
            .unwrap();
        let hosts: Vec<&str> = chosen.iter().map(|c| c.host.as_str()).collect();
        assert_eq!(hosts, vec!["host-a", "host-b"]);

        let three = vec![instance(), instance(), instance()];
        let spec = RequestSpec::for_batch(&three, None).unwrap();
        assert!(matches!(
            scheduler
                .select_destinations(&spec, &FilterProperties::default())
                .await,
            Err(SchedulerError::NoValidHost { .. })
        ));
    }

    #[tokio::test]
    async fn test_anti_affinity_avoids_member_hosts() {
        let scheduler = scheduler(vec![
            HostRecord::new("host-a", 4, 8192, 100),
            HostRecord::new("host-b", 4, 4096, 100),
        ]);
        let spec = RequestSpec::for_instance(&instance(), &flavor(), None);
        let props = FilterProperties {
            group: Some(GroupHints {
                group_id: "g".to_string(),
                policies: vec!["anti-affinity".to_string()],
                hosts: vec!["host-a".to_string()],
            }),
            ..Default::default()
        };

        let chosen = scheduler.select_destinations(&spec, &props).await.unwrap();
        assert_eq!(chosen[0].host, "host-b");
    }
}
