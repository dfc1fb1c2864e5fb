//! Host capacity records.

use std::collections::BTreeMap;
use std::net::IpAddr;

use serde::{Deserialize, Serialize};

/// A compute node as seen by the host registry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HostRecord {
    /// Service host name, also the dispatch target.
    pub host: String,
    /// Hypervisor node name.
    pub node: String,
    pub service_id: Option<i64>,

    pub vcpus: u32,
    pub vcpus_used: u32,
    pub memory_mb: u64,
    pub memory_mb_used: u64,
    pub local_gb: u64,
    pub local_gb_used: u64,

    pub hypervisor_type: String,
    pub hypervisor_version: u64,
    pub cpu_info: Option<String>,
    pub host_ip: Option<IpAddr>,
    pub numa_topology: Option<String>,
    #[serde(default)]
    pub stats: BTreeMap<String, String>,

    pub cpu_allocation_ratio: f64,
    pub ram_allocation_ratio: f64,

    /// Whether the compute service is reporting in.
    pub service_up: bool,
    /// Administratively disabled hosts are never selected.
    pub disabled: bool,
}

impl HostRecord {
    /// Creates an empty, enabled host with the given capacity.
    pub fn new(host: impl Into<String>, vcpus: u32, memory_mb: u64, local_gb: u64) -> Self {
        let host = host.into();
        Self {
            node: host.clone(),
            host,
            service_id: None,
            vcpus,
            vcpus_used: 0,
            memory_mb,
            memory_mb_used: 0,
            local_gb,
            local_gb_used: 0,
            hypervisor_type: "kvm".to_string(),
            hypervisor_version: 1,
            cpu_info: None,
            host_ip: None,
            numa_topology: None,
            stats: BTreeMap::new(),
            cpu_allocation_ratio: 1.0,
            ram_allocation_ratio: 1.0,
            service_up: true,
            disabled: false,
        }
    }

    /// Schedulable RAM after overcommit.
    pub fn free_ram_mb(&self) -> u64 {
        let limit = (self.memory_mb as f64 * self.ram_allocation_ratio) as u64;
        limit.saturating_sub(self.memory_mb_used)
    }

    /// Schedulable vCPUs after overcommit.
    pub fn free_vcpus(&self) -> u32 {
        let limit = (self.vcpus as f64 * self.cpu_allocation_ratio) as u32;
        limit.saturating_sub(self.vcpus_used)
    }

    pub fn free_disk_gb(&self) -> u64 {
        self.local_gb.saturating_sub(self.local_gb_used)
    }

    pub fn is_available(&self) -> bool {
        self.service_up && !self.disabled
    }
}
