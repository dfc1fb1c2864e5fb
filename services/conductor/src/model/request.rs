//! Placement inputs: what to place and the hints that constrain it.

use std::collections::{BTreeMap, BTreeSet};

use fleet_id::InstanceId;
use serde::{Deserialize, Serialize};

use super::{Flavor, Instance};

const IMAGE_PREFIX: &str = "image_";

/// Image metadata relevant to placement.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageMeta {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub min_ram: u64,
    pub min_disk: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub disk_format: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub container_format: Option<String>,
    #[serde(default)]
    pub properties: BTreeMap<String, String>,
}

impl ImageMeta {
    /// Rebuilds image metadata from the `image_*` keys an instance carries
    /// in its system metadata.
    ///
    /// Known keys map onto fields; everything else lands in `properties`.
    /// Unparseable minimums read as zero.
    pub fn from_system_metadata(
        system_metadata: &BTreeMap<String, String>,
        image_ref: Option<&str>,
    ) -> Self {
        let mut image = ImageMeta {
            id: image_ref.filter(|r| !r.is_empty()).map(str::to_string),
            ..Default::default()
        };

        for (key, value) in system_metadata {
            let Some(name) = key.strip_prefix(IMAGE_PREFIX) else {
                continue;
            };
            match name {
                "min_ram" => image.min_ram = value.parse().unwrap_or(0),
                "min_disk" => image.min_disk = value.parse().unwrap_or(0),
                "disk_format" => image.disk_format = Some(value.clone()),
                "container_format" => image.container_format = Some(value.clone()),
                "name" => image.name = Some(value.clone()),
                _ => {
                    image.properties.insert(name.to_string(), value.clone());
                }
            }
        }

        image
    }
}

/// Advisory resource limits attached to a candidate.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Limits {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub memory_mb: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub disk_gb: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub vcpu: Option<u32>,
}

/// A destination proposed by the scheduler. Valid for one attempt only.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Candidate {
    pub host: String,
    pub node: Option<String>,
    #[serde(default)]
    pub limits: Limits,
}

impl Candidate {
    pub fn new(host: impl Into<String>, node: Option<&str>) -> Self {
        Self {
            host: host.into(),
            node: node.map(str::to_string),
            limits: Limits::default(),
        }
    }

    pub fn with_limits(mut self, limits: Limits) -> Self {
        self.limits = limits;
        self
    }
}

/// Retry bookkeeping forwarded with every placement attempt.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryRecord {
    pub num_attempts: u32,
    /// `[host, node]` pairs already tried.
    pub hosts: Vec<(String, Option<String>)>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exc: Option<String>,
}

/// Server-group constraints copied into the filter properties.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupHints {
    pub group_id: String,
    pub policies: Vec<String>,
    pub hosts: Vec<String>,
}

/// Per-request scheduler hints.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FilterProperties {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ignore_hosts: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry: Option<RetryRecord>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limits: Option<Limits>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group: Option<GroupHints>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub scheduler_hints: BTreeMap<String, String>,
}

impl FilterProperties {
    /// Filter properties that keep the given hosts out of selection.
    pub fn ignoring<I, S>(hosts: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            ignore_hosts: hosts.into_iter().map(Into::into).collect(),
            ..Default::default()
        }
    }

    /// Every host that must not be selected: explicit ignores plus hosts
    /// already tried according to the retry record.
    pub fn excluded_hosts(&self) -> BTreeSet<String> {
        let mut excluded: BTreeSet<String> = self.ignore_hosts.iter().cloned().collect();
        if let Some(retry) = &self.retry {
            excluded.extend(retry.hosts.iter().map(|(host, _)| host.clone()));
        }
        excluded
    }
}

/// Named server group the request belongs to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerGroup {
    pub id: String,
    pub policies: Vec<String>,
    #[serde(default)]
    pub members: Vec<InstanceId>,
    /// Hosts currently running members.
    #[serde(default)]
    pub hosts: Vec<String>,
}

/// Instance fields the scheduler sees.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceProperties {
    pub uuid: InstanceId,
    pub host: Option<String>,
    pub node: Option<String>,
    pub image_ref: Option<String>,
    pub instance_type_id: i64,
    pub vcpus: u32,
    pub memory_mb: u64,
    pub root_gb: u64,
    pub ephemeral_gb: u64,
}

impl InstanceProperties {
    fn new(instance: &Instance, flavor: &Flavor) -> Self {
        Self {
            uuid: instance.id,
            host: instance.host.clone(),
            node: instance.node.clone(),
            image_ref: instance.image_ref.clone(),
            instance_type_id: flavor.id,
            vcpus: flavor.vcpus,
            memory_mb: flavor.memory_mb,
            root_gb: flavor.root_gb,
            ephemeral_gb: flavor.ephemeral_gb,
        }
    }
}

/// Scheduler-facing description of what to place.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestSpec {
    pub image: Option<ImageMeta>,
    pub instance_properties: InstanceProperties,
    pub instance_type: Flavor,
    pub num_instances: u32,
    pub instance_uuids: Vec<InstanceId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group: Option<ServerGroup>,
}

impl RequestSpec {
    /// Spec for placing a single instance with `flavor`.
    pub fn for_instance(instance: &Instance, flavor: &Flavor, image: Option<ImageMeta>) -> Self {
        Self {
            image,
            instance_properties: InstanceProperties::new(instance, flavor),
            instance_type: flavor.clone(),
            num_instances: 1,
            instance_uuids: vec![instance.id],
            group: None,
        }
    }

    /// Spec for a batch placed together. The first instance describes the
    /// shape; `None` for an empty batch.
    pub fn for_batch(instances: &[Instance], image: Option<ImageMeta>) -> Option<Self> {
        let first = instances.first()?;
        let mut spec = Self::for_instance(first, &first.flavor, image);
        spec.num_instances = instances.len() as u32;
        spec.instance_uuids = instances.iter().map(|i| i.id).collect();
        Some(spec)
    }

    pub fn with_group(mut self, group: Option<ServerGroup>) -> Self {
        self.group = group;
        self
    }

    /// JSON rendering used in failure notifications.
    pub fn to_value(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or(serde_json::Value::Null)
    }
}
