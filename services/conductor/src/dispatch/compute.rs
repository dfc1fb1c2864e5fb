//! Typed compute operations.

use std::collections::BTreeMap;
use std::sync::Arc;

use fleet_id::ReservationId;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::{ComputeOperation, DispatchError, DispatchMode, Dispatcher};
use crate::model::{FilterProperties, Flavor, ImageMeta, Instance, Limits, Migration, RequestSpec};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InjectedFile {
    pub path: String,
    pub contents: String,
}

/// Build arguments passed through untouched from the API.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BuildExtras {
    pub admin_password: Option<String>,
    #[serde(default)]
    pub injected_files: Vec<InjectedFile>,
    #[serde(default)]
    pub requested_networks: Vec<String>,
    #[serde(default)]
    pub security_groups: Vec<String>,
    #[serde(default)]
    pub block_device_mapping: Vec<Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuildAndRunArgs {
    pub instance: Instance,
    pub image: Option<ImageMeta>,
    pub request_spec: RequestSpec,
    pub filter_properties: FilterProperties,
    #[serde(flatten)]
    pub extras: BuildExtras,
    pub node: Option<String>,
    pub limits: Limits,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PrepResizeArgs {
    pub instance: Instance,
    pub image: Option<ImageMeta>,
    pub instance_type: Flavor,
    pub reservations: Vec<ReservationId>,
    pub request_spec: RequestSpec,
    pub filter_properties: FilterProperties,
    pub node: Option<String>,
    /// Added in 4.1.
    #[serde(default = "default_clean_shutdown")]
    pub clean_shutdown: bool,
}

fn default_clean_shutdown() -> bool {
    true
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LiveMigrationCheckArgs {
    pub instance: Instance,
    pub block_migration: bool,
    pub disk_over_commit: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LiveMigrationArgs {
    pub instance: Instance,
    pub dest: String,
    pub block_migration: bool,
    pub migrate_data: Value,
    /// Added in 4.2.
    #[serde(default)]
    pub migration: Option<Migration>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RebuildArgs {
    pub instance: Instance,
    pub orig_image_ref: Option<String>,
    pub image_ref: Option<String>,
    #[serde(default)]
    pub injected_files: Vec<InjectedFile>,
    pub new_pass: Option<String>,
    #[serde(default)]
    pub orig_sys_metadata: BTreeMap<String, String>,
    #[serde(default)]
    pub bdms: Vec<Value>,
    pub recreate: bool,
    pub on_shared_storage: bool,
    pub preserve_ephemeral: bool,
    /// Added in 4.5 with `node` and `limits`.
    #[serde(default)]
    pub migration: Option<Migration>,
    #[serde(default)]
    pub node: Option<String>,
    #[serde(default)]
    pub limits: Option<Limits>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UnshelveArgs {
    pub instance: Instance,
    pub image: Option<ImageMeta>,
    pub filter_properties: FilterProperties,
    pub node: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StartArgs {
    pub instance: Instance,
}

/// Compute RPC API.
///
/// Each method picks the operation's dispatch mode; casts resolve once the
/// transport accepted the message.
#[derive(Clone)]
pub struct ComputeApi {
    dispatcher: Arc<dyn Dispatcher>,
}

impl ComputeApi {
    pub fn new(dispatcher: Arc<dyn Dispatcher>) -> Self {
        Self { dispatcher }
    }

    async fn send<T: Serialize + Sync>(
        &self,
        host: &str,
        operation: ComputeOperation,
        args: &T,
    ) -> Result<Value, DispatchError> {
        let payload = serde_json::to_value(args).map_err(|e| DispatchError::Encode {
            operation,
            reason: e.to_string(),
        })?;
        match operation.mode() {
            DispatchMode::Cast => {
                self.dispatcher.cast(host, operation, payload).await?;
                Ok(Value::Null)
            }
            DispatchMode::Call => self.dispatcher.call(host, operation, payload).await,
        }
    }

    pub async fn build_and_run_instance(
        &self,
        host: &str,
        args: &BuildAndRunArgs,
    ) -> Result<(), DispatchError> {
        self.send(host, ComputeOperation::BuildAndRunInstance, args)
            .await
            .map(drop)
    }

    /// Asks the destination to claim resources for a resize.
    pub async fn prep_resize(&self, host: &str, args: &PrepResizeArgs) -> Result<(), DispatchError> {
        self.send(host, ComputeOperation::PrepResize, args)
            .await
            .map(drop)
    }

    /// Runs the destination-side checks and returns the migrate data.
    pub async fn check_can_live_migrate_destination(
        &self,
        destination: &str,
        args: &LiveMigrationCheckArgs,
    ) -> Result<Value, DispatchError> {
        self.send(destination, ComputeOperation::CheckCanLiveMigrateDestination, args)
            .await
    }

    pub async fn live_migration(
        &self,
        source: &str,
        args: &LiveMigrationArgs,
    ) -> Result<(), DispatchError> {
        self.send(source, ComputeOperation::LiveMigration, args)
            .await
            .map(drop)
    }

    pub async fn rebuild_instance(&self, host: &str, args: &RebuildArgs) -> Result<(), DispatchError> {
        self.send(host, ComputeOperation::RebuildInstance, args)
            .await
            .map(drop)
    }

    pub async fn unshelve_instance(
        &self,
        host: &str,
        args: &UnshelveArgs,
    ) -> Result<(), DispatchError> {
        self.send(host, ComputeOperation::UnshelveInstance, args)
            .await
            .map(drop)
    }

    pub async fn start_instance(&self, host: &str, args: &StartArgs) -> Result<(), DispatchError> {
        self.send(host, ComputeOperation::StartInstance, args)
            .await
            .map(drop)
    }
}

impl std::fmt::Debug for ComputeApi {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ComputeApi").finish_non_exhaustive()
    }
}
