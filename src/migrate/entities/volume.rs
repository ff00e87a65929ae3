//! Volume migration (spec.md §4.2).
//!
//! A volume whose `Options` include `device` (bind/tmpfs/etc. driver
//! opts) is metadata-only — creating it on the destination is enough.
//! Otherwise its data directory must be copied: freeze every consuming
//! container (refcounted), sync source mountpoint → destination
//! mountpoint over the sync channel, unfreeze.

use std::collections::HashMap;

use bollard::models::Volume;
use bollard::volume::CreateVolumeOptions;

use crate::migrate::docker::Engine;
use crate::migrate::error::MigrateResult;
use crate::migrate::pause_refcount::PauseRefcountTable;
use crate::migrate::sync_channel::SyncChannel;

pub struct VolumeMigrationContext<'a> {
    pub source: &'a Engine,
    pub destination: &'a Engine,
    pub pause_table: &'a PauseRefcountTable,
    pub sync: &'a SyncChannel,
    /// Containers (already-translated destination ids) that should be
    /// frozen while this volume's data is synced, i.e. every retained
    /// container that mounts it.
    pub consuming_containers: &'a [String],
}

pub async fn migrate(ctx: VolumeMigrationContext<'_>, volume: &Volume) -> MigrateResult<()> {
    let options = CreateVolumeOptions {
        name: volume.name.clone(),
        driver: volume.driver.clone(),
        driver_opts: volume.options.clone(),
        labels: volume.labels.clone(),
    };
    ctx.destination.create_volume(options).await?;

    if is_metadata_only(volume) {
        return Ok(());
    }

    let mut tokens = Vec::with_capacity(ctx.consuming_containers.len());
    for container_id in ctx.consuming_containers {
        tokens.push(ctx.pause_table.freeze(ctx.source, container_id).await?);
    }

    let result = ctx
        .sync
        .sync_directory(ctx.source, &volume.mountpoint, &volume.name)
        .await;

    for token in tokens {
        ctx.pause_table.thaw(ctx.source, token).await;
    }

    result
}

/// True when the volume's driver options name a `device` — a bind
/// mount or tmpfs masquerading as a named volume, which has no data
/// directory of its own to copy.
fn is_metadata_only(volume: &Volume) -> bool {
    has_device_option(&volume.options)
}

fn has_device_option(options: &HashMap<String, String>) -> bool {
    options.contains_key("device")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn device_backed_volumes_are_metadata_only() {
        let mut options = HashMap::new();
        options.insert("device".to_string(), "/mnt/export".to_string());
        assert!(has_device_option(&options));
    }

    #[test]
    fn plain_local_volumes_are_not_metadata_only() {
        let options = HashMap::new();
        assert!(!has_device_option(&options));
    }
}
