//! Container migration (spec.md §4.2) — the most involved entity
//! migrator: inspect on source, rewrite host-config references through
//! the translation tables, create on destination, connect any extra
//! network endpoints, then (overlay2 only) freeze the source and sync
//! its upper directory.

use bollard::container::Config as CreateConfig;
use bollard::models::{ContainerInspectResponse, HostConfig, MountPointTypeEnum, MountTypeEnum};

use crate::migrate::docker::{DockerApiError, Engine};
use crate::migrate::error::{MigrateError, MigrateResult};
use crate::migrate::id_translation::TranslationTables;
use crate::migrate::manifest::{ContainerDependencies, SourceId};
use crate::migrate::pause_refcount::PauseRefcountTable;
use crate::migrate::sync_channel::SyncChannel;

pub struct ContainerMigrationContext<'a> {
    pub source: &'a Engine,
    pub destination: &'a Engine,
    pub translation: &'a TranslationTables,
    pub pause_table: &'a PauseRefcountTable,
    pub sync: &'a SyncChannel,
}

/// Migrate one already-inspected container. The caller (the
/// dependency-runner task body) guarantees every dependency named by
/// [`ContainerDependencies::compute`] has already completed.
pub async fn migrate(
    ctx: ContainerMigrationContext<'_>,
    source_id: &SourceId,
    name: &str,
    inspect: &ContainerInspectResponse,
) -> MigrateResult<()> {
    ctx.translation.record_container_name(name, source_id);

    let mut host_config = inspect.host_config.clone().unwrap_or_default();
    rewrite_host_mnt_prefix(&mut host_config);
    rewrite_mode_references(&mut host_config, ctx.translation)?;
    rewrite_volumes_from(&mut host_config, ctx.translation)?;

    let mut hostname = inspect
        .config
        .as_ref()
        .and_then(|c| c.hostname.clone());
    if host_config
        .network_mode
        .as_deref()
        .map(|m| m.starts_with("container:"))
        .unwrap_or(false)
    {
        hostname = None;
    }

    let (primary_endpoint, extra_endpoints) = rewrite_network_endpoints(inspect, ctx.translation)?;
    if let Some((network_id, _)) = &primary_endpoint {
        host_config.network_mode = Some(network_id.clone());
    }

    append_anonymous_mounts(&mut host_config, inspect);

    let mut platform = inspect.platform.clone();
    if platform.as_deref() == Some("linux") {
        platform = None;
    }

    let create_config = CreateConfig {
        hostname,
        image: inspect.config.as_ref().and_then(|c| c.image.clone()),
        env: inspect.config.as_ref().and_then(|c| c.env.clone()),
        cmd: inspect.config.as_ref().and_then(|c| c.cmd.clone()),
        entrypoint: inspect.config.as_ref().and_then(|c| c.entrypoint.clone()),
        working_dir: inspect.config.as_ref().and_then(|c| c.working_dir.clone()),
        labels: inspect.config.as_ref().and_then(|c| c.labels.clone()),
        exposed_ports: inspect
            .config
            .as_ref()
            .and_then(|c| c.exposed_ports.clone()),
        host_config: Some(host_config),
        ..Default::default()
    };

    let dest_name = name.trim_start_matches('/');
    let create_result = ctx.destination.create_container(dest_name, create_config).await;

    let dest_id = match create_result {
        Ok(id) => {
            ctx.translation.record_container(source_id, id.clone());
            id
        }
        Err(e) if e.is_status_error(409) => {
            return Err(resolve_name_conflict(ctx.destination, ctx.translation, dest_name, e).await);
        }
        Err(e) => return Err(e.into()),
    };

    for (network_id, _) in &extra_endpoints {
        ctx.destination.connect_network(network_id, &dest_id).await?;
    }

    if graph_driver_is_overlay2(inspect) {
        let token = ctx.pause_table.freeze(ctx.source, source_id).await?;
        let upper_dir = overlay_upper_dir(inspect);
        let result = match upper_dir {
            Some(dir) => {
                ctx.sync
                    .sync_directory(ctx.source, &dir, &format!("containers/{dest_id}/upper"))
                    .await
            }
            None => Ok(()),
        };
        ctx.pause_table.thaw(ctx.source, token).await;
        result?;
    } else {
        tracing::info!(
            container = source_id.as_str(),
            driver = graph_driver_name(inspect).unwrap_or("unknown"),
            "skipping data copy for unsupported graph driver"
        );
    }

    Ok(())
}

/// Rule 1: any mount source beginning with `/host_mnt/` has that prefix
/// stripped (the source engine's VM presents the macOS filesystem under
/// that mountpoint; the destination engine does not use the same
/// layout).
fn rewrite_host_mnt_prefix(host_config: &mut HostConfig) {
    const PREFIX: &str = "/host_mnt/";

    if let Some(binds) = host_config.binds.as_mut() {
        for bind in binds.iter_mut() {
            if let Some(rest) = bind.strip_prefix(PREFIX) {
                *bind = format!("/{rest}");
            }
        }
    }

    if let Some(mounts) = host_config.mounts.as_mut() {
        for mount in mounts.iter_mut() {
            if let Some(source) = &mount.source {
                if let Some(rest) = source.strip_prefix(PREFIX) {
                    mount.source = Some(format!("/{rest}"));
                }
            }
        }
    }
}

/// Rule 2: every `*Mode` field of the form `container:<id-or-name>` has
/// its reference translated. Rule 4 (blank `Hostname` under
/// `container:` network mode) is applied by the caller once the
/// rewritten `NetworkMode` is known. `HostConfig::cgroupns_mode` is not
/// in this list: unlike the other `*Mode` fields it's a closed
/// `private`/`host` enum with no `container:<id>` variant, so it never
/// holds a reference for this rule to translate.
fn rewrite_mode_references(
    host_config: &mut HostConfig,
    translation: &TranslationTables,
) -> MigrateResult<()> {
    for mode in [
        &mut host_config.network_mode,
        &mut host_config.ipc_mode,
        &mut host_config.pid_mode,
        &mut host_config.uts_mode,
        &mut host_config.userns_mode,
    ] {
        if let Some(value) = mode {
            if let Some(reference) = value.strip_prefix("container:") {
                let dest_id = translation.resolve_container(reference)?;
                *value = format!("container:{dest_id}");
            }
        }
    }
    Ok(())
}

/// Rule 3: every entry of `VolumesFrom` has its `<id>` portion
/// translated, preserving any trailing `:ro`/`:rw` mode suffix.
fn rewrite_volumes_from(
    host_config: &mut HostConfig,
    translation: &TranslationTables,
) -> MigrateResult<()> {
    let Some(volumes_from) = host_config.volumes_from.as_mut() else {
        return Ok(());
    };
    for entry in volumes_from.iter_mut() {
        let (id, suffix) = match entry.split_once(':') {
            Some((id, suffix)) => (id, Some(suffix)),
            None => (entry.as_str(), None),
        };
        let dest_id = translation.resolve_container(id)?;
        *entry = match suffix {
            Some(suffix) => format!("{dest_id}:{suffix}"),
            None => dest_id,
        };
    }
    Ok(())
}

/// Rules 5 and 7: map every attached endpoint's `NetworkID` through the
/// network translation table. Returns the endpoint to attach at create
/// time (if more than one, the others are connected afterward).
fn rewrite_network_endpoints(
    inspect: &ContainerInspectResponse,
    translation: &TranslationTables,
) -> MigrateResult<(Option<(String, String)>, Vec<(String, String)>)> {
    let Some(networks) = inspect
        .network_settings
        .as_ref()
        .and_then(|settings| settings.networks.clone())
    else {
        return Ok((None, Vec::new()));
    };

    let mut endpoints = Vec::new();
    for (name, _endpoint) in networks {
        let dest_network_id = translation.resolve_network(&name)?;
        endpoints.push((dest_network_id, name));
    }

    if endpoints.is_empty() {
        return Ok((None, Vec::new()));
    }

    let rest = endpoints.split_off(1);
    let primary = endpoints.pop();
    Ok((primary, rest))
}

/// Rule 6: anonymous mount points present in the inspection result but
/// absent from the host-config's declared `Mounts`/`Binds` are
/// volume-backed data the container was created with implicitly (e.g.
/// an image `VOLUME` directive); they must be appended explicitly or
/// the destination container starts with empty storage at that path.
fn append_anonymous_mounts(host_config: &mut HostConfig, inspect: &ContainerInspectResponse) {
    let Some(mounts) = &inspect.mounts else { return };

    let declared_targets: Vec<String> = host_config
        .mounts
        .iter()
        .flatten()
        .filter_map(|m| m.target.clone())
        .chain(
            host_config
                .binds
                .iter()
                .flatten()
                .filter_map(|b| b.split(':').nth(1).map(str::to_string)),
        )
        .collect();

    for mount in mounts {
        if mount.typ != Some(MountPointTypeEnum::VOLUME) {
            continue;
        }
        let Some(destination) = &mount.destination else { continue };
        if declared_targets.contains(destination) {
            continue;
        }
        let Some(name) = &mount.name else { continue };

        let entry = bollard::models::Mount {
            target: Some(destination.clone()),
            source: Some(name.clone()),
            typ: Some(MountTypeEnum::VOLUME),
            read_only: mount.rw.map(|rw| !rw),
            ..Default::default()
        };
        host_config.mounts.get_or_insert_with(Vec::new).push(entry);
    }
}

fn graph_driver_name(inspect: &ContainerInspectResponse) -> Option<&str> {
    inspect
        .graph_driver
        .as_ref()
        .map(|gd| gd.name.as_str())
        .or(inspect.driver.as_deref())
}

fn graph_driver_is_overlay2(inspect: &ContainerInspectResponse) -> bool {
    graph_driver_name(inspect) == Some("overlay2")
}

/// The overlay2 graph driver's `UpperDir`, present in `GraphDriver.Data`
/// on inspect responses for containers using that storage driver.
fn overlay_upper_dir(inspect: &ContainerInspectResponse) -> Option<String> {
    inspect
        .graph_driver
        .as_ref()
        .and_then(|gd| gd.data.get("UpperDir").cloned())
}

/// HTTP 409 on create: the destination already has a container with
/// this name. Inspect it, record the mapping, and surface the conflict
/// as the orchestrator's failure for this entity (spec.md §4.2).
async fn resolve_name_conflict(
    destination: &Engine,
    translation: &TranslationTables,
    name: &str,
    original: DockerApiError,
) -> MigrateError {
    match destination.inspect_container(name).await {
        Ok(conflicting) => {
            if let Some(id) = conflicting.id {
                translation.record_container(&name.to_string(), id);
            }
        }
        Err(inspect_err) => {
            tracing::warn!(%name, error = %inspect_err, "could not resolve name conflict");
        }
    }
    original.into()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bare_linux_platform_is_blanked() {
        let mut platform = Some("linux".to_string());
        if platform.as_deref() == Some("linux") {
            platform = None;
        }
        assert_eq!(platform, None);
    }

    #[test]
    fn architecture_qualified_platform_is_kept() {
        let mut platform = Some("linux/arm64".to_string());
        if platform.as_deref() == Some("linux") {
            platform = None;
        }
        assert_eq!(platform.as_deref(), Some("linux/arm64"));
    }

    #[test]
    fn host_mnt_prefix_is_stripped_from_binds() {
        let mut hc = HostConfig {
            binds: Some(vec!["/host_mnt/Users/me/project:/work".to_string()]),
            ..Default::default()
        };
        rewrite_host_mnt_prefix(&mut hc);
        assert_eq!(hc.binds.unwrap()[0], "/Users/me/project:/work");
    }

    #[test]
    fn volumes_from_translates_id_and_preserves_mode_suffix() {
        let translation = TranslationTables::new();
        translation.record_container(&"src1".to_string(), "dst1".to_string());
        let mut hc = HostConfig {
            volumes_from: Some(vec!["src1:ro".to_string()]),
            ..Default::default()
        };
        rewrite_volumes_from(&mut hc, &translation).unwrap();
        assert_eq!(hc.volumes_from.unwrap()[0], "dst1:ro");
    }

    #[test]
    fn unknown_volumes_from_reference_is_an_error() {
        let translation = TranslationTables::new();
        let mut hc = HostConfig {
            volumes_from: Some(vec!["missing".to_string()]),
            ..Default::default()
        };
        assert!(rewrite_volumes_from(&mut hc, &translation).is_err());
    }
}
