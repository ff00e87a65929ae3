//! C1a — Migrator Orchestrator. Single entry point [`migrate_all`]
//! running the ten phases from spec.md §4.1 with at most one barrier
//! between phases (the non-container / container split).

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use bollard::container::Config as CreateConfig;
use bollard::models::{ContainerInspectResponse, ContainerSummary, ImageSummary, Network, Volume};
use chrono::{DateTime, Duration as ChronoDuration, Utc};

use crate::error::{CoreError, CoreResult, EntityFailure};
use crate::migrate::dependency_runner::DependencyRunner;
use crate::migrate::docker::Engine;
use crate::migrate::entities::{container as container_entity, image as image_entity, network as network_entity, volume as volume_entity};
use crate::migrate::error::{MigrateError, MigrateResult};
use crate::migrate::id_translation::TranslationTables;
use crate::migrate::manifest::{ContainerDependencies, EngineManifest, SourceId};
use crate::migrate::pause_refcount::PauseRefcountTable;
use crate::migrate::progress::{Phase, ProgressTracker};
use crate::migrate::sync_channel::{GuestControlDaemon, SyncChannel};
use crate::migrate::worker_pool::WorkerPool;

const AGENT_IMAGE: &str = "vmhost/migration-agent:latest";
const K8S_POD_LABEL: &str = "io.kubernetes.pod.namespace";
const ANONYMOUS_VOLUME_LABEL: &str = "com.docker.volume.anonymous";
const THIRTY_DAYS: ChronoDuration = ChronoDuration::days(30);

#[derive(Debug, Clone)]
pub struct MigrateParams {
    pub include_all: bool,
    pub include_containers: bool,
    pub include_volumes: bool,
    pub include_images: bool,
    pub force_if_existing_dest: bool,
    pub source_socket: String,
    pub destination_socket: String,
}

impl Default for MigrateParams {
    fn default() -> Self {
        Self {
            include_all: false,
            include_containers: true,
            include_volumes: true,
            include_images: true,
            force_if_existing_dest: false,
            source_socket: "/var/run/docker.sock".to_string(),
            destination_socket: "/var/run/vmhost-docker.sock".to_string(),
        }
    }
}

/// Marker for a migration that ran every task to completion with no
/// entity failures. A run with at least one entity failure returns
/// [`CoreError::Partial`] instead of this type.
#[derive(Debug, Default)]
pub struct MigrateReport;

/// The OS/product-level glue the orchestrator drives but does not
/// implement itself: docker-context redirection, free-disk
/// inspection, and credential-helper migration are external
/// collaborators per spec.md §1.
#[async_trait]
pub trait MigrationEnvironment: Send + Sync {
    async fn redirect_context_socket(&self, source_socket: &str) -> MigrateResult<()>;
    async fn restore_context_socket(&self) -> MigrateResult<()>;
    async fn free_disk_bytes(&self, path: &str) -> MigrateResult<u64>;
    async fn migrate_credentials(&self, source: &Engine, destination: &Engine) -> MigrateResult<()>;

    /// Daemon config lives on the source host filesystem, outside the
    /// Docker API surface; read as an untyped JSON object (missing file
    /// reads as `{}`).
    async fn read_source_daemon_config(&self) -> MigrateResult<serde_json::Value>;

    /// Write the (non-empty) diff to the destination engine's daemon
    /// config path at mode 0644, then restart its docker-machine.
    async fn write_destination_daemon_config(&self, rendered: &str) -> MigrateResult<()>;
}

pub async fn migrate_all(
    params: MigrateParams,
    environment: Arc<dyn MigrationEnvironment>,
    guest: Arc<dyn GuestControlDaemon>,
    progress: Arc<ProgressTracker>,
) -> CoreResult<MigrateReport> {
    let source = Engine::connect_source(&params.source_socket).map_err(MigrateError::from)?;
    let destination = Engine::connect_destination(&params.destination_socket).map_err(MigrateError::from)?;

    if !params.force_if_existing_dest && destination_has_entities(&destination).await.map_err(MigrateError::from)? {
        return Err(CoreError::Precondition(
            "destination already has entities and --force was not set".to_string(),
        ));
    }

    // Phase 1: enumerate + filter.
    progress.phase(Phase::EnumerateAndFilter);
    let manifest = enumerate_source(&source).await?;
    let filtered = filter_manifest(&manifest, &params);

    let total = 1 + filtered.images.len() as u32
        + filtered.volumes.len() as u32
        + filtered.networks.len() as u32
        + filtered.containers.len() as u32;
    progress.set_total(total);

    // Phase 2: daemon config.
    progress.phase(Phase::DaemonConfig);
    migrate_daemon_config(environment.as_ref()).await?;
    progress.finished("daemon-config", "daemon-config", true);

    // Phase 3: redirect context socket.
    progress.phase(Phase::RedirectContextSocket);
    environment.redirect_context_socket(&params.source_socket).await?;

    // Phase 4: start source agent container; kill it on return regardless
    // of outcome.
    progress.phase(Phase::StartAgent);
    let agent_id = start_agent_container(&source).await?;
    let result = run_remaining_phases(
        &source,
        &destination,
        &filtered,
        &agent_id,
        environment.as_ref(),
        guest,
        progress.clone(),
    )
    .await;

    let _ = source.kill_container(&agent_id).await;
    let _ = source.remove_container(&agent_id, true).await;

    // Phase 10: restore context, regardless of the pipeline's outcome.
    progress.phase(Phase::RestoreContext);
    let _ = environment.restore_context_socket().await;

    result
}

async fn run_remaining_phases(
    source: &Engine,
    destination: &Engine,
    filtered: &FilteredManifest,
    agent_id: &str,
    environment: &dyn MigrationEnvironment,
    guest: Arc<dyn GuestControlDaemon>,
    progress: Arc<ProgressTracker>,
) -> CoreResult<MigrateReport> {
    // Phase 5: disk space.
    progress.phase(Phase::CheckDiskSpace);
    check_disk_space(environment, filtered).await?;

    // Phase 6: sync server.
    progress.phase(Phase::StartSyncServer);
    let sync = Arc::new(
        SyncChannel::start(guest, agent_id.to_string())
            .await
            .map_err(CoreError::from)?,
    );

    let translation = Arc::new(TranslationTables::new());
    let pause_table = Arc::new(PauseRefcountTable::new());
    let mut failures = Vec::new();

    // Phase 7: non-container migrations.
    progress.phase(Phase::MigrateNonContainers);
    let pool = WorkerPool::default_size();
    run_non_container_phase(
        source,
        destination,
        &translation,
        &pause_table,
        &sync,
        filtered,
        &pool,
        &progress,
        &mut failures,
    )
    .await;

    // Network phase barrier (spec.md §5): every non-container task,
    // including every network create, has completed before any
    // container task begins — `run_non_container_phase` already awaited
    // its whole pool batch above.

    // Phase 8: container dependency graph.
    progress.phase(Phase::MigrateContainers);
    run_container_phase(
        source,
        destination,
        &translation,
        &pause_table,
        &sync,
        filtered,
        &pool,
        &progress,
        &mut failures,
    )
    .await;

    // Phase 9: credential helper entries.
    progress.phase(Phase::MigrateCredentials);
    if let Err(e) = environment.migrate_credentials(source, destination).await {
        return Err(CoreError::Fatal {
            phase: "migrate-credentials",
            source: e,
        });
    }

    if failures.is_empty() {
        Ok(MigrateReport::default())
    } else {
        Err(CoreError::Partial { failures })
    }
}

#[allow(clippy::too_many_arguments)]
async fn run_non_container_phase(
    source: &Engine,
    destination: &Engine,
    translation: &Arc<TranslationTables>,
    pause_table: &Arc<PauseRefcountTable>,
    sync: &Arc<SyncChannel>,
    filtered: &FilteredManifest,
    pool: &Arc<WorkerPool>,
    progress: &Arc<ProgressTracker>,
    failures: &mut Vec<EntityFailure>,
) {
    // Networks first: container creation needs the network id table
    // populated.
    for network in &filtered.networks {
        let name = network.name.clone().unwrap_or_default();
        progress.started("network", &name);
        let destination = clone_handle(destination);
        let translation = translation.clone();
        let network = network.clone();
        let progress = progress.clone();
        let outcome = pool
            .spawn(async move {
                let result = network_entity::migrate(&destination, &translation, &network).await;
                progress.finished("network", &network.name.clone().unwrap_or_default(), result.is_ok());
                result
            })
            .await;
        record_failure(failures, "network", &name, outcome);
    }

    for image in &filtered.images {
        let id = image.id.clone();
        progress.started("image", &id);
        let source = clone_handle(source);
        let destination = clone_handle(destination);
        let image = image.clone();
        let progress = progress.clone();
        let outcome = pool
            .spawn(async move {
                let result = image_entity::migrate(&source, &destination, &image).await;
                progress.finished("image", &image.id, result.is_ok());
                result
            })
            .await;
        record_failure(failures, "image", &id, outcome);
    }

    for volume in &filtered.volumes {
        let name = volume.name.clone();
        progress.started("volume", &name);
        let consuming = filtered.volume_consumers(&name);
        let source = clone_handle(source);
        let pause_table = pause_table.clone();
        let sync = sync.clone();
        let destination = clone_handle(destination);
        let volume = volume.clone();
        let progress = progress.clone();
        let outcome = pool
            .spawn(async move {
                let ctx = volume_entity::VolumeMigrationContext {
                    source: &source,
                    destination: &destination,
                    pause_table: &pause_table,
                    sync: &sync,
                    consuming_containers: &consuming,
                };
                let result = volume_entity::migrate(ctx, &volume).await;
                progress.finished("volume", &volume.name, result.is_ok());
                result
            })
            .await;
        record_failure(failures, "volume", &name, outcome);
    }
}

#[allow(clippy::too_many_arguments)]
async fn run_container_phase(
    source: &Engine,
    destination: &Engine,
    translation: &Arc<TranslationTables>,
    pause_table: &Arc<PauseRefcountTable>,
    sync: &Arc<SyncChannel>,
    filtered: &FilteredManifest,
    pool: &Arc<WorkerPool>,
    progress: &Arc<ProgressTracker>,
    failures: &mut Vec<EntityFailure>,
) {
    let runner = DependencyRunner::<SourceId>::new(pool.clone());

    for (summary, inspect) in &filtered.containers {
        let id = summary.id.clone().unwrap_or_default();
        let deps = ContainerDependencies::compute(inspect);
        runner.add_task(id.clone(), deps.container_refs.clone(), {
            let source = clone_handle(source);
            let destination = clone_handle(destination);
            let translation = translation.clone();
            let pause_table = pause_table.clone();
            let sync = sync.clone();
            let inspect = inspect.clone();
            let name = summary
                .names
                .as_ref()
                .and_then(|n| n.first())
                .cloned()
                .unwrap_or_else(|| id.clone());
            let progress = progress.clone();
            let id_for_task = id.clone();
            move |_runner| {
                Box::pin(async move {
                    let ctx = container_entity::ContainerMigrationContext {
                        source: &source,
                        destination: &destination,
                        translation: &translation,
                        pause_table: &pause_table,
                        sync: &sync,
                    };
                    let result = container_entity::migrate(ctx, &id_for_task, &name, &inspect).await;
                    progress.finished("container", &id_for_task, result.is_ok());
                    result
                })
            }
        })
        .await;
    }

    let ids: Vec<SourceId> = filtered
        .containers
        .iter()
        .filter_map(|(summary, _)| summary.id.clone())
        .collect();

    let mut joined = Vec::with_capacity(ids.len());
    for id in &ids {
        joined.push(runner.run(id.clone()));
    }
    let outcomes = futures::future::join_all(joined).await;

    for (id, outcome) in ids.into_iter().zip(outcomes) {
        record_failure(failures, "container", &id, outcome);
    }
}

fn record_failure(failures: &mut Vec<EntityFailure>, kind: &'static str, source_id: &str, outcome: MigrateResult<()>) {
    if let Err(e) = outcome {
        failures.push(EntityFailure {
            source_id: source_id.to_string(),
            kind,
            message: e.to_string(),
        });
    }
}

/// `Engine` wraps a non-`Clone` `bollard::Docker`, but `bollard::Docker`
/// itself is cheaply cloneable (an `Arc`-backed connection pool
/// internally); reconnecting per task would be wasteful and is
/// unnecessary since the underlying handle already supports concurrent
/// use.
fn clone_handle(engine: &Engine) -> Engine {
    Engine {
        docker: engine.docker.clone(),
    }
}

async fn destination_has_entities(destination: &Engine) -> MigrateResult<bool> {
    let containers = destination.list_containers(true).await?;
    if !containers.is_empty() {
        return Ok(true);
    }
    let volumes = destination.list_volumes().await?;
    Ok(!volumes.is_empty())
}

pub async fn enumerate_source(source: &Engine) -> CoreResult<EngineManifest> {
    let images = source.list_images(true).await.map_err(MigrateError::from)?;
    let containers_summary = source.list_containers(true).await.map_err(MigrateError::from)?;
    let networks = source.list_networks().await.map_err(MigrateError::from)?;
    let volumes = source.list_volumes().await.map_err(MigrateError::from)?;

    let mut containers = Vec::with_capacity(containers_summary.len());
    for summary in containers_summary {
        let Some(id) = summary.id.clone() else { continue };
        let inspect = source.inspect_container(&id).await.map_err(MigrateError::from)?;
        containers.push((summary, inspect));
    }

    // Spec.md §3: volumes are re-fetched individually to avoid a
    // source-engine bug where the list response mis-reports bind-mount
    // paths.
    let mut resolved_volumes = Vec::with_capacity(volumes.len());
    for volume in volumes {
        let refreshed = source.inspect_volume(&volume.name).await.map_err(MigrateError::from)?;
        resolved_volumes.push(refreshed);
    }

    Ok(EngineManifest {
        images,
        containers,
        networks,
        volumes: resolved_volumes,
    })
}

pub struct FilteredManifest {
    pub images: Vec<ImageSummary>,
    pub volumes: Vec<Volume>,
    pub networks: Vec<Network>,
    pub containers: Vec<(ContainerSummary, ContainerInspectResponse)>,
}

impl FilteredManifest {
    /// Destination ids of every retained container that mounts `volume`
    /// by name — used to decide which containers must be frozen while
    /// the volume's data directory is synced. Populated lazily against
    /// source ids; the orchestrator resolves them to destination ids
    /// through the translation table before this is consulted, since
    /// volumes are migrated before any container is created — so this
    /// intentionally returns source ids, and [`PauseRefcountTable`]
    /// keys on source ids throughout.
    fn volume_consumers(&self, volume_name: &str) -> Vec<String> {
        self.containers
            .iter()
            .filter_map(|(summary, inspect)| {
                let deps = ContainerDependencies::compute(inspect);
                if deps.volume_names.iter().any(|v| v == volume_name) {
                    summary.id.clone()
                } else {
                    None
                }
            })
            .collect()
    }
}

const BUILTIN_NETWORKS: [&str; 3] = ["bridge", "host", "none"];

pub fn filter_manifest(manifest: &EngineManifest, params: &MigrateParams) -> FilteredManifest {
    let now = Utc::now();

    let containers: Vec<(ContainerSummary, ContainerInspectResponse)> = manifest
        .containers
        .iter()
        .filter(|(summary, inspect)| {
            if !params.include_containers {
                return false;
            }
            if image_is_agent(summary) {
                return false;
            }
            if is_kubernetes_pod(inspect) {
                return false;
            }
            if !params.include_all && !recently_active(inspect, now) {
                return false;
            }
            true
        })
        .cloned()
        .collect();

    let retained_container_ids: HashSet<String> = containers
        .iter()
        .filter_map(|(summary, _)| summary.id.clone())
        .collect();

    let retained_network_names: HashSet<String> = containers
        .iter()
        .flat_map(|(_, inspect)| ContainerDependencies::compute(inspect).network_names)
        .collect();

    let networks: Vec<Network> = manifest
        .networks
        .iter()
        .filter(|network| {
            let name = network.name.clone().unwrap_or_default();
            if BUILTIN_NETWORKS.contains(&name.as_str()) {
                return false;
            }
            if network.scope.as_deref() != Some("local") || network.driver.as_deref() != Some("bridge") {
                return false;
            }
            if !params.include_all && !retained_network_names.contains(&name) {
                return false;
            }
            true
        })
        .cloned()
        .collect();

    let retained_volume_names: HashSet<String> = containers
        .iter()
        .flat_map(|(_, inspect)| ContainerDependencies::compute(inspect).volume_names)
        .collect();

    let volumes: Vec<Volume> = manifest
        .volumes
        .iter()
        .filter(|volume| {
            if !params.include_volumes {
                return false;
            }
            if volume.driver != "local" || volume.scope != Some(bollard::models::VolumeScopeEnum::LOCAL) {
                return false;
            }
            if !params.include_all && is_anonymous_volume(volume) && !retained_volume_names.contains(&volume.name) {
                return false;
            }
            true
        })
        .cloned()
        .collect();

    // `inspect.image` is the content-hash digest the container was
    // actually created from, matching `ImageSummary.id`'s format;
    // `inspect.config.image` is the human-friendly name:tag the
    // container was created with and doesn't compare against `id`.
    let retained_image_ids: HashSet<String> = containers
        .iter()
        .filter_map(|(_, inspect)| inspect.image.clone())
        .collect();

    let images: Vec<ImageSummary> = manifest
        .images
        .iter()
        .filter(|image| {
            if !params.include_images {
                return false;
            }
            if image.id == AGENT_IMAGE {
                return false;
            }
            if params.include_all {
                return true;
            }
            if retained_image_ids.contains(&image.id) {
                return true;
            }
            is_never_pushed(image)
        })
        .cloned()
        .collect();

    let _ = retained_container_ids;

    FilteredManifest {
        images,
        volumes,
        networks,
        containers,
    }
}

fn image_is_agent(summary: &ContainerSummary) -> bool {
    summary.image.as_deref() == Some(AGENT_IMAGE)
}

fn is_kubernetes_pod(inspect: &ContainerInspectResponse) -> bool {
    inspect
        .config
        .as_ref()
        .and_then(|c| c.labels.as_ref())
        .map(|labels| labels.contains_key(K8S_POD_LABEL))
        .unwrap_or(false)
}

fn recently_active(inspect: &ContainerInspectResponse, now: DateTime<Utc>) -> bool {
    let Some(state) = &inspect.state else { return true };
    let started = state.started_at.as_deref().and_then(parse_timestamp);
    let finished = state.finished_at.as_deref().and_then(parse_timestamp);
    let most_recent = match (started, finished) {
        (Some(a), Some(b)) => Some(a.max(b)),
        (Some(a), None) => Some(a),
        (None, Some(b)) => Some(b),
        (None, None) => None,
    };
    match most_recent {
        Some(t) => now - t < THIRTY_DAYS,
        None => true,
    }
}

fn parse_timestamp(s: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s).ok().map(|t| t.with_timezone(&Utc))
}

fn is_anonymous_volume(volume: &Volume) -> bool {
    volume.labels.contains_key(ANONYMOUS_VOLUME_LABEL)
}

fn is_never_pushed(image: &ImageSummary) -> bool {
    let has_tag = !image.repo_tags.iter().all(|t| t == "<none>:<none>") && !image.repo_tags.is_empty();
    let has_digest = image.repo_digests.iter().any(|d| !d.contains("<none>"));
    has_tag && !has_digest
}

async fn migrate_daemon_config(environment: &dyn MigrationEnvironment) -> CoreResult<()> {
    use crate::migrate::daemon_config::{diff_against_reference, is_empty_diff, render};

    let source_config = environment.read_source_daemon_config().await.map_err(CoreError::from)?;
    let diff = diff_against_reference(&source_config);
    if is_empty_diff(&diff) {
        return Ok(());
    }

    let rendered = render(&diff).map_err(CoreError::from)?;
    environment
        .write_destination_daemon_config(&rendered)
        .await
        .map_err(CoreError::from)
}

async fn start_agent_container(source: &Engine) -> CoreResult<String> {
    source
        .pull_image(AGENT_IMAGE, None)
        .await
        .map_err(MigrateError::from)?;

    let config = CreateConfig {
        image: Some(AGENT_IMAGE.to_string()),
        host_config: Some(bollard::models::HostConfig {
            privileged: Some(true),
            network_mode: Some("host".to_string()),
            binds: Some(vec![
                "/var/lib/docker:/var/lib/docker".to_string(),
                "/var/run/docker.sock:/var/run/docker.sock".to_string(),
            ]),
            ..Default::default()
        }),
        ..Default::default()
    };

    let id = source
        .create_container("vmhost-migration-agent", config)
        .await
        .map_err(MigrateError::from)?;
    source.start_container(&id).await.map_err(MigrateError::from)?;
    Ok(id)
}

async fn check_disk_space(environment: &dyn MigrationEnvironment, filtered: &FilteredManifest) -> CoreResult<()> {
    let largest_image = filtered.images.iter().map(|i| i.size as u64).max().unwrap_or(0);
    let need = largest_image.saturating_mul(2);
    let have = environment
        .free_disk_bytes("/var/lib/docker")
        .await
        .map_err(CoreError::from)?;

    if have < need {
        return Err(CoreError::Precondition(format!(
            "insufficient free disk on source: need {need} bytes, have {have}"
        )));
    }
    Ok(())
}
