//! Engine Manifest — a snapshot of the source engine (spec.md §3).

use bollard::models::{ContainerInspectResponse, ContainerSummary, ImageSummary, Network, Volume};

/// Opaque identifier for an [`Entity`]. Images are keyed by content hash,
/// volumes and networks by name, containers by id.
pub type SourceId = String;
pub type DestId = String;

/// The tagged union {Image, Volume, Network, Container} — the unit
/// migrated by the orchestrator.
#[derive(Debug, Clone)]
pub enum Entity {
    Image(ImageSummary),
    Volume(Volume),
    Network(Network),
    Container(ContainerSummary, ContainerInspectResponse),
}

impl Entity {
    pub fn kind(&self) -> &'static str {
        match self {
            Entity::Image(_) => "image",
            Entity::Volume(_) => "volume",
            Entity::Network(_) => "network",
            Entity::Container(_, _) => "container",
        }
    }

    /// The stable source identifier: content hash for images, name for
    /// volumes and networks, id for containers.
    pub fn source_id(&self) -> SourceId {
        match self {
            Entity::Image(i) => i.id.clone(),
            Entity::Volume(v) => v.name.clone(),
            Entity::Network(n) => n.name.clone().unwrap_or_default(),
            Entity::Container(c, _) => c.id.clone().unwrap_or_default(),
        }
    }
}

/// Immutable snapshot of the source engine for the duration of a
/// migration run. Volumes are re-fetched individually (inspect, not
/// list) to work around a source-engine bug that reports a translated
/// host path for bind-mount volumes in the list response.
#[derive(Debug, Clone, Default)]
pub struct EngineManifest {
    pub images: Vec<ImageSummary>,
    pub containers: Vec<(ContainerSummary, ContainerInspectResponse)>,
    pub networks: Vec<Network>,
    pub volumes: Vec<Volume>,
}

/// A node in the container dependency partial order (spec.md §3).
///
/// Container depends-on: its image, its named volumes, its networks
/// (other than the three built-ins), and any container named in its
/// `*Mode`/`VolumesFrom` fields.
#[derive(Debug, Clone, Default)]
pub struct ContainerDependencies {
    pub image_id: Option<SourceId>,
    pub volume_names: Vec<SourceId>,
    pub network_names: Vec<SourceId>,
    pub container_refs: Vec<SourceId>,
}

const BUILTIN_NETWORKS: [&str; 3] = ["bridge", "host", "none"];

/// Parse the `container:<id-or-name>` reference out of a `*Mode`
/// host-config field, if present.
pub fn container_mode_ref(mode: &str) -> Option<&str> {
    mode.strip_prefix("container:")
}

impl ContainerDependencies {
    /// Compute the dependency set for a single inspected container.
    pub fn compute(inspect: &ContainerInspectResponse) -> Self {
        let mut deps = ContainerDependencies::default();

        if let Some(config) = &inspect.config {
            deps.image_id = config.image.clone();
        }

        if let Some(host_config) = inspect.host_config.as_ref() {
            for mode in [
                host_config.network_mode.as_deref(),
                host_config.ipc_mode.as_deref(),
                host_config.cgroupns_mode.as_ref().map(|m| m.as_ref()),
                host_config.pid_mode.as_deref(),
                host_config.uts_mode.as_deref(),
                host_config.userns_mode.as_deref(),
            ]
            .into_iter()
            .flatten()
            {
                if let Some(reference) = container_mode_ref(mode) {
                    deps.container_refs.push(reference.to_string());
                }
            }

            if let Some(volumes_from) = &host_config.volumes_from {
                for entry in volumes_from {
                    let id = entry.split(':').next().unwrap_or(entry);
                    deps.container_refs.push(id.to_string());
                }
            }

            if let Some(binds) = &host_config.binds {
                for bind in binds {
                    // `name:/target[:opts]` — a named-volume bind has no
                    // leading `/` on its source component.
                    if let Some(source) = bind.split(':').next() {
                        if !source.starts_with('/') && !source.is_empty() {
                            deps.volume_names.push(source.to_string());
                        }
                    }
                }
            }
        }

        if let Some(mounts) = &inspect.mounts {
            for mount in mounts {
                if mount.typ == Some(bollard::models::MountPointTypeEnum::VOLUME) {
                    if let Some(name) = &mount.name {
                        if !deps.volume_names.contains(name) {
                            deps.volume_names.push(name.clone());
                        }
                    }
                }
            }
        }

        if let Some(network_settings) = &inspect.network_settings {
            if let Some(networks) = &network_settings.networks {
                for name in networks.keys() {
                    if !BUILTIN_NETWORKS.contains(&name.as_str()) {
                        deps.network_names.push(name.clone());
                    }
                }
            }
        }

        deps
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn container_mode_ref_parses_prefix() {
        assert_eq!(container_mode_ref("container:abc123"), Some("abc123"));
        assert_eq!(container_mode_ref("bridge"), None);
    }

    #[test]
    fn builtin_networks_are_excluded_by_name() {
        for name in BUILTIN_NETWORKS {
            assert!(BUILTIN_NETWORKS.contains(&name));
        }
    }
}
