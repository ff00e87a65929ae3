//! Network migration (spec.md §4.2).
//!
//! Create on destination with a scrubbed request: blank id,
//! created-timestamp, scope and attached containers, `checkDuplicate`
//! set. Compose's default network gets its IPv4 IPAM entries dropped,
//! keeping only IPv6, to avoid colliding with the destination engine's
//! own address allocation.

use bollard::models::{IpamConfig, Network};
use bollard::network::CreateNetworkOptions;

use crate::migrate::docker::Engine;
use crate::migrate::error::MigrateResult;
use crate::migrate::id_translation::TranslationTables;

const COMPOSE_DEFAULT_LABEL: &str = "com.docker.compose.network";

pub async fn migrate(
    destination: &Engine,
    translation: &TranslationTables,
    network: &Network,
) -> MigrateResult<()> {
    let name = network.name.clone().unwrap_or_default();

    let mut ipam_config = network
        .ipam
        .as_ref()
        .and_then(|ipam| ipam.config.clone())
        .unwrap_or_default();

    if is_compose_default(network) {
        ipam_config.retain(is_ipv6_entry);
    }

    let options = CreateNetworkOptions {
        name: name.clone(),
        driver: network.driver.clone().unwrap_or_else(|| "bridge".to_string()),
        check_duplicate: true,
        internal: network.internal.unwrap_or(false),
        attachable: network.attachable.unwrap_or(false),
        ingress: network.ingress.unwrap_or(false),
        ipam: bollard::models::Ipam {
            driver: network.ipam.as_ref().and_then(|i| i.driver.clone()),
            config: Some(ipam_config),
            options: None,
        },
        options: network.options.clone().unwrap_or_default(),
        labels: network.labels.clone().unwrap_or_default(),
        ..Default::default()
    };

    let dest_id = destination.create_network(options).await?;
    translation.record_network(&name, dest_id);
    Ok(())
}

fn is_compose_default(network: &Network) -> bool {
    network
        .labels
        .as_ref()
        .map(|labels| labels.contains_key(COMPOSE_DEFAULT_LABEL))
        .unwrap_or(false)
}

fn is_ipv6_entry(entry: &IpamConfig) -> bool {
    entry
        .subnet
        .as_deref()
        .map(|subnet| subnet.contains(':'))
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ipv4_ipam_entries_are_dropped_for_compose_default() {
        let entries = vec![
            IpamConfig {
                subnet: Some("172.18.0.0/16".into()),
                ..Default::default()
            },
            IpamConfig {
                subnet: Some("fd00::/64".into()),
                ..Default::default()
            },
        ];
        let kept: Vec<_> = entries.into_iter().filter(is_ipv6_entry).collect();
        assert_eq!(kept.len(), 1);
        assert_eq!(kept[0].subnet.as_deref(), Some("fd00::/64"));
    }
}
