//! Concrete [`MigrationEnvironment`] for a real host: context-socket
//! redirection via a symlink swap, free-disk via `statvfs`, and daemon
//! config I/O against a configured path. Credential migration still
//! shells out to nothing here — Keychain access belongs to the
//! product's Swift layer, so it stays a documented no-op with a
//! warning, matching spec.md §1's "external collaborators" boundary.

use std::path::PathBuf;

use async_trait::async_trait;
use serde_json::Value;
use tracing::{debug, warn};

use crate::migrate::docker::Engine;
use crate::migrate::error::{MigrateError, MigrateResult};
use crate::migrate::orchestrator::MigrationEnvironment;

pub struct HostMigrationEnvironment {
    /// Where the source engine's daemon config is read from.
    pub source_daemon_config_path: PathBuf,
    /// Where the destination engine's daemon config is written.
    pub destination_daemon_config_path: PathBuf,
    /// Context-socket symlink that `docker` CLI invocations resolve
    /// through; redirected to the source socket for the duration of a
    /// run and restored afterward.
    pub context_socket_path: PathBuf,
    /// Command used to restart the destination docker-machine after a
    /// daemon config write (e.g. `["launchctl", "kickstart", "-k",
    /// "system/com.example.vmhost.dockerd"]`). `None` skips the
    /// restart, useful in tests.
    pub restart_command: Option<Vec<String>>,
}

impl HostMigrationEnvironment {
    async fn restart_destination_daemon(&self) -> MigrateResult<()> {
        let Some(command) = &self.restart_command else {
            debug!("no destination restart command configured, skipping");
            return Ok(());
        };
        let Some((program, args)) = command.split_first() else {
            return Ok(());
        };
        let status = tokio::process::Command::new(program)
            .args(args)
            .status()
            .await
            .map_err(|e| MigrateError::DaemonConfig(format!("failed to restart destination daemon: {e}")))?;
        if !status.success() {
            return Err(MigrateError::DaemonConfig(format!(
                "destination daemon restart exited with {status}"
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl MigrationEnvironment for HostMigrationEnvironment {
    async fn redirect_context_socket(&self, source_socket: &str) -> MigrateResult<()> {
        let backup = backup_path(&self.context_socket_path);
        if self.context_socket_path.exists() {
            tokio::fs::rename(&self.context_socket_path, &backup)
                .await
                .map_err(|e| MigrateError::Other(format!("failed to back up context socket link: {e}")))?;
        }
        #[cfg(unix)]
        tokio::fs::symlink(source_socket, &self.context_socket_path)
            .await
            .map_err(|e| MigrateError::Other(format!("failed to redirect context socket: {e}")))?;
        Ok(())
    }

    async fn restore_context_socket(&self) -> MigrateResult<()> {
        let backup = backup_path(&self.context_socket_path);
        if self.context_socket_path.exists() {
            tokio::fs::remove_file(&self.context_socket_path)
                .await
                .map_err(|e| MigrateError::Other(format!("failed to remove redirected context socket: {e}")))?;
        }
        if backup.exists() {
            tokio::fs::rename(&backup, &self.context_socket_path)
                .await
                .map_err(|e| MigrateError::Other(format!("failed to restore context socket: {e}")))?;
        }
        Ok(())
    }

    async fn free_disk_bytes(&self, path: &str) -> MigrateResult<u64> {
        let path = path.to_string();
        tokio::task::spawn_blocking(move || {
            let stats = nix::sys::statvfs::statvfs(path.as_str())
                .map_err(|e| MigrateError::Other(format!("statvfs({path}) failed: {e}")))?;
            Ok(stats.blocks_available() as u64 * stats.fragment_size() as u64)
        })
        .await
        .map_err(|e| MigrateError::Other(format!("statvfs task panicked: {e}")))?
    }

    async fn migrate_credentials(&self, _source: &Engine, _destination: &Engine) -> MigrateResult<()> {
        warn!("credential migration is handled by the application's keychain layer, not this binary");
        Ok(())
    }

    async fn read_source_daemon_config(&self) -> MigrateResult<Value> {
        match tokio::fs::read_to_string(&self.source_daemon_config_path).await {
            Ok(content) => serde_json::from_str(&content)
                .map_err(|e| MigrateError::DaemonConfig(format!("invalid source daemon config: {e}"))),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Value::Object(Default::default())),
            Err(e) => Err(MigrateError::DaemonConfig(format!("failed to read source daemon config: {e}"))),
        }
    }

    async fn write_destination_daemon_config(&self, rendered: &str) -> MigrateResult<()> {
        tokio::fs::write(&self.destination_daemon_config_path, rendered)
            .await
            .map_err(|e| MigrateError::DaemonConfig(format!("failed to write destination daemon config: {e}")))?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            tokio::fs::set_permissions(&self.destination_daemon_config_path, std::fs::Permissions::from_mode(0o644))
                .await
                .map_err(|e| MigrateError::DaemonConfig(format!("failed to set daemon config permissions: {e}")))?;
        }

        self.restart_destination_daemon().await
    }
}

fn backup_path(path: &std::path::Path) -> PathBuf {
    let mut backup = path.as_os_str().to_owned();
    backup.push(".vmhost-migrate-backup");
    PathBuf::from(backup)
}

/// Stub [`GuestControlDaemon`] for environments with no guest agent
/// wired up yet (e.g. unit tests, or a binary run outside the VM
/// lifecycle). The real implementation talks to the in-guest agent
/// over the product's existing control channel; that wiring is the
/// Swift/VMM layer's responsibility per spec.md §1.
pub struct UnimplementedGuestControlDaemon;

#[async_trait]
impl crate::migrate::sync_channel::GuestControlDaemon for UnimplementedGuestControlDaemon {
    async fn start_receiver(&self, _port: u16) -> MigrateResult<()> {
        Err(MigrateError::SyncChannel(
            "no guest control daemon wired up; this binary needs a real implementation from the VMM layer".into(),
        ))
    }

    async fn register_job(&self, _job_id: u64, _dest_dir: &str) -> MigrateResult<()> {
        Err(MigrateError::SyncChannel("guest control daemon not implemented".into()))
    }

    async fn await_job_complete(&self, _job_id: u64) -> MigrateResult<()> {
        Err(MigrateError::SyncChannel("guest control daemon not implemented".into()))
    }
}
