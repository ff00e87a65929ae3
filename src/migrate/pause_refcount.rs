//! Pause Refcount Table (spec.md §3).
//!
//! Map container-id→non-negative integer. Incrementing from 0→1 on a
//! currently-running source container issues `pause`; decrementing 1→0
//! issues `unpause`. At most one pause/unpause call is in flight per id,
//! and the counter reflects the number of outstanding overlaps that
//! require the container frozen.
//!
//! Grounded on `system/locker.rs`'s single-permit `Locker`: the table
//! holds one `Locker` per id so the 0→1/1→0 HTTP round trip for a given
//! container serializes without blocking unrelated containers, while the
//! table-wide mutex (held only for the refcount read-modify-write, never
//! across the HTTP call) matches spec.md §5's "no mutex is held across
//! Docker HTTP calls except `ctrPauseRefsMu` during the pause/unpause
//! call itself".

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::migrate::docker::Engine;
use crate::migrate::error::MigrateResult;
use crate::system::Locker;

struct Entry {
    count: u32,
    locker: Arc<Locker>,
}

pub struct PauseRefcountTable {
    entries: Mutex<HashMap<String, Entry>>,
}

impl PauseRefcountTable {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Acquire a freeze on `container_id`, issuing `pause` on the 0→1
    /// transition. Returns a token that must be passed to [`Self::thaw`]
    /// once the caller's overlapping work (a sync-channel job) finishes;
    /// Rust has no async `Drop`, so unlike `system::Locker` this cannot
    /// release itself automatically — the container/volume migrators are
    /// responsible for calling `thaw` in their cleanup path exactly once.
    pub async fn freeze(
        &self,
        source: &Engine,
        container_id: &str,
    ) -> MigrateResult<PauseToken> {
        let locker = {
            let mut entries = self.entries.lock();
            let entry = entries.entry(container_id.to_string()).or_insert_with(|| Entry {
                count: 0,
                locker: Arc::new(Locker::new()),
            });
            entry.locker.clone()
        };

        // Serializes concurrent freeze/thaw on this id without holding the
        // table mutex across the HTTP call.
        let permit = locker.acquire().await.map_err(|e| {
            crate::migrate::error::MigrateError::Other(format!("pause locker: {e}"))
        })?;

        let should_pause = {
            let mut entries = self.entries.lock();
            let entry = entries.get_mut(container_id).expect("entry just inserted");
            entry.count += 1;
            entry.count == 1
        };

        if should_pause {
            source.pause_container(container_id).await?;
        }
        drop(permit);

        Ok(PauseToken {
            container_id: container_id.to_string(),
        })
    }

    /// Release a freeze acquired via [`Self::freeze`], issuing `unpause`
    /// on the 1→0 transition.
    pub async fn thaw(&self, source: &Engine, token: PauseToken) {
        let container_id = &token.container_id;
        let locker = {
            let entries = self.entries.lock();
            entries.get(container_id).map(|e| e.locker.clone())
        };
        let Some(locker) = locker else { return };

        let permit = match locker.acquire().await {
            Ok(p) => p,
            Err(_) => return,
        };

        let should_unpause = {
            let mut entries = self.entries.lock();
            if let Some(entry) = entries.get_mut(container_id.as_str()) {
                entry.count = entry.count.saturating_sub(1);
                entry.count == 0
            } else {
                false
            }
        };

        if should_unpause {
            // An unpause failure is logged and swallowed, per spec.md §5.
            if let Err(e) = source.unpause_container(container_id).await {
                tracing::warn!(container = %container_id, error = %e, "unpause failed");
            }
        }
        drop(permit);
    }

    #[cfg(test)]
    fn count(&self, container_id: &str) -> u32 {
        self.entries
            .lock()
            .get(container_id)
            .map(|e| e.count)
            .unwrap_or(0)
    }
}

impl Default for PauseRefcountTable {
    fn default() -> Self {
        Self::new()
    }
}

/// Token returned by `freeze`, consumed by `thaw`. Held across the sync
/// of a volume's data directory or a container's overlay upper dir, per
/// spec.md §4.2 — the pause→unpause pair must straddle only the sync.
pub struct PauseToken {
    container_id: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn starts_at_zero() {
        let table = PauseRefcountTable::new();
        assert_eq!(table.count("c1"), 0);
    }
}
