//! Periodic repair of drift between this proxy's stored online set and the
//! players actually connected to it.

use std::sync::Arc;

use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::directory::Directory;
use crate::error::Result;

/// What one sweep changed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// Entries dropped from our set because another live proxy holds the player
    pub stale: usize,
    /// Entries nobody holds, fully cleaned up
    pub orphaned: usize,
    /// Local players re-added to our set
    pub restored: usize,
}

impl SweepReport {
    pub fn is_clean(&self) -> bool {
        *self == Self::default()
    }
}

pub struct Reconciler {
    directory: Arc<Directory>,
}

impl Reconciler {
    pub fn new(directory: Arc<Directory>) -> Self {
        Self { directory }
    }

    /// Compare the stored set against the local roster and repair both
    /// directions. A store error aborts the sweep; the next one retries.
    pub async fn sweep(&self) -> Result<SweepReport> {
        let mut report = SweepReport::default();
        let roster = self.directory.roster();
        let stored = self.directory.stored_members().await?;

        for member in &stored {
            let Ok(player) = Uuid::parse_str(member) else {
                warn!(member = %member, "removing malformed entry from online set");
                self.directory.forget_member(member).await?;
                report.stale += 1;
                continue;
            };
            if roster.contains(&player).await {
                continue;
            }

            match self.directory.find_owning_proxy(player).await? {
                Some(owner) => {
                    debug!(%player, %owner, "player moved to another proxy, dropping stale entry");
                    self.directory.forget_member(member).await?;
                    report.stale += 1;
                }
                None => {
                    warn!(%player, "cleaning up orphaned player");
                    self.directory.release_player(player).await?;
                    report.orphaned += 1;
                }
            }
        }

        for player in roster.ids().await {
            if stored.contains(&player.to_string()) {
                continue;
            }
            warn!(%player, "connected player missing from online set, restoring");
            self.directory.restore_member(player).await?;
            report.restored += 1;
        }

        if !report.is_clean() {
            info!(
                stale = report.stale,
                orphaned = report.orphaned,
                restored = report.restored,
                "reconciliation sweep repaired drift"
            );
        }
        Ok(report)
    }
}
