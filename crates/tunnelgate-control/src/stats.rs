//! Periodic sync of live peer statistics into the records

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::sync::Arc;
use tracing::debug;
use tunnelgate_drivers::LivePeer;

use crate::error::Result;
use crate::peers::PeerController;
use crate::tunnels::TunnelManager;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSummary {
    pub peers_seen: usize,
    pub tunnels_updated: usize,
}

/// Turns the interface's cumulative per-peer counters into per-tunnel deltas.
///
/// Traffic sent to the peer counts as `bytes_in` (requests entering the
/// tunnel), traffic received from it as `bytes_out`.
pub struct StatsSync {
    peers: Arc<PeerController>,
    tunnels: Arc<TunnelManager>,
    /// Last observed (tx, rx) per public key
    observed: DashMap<String, (u64, u64)>,
    started_at: DateTime<Utc>,
}

impl StatsSync {
    pub fn new(peers: Arc<PeerController>, tunnels: Arc<TunnelManager>) -> Self {
        Self {
            peers,
            tunnels,
            observed: DashMap::new(),
            started_at: Utc::now(),
        }
    }

    pub async fn sync(&self) -> Result<StatsSummary> {
        let mut summary = StatsSummary::default();

        for live in self.peers.live_peers().await? {
            let Some(record) = self.peers.find_by_public_key(&live.public_key).await? else {
                continue;
            };
            summary.peers_seen += 1;

            let fresh = record.created_at >= self.started_at;
            let (delta_in, delta_out) = self.delta(&live, fresh);

            let record = match live.last_handshake {
                Some(handshake) if record.last_seen.map_or(true, |seen| handshake > seen) => {
                    self.peers.touch(record, handshake).await?
                }
                _ => record,
            };

            if delta_in == 0 && delta_out == 0 {
                continue;
            }
            if let Some(tunnel) = self.tunnels.active_for_peer(record.id).await? {
                self.tunnels
                    .record_traffic(tunnel.id, delta_in, delta_out, 0)
                    .await?;
                summary.tunnels_updated += 1;
            }
        }

        debug!(
            "Stats sync: {} peer(s) seen, {} tunnel(s) updated",
            summary.peers_seen, summary.tunnels_updated
        );
        Ok(summary)
    }

    /// Counters are cumulative since the peer was applied; a drop means it was
    /// re-applied and the counters restarted from zero. Peers registered before
    /// this process started only establish a baseline on first sight.
    fn delta(&self, live: &LivePeer, fresh: bool) -> (u64, u64) {
        let current = (live.tx_bytes, live.rx_bytes);
        match self.observed.insert(live.public_key.clone(), current) {
            Some((prev_tx, prev_rx)) => (
                advance(prev_tx, current.0),
                advance(prev_rx, current.1),
            ),
            None if fresh => current,
            None => (0, 0),
        }
    }

    pub fn forget(&self, public_key: &str) {
        self.observed.remove(public_key);
    }

    /// Drop every baseline, after a reset has retracted all peers
    pub fn clear(&self) {
        self.observed.clear();
    }

    /// Number of peers with a recorded baseline
    pub fn tracked_peers(&self) -> usize {
        self.observed.len()
    }
}

fn advance(previous: u64, current: u64) -> u64 {
    if current >= previous {
        current - previous
    } else {
        current
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_advance_handles_counter_restart() {
        assert_eq!(advance(100, 150), 50);
        assert_eq!(advance(100, 100), 0);
        assert_eq!(advance(100, 30), 30);
    }
}
