use async_trait::async_trait;
use std::collections::BTreeMap;
use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use super::{InterfaceDriver, InterfaceError, LivePeer};
use crate::exec::ExecError;

/// In-process stand-in for a WireGuard interface
pub struct MemoryInterfaceDriver {
    name: String,
    peers: Mutex<BTreeMap<String, LivePeer>>,
    up: AtomicBool,
    fail_applies: AtomicBool,
    command_delay: Mutex<Option<Duration>>,
}

impl MemoryInterfaceDriver {
    pub fn new() -> Self {
        Self {
            name: "wg-mem".to_string(),
            peers: Mutex::new(BTreeMap::new()),
            up: AtomicBool::new(true),
            fail_applies: AtomicBool::new(false),
            command_delay: Mutex::new(None),
        }
    }

    /// Bind a peer directly, bypassing the coordinator (simulates drift)
    pub fn insert_live_peer(&self, public_key: &str, address: Ipv4Addr) {
        self.peers
            .lock()
            .unwrap()
            .insert(public_key.to_string(), Self::live(public_key, address));
    }

    /// Overwrite transfer counters and handshake for a bound peer
    pub fn set_stats(
        &self,
        public_key: &str,
        rx_bytes: u64,
        tx_bytes: u64,
        last_handshake: Option<chrono::DateTime<chrono::Utc>>,
    ) {
        if let Some(peer) = self.peers.lock().unwrap().get_mut(public_key) {
            peer.rx_bytes = rx_bytes;
            peer.tx_bytes = tx_bytes;
            peer.last_handshake = last_handshake;
        }
    }

    pub fn set_up(&self, up: bool) {
        self.up.store(up, Ordering::SeqCst);
    }

    /// Make every subsequent `apply_peer` fail like a broken `wg` invocation
    pub fn fail_applies(&self, fail: bool) {
        self.fail_applies.store(fail, Ordering::SeqCst);
    }

    /// Make `apply_peer` and `retract_peer` take `delay` after changing the
    /// peer table, like a slow `wg` invocation
    pub fn set_command_delay(&self, delay: Duration) {
        *self.command_delay.lock().unwrap() = Some(delay);
    }

    async fn command_latency(&self) {
        let delay = *self.command_delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
    }

    pub fn live_keys(&self) -> Vec<String> {
        self.peers.lock().unwrap().keys().cloned().collect()
    }

    pub fn contains(&self, public_key: &str) -> bool {
        self.peers.lock().unwrap().contains_key(public_key)
    }

    fn live(public_key: &str, address: Ipv4Addr) -> LivePeer {
        LivePeer {
            public_key: public_key.to_string(),
            allowed_ips: vec![format!("{}/32", address)],
            endpoint: None,
            last_handshake: None,
            rx_bytes: 0,
            tx_bytes: 0,
        }
    }
}

impl Default for MemoryInterfaceDriver {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl InterfaceDriver for MemoryInterfaceDriver {
    async fn apply_peer(&self, public_key: &str, address: Ipv4Addr) -> Result<(), InterfaceError> {
        if self.fail_applies.load(Ordering::SeqCst) {
            return Err(InterfaceError::Command(ExecError::Failed {
                command: format!("wg set {} peer {}", self.name, public_key),
                status: "exit status: 1".to_string(),
                stderr: "simulated failure".to_string(),
            }));
        }
        self.peers
            .lock()
            .unwrap()
            .insert(public_key.to_string(), Self::live(public_key, address));
        self.command_latency().await;
        Ok(())
    }

    async fn retract_peer(&self, public_key: &str) -> Result<(), InterfaceError> {
        let removed = self.peers.lock().unwrap().remove(public_key);
        if removed.is_none() {
            return Err(InterfaceError::PeerNotFound(public_key.to_string()));
        }
        self.command_latency().await;
        Ok(())
    }

    async fn list_peers(&self) -> Result<Vec<LivePeer>, InterfaceError> {
        Ok(self.peers.lock().unwrap().values().cloned().collect())
    }

    async fn is_up(&self) -> Result<bool, InterfaceError> {
        Ok(self.up.load(Ordering::SeqCst))
    }
}
