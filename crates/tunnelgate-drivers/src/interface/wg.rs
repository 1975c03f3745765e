use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::net::Ipv4Addr;
use std::time::Duration;
use tracing::{debug, info};

use super::{InterfaceDriver, InterfaceError, LivePeer};
use crate::exec::{self, ExecError};

/// Drives a kernel (or wireguard-go) interface through the `wg` tool
pub struct WgCommandDriver {
    interface: String,
    wg_binary: String,
    timeout: Duration,
}

impl WgCommandDriver {
    pub fn new(interface: impl Into<String>, timeout: Duration) -> Self {
        Self {
            interface: interface.into(),
            wg_binary: "wg".to_string(),
            timeout,
        }
    }

    /// Use a different `wg` binary (e.g. an absolute path)
    pub fn with_binary(mut self, wg_binary: impl Into<String>) -> Self {
        self.wg_binary = wg_binary.into();
        self
    }

    async fn wg(&self, args: &[&str]) -> Result<String, ExecError> {
        let args: Vec<String> = args.iter().map(|a| a.to_string()).collect();
        let output = exec::run(&self.wg_binary, &args, self.timeout).await?;
        Ok(output.stdout)
    }
}

#[async_trait]
impl InterfaceDriver for WgCommandDriver {
    async fn apply_peer(&self, public_key: &str, address: Ipv4Addr) -> Result<(), InterfaceError> {
        let allowed = format!("{}/32", address);
        self.wg(&[
            "set",
            &self.interface,
            "peer",
            public_key,
            "allowed-ips",
            &allowed,
        ])
        .await?;
        info!("Applied peer {} ({}) on {}", public_key, allowed, self.interface);
        Ok(())
    }

    async fn retract_peer(&self, public_key: &str) -> Result<(), InterfaceError> {
        // `wg set ... remove` succeeds silently for unknown keys
        let live = self.list_peers().await?;
        if !live.iter().any(|p| p.public_key == public_key) {
            return Err(InterfaceError::PeerNotFound(public_key.to_string()));
        }

        self.wg(&["set", &self.interface, "peer", public_key, "remove"])
            .await?;
        info!("Retracted peer {} from {}", public_key, self.interface);
        Ok(())
    }

    async fn list_peers(&self) -> Result<Vec<LivePeer>, InterfaceError> {
        let dump = self.wg(&["show", &self.interface, "dump"]).await?;
        parse_dump(&dump)
    }

    async fn is_up(&self) -> Result<bool, InterfaceError> {
        match self.wg(&["show", &self.interface]).await {
            Ok(_) => Ok(true),
            Err(ExecError::Failed { stderr, .. }) => {
                debug!("Interface {} reported down: {}", self.interface, stderr);
                Ok(false)
            }
            Err(e) => Err(e.into()),
        }
    }
}

/// Parse `wg show <iface> dump`.
///
/// The first line describes the interface itself (4 fields); every following
/// line is a peer: public-key, preshared-key, endpoint, allowed-ips,
/// latest-handshake, transfer-rx, transfer-tx, persistent-keepalive.
pub fn parse_dump(dump: &str) -> Result<Vec<LivePeer>, InterfaceError> {
    let mut peers = Vec::new();

    for line in dump.lines().skip(1).filter(|l| !l.trim().is_empty()) {
        let fields: Vec<&str> = line.split('\t').collect();
        if fields.len() < 8 {
            return Err(InterfaceError::Parse(format!(
                "expected 8 peer fields, got {}: {:?}",
                fields.len(),
                line
            )));
        }

        let number = |idx: usize, what: &str| -> Result<u64, InterfaceError> {
            fields[idx]
                .parse::<u64>()
                .map_err(|e| InterfaceError::Parse(format!("{} {:?}: {}", what, fields[idx], e)))
        };

        let handshake = number(4, "latest-handshake")?;
        let last_handshake = if handshake == 0 {
            None
        } else {
            DateTime::<Utc>::from_timestamp(handshake as i64, 0)
        };

        let allowed_ips = match fields[3] {
            "(none)" | "" => Vec::new(),
            list => list.split(',').map(|s| s.trim().to_string()).collect(),
        };

        let endpoint = match fields[2] {
            "(none)" | "" => None,
            ep => Some(ep.to_string()),
        };

        peers.push(LivePeer {
            public_key: fields[0].to_string(),
            allowed_ips,
            endpoint,
            last_handshake,
            rx_bytes: number(5, "transfer-rx")?,
            tx_bytes: number(6, "transfer-tx")?,
        });
    }

    Ok(peers)
}
