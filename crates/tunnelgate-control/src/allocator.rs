//! Address pool and the persisted allocation cursor
//!
//! Addresses are handed out in ascending order from network + 2 (network + 1 is
//! the server's own interface address) up to the last host below broadcast, then
//! wrap back to the start. The last handed-out address is persisted as the
//! `address_cursor` setting in the same transaction that reads it.

use ipnet::Ipv4Net;
use sea_orm::{DatabaseConnection, TransactionTrait};
use std::collections::HashSet;
use std::net::Ipv4Addr;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::error::{ControlError, Result};
use crate::settings::{self, ADDRESS_CURSOR};

/// Host range peers may be assigned from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AddressPool {
    range: Ipv4Net,
}

impl AddressPool {
    /// Ranges narrower than /30 leave no host for peers
    pub fn new(range: Ipv4Net) -> Result<Self> {
        if range.prefix_len() > 30 {
            return Err(ControlError::InvalidRequest(format!(
                "Address range {} has no room for peers (need /30 or wider)",
                range
            )));
        }
        Ok(Self {
            range: range.trunc(),
        })
    }

    pub fn range(&self) -> Ipv4Net {
        self.range
    }

    pub fn first(&self) -> Ipv4Addr {
        Ipv4Addr::from(u32::from(self.range.network()) + 2)
    }

    pub fn last(&self) -> Ipv4Addr {
        Ipv4Addr::from(u32::from(self.range.broadcast()) - 1)
    }

    /// Number of allocatable hosts
    pub fn size(&self) -> u32 {
        u32::from(self.last()) - u32::from(self.first()) + 1
    }

    pub fn contains(&self, addr: Ipv4Addr) -> bool {
        addr >= self.first() && addr <= self.last()
    }

    /// Successor of `cursor`, wrapping past the last host.
    ///
    /// Incrementing the 32-bit value carries from the low octet into the next
    /// one, so `10.8.0.255` is followed by `10.8.1.0` inside a /16.
    pub fn next_after(&self, cursor: Option<Ipv4Addr>) -> Ipv4Addr {
        match cursor {
            Some(addr) if self.contains(addr) && addr != self.last() => {
                Ipv4Addr::from(u32::from(addr) + 1)
            }
            _ => self.first(),
        }
    }
}

/// Serialized allocator over the persisted cursor
pub struct AddressAllocator {
    pool: AddressPool,
    db: DatabaseConnection,
    lock: Mutex<()>,
}

impl AddressAllocator {
    pub fn new(pool: AddressPool, db: DatabaseConnection) -> Self {
        Self {
            pool,
            db,
            lock: Mutex::new(()),
        }
    }

    pub fn pool(&self) -> &AddressPool {
        &self.pool
    }

    /// Reserve the next free address after the cursor.
    ///
    /// `occupied` holds addresses bound by stored peers or on the live interface;
    /// those are skipped. Walks at most one full lap of the range.
    pub async fn allocate(&self, occupied: &HashSet<Ipv4Addr>) -> Result<Ipv4Addr> {
        let _guard = self.lock.lock().await;
        let txn = self.db.begin().await?;

        let cursor = match settings::get(&txn, ADDRESS_CURSOR).await? {
            Some(value) => match value.parse::<Ipv4Addr>() {
                Ok(addr) => Some(addr),
                Err(_) => {
                    warn!("Ignoring unparseable address cursor '{}'", value);
                    None
                }
            },
            None => None,
        };

        let mut candidate = self.pool.next_after(cursor);
        for _ in 0..self.pool.size() {
            if !occupied.contains(&candidate) {
                settings::put(&txn, ADDRESS_CURSOR, &candidate.to_string()).await?;
                txn.commit().await?;
                debug!("Allocated address {} (cursor was {:?})", candidate, cursor);
                return Ok(candidate);
            }
            candidate = self.pool.next_after(Some(candidate));
        }

        Err(ControlError::AddressPoolExhausted(self.pool.range()))
    }

    pub async fn cursor(&self) -> Result<Option<Ipv4Addr>> {
        let value = settings::get(&self.db, ADDRESS_CURSOR).await?;
        Ok(value.and_then(|v| v.parse().ok()))
    }

    /// Forget the cursor so the next allocation starts from the first host
    pub async fn clear(&self) -> Result<()> {
        let _guard = self.lock.lock().await;
        settings::delete(&self.db, ADDRESS_CURSOR).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pool(cidr: &str) -> AddressPool {
        AddressPool::new(cidr.parse().unwrap()).unwrap()
    }

    #[test]
    fn test_bounds() {
        let p = pool("10.8.0.0/16");
        assert_eq!(p.first(), Ipv4Addr::new(10, 8, 0, 2));
        assert_eq!(p.last(), Ipv4Addr::new(10, 8, 255, 254));
        assert_eq!(p.size(), 65533);
    }

    #[test]
    fn test_next_carries_into_next_octet() {
        let p = pool("10.8.0.0/16");
        assert_eq!(
            p.next_after(Some(Ipv4Addr::new(10, 8, 0, 255))),
            Ipv4Addr::new(10, 8, 1, 0)
        );
    }

    #[test]
    fn test_next_wraps_past_last_host() {
        let p = pool("10.8.0.0/29");
        assert_eq!(p.last(), Ipv4Addr::new(10, 8, 0, 6));
        assert_eq!(
            p.next_after(Some(Ipv4Addr::new(10, 8, 0, 6))),
            Ipv4Addr::new(10, 8, 0, 2)
        );
    }

    #[test]
    fn test_missing_or_foreign_cursor_starts_at_first() {
        let p = pool("10.8.0.0/24");
        assert_eq!(p.next_after(None), p.first());
        assert_eq!(p.next_after(Some(Ipv4Addr::new(192, 168, 1, 9))), p.first());
        assert_eq!(p.next_after(Some(Ipv4Addr::new(10, 8, 0, 1))), p.first());
    }

    #[test]
    fn test_too_narrow_range_rejected() {
        assert!(AddressPool::new("10.8.0.0/31".parse().unwrap()).is_err());
        assert_eq!(pool("10.8.0.0/30").size(), 1);
    }
}
