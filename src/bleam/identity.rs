//! Identity correlator - whitelist/blacklist of link-layer addresses.
//!
//! Phones rotate the address a BLEAM advertises from. The whitelist maps
//! an address to the BLEAM id seen in its foreground advertisement, so a
//! later background advertisement from the same address still resolves.
//! The blacklist suppresses reconnects to a peer that just failed and
//! heals itself after a fixed TTL.

use heapless::Vec;

use crate::bleam::types::{Address, BleamId};
use crate::config::MAX_TRACKED_ADDRESSES;
use crate::error::IdentityError;

/// One tracked address.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct IdentityRecord {
    pub address: Address,
    pub id: Option<BleamId>,
    /// Set while an authenticated session with this peer is running.
    pub active: bool,
    /// Last refresh (ms).
    pub timestamp: u64,
}

impl IdentityRecord {
    fn expired(&self, now: u64, ttl: u64) -> bool {
        !self.active && now.saturating_sub(self.timestamp) > ttl
    }
}

type List = Vec<IdentityRecord, MAX_TRACKED_ADDRESSES>;

#[derive(Clone, Debug)]
pub struct IdentityCorrelator {
    whitelist: List,
    blacklist: List,
    ttl: u64,
}

impl IdentityCorrelator {
    pub const fn new(ttl: u64) -> Self {
        Self {
            whitelist: Vec::new(),
            blacklist: Vec::new(),
            ttl,
        }
    }

    /// Add or refresh the address → id mapping.
    pub fn whitelist(&mut self, address: Address, id: BleamId, now: u64) -> Result<(), IdentityError> {
        if let Some(rec) = self.whitelist.iter_mut().find(|r| r.address == address) {
            rec.id = Some(id);
            rec.timestamp = now;
            return Ok(());
        }
        if self.whitelist.is_full() {
            let oldest = self
                .whitelist
                .iter()
                .enumerate()
                .filter(|(_, r)| !r.active)
                .min_by_key(|(_, r)| r.timestamp)
                .map(|(i, _)| i)
                .ok_or(IdentityError::ListFull)?;
            self.whitelist.swap_remove(oldest);
        }
        let _ = self.whitelist.push(IdentityRecord {
            address,
            id: Some(id),
            active: false,
            timestamp: now,
        });
        Ok(())
    }

    /// Suppress reconnects to `address` (and its id, if known) for one TTL.
    pub fn blacklist(&mut self, address: Address, id: Option<BleamId>, now: u64) {
        if let Some(rec) = self.blacklist.iter_mut().find(|r| r.address == address) {
            rec.id = id.or(rec.id);
            rec.timestamp = now;
            return;
        }
        if self.blacklist.is_full() {
            if let Some(oldest) = self
                .blacklist
                .iter()
                .enumerate()
                .min_by_key(|(_, r)| r.timestamp)
                .map(|(i, _)| i)
            {
                self.blacklist.swap_remove(oldest);
            }
        }
        info!("identity: blacklisting {:?}", address);
        let _ = self.blacklist.push(IdentityRecord {
            address,
            id,
            active: false,
            timestamp: now,
        });
    }

    /// Live whitelist entry for `address`.
    pub fn lookup_whitelist(&self, address: &Address, now: u64) -> Option<&IdentityRecord> {
        self.whitelist
            .iter()
            .find(|r| r.address == *address && !r.expired(now, self.ttl))
    }

    /// Live blacklist entry for `address`.
    pub fn lookup_blacklist(&self, address: &Address, now: u64) -> Option<&IdentityRecord> {
        self.blacklist
            .iter()
            .find(|r| r.address == *address && !r.expired(now, self.ttl))
    }

    /// True if the address, or the BLEAM behind it, is blacklisted.
    pub fn is_blacklisted(&self, address: &Address, id: Option<&BleamId>, now: u64) -> bool {
        self.blacklist.iter().any(|r| {
            !r.expired(now, self.ttl)
                && (r.address == *address || (id.is_some() && r.id.as_ref() == id))
        })
    }

    /// Mark the whitelist entry of `address` (in)active. An entry that goes
    /// inactive starts aging from `now`.
    pub fn set_active(&mut self, address: &Address, active: bool, now: u64) {
        if let Some(rec) = self.whitelist.iter_mut().find(|r| r.address == *address) {
            rec.active = active;
            rec.timestamp = now;
        }
    }

    /// Purge expired entries from both lists; returns how many went.
    pub fn sweep(&mut self, now: u64) -> usize {
        let ttl = self.ttl;
        let before = self.whitelist.len() + self.blacklist.len();
        self.whitelist.retain(|r| !r.expired(now, ttl));
        self.blacklist.retain(|r| !r.expired(now, ttl));
        let purged = before - self.whitelist.len() - self.blacklist.len();
        if purged > 0 {
            debug!("identity: swept {=usize} entries", purged);
        }
        purged
    }

    pub fn whitelist_len(&self) -> usize {
        self.whitelist.len()
    }

    pub fn blacklist_len(&self) -> usize {
        self.blacklist.len()
    }
}
