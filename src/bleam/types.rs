//! Plain data shared by every session component.

use crate::config::{ADV_DATA_CAPACITY, BLEAM_ID_SIZE, PAYLOAD_CAPACITY};
use heapless::Vec;

/// Connection handle issued by the link layer.
pub type ConnHandle = u16;

/// GATT attribute handle on the peer.
pub type AttHandle = u16;

/// Characteristic value as carried by events and actions.
pub type Payload = Vec<u8, PAYLOAD_CAPACITY>;

/// Raw advertising data of one scan report.
pub type AdvData = Vec<u8, ADV_DATA_CAPACITY>;

/// 48-bit link-layer address, little-endian as on air.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Address(pub [u8; 6]);

/// Stable application-layer identity of a BLEAM.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct BleamId(pub [u8; BLEAM_ID_SIZE]);

/// GAP connection parameters in link-layer units.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct ConnParams {
    /// 1.25 ms units.
    pub min_interval: u16,
    /// 1.25 ms units.
    pub max_interval: u16,
    pub slave_latency: u16,
    /// 10 ms units.
    pub supervision_timeout: u16,
}

impl ConnParams {
    /// True when `interval` (1.25 ms units) lies inside the requested range.
    pub fn accepts_interval(&self, interval: u16) -> bool {
        (self.min_interval..=self.max_interval).contains(&interval)
    }

    /// Answer to a peer-initiated update: keep the peer's request when it
    /// overlaps our range, otherwise insist on ours.
    pub fn reconcile(&self, requested: &ConnParams) -> ConnParams {
        let min = requested.min_interval.max(self.min_interval);
        let max = requested.max_interval.min(self.max_interval);
        if min <= max {
            ConnParams {
                min_interval: min,
                max_interval: max,
                slave_latency: requested.slave_latency,
                supervision_timeout: requested.supervision_timeout,
            }
        } else {
            *self
        }
    }
}

/// Build a payload from a slice that is known to fit.
pub(crate) fn payload(bytes: &[u8]) -> Payload {
    let mut p = Payload::new();
    for &b in bytes.iter().take(PAYLOAD_CAPACITY) {
        let _ = p.push(b);
    }
    p
}
