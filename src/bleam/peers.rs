//! Known-peer store - scan samples collected per BLEAM before connecting.

use heapless::Vec;

use crate::bleam::protocol::RangingSample;
use crate::bleam::types::{Address, BleamId};
use crate::config::RSSI_SAMPLES_PER_PEER;

/// Everything remembered about one BLEAM between sessions.
#[derive(Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct PeerRecord {
    pub id: BleamId,
    /// Address the BLEAM was last heard from.
    pub address: Address,
    pub samples: Vec<RangingSample, RSSI_SAMPLES_PER_PEER>,
    /// Last update (ms).
    pub timestamp: u64,
}

impl PeerRecord {
    pub fn new(id: BleamId, address: Address, now: u64) -> Self {
        Self {
            id,
            address,
            samples: Vec::new(),
            timestamp: now,
        }
    }

    pub fn sample_count(&self) -> usize {
        self.samples.len()
    }

    pub fn staleness(&self, now: u64) -> u64 {
        now.saturating_sub(self.timestamp)
    }

    pub fn latest(&self) -> Option<&RangingSample> {
        self.samples.last()
    }
}

/// Storage of [`PeerRecord`]s keyed by BLEAM id.
pub trait PeerStore {
    fn get(&self, id: &BleamId) -> Option<&PeerRecord>;

    /// Insert or replace the record of `record.id`.
    fn put(&mut self, record: PeerRecord);

    fn remove(&mut self, id: &BleamId) -> Option<PeerRecord>;

    fn iter(&self) -> impl Iterator<Item = &PeerRecord>;

    /// Append `sample` to the window of `id` (oldest sample falls out when
    /// the window is full). Returns true once `window` samples are held.
    fn record_sample(
        &mut self,
        id: BleamId,
        address: Address,
        sample: RangingSample,
        now: u64,
        window: usize,
    ) -> bool {
        let mut record = self
            .get(&id)
            .cloned()
            .unwrap_or_else(|| PeerRecord::new(id, address, now));
        if record.samples.is_full() {
            record.samples.remove(0);
        }
        let _ = record.samples.push(sample);
        record.address = address;
        record.timestamp = now;
        let full = record.samples.len() >= window;
        self.put(record);
        full
    }
}

/// RAM-backed store of at most `N` peers. When full, the stalest record
/// makes room.
#[derive(Clone, Debug, Default)]
pub struct KnownPeers<const N: usize> {
    records: Vec<PeerRecord, N>,
}

impl<const N: usize> KnownPeers<N> {
    pub const fn new() -> Self {
        Self {
            records: Vec::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn clear(&mut self) {
        self.records.clear();
    }
}

impl<const N: usize> PeerStore for KnownPeers<N> {
    fn get(&self, id: &BleamId) -> Option<&PeerRecord> {
        self.records.iter().find(|r| r.id == *id)
    }

    fn put(&mut self, record: PeerRecord) {
        if let Some(slot) = self.records.iter_mut().find(|r| r.id == record.id) {
            *slot = record;
            return;
        }
        if self.records.is_full() {
            if let Some(stalest) = self
                .records
                .iter()
                .enumerate()
                .min_by_key(|(_, r)| r.timestamp)
                .map(|(i, _)| i)
            {
                debug!("peers: evicting {:?}", self.records[stalest].id);
                self.records.swap_remove(stalest);
            }
        }
        let _ = self.records.push(record);
    }

    fn remove(&mut self, id: &BleamId) -> Option<PeerRecord> {
        let index = self.records.iter().position(|r| r.id == *id)?;
        Some(self.records.swap_remove(index))
    }

    fn iter(&self) -> impl Iterator<Item = &PeerRecord> {
        self.records.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(n: u8) -> BleamId {
        BleamId([n; 10])
    }

    fn sample(rssi: i8, t: u64) -> RangingSample {
        RangingSample {
            sender: 1,
            rssi,
            aoa: 0,
            timestamp: t,
        }
    }

    #[test]
    fn window_fills_after_n_samples() {
        let mut peers: KnownPeers<4> = KnownPeers::new();
        let a = Address([1; 6]);
        for t in 0..2 {
            assert!(!peers.record_sample(id(1), a, sample(-40, t), t, 3));
        }
        assert!(peers.record_sample(id(1), a, sample(-41, 2), 2, 3));
        assert_eq!(peers.get(&id(1)).unwrap().sample_count(), 3);
    }

    #[test]
    fn window_slides_when_full() {
        let mut peers: KnownPeers<4> = KnownPeers::new();
        let a = Address([1; 6]);
        for t in 0..(RSSI_SAMPLES_PER_PEER as u64 + 2) {
            peers.record_sample(id(1), a, sample(-(t as i8), t), t, RSSI_SAMPLES_PER_PEER);
        }
        let rec = peers.get(&id(1)).unwrap();
        assert_eq!(rec.sample_count(), RSSI_SAMPLES_PER_PEER);
        assert_eq!(rec.samples[0].timestamp, 2);
        assert_eq!(rec.latest().unwrap().timestamp, RSSI_SAMPLES_PER_PEER as u64 + 1);
    }

    #[test]
    fn address_follows_latest_sample() {
        let mut peers: KnownPeers<4> = KnownPeers::new();
        peers.record_sample(id(1), Address([1; 6]), sample(-40, 0), 0, 5);
        peers.record_sample(id(1), Address([2; 6]), sample(-40, 10), 10, 5);
        let rec = peers.get(&id(1)).unwrap();
        assert_eq!(rec.address, Address([2; 6]));
        assert_eq!(rec.staleness(25), 15);
    }

    #[test]
    fn full_store_evicts_stalest() {
        let mut peers: KnownPeers<2> = KnownPeers::new();
        peers.put(PeerRecord::new(id(1), Address([1; 6]), 100));
        peers.put(PeerRecord::new(id(2), Address([2; 6]), 50));
        peers.put(PeerRecord::new(id(3), Address([3; 6]), 200));
        assert_eq!(peers.len(), 2);
        assert!(peers.get(&id(2)).is_none());
        assert!(peers.get(&id(1)).is_some());
        assert!(peers.get(&id(3)).is_some());
    }

    #[test]
    fn remove_returns_record() {
        let mut peers: KnownPeers<2> = KnownPeers::new();
        peers.put(PeerRecord::new(id(1), Address([1; 6]), 0));
        assert_eq!(peers.remove(&id(1)).map(|r| r.id), Some(id(1)));
        assert!(peers.remove(&id(1)).is_none());
        assert!(peers.is_empty());
    }
}
