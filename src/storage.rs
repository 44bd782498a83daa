//! Persistent storage for the node configuration and known BLEAMs.
//!
//! Uses the nRF52840's internal flash via `sequential-storage` crate so
//! the scanner keeps its provisioned identity and the sample windows of the
//! BLEAMs it heard across reboots.
//!
//! Storage layout (key-value map):
//!   - `KEY_NODE_CONFIG`: `[16 application key][node id, 2 BE]`.
//!   - `KEY_KNOWN_PEERS`: `[count]` followed by `count` records of
//!     `[10 id][6 addr][1 n][n x (rssi, aoa)]`.
//!
//! Sample timestamps are scanner clock values and are not stored; loaded
//! samples are stamped with the boot time.

use blesc::bleam::{Address, BleamId, KnownPeers, PeerRecord, PeerStore, RangingSample};
use blesc::config::{BLEAM_ID_SIZE, MAX_KNOWN_PEERS, STORAGE_FLASH_PAGE_COUNT, STORAGE_FLASH_PAGE_START};
use blesc::provision::NodeConfig;
use core::ops::Range;
use defmt::{error, info, warn};
use embedded_storage_async::nor_flash::NorFlash;
use sequential_storage::cache::NoCache;
use sequential_storage::map::{fetch_item, store_item};

/// Flash page size for nRF52840 (4 KB).
const FLASH_PAGE_SIZE: u32 = 4096;

/// Start address of our storage region.
const STORAGE_START: u32 = STORAGE_FLASH_PAGE_START * FLASH_PAGE_SIZE;

/// End address (exclusive) of our storage region.
const STORAGE_END: u32 = (STORAGE_FLASH_PAGE_START + STORAGE_FLASH_PAGE_COUNT) * FLASH_PAGE_SIZE;

const KEY_KNOWN_PEERS: u8 = 0x01;
const KEY_NODE_CONFIG: u8 = 0x02;

/// Fixed part of one serialized peer record.
const RECORD_HEADER_LEN: usize = BLEAM_ID_SIZE + 6 + 1;

/// 8 peers x (17 header + 5 x 2 samples) + count byte = 217 bytes max.
const MAX_RECORD_SIZE: usize = 256;

pub type Peers = KnownPeers<MAX_KNOWN_PEERS>;

fn flash_range() -> Range<u32> {
    STORAGE_START..STORAGE_END
}

fn serialize_peers(peers: &Peers, buf: &mut [u8]) -> usize {
    let mut offset = 1;
    let mut count = 0u8;

    for record in peers.iter() {
        let len = RECORD_HEADER_LEN + record.samples.len() * 2;
        if offset + len > buf.len() {
            break;
        }
        let out = &mut buf[offset..offset + len];
        out[..BLEAM_ID_SIZE].copy_from_slice(&record.id.0);
        out[BLEAM_ID_SIZE..BLEAM_ID_SIZE + 6].copy_from_slice(&record.address.0);
        out[RECORD_HEADER_LEN - 1] = record.samples.len() as u8;
        for (i, sample) in record.samples.iter().enumerate() {
            out[RECORD_HEADER_LEN + i * 2] = sample.rssi as u8;
            out[RECORD_HEADER_LEN + i * 2 + 1] = sample.aoa;
        }
        offset += len;
        count += 1;
    }

    buf[0] = count;
    offset
}

fn deserialize_peers(data: &[u8], node_id: u16, now: u64) -> Peers {
    let mut peers = Peers::new();
    let Some((&count, mut rest)) = data.split_first() else {
        return peers;
    };

    for _ in 0..count {
        if rest.len() < RECORD_HEADER_LEN {
            break;
        }
        let samples = rest[RECORD_HEADER_LEN - 1] as usize;
        let len = RECORD_HEADER_LEN + samples * 2;
        if rest.len() < len {
            break;
        }

        let mut id = [0u8; BLEAM_ID_SIZE];
        id.copy_from_slice(&rest[..BLEAM_ID_SIZE]);
        let mut address = [0u8; 6];
        address.copy_from_slice(&rest[BLEAM_ID_SIZE..BLEAM_ID_SIZE + 6]);

        let mut record = PeerRecord::new(BleamId(id), Address(address), now);
        for pair in rest[RECORD_HEADER_LEN..len].chunks_exact(2) {
            let _ = record.samples.push(RangingSample {
                sender: node_id,
                rssi: pair[0] as i8,
                aoa: pair[1],
                timestamp: now,
            });
        }
        peers.put(record);
        rest = &rest[len..];
    }
    peers
}

/// Load the known-peer records, empty when nothing was stored.
pub async fn load_peers(flash: &mut impl NorFlash, node_id: u16, now: u64) -> Peers {
    let mut buf = [0u8; MAX_RECORD_SIZE];

    match fetch_item::<u8, &[u8], _>(flash, flash_range(), &mut NoCache::new(), &mut buf, &KEY_KNOWN_PEERS)
        .await
    {
        Ok(Some(data)) => {
            let peers = deserialize_peers(data, node_id, now);
            info!("Loaded {} known BLEAMs from flash", peers.len());
            peers
        }
        Ok(None) => {
            info!("No known BLEAMs in flash");
            Peers::new()
        }
        Err(e) => {
            error!("Flash read error: {:?}", defmt::Debug2Format(&e));
            Peers::new()
        }
    }
}

/// Persist the known-peer records.
pub async fn save_peers(flash: &mut impl NorFlash, peers: &Peers) {
    let mut buf = [0u8; MAX_RECORD_SIZE];
    let mut data_buf = [0u8; MAX_RECORD_SIZE];

    let len = serialize_peers(peers, &mut data_buf);
    let item = &data_buf[..len];

    match store_item::<u8, &[u8], _>(flash, flash_range(), &mut NoCache::new(), &mut buf, &KEY_KNOWN_PEERS, &item)
        .await
    {
        Ok(()) => info!("Saved {} known BLEAMs to flash", peers.len()),
        Err(e) => error!("Flash write error: {:?}", defmt::Debug2Format(&e)),
    }
}

/// The provisioned node configuration; `None` sends the scanner into
/// configuration mode.
pub async fn load_config(flash: &mut impl NorFlash) -> Option<NodeConfig> {
    let mut buf = [0u8; MAX_RECORD_SIZE];

    match fetch_item::<u8, &[u8], _>(flash, flash_range(), &mut NoCache::new(), &mut buf, &KEY_NODE_CONFIG).await {
        Ok(Some(data)) => {
            let config = NodeConfig::from_bytes(data);
            if config.is_none() {
                warn!("Stored node configuration is incomplete");
            }
            config
        }
        Ok(None) => None,
        Err(e) => {
            error!("Flash read error: {:?}", defmt::Debug2Format(&e));
            None
        }
    }
}

pub async fn save_config(flash: &mut impl NorFlash, config: &NodeConfig) {
    let mut buf = [0u8; MAX_RECORD_SIZE];
    let data = config.to_bytes();
    let item = &data[..];

    match store_item::<u8, &[u8], _>(flash, flash_range(), &mut NoCache::new(), &mut buf, &KEY_NODE_CONFIG, &item)
        .await
    {
        Ok(()) => info!("Saved node configuration (node {=u16:#x})", config.node_id),
        Err(e) => error!("Flash write error: {:?}", defmt::Debug2Format(&e)),
    }
}

/// Forget everything this scanner was provisioned with.
pub async fn erase(flash: &mut impl NorFlash) {
    match sequential_storage::erase_all(flash, flash_range()).await {
        Ok(()) => info!("Storage erased"),
        Err(e) => error!("Flash erase error: {:?}", defmt::Debug2Format(&e)),
    }
}
