use heapless::String;

use crate::bleam::protocol::bleam_id_from_uuid;
use crate::bleam::types::BleamId;

const AD_INCOMPLETE_128: u8 = 0x06;
const AD_COMPLETE_128: u8 = 0x07;
const AD_SHORT_NAME: u8 = 0x08;
const AD_COMPLETE_NAME: u8 = 0x09;
const AD_MANUFACTURER: u8 = 0xFF;

/// Apple's Bluetooth SIG company identifier, little-endian.
const APPLE_COMPANY_ID: [u8; 2] = [0x4C, 0x00];

/// Iterate over `(ad_type, value)` pairs. A malformed length ends the walk.
fn ad_structures(data: &[u8]) -> impl Iterator<Item = (u8, &[u8])> {
    let mut i = 0;
    core::iter::from_fn(move || {
        let len = *data.get(i)? as usize;
        if len == 0 || i + len >= data.len() {
            return None;
        }
        let ad_type = data[i + 1];
        let value = &data[i + 2..i + 1 + len];
        i += len + 1;
        Some((ad_type, value))
    })
}

/// BLEAM id carried in the 128-bit service UUID of a foreground advertisement.
pub fn bleam_id_from_advertisement(data: &[u8]) -> Option<BleamId> {
    ad_structures(data)
        .filter(|(t, _)| *t == AD_COMPLETE_128 || *t == AD_INCOMPLETE_128)
        .flat_map(|(_, value)| value.chunks_exact(16))
        .find_map(|chunk| {
            let uuid: &[u8; 16] = chunk.try_into().ok()?;
            bleam_id_from_uuid(uuid)
        })
}

/// iOS apps in the background advertise only an Apple manufacturer blob
/// (the service UUID moves into the overflow area).
pub fn is_apple_background(data: &[u8]) -> bool {
    ad_structures(data)
        .any(|(t, value)| t == AD_MANUFACTURER && value.starts_with(&APPLE_COMPANY_ID))
}

/// Extract complete/shortened local name from advertisement data.
pub fn extract_device_name(data: &[u8]) -> String<32> {
    let mut name = String::new();
    if let Some((_, bytes)) =
        ad_structures(data).find(|(t, _)| *t == AD_SHORT_NAME || *t == AD_COMPLETE_NAME)
    {
        for &b in bytes {
            if name.push(b as char).is_err() {
                break;
            }
        }
        return name;
    }
    let _ = name.push_str("Unknown");
    name
}
