use crate::bleam::protocol::ErrorType;

/// SAADC full scale for VDD with the internal 0.6 V reference and 1/6 gain.
const VDD_FULL_SCALE_MV: u32 = 3600;

/// 12-bit conversion.
const SAADC_MAX: u32 = 4096;

/// Convert a raw SAADC sample of VDD to millivolts. Negative samples
/// (offset error around 0 V) clamp to zero.
pub fn vdd_millivolts(raw: i16) -> u16 {
    let raw = raw.max(0) as u32;
    (raw * VDD_FULL_SCALE_MV / SAADC_MAX) as u16
}

/// Battery voltage as carried by general health messages: tenths of a
/// volt, rounded to nearest.
pub fn battery_decivolts(millivolts: u16) -> u8 {
    ((millivolts as u32 + 50) / 100).min(u8::MAX as u32) as u8
}

/// Whole minutes of uptime, saturating at the wire width.
pub fn uptime_minutes(uptime_ms: u64) -> u32 {
    (uptime_ms / 60_000).min(u32::MAX as u64) as u32
}

/// Classify the POWER.RESETREAS bits of the last boot.
pub fn error_type_from_reset_reason(resetreas: u32) -> ErrorType {
    const RESETPIN: u32 = 1 << 0;
    const DOG: u32 = 1 << 1;
    const SREQ: u32 = 1 << 2;
    const LOCKUP: u32 = 1 << 3;

    if resetreas & SREQ != 0 {
        ErrorType::SoftReset
    } else if resetreas & (DOG | LOCKUP) != 0 {
        ErrorType::AppMemAccess
    } else if resetreas & RESETPIN != 0 || resetreas == 0 {
        ErrorType::HardReset
    } else {
        ErrorType::Unknown
    }
}
