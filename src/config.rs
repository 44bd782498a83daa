//! Application-wide constants and runtime configuration.
//!
//! Timing parameters, capacities and protocol sizes live here so they can
//! be tuned in one place. [`ScannerConfig`] bundles the subset that can be
//! changed at runtime and defaults to the constants below.

use crate::bleam::eco::EcoSchedule;
use crate::bleam::types::ConnParams;
use crate::error::ConfigError;

// BLEAM protocol

/// ATT MTU negotiated with BLEAM tags (the default, never raised).
pub const ATT_MTU: usize = 23;

/// Largest characteristic value that fits in one ATT write/notification.
pub const MAX_DATA_LEN: usize = ATT_MTU - 3;

/// Capacity of the payload buffers carried by events and actions.
/// Larger than [`MAX_DATA_LEN`] so oversized peer data can be detected.
pub const PAYLOAD_CAPACITY: usize = 64;

/// Legacy advertising data limit.
pub const ADV_DATA_CAPACITY: usize = 31;

/// Salt sent by a BLEAM at the start of the handshake.
pub const SALT_SIZE: usize = 16;

/// HMAC-SHA256 signature size.
pub const SIGNATURE_SIZE: usize = 32;

/// Each signature half travels in its own SIGN write.
pub const SIGNATURE_PART_SIZE: usize = SIGNATURE_SIZE / 2;

/// Shared application key length.
pub const APP_KEY_SIZE: usize = 16;

/// BLEAM identifier embedded in the advertised 128-bit service UUID.
pub const BLEAM_ID_SIZE: usize = 10;

/// Firmware identifier reported in general health messages.
pub const FIRMWARE_ID: u16 = 8;

// Telemetry

/// Hard capacity of each send queue. The runtime depth may be smaller.
pub const MAX_QUEUE_DEPTH: usize = 20;

/// Ranging records per RSSI write (4 bytes each, 5 fill a 20-byte write).
pub const RSSI_PER_MSG: usize = 5;

/// Health records per HEALTH write.
pub const HEALTH_PER_MSG: usize = 1;

/// Scan samples collected for a BLEAM before the scanner connects.
pub const RSSI_SAMPLES_PER_PEER: usize = 5;

/// Known-peer records kept in RAM (and in flash).
pub const MAX_KNOWN_PEERS: usize = 8;

// Identity correlation

/// Entries per whitelist/blacklist.
pub const MAX_TRACKED_ADDRESSES: usize = 8;

/// Lifetime of blacklist entries and inactive whitelist entries (ms).
pub const IDENTITY_TTL_MS: u64 = 30_000;

/// Period of the identity sweep timer (ms).
pub const IDENTITY_SWEEP_MS: u64 = 5_000;

// Session timing

/// Inactivity timeout while a session is active (ms).
pub const INACTIVITY_TIMEOUT_MS: u64 = 3_000;

/// Upper bound for service discovery (ms).
pub const DISCOVERY_TIMEOUT_MS: u64 = 8_000;

/// Upper bound for the whole salt/time/signature exchange (ms).
pub const HANDSHAKE_TIMEOUT_MS: u64 = 5_000;

/// Delay before the first connection parameter update (ms).
pub const PARAM_UPDATE_FIRST_DELAY_MS: u64 = 50;

/// Delay between subsequent parameter update attempts (ms).
pub const PARAM_UPDATE_NEXT_DELAY_MS: u64 = 500;

/// Parameter update attempts before negotiation gives up.
pub const PARAM_UPDATE_MAX_ATTEMPTS: u8 = 3;

/// Connection interval range (in 1.25 ms units). 120 = 150 ms, 200 = 250 ms.
pub const BLE_CONN_INTERVAL_MIN: u16 = 120;
pub const BLE_CONN_INTERVAL_MAX: u16 = 200;

/// BLE slave latency (number of connection events the peripheral can skip).
pub const BLE_SLAVE_LATENCY: u16 = 0;

/// BLE supervision timeout (in 10 ms units). 400 = 4 s.
pub const BLE_SUP_TIMEOUT: u16 = 400;

// Firmware radio settings

/// Scan interval and window (in 0.625 ms units). 160 = 100 ms, 80 = 50 ms.
pub const BLE_SCAN_INTERVAL: u32 = 160;
pub const BLE_SCAN_WINDOW: u32 = 80;

/// Connection attempt timeout (in 10 ms units). 400 = 4 s.
pub const BLE_CONNECT_TIMEOUT: u16 = 400;

/// Vendor-specific UUID bases the SoftDevice can hold (one per BLEAM id).
pub const BLE_VS_UUID_COUNT: u8 = 10;

/// GPREGRET value the bootloader checks to stay in DFU mode.
pub const DFU_GPREGRET_MAGIC: u32 = 0xB1;

// Eco scanning

/// Length of one eco scan window (ms).
pub const ECO_SCAN_WINDOW_MS: u64 = 1_000;

/// Wake-ups are aligned to multiples of this period, counted from midnight.
pub const TIME_PERIOD_SECS: u32 = 10;

/// Periods between wake-ups during the day and during the night.
pub const TIME_PERIODS_DAY: u32 = 1;
pub const TIME_PERIODS_NIGHT: u32 = 6;

/// Start of day and of night, seconds since midnight.
pub const DAYTIME_START_SECS: u32 = 6 * 60 * 60;
pub const NIGHTTIME_START_SECS: u32 = 60 * 60;

// Provisioning

/// 16-bit alias of the configuration service.
pub const CONFIG_SERVICE_UUID16: u16 = 0xB700;

/// Configuration protocol spoken by this firmware.
pub const CONFIG_PROTOCOL_ID: u8 = 2;

/// Hardware id reported in the VERSION characteristic.
pub const HARDWARE_ID: u8 = 1;

/// Name advertised while waiting to be provisioned.
pub const DEVICE_NAME: &str = "BLESc";

// Known-peer storage

/// Flash page index where known-peer storage starts (4 KB per page on nRF52840).
pub const STORAGE_FLASH_PAGE_START: u32 = 240;

/// Number of flash pages reserved for known-peer storage.
pub const STORAGE_FLASH_PAGE_COUNT: u32 = 4;

/// What a full send queue does with a new entry.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum OverflowPolicy {
    /// Refuse the new entry; the producer sees `QueueFull`.
    RejectNew,
    /// Discard the oldest entry that is not part of an in-flight write.
    DropOldest,
}

/// Runtime configuration of the session engine.
#[derive(Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct ScannerConfig {
    /// Mesh node id of this scanner, stamped on every ranging sample.
    pub node_id: u16,
    pub queue_depth: usize,
    pub ranging_per_message: usize,
    pub health_per_message: usize,
    pub overflow_policy: OverflowPolicy,
    /// Scan samples required before a BLEAM becomes a connection candidate.
    pub samples_before_connect: usize,
    pub conn_params: ConnParams,
    pub param_update_first_delay_ms: u64,
    pub param_update_next_delay_ms: u64,
    pub param_update_max_attempts: u8,
    pub discovery_timeout_ms: u64,
    pub handshake_timeout_ms: u64,
    pub inactivity_timeout_ms: u64,
    pub identity_ttl_ms: u64,
    pub identity_sweep_ms: u64,
    /// Go back to scanning once a session ends instead of idling.
    pub resume_scan_after_session: bool,
    /// Close the session as soon as both send queues drain.
    pub close_when_drained: bool,
    /// Duty-cycle scanning; `None` scans continuously.
    pub eco: Option<EcoSchedule>,
}

impl Default for ScannerConfig {
    fn default() -> Self {
        Self {
            node_id: 0,
            queue_depth: MAX_QUEUE_DEPTH,
            ranging_per_message: RSSI_PER_MSG,
            health_per_message: HEALTH_PER_MSG,
            overflow_policy: OverflowPolicy::RejectNew,
            samples_before_connect: RSSI_SAMPLES_PER_PEER,
            conn_params: ConnParams {
                min_interval: BLE_CONN_INTERVAL_MIN,
                max_interval: BLE_CONN_INTERVAL_MAX,
                slave_latency: BLE_SLAVE_LATENCY,
                supervision_timeout: BLE_SUP_TIMEOUT,
            },
            param_update_first_delay_ms: PARAM_UPDATE_FIRST_DELAY_MS,
            param_update_next_delay_ms: PARAM_UPDATE_NEXT_DELAY_MS,
            param_update_max_attempts: PARAM_UPDATE_MAX_ATTEMPTS,
            discovery_timeout_ms: DISCOVERY_TIMEOUT_MS,
            handshake_timeout_ms: HANDSHAKE_TIMEOUT_MS,
            inactivity_timeout_ms: INACTIVITY_TIMEOUT_MS,
            identity_ttl_ms: IDENTITY_TTL_MS,
            identity_sweep_ms: IDENTITY_SWEEP_MS,
            resume_scan_after_session: true,
            close_when_drained: false,
            eco: None,
        }
    }
}

impl ScannerConfig {
    /// Check the runtime values against the compile-time capacities.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.queue_depth == 0 || self.queue_depth > MAX_QUEUE_DEPTH {
            return Err(ConfigError::QueueDepth);
        }
        if self.ranging_per_message == 0 || self.ranging_per_message > MAX_DATA_LEN / 4 {
            return Err(ConfigError::BatchSize);
        }
        if self.health_per_message == 0 || self.health_per_message > MAX_QUEUE_DEPTH {
            return Err(ConfigError::BatchSize);
        }
        if self.samples_before_connect == 0 || self.samples_before_connect > RSSI_SAMPLES_PER_PEER
        {
            return Err(ConfigError::SampleWindow);
        }
        let params = &self.conn_params;
        if params.min_interval == 0 || params.min_interval > params.max_interval {
            return Err(ConfigError::ConnParams);
        }
        if self.param_update_max_attempts == 0 {
            return Err(ConfigError::RetryCap);
        }
        if self.handshake_timeout_ms == 0
            || self.discovery_timeout_ms == 0
            || self.inactivity_timeout_ms == 0
            || self.identity_sweep_ms == 0
        {
            return Err(ConfigError::Timeout);
        }
        if let Some(eco) = &self.eco {
            eco.validate()?;
        }
        Ok(())
    }
}
