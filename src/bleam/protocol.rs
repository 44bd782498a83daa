//! BLEAM service wire protocol.
//!
//! Characteristic aliases, control commands, operating modes, the events
//! published to observers and the byte layouts of every payload the
//! scanner writes or parses.

use crate::config::{BLEAM_ID_SIZE, MAX_DATA_LEN, SALT_SIZE, SIGNATURE_PART_SIZE};
use crate::bleam::types::{BleamId, Payload};

/// 16-bit alias of the BLEAM primary service inside its 128-bit UUID.
pub const SERVICE_UUID16: u16 = 0xB500;

/// Octets of the 128-bit service UUID holding [`SERVICE_UUID16`] (LE).
const ALIAS_OFFSET: usize = 12;

/// Octets of the 128-bit service UUID holding the BLEAM id (reversed).
const ID_OFFSET: usize = 2;

/// CCCD value enabling notifications.
pub const CCCD_NOTIFY: [u8; 2] = [0x01, 0x00];

/// CCCD value disabling notifications.
pub const CCCD_OFF: [u8; 2] = [0x00, 0x00];

/// The five characteristics of the BLEAM service.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Characteristic {
    /// Control channel: commands from the peer arrive as notifications.
    Notify,
    Sign,
    Rssi,
    Health,
    Time,
}

impl Characteristic {
    pub const ALL: [Characteristic; 5] = [
        Characteristic::Notify,
        Characteristic::Sign,
        Characteristic::Rssi,
        Characteristic::Health,
        Characteristic::Time,
    ];

    pub const fn uuid16(self) -> u16 {
        match self {
            Characteristic::Notify => 0xB501,
            Characteristic::Sign => 0xB502,
            Characteristic::Rssi => 0xB503,
            Characteristic::Health => 0xB504,
            Characteristic::Time => 0xB505,
        }
    }

    pub fn from_uuid16(uuid: u16) -> Option<Self> {
        Self::ALL.into_iter().find(|c| c.uuid16() == uuid)
    }
}

/// Command byte leading every control/SIGN payload.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(u8)]
pub enum Command {
    Salt = 0,
    Dfu = 1,
    Sign1 = 2,
    Sign2 = 3,
    Reboot = 4,
    Unconfig = 5,
}

impl Command {
    /// Commands that only make sense inside the handshake.
    pub fn is_handshake(self) -> bool {
        matches!(self, Command::Salt | Command::Sign1 | Command::Sign2)
    }
}

impl TryFrom<u8> for Command {
    type Error = u8;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Command::Salt),
            1 => Ok(Command::Dfu),
            2 => Ok(Command::Sign1),
            3 => Ok(Command::Sign2),
            4 => Ok(Command::Reboot),
            5 => Ok(Command::Unconfig),
            other => Err(other),
        }
    }
}

/// Operating mode of an active session.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Mode {
    #[default]
    None,
    Rssi,
    Dfu,
    Reboot,
    Unconfig,
}

impl Mode {
    /// One-way requests handed to the DFU/power layers.
    pub fn is_terminal(self) -> bool {
        matches!(self, Mode::Dfu | Mode::Reboot | Mode::Unconfig)
    }
}

/// Events published to observers (LED, power, application layers).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum ServiceEvent {
    NotificationEnabled,
    NotificationDisabled,
    DiscoveryComplete,
    ServiceNotFound,
    BadConnection,
    Disconnected,
    Connected,
    ReceivedSalt,
    ReceivedTime,
    DoneSendingSignature,
    DoneSending,
}

/// Check the alias octets of an advertised/discovered 128-bit UUID and
/// pull out the BLEAM id. `uuid` is little-endian as on air.
pub fn bleam_id_from_uuid(uuid: &[u8; 16]) -> Option<BleamId> {
    let alias = u16::from_le_bytes([uuid[ALIAS_OFFSET], uuid[ALIAS_OFFSET + 1]]);
    if alias != SERVICE_UUID16 {
        return None;
    }
    let mut id = [0u8; BLEAM_ID_SIZE];
    for (dst, src) in id.iter_mut().zip(uuid[ID_OFFSET..ALIAS_OFFSET].iter().rev()) {
        *dst = *src;
    }
    Some(BleamId(id))
}

/// Inverse of [`bleam_id_from_uuid`] with the alias replaced by `uuid16`
/// (service or characteristic). The two leading base octets stay zero.
pub fn uuid_for(id: &BleamId, uuid16: u16) -> [u8; 16] {
    let mut uuid = [0u8; 16];
    for (dst, src) in uuid[ID_OFFSET..ALIAS_OFFSET].iter_mut().zip(id.0.iter().rev()) {
        *dst = *src;
    }
    uuid[ALIAS_OFFSET..ALIAS_OFFSET + 2].copy_from_slice(&uuid16.to_le_bytes());
    uuid
}

/// `[SALT][16-byte salt]` as sent by the peer.
pub fn parse_salt(data: &[u8]) -> Option<[u8; SALT_SIZE]> {
    if data.len() != 1 + SALT_SIZE || data[0] != Command::Salt as u8 {
        return None;
    }
    let mut salt = [0u8; SALT_SIZE];
    salt.copy_from_slice(&data[1..]);
    Some(salt)
}

/// TIME read response: milliseconds since midnight, u32 LE.
pub fn parse_time(data: &[u8]) -> Option<u32> {
    let bytes: [u8; 4] = data.try_into().ok()?;
    Some(u32::from_le_bytes(bytes))
}

/// Half of a peer countersignature, `[SIGN1|SIGN2][16 bytes]`.
pub fn parse_signature_part(cmd: Command, data: &[u8]) -> Option<[u8; SIGNATURE_PART_SIZE]> {
    if data.len() != 1 + SIGNATURE_PART_SIZE || data[0] != cmd as u8 {
        return None;
    }
    let mut part = [0u8; SIGNATURE_PART_SIZE];
    part.copy_from_slice(&data[1..]);
    Some(part)
}

/// `[SIGN1|SIGN2][16 signature bytes]`, or `[SALT][16-byte salt]` for the
/// challenge of a mode change.
pub fn signature_part(cmd: Command, part: &[u8]) -> Payload {
    let mut p = Payload::new();
    let _ = p.push(cmd as u8);
    for &b in part.iter().take(SIGNATURE_PART_SIZE) {
        let _ = p.push(b);
    }
    p
}

/// A record that can be packed into a telemetry write.
pub trait WireRecord {
    /// Encoded size in bytes.
    fn wire_len(&self) -> usize;
    /// Append the encoding to `out`. Callers check capacity first.
    fn encode(&self, out: &mut Payload);
}

/// One RSSI/AoA observation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct RangingSample {
    /// Node id of the scanner that heard the BLEAM.
    pub sender: u16,
    pub rssi: i8,
    pub aoa: u8,
    /// Scanner clock (ms); stays local.
    pub timestamp: u64,
}

pub const RANGING_WIRE_LEN: usize = 4;

impl WireRecord for RangingSample {
    fn wire_len(&self) -> usize {
        RANGING_WIRE_LEN
    }

    fn encode(&self, out: &mut Payload) {
        let _ = out.extend_from_slice(&self.sender.to_le_bytes());
        let _ = out.push(self.rssi as u8);
        let _ = out.push(self.aoa);
    }
}

/// Last recorded fault category, as stored by the error handler.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(u8)]
pub enum ErrorType {
    HardReset = 0x00,
    SdAssert = 0x01,
    AppMemAccess = 0x02,
    SoftReset = 0x0F,
    SdkAssert = 0x11,
    SdkError = 0x12,
    Unknown = 0xFF,
}

const HEALTH_GENERAL: u8 = 0x01;
const HEALTH_ERROR: u8 = 0x02;

pub const HEALTH_GENERAL_LEN: usize = 15;
pub const HEALTH_ERROR_LEN: usize = 20;

/// Length of the source file name carried by error health messages.
pub const FILE_NAME_LEN: usize = 13;

/// Health report written to the HEALTH characteristic.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum HealthEvent {
    General {
        /// Battery voltage in tenths of a volt.
        battery: u8,
        firmware_id: u16,
        uptime_min: u32,
        /// Seconds since midnight.
        system_time: u32,
        last_error_id: u16,
        last_error_type: ErrorType,
    },
    Error {
        code: u32,
        line: u16,
        file: [u8; FILE_NAME_LEN],
    },
}

impl HealthEvent {
    /// Error report with `file` truncated/zero-padded to the wire width.
    pub fn error(code: u32, line: u16, file: &str) -> Self {
        let mut name = [0u8; FILE_NAME_LEN];
        for (dst, src) in name.iter_mut().zip(file.bytes()) {
            *dst = src;
        }
        HealthEvent::Error {
            code,
            line,
            file: name,
        }
    }
}

impl WireRecord for HealthEvent {
    fn wire_len(&self) -> usize {
        match self {
            HealthEvent::General { .. } => HEALTH_GENERAL_LEN,
            HealthEvent::Error { .. } => HEALTH_ERROR_LEN,
        }
    }

    fn encode(&self, out: &mut Payload) {
        match *self {
            HealthEvent::General {
                battery,
                firmware_id,
                uptime_min,
                system_time,
                last_error_id,
                last_error_type,
            } => {
                let _ = out.push(HEALTH_GENERAL);
                let _ = out.push(battery);
                let _ = out.extend_from_slice(&firmware_id.to_le_bytes());
                let _ = out.extend_from_slice(&uptime_min.to_le_bytes());
                let _ = out.extend_from_slice(&system_time.to_le_bytes());
                let _ = out.extend_from_slice(&last_error_id.to_le_bytes());
                let _ = out.push(last_error_type as u8);
            }
            HealthEvent::Error { code, line, file } => {
                let _ = out.push(HEALTH_ERROR);
                let _ = out.extend_from_slice(&code.to_le_bytes());
                let _ = out.extend_from_slice(&line.to_le_bytes());
                let _ = out.extend_from_slice(&file);
            }
        }
    }
}

/// Peer payloads larger than one ATT value are never interpreted.
pub fn within_data_len(data: &[u8]) -> bool {
    data.len() <= MAX_DATA_LEN
}
