//! Configuration mode.
//!
//! An unprovisioned scanner advertises as `BLESc` with the Config Service
//! instead of scanning for BLEAMs. A provisioning client writes the
//! application key and the node id, then commits with `DONE` (or throws
//! everything away with `FAIL`). [`Provisioner`] holds that state; the
//! firmware maps GATT writes onto it and persists the result.
//!
//! ## GATT layout
//!
//! | Characteristic | UUID                                   | Perms              |
//! |----------------|----------------------------------------|--------------------|
//! | Service        | `0000b700-0000-0000-0000-00000000ffff` |                    |
//! | VERSION        | `00000001-0000-0000-0000-00000000ffff` | Read               |
//! | STATUS         | `00000002-0000-0000-0000-00000000ffff` | Read, Write, Notify|
//! | APPKEY         | `00000003-0000-0000-0000-00000000ffff` | Write              |
//! | NODE_ID        | `00000004-0000-0000-0000-00000000ffff` | Write              |

use crate::config::{APP_KEY_SIZE, CONFIG_PROTOCOL_ID, CONFIG_SERVICE_UUID16, FIRMWARE_ID, HARDWARE_ID};
use crate::error::ProvisionError;

/// Vendor base shared by the service and its characteristics; the 16-bit
/// alias sits in bits 96..112.
const CONFIG_UUID_BASE: u128 = 0x0000_0000_0000_0000_0000_0000_0000_ffff;

pub const SERVICE_UUID: u128 = config_uuid(CONFIG_SERVICE_UUID16);
pub const CHAR_VERSION: u128 = config_uuid(0x0001);
pub const CHAR_STATUS: u128 = config_uuid(0x0002);
pub const CHAR_APP_KEY: u128 = config_uuid(0x0003);
pub const CHAR_NODE_ID: u128 = config_uuid(0x0004);

/// `[protocol id][firmware id, 2 LE][hardware id]`
pub const VERSION_LEN: usize = 4;

/// Serialized [`NodeConfig`]: `[16 key][node id, 2 BE]`.
pub const NODE_CONFIG_LEN: usize = APP_KEY_SIZE + 2;

const fn config_uuid(alias: u16) -> u128 {
    CONFIG_UUID_BASE | (alias as u128) << 96
}

/// Value of the STATUS characteristic.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(u8)]
pub enum ProvisionStatus {
    /// Waiting for the key and node id.
    Waiting = 0,
    /// Both values are in; waiting for the client to commit.
    Set = 1,
    Done = 2,
    Fail = 3,
}

impl ProvisionStatus {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::Waiting),
            1 => Some(Self::Set),
            2 => Some(Self::Done),
            3 => Some(Self::Fail),
            _ => None,
        }
    }
}

/// What a scanner needs to run: the key BLEAMs sign with and its own id.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct NodeConfig {
    pub app_key: [u8; APP_KEY_SIZE],
    pub node_id: u16,
}

impl NodeConfig {
    pub fn to_bytes(&self) -> [u8; NODE_CONFIG_LEN] {
        let mut buf = [0u8; NODE_CONFIG_LEN];
        buf[..APP_KEY_SIZE].copy_from_slice(&self.app_key);
        buf[APP_KEY_SIZE..].copy_from_slice(&self.node_id.to_be_bytes());
        buf
    }

    /// Parse a stored record. Partial or zeroed records count as missing.
    pub fn from_bytes(data: &[u8]) -> Option<Self> {
        if data.len() != NODE_CONFIG_LEN {
            return None;
        }
        let mut app_key = [0u8; APP_KEY_SIZE];
        app_key.copy_from_slice(&data[..APP_KEY_SIZE]);
        let config = Self {
            app_key,
            node_id: u16::from_be_bytes([data[APP_KEY_SIZE], data[APP_KEY_SIZE + 1]]),
        };
        config.is_complete().then_some(config)
    }

    pub fn is_complete(&self) -> bool {
        self.node_id != 0 && self.app_key != [0; APP_KEY_SIZE]
    }
}

/// Result of a STATUS write.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Commit {
    /// Persist this configuration and leave configuration mode.
    Done(NodeConfig),
    /// Forget everything, including what is stored.
    Failed,
}

fn validate_app_key(raw: &[u8]) -> Result<[u8; APP_KEY_SIZE], ProvisionError> {
    let key: [u8; APP_KEY_SIZE] = raw.try_into().map_err(|_| ProvisionError::Length)?;
    if key == [0; APP_KEY_SIZE] {
        return Err(ProvisionError::Zero);
    }
    Ok(key)
}

fn validate_node_id(raw: &[u8]) -> Result<u16, ProvisionError> {
    let bytes: [u8; 2] = raw.try_into().map_err(|_| ProvisionError::Length)?;
    match u16::from_be_bytes(bytes) {
        0 => Err(ProvisionError::Zero),
        id => Ok(id),
    }
}

/// Config Service state.
#[derive(Debug)]
pub struct Provisioner {
    config: NodeConfig,
    status: ProvisionStatus,
}

impl Default for Provisioner {
    fn default() -> Self {
        Self::new()
    }
}

impl Provisioner {
    pub fn new() -> Self {
        Self {
            config: NodeConfig {
                app_key: [0; APP_KEY_SIZE],
                node_id: 0,
            },
            status: ProvisionStatus::Waiting,
        }
    }

    pub fn status(&self) -> ProvisionStatus {
        self.status
    }

    /// VERSION characteristic value.
    pub fn version() -> [u8; VERSION_LEN] {
        let fw = FIRMWARE_ID.to_le_bytes();
        [CONFIG_PROTOCOL_ID, fw[0], fw[1], HARDWARE_ID]
    }

    pub fn on_app_key_write(&mut self, raw: &[u8]) -> Result<ProvisionStatus, ProvisionError> {
        self.ensure_waiting()?;
        self.config.app_key = validate_app_key(raw)?;
        info!("provision: application key written");
        Ok(self.refresh())
    }

    pub fn on_node_id_write(&mut self, raw: &[u8]) -> Result<ProvisionStatus, ProvisionError> {
        self.ensure_waiting()?;
        self.config.node_id = validate_node_id(raw)?;
        info!("provision: node id {=u16:#x}", self.config.node_id);
        Ok(self.refresh())
    }

    /// Only the client's verdicts are writable: `DONE` once both values
    /// are set, `FAIL` at any time.
    pub fn on_status_write(&mut self, raw: &[u8]) -> Result<Commit, ProvisionError> {
        let &[value] = raw else {
            return Err(ProvisionError::Length);
        };
        match (ProvisionStatus::from_u8(value), self.status) {
            (Some(ProvisionStatus::Done), ProvisionStatus::Set) => {
                self.status = ProvisionStatus::Done;
                info!("provision: committed");
                Ok(Commit::Done(self.config))
            }
            (Some(ProvisionStatus::Fail), _) => {
                warn!("provision: client reported failure, starting over");
                *self = Self::new();
                Ok(Commit::Failed)
            }
            _ => Err(ProvisionError::Status(value)),
        }
    }

    fn ensure_waiting(&self) -> Result<(), ProvisionError> {
        match self.status {
            ProvisionStatus::Waiting => Ok(()),
            _ => Err(ProvisionError::Locked),
        }
    }

    fn refresh(&mut self) -> ProvisionStatus {
        if self.config.is_complete() {
            self.status = ProvisionStatus::Set;
        }
        self.status
    }
}
