//! Discovery adapter - turns generic GATT discovery results into a
//! validated [`HandleSet`] for the BLEAM service.

use crate::bleam::protocol::{bleam_id_from_uuid, Characteristic};
use crate::bleam::types::{AttHandle, BleamId};
use crate::error::DiscoveryError;

/// Attribute handles of a fully discovered BLEAM service.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct HandleSet {
    pub control: AttHandle,
    pub control_cccd: AttHandle,
    pub sign: AttHandle,
    pub rssi: AttHandle,
    pub health: AttHandle,
    pub time: AttHandle,
}

impl HandleSet {
    /// Which characteristic a value handle belongs to.
    pub fn characteristic(&self, attr: AttHandle) -> Option<Characteristic> {
        match attr {
            a if a == self.control => Some(Characteristic::Notify),
            a if a == self.sign => Some(Characteristic::Sign),
            a if a == self.rssi => Some(Characteristic::Rssi),
            a if a == self.health => Some(Characteristic::Health),
            a if a == self.time => Some(Characteristic::Time),
            _ => None,
        }
    }
}

/// Collects discovery results until the procedure completes.
#[derive(Clone, Debug, Default)]
pub struct HandleSetBuilder {
    expected: Option<BleamId>,
    service_found: bool,
    control: Option<AttHandle>,
    control_cccd: Option<AttHandle>,
    sign: Option<AttHandle>,
    rssi: Option<AttHandle>,
    health: Option<AttHandle>,
    time: Option<AttHandle>,
}

impl HandleSetBuilder {
    /// Builder accepting only the service of the BLEAM `expected`.
    pub fn for_bleam(expected: BleamId) -> Self {
        Self {
            expected: Some(expected),
            ..Default::default()
        }
    }

    /// A primary service was reported. Returns true if it is ours.
    pub fn on_service(&mut self, uuid: &[u8; 16]) -> bool {
        let Some(id) = bleam_id_from_uuid(uuid) else {
            return false;
        };
        if self.expected.is_some_and(|expected| expected != id) {
            warn!("discovery: service of another BLEAM ignored");
            return false;
        }
        self.service_found = true;
        true
    }

    /// A characteristic of the BLEAM service was reported.
    pub fn on_characteristic(
        &mut self,
        uuid16: u16,
        value_handle: AttHandle,
        cccd_handle: Option<AttHandle>,
    ) {
        let Some(characteristic) = Characteristic::from_uuid16(uuid16) else {
            debug!("discovery: unknown characteristic {=u16:#x}", uuid16);
            return;
        };
        let slot = match characteristic {
            Characteristic::Notify => {
                self.control_cccd = cccd_handle.or(self.control_cccd);
                &mut self.control
            }
            Characteristic::Sign => &mut self.sign,
            Characteristic::Rssi => &mut self.rssi,
            Characteristic::Health => &mut self.health,
            Characteristic::Time => &mut self.time,
        };
        if slot.is_some() {
            warn!("discovery: duplicate {:?} characteristic", characteristic);
        }
        *slot = Some(value_handle);
    }

    /// Validate the collected handles once discovery has finished.
    pub fn finish(self) -> Result<HandleSet, DiscoveryError> {
        if !self.service_found {
            return Err(DiscoveryError::ServiceNotFound);
        }
        let require = |h: Option<AttHandle>, c: Characteristic| {
            h.ok_or(DiscoveryError::MissingCharacteristic(c))
        };
        let set = HandleSet {
            control: require(self.control, Characteristic::Notify)?,
            control_cccd: self.control_cccd.ok_or(DiscoveryError::MissingCccd)?,
            sign: require(self.sign, Characteristic::Sign)?,
            rssi: require(self.rssi, Characteristic::Rssi)?,
            health: require(self.health, Characteristic::Health)?,
            time: require(self.time, Characteristic::Time)?,
        };
        Ok(set)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bleam::protocol::{uuid_for, SERVICE_UUID16};

    const ID: BleamId = BleamId([1, 2, 3, 4, 5, 6, 7, 8, 9, 10]);

    fn with_service() -> HandleSetBuilder {
        let mut b = HandleSetBuilder::for_bleam(ID);
        assert!(b.on_service(&uuid_for(&ID, SERVICE_UUID16)));
        b
    }

    fn feed_all(b: &mut HandleSetBuilder, skip: Option<Characteristic>) {
        for (i, c) in Characteristic::ALL.into_iter().enumerate() {
            if Some(c) == skip {
                continue;
            }
            let value = 0x10 + 2 * i as u16;
            let cccd = (c == Characteristic::Notify).then_some(value + 1);
            b.on_characteristic(c.uuid16(), value, cccd);
        }
    }

    #[test]
    fn complete_discovery_yields_handle_set() {
        let mut b = with_service();
        feed_all(&mut b, None);
        let set = b.finish().unwrap();
        assert_eq!(set.control, 0x10);
        assert_eq!(set.control_cccd, 0x11);
        assert_eq!(set.sign, 0x12);
        assert_eq!(set.time, 0x18);
        assert_eq!(set.characteristic(0x14), Some(Characteristic::Rssi));
        assert_eq!(set.characteristic(0x11), None);
    }

    #[test]
    fn every_missing_characteristic_is_reported() {
        for missing in Characteristic::ALL {
            let mut b = with_service();
            feed_all(&mut b, Some(missing));
            assert_eq!(
                b.finish(),
                Err(DiscoveryError::MissingCharacteristic(missing))
            );
        }
    }

    #[test]
    fn control_without_cccd_is_incomplete() {
        let mut b = with_service();
        for c in Characteristic::ALL {
            b.on_characteristic(c.uuid16(), c.uuid16() & 0xFF, None);
        }
        assert_eq!(b.finish(), Err(DiscoveryError::MissingCccd));
    }

    #[test]
    fn missing_service_is_service_not_found() {
        let mut b = HandleSetBuilder::for_bleam(ID);
        feed_all(&mut b, None);
        assert_eq!(b.finish(), Err(DiscoveryError::ServiceNotFound));
    }

    #[test]
    fn service_of_other_bleam_is_ignored() {
        let mut b = HandleSetBuilder::for_bleam(ID);
        let other = BleamId([0xEE; 10]);
        assert!(!b.on_service(&uuid_for(&other, SERVICE_UUID16)));
        assert!(!b.on_service(&uuid_for(&ID, 0x1812)));
        feed_all(&mut b, None);
        assert_eq!(b.finish(), Err(DiscoveryError::ServiceNotFound));
    }

    #[test]
    fn unknown_characteristics_are_skipped() {
        let mut b = with_service();
        b.on_characteristic(0x2A00, 0x03, None);
        feed_all(&mut b, None);
        assert!(b.finish().is_ok());
    }
}
