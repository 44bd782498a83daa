//! BLE GAP scanner - forwards BLEAM advertisements to the engine.
//!
//! Uses the SoftDevice Central-role scanning API.  Reports are filtered
//! down to BLEAM advertisements (service UUID carrying a BLEAM id) and
//! Apple background advertisements in the callback, then pushed into the
//! engine's event channel.

use core::cell::RefCell;
use core::sync::atomic::{AtomicBool, Ordering};

use crate::ble::{EventSender, ScanCommand, ScanCommandReceiver};
use blesc::ble::adv_parser::{bleam_id_from_advertisement, extract_device_name, is_apple_background};
use blesc::bleam::types::AdvData;
use blesc::config::{BLE_SCAN_INTERVAL, BLE_SCAN_WINDOW};
use blesc::Event;
use defmt::{debug, info, warn};
use embassy_futures::select::{select, Either};
use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_sync::blocking_mutex::Mutex;
use embassy_time::{Duration, Timer};
use heapless::Vec;
use nrf_softdevice::ble::{central, Address};
use nrf_softdevice::Softdevice;

/// Advertisers remembered for connection lookup.
const SEEN_CAPACITY: usize = 16;

/// Back-off after the SoftDevice refused to scan.
const SCAN_RETRY: Duration = Duration::from_millis(500);

/// Recently reported advertisers with their address type, most recent last.
static SEEN: Mutex<CriticalSectionRawMutex, RefCell<Vec<Address, SEEN_CAPACITY>>> =
    Mutex::new(RefCell::new(Vec::new()));

static SCANNING: AtomicBool = AtomicBool::new(false);

/// Raised for as long as a scan future is alive on the radio.
struct ScanningFlag;

impl ScanningFlag {
    fn raise() -> Self {
        SCANNING.store(true, Ordering::Release);
        Self
    }
}

impl Drop for ScanningFlag {
    fn drop(&mut self) {
        SCANNING.store(false, Ordering::Release);
    }
}

fn remember(address: Address) {
    SEEN.lock(|seen| {
        let mut seen = seen.borrow_mut();
        if let Some(pos) = seen.iter().position(|a| a.bytes() == address.bytes()) {
            seen.remove(pos);
        } else if seen.is_full() {
            seen.remove(0);
        }
        let _ = seen.push(address);
    });
}

/// SoftDevice address (with its type) of an advertiser reported earlier.
pub fn resolve(address: &blesc::bleam::Address) -> Option<Address> {
    SEEN.lock(|seen| {
        seen.borrow()
            .iter()
            .find(|a| a.bytes() == address.0)
            .copied()
    })
}

/// True while the radio is scanning. The SoftDevice refuses to start a
/// connection until the scan has been stopped.
pub fn is_scanning() -> bool {
    SCANNING.load(Ordering::Acquire)
}

/// Scan until the SoftDevice reports an error. Dropping the future stops
/// the scan.
async fn scan_reports(sd: &Softdevice, events: &EventSender) {
    let config = central::ScanConfig {
        active: true,
        interval: BLE_SCAN_INTERVAL,
        window: BLE_SCAN_WINDOW,
        ..Default::default()
    };

    let _flag = ScanningFlag::raise();
    let result = central::scan(sd, &config, |params| {
        let data =
            unsafe { core::slice::from_raw_parts(params.data.p_data, params.data.len as usize) };

        if bleam_id_from_advertisement(data).is_none() && !is_apple_background(data) {
            return None;
        }

        let address = Address::from_raw(params.peer_addr);
        remember(address);
        let name = extract_device_name(data);
        debug!("Advert from {:02x} ({}), RSSI {}", address.bytes(), name.as_str(), params.rssi);

        let Ok(data) = AdvData::from_slice(data) else {
            return None;
        };
        let report = Event::ScanReport {
            address: blesc::bleam::Address(address.bytes()),
            rssi: params.rssi,
            data,
        };
        // Never block the SoftDevice callback.
        if events.try_send(report).is_err() {
            debug!("Event channel full - dropping scan report");
        }
        None::<()>
    })
    .await;

    if result.is_err() {
        warn!("BLE scan ended with error");
    }
}

/// Scanner task body: scan while the engine wants it, idle otherwise.
pub async fn run(sd: &'static Softdevice, cmd_rx: &ScanCommandReceiver, events: &EventSender) -> ! {
    loop {
        if let ScanCommand::Stop = cmd_rx.receive().await {
            continue;
        }

        info!("BLE scan starting");
        loop {
            match select(scan_reports(sd, events), cmd_rx.receive()).await {
                Either::First(()) => Timer::after(SCAN_RETRY).await,
                Either::Second(ScanCommand::Start) => {}
                Either::Second(ScanCommand::Stop) => break,
            }
        }
        info!("BLE scan stopped");
    }
}
