//! BLE link to one BLEAM - connection, GATT discovery and the reads and
//! writes requested by the engine.
//!
//! After a GAP connection is established, this module:
//! 1. Reports `Connected` and keeps a GATT client running so notifications
//!    reach the engine, in order and without loss.
//! 2. Executes [`LinkCommand`]s one at a time and reports each result as an
//!    event (`WriteComplete`, `ReadResponse`, discovery events, ...).
//! 3. Reports the connection interval the SoftDevice actually applied,
//!    whether we or the peer asked for the change.
//! 4. Reports `Disconnected` once the link is gone, whoever closed it.

use core::cell::Cell;

use crate::ble::{scanner, EventSender, LinkCommand, LinkCommandReceiver};
use blesc::bleam::protocol::{
    bleam_id_from_uuid, uuid_for, Characteristic as BleamCharacteristic, SERVICE_UUID16,
};
use blesc::bleam::types::{ConnHandle, Payload};
use blesc::bleam::{BleamId, ConnParams};
use blesc::config::{BLE_CONNECT_TIMEOUT, PAYLOAD_CAPACITY};
use blesc::Event;
use defmt::{debug, error, info, warn};
use embassy_futures::select::{select4, Either4};
use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_sync::blocking_mutex::Mutex;
use embassy_sync::channel::Channel;
use embassy_time::{with_timeout, Duration, Timer};
use heapless::Vec;
use nrf_softdevice::ble::gatt_client::{self, Characteristic, Descriptor, DiscoverError};
use nrf_softdevice::ble::{central, Connection, HvxType, Uuid};
use nrf_softdevice::{raw, Softdevice};

/// Client Characteristic Configuration descriptor.
const CCCD_UUID16: u16 = 0x2902;

/// HCI reasons reported with `Disconnected`.
const REMOTE_USER_TERMINATED: u8 = raw::BLE_HCI_REMOTE_USER_TERMINATED_CONNECTION as u8;
const LOCAL_HOST_TERMINATED: u8 = raw::BLE_HCI_LOCAL_HOST_TERMINATED_CONNECTION as u8;

/// Poll period while waiting for the scanner to release the radio.
const SCAN_RELEASE_POLL: Duration = Duration::from_millis(5);

/// Poll period of the applied connection parameters.
const CONN_PARAMS_POLL: Duration = Duration::from_millis(100);

/// How long an accepted update request may take to reach the link.
const CONN_PARAMS_SETTLE: Duration = Duration::from_secs(2);

/// Notifications arrive in a synchronous SoftDevice callback; they are
/// parked here and forwarded to the engine with backpressure. A BLEAM
/// never has more than a few notifications outstanding.
const NOTIFY_QUEUE_LEN: usize = 8;

static NOTIFICATIONS: Channel<CriticalSectionRawMutex, Event, NOTIFY_QUEUE_LEN> = Channel::new();

/// 128-bit service UUID of the BLEAM being discovered. The SoftDevice GATT
/// client asks for it through an associated function, so it cannot live
/// in the client value itself.
static TARGET_SERVICE: Mutex<CriticalSectionRawMutex, Cell<[u8; 16]>> =
    Mutex::new(Cell::new([0; 16]));

const BLEAM_CHARACTERISTICS: usize = BleamCharacteristic::ALL.len();

/// One discovered BLEAM characteristic: (16-bit alias, value handle, CCCD).
type Found = (u16, u16, Option<u16>);

/// GATT client for the per-BLEAM telemetry service.
///
/// The service UUID depends on the BLEAM id, so the client is written by
/// hand instead of with `#[nrf_softdevice::gatt_client]`.
pub struct BleamClient {
    found: Vec<Found, BLEAM_CHARACTERISTICS>,
}

impl gatt_client::Client for BleamClient {
    type Event = Event;

    fn on_hvx(&self, conn: &Connection, type_: HvxType, handle: u16, data: &[u8]) -> Option<Event> {
        if !matches!(type_, HvxType::Notification) {
            return None;
        }
        Some(Event::Notification {
            handle: conn.handle()?,
            attr: handle,
            data: to_payload(data),
        })
    }

    fn uuid() -> Uuid {
        Uuid::new_128(&TARGET_SERVICE.lock(Cell::get))
    }

    fn new_undiscovered(_conn: Connection) -> Self {
        Self { found: Vec::new() }
    }

    fn discovered_characteristic(&mut self, characteristic: &Characteristic, descriptors: &[Descriptor]) {
        let service = TARGET_SERVICE.lock(Cell::get);
        let Some(id) = bleam_id_from_uuid(&service) else {
            return;
        };
        let Some(uuid) = characteristic.uuid else {
            return;
        };

        let cccd_uuid = Uuid::new_16(CCCD_UUID16);
        for c in BleamCharacteristic::ALL {
            if uuid == Uuid::new_128(&uuid_for(&id, c.uuid16())) {
                let cccd = descriptors
                    .iter()
                    .find(|d| d.uuid == Some(cccd_uuid))
                    .map(|d| d.handle);
                debug!("Found characteristic {=u16:#x} at {=u16}", c.uuid16(), characteristic.handle_value);
                let _ = self.found.push((c.uuid16(), characteristic.handle_value, cccd));
            }
        }
    }

    fn discovery_complete(&mut self) -> Result<(), DiscoverError> {
        Ok(())
    }
}

fn to_payload(data: &[u8]) -> Payload {
    Payload::from_slice(&data[..data.len().min(PAYLOAD_CAPACITY)]).unwrap_or_default()
}

fn raw_params(params: &ConnParams) -> raw::ble_gap_conn_params_t {
    raw::ble_gap_conn_params_t {
        min_conn_interval: params.min_interval,
        max_conn_interval: params.max_interval,
        slave_latency: params.slave_latency,
        conn_sup_timeout: params.supervision_timeout,
    }
}

fn from_raw(params: &raw::ble_gap_conn_params_t) -> ConnParams {
    ConnParams {
        min_interval: params.min_conn_interval,
        max_interval: params.max_conn_interval,
        slave_latency: params.slave_latency,
        supervision_timeout: params.conn_sup_timeout,
    }
}

/// Interval currently in use; once applied, min and max are equal.
fn applied_interval(conn: &Connection) -> u16 {
    conn.conn_params().min_conn_interval
}

/// Connection parameter bookkeeping shared by [`serve`] and
/// [`watch_params`].
struct ParamWatch {
    /// Range we last asked for.
    requested: Cell<ConnParams>,
    /// Interval the engine last heard about.
    reported: Cell<u16>,
    /// Set while `serve` waits for its own request to be applied.
    updating: Cell<bool>,
}

/// Wait until the link runs at an interval inside `params`.
async fn wait_applied(conn: &Connection, params: &ConnParams) -> Option<u16> {
    let applied = async {
        loop {
            let interval = applied_interval(conn);
            if params.accepts_interval(interval) {
                return interval;
            }
            Timer::after(CONN_PARAMS_POLL).await;
        }
    };
    with_timeout(CONN_PARAMS_SETTLE, applied).await.ok()
}

/// Report interval changes nobody on our side asked for. The SoftDevice
/// answers peer update requests on its own; a result outside our range is
/// handed to the engine as a request so it can insist on its own.
async fn watch_params(conn: &Connection, handle: ConnHandle, watch: &ParamWatch, events: &EventSender) -> ! {
    loop {
        Timer::after(CONN_PARAMS_POLL).await;
        if watch.updating.get() {
            continue;
        }
        let applied = from_raw(&conn.conn_params());
        if applied.min_interval == watch.reported.get() {
            continue;
        }
        info!("Link interval changed to {=u16}", applied.min_interval);
        watch.reported.set(applied.min_interval);
        events
            .send(Event::params_applied(handle, &watch.requested.get(), applied))
            .await;
    }
}

/// Hand parked notifications to the engine, waiting for room in its queue.
async fn forward_notifications(events: &EventSender) -> ! {
    loop {
        let event = NOTIFICATIONS.receive().await;
        events.send(event).await;
    }
}

/// Discover the service of BLEAM `id` and replay the result as events.
async fn discover(conn: &Connection, handle: ConnHandle, id: BleamId, events: &EventSender) {
    let service = uuid_for(&id, SERVICE_UUID16);
    TARGET_SERVICE.lock(|target| target.set(service));
    info!("Discovering BLEAM service...");

    match gatt_client::discover::<BleamClient>(conn).await {
        Ok(client) => {
            events.send(Event::ServiceDiscovered { handle, uuid: service }).await;
            for (uuid16, value_handle, cccd_handle) in client.found {
                events
                    .send(Event::CharacteristicDiscovered {
                        handle,
                        uuid16,
                        value_handle,
                        cccd_handle,
                    })
                    .await;
            }
            events.send(Event::DiscoveryComplete { handle, ok: true }).await;
        }
        // Not a transport fault: the engine sees an empty handle set.
        Err(DiscoverError::ServiceNotFound) => {
            warn!("BLEAM service not found");
            events.send(Event::DiscoveryComplete { handle, ok: true }).await;
        }
        Err(_) => {
            warn!("GATT discovery failed");
            events.send(Event::DiscoveryComplete { handle, ok: false }).await;
        }
    }
}

/// Execute engine commands on `conn` until the engine closes the link.
async fn serve(
    conn: &Connection,
    handle: ConnHandle,
    watch: &ParamWatch,
    cmd_rx: &LinkCommandReceiver,
    events: &EventSender,
) {
    loop {
        match cmd_rx.receive().await {
            LinkCommand::Connect { .. } => warn!("Link busy - connect request dropped"),
            LinkCommand::Disconnect => {
                let _ = conn.disconnect();
                return;
            }
            LinkCommand::UpdateConnParams(params) => {
                watch.requested.set(params);
                watch.updating.set(true);
                let applied = match conn.set_conn_params(raw_params(&params)) {
                    Ok(()) => wait_applied(conn, &params).await,
                    Err(_) => None,
                };
                let event = match applied {
                    Some(interval) => {
                        watch.reported.set(interval);
                        Event::ConnParamsUpdated { handle, interval }
                    }
                    None => {
                        warn!("Connection parameter update not applied");
                        Event::ConnParamsRejected { handle }
                    }
                };
                watch.updating.set(false);
                events.send(event).await;
            }
            LinkCommand::Discover(id) => discover(conn, handle, id, events).await,
            LinkCommand::Write { attr, data } => {
                let ok = gatt_client::write(conn, attr, &data).await.is_ok();
                events.send(Event::WriteComplete { handle, attr, ok }).await;
            }
            LinkCommand::Read { attr } => {
                let mut buf = [0u8; PAYLOAD_CAPACITY];
                let (ok, data) = match gatt_client::read(conn, attr, &mut buf).await {
                    Ok(len) => (true, to_payload(&buf[..len])),
                    Err(_) => (false, Payload::new()),
                };
                events.send(Event::ReadResponse { handle, attr, ok, data }).await;
            }
        }
    }
}

/// Link task body: one BLEAM connection at a time.
pub async fn run(sd: &'static Softdevice, cmd_rx: &LinkCommandReceiver, events: &EventSender) -> ! {
    loop {
        let (address, params) = match cmd_rx.receive().await {
            LinkCommand::Connect { address, params } => (address, params),
            other => {
                debug!("No link - {:?} dropped", other);
                continue;
            }
        };

        let Some(peer) = scanner::resolve(&address) else {
            warn!("Connect request for an address never seen");
            events.send(Event::ConnectFailed { address }).await;
            continue;
        };

        while scanner::is_scanning() {
            Timer::after(SCAN_RELEASE_POLL).await;
        }

        info!("Connecting to {:?}", address);
        let whitelist = [&peer];
        let conn_cfg = central::ConnectConfig {
            scan_config: central::ScanConfig {
                whitelist: Some(&whitelist),
                timeout: BLE_CONNECT_TIMEOUT,
                ..Default::default()
            },
            conn_params: raw_params(&params),
            ..Default::default()
        };

        let conn = match central::connect(sd, &conn_cfg).await {
            Ok(conn) => conn,
            Err(_) => {
                warn!("BLE connect failed");
                events.send(Event::ConnectFailed { address }).await;
                continue;
            }
        };
        let Some(handle) = conn.handle() else {
            events.send(Event::ConnectFailed { address }).await;
            continue;
        };
        events.send(Event::Connected { handle, address }).await;

        let watch = ParamWatch {
            requested: Cell::new(params),
            reported: Cell::new(applied_interval(&conn)),
            updating: Cell::new(false),
        };
        let overflowed = Cell::new(false);
        NOTIFICATIONS.clear();

        // A lost notification would stall or desync the session, so a full
        // queue drops the link instead.
        let client = BleamClient { found: Vec::new() };
        let notifications = gatt_client::run(&conn, &client, |event| {
            if NOTIFICATIONS.try_send(event).is_err() && !overflowed.replace(true) {
                error!("Notification queue full - closing the link");
                let _ = conn.disconnect();
            }
        });

        let reason = match select4(
            notifications,
            serve(&conn, handle, &watch, cmd_rx, events),
            forward_notifications(events),
            watch_params(&conn, handle, &watch, events),
        )
        .await
        {
            Either4::First(_) if !overflowed.get() => REMOTE_USER_TERMINATED,
            _ => LOCAL_HOST_TERMINATED,
        };

        // Whatever the peer sent before the link dropped still reaches the
        // engine ahead of `Disconnected`.
        while let Ok(event) = NOTIFICATIONS.try_receive() {
            events.send(event).await;
        }
        info!("BLE link closed (reason {=u8:#x})", reason);
        events.send(Event::Disconnected { handle, reason }).await;
    }
}
