//! Config Service - the GATT server an unprovisioned scanner exposes.
//!
//! The scanner advertises as `BLESc` in **Peripheral** role and waits for a
//! provisioning client. Each connection publishes VERSION and the current
//! STATUS; writes are handed to [`Provisioner`] and the resulting status is
//! notified back. The service returns once the client commits with `DONE`.

use blesc::config::DEVICE_NAME;
use blesc::provision::{Commit, NodeConfig, ProvisionStatus, Provisioner, SERVICE_UUID, VERSION_LEN};
use defmt::{info, unwrap, warn};
use heapless::Vec;
use nrf_softdevice::ble::{gatt_server, peripheral, Connection};
use nrf_softdevice::Softdevice;

use crate::storage;

#[nrf_softdevice::gatt_service(uuid = "0000b700-0000-0000-0000-00000000ffff")]
pub struct ConfigService {
    #[characteristic(uuid = "00000001-0000-0000-0000-00000000ffff", read)]
    version: [u8; VERSION_LEN],
    #[characteristic(uuid = "00000002-0000-0000-0000-00000000ffff", read, write, notify)]
    status: u8,
    // Variable length so that short or long writes reach the validation in
    // `Provisioner` instead of being cut to size.
    #[characteristic(uuid = "00000003-0000-0000-0000-00000000ffff", write)]
    app_key: Vec<u8, 20>,
    #[characteristic(uuid = "00000004-0000-0000-0000-00000000ffff", write)]
    node_id: Vec<u8, 4>,
}

#[nrf_softdevice::gatt_server]
pub struct Server {
    pub config: ConfigService,
}

const fn adv_data() -> [u8; 3 + 2 + DEVICE_NAME.len()] {
    let mut data = [0u8; 3 + 2 + DEVICE_NAME.len()];
    // Flags: LE General Discoverable, BR/EDR not supported.
    data[0] = 0x02;
    data[1] = 0x01;
    data[2] = 0x06;
    data[3] = 1 + DEVICE_NAME.len() as u8;
    data[4] = 0x09;
    let name = DEVICE_NAME.as_bytes();
    let mut i = 0;
    while i < name.len() {
        data[5 + i] = name[i];
        i += 1;
    }
    data
}

/// Complete list of 128-bit service UUIDs.
const fn scan_data() -> [u8; 18] {
    let uuid = SERVICE_UUID.to_le_bytes();
    let mut data = [0u8; 18];
    data[0] = 17;
    data[1] = 0x07;
    let mut i = 0;
    while i < 16 {
        data[2 + i] = uuid[i];
        i += 1;
    }
    data
}

static ADV_DATA: [u8; 3 + 2 + DEVICE_NAME.len()] = adv_data();
static SCAN_DATA: [u8; 18] = scan_data();

fn publish(server: &Server, conn: Option<&Connection>, status: ProvisionStatus) {
    let value = status as u8;
    if server.config.status_set(&value).is_err() {
        warn!("Config: could not update STATUS");
    }
    if let Some(conn) = conn {
        // Fails harmlessly while the client has notifications off.
        let _ = server.config.status_notify(conn, &value);
    }
}

/// Serve provisioning clients until one commits a complete configuration,
/// which is persisted before returning.
pub async fn run(sd: &'static Softdevice, server: &Server, flash: &mut nrf_softdevice::Flash) -> NodeConfig {
    let mut provisioner = Provisioner::new();
    unwrap!(server.config.version_set(&Provisioner::version()));

    loop {
        publish(server, None, provisioner.status());
        let adv = peripheral::ConnectableAdvertisement::ScannableUndirected {
            adv_data: &ADV_DATA,
            scan_data: &SCAN_DATA,
        };
        info!("Config: advertising as {=str}", DEVICE_NAME);
        let conn = match peripheral::advertise_connectable(sd, adv, &peripheral::Config::default()).await {
            Ok(conn) => conn,
            Err(e) => {
                warn!("Config: advertising failed: {:?}", e);
                continue;
            }
        };
        info!("Config: client connected");
        publish(server, Some(&conn), provisioner.status());

        let mut committed = None;
        let mut erase = false;
        gatt_server::run(&conn, server, |event| {
            let ServerEvent::Config(event) = event;
            let result = match event {
                ConfigServiceEvent::AppKeyWrite(raw) => provisioner.on_app_key_write(&raw).map(|_| ()),
                ConfigServiceEvent::NodeIdWrite(raw) => provisioner.on_node_id_write(&raw).map(|_| ()),
                ConfigServiceEvent::StatusWrite(value) => match provisioner.on_status_write(&[value]) {
                    Ok(Commit::Done(config)) => {
                        committed = Some(config);
                        let _ = conn.disconnect();
                        Ok(())
                    }
                    Ok(Commit::Failed) => {
                        erase = true;
                        Ok(())
                    }
                    Err(e) => Err(e),
                },
                ConfigServiceEvent::StatusCccdWrite { notifications } => {
                    info!("Config: status notifications {}", notifications);
                    Ok(())
                }
            };
            if let Err(e) = result {
                warn!("Config: write refused: {:?}", e);
            }
            publish(server, Some(&conn), provisioner.status());
        })
        .await;
        info!("Config: client disconnected");

        if erase {
            storage::erase(flash).await;
        }
        if let Some(config) = committed {
            storage::save_config(flash, &config).await;
            return config;
        }
    }
}
