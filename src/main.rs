//! BLEAM Scanner firmware for nRF52840.
//!
//! Tasks:
//! - `softdevice_task`: runs the SoftDevice event loop.
//! - `scan_task` / `link_task`: radio work requested by the engine.
//! - `timer_task`: deadlines requested by the engine.
//! - `engine_task`: runs the Config Service until the scanner is
//!   provisioned, then owns the [`ConnectionManager`], feeds it every event
//!   and routes the actions it returns.
//!
//! All tasks talk through the channels below; only the engine task mutates
//! session state.

#![no_std]
#![no_main]

mod ble;
mod power;
mod storage;
mod timers;

use ble::config_service::{self, Server};
use ble::{LinkCommand, ScanCommand, EVENT_QUEUE_LEN};
use blesc::bleam::{EcoSchedule, HmacSigner, Mode, ServiceEvent};
use blesc::config::{BLE_VS_UUID_COUNT, DEVICE_NAME, DFU_GPREGRET_MAGIC, SALT_SIZE};
use blesc::{Action, ConnectionManager, Event, Outbox, ScannerConfig};
use defmt::{error, info, unwrap, warn};
use embassy_executor::Spawner;
use embassy_nrf::bind_interrupts;
use embassy_nrf::interrupt::{self, InterruptExt, Priority};
use embassy_nrf::saadc::{self, ChannelConfig, Saadc, VddInput};
use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_sync::channel::Channel;
use embassy_time::{Instant, Timer};
use nrf_softdevice::{raw, Flash, Softdevice};
use power::{HealthMonitor, ResetCause};
use timers::TimerCommand;
use {defmt_rtt as _, panic_probe as _};

bind_interrupts!(struct Irqs {
    SAADC => saadc::InterruptHandler;
});

static EVENTS: Channel<CriticalSectionRawMutex, Event, EVENT_QUEUE_LEN> = Channel::new();
static SCAN_CMDS: Channel<CriticalSectionRawMutex, ScanCommand, 4> = Channel::new();
static LINK_CMDS: Channel<CriticalSectionRawMutex, LinkCommand, 8> = Channel::new();
static TIMER_CMDS: Channel<CriticalSectionRawMutex, TimerCommand, 8> = Channel::new();

type Manager = ConnectionManager<HmacSigner, storage::Peers>;

fn now_ms() -> u64 {
    Instant::now().as_millis()
}

#[embassy_executor::task]
async fn softdevice_task(sd: &'static Softdevice) -> ! {
    sd.run().await
}

#[embassy_executor::task]
async fn scan_task(sd: &'static Softdevice) -> ! {
    ble::scanner::run(sd, &SCAN_CMDS.receiver(), &EVENTS.sender()).await
}

#[embassy_executor::task]
async fn link_task(sd: &'static Softdevice) -> ! {
    ble::link::run(sd, &LINK_CMDS.receiver(), &EVENTS.sender()).await
}

#[embassy_executor::task]
async fn timer_task() -> ! {
    timers::run(&TIMER_CMDS.receiver(), &EVENTS.sender()).await
}

/// What the engine task does once a terminal mode has been accepted and the
/// link is gone.
async fn carry_out(mode: Mode, flash: &mut Flash) -> ! {
    match mode {
        Mode::Dfu => {
            info!("Rebooting into DFU");
            unsafe {
                raw::sd_power_gpregret_set(0, DFU_GPREGRET_MAGIC);
            }
        }
        Mode::Unconfig => {
            // No stored configuration: the next boot comes up in
            // configuration mode.
            info!("Unconfiguring");
            storage::erase(flash).await;
        }
        _ => info!("Rebooting"),
    }
    cortex_m::peripheral::SCB::sys_reset()
}

#[embassy_executor::task]
async fn engine_task(sd: &'static Softdevice, server: Server, adc: Saadc<'static, 1>) -> ! {
    let mut flash = Flash::take(sd);
    let mut health = HealthMonitor::new(adc, ResetCause::take()).await;

    let node = match storage::load_config(&mut flash).await {
        Some(node) => node,
        None => {
            info!("Not provisioned - entering configuration mode");
            config_service::run(sd, &server, &mut flash).await
        }
    };
    info!("Node id {=u16:#x}", node.node_id);

    let peers = storage::load_peers(&mut flash, node.node_id, now_ms()).await;
    let config = ScannerConfig {
        node_id: node.node_id,
        eco: Some(EcoSchedule::default()),
        ..Default::default()
    };

    let mut manager: Manager = match ConnectionManager::new(config, HmacSigner::new(node.app_key), peers) {
        Ok(manager) => manager,
        Err(e) => {
            error!("Invalid scanner configuration: {:?}", e);
            loop {
                Timer::after_secs(60).await;
            }
        }
    };

    let mut out = Outbox::new();
    let mut pending_mode: Option<Mode> = None;
    manager.dispatch(now_ms(), Event::StartScan, &mut out);

    loop {
        while !out.is_empty() {
            let mut report_health = false;
            for action in out.drain() {
                match action {
                    Action::StartScan => SCAN_CMDS.send(ScanCommand::Start).await,
                    Action::StopScan => SCAN_CMDS.send(ScanCommand::Stop).await,
                    Action::Connect { address, params } => {
                        LINK_CMDS.send(LinkCommand::Connect { address, params }).await
                    }
                    Action::Disconnect { .. } => LINK_CMDS.send(LinkCommand::Disconnect).await,
                    Action::UpdateConnParams { params, .. } => {
                        LINK_CMDS.send(LinkCommand::UpdateConnParams(params)).await
                    }
                    Action::DiscoverServices { id, .. } => LINK_CMDS.send(LinkCommand::Discover(id)).await,
                    Action::Write { attr, data, .. } => LINK_CMDS.send(LinkCommand::Write { attr, data }).await,
                    Action::Read { attr, .. } => LINK_CMDS.send(LinkCommand::Read { attr }).await,
                    Action::StartTimer { timer, after_ms } => {
                        TIMER_CMDS.send(TimerCommand::Start { timer, after_ms }).await
                    }
                    Action::CancelTimer(timer) => TIMER_CMDS.send(TimerCommand::Cancel(timer)).await,
                    Action::GenerateSalt { handle } => {
                        let mut salt = [0u8; SALT_SIZE];
                        match nrf_softdevice::random_bytes(sd, &mut salt) {
                            Ok(()) => manager.dispatch(now_ms(), Event::SaltGenerated { handle, salt }, &mut out),
                            Err(e) => {
                                // Without a challenge the mode change can never be
                                // confirmed; the handshake timer closes the link.
                                error!("No randomness for the mode challenge: {:?}", e);
                            }
                        }
                    }
                    Action::ModeRequested(mode) => {
                        info!("BLEAM requested mode {:?}", mode);
                        pending_mode = Some(mode);
                    }
                    Action::Notify(event) => {
                        info!("BLEAM event: {:?}", event);
                        match event {
                            ServiceEvent::Connected => report_health = true,
                            ServiceEvent::NotificationDisabled if pending_mode.is_some() => {
                                LINK_CMDS.send(LinkCommand::Disconnect).await
                            }
                            ServiceEvent::Disconnected => {
                                if let Some(mode) = pending_mode {
                                    carry_out(mode, &mut flash).await;
                                }
                                storage::save_peers(&mut flash, manager.peers()).await;
                            }
                            _ => {}
                        }
                    }
                }
            }

            if report_health {
                let report = health.general_report(now_ms(), manager.peer_time(now_ms())).await;
                if let Err(e) = manager.enqueue_health(now_ms(), report, &mut out) {
                    warn!("Health report not queued: {:?}", e);
                }
            }
        }

        let event = EVENTS.receive().await;
        manager.dispatch(now_ms(), event, &mut out);
    }
}

#[embassy_executor::main]
async fn main(spawner: Spawner) {
    info!("BLEAM scanner booting");

    // The SoftDevice reserves priorities 0, 1 and 4.
    let mut config = embassy_nrf::config::Config::default();
    config.gpiote_interrupt_priority = Priority::P2;
    config.time_interrupt_priority = Priority::P2;
    let p = embassy_nrf::init(config);

    interrupt::SAADC.set_priority(Priority::P3);
    let adc = Saadc::new(
        p.SAADC,
        Irqs,
        saadc::Config::default(),
        [ChannelConfig::single_ended(VddInput)],
    );

    let sd_config = nrf_softdevice::Config {
        clock: Some(raw::nrf_clock_lf_cfg_t {
            source: raw::NRF_CLOCK_LF_SRC_RC as u8,
            rc_ctiv: 16,
            rc_temp_ctiv: 2,
            accuracy: raw::NRF_CLOCK_LF_ACCURACY_500_PPM as u8,
        }),
        conn_gap: Some(raw::ble_gap_conn_cfg_t {
            conn_count: 1,
            event_length: 24,
        }),
        conn_gatt: Some(raw::ble_gatt_conn_cfg_t {
            att_mtu: blesc::config::ATT_MTU as u16,
        }),
        gap_role_count: Some(raw::ble_gap_cfg_role_count_t {
            adv_set_count: 1,
            periph_role_count: 1,
            central_role_count: 1,
            central_sec_count: 0,
            _bitfield_1: raw::ble_gap_cfg_role_count_t::new_bitfield_1(0),
        }),
        common_vs_uuid: Some(raw::ble_common_cfg_vs_uuid_t {
            vs_uuid_count: BLE_VS_UUID_COUNT,
        }),
        gap_device_name: Some(raw::ble_gap_cfg_device_name_t {
            p_value: DEVICE_NAME.as_ptr() as _,
            current_len: DEVICE_NAME.len() as u16,
            max_len: DEVICE_NAME.len() as u16,
            write_perm: unsafe { core::mem::zeroed() },
            _bitfield_1: raw::ble_gap_cfg_device_name_t::new_bitfield_1(raw::BLE_GATTS_VLOC_STACK as u8),
        }),
        ..Default::default()
    };
    let sd = Softdevice::enable(&sd_config);
    // Registered up front; the GATT table is fixed once the SoftDevice runs.
    let server = unwrap!(Server::new(sd));
    unwrap!(spawner.spawn(softdevice_task(sd)));

    unwrap!(spawner.spawn(timer_task()));
    unwrap!(spawner.spawn(scan_task(sd)));
    unwrap!(spawner.spawn(link_task(sd)));
    unwrap!(spawner.spawn(engine_task(sd, server, adc)));
}
