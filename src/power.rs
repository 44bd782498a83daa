//! Health monitor - battery, uptime and last reset cause for the general
//! health report sent to each BLEAM.
//!
//! Battery voltage is measured on VDD through the SAADC (internal 0.6 V
//! reference, 1/6 gain).  The reset cause is read once at boot through
//! the SoftDevice, which owns the POWER peripheral.

use blesc::bleam::protocol::ErrorType;
use blesc::bleam::HealthEvent;
use blesc::config::FIRMWARE_ID;
use blesc::power_logic::{battery_decivolts, error_type_from_reset_reason, uptime_minutes, vdd_millivolts};
use defmt::{info, warn};
use embassy_nrf::saadc::Saadc;
use nrf_softdevice::raw;

/// Cause of the last reset as reported by POWER.RESETREAS.
#[derive(Clone, Copy, defmt::Format)]
pub struct ResetCause {
    pub bits: u32,
    pub kind: ErrorType,
}

impl ResetCause {
    /// Read and clear the reset reason register. Requires an enabled
    /// SoftDevice.
    pub fn take() -> Self {
        let mut bits = 0u32;
        let ret = unsafe { raw::sd_power_reset_reason_get(&mut bits) };
        if ret != raw::NRF_SUCCESS {
            warn!("Reset reason unavailable (err {=u32})", ret);
            return Self {
                bits: 0,
                kind: ErrorType::Unknown,
            };
        }
        unsafe {
            raw::sd_power_reset_reason_clr(bits);
        }
        let kind = error_type_from_reset_reason(bits);
        info!("Reset reason {=u32:#x} ({:?})", bits, kind);
        Self { bits, kind }
    }
}

/// Builds general health reports.
pub struct HealthMonitor {
    adc: Saadc<'static, 1>,
    reset: ResetCause,
}

impl HealthMonitor {
    /// Calibrate the SAADC and remember the reset cause of this boot.
    pub async fn new(adc: Saadc<'static, 1>, reset: ResetCause) -> Self {
        adc.calibrate().await;
        Self { adc, reset }
    }

    /// Current VDD in millivolts.
    pub async fn vdd_millivolts(&mut self) -> u16 {
        let mut buf = [0i16; 1];
        self.adc.sample(&mut buf).await;
        vdd_millivolts(buf[0])
    }

    /// General report. `peer_time_ms` is the BLEAM's time of day when the
    /// session synchronised it, else zero is reported.
    pub async fn general_report(&mut self, uptime_ms: u64, peer_time_ms: Option<u32>) -> HealthEvent {
        let millivolts = self.vdd_millivolts().await;
        HealthEvent::General {
            battery: battery_decivolts(millivolts),
            firmware_id: FIRMWARE_ID,
            uptime_min: uptime_minutes(uptime_ms),
            system_time: peer_time_ms.map_or(0, |ms| ms / 1000),
            last_error_id: (self.reset.bits & 0xFFFF) as u16,
            last_error_type: self.reset.kind,
        }
    }
}
