//! Eco scanning schedule.
//!
//! Scanners sleep between short scan windows. Wake-ups are aligned to
//! multiples of a period counted from midnight of the system clock, so
//! every scanner of a site wakes at the same instants. Nights use a longer
//! period than days.

use crate::config::{
    DAYTIME_START_SECS, ECO_SCAN_WINDOW_MS, NIGHTTIME_START_SECS, TIME_PERIODS_DAY, TIME_PERIODS_NIGHT,
    TIME_PERIOD_SECS,
};
use crate::error::ConfigError;

const SECS_PER_DAY: u32 = 86_400;
const MS_PER_DAY: u64 = SECS_PER_DAY as u64 * 1000;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct EcoSchedule {
    /// How long each wake-up scans before going back to sleep (ms).
    pub scan_window_ms: u64,
    /// Base period (s); the day and night periods are multiples of it.
    pub period_secs: u32,
    pub day_periods: u32,
    pub night_periods: u32,
    /// Seconds since midnight.
    pub day_start_secs: u32,
    pub night_start_secs: u32,
}

impl Default for EcoSchedule {
    fn default() -> Self {
        Self {
            scan_window_ms: ECO_SCAN_WINDOW_MS,
            period_secs: TIME_PERIOD_SECS,
            day_periods: TIME_PERIODS_DAY,
            night_periods: TIME_PERIODS_NIGHT,
            day_start_secs: DAYTIME_START_SECS,
            night_start_secs: NIGHTTIME_START_SECS,
        }
    }
}

impl EcoSchedule {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.period_secs == 0 || self.day_periods == 0 || self.night_periods == 0 {
            return Err(ConfigError::Eco);
        }
        if self.day_start_secs >= SECS_PER_DAY || self.night_start_secs >= SECS_PER_DAY {
            return Err(ConfigError::Eco);
        }
        let shortest = self.period_secs as u64 * self.day_periods.min(self.night_periods) as u64 * 1000;
        if self.scan_window_ms == 0 || self.scan_window_ms >= shortest {
            return Err(ConfigError::Eco);
        }
        Ok(())
    }

    /// Night runs from `night_start_secs` up to `day_start_secs`, across
    /// midnight if needed.
    pub fn is_night(&self, time_of_day_ms: u32) -> bool {
        let secs = (time_of_day_ms / 1000) % SECS_PER_DAY;
        if self.night_start_secs <= self.day_start_secs {
            (self.night_start_secs..self.day_start_secs).contains(&secs)
        } else {
            secs >= self.night_start_secs || secs < self.day_start_secs
        }
    }

    /// Period in effect at `time_of_day_ms` (ms).
    pub fn period_ms(&self, time_of_day_ms: u32) -> u64 {
        let periods = if self.is_night(time_of_day_ms) {
            self.night_periods
        } else {
            self.day_periods
        };
        self.period_secs as u64 * periods as u64 * 1000
    }

    /// Time until the next aligned wake-up, never zero. A day/night switch
    /// in between counts as a wake-up so the new period takes over on time.
    pub fn until_next_wake(&self, time_of_day_ms: u32) -> u64 {
        let now = time_of_day_ms as u64 % MS_PER_DAY;
        let period = self.period_ms(time_of_day_ms);
        let to_boundary = period - now % period;
        let to_switch = [self.day_start_secs, self.night_start_secs]
            .into_iter()
            .map(|start| {
                let at = start as u64 * 1000;
                if at > now {
                    at - now
                } else {
                    at + MS_PER_DAY - now
                }
            })
            .min()
            .unwrap_or(to_boundary);
        to_boundary.min(to_switch)
    }
}
