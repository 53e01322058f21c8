use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Length of one sidereal day expressed in solar hours.
pub const SIDEREAL_DAY_IN_HOURS: f64 = 23.934_469_72;

/// Hard cap on fields accepted from a sequence.
pub const MAX_FIELDS: usize = 500;

/// Hard cap on recorded observations per field.
pub const MAX_OBS_PER_FIELD: usize = 100;

/// Observing site geometry.
///
/// Longitude follows the observatory convention: hours west of Greenwich.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Site {
    pub name: String,
    pub longitude_hours_west: f64,
    pub latitude_deg: f64,
    pub elevation_m: f64,
}

impl Default for Site {
    fn default() -> Self {
        Self {
            name: "La Silla".to_string(),
            longitude_hours_west: 4.714,
            latitude_deg: -29.257,
            elevation_m: 2347.0,
        }
    }
}

/// Wire-level tuning for the camera command connection.
///
/// Durations are carried as integer microseconds/seconds so a config file can
/// set them without a custom deserializer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelTuning {
    /// Minimum gap between consecutive commands on one connection, in
    /// microseconds. The controller firmware drops back-to-back commands.
    pub command_delay_us: u64,
    /// Reply deadline for short commands (status, init), in seconds.
    pub short_deadline_s: u64,
    /// Fixed readout time added to every exposure deadline, in seconds.
    pub readout_time_s: u64,
    /// Slack added on top of exposure + readout, in seconds.
    pub deadline_margin_s: u64,
    /// Worst-case duration of a controller clear, in seconds.
    pub clear_time_s: u64,
    /// Poll period on the optional status connection, in milliseconds.
    pub status_poll_ms: u64,
    /// Failed commands are retried this many times before giving up.
    pub max_retries: u32,
}

impl Default for ChannelTuning {
    fn default() -> Self {
        Self {
            command_delay_us: 500,
            short_deadline_s: 5,
            readout_time_s: 40,
            deadline_margin_s: 5,
            clear_time_s: 20,
            status_poll_ms: 100,
            max_retries: 2,
        }
    }
}

impl ChannelTuning {
    pub fn command_delay(&self) -> Duration {
        Duration::from_micros(self.command_delay_us)
    }

    pub fn short_deadline(&self) -> Duration {
        Duration::from_secs(self.short_deadline_s)
    }

    pub fn clear_deadline(&self) -> Duration {
        Duration::from_secs(self.clear_time_s + self.deadline_margin_s)
    }

    pub fn status_poll_interval(&self) -> Duration {
        Duration::from_millis(self.status_poll_ms)
    }

    /// Deadline for an exposure command: shutter time plus readout plus slack.
    pub fn exposure_deadline(&self, exposure_s: f64) -> Duration {
        let total = exposure_s + self.readout_time_s as f64 + self.deadline_margin_s as f64;
        Duration::from_secs_f64(total.max(1.0))
    }
}

/// Immutable per-run scheduling policy.
///
/// Every feasibility limit the classifier applies lives here so a run is
/// reproducible from its config alone.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    pub site: Site,
    pub channel: ChannelTuning,

    /// Airmass ceiling for feasibility windows.
    pub max_airmass: f64,
    /// Relaxed airmass ceiling applied below `south_dec_threshold_deg`.
    pub max_airmass_south: f64,
    pub south_dec_threshold_deg: f64,
    /// Hour-angle limit either side of the meridian, in hours.
    pub max_hour_angle_h: f64,
    pub min_dec_deg: f64,
    pub max_dec_deg: f64,
    /// Fields closer than this to the moon are vetoed for the night, degrees.
    pub min_moon_separation_deg: f64,

    pub max_exposure_s: f64,
    pub min_interval_h: f64,
    pub max_interval_h: f64,
    /// A field whose full remaining series does not fit in this much time is
    /// never worth starting, in hours.
    pub min_execution_time_h: f64,

    /// Upper bound on one idle wait when nothing is observable, in seconds.
    pub idle_wait_s: u64,
    /// Margin between twilight flats and sunset/sunrise, in hours.
    pub skyflat_wait_h: f64,
    /// Base RA step used to recognize adjacent field pairs, in hours.
    pub ra_pair_step_h: f64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            site: Site::default(),
            channel: ChannelTuning::default(),
            max_airmass: 2.0,
            max_airmass_south: 2.2,
            south_dec_threshold_deg: -27.0,
            max_hour_angle_h: 4.3,
            min_dec_deg: -89.0,
            max_dec_deg: 30.0,
            min_moon_separation_deg: 15.0,
            max_exposure_s: 3600.0,
            min_interval_h: 0.0,
            max_interval_h: 12.0,
            min_execution_time_h: 0.029,
            idle_wait_s: 30,
            skyflat_wait_h: 0.5,
            ra_pair_step_h: 0.05,
        }
    }
}

impl SchedulerConfig {
    /// Airmass ceiling for a given declination.
    pub fn airmass_limit(&self, dec_deg: f64) -> f64 {
        if dec_deg <= self.south_dec_threshold_deg {
            self.max_airmass_south
        } else {
            self.max_airmass
        }
    }

    pub fn idle_wait(&self) -> Duration {
        Duration::from_secs(self.idle_wait_s)
    }
}
