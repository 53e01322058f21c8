//! Sky geometry seam.
//!
//! The scheduler only sees the [`Ephemeris`] trait; [`analytic`] provides a
//! self-contained reference implementation (low-precision Meeus formulas,
//! good to a few minutes, which is ample for feasibility windows).

use crate::config::{Site, SIDEREAL_DAY_IN_HOURS};
use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};

/// Julian date of the Unix epoch.
pub const UNIX_EPOCH_JD: f64 = 2_440_587.5;

/// Julian date of J2000.0.
pub const JD_EPOCH_2000: f64 = 2_451_545.0;

/// Sun altitude at geometric sunset/sunrise, refraction included, degrees.
pub const SUN_HORIZON_ALT_DEG: f64 = -0.833;

/// Sun altitude bounding usable dark time, degrees.
pub const SUN_DARK_ALT_DEG: f64 = -12.0;

/// Time source for the scheduler, as a Julian date.
pub trait Clock: Send + Sync {
    fn now_jd(&self) -> f64;
}

/// Wall-clock time.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_jd(&self) -> f64 {
        let since_epoch = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default();
        UNIX_EPOCH_JD + since_epoch.as_secs_f64() / 86_400.0
    }
}

/// Feasibility window of a target above some altitude threshold.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum RiseSet {
    /// Above the threshold all night (circumpolar at this altitude).
    AlwaysUp,
    /// Never reaches the threshold from this site.
    NeverUp,
    /// The transit window containing or following the query time.
    Window { jd_rise: f64, jd_set: f64 },
}

/// Night boundaries and moon circumstances for one night.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NightTimes {
    pub jd_sunset: f64,
    pub jd_sunrise: f64,
    /// Evening boundary of dark time (sun below -12 degrees).
    pub jd_dark_start: f64,
    /// Morning boundary of dark time.
    pub jd_dark_end: f64,
    pub moon_ra_hours: f64,
    pub moon_dec_deg: f64,
    /// Illuminated fraction, 0 (new) to 1 (full).
    pub moon_illumination: f64,
}

/// Sky geometry needed by the scheduler. Implementations must be pure
/// functions of their arguments so classification stays deterministic.
pub trait Ephemeris: Send + Sync {
    /// Local sidereal time in hours, [0, 24).
    fn lst(&self, jd: f64, site: &Site) -> f64;

    /// Altitude of a target in degrees.
    fn altitude(&self, ra_hours: f64, dec_deg: f64, lst_hours: f64, latitude_deg: f64) -> f64;

    /// Airmass at a given altitude; very large below the horizon.
    fn airmass(&self, altitude_deg: f64) -> f64;

    /// Window during which the target sits above `min_altitude_deg`.
    fn rise_set(
        &self,
        ra_hours: f64,
        dec_deg: f64,
        jd: f64,
        site: &Site,
        min_altitude_deg: f64,
    ) -> RiseSet;

    /// Moon RA (hours), Dec (degrees) and illuminated fraction.
    fn moon(&self, jd: f64) -> (f64, f64, f64);

    /// Night boundaries for the night containing or following `jd`.
    fn night_times(&self, jd: f64, site: &Site) -> NightTimes;

    /// Next Julian date at which local sidereal time reaches `lst_target`.
    fn jd_at_lst(&self, jd_from: f64, lst_target_hours: f64, site: &Site) -> f64 {
        let dt_sidereal = wrap24(lst_target_hours - self.lst(jd_from, site));
        jd_from + dt_sidereal * (SIDEREAL_DAY_IN_HOURS / 24.0) / 24.0
    }
}

/// Normalize hours into [0, 24).
pub fn wrap24(hours: f64) -> f64 {
    let mut h = hours % 24.0;
    if h < 0.0 {
        h += 24.0;
    }
    h
}

/// Hour angle in hours, [-12, 12).
pub fn hour_angle(lst_hours: f64, ra_hours: f64) -> f64 {
    let mut ha = lst_hours - ra_hours;
    while ha < -12.0 {
        ha += 24.0;
    }
    while ha >= 12.0 {
        ha -= 24.0;
    }
    ha
}

/// Signed shortest difference `h1 - h2` on a 24-hour clock, in [-12, 12).
pub fn clock_difference(h1: f64, h2: f64) -> f64 {
    hour_angle(h1, h2)
}

/// Angular separation between two positions, degrees.
pub fn angular_separation_deg(ra1_h: f64, dec1_d: f64, ra2_h: f64, dec2_d: f64) -> f64 {
    let ra1 = ra1_h.to_radians() * 15.0;
    let ra2 = ra2_h.to_radians() * 15.0;
    let d1 = dec1_d.to_radians();
    let d2 = dec2_d.to_radians();
    let cos_sep = d1.sin() * d2.sin() + d1.cos() * d2.cos() * (ra1 - ra2).cos();
    cos_sep.clamp(-1.0, 1.0).acos().to_degrees()
}

/// UT hours of day for a Julian date.
pub fn ut_hours(jd: f64) -> f64 {
    wrap24((jd - (jd - 0.5).floor() - 0.5) * 24.0)
}

/// Julian date to UTC calendar fields: (year, month, day, hour, min, sec).
pub fn calendar_from_jd(jd: f64) -> (i32, u32, u32, u32, u32, u32) {
    let jd = jd + 0.5;
    let z = jd.floor();
    let f = jd - z;
    let a = if z < 2_299_161.0 {
        z
    } else {
        let alpha = ((z - 1_867_216.25) / 36_524.25).floor();
        z + 1.0 + alpha - (alpha / 4.0).floor()
    };
    let b = a + 1524.0;
    let c = ((b - 122.1) / 365.25).floor();
    let d = (365.25 * c).floor();
    let e = ((b - d) / 30.6001).floor();

    let day_frac = b - d - (30.6001 * e).floor() + f;
    let day = day_frac.floor();
    let month = if e < 14.0 { e - 1.0 } else { e - 13.0 };
    let year = if month > 2.0 { c - 4716.0 } else { c - 4715.0 };

    let mut secs = ((day_frac - day) * 86_400.0).round() as u64;
    if secs >= 86_400 {
        secs = 86_399;
    }
    (
        year as i32,
        month as u32,
        day as u32,
        (secs / 3600) as u32,
        ((secs % 3600) / 60) as u32,
        (secs % 60) as u32,
    )
}

/// Altitude at which a given airmass limit is crossed, secant model, degrees.
pub fn altitude_for_airmass(airmass_limit: f64) -> f64 {
    (1.0 / airmass_limit).asin().to_degrees()
}

pub mod analytic {
    //! Reference ephemeris from low-precision closed-form series.

    use super::*;

    #[derive(Debug, Clone, Copy, Default)]
    pub struct AnalyticEphemeris;

    /// Greenwich mean sidereal time in hours.
    fn gmst(jd: f64) -> f64 {
        let t = (jd - JD_EPOCH_2000) / 36_525.0;
        let gmst0 = 6.697_374_558 + 2_400.051_336 * t + 0.000_025_862 * t * t;
        let ut = (jd - (jd - 0.5).floor() - 0.5) * 24.0;
        wrap24(gmst0 + ut * 1.002_737_909_35)
    }

    /// Hour angle (hours) at which `altitude_deg` is crossed, or None when
    /// the target never crosses it.
    fn hour_angle_at_altitude(altitude_deg: f64, dec_deg: f64, lat_deg: f64) -> Option<f64> {
        let alt = altitude_deg.to_radians();
        let dec = dec_deg.to_radians();
        let lat = lat_deg.to_radians();
        let cos_ha = (alt.sin() - dec.sin() * lat.sin()) / (dec.cos() * lat.cos());
        if !(-1.0..=1.0).contains(&cos_ha) {
            return None;
        }
        Some(cos_ha.acos().to_degrees() / 15.0)
    }

    /// Apparent geocentric sun position: (ra hours, dec degrees).
    fn sun_radec(jd: f64) -> (f64, f64) {
        let n = jd - JD_EPOCH_2000;
        let l = (280.460 + 0.985_647_4 * n).rem_euclid(360.0);
        let g = ((357.528 + 0.985_600_3 * n).rem_euclid(360.0)).to_radians();
        let lambda = (l + 1.915 * g.sin() + 0.020 * (2.0 * g).sin()).to_radians();
        let eps = (23.439 - 0.000_000_4 * n).to_radians();
        let ra = (eps.cos() * lambda.sin()).atan2(lambda.cos());
        let dec = (eps.sin() * lambda.sin()).asin();
        (wrap24(ra.to_degrees() / 15.0), dec.to_degrees())
    }

    impl Ephemeris for AnalyticEphemeris {
        fn lst(&self, jd: f64, site: &Site) -> f64 {
            wrap24(gmst(jd) - site.longitude_hours_west)
        }

        fn altitude(&self, ra_hours: f64, dec_deg: f64, lst_hours: f64, latitude_deg: f64) -> f64 {
            let ha = hour_angle(lst_hours, ra_hours).to_radians() * 15.0;
            let dec = dec_deg.to_radians();
            let lat = latitude_deg.to_radians();
            let sin_alt = (dec.sin() * lat.sin() + dec.cos() * lat.cos() * ha.cos()).clamp(-1.0, 1.0);
            sin_alt.asin().to_degrees()
        }

        fn airmass(&self, altitude_deg: f64) -> f64 {
            if altitude_deg <= 0.0 {
                return 999.9;
            }
            // Hardie (1962) polynomial on the secant of the zenith angle.
            let sec_z = 1.0 / (90.0 - altitude_deg).to_radians().cos();
            let x = sec_z - 1.0;
            sec_z - 0.001_816_7 * x - 0.002_875 * x * x - 0.000_808_3 * x * x * x
        }

        fn rise_set(
            &self,
            ra_hours: f64,
            dec_deg: f64,
            jd: f64,
            site: &Site,
            min_altitude_deg: f64,
        ) -> RiseSet {
            let Some(half_window) =
                hour_angle_at_altitude(min_altitude_deg, dec_deg, site.latitude_deg)
            else {
                let transit_alt = 90.0 - (site.latitude_deg - dec_deg).abs();
                return if transit_alt > min_altitude_deg {
                    RiseSet::AlwaysUp
                } else {
                    RiseSet::NeverUp
                };
            };

            let sidereal_scale = (SIDEREAL_DAY_IN_HOURS / 24.0) / 24.0;
            let ha = hour_angle(self.lst(jd, site), ra_hours);
            if ha.abs() < half_window {
                // Currently inside the window.
                RiseSet::Window {
                    jd_rise: jd - (ha + half_window) * sidereal_scale,
                    jd_set: jd + (half_window - ha) * sidereal_scale,
                }
            } else {
                let dt_rise = wrap24(-half_window - ha);
                let jd_rise = jd + dt_rise * sidereal_scale;
                RiseSet::Window {
                    jd_rise,
                    jd_set: jd_rise + 2.0 * half_window * sidereal_scale,
                }
            }
        }

        fn moon(&self, jd: f64) -> (f64, f64, f64) {
            let n = jd - JD_EPOCH_2000;
            let t = n / 36_525.0;
            let l0 = 218.316 + 13.176_396 * n;
            let m = (134.963 + 13.064_993 * n).to_radians();
            let f = (93.272 + 13.229_350 * n).to_radians();

            let lon = (l0 + 6.289 * m.sin()).to_radians();
            let lat = (5.128 * f.sin()).to_radians();
            let eps = (23.439_291 - 0.013_004_2 * t).to_radians();

            let ra = (lon.sin() * eps.cos() - lat.tan() * eps.sin()).atan2(lon.cos());
            let dec = (lat.sin() * eps.cos() + lat.cos() * eps.sin() * lon.sin()).asin();

            let sun_lon = (280.460 + 0.985_647_4 * n).to_radians();
            let illumination = 0.5 * (1.0 - (lon - sun_lon).cos());

            (
                wrap24(ra.to_degrees() / 15.0),
                dec.to_degrees(),
                illumination,
            )
        }

        fn night_times(&self, jd: f64, site: &Site) -> NightTimes {
            let (sun_ra, sun_dec) = sun_radec(jd);
            let sidereal_scale = (SIDEREAL_DAY_IN_HOURS / 24.0) / 24.0;

            // Nearest sun-set crossing for each threshold: during the day
            // that is the upcoming set, after dark it is the one already
            // behind us, so the bounds always describe the night containing
            // or following `jd`.
            let ha_sun = hour_angle(self.lst(jd, site), sun_ra);
            let night_bounds = |alt: f64| -> (f64, f64) {
                // Polar edge cases degrade to a nominal half window.
                let half =
                    hour_angle_at_altitude(alt, sun_dec, site.latitude_deg).unwrap_or(6.0);
                let jd_set = jd + clock_difference(half, ha_sun) * sidereal_scale;
                let below = (24.0 - 2.0 * half) * sidereal_scale;
                (jd_set, jd_set + below)
            };

            let (jd_sunset, jd_sunrise) = night_bounds(SUN_HORIZON_ALT_DEG);
            let (jd_dark_start, jd_dark_end) = night_bounds(SUN_DARK_ALT_DEG);
            let (moon_ra_hours, moon_dec_deg, moon_illumination) = self.moon(jd);

            NightTimes {
                jd_sunset,
                jd_sunrise,
                jd_dark_start,
                jd_dark_end,
                moon_ra_hours,
                moon_dec_deg,
                moon_illumination,
            }
        }
    }
}
