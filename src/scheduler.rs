//! Night orchestrator.
//!
//! Each cycle reclassifies every field from the current time, picks at most
//! one, exposes it, and checkpoints progress before reporting the outcome.
//! Classification and selection are pure functions of the field set and the
//! clock so a night is reproducible from its sequence and its record.

use crate::camera::{CameraController, CameraError, ExposureFailure};
use crate::config::{SchedulerConfig, SIDEREAL_DAY_IN_HOURS};
use crate::ephemeris::{
    altitude_for_airmass, angular_separation_deg, calendar_from_jd, hour_angle, Clock, Ephemeris,
    NightTimes, RiseSet,
};
use crate::field::{Field, FieldState, ObsSample, ShutterKind};
use crate::record::{ObservationRecordStore, RecordError, RunIdentity};
use crate::registry::FieldRegistry;
use serde::Serialize;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::watch;
use tokio::time::sleep;
use tracing::{debug, error, info, warn};

#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error(transparent)]
    Field(#[from] crate::field::FieldError),
    #[error(transparent)]
    Record(#[from] RecordError),
    #[error(transparent)]
    Camera(#[from] CameraError),
}

/// End-of-night accounting.
#[derive(Debug, Clone, Default, Serialize)]
pub struct NightSummary {
    pub exposures: u32,
    pub failed_exposures: u32,
    pub idle_waits: u32,
    pub fields_completed: usize,
    pub fields_retired: usize,
}

pub struct SchedulerCore {
    config: SchedulerConfig,
    registry: FieldRegistry,
    ephemeris: Arc<dyn Ephemeris>,
    clock: Arc<dyn Clock>,
    store: ObservationRecordStore,
    run: RunIdentity,
    night: NightTimes,
    prev_selected: Option<usize>,
    summary: NightSummary,
}

impl SchedulerCore {
    /// Build the night: resume progress if a matching record exists, then
    /// assign feasibility windows and apply the permanent vetoes.
    pub fn new(
        config: SchedulerConfig,
        mut registry: FieldRegistry,
        ephemeris: Arc<dyn Ephemeris>,
        clock: Arc<dyn Clock>,
        store: ObservationRecordStore,
        run: RunIdentity,
    ) -> Result<Self, SchedulerError> {
        let jd = clock.now_jd();
        let night = ephemeris.night_times(jd, &config.site);
        info!(
            sunset = night.jd_sunset,
            sunrise = night.jd_sunrise,
            moon_illumination = format!("{:.2}", night.moon_illumination),
            "night initialized"
        );

        if let Some(record) = store.load(&run)? {
            registry.seed_from_record(&record);
        }

        let mut core = Self {
            config,
            registry,
            ephemeris,
            clock,
            store,
            run,
            night,
            prev_selected: None,
            summary: NightSummary::default(),
        };
        core.init_fields(jd);
        Ok(core)
    }

    pub fn registry(&self) -> &FieldRegistry {
        &self.registry
    }

    pub fn night(&self) -> &NightTimes {
        &self.night
    }

    /// Assign each field its feasibility window for tonight and retire the
    /// fields that can never satisfy the constraints.
    fn init_fields(&mut self, jd: f64) {
        let night = self.night.clone();
        let config = self.config.clone();
        let ephemeris = Arc::clone(&self.ephemeris);
        let skyflat_wait = config.skyflat_wait_h / 24.0;

        for field in self.registry.fields_mut() {
            if field.is_terminal() {
                continue;
            }
            match field.spec.shutter {
                ShutterKind::Dark | ShutterKind::DomeFlat => {
                    field.jd_rise = night.jd_sunset;
                    field.jd_set = night.jd_sunrise;
                }
                ShutterKind::Focus | ShutterKind::Offset => {
                    field.jd_rise = night.jd_dark_start;
                    field.jd_set = night.jd_dark_end;
                }
                ShutterKind::EveningFlat => {
                    field.jd_rise = night.jd_sunset + skyflat_wait;
                    field.jd_set = night.jd_dark_start;
                }
                ShutterKind::MorningFlat => {
                    field.jd_rise = night.jd_dark_end;
                    field.jd_set = night.jd_sunrise - skyflat_wait;
                }
                ShutterKind::Sky => {
                    if !sky_window(field, jd, &night, &config, ephemeris.as_ref()) {
                        debug!(field = field.index, "retired at init");
                        field.retire();
                        continue;
                    }
                }
            }
            if field.jd_set <= field.jd_rise {
                field.retire();
            }
        }

        let retired = self
            .registry
            .fields()
            .iter()
            .filter(|f| !f.doable)
            .count();
        info!(
            fields = self.registry.len(),
            retired, "feasibility windows assigned"
        );
    }

    /// Reclassify every field for the current time.
    pub fn classify(&mut self, jd: f64) {
        for field in self.registry.fields_mut() {
            classify_field(field, jd);
        }
        self.upgrade_paired_follow_up();
    }

    /// The immediate successor of the last observed field jumps the queue
    /// when the two form an adjacent same-declination pair.
    fn upgrade_paired_follow_up(&mut self) {
        let Some(prev_index) = self.prev_selected else {
            return;
        };
        let candidate = prev_index + 1;
        let Some(prev) = self.registry.get(prev_index) else {
            return;
        };
        let Some(next) = self.registry.get(candidate) else {
            return;
        };
        if paired_fields(prev, next, self.config.ra_pair_step_h)
            && matches!(next.state, FieldState::Ready | FieldState::TooLate)
        {
            if let Some(next) = self.registry.get_mut(candidate) {
                next.state = FieldState::DoNow;
            }
        }
    }

    /// Deterministic selection over the classified set.
    pub fn select(&self) -> Option<usize> {
        select_index(self.registry.fields())
    }

    /// When nothing is ready, try to rescue the least-late field by
    /// compressing its cadence to exactly fit the time it has left.
    fn rescue_late_field(&mut self) -> Option<usize> {
        let index = rescue_candidate(self.registry.fields())?;
        let floor_h =
            (self.registry.get(index)?.spec.exposure_s + self.config.channel.readout_time_s as f64)
                / 3600.0;
        let field = self.registry.get_mut(index)?;

        let remaining = f64::from(field.remaining().max(1));
        let shortened = (field.time_left / remaining + field.interval_h).max(0.0);
        if shortened < floor_h || shortened < self.config.min_execution_time_h {
            info!(
                field = field.index,
                "cadence cannot be compressed further, retiring"
            );
            field.retire();
            return None;
        }
        info!(
            field = field.index,
            old_interval_h = field.interval_h,
            new_interval_h = shortened,
            "cadence compressed to fit the remaining window"
        );
        field.interval_h = shortened;
        field.time_left = 0.0;
        field.state = FieldState::Ready;
        Some(index)
    }

    /// Run the night to completion.
    ///
    /// Ends when the night-end boundary passes, every field is permanently
    /// retired, or shutdown is requested. An exposure in flight at shutdown
    /// is abandoned, never credited.
    pub async fn run(
        &mut self,
        camera: &mut CameraController,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<NightSummary, SchedulerError> {
        // Reconcile controller state before the first command of the night.
        camera.clear().await?;

        loop {
            if *shutdown.borrow() {
                info!("shutdown requested, ending night");
                break;
            }
            let jd = self.clock.now_jd();
            if jd >= self.night.jd_sunrise {
                info!(jd, "night boundary reached");
                break;
            }
            if self.registry.all_retired() {
                info!("every field is complete or retired");
                break;
            }

            self.classify(jd);
            let picked = self.select().or_else(|| self.rescue_late_field());

            match picked {
                Some(index) => self.observe(index, camera, &mut shutdown).await?,
                None => {
                    self.summary.idle_waits += 1;
                    debug!(jd, "nothing observable, idling");
                    tokio::select! {
                        () = sleep(self.config.idle_wait()) => {}
                        _ = shutdown.changed() => {}
                    }
                }
            }
        }

        self.summary.fields_completed = self.registry.completed();
        self.summary.fields_retired = self
            .registry
            .fields()
            .iter()
            .filter(|f| !f.doable && !f.is_terminal())
            .count();
        info!(summary = ?self.summary, "night finished");
        Ok(self.summary.clone())
    }

    /// One execution cycle: expose, verify, credit, checkpoint, report.
    async fn observe(
        &mut self,
        index: usize,
        camera: &mut CameraController,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Result<(), SchedulerError> {
        let (exposure_s, state) = match self.registry.get(index) {
            Some(field) => (field.spec.exposure_s, field.state),
            None => return Ok(()),
        };

        let handle = match camera.start_exposure(
            self.registry
                .get(index)
                .ok_or(crate::field::FieldError::UnknownField { index })?,
        ) {
            Ok(handle) => handle,
            Err(CameraError::Busy) => {
                // One exposure at a time is an invariant of this loop;
                // reaching this arm means an in-flight handle leaked past a
                // failure path.
                error!(
                    field = index,
                    "camera busy on a fresh cycle, reconciling with a clear"
                );
                camera.clear().await?;
                return Ok(());
            }
            Err(CameraError::NeedsClear) => {
                warn!(field = index, "camera state unknown, reconciling with a clear");
                camera.clear().await?;
                return Ok(());
            }
            Err(e) => return Err(e.into()),
        };

        // The worker retries internally, so the outer wait must cover every
        // attempt plus slack for pacing.
        let attempts = self.config.channel.max_retries + 1;
        let wait_timeout = self
            .config
            .channel
            .exposure_deadline(exposure_s)
            .saturating_mul(attempts)
            + self.config.channel.short_deadline();

        let result = camera.wait_completion(handle, wait_timeout, shutdown).await;

        if result.succeeded() {
            let lst = self.ephemeris.lst(result.jd_start, &self.config.site);
            let (ra, dec) = match self.registry.get(index) {
                Some(field) => (field.spec.ra_hours, field.spec.dec_deg),
                None => (0.0, 0.0),
            };
            let altitude = self
                .ephemeris
                .altitude(ra, dec, lst, self.config.site.latitude_deg);
            let sample = ObsSample {
                name: result.name,
                jd: result.jd_start,
                ut_hours: result.ut_start_hours,
                lst_hours: lst,
                hour_angle_h: hour_angle(lst, ra),
                airmass: self.ephemeris.airmass(altitude),
                exposure_s: result.actual_exposure_s,
            };
            self.registry.record_observation(index, sample)?;

            // The checkpoint must be durable before the outcome is reported.
            if let Err(e) = self.store.save(&self.registry.snapshot(self.run.clone())) {
                warn!(error = %e, "checkpoint failed, progress held in memory only");
            }

            let field = self.registry.get(index);
            info!(
                field = index,
                name = %result.name,
                state = ?state,
                exposure_s = result.actual_exposure_s,
                done = field.map_or(0, |f| f.n_done),
                required = field.map_or(0, |f| f.spec.n_required),
                "observation credited"
            );
            self.prev_selected = Some(index);
            self.summary.exposures += 1;
        } else {
            self.summary.failed_exposures += 1;
            self.prev_selected = None;
            match result.failure {
                Some(ExposureFailure::Cancelled) => {
                    info!(field = index, "exposure abandoned by shutdown");
                }
                failure => {
                    error!(
                        field = index,
                        ?failure,
                        attempts = result.attempts,
                        "exposure failed, reconciling camera"
                    );
                    if let Err(e) = camera.clear().await {
                        error!(error = %e, "camera clear failed after exposure failure");
                    }
                }
            }
        }
        Ok(())
    }
}

/// Derive the night date string (`yyyy-mm-dd` of the evening) for a run.
pub fn night_date(night: &NightTimes) -> String {
    let (year, month, day, _, _, _) = calendar_from_jd(night.jd_sunset);
    format!("{year:04}-{month:02}-{day:02}")
}

/// Compute a sky field's feasibility window. Returns false when the field
/// can never be observed tonight.
fn sky_window(
    field: &mut Field,
    jd: f64,
    night: &NightTimes,
    config: &SchedulerConfig,
    ephemeris: &dyn Ephemeris,
) -> bool {
    let spec = &field.spec;
    if spec.dec_deg < config.min_dec_deg || spec.dec_deg > config.max_dec_deg {
        return false;
    }
    let moon_sep = angular_separation_deg(
        spec.ra_hours,
        spec.dec_deg,
        night.moon_ra_hours,
        night.moon_dec_deg,
    );
    if moon_sep < config.min_moon_separation_deg {
        debug!(field = field.index, moon_sep, "too close to the moon");
        return false;
    }

    let min_altitude = altitude_for_airmass(config.airmass_limit(spec.dec_deg));
    let airmass_window = match ephemeris.rise_set(
        spec.ra_hours,
        spec.dec_deg,
        night.jd_dark_start.max(jd),
        &config.site,
        min_altitude,
    ) {
        RiseSet::NeverUp => return false,
        RiseSet::AlwaysUp => (night.jd_dark_start, night.jd_dark_end),
        RiseSet::Window { jd_rise, jd_set } => (jd_rise, jd_set),
    };

    // Hour-angle limit either side of the meridian.
    let sidereal_scale = (SIDEREAL_DAY_IN_HOURS / 24.0) / 24.0;
    let ha_now = hour_angle(
        ephemeris.lst(night.jd_dark_start.max(jd), &config.site),
        spec.ra_hours,
    );
    let base = night.jd_dark_start.max(jd);
    let ha_window = if ha_now.abs() < config.max_hour_angle_h {
        (
            base - (ha_now + config.max_hour_angle_h) * sidereal_scale,
            base + (config.max_hour_angle_h - ha_now) * sidereal_scale,
        )
    } else {
        let dt = crate::ephemeris::wrap24(-config.max_hour_angle_h - ha_now);
        let rise = base + dt * sidereal_scale;
        (
            rise,
            rise + 2.0 * config.max_hour_angle_h * sidereal_scale,
        )
    };

    let jd_rise = airmass_window
        .0
        .max(ha_window.0)
        .max(night.jd_dark_start);
    let jd_set = airmass_window.1.min(ha_window.1).min(night.jd_dark_end);
    if jd_set <= jd_rise {
        return false;
    }

    let window_h = (jd_set - jd_rise) * SIDEREAL_DAY_IN_HOURS;
    if window_h < config.min_execution_time_h {
        return false;
    }
    // A field that can never finish its series is not worth starting,
    // unless it is tagged must-do.
    if !field.is_must_do() {
        let needed_h = f64::from(field.remaining()) * field.interval_h;
        if window_h < needed_h && field.remaining() > 1 {
            return false;
        }
    }

    field.jd_rise = jd_rise;
    field.jd_set = jd_set;
    true
}

/// Per-cycle classification of a single field.
pub(crate) fn classify_field(field: &mut Field, jd: f64) {
    if field.is_terminal() || !field.doable {
        field.state = FieldState::NotDoable;
        return;
    }
    if jd < field.jd_rise || jd > field.jd_set {
        field.state = FieldState::NotDoable;
        return;
    }
    if jd < field.jd_next {
        field.state = FieldState::NotDoable;
        return;
    }
    if field.spec.shutter.is_calibration() {
        field.state = FieldState::DoNow;
        return;
    }

    let time_up = (field.jd_set - jd) * SIDEREAL_DAY_IN_HOURS;
    let time_required = f64::from(field.remaining()) * field.interval_h;
    field.time_left = time_up - time_required;
    field.state = if field.time_left < 0.0 {
        FieldState::TooLate
    } else {
        FieldState::Ready
    };
}

/// True when `next` is the adjacent same-declination partner of `prev`.
pub(crate) fn paired_fields(prev: &Field, next: &Field, ra_step_h: f64) -> bool {
    if prev.spec.shutter != ShutterKind::Sky || next.spec.shutter != ShutterKind::Sky {
        return false;
    }
    if (prev.spec.dec_deg - next.spec.dec_deg).abs() > 1e-6 {
        return false;
    }
    let cos_dec = prev.spec.dec_deg.to_radians().cos();
    if cos_dec <= 0.0 {
        return false;
    }
    let delta_ra = crate::ephemeris::clock_difference(prev.spec.ra_hours, next.spec.ra_hours).abs();
    delta_ra < ra_step_h / cos_dec
}

/// Selection over a classified field set.
///
/// Do-now fields first (lowest index), then must-do ready fields, then the
/// rest of the ready fields; ready ties are broken by fewest observations
/// remaining, then least spare time, then index, so equal inputs always
/// select the same field.
pub(crate) fn select_index(fields: &[Field]) -> Option<usize> {
    if let Some(field) = fields.iter().find(|f| f.state == FieldState::DoNow) {
        return Some(field.index);
    }

    let best_ready = |must_do: bool| {
        fields
            .iter()
            .filter(|f| f.state == FieldState::Ready && f.is_must_do() == must_do)
            .min_by(|a, b| {
                a.remaining()
                    .cmp(&b.remaining())
                    .then(a.time_left.total_cmp(&b.time_left))
                    .then(a.index.cmp(&b.index))
            })
            .map(|f| f.index)
    };

    best_ready(true).or_else(|| best_ready(false))
}

/// Pick the least-late too-late field, must-do first.
pub(crate) fn rescue_candidate(fields: &[Field]) -> Option<usize> {
    let best_late = |must_do: bool| {
        fields
            .iter()
            .filter(|f| f.state == FieldState::TooLate && f.is_must_do() == must_do)
            .max_by(|a, b| a.time_left.total_cmp(&b.time_left))
            .map(|f| f.index)
    };
    best_late(true).or_else(|| best_late(false))
}
