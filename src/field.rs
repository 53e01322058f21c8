use crate::config::{SchedulerConfig, MAX_OBS_PER_FIELD};
use arrayvec::ArrayString;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Output identifiers are `yyyymmddHHMMSS` plus a one-letter shutter code.
pub const OUTPUT_NAME_LEN: usize = 16;

pub type OutputName = ArrayString<OUTPUT_NAME_LEN>;

/// Exposure kind, carried as a one-letter code in output names.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ShutterKind {
    Dark,
    Sky,
    Focus,
    Offset,
    EveningFlat,
    MorningFlat,
    DomeFlat,
}

impl ShutterKind {
    pub fn code(self) -> char {
        match self {
            ShutterKind::Dark => 'd',
            ShutterKind::Sky => 's',
            ShutterKind::Focus => 'f',
            ShutterKind::Offset => 'p',
            ShutterKind::EveningFlat => 'e',
            ShutterKind::MorningFlat => 'm',
            ShutterKind::DomeFlat => 'l',
        }
    }

    pub fn from_code(code: char) -> Option<Self> {
        match code.to_ascii_lowercase() {
            'd' => Some(ShutterKind::Dark),
            's' => Some(ShutterKind::Sky),
            'f' => Some(ShutterKind::Focus),
            'p' => Some(ShutterKind::Offset),
            'e' => Some(ShutterKind::EveningFlat),
            'm' => Some(ShutterKind::MorningFlat),
            'l' => Some(ShutterKind::DomeFlat),
            _ => None,
        }
    }

    /// Whether the shutter actually opens on sky.
    pub fn is_on_sky(self) -> bool {
        !matches!(self, ShutterKind::Dark | ShutterKind::DomeFlat)
    }

    /// Calibration frames jump the selection queue whenever feasible.
    pub fn is_calibration(self) -> bool {
        !matches!(self, ShutterKind::Sky)
    }
}

/// Survey ownership tag from the sequence file. Only [`SurveyTag::MustDo`]
/// affects selection; the others ride along so a field keeps its survey
/// identity through logs and records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SurveyTag {
    None,
    Tno,
    Sne,
    MustDo,
    Ligo,
}

impl SurveyTag {
    pub fn from_code(code: u32) -> Option<Self> {
        match code {
            0 => Some(SurveyTag::None),
            1 => Some(SurveyTag::Tno),
            2 => Some(SurveyTag::Sne),
            3 => Some(SurveyTag::MustDo),
            4 => Some(SurveyTag::Ligo),
            _ => None,
        }
    }

    pub fn code(self) -> u32 {
        match self {
            SurveyTag::None => 0,
            SurveyTag::Tno => 1,
            SurveyTag::Sne => 2,
            SurveyTag::MustDo => 3,
            SurveyTag::Ligo => 4,
        }
    }
}

/// Per-cycle classification of a field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FieldState {
    /// Cannot be observed this cycle (or ever, if permanently vetoed).
    NotDoable,
    /// Feasible now, but the remaining series no longer fits before set.
    TooLate,
    /// Feasible now with enough time left for the whole series.
    Ready,
    /// Must be taken at the next opportunity.
    DoNow,
}

#[derive(Debug, Error, PartialEq)]
pub enum FieldError {
    #[error("field {index}: right ascension {ra_hours} outside [0, 24)")]
    RaOutOfRange { index: usize, ra_hours: f64 },
    #[error("field {index}: declination {dec_deg} outside [-90, 90]")]
    DecOutOfRange { index: usize, dec_deg: f64 },
    #[error("field {index}: exposure {exposure_s} s outside (0, {max_s}]")]
    BadExposure {
        index: usize,
        exposure_s: f64,
        max_s: f64,
    },
    #[error("field {index}: interval {interval_h} h outside [{min_h}, {max_h}]")]
    BadInterval {
        index: usize,
        interval_h: f64,
        min_h: f64,
        max_h: f64,
    },
    #[error("field {index}: requested count {count} outside [1, {max}]")]
    BadCount { index: usize, count: u32, max: u32 },
    #[error("sequence holds {count} fields, limit is {max}")]
    TooManyFields { count: usize, max: usize },
    #[error("field {index} is already complete")]
    AlreadyComplete { index: usize },
    #[error("no field at index {index}")]
    UnknownField { index: usize },
    #[error("history for field {index} is full")]
    HistoryFull { index: usize },
}

/// One validated sequence-file entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FieldSpec {
    pub ra_hours: f64,
    pub dec_deg: f64,
    pub shutter: ShutterKind,
    pub exposure_s: f64,
    /// Minimum gap between successive observations of this field, hours.
    pub interval_h: f64,
    pub n_required: u32,
    pub survey: SurveyTag,
    /// Active filter name from the most recent FILTER directive.
    pub filter: String,
}

impl FieldSpec {
    pub fn validate(&self, index: usize, config: &SchedulerConfig) -> Result<(), FieldError> {
        if !(0.0..24.0).contains(&self.ra_hours) || !self.ra_hours.is_finite() {
            return Err(FieldError::RaOutOfRange {
                index,
                ra_hours: self.ra_hours,
            });
        }
        if !(-90.0..=90.0).contains(&self.dec_deg) || !self.dec_deg.is_finite() {
            return Err(FieldError::DecOutOfRange {
                index,
                dec_deg: self.dec_deg,
            });
        }
        if !(self.exposure_s > 0.0 && self.exposure_s <= config.max_exposure_s) {
            return Err(FieldError::BadExposure {
                index,
                exposure_s: self.exposure_s,
                max_s: config.max_exposure_s,
            });
        }
        if !(config.min_interval_h..=config.max_interval_h).contains(&self.interval_h) {
            return Err(FieldError::BadInterval {
                index,
                interval_h: self.interval_h,
                min_h: config.min_interval_h,
                max_h: config.max_interval_h,
            });
        }
        if self.n_required == 0 || self.n_required as usize > MAX_OBS_PER_FIELD {
            return Err(FieldError::BadCount {
                index,
                count: self.n_required,
                max: MAX_OBS_PER_FIELD as u32,
            });
        }
        Ok(())
    }
}

/// One completed observation of a field.
#[derive(Debug, Clone)]
pub struct ObsSample {
    pub name: OutputName,
    pub jd: f64,
    pub ut_hours: f64,
    pub lst_hours: f64,
    pub hour_angle_h: f64,
    pub airmass: f64,
    pub exposure_s: f64,
}

/// A sequence field plus its live scheduling state for the night.
#[derive(Debug, Clone)]
pub struct Field {
    pub index: usize,
    pub spec: FieldSpec,
    pub state: FieldState,
    /// Cleared at init for fields that can never satisfy the constraints.
    pub doable: bool,
    pub n_done: u32,
    /// Feasibility window for tonight, Julian dates.
    pub jd_rise: f64,
    pub jd_set: f64,
    /// Earliest next observation; the re-observation interval gate.
    pub jd_next: f64,
    /// Current interval, hours. Starts at the spec value and may be
    /// shortened when the field runs out of night.
    pub interval_h: f64,
    /// Spare time beyond the remaining series, hours. Refreshed each cycle.
    pub time_left: f64,
    pub history: heapless::Vec<ObsSample, MAX_OBS_PER_FIELD>,
}

impl Field {
    pub fn new(index: usize, spec: FieldSpec) -> Self {
        let interval_h = spec.interval_h;
        Self {
            index,
            spec,
            state: FieldState::NotDoable,
            doable: true,
            n_done: 0,
            jd_rise: 0.0,
            jd_set: 0.0,
            jd_next: 0.0,
            interval_h,
            time_left: 0.0,
            history: heapless::Vec::new(),
        }
    }

    pub fn remaining(&self) -> u32 {
        self.spec.n_required.saturating_sub(self.n_done)
    }

    /// A complete field never re-enters any schedulable state.
    pub fn is_terminal(&self) -> bool {
        self.n_done >= self.spec.n_required
    }

    pub fn is_must_do(&self) -> bool {
        self.spec.survey == SurveyTag::MustDo
    }

    /// Permanently drop the field from the night.
    pub fn retire(&mut self) {
        self.doable = false;
        self.state = FieldState::NotDoable;
    }

    /// Credit one verified observation and stamp the interval gate.
    pub fn record_observation(&mut self, sample: ObsSample) -> Result<(), FieldError> {
        if self.is_terminal() {
            return Err(FieldError::AlreadyComplete { index: self.index });
        }
        let jd = sample.jd;
        self.history
            .push(sample)
            .map_err(|_| FieldError::HistoryFull { index: self.index })?;
        self.n_done += 1;
        self.jd_next = jd + self.interval_h / 24.0;
        if self.is_terminal() {
            self.state = FieldState::NotDoable;
        }
        Ok(())
    }
}

/// Test fixture used across the crate's unit tests.
#[cfg(test)]
pub(crate) fn sky_spec(ra_hours: f64, dec_deg: f64) -> FieldSpec {
    FieldSpec {
        ra_hours,
        dec_deg,
        shutter: ShutterKind::Sky,
        exposure_s: 30.0,
        interval_h: 0.5,
        n_required: 3,
        survey: SurveyTag::None,
        filter: "clear".to_string(),
    }
}
