//! Authoritative field set for one night.
//!
//! The registry owns every [`Field`] and is the single place progress is
//! mutated, so the terminal invariant (a complete field never comes back)
//! holds no matter which module drives it.

use crate::config::{SchedulerConfig, MAX_FIELDS};
use crate::field::{Field, FieldError, FieldSpec, ObsSample};
use crate::record::{FieldProgress, ObservationRecord, RunIdentity};
use tracing::info;

#[derive(Debug)]
pub struct FieldRegistry {
    fields: Vec<Field>,
}

impl FieldRegistry {
    /// Validate and adopt a sequence. Any bad entry rejects the whole
    /// sequence; a night never starts on a partially-valid field set.
    pub fn from_specs(specs: Vec<FieldSpec>, config: &SchedulerConfig) -> Result<Self, FieldError> {
        if specs.len() > MAX_FIELDS {
            return Err(FieldError::TooManyFields {
                count: specs.len(),
                max: MAX_FIELDS,
            });
        }
        for (index, spec) in specs.iter().enumerate() {
            spec.validate(index, config)?;
        }
        let fields = specs
            .into_iter()
            .enumerate()
            .map(|(index, spec)| Field::new(index, spec))
            .collect();
        Ok(Self { fields })
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&Field> {
        self.fields.get(index)
    }

    pub fn get_mut(&mut self, index: usize) -> Option<&mut Field> {
        self.fields.get_mut(index)
    }

    pub fn fields(&self) -> &[Field] {
        &self.fields
    }

    pub fn fields_mut(&mut self) -> impl Iterator<Item = &mut Field> {
        self.fields.iter_mut()
    }

    pub fn completed(&self) -> usize {
        self.fields.iter().filter(|f| f.is_terminal()).count()
    }

    /// True once no field can ever be selected again tonight.
    pub fn all_retired(&self) -> bool {
        self.fields.iter().all(|f| f.is_terminal() || !f.doable)
    }

    /// Credit one verified observation against a field.
    pub fn record_observation(&mut self, index: usize, sample: ObsSample) -> Result<(), FieldError> {
        match self.fields.get_mut(index) {
            Some(field) => field.record_observation(sample),
            None => Err(FieldError::UnknownField { index }),
        }
    }

    /// Seed progress from a resumed record. Counts are clamped to each
    /// field's requirement and complete fields come back terminal.
    pub fn seed_from_record(&mut self, record: &ObservationRecord) {
        let mut resumed = 0;
        for progress in &record.fields {
            let Some(field) = self.fields.get_mut(progress.index) else {
                continue;
            };
            field.n_done = progress.n_done.min(field.spec.n_required);
            if let Some(last_jd) = progress.last_jd {
                field.jd_next = last_jd + field.interval_h / 24.0;
            }
            if field.is_terminal() {
                field.retire();
            }
            if field.n_done > 0 {
                resumed += 1;
            }
        }
        info!(
            resumed,
            complete = self.completed(),
            "progress seeded from observation record"
        );
    }

    /// Snapshot the current progress for checkpointing.
    pub fn snapshot(&self, run: RunIdentity) -> ObservationRecord {
        let fields = self
            .fields
            .iter()
            .map(|field| FieldProgress {
                index: field.index,
                n_done: field.n_done,
                last_jd: field.history.last().map(|sample| sample.jd),
            })
            .collect();
        ObservationRecord::new(run, fields)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::field::{sky_spec, FieldState, OutputName};

    fn registry(count: usize) -> FieldRegistry {
        let specs = (0..count).map(|i| sky_spec(i as f64, -30.0)).collect();
        FieldRegistry::from_specs(specs, &SchedulerConfig::default()).unwrap()
    }

    fn sample(jd: f64) -> ObsSample {
        ObsSample {
            name: OutputName::from("20260823041500s").unwrap(),
            jd,
            ut_hours: 4.25,
            lst_hours: 10.0,
            hour_angle_h: -1.0,
            airmass: 1.3,
            exposure_s: 30.0,
        }
    }

    fn run() -> RunIdentity {
        RunIdentity {
            night: "2026-08-23".to_string(),
            sequence_id: "survey.seq:2".to_string(),
            field_count: 2,
        }
    }

    #[test]
    fn bad_entry_rejects_the_whole_sequence() {
        let mut specs: Vec<FieldSpec> = (0..3).map(|i| sky_spec(i as f64, -30.0)).collect();
        specs[1].dec_deg = 95.0;
        let err = FieldRegistry::from_specs(specs, &SchedulerConfig::default()).unwrap_err();
        assert!(matches!(err, FieldError::DecOutOfRange { index: 1, .. }));
    }

    #[test]
    fn oversize_sequence_is_rejected() {
        let specs = (0..MAX_FIELDS + 1).map(|_| sky_spec(1.0, -30.0)).collect();
        let err = FieldRegistry::from_specs(specs, &SchedulerConfig::default()).unwrap_err();
        assert!(matches!(err, FieldError::TooManyFields { .. }));
    }

    #[test]
    fn snapshot_and_seed_round_trip_progress() {
        let mut registry = registry(2);
        registry.record_observation(0, sample(2_460_911.6)).unwrap();
        registry.record_observation(0, sample(2_460_911.7)).unwrap();

        let record = registry.snapshot(run());
        assert_eq!(record.fields[0].n_done, 2);
        assert_eq!(record.fields[0].last_jd, Some(2_460_911.7));
        assert_eq!(record.fields[1].n_done, 0);

        let mut resumed = registry_with_same_specs();
        resumed.seed_from_record(&record);
        assert_eq!(resumed.get(0).unwrap().n_done, 2);
        assert_eq!(resumed.get(0).unwrap().remaining(), 1);
        assert!(resumed.get(0).unwrap().jd_next > 2_460_911.7);
    }

    fn registry_with_same_specs() -> FieldRegistry {
        registry(2)
    }

    #[test]
    fn seeding_a_complete_field_retires_it() {
        let mut registry = registry(1);
        let mut record = registry.snapshot(RunIdentity {
            field_count: 1,
            ..run()
        });
        record.fields[0].n_done = 99; // over-count from a hand-edited record
        registry.seed_from_record(&record);

        let field = registry.get(0).unwrap();
        assert_eq!(field.n_done, field.spec.n_required);
        assert!(field.is_terminal());
        assert_eq!(field.state, FieldState::NotDoable);
        assert!(registry.all_retired());
    }

    #[test]
    fn all_retired_counts_vetoed_fields() {
        let mut registry = registry(2);
        assert!(!registry.all_retired());
        registry.get_mut(0).unwrap().retire();
        registry.get_mut(1).unwrap().retire();
        assert!(registry.all_retired());
    }
}
