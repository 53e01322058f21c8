//! End-to-end night runs against an in-process controller, with a stepping
//! clock and a stubbed-out sky so the schedule is fully deterministic.

use nightseq::camera::CameraController;
use nightseq::config::{ChannelTuning, SchedulerConfig, Site};
use nightseq::ephemeris::{Clock, Ephemeris, NightTimes, RiseSet};
use nightseq::field::{FieldSpec, ShutterKind, SurveyTag};
use nightseq::record::{ObservationRecord, ObservationRecordStore, RunIdentity};
use nightseq::registry::FieldRegistry;
use nightseq::scheduler::SchedulerCore;
use std::sync::{Arc, Mutex};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpListener;
use tokio::sync::watch;

const JD0: f64 = 2_460_911.5;

/// Clock that advances a fixed step on every read.
struct SteppingClock {
    jd: Mutex<f64>,
    step: f64,
}

impl SteppingClock {
    fn new(start: f64, step: f64) -> Self {
        Self {
            jd: Mutex::new(start),
            step,
        }
    }
}

impl Clock for SteppingClock {
    fn now_jd(&self) -> f64 {
        let mut jd = self.jd.lock().unwrap();
        let now = *jd;
        *jd += self.step;
        now
    }
}

/// A sky where every target sits on the meridian all night.
struct FlatSky {
    night: NightTimes,
}

impl FlatSky {
    fn tonight() -> Self {
        Self {
            night: NightTimes {
                jd_sunset: JD0 - 0.05,
                jd_sunrise: JD0 + 0.25,
                jd_dark_start: JD0 - 0.02,
                jd_dark_end: JD0 + 0.20,
                moon_ra_hours: 0.0,
                moon_dec_deg: 80.0,
                moon_illumination: 0.0,
            },
        }
    }
}

impl Ephemeris for FlatSky {
    fn lst(&self, _jd: f64, _site: &Site) -> f64 {
        10.0
    }

    fn altitude(&self, _ra: f64, _dec: f64, _lst: f64, _lat: f64) -> f64 {
        60.0
    }

    fn airmass(&self, _altitude_deg: f64) -> f64 {
        1.2
    }

    fn rise_set(&self, _ra: f64, _dec: f64, _jd: f64, _site: &Site, _alt: f64) -> RiseSet {
        RiseSet::AlwaysUp
    }

    fn moon(&self, _jd: f64) -> (f64, f64, f64) {
        (
            self.night.moon_ra_hours,
            self.night.moon_dec_deg,
            self.night.moon_illumination,
        )
    }

    fn night_times(&self, _jd: f64, _site: &Site) -> NightTimes {
        self.night.clone()
    }
}

/// Per-command behavior of the test controller. Commands beyond the
/// scripted steps are answered normally.
enum Step {
    Answer,
    Ignore,
}

/// Controller that answers or stays silent per the scripted steps, and logs
/// every command line it received.
async fn controller_with_steps(steps: Vec<Step>) -> (String, Arc<Mutex<Vec<String>>>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap().to_string();
    let seen = Arc::new(Mutex::new(Vec::new()));
    let seen_task = Arc::clone(&seen);

    tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let (reader, mut writer) = stream.into_split();
        let mut reader = BufReader::new(reader);
        let mut line = String::new();
        let mut steps = steps.into_iter();
        loop {
            line.clear();
            if reader.read_line(&mut line).await.unwrap_or(0) == 0 {
                break;
            }
            let command = line.trim().to_string();
            seen_task.lock().unwrap().push(command.clone());
            if matches!(steps.next(), Some(Step::Ignore)) {
                continue;
            }
            let reply = if command.starts_with("expose") {
                let seconds = command
                    .split_whitespace()
                    .nth(2)
                    .and_then(|v| v.parse::<f64>().ok())
                    .unwrap_or(0.0);
                format!("{seconds:.3} DONE")
            } else {
                "DONE".to_string()
            };
            if writer
                .write_all(format!("{reply}\n").as_bytes())
                .await
                .is_err()
            {
                break;
            }
        }
    });
    (addr, seen)
}

/// Controller that accepts everything instantly.
async fn obliging_controller() -> (String, Arc<Mutex<Vec<String>>>) {
    controller_with_steps(Vec::new()).await
}

fn test_config() -> SchedulerConfig {
    SchedulerConfig {
        idle_wait_s: 1,
        channel: ChannelTuning {
            command_delay_us: 100,
            short_deadline_s: 1,
            readout_time_s: 0,
            deadline_margin_s: 0,
            clear_time_s: 1,
            status_poll_ms: 25,
            max_retries: 1,
        },
        ..SchedulerConfig::default()
    }
}

fn sky_spec(ra_hours: f64, n_required: u32) -> FieldSpec {
    FieldSpec {
        ra_hours,
        dec_deg: -30.0,
        shutter: ShutterKind::Sky,
        exposure_s: 0.05,
        interval_h: 0.0001,
        n_required,
        survey: SurveyTag::None,
        filter: "clear".to_string(),
    }
}

fn run_identity(field_count: usize) -> RunIdentity {
    RunIdentity {
        night: "2026-08-23".to_string(),
        sequence_id: format!("test.seq:{field_count}"),
        field_count,
    }
}

async fn build_core(
    specs: Vec<FieldSpec>,
    store: ObservationRecordStore,
) -> (SchedulerCore, Arc<SteppingClock>) {
    let config = test_config();
    let count = specs.len();
    let registry = FieldRegistry::from_specs(specs, &config).unwrap();
    let clock = Arc::new(SteppingClock::new(JD0, 0.0005));
    let core = SchedulerCore::new(
        config,
        registry,
        Arc::new(FlatSky::tonight()),
        Arc::clone(&clock) as Arc<dyn Clock>,
        store,
        run_identity(count),
    )
    .unwrap();
    (core, clock)
}

async fn connect_camera(addr: &str) -> CameraController {
    let config = test_config();
    CameraController::connect(
        addr,
        None,
        config.channel,
        config.max_exposure_s,
        Arc::new(SteppingClock::new(JD0, 0.0001)),
    )
    .await
    .unwrap()
}

#[tokio::test]
async fn night_runs_until_every_field_is_complete() {
    let dir = tempfile::tempdir().unwrap();
    let store = ObservationRecordStore::new(dir.path().join("record.json"));
    let (addr, seen) = obliging_controller().await;

    let (mut core, _) = build_core(vec![sky_spec(10.0, 1), sky_spec(11.0, 2)], store).await;
    let mut camera = connect_camera(&addr).await;
    let (_tx, shutdown) = watch::channel(false);

    let summary = core.run(&mut camera, shutdown).await.unwrap();

    assert_eq!(summary.exposures, 3);
    assert_eq!(summary.failed_exposures, 0);
    assert_eq!(summary.fields_completed, 2);
    assert!(core.registry().all_retired());

    // The controller saw the startup clear plus one expose per credit.
    let seen = seen.lock().unwrap();
    assert!(seen[0].starts_with("clear"));
    assert_eq!(seen.iter().filter(|c| c.starts_with("expose")).count(), 3);

    // Progress was checkpointed durably.
    let store = ObservationRecordStore::new(dir.path().join("record.json"));
    let record = store.load(&run_identity(2)).unwrap().expect("record saved");
    assert_eq!(record.fields[0].n_done, 1);
    assert_eq!(record.fields[1].n_done, 2);
    assert!(record.fields[0].last_jd.is_some());
}

#[tokio::test]
async fn matching_record_resumes_instead_of_restarting() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("record.json");
    let (addr, seen) = obliging_controller().await;

    // A previous run already finished the first field.
    {
        let store = ObservationRecordStore::new(&path);
        let (core, _) = build_core(vec![sky_spec(10.0, 1), sky_spec(11.0, 1)], store).await;
        let mut seeded = core.registry().snapshot(run_identity(2));
        seeded.fields[0].n_done = 1;
        seeded.fields[0].last_jd = Some(JD0 - 0.01);
        ObservationRecordStore::new(&path)
            .save(&ObservationRecord::new(run_identity(2), seeded.fields))
            .unwrap();
    }

    let store = ObservationRecordStore::new(&path);
    let (mut core, _) = build_core(vec![sky_spec(10.0, 1), sky_spec(11.0, 1)], store).await;
    assert!(core.registry().get(0).unwrap().is_terminal());

    let mut camera = connect_camera(&addr).await;
    let (_tx, shutdown) = watch::channel(false);
    let summary = core.run(&mut camera, shutdown).await.unwrap();

    // Only the unfinished field was observed.
    assert_eq!(summary.exposures, 1);
    assert_eq!(summary.fields_completed, 2);
    let seen = seen.lock().unwrap();
    assert_eq!(seen.iter().filter(|c| c.starts_with("expose")).count(), 1);
}

#[tokio::test]
async fn shutdown_before_the_first_cycle_takes_no_exposures() {
    let dir = tempfile::tempdir().unwrap();
    let store = ObservationRecordStore::new(dir.path().join("record.json"));
    let (addr, seen) = obliging_controller().await;

    let (mut core, _) = build_core(vec![sky_spec(10.0, 5)], store).await;
    let mut camera = connect_camera(&addr).await;
    let (tx, shutdown) = watch::channel(true);

    let summary = core.run(&mut camera, shutdown).await.unwrap();
    drop(tx);

    assert_eq!(summary.exposures, 0);
    assert_eq!(
        seen.lock()
            .unwrap()
            .iter()
            .filter(|c| c.starts_with("expose"))
            .count(),
        0
    );
}

#[tokio::test]
async fn unknown_camera_state_is_reconciled_and_the_night_continues() {
    let dir = tempfile::tempdir().unwrap();
    let store = ObservationRecordStore::new(dir.path().join("record.json"));
    // The startup clear is answered, then the controller goes quiet for the
    // first exposure (both attempts) and its reconciling clear before
    // recovering.
    let (addr, seen) = controller_with_steps(vec![
        Step::Answer,
        Step::Ignore,
        Step::Ignore,
        Step::Ignore,
    ])
    .await;

    let (mut core, _) = build_core(vec![sky_spec(10.0, 1)], store).await;
    let mut camera = connect_camera(&addr).await;
    let (_tx, shutdown) = watch::channel(false);
    let summary = core.run(&mut camera, shutdown).await.unwrap();

    // The failed exposure left the camera unknown; the next cycle cleared it
    // and the field was still credited before the night ended.
    assert_eq!(summary.exposures, 1);
    assert_eq!(summary.failed_exposures, 1);
    assert!(core.registry().get(0).unwrap().is_terminal());
    let clears = seen
        .lock()
        .unwrap()
        .iter()
        .filter(|c| c.starts_with("clear"))
        .count();
    assert_eq!(clears, 3);
}

#[tokio::test]
async fn night_boundary_ends_the_run_with_work_left() {
    let dir = tempfile::tempdir().unwrap();
    let store = ObservationRecordStore::new(dir.path().join("record.json"));
    let (addr, _) = obliging_controller().await;

    // A huge stepping clock crosses sunrise after the first few cycles.
    let config = test_config();
    let registry =
        FieldRegistry::from_specs(vec![sky_spec(10.0, 50)], &config).unwrap();
    let clock = Arc::new(SteppingClock::new(JD0, 0.1));
    let mut core = SchedulerCore::new(
        config,
        registry,
        Arc::new(FlatSky::tonight()),
        clock as Arc<dyn Clock>,
        store,
        run_identity(1),
    )
    .unwrap();

    let mut camera = connect_camera(&addr).await;
    let (_tx, shutdown) = watch::channel(false);
    let summary = core.run(&mut camera, shutdown).await.unwrap();

    assert!(summary.exposures < 50);
    assert!(!core.registry().get(0).unwrap().is_terminal());
}
