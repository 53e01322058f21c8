use clap::{App, Arg};
use colored::*;
use nightseq::camera::CameraController;
use nightseq::config::SchedulerConfig;
use nightseq::ephemeris::analytic::AnalyticEphemeris;
use nightseq::ephemeris::{Clock, Ephemeris, SystemClock};
use nightseq::field::{FieldSpec, ShutterKind, SurveyTag};
use nightseq::record::{ObservationRecordStore, RunIdentity};
use nightseq::registry::FieldRegistry;
use nightseq::scheduler::{night_date, SchedulerCore};
use std::path::Path;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{info, warn};

const DEFAULT_CAMERA: &str = "127.0.0.1:5000";
const DEFAULT_RECORD: &str = "obs_record.json";

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();

    let matches = App::new("nightseq")
        .version("0.1.0")
        .author("Telescope Operations Team")
        .about("🔭 Observation sequencer - runs a survey night against a camera controller")
        .arg(
            Arg::with_name("sequence")
                .short("s")
                .long("sequence")
                .value_name("FILE")
                .help("Observation sequence file")
                .takes_value(true)
                .required(true),
        )
        .arg(
            Arg::with_name("camera")
                .short("c")
                .long("camera")
                .value_name("HOST:PORT")
                .help("Camera controller command address")
                .takes_value(true)
                .default_value(DEFAULT_CAMERA),
        )
        .arg(
            Arg::with_name("status")
                .long("status")
                .value_name("HOST:PORT")
                .help("Optional dedicated status channel address")
                .takes_value(true),
        )
        .arg(
            Arg::with_name("record")
                .short("r")
                .long("record")
                .value_name("FILE")
                .help("Observation record path (resume + checkpoints)")
                .takes_value(true)
                .default_value(DEFAULT_RECORD),
        )
        .arg(
            Arg::with_name("config")
                .long("config")
                .value_name("FILE")
                .help("Scheduler config as JSON (defaults are built in)")
                .takes_value(true),
        )
        .arg(
            Arg::with_name("check")
                .long("check")
                .help("Validate the sequence and print the plan without observing"),
        )
        .get_matches();

    let config = match matches.value_of("config") {
        Some(path) => serde_json::from_str(&std::fs::read_to_string(path)?)?,
        None => SchedulerConfig::default(),
    };

    let sequence_path = matches.value_of("sequence").unwrap_or_default();
    let specs = parse_sequence(sequence_path)?;
    if specs.is_empty() {
        eprintln!("{}", "No valid fields in sequence".red());
        std::process::exit(1);
    }
    let field_count = specs.len();
    let registry = FieldRegistry::from_specs(specs, &config)?;
    println!(
        "{} {} fields loaded from {}",
        "✓".green(),
        field_count,
        sequence_path.cyan()
    );

    let ephemeris = Arc::new(AnalyticEphemeris);
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let night = ephemeris.night_times(clock.now_jd(), &config.site);

    let run = RunIdentity {
        night: night_date(&night),
        sequence_id: format!("{}:{}", sequence_name(sequence_path), field_count),
        field_count,
    };
    let store = ObservationRecordStore::new(matches.value_of("record").unwrap_or(DEFAULT_RECORD));

    let mut core = SchedulerCore::new(
        config.clone(),
        registry,
        ephemeris,
        Arc::clone(&clock),
        store,
        run.clone(),
    )?;

    println!(
        "{} night {} | {} observable of {} fields | moon {:.0}% illuminated",
        "🔭".to_string().bold(),
        run.night.yellow(),
        core.registry()
            .fields()
            .iter()
            .filter(|f| f.doable && !f.is_terminal())
            .count(),
        field_count,
        core.night().moon_illumination * 100.0
    );

    if matches.is_present("check") {
        for field in core.registry().fields() {
            let flag = if field.is_terminal() {
                "done".green()
            } else if field.doable {
                "observable".cyan()
            } else {
                "vetoed".red()
            };
            println!(
                "  [{:3}] ra {:6.3} dec {:7.3} {:?} {:?} x{} -> {}",
                field.index,
                field.spec.ra_hours,
                field.spec.dec_deg,
                field.spec.shutter,
                field.spec.survey,
                field.remaining(),
                flag
            );
        }
        return Ok(());
    }

    let camera_addr = matches.value_of("camera").unwrap_or(DEFAULT_CAMERA);
    let mut camera = CameraController::connect(
        camera_addr,
        matches.value_of("status"),
        config.channel.clone(),
        config.max_exposure_s,
        clock,
    )
    .await?;
    info!(camera = camera_addr, "camera controller connected");

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received, finishing current exposure bookkeeping");
            let _ = shutdown_tx.send(true);
        }
    });

    let summary = core.run(&mut camera, shutdown_rx).await?;

    println!("\n{}", "Night summary".bold());
    println!("  exposures taken:   {}", summary.exposures.to_string().green());
    println!("  exposures failed:  {}", summary.failed_exposures.to_string().red());
    println!("  idle waits:        {}", summary.idle_waits);
    println!("  fields completed:  {}/{}", summary.fields_completed, field_count);
    println!("  fields retired:    {}", summary.fields_retired);

    Ok(())
}

fn sequence_name(path: &str) -> String {
    Path::new(path)
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.to_string())
}

/// Parse a sequence file: whitespace-separated field lines
/// `ra dec shutter expt_sec interval_sec n_required survey_code`,
/// `FILTER <name>` directives, `#` comments. Invalid lines are skipped
/// with a warning, matching long-standing operator expectations.
fn parse_sequence(path: &str) -> Result<Vec<FieldSpec>, std::io::Error> {
    let text = std::fs::read_to_string(path)?;
    let mut specs = Vec::new();
    let mut filter = "clear".to_string();

    for (line_num, raw) in text.lines().enumerate() {
        let line = raw.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        if line.to_uppercase().starts_with("FILTER") {
            if let Some(name) = line.split_whitespace().nth(1) {
                filter = name.to_string();
                info!(%filter, "filter directive");
            }
            continue;
        }

        let parts: Vec<&str> = line.split_whitespace().collect();
        if parts.len() < 7 {
            warn!(line = line_num + 1, "skipping short sequence line");
            continue;
        }
        let parsed = (|| -> Option<FieldSpec> {
            let shutter = ShutterKind::from_code(parts[2].chars().next()?)?;
            Some(FieldSpec {
                ra_hours: parts[0].parse().ok()?,
                dec_deg: parts[1].parse().ok()?,
                shutter,
                exposure_s: parts[3].parse().ok()?,
                interval_h: parts[4].parse::<f64>().ok()? / 3600.0,
                n_required: parts[5].parse().ok()?,
                survey: SurveyTag::from_code(parts[6].parse().ok()?)?,
                filter: filter.clone(),
            })
        })();
        match parsed {
            Some(spec) => specs.push(spec),
            None => warn!(line = line_num + 1, "skipping unparsable sequence line"),
        }
    }
    Ok(specs)
}
