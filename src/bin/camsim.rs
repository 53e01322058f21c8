//! Mock camera controller speaking the sequencer's wire protocol.
//!
//! Accepts `expose`, `clear` and `status` commands on the command port and
//! serves the same `status` command on a dedicated status port. Useful for
//! dry-running a sequence without hardware.

use clap::{App, Arg};
use nightseq::protocol::{
    ControllerStatus, CLEAR_COMMAND, DONE_REPLY, EXPOSE_COMMAND, STATUS_COMMAND,
};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::sleep;
use tracing::{error, info, warn};

const DEFAULT_COMMAND_PORT: &str = "5000";
const DEFAULT_STATUS_PORT: &str = "5001";

struct SimState {
    exposing: AtomicBool,
    /// Exposure seconds are multiplied by this before sleeping.
    time_scale: f64,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();

    let matches = App::new("nightseq-camsim")
        .version("0.1.0")
        .author("Telescope Operations Team")
        .about("📷 Mock camera controller for the observation sequencer")
        .arg(
            Arg::with_name("port")
                .short("p")
                .long("port")
                .value_name("PORT")
                .help("Command port")
                .takes_value(true)
                .default_value(DEFAULT_COMMAND_PORT),
        )
        .arg(
            Arg::with_name("status-port")
                .long("status-port")
                .value_name("PORT")
                .help("Status port")
                .takes_value(true)
                .default_value(DEFAULT_STATUS_PORT),
        )
        .arg(
            Arg::with_name("time-scale")
                .long("time-scale")
                .value_name("FACTOR")
                .help("Scale factor applied to exposure durations")
                .takes_value(true)
                .default_value("1.0"),
        )
        .get_matches();

    let state = Arc::new(SimState {
        exposing: AtomicBool::new(false),
        time_scale: matches
            .value_of("time-scale")
            .and_then(|v| v.parse().ok())
            .unwrap_or(1.0),
    });

    println!("📷 Mock Camera Controller");
    println!("=========================");

    let status_port = matches.value_of("status-port").unwrap_or(DEFAULT_STATUS_PORT);
    let status_state = Arc::clone(&state);
    let status_addr = format!("127.0.0.1:{status_port}");
    tokio::spawn(async move {
        if let Err(e) = serve(&status_addr, status_state, true).await {
            error!("status server error: {}", e);
        }
    });

    let port = matches.value_of("port").unwrap_or(DEFAULT_COMMAND_PORT);
    serve(&format!("127.0.0.1:{port}"), state, false).await?;
    Ok(())
}

async fn serve(
    addr: &str,
    state: Arc<SimState>,
    status_only: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    let listener = TcpListener::bind(addr).await?;
    info!("🌐 listening on {addr} (status_only={status_only})");

    loop {
        match listener.accept().await {
            Ok((stream, peer)) => {
                info!("🔗 client connected: {peer}");
                let client_state = Arc::clone(&state);
                tokio::spawn(async move {
                    if let Err(e) = handle_client(stream, client_state, status_only).await {
                        warn!("client {peer} error: {e}");
                    }
                    info!("🔌 client {peer} disconnected");
                });
            }
            Err(e) => error!("failed to accept connection: {e}"),
        }
    }
}

async fn handle_client(
    stream: TcpStream,
    state: Arc<SimState>,
    status_only: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    let (reader, mut writer) = stream.into_split();
    let mut reader = BufReader::new(reader);
    let mut line = String::new();

    loop {
        line.clear();
        if reader.read_line(&mut line).await? == 0 {
            return Ok(());
        }
        let command = line.trim();
        if command.is_empty() {
            continue;
        }
        info!("📨 {command}");

        let reply = if status_only || command == STATUS_COMMAND {
            status_reply(&state)
        } else {
            command_reply(command, &state).await
        };

        writer.write_all(reply.as_bytes()).await?;
        writer.write_all(b"\n").await?;
        info!("📤 {reply}");
    }
}

fn status_reply(state: &SimState) -> String {
    let exposing = state.exposing.load(Ordering::SeqCst);
    let status = ControllerStatus {
        ready: !exposing,
        exposing,
        error_code: 0,
        state: if exposing { "EXPOSING" } else { "IDLE" }.to_string(),
    };
    match serde_json::to_string(&status) {
        Ok(payload) => format!("{payload} {DONE_REPLY}"),
        Err(_) => "ERROR status".to_string(),
    }
}

async fn command_reply(command: &str, state: &SimState) -> String {
    let parts: Vec<&str> = command.split_whitespace().collect();
    match parts.first().copied() {
        Some(EXPOSE_COMMAND) => {
            let Some(seconds) = parts.get(2).and_then(|v| v.parse::<f64>().ok()) else {
                return format!("bad expose arguments ERROR {DONE_REPLY}");
            };
            state.exposing.store(true, Ordering::SeqCst);
            sleep(Duration::from_secs_f64(
                (seconds * state.time_scale).clamp(0.0, 3600.0),
            ))
            .await;
            state.exposing.store(false, Ordering::SeqCst);
            format!("{seconds:.3} {DONE_REPLY}")
        }
        Some(CLEAR_COMMAND) => {
            sleep(Duration::from_millis(50)).await;
            DONE_REPLY.to_string()
        }
        Some(STATUS_COMMAND) => status_reply(state),
        _ => format!("unknown command ERROR {DONE_REPLY}"),
    }
}
