//! Camera controller: exposure lifecycle over the command channel.
//!
//! At most one exposure is in flight. Each exposure is a worker task that
//! rendezvouses with the caller twice: once when the command is handed to
//! the transport ("accepted") and once when the verified outcome is known
//! ("complete"). Completion is consumed exactly once through the
//! [`ExposureHandle`].

use crate::channel::{ChannelError, CommandChannel};
use crate::config::ChannelTuning;
use crate::ephemeris::{calendar_from_jd, ut_hours, Clock};
use crate::field::{Field, OutputName, ShutterKind};
use crate::protocol::{self, ControllerStatus, ProtocolError};
use serde::Serialize;
use std::fmt::Write as _;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{oneshot, watch, Mutex as AsyncMutex};
use tokio::time::{interval, sleep_until, timeout_at, Instant};
use tracing::{debug, info, warn};

#[derive(Debug, Error)]
pub enum CameraError {
    #[error("an exposure is already in flight")]
    Busy,
    #[error("camera state unknown, clear required")]
    NeedsClear,
    #[error("exposure of {requested_s} s exceeds the {max_s} s limit")]
    ExposureTooLong { requested_s: f64, max_s: f64 },
    #[error(transparent)]
    Channel(#[from] ChannelError),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error("exposure worker dropped its handshake")]
    HandshakeLost,
}

/// Why an exposure attempt did not produce a creditable observation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ExposureFailure {
    /// No reply within the deadline; controller state is unknown.
    Timeout,
    /// The connection failed or the reply was unusable.
    Transport,
    /// The controller answered with an error reply.
    Rejected,
    /// Shutdown was requested while waiting.
    Cancelled,
}

/// Verified outcome of one exposure. Successful results are the only
/// evidence the scheduler accepts before crediting progress.
#[derive(Debug, Clone)]
pub struct ExposureResult {
    pub name: OutputName,
    pub field_index: usize,
    pub jd_start: f64,
    pub ut_start_hours: f64,
    /// Shutter-open seconds reported back by the controller.
    pub actual_exposure_s: f64,
    pub attempts: u32,
    pub failure: Option<ExposureFailure>,
}

impl ExposureResult {
    pub fn succeeded(&self) -> bool {
        self.failure.is_none()
    }

    fn failed(mut self, failure: ExposureFailure) -> Self {
        self.failure = Some(failure);
        self
    }
}

/// Rendezvous pair for one in-flight exposure.
pub struct ExposureHandle {
    pub name: OutputName,
    pub field_index: usize,
    accepted: oneshot::Receiver<()>,
    completed: oneshot::Receiver<ExposureResult>,
    skeleton: ExposureResult,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum CameraHealth {
    Idle,
    Exposing,
    /// A deadline expired with no verified reply; reconcile before reuse.
    Unknown,
    Error,
}

/// Observable controller state kept by this side.
#[derive(Debug, Clone, Serialize)]
pub struct CameraStatus {
    pub health: CameraHealth,
    pub exposures_started: u64,
    pub exposures_completed: u64,
    pub command_retries: u64,
    /// Last strictly-parsed payload from the status channel, if any.
    pub controller: Option<ControllerStatus>,
}

impl CameraStatus {
    fn new() -> Self {
        Self {
            health: CameraHealth::Unknown,
            exposures_started: 0,
            exposures_completed: 0,
            command_retries: 0,
            controller: None,
        }
    }
}

pub struct CameraController {
    channel: Arc<AsyncMutex<CommandChannel>>,
    status_channel: Option<Arc<AsyncMutex<CommandChannel>>>,
    tuning: ChannelTuning,
    max_exposure_s: f64,
    clock: Arc<dyn Clock>,
    status: Arc<Mutex<CameraStatus>>,
    in_flight: bool,
}

impl CameraController {
    pub async fn connect(
        command_addr: &str,
        status_addr: Option<&str>,
        tuning: ChannelTuning,
        max_exposure_s: f64,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, CameraError> {
        let channel = CommandChannel::connect(command_addr, tuning.command_delay()).await?;
        let status_channel = match status_addr {
            Some(addr) => Some(Arc::new(AsyncMutex::new(
                CommandChannel::connect(addr, tuning.command_delay()).await?,
            ))),
            None => None,
        };
        Ok(Self::new(channel, status_channel, tuning, max_exposure_s, clock))
    }

    pub fn new(
        channel: CommandChannel,
        status_channel: Option<Arc<AsyncMutex<CommandChannel>>>,
        tuning: ChannelTuning,
        max_exposure_s: f64,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            channel: Arc::new(AsyncMutex::new(channel)),
            status_channel,
            tuning,
            max_exposure_s,
            clock,
            status: Arc::new(Mutex::new(CameraStatus::new())),
            in_flight: false,
        }
    }

    pub fn status(&self) -> CameraStatus {
        match self.status.lock() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    pub fn is_busy(&self) -> bool {
        self.in_flight
    }

    /// Launch one exposure for `field`.
    ///
    /// Returns immediately with a handle; the actual command round trip and
    /// its bounded retries run on a worker task.
    pub fn start_exposure(&mut self, field: &Field) -> Result<ExposureHandle, CameraError> {
        if self.in_flight {
            return Err(CameraError::Busy);
        }
        if self.status().health == CameraHealth::Unknown {
            return Err(CameraError::NeedsClear);
        }
        let exposure_s = field.spec.exposure_s;
        if exposure_s > self.max_exposure_s {
            return Err(CameraError::ExposureTooLong {
                requested_s: exposure_s,
                max_s: self.max_exposure_s,
            });
        }

        let jd = self.clock.now_jd();
        let name = output_name(jd, field.spec.shutter)?;
        let command = protocol::expose_command(field.spec.shutter.is_on_sky(), exposure_s, &name)?;
        let deadline = self.tuning.exposure_deadline(exposure_s);

        let skeleton = ExposureResult {
            name,
            field_index: field.index,
            jd_start: jd,
            ut_start_hours: ut_hours(jd),
            actual_exposure_s: 0.0,
            attempts: 0,
            failure: None,
        };

        let (accepted_tx, accepted) = oneshot::channel();
        let (completed_tx, completed) = oneshot::channel();

        self.in_flight = true;
        self.with_status(|s| {
            s.health = CameraHealth::Exposing;
            s.exposures_started += 1;
        });

        let worker = ExposureWorker {
            channel: Arc::clone(&self.channel),
            status: Arc::clone(&self.status),
            command: command.to_string(),
            deadline,
            max_retries: self.tuning.max_retries,
            skeleton: skeleton.clone(),
        };
        tokio::spawn(worker.run(accepted_tx, completed_tx));

        debug!(field = field.index, name = %name, exposure_s, "exposure started");
        Ok(ExposureHandle {
            name,
            field_index: field.index,
            accepted,
            completed,
            skeleton,
        })
    }

    /// Wait for the handshake to complete, polling the status channel when
    /// one is configured.
    ///
    /// On timeout the controller state is unknown: the handle is consumed,
    /// the camera stays busy, and a [`clear`](Self::clear) is required
    /// before the next exposure.
    pub async fn wait_completion(
        &mut self,
        handle: ExposureHandle,
        wait_timeout: Duration,
        shutdown: &mut watch::Receiver<bool>,
    ) -> ExposureResult {
        let deadline = Instant::now() + wait_timeout;
        let ExposureHandle {
            accepted,
            mut completed,
            skeleton,
            ..
        } = handle;

        // Stage one: the worker owns the command.
        match timeout_at(deadline, accepted).await {
            Ok(Ok(())) => {}
            Ok(Err(_)) => {
                self.settle(CameraHealth::Error);
                return skeleton.failed(ExposureFailure::Transport);
            }
            Err(_) => {
                self.with_status(|s| s.health = CameraHealth::Unknown);
                return skeleton.failed(ExposureFailure::Timeout);
            }
        }

        // Stage two: verified completion.
        let poll_enabled = self.status_channel.is_some();
        let mut poll = interval(self.tuning.status_poll_interval());
        loop {
            tokio::select! {
                outcome = &mut completed => {
                    return match outcome {
                        Ok(result) => {
                            self.settle(match result.failure {
                                None => CameraHealth::Idle,
                                Some(ExposureFailure::Timeout) => CameraHealth::Unknown,
                                Some(_) => CameraHealth::Error,
                            });
                            result
                        }
                        Err(_) => {
                            self.settle(CameraHealth::Error);
                            skeleton.failed(ExposureFailure::Transport)
                        }
                    };
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!(field = skeleton.field_index, "wait abandoned by shutdown");
                        return skeleton.failed(ExposureFailure::Cancelled);
                    }
                }
                _ = poll.tick(), if poll_enabled => {
                    self.poll_status().await;
                }
                _ = sleep_until(deadline) => {
                    warn!(field = skeleton.field_index, "completion wait timed out");
                    self.with_status(|s| s.health = CameraHealth::Unknown);
                    return skeleton.failed(ExposureFailure::Timeout);
                }
            }
        }
    }

    /// Reconcile the controller: discard any stale in-flight handle and
    /// return the camera to a known idle state.
    pub async fn clear(&mut self) -> Result<(), CameraError> {
        self.in_flight = false;
        let command = protocol::clear_command(self.tuning.clear_time_s)?;
        let outcome = {
            let mut channel = self.channel.lock().await;
            channel
                .round_trip(&command, self.tuning.clear_deadline())
                .await
        };
        match outcome {
            Ok(_) => {
                self.with_status(|s| s.health = CameraHealth::Idle);
                info!("camera cleared");
                Ok(())
            }
            Err(e) => {
                self.with_status(|s| s.health = CameraHealth::Unknown);
                Err(e.into())
            }
        }
    }

    /// One status-channel poll. Parse failures keep the previous snapshot.
    async fn poll_status(&self) {
        let Some(status_channel) = &self.status_channel else {
            return;
        };
        let reply = {
            let mut channel = status_channel.lock().await;
            channel
                .round_trip(protocol::STATUS_COMMAND, self.tuning.short_deadline())
                .await
        };
        let parsed = reply
            .map_err(CameraError::from)
            .and_then(|payload| protocol::parse_status_payload(&payload).map_err(CameraError::from));
        match parsed {
            Ok(controller) => self.with_status(|s| s.controller = Some(controller)),
            Err(e) => warn!(error = %e, "status poll failed, keeping last snapshot"),
        }
    }

    fn settle(&mut self, health: CameraHealth) {
        self.in_flight = false;
        self.with_status(|s| s.health = health);
    }

    fn with_status(&self, update: impl FnOnce(&mut CameraStatus)) {
        let mut guard = match self.status.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        update(&mut guard);
    }
}

struct ExposureWorker {
    channel: Arc<AsyncMutex<CommandChannel>>,
    status: Arc<Mutex<CameraStatus>>,
    command: String,
    deadline: Duration,
    max_retries: u32,
    skeleton: ExposureResult,
}

impl ExposureWorker {
    async fn run(self, accepted_tx: oneshot::Sender<()>, completed_tx: oneshot::Sender<ExposureResult>) {
        // The command now belongs to the transport.
        let _ = accepted_tx.send(());

        let mut result = self.skeleton.clone();
        let mut last_failure = ExposureFailure::Transport;

        for attempt in 0..=self.max_retries {
            result.attempts = attempt + 1;
            let outcome = {
                let mut channel = self.channel.lock().await;
                channel.round_trip(&self.command, self.deadline).await
            };

            match outcome {
                Ok(payload) => match protocol::parse_exposure_payload(&payload) {
                    Ok(actual_s) => {
                        result.actual_exposure_s = actual_s;
                        result.failure = None;
                        if let Ok(mut s) = self.status.lock() {
                            s.exposures_completed += 1;
                        }
                        let _ = completed_tx.send(result);
                        return;
                    }
                    Err(e) => {
                        // An unverifiable reply is never credited.
                        warn!(attempt, error = %e, "exposure reply unusable");
                        last_failure = ExposureFailure::Rejected;
                    }
                },
                Err(ChannelError::CommandTimeout(_)) => {
                    warn!(attempt, command = %self.command, "exposure command timed out");
                    last_failure = ExposureFailure::Timeout;
                }
                Err(ChannelError::Protocol(ProtocolError::ErrorReply(reply))) => {
                    warn!(attempt, reply = %reply, "controller rejected exposure");
                    last_failure = ExposureFailure::Rejected;
                }
                Err(e) => {
                    warn!(attempt, error = %e, "exposure transport failure");
                    last_failure = ExposureFailure::Transport;
                }
            }

            if attempt < self.max_retries {
                if let Ok(mut s) = self.status.lock() {
                    s.command_retries += 1;
                }
            }
        }

        let _ = completed_tx.send(result.failed(last_failure));
    }
}

/// Output identifier: UTC timestamp of the start plus the shutter code.
pub fn output_name(jd: f64, shutter: ShutterKind) -> Result<OutputName, ProtocolError> {
    let (year, month, day, hour, minute, second) = calendar_from_jd(jd);
    let mut name = OutputName::new();
    write!(
        name,
        "{year:04}{month:02}{day:02}{hour:02}{minute:02}{second:02}{}",
        shutter.code()
    )
    .map_err(|_| ProtocolError::CommandTooLarge)?;
    Ok(name)
}
