//! # Observation Sequencer
//!
//! A nightly observation sequencing library for automated survey telescopes:
//! field classification and selection, camera command/control over TCP, and
//! crash-safe progress records so an interrupted night resumes where it left off.
//!
//! ## Features
//!
//! - **Cycle-based scheduling**: per-cycle field classification (not doable,
//!   too late, ready, do now) and deterministic selection
//! - **Camera control**: line-framed text protocol with a `DONE` reply
//!   sentinel, per-command deadlines, and bounded retries
//! - **Exposure handshake**: one in-flight exposure, two rendezvous signals
//!   (command accepted, exposure complete)
//! - **Resumable nights**: versioned observation records with atomic
//!   replace-on-save and run-identity validation
//! - **Pluggable ephemeris**: sky geometry behind a trait, with an analytic
//!   reference implementation
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use nightseq::config::SchedulerConfig;
//! use nightseq::field::FieldSpec;
//! use nightseq::registry::FieldRegistry;
//!
//! let config = SchedulerConfig::default();
//! let specs: Vec<FieldSpec> = Vec::new();
//! let registry = FieldRegistry::from_specs(specs, &config).unwrap();
//! assert!(registry.is_empty());
//! ```
//!
//! ## Architecture
//!
//! - [`scheduler`] - night orchestrator: classification, selection, execution
//! - [`camera`] - exposure lifecycle and the in-flight handshake
//! - [`channel`] - persistent command connection with deadlines and pacing
//! - [`protocol`] - wire-level command framing and reply parsing
//! - [`registry`] - authoritative field set and progress bookkeeping
//! - [`record`] - persisted observation record with atomic replace
//! - [`ephemeris`] - sky geometry seam and analytic reference implementation

#![deny(clippy::all)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::cast_sign_loss)]

pub mod camera;
pub mod channel;
pub mod config;
pub mod ephemeris;
pub mod field;
pub mod protocol;
pub mod record;
pub mod registry;
pub mod scheduler;

// Re-export main public types for convenience
pub use camera::{CameraController, CameraError, ExposureResult};
pub use config::{SchedulerConfig, Site};
pub use field::{Field, FieldSpec, FieldState, ShutterKind};
pub use registry::FieldRegistry;
pub use scheduler::SchedulerCore;
