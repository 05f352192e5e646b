//! mvirt-dshell: per-job master that runs a shell command in a set of
//! cluster containers.
//!
//! The master registers with the resource manager, asks for one container per
//! slot of the job, launches the command in every granted container through
//! the node agents and re-requests containers the framework takes away. It
//! finishes with a single verdict for the whole job.

pub mod clients;
pub mod config;
pub mod context;
pub mod controller;
pub mod counters;
pub mod credentials;
pub mod error;
pub mod launcher;
pub mod listener;
pub mod manifest;
pub mod negotiator;
pub mod records;
pub mod registry;
pub mod timeline;

pub use controller::{Controller, ControllerOptions, JobOutcome};
pub use error::{MasterError, Result};
