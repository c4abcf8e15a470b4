//! Job model and polling protocol.
//!
//! Every mutating request accepted by the control plane becomes a [`Job`].
//! A job moves forward only:
//!
//! ```text
//! queued -> running -> succeeded
//!                   \-> failed
//! ```
//!
//! Clients learn when a request has actually taken effect by polling the job
//! with [`wait_for_job`], which works against any [`JobSource`] (the
//! in-process job store, or the HTTP API).

mod model;
mod poll;

pub use model::{
    Job, JobAction, JobFilter, JobStatus, JobTarget, JobTask, ParseEnumError, TransitionError,
};
pub use poll::{wait_for_job, JobSource, PollConfig, PollError, MIN_POLL_INTERVAL};
