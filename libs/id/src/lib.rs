//! # jobplane-id
//!
//! Stable ID types, parsing, and validation for jobplane.
//!
//! All resource IDs use a prefixed format: `{prefix}_{ulid}`
//!
//! Examples:
//! - `job_01HV4Z2WQXKJNM8GPQY6VBKC3D`
//! - `fwr_01HV4Z3MXNKPQR9HSTZ7WCLD4E`
//! - `vm_01HV4Z4NYPLTRS0JTUA8XDME5F`
//!
//! The prefix makes IDs self-describing in logs and API payloads, and the
//! ULID portion keeps them sortable by creation time.

mod error;
mod macros;
mod types;

pub use error::IdError;
pub use types::*;

/// Re-export ulid for consumers that need raw ULID operations
pub use ulid::Ulid;
