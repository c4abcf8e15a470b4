//! Error handling and display for the CLI.

use colored::Colorize;
use jobplane_jobs::PollError;
use thiserror::Error;

/// CLI-specific errors.
#[derive(Debug, Error)]
pub enum CliError {
    #[error("API error: {message}")]
    Api {
        status: u16,
        code: String,
        message: String,
        request_id: Option<String>,
        job_id: Option<String>,
    },

    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("Unexpected response: {0}")]
    Protocol(String),
}

impl CliError {
    /// Create an API error from response details.
    pub fn api(
        status: u16,
        code: impl Into<String>,
        message: impl Into<String>,
        request_id: Option<String>,
        job_id: Option<String>,
    ) -> Self {
        Self::Api {
            status,
            code: code.into(),
            message: message.into(),
            request_id,
            job_id,
        }
    }

    pub fn status(&self) -> Option<u16> {
        match self {
            Self::Api { status, .. } => Some(*status),
            _ => None,
        }
    }
}

/// Print an error in a user-friendly format.
pub fn print_error(err: &anyhow::Error) {
    eprintln!("{} {}", "Error:".red().bold(), err);

    if let Some(PollError::Timeout { job_id, .. }) = err.downcast_ref::<PollError<CliError>>() {
        eprintln!(
            "\n{}",
            format!("Hint: the job keeps running; resume with `jobctl jobs wait {job_id}`.").yellow()
        );
        return;
    }

    let Some(cli_err) = err.downcast_ref::<CliError>() else {
        return;
    };
    match cli_err {
        CliError::Api {
            status: 409,
            job_id: Some(job_id),
            ..
        } => {
            eprintln!(
                "\n{}",
                format!("Hint: wait for the pending job with `jobctl jobs wait {job_id}`.").yellow()
            );
        }
        CliError::Api {
            status: 504,
            job_id: Some(job_id),
            ..
        } => {
            eprintln!(
                "\n{}",
                format!("Hint: the job is still running; check later with `jobctl jobs get {job_id}`.")
                    .yellow()
            );
        }
        CliError::Api {
            request_id: Some(request_id),
            ..
        } => {
            eprintln!("\nRequest ID: {}", request_id);
        }
        CliError::Network(_) => {
            eprintln!(
                "\n{}",
                "Hint: Check that the control plane is running and --api-url is correct.".yellow()
            );
        }
        _ => {}
    }
}
