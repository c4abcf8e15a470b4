//! Application state shared across request handlers.

use std::sync::Arc;
use std::time::Duration;

use crate::control::ControlPlane;

/// Shared application state.
///
/// This is passed to all request handlers via Axum's state extractor.
#[derive(Clone)]
pub struct AppState {
    inner: Arc<AppStateInner>,
}

struct AppStateInner {
    control: ControlPlane,
    max_wait: Duration,
}

impl AppState {
    /// Create a new application state.
    pub fn new(control: ControlPlane, max_wait: Duration) -> Self {
        Self {
            inner: Arc::new(AppStateInner { control, max_wait }),
        }
    }

    pub fn control(&self) -> &ControlPlane {
        &self.inner.control
    }

    /// Longest server-side job wait a client may request.
    pub fn max_wait(&self) -> Duration {
        self.inner.max_wait
    }
}
