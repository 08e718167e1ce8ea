//! Fault and event reporting.
//!
//! The relay never logs on its own; it hands leveled messages to a
//! [`Reporter`].  A router starts out with [`NoopReporter`], and the
//! daemon plugs in [`LogReporter`] so messages reach `env_logger`.

use log::{debug, error, info};

/// Sink for leveled relay events.  Every method defaults to a no-op.
pub trait Reporter: Send + Sync {
    fn debug(&self, _target: &str, _msg: &str) {}
    fn info(&self, _target: &str, _msg: &str) {}
    fn error(&self, _target: &str, _msg: &str) {}
    fn critical(&self, _target: &str, _msg: &str) {}
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NoopReporter;

impl Reporter for NoopReporter {}

/// Forwards events to the `log` facade.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogReporter;

impl Reporter for LogReporter {
    fn debug(&self, target: &str, msg: &str) {
        debug!("[{}] {}", target, msg);
    }

    fn info(&self, target: &str, msg: &str) {
        info!("[{}] {}", target, msg);
    }

    fn error(&self, target: &str, msg: &str) {
        error!("[{}] {}", target, msg);
    }

    // `log` has no level above error.
    fn critical(&self, target: &str, msg: &str) {
        error!("[{}] CRITICAL: {}", target, msg);
    }
}
