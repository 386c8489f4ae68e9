//! Failure taxonomy.
//!
//! Three error kinds cover every way a test can fail:
//!
//! - [`Setup`](HarnessError::Setup) — handshake/connect/transport error
//!   while a fixture is being established; partially created sessions are
//!   force-terminated before this propagates.
//! - [`Assertion`](HarnessError::Assertion) — an expected condition was
//!   false during the test body.
//! - [`Teardown`](HarnessError::Teardown) — resource release failed; never
//!   allowed to displace a body failure.
//!
//! Timeouts are not errors: `transact` and `poll` report them as absent
//! results, and only the caller's explicit check turns absence into an
//! [`Assertion`](HarnessError::Assertion).

use thiserror::Error;

/// Fixed marker prefixed to every logged failure, for correlating test logs
/// with capture files.
pub const FAILED_ASSERTION_MARKER: &str = "FAILED ASSERTION";

#[derive(Debug, Error)]
pub enum HarnessError {
    #[error("setup failure: {0}")]
    Setup(String),
    #[error("assertion failure: {0}")]
    Assertion(String),
    #[error("teardown failure: {0}")]
    Teardown(String),
}

impl HarnessError {
    pub fn is_setup(&self) -> bool {
        matches!(self, HarnessError::Setup(_))
    }

    pub fn is_assertion(&self) -> bool {
        matches!(self, HarnessError::Assertion(_))
    }
}

/// Log a setup failure with the fixed marker and build the error.
pub(crate) fn setup_fail(msg: impl Into<String>) -> HarnessError {
    let msg = msg.into();
    tracing::error!("{FAILED_ASSERTION_MARKER}: {msg}");
    HarnessError::Setup(msg)
}
