//! Transaction and assertion helpers shared by fixtures, verifiers, and
//! test bodies.
//!
//! Assertions here log with the fixed `FAILED ASSERTION` marker before
//! surfacing, so log lines correlate with capture files during triage.

use std::fmt::Debug;
use std::time::Duration;

use tracing::error;

use flowtest_proto::{FlowSpec, MessageBody};
use flowtest_session::ControlSession;

use crate::error::{HarnessError, FAILED_ASSERTION_MARKER};

/// Log an assertion failure with the fixed marker and build the error.
pub fn fail(msg: impl Into<String>) -> HarnessError {
    let msg = msg.into();
    error!("{FAILED_ASSERTION_MARKER}: {msg}");
    HarnessError::Assertion(msg)
}

/// Require `cond`, failing the test with `msg` otherwise.
pub fn check(cond: bool, msg: impl Into<String>) -> Result<(), HarnessError> {
    if cond {
        Ok(())
    } else {
        Err(fail(msg))
    }
}

/// Require equality, reporting both operands on failure.
pub fn check_eq<T: PartialEq + Debug>(got: T, want: T, what: &str) -> Result<(), HarnessError> {
    if got == want {
        Ok(())
    } else {
        Err(fail(format!("{what}: got {got:?}, expected {want:?}")))
    }
}

/// Issue a barrier: a fence guaranteeing the DUT has applied all preceding
/// control operations before any subsequent request is interpreted.
pub fn do_barrier(session: &ControlSession, timeout: Duration) -> Result<(), HarnessError> {
    let reply = session.transact(MessageBody::BarrierRequest, timeout);
    let (msg, _raw) = match reply {
        Some(pair) => pair,
        None => return Err(fail("no response to barrier request")),
    };
    check(
        matches!(msg.body, MessageBody::BarrierReply),
        format!("unexpected reply to barrier request: {:?}", msg.body),
    )
}

/// Remove every rule currently installed on the DUT.
pub fn delete_all_flows(session: &ControlSession) -> Result<(), HarnessError> {
    session
        .send(MessageBody::FlowDeleteAll)
        .map(|_| ())
        .map_err(|e| fail(format!("failed to delete all flows: {e}")))
}

/// Install one forwarding rule.
pub fn install_flow(session: &ControlSession, spec: &FlowSpec) -> Result<(), HarnessError> {
    session
        .send(MessageBody::FlowInstall(spec.clone()))
        .map(|_| ())
        .map_err(|e| fail(format!("error installing flow: {e}")))
}

/// Fresh flow cookie. Drawn from `[0, 2^53)`, wide enough that reuse
/// within one test is not a practical concern.
pub fn random_cookie() -> u64 {
    use rand::RngExt;
    rand::rng().random_range(0..(1u64 << 53))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn check_passes_and_fails() {
        assert!(check(true, "fine").is_ok());
        let err = check(false, "broken").unwrap_err();
        assert!(err.is_assertion());
        assert!(err.to_string().contains("broken"));
    }

    #[test]
    fn check_eq_reports_operands() {
        let err = check_eq(3usize, 1usize, "record count").unwrap_err();
        let text = err.to_string();
        assert!(text.contains("got 3"));
        assert!(text.contains("expected 1"));
    }

    #[test]
    fn cookies_are_in_range_and_vary() {
        let a = random_cookie();
        let b = random_cookie();
        assert!(a < (1u64 << 53));
        assert!(b < (1u64 << 53));
        // Collisions in a 2^53 space across two draws would indicate a
        // broken generator.
        assert_ne!(a, b);
    }
}
