//! # Fixture lifecycle state machine
//!
//! A fixture owns zero-or-one control session and zero-or-one data session
//! for the duration of one test. The state machine is:
//!
//! ```text
//!   Created ──set_up──▶ SettingUp ──▶ Ready ──tear_down──▶ TornDown
//!                           │
//!                        (error)──▶ Failed
//! ```
//!
//! Variants are capability combinations over the same machine, selected by
//! [`FixtureBuilder`]:
//!
//! - `{ControlPlane}` — connect, enable keep-alive, features handshake
//! - `{ControlPlane, DataPlane}` — the above plus data session, flush, and
//!   optional capture-to-file
//! - `{DataPlane}` — data session only, no control handshake
//! - `{MultiSession}` — sessions created on demand with the initial
//!   greeting suppressed, so the test body controls handshake timing
//! - `{ControlPlane, Secure}` — authenticated/encrypted connect before the
//!   identical handshake
//!
//! Setup is scoped acquisition: any error force-terminates whatever was
//! partially created before it propagates, so no session is ever left
//! dangling. A fixture created via [`inherit_setup`](Fixture::inherit_setup)
//! holds non-owning references to its parent's sessions; only the owner's
//! teardown releases them.

use std::sync::Arc;

use tracing::info;

use flowtest_proto::message::VERSION_WITH_ACTION_BITMASK;
use flowtest_proto::MessageBody;
use flowtest_session::{ControlSession, DataSession};

use crate::config::TestContext;
use crate::error::{setup_fail, HarnessError};

// ─── Capabilities ───────────────────────────────────────────────────────────

/// What a fixture variant declares it needs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Capability {
    ControlPlane,
    DataPlane,
    Secure,
    MultiSession,
}

impl Capability {
    const fn bit(self) -> u8 {
        match self {
            Capability::ControlPlane => 1 << 0,
            Capability::DataPlane => 1 << 1,
            Capability::Secure => 1 << 2,
            Capability::MultiSession => 1 << 3,
        }
    }
}

/// A small set of [`Capability`] values.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CapabilitySet {
    bits: u8,
}

impl CapabilitySet {
    pub fn with(mut self, cap: Capability) -> Self {
        self.bits |= cap.bit();
        self
    }

    pub fn contains(&self, cap: Capability) -> bool {
        self.bits & cap.bit() != 0
    }
}

// ─── State ──────────────────────────────────────────────────────────────────

/// Fixture lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FixtureState {
    /// Built, setup not yet attempted.
    Created,
    /// Setup in progress.
    SettingUp,
    /// Sessions established; test body may run.
    Ready,
    /// Setup aborted; partially created sessions were force-terminated.
    Failed,
    /// Resources released.
    TornDown,
}

/// Owned vs borrowed session reference. Only the owner releases the
/// underlying session.
struct SessionHandle<T> {
    session: Arc<T>,
    owned: bool,
}

impl<T> SessionHandle<T> {
    fn owned(session: Arc<T>) -> Self {
        SessionHandle {
            session,
            owned: true,
        }
    }

    fn borrowed(session: Arc<T>) -> Self {
        SessionHandle {
            session,
            owned: false,
        }
    }
}

// ─── Builder ────────────────────────────────────────────────────────────────

/// Selects which capabilities a fixture acquires during setup.
#[derive(Debug, Clone, Copy)]
pub struct FixtureBuilder {
    caps: CapabilitySet,
    clean_shutdown: bool,
}

impl FixtureBuilder {
    pub fn new() -> Self {
        FixtureBuilder {
            caps: CapabilitySet::default(),
            clean_shutdown: true,
        }
    }

    /// Acquire a control session and perform the features handshake.
    pub fn control_plane(mut self) -> Self {
        self.caps = self.caps.with(Capability::ControlPlane);
        self
    }

    /// Acquire a data session, flush it, and start capture if configured.
    pub fn data_plane(mut self) -> Self {
        self.caps = self.caps.with(Capability::DataPlane);
        self
    }

    /// Establish the control session over an authenticated/encrypted
    /// transport. Implies the control plane.
    pub fn secure(mut self) -> Self {
        self.caps = self.caps.with(Capability::Secure).with(Capability::ControlPlane);
        self
    }

    /// Handshake-controlled variant: control sessions are created on demand
    /// via [`Fixture::add_control_session`] with the initial greeting
    /// suppressed, and tracked in creation order for teardown.
    pub fn multi_session(mut self) -> Self {
        self.caps = self.caps.with(Capability::MultiSession);
        self
    }

    /// Whether teardown waits for graceful shutdown (`true`, default) or
    /// force-terminates sessions expected to be in a broken state.
    pub fn clean_shutdown(mut self, clean: bool) -> Self {
        self.clean_shutdown = clean;
        self
    }

    pub fn build(self, test_id: impl Into<String>) -> Fixture {
        Fixture {
            test_id: test_id.into(),
            caps: self.caps,
            state: FixtureState::Created,
            control: None,
            data: None,
            sessions: Vec::new(),
            clean_shutdown: self.clean_shutdown,
            version: None,
            supported_actions: None,
            capture_started: false,
        }
    }
}

impl Default for FixtureBuilder {
    fn default() -> Self {
        Self::new()
    }
}

// ─── Fixture ────────────────────────────────────────────────────────────────

/// One test's control/data-plane sessions plus the state machine that
/// establishes, shares, and releases them.
pub struct Fixture {
    test_id: String,
    caps: CapabilitySet,
    state: FixtureState,
    control: Option<SessionHandle<ControlSession>>,
    data: Option<SessionHandle<DataSession>>,
    /// Sessions of the multi-session variant, in creation order.
    sessions: Vec<Arc<ControlSession>>,
    clean_shutdown: bool,
    version: Option<u8>,
    supported_actions: Option<u32>,
    capture_started: bool,
}

impl Fixture {
    pub fn builder() -> FixtureBuilder {
        FixtureBuilder::new()
    }

    /// Establish every session the declared capability set requires.
    /// On error, every partially created session has been force-terminated
    /// before this returns.
    pub fn set_up(&mut self, ctx: &TestContext) -> Result<(), HarnessError> {
        info!(test = %self.test_id, "** START TEST CASE");
        self.state = FixtureState::SettingUp;
        match self.acquire_all(ctx) {
            Ok(()) => {
                self.state = FixtureState::Ready;
                Ok(())
            }
            Err(e) => {
                self.force_release();
                self.state = FixtureState::Failed;
                Err(e)
            }
        }
    }

    fn acquire_all(&mut self, ctx: &TestContext) -> Result<(), HarnessError> {
        if self.caps.contains(Capability::MultiSession) {
            // Sessions are created on demand by the test body.
            return Ok(());
        }
        if self.caps.contains(Capability::ControlPlane) {
            self.acquire_control(ctx)?;
        }
        if self.caps.contains(Capability::DataPlane) {
            self.acquire_data(ctx)?;
        }
        Ok(())
    }

    fn acquire_control(&mut self, ctx: &TestContext) -> Result<(), HarnessError> {
        let transport = ctx
            .factory()
            .control_transport()
            .map_err(|e| setup_fail(format!("could not acquire control transport: {e}")))?;
        let session = Arc::new(ControlSession::new(transport));
        session.start();
        // Registered before the handshake so a failure path releases it.
        self.control = Some(SessionHandle::owned(Arc::clone(&session)));

        if self.caps.contains(Capability::Secure) {
            let tls = ctx.config.tls_material().ok_or_else(|| {
                setup_fail("secure variant requires tls_key, tls_cert, and tls_trust_anchors")
            })?;
            session
                .secure_connect(&tls, ctx.config.handshake_timeout)
                .map_err(|e| setup_fail(format!("secure connect failed: {e}")))?;
        } else {
            session
                .connect(ctx.config.handshake_timeout)
                .map_err(|e| setup_fail(format!("connect failed: {e}")))?;
        }

        // Respond to echo probes from here on.
        session.set_keep_alive(true);

        if !session.active() {
            return Err(setup_fail("control session startup failed"));
        }
        let peer = session
            .peer_addr()
            .ok_or_else(|| setup_fail("control session startup failed (no peer address)"))?;
        info!(peer = %peer, "connected");

        let reply = session.transact(MessageBody::FeaturesRequest, ctx.config.handshake_timeout);
        let (msg, _raw) = reply
            .ok_or_else(|| setup_fail("did not complete features transaction for handshake"))?;
        match msg.body {
            MessageBody::FeaturesReply(features) => {
                self.version = Some(features.version);
                if features.version == VERSION_WITH_ACTION_BITMASK {
                    self.supported_actions = Some(features.actions);
                    info!(actions = format_args!("{:#x}", features.actions), "supported actions");
                }
                Ok(())
            }
            other => Err(setup_fail(format!("unexpected handshake reply: {other:?}"))),
        }
    }

    fn acquire_data(&mut self, ctx: &TestContext) -> Result<(), HarnessError> {
        let link = ctx
            .factory()
            .data_link()
            .map_err(|e| setup_fail(format!("could not acquire data link: {e}")))?;
        let session = Arc::new(DataSession::new(link));
        session.start();
        self.data = Some(SessionHandle::owned(Arc::clone(&session)));

        session.flush();
        if let Some(dir) = &ctx.config.capture_directory {
            let path = dir.join(format!("{}.pcap", self.test_id));
            session
                .start_capture(&path)
                .map_err(|e| setup_fail(format!("could not start capture: {e}")))?;
            self.capture_started = true;
        }
        Ok(())
    }

    /// Create one more control session with the initial greeting suppressed,
    /// so the test body fully controls handshake timing. Multi-session
    /// variant only; sessions are tracked in creation order for teardown.
    pub fn add_control_session(
        &mut self,
        ctx: &TestContext,
    ) -> Result<Arc<ControlSession>, HarnessError> {
        if !self.caps.contains(Capability::MultiSession) {
            return Err(setup_fail(
                "add_control_session requires the multi-session capability",
            ));
        }
        let transport = ctx
            .factory()
            .control_transport()
            .map_err(|e| setup_fail(format!("could not acquire control transport: {e}")))?;
        let session = Arc::new(ControlSession::new(transport));
        session.set_initial_greeting(false);
        session.start();
        if let Err(e) = session.connect(ctx.config.default_timeout) {
            session.kill();
            return Err(setup_fail(format!("connect failed: {e}")));
        }
        self.sessions.push(Arc::clone(&session));
        Ok(session)
    }

    /// Adopt a parent fixture's already-Ready sessions and handshake-derived
    /// state instead of performing setup. The adopted handles are
    /// non-owning: this fixture's teardown will not release them, and no
    /// second handshake occurs.
    pub fn inherit_setup(&mut self, parent: &Fixture) -> Result<(), HarnessError> {
        if parent.state != FixtureState::Ready {
            return Err(setup_fail("cannot inherit setup from a fixture that is not ready"));
        }
        info!(child = %self.test_id, parent = %parent.test_id, "inheriting setup from parent");
        if self.caps.contains(Capability::ControlPlane) {
            let handle = parent
                .control
                .as_ref()
                .ok_or_else(|| setup_fail("parent fixture has no control session to inherit"))?;
            self.control = Some(SessionHandle::borrowed(Arc::clone(&handle.session)));
            self.version = parent.version;
            self.supported_actions = parent.supported_actions;
        }
        if self.caps.contains(Capability::DataPlane) {
            let handle = parent
                .data
                .as_ref()
                .ok_or_else(|| setup_fail("parent fixture has no data session to inherit"))?;
            self.data = Some(SessionHandle::borrowed(Arc::clone(&handle.session)));
        }
        self.state = FixtureState::Ready;
        Ok(())
    }

    /// Release owned resources in reverse acquisition order. Borrowed
    /// (inherited) sessions are left untouched. Safe after a failed or
    /// partial setup, and idempotent.
    pub fn tear_down(&mut self) -> Result<(), HarnessError> {
        if self.state == FixtureState::TornDown {
            return Ok(());
        }
        let mut first_err: Option<String> = None;

        if let Some(handle) = self.data.take() {
            if handle.owned {
                if self.capture_started {
                    if let Err(e) = handle.session.stop_capture() {
                        tracing::error!(error = %e, "failed to stop capture");
                        first_err.get_or_insert(format!("failed to stop capture: {e}"));
                    }
                    self.capture_started = false;
                }
                handle.session.shutdown();
                handle.session.join();
            }
        }

        for session in self.sessions.drain(..) {
            session.shutdown();
            if self.clean_shutdown {
                session.join();
            } else {
                session.kill();
            }
        }

        if let Some(handle) = self.control.take() {
            if handle.owned {
                handle.session.shutdown();
                handle.session.join();
            }
        }

        self.state = FixtureState::TornDown;
        info!(test = %self.test_id, "** END TEST CASE");
        match first_err {
            None => Ok(()),
            Some(msg) => Err(HarnessError::Teardown(msg)),
        }
    }

    /// Hard-terminate everything this fixture owns. Used on the setup error
    /// path so no session is left dangling.
    fn force_release(&mut self) {
        if let Some(handle) = self.control.take() {
            if handle.owned {
                handle.session.kill();
            }
        }
        if let Some(handle) = self.data.take() {
            if handle.owned {
                handle.session.kill();
            }
        }
        for session in self.sessions.drain(..) {
            session.kill();
        }
        self.capture_started = false;
    }

    // ─── Accessors ──────────────────────────────────────────────────────

    pub fn state(&self) -> FixtureState {
        self.state
    }

    pub fn test_id(&self) -> &str {
        &self.test_id
    }

    pub fn control(&self) -> Option<&ControlSession> {
        self.control.as_ref().map(|h| h.session.as_ref())
    }

    pub fn data(&self) -> Option<&DataSession> {
        self.data.as_ref().map(|h| h.session.as_ref())
    }

    /// Sessions of the multi-session variant, in creation order.
    pub fn sessions(&self) -> &[Arc<ControlSession>] {
        &self.sessions
    }

    /// Whether this fixture owns (and will release) its control session.
    pub fn owns_control(&self) -> bool {
        self.control.as_ref().map(|h| h.owned).unwrap_or(false)
    }

    pub fn negotiated_version(&self) -> Option<u8> {
        self.version
    }

    /// Supported-action bitmask recorded during the handshake, when the
    /// negotiated version reports one.
    pub fn supported_actions(&self) -> Option<u32> {
        self.supported_actions
    }
}

/// Run `body` against a fixture with the full lifecycle: setup, body,
/// teardown-always. A teardown failure is logged but never displaces a
/// body failure.
pub fn run_test<F>(ctx: &TestContext, fixture: &mut Fixture, body: F) -> Result<(), HarnessError>
where
    F: FnOnce(&mut Fixture, &TestContext) -> Result<(), HarnessError>,
{
    if let Err(e) = fixture.set_up(ctx) {
        let _ = fixture.tear_down();
        return Err(e);
    }
    let body_result = body(fixture, ctx);
    let teardown_result = fixture.tear_down();
    match (body_result, teardown_result) {
        (Err(body_err), td) => {
            if let Err(td_err) = td {
                tracing::error!(error = %td_err, "teardown also failed after test-body failure");
            }
            Err(body_err)
        }
        (Ok(()), Err(td_err)) => Err(td_err),
        (Ok(()), Ok(())) => Ok(()),
    }
}
