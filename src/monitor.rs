//! Per-session orchestration.
//!
//! The host drives the monitor from its event loop: signals arrive through
//! the [`EventSource`] handlers, and [`ProctoringMonitor::tick`] runs once
//! per loop turn to apply server verdicts, fire the scheduled fullscreen
//! request, and drop subscriptions once the session is blocked.

use serde_json::{Map, Value};
use std::cell::RefCell;
use std::rc::Rc;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::audit::{AuditReport, AuditReporter, AuditTransport};
use crate::fullscreen::{FireOutcome, FullscreenControl, FullscreenEnforcer};
use crate::ledger::{Counter, LedgerSnapshot, SealStatus, ViolationLedger};
use crate::policy::BlockingPolicy;
use crate::source::EventSource;
use crate::storage::KeyValueStore;
use crate::watcher::EventWatcher;
use crate::{AuditEventType, BlockReason, MonitorState, ProctoringSettings, SessionId};

pub const DEFAULT_FULLSCREEN_INITIAL_DELAY: Duration = Duration::from_millis(500);
pub const DEFAULT_FULLSCREEN_RETRY_DELAY: Duration = Duration::from_millis(1000);

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MonitorOptions {
    pub fullscreen_initial_delay: Duration,
    pub fullscreen_retry_delay: Duration,
    /// Remove persisted counters as soon as the session is blocked.
    pub clear_storage_on_block: bool,
}

impl Default for MonitorOptions {
    fn default() -> Self {
        Self {
            fullscreen_initial_delay: DEFAULT_FULLSCREEN_INITIAL_DELAY,
            fullscreen_retry_delay: DEFAULT_FULLSCREEN_RETRY_DELAY,
            clear_storage_on_block: false,
        }
    }
}

/// Platform capabilities handed to a monitor.
pub struct MonitorDeps {
    pub store: Box<dyn KeyValueStore>,
    pub source: Box<dyn EventSource>,
    pub fullscreen: Box<dyn FullscreenControl>,
    /// `None` disables remote reporting; the local ledger still works.
    pub audit: Option<Arc<dyn AuditTransport>>,
}

/// Session state shared by the monitor and every signal handler.
pub(crate) struct SessionCore {
    pub(crate) session: SessionId,
    pub(crate) settings: ProctoringSettings,
    pub(crate) ledger: ViolationLedger,
    pub(crate) enforcer: FullscreenEnforcer,
    pub(crate) reporter: AuditReporter,
    clear_storage_on_block: bool,
}

impl SessionCore {
    /// Bumps `counters`, reports the post-increment counts, and re-runs the
    /// blocking policy before returning.
    pub(crate) fn record(
        &mut self,
        event_type: AuditEventType,
        counters: &[Counter],
        mut data: Map<String, Value>,
    ) {
        for &counter in counters {
            self.ledger.increment(counter);
        }
        let counts = self.ledger.snapshot();
        log::warn!(
            "proctoring violation {} on test {} (violations={}, tab_switches={}, fullscreen_exits={})",
            event_type.as_str(),
            self.session.test_id(),
            counts.violations,
            counts.tab_switches,
            counts.fullscreen_exits
        );
        if counters.contains(&Counter::TabSwitches) {
            data.insert(
                "persistent_tab_switches".to_string(),
                Value::from(counts.tab_switches),
            );
            data.insert(
                "persistent_violations".to_string(),
                Value::from(counts.violations),
            );
        }
        if counters.contains(&Counter::FullscreenExits) {
            data.insert(
                "fullscreen_exit_count".to_string(),
                Value::from(counts.fullscreen_exits),
            );
        }
        self.report(event_type, data);
        self.evaluate();
    }

    pub(crate) fn evaluate(&mut self) {
        if let Some(reason) = BlockingPolicy::reason(&self.settings, &self.ledger.snapshot()) {
            self.apply_block(reason);
        }
    }

    pub(crate) fn apply_block(&mut self, reason: BlockReason) {
        if !self.ledger.block(reason) {
            return;
        }
        self.enforcer.cancel();
        let counts = self.ledger.snapshot();
        log::info!(
            "test {} blocked: {} (violations={}, tab_switches={})",
            self.session.test_id(),
            reason.as_str(),
            counts.violations,
            counts.tab_switches
        );
        let mut data = Map::new();
        data.insert("reason".to_string(), Value::from(reason.as_str()));
        data.insert(
            "persistent_tab_switches".to_string(),
            Value::from(counts.tab_switches),
        );
        data.insert(
            "persistent_violations".to_string(),
            Value::from(counts.violations),
        );
        self.report(AuditEventType::TestBlocked, data);
        if self.clear_storage_on_block {
            self.ledger.clear_storage();
        }
    }

    pub(crate) fn absorb_server_flags(&mut self) {
        if let Some(event_type) = self.reporter.take_flagged() {
            log::info!(
                "server flagged test {} after {}",
                self.session.test_id(),
                event_type.as_str()
            );
            self.apply_block(BlockReason::ServerFlagged);
        }
    }

    pub(crate) fn fullscreen_restored(&mut self) {
        self.ledger.set_fullscreen_warning(false);
        self.enforcer.on_restore();
    }

    /// Sends `event_type` with the current violation count attached.
    pub(crate) fn report(&self, event_type: AuditEventType, mut data: Map<String, Value>) {
        data.insert(
            "violation_count".to_string(),
            Value::from(self.ledger.count(Counter::Violations)),
        );
        match crate::now_s() {
            Ok(ts) => {
                data.insert("timestamp".to_string(), Value::from(ts));
            }
            Err(e) => log::debug!("audit timestamp unavailable: {}", e),
        }
        self.reporter
            .send(AuditReport::new(self.session.test_id(), event_type, data));
    }
}

struct PendingDeps {
    store: Box<dyn KeyValueStore>,
    fullscreen: Box<dyn FullscreenControl>,
    audit: Option<Arc<dyn AuditTransport>>,
}

pub struct ProctoringMonitor {
    session: SessionId,
    settings: Option<ProctoringSettings>,
    options: MonitorOptions,
    source: Box<dyn EventSource>,
    pending: Option<PendingDeps>,
    core: Option<Rc<RefCell<SessionCore>>>,
    watcher: EventWatcher,
    announced: bool,
}

impl ProctoringMonitor {
    /// `settings` of `None` means the test configuration has not been
    /// supplied; the monitor then stays inactive.
    pub fn new(
        session: SessionId,
        settings: Option<ProctoringSettings>,
        deps: MonitorDeps,
        options: MonitorOptions,
    ) -> Self {
        Self {
            session,
            settings: settings.map(ProctoringSettings::normalized),
            options,
            source: deps.source,
            pending: Some(PendingDeps {
                store: deps.store,
                fullscreen: deps.fullscreen,
                audit: deps.audit,
            }),
            core: None,
            watcher: EventWatcher::new(),
            announced: false,
        }
    }

    pub fn session(&self) -> &SessionId {
        &self.session
    }

    pub fn is_active(&self) -> bool {
        self.core.is_some()
    }

    pub fn is_watching(&self) -> bool {
        self.watcher.is_attached()
    }

    /// Starts (or resumes) monitoring. Returns whether signal handlers are
    /// attached afterwards.
    ///
    /// Absent or disabled settings leave the monitor inactive: proctoring is
    /// advisory and must never stop an otherwise valid session.
    pub fn activate(&mut self) -> bool {
        self.activate_at(Instant::now())
    }

    pub fn activate_at(&mut self, now: Instant) -> bool {
        let Some(settings) = self.settings.clone().filter(|s| s.enable_proctoring) else {
            log::debug!(
                "proctoring disabled or unconfigured for test {}",
                self.session.test_id()
            );
            return false;
        };

        if self.core.is_none() {
            let Some(deps) = self.pending.take() else {
                return false;
            };
            let core = self.open_core(settings, deps, now);
            self.core = Some(Rc::new(RefCell::new(core)));
        }
        let Some(core) = self.core.clone() else {
            return false;
        };

        if core.borrow().ledger.is_blocked() {
            return false;
        }
        self.watcher.attach(self.source.as_mut(), &core);
        true
    }

    fn open_core(
        &mut self,
        settings: ProctoringSettings,
        deps: PendingDeps,
        now: Instant,
    ) -> SessionCore {
        let (ledger, loaded) = ViolationLedger::load(&self.session, deps.store);
        let reporter = match deps.audit {
            Some(transport) => AuditReporter::spawn(transport),
            None => AuditReporter::disabled(),
        };
        let enforcer = FullscreenEnforcer::new(
            deps.fullscreen,
            self.options.fullscreen_initial_delay,
            self.options.fullscreen_retry_delay,
        );
        let mut core = SessionCore {
            session: self.session.clone(),
            settings,
            ledger,
            enforcer,
            reporter,
            clear_storage_on_block: self.options.clear_storage_on_block,
        };
        log::info!(
            "proctoring active for test {} (prior tab_switches={}, violations={})",
            self.session.test_id(),
            loaded.snapshot.tab_switches,
            loaded.snapshot.violations
        );

        if !self.announced {
            self.announced = true;
            announce(&core, &loaded.snapshot);
        }
        let seal_problem = match loaded.seal {
            SealStatus::Mismatch => Some("ledger_seal_mismatch"),
            SealStatus::Missing if !loaded.snapshot.is_zero() => Some("ledger_seal_missing"),
            _ => None,
        };
        if let Some(reason) = seal_problem {
            let mut data = Map::new();
            data.insert("reason".to_string(), Value::from(reason));
            core.report(AuditEventType::IntegrityViolation, data);
        }

        core.evaluate();
        if !core.ledger.is_blocked() {
            let required = core.settings.require_fullscreen;
            core.enforcer.on_activate(now, required);
        }
        core
    }

    /// One lifecycle turn: apply server verdicts, fire a due fullscreen
    /// request, detach handlers from a blocked session.
    pub fn tick(&mut self) {
        self.tick_at(Instant::now());
    }

    pub fn tick_at(&mut self, now: Instant) {
        let Some(core) = self.core.clone() else {
            return;
        };
        let blocked = {
            let mut core = core.borrow_mut();
            core.absorb_server_flags();
            if !core.ledger.is_blocked() {
                match core.enforcer.poll(now) {
                    FireOutcome::Requested(_) | FireOutcome::AlreadyFullscreen => {
                        if core.enforcer.is_fullscreen() {
                            core.fullscreen_restored();
                        }
                    }
                    FireOutcome::Failed(_) => {
                        if core.settings.require_fullscreen && !core.enforcer.is_fullscreen() {
                            core.ledger.set_fullscreen_warning(true);
                        }
                    }
                    FireOutcome::Idle => {}
                }
            }
            core.ledger.is_blocked()
        };
        if blocked && self.watcher.is_attached() {
            self.watcher.detach(self.source.as_mut());
            log::info!(
                "signal handlers detached from blocked test {}",
                self.session.test_id()
            );
        }
    }

    pub fn state(&self) -> MonitorState {
        let Some(core) = &self.core else {
            return MonitorState::default();
        };
        let core = core.borrow();
        let counts: LedgerSnapshot = core.ledger.snapshot();
        MonitorState {
            active: true,
            fullscreen_warning: core.ledger.fullscreen_warning(),
            test_blocked: core.ledger.is_blocked(),
            violation_count: counts.violations,
            tab_switch_count: counts.tab_switches,
            fullscreen_exit_count: counts.fullscreen_exits,
            block_reason: core.ledger.blocked(),
        }
    }

    /// Clears counters, flags, and stored keys. Called by the UI once, at
    /// submission.
    pub fn reset(&mut self) {
        match &self.core {
            Some(core) => {
                let mut core = core.borrow_mut();
                core.ledger.reset();
                core.enforcer.cancel();
            }
            None => {
                if let Some(deps) = self.pending.take() {
                    let (mut ledger, _) = ViolationLedger::load(&self.session, deps.store);
                    ledger.reset();
                    self.pending = Some(PendingDeps {
                        store: ledger.into_store(),
                        fullscreen: deps.fullscreen,
                        audit: deps.audit,
                    });
                }
            }
        }
        log::info!("proctoring ledger reset for test {}", self.session.test_id());
    }

    /// Blocks until queued audit reports have been handed to the transport.
    pub fn wait_for_audit(&self, timeout: Duration) -> bool {
        match &self.core {
            Some(core) => core.borrow().reporter.wait_idle(timeout),
            None => true,
        }
    }

    /// Detaches every handler, cancels the pending fullscreen request, and
    /// closes the audit queue. Returns without waiting for delivery; use
    /// [`ProctoringMonitor::wait_for_audit`] first for a bounded flush.
    pub fn teardown(&mut self) {
        self.watcher.detach(self.source.as_mut());
        if let Some(core) = &self.core {
            let mut core = core.borrow_mut();
            core.enforcer.cancel();
            core.reporter.shutdown();
        }
    }
}

impl Drop for ProctoringMonitor {
    fn drop(&mut self) {
        self.watcher.detach(self.source.as_mut());
    }
}

/// `test_started` for a clean ledger, otherwise `test_resumed` with the
/// counts carried over from the previous page load.
fn announce(core: &SessionCore, prior: &LedgerSnapshot) {
    if prior.tab_switches == 0 && prior.violations == 0 {
        core.report(AuditEventType::TestStarted, Map::new());
        return;
    }
    let mut data = Map::new();
    data.insert(
        "previous_tab_switches".to_string(),
        Value::from(prior.tab_switches),
    );
    data.insert(
        "previous_violations".to_string(),
        Value::from(prior.violations),
    );
    data.insert(
        "persistent_tab_switches".to_string(),
        Value::from(prior.tab_switches),
    );
    data.insert(
        "persistent_violations".to_string(),
        Value::from(prior.violations),
    );
    core.report(AuditEventType::TestResumed, data);
}
