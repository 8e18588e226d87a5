use anyhow::Result;
use std::cell::Cell;
use std::rc::Rc;
use std::sync::Arc;
use std::time::{Duration, Instant};

use proctor_monitor::ledger::seal_digest;
use proctor_monitor::{
    AuditEventType, AuditReport, AuditResponse, AuditTransport, BlockReason, FullscreenControl,
    HeadlessFullscreen, InMemoryKeyValueStore, KeyPress, KeyValueStore, LedgerSnapshot,
    LocalEventSource, MemoryAuditTransport, MonitorDeps, MonitorOptions, ProctoringMonitor,
    ProctoringSettings, SessionId, Signal, SignalKind,
};

const AUDIT_WAIT: Duration = Duration::from_secs(5);

#[derive(Clone, Default)]
struct FakeFullscreen {
    active: Rc<Cell<bool>>,
    requests: Rc<Cell<u32>>,
}

impl FullscreenControl for FakeFullscreen {
    fn is_fullscreen(&self) -> bool {
        self.active.get()
    }

    fn request_fullscreen(&mut self) -> Result<()> {
        self.requests.set(self.requests.get() + 1);
        self.active.set(true);
        Ok(())
    }
}

struct Harness {
    source: LocalEventSource,
    store: InMemoryKeyValueStore,
    audit: MemoryAuditTransport,
    fullscreen: FakeFullscreen,
    monitor: ProctoringMonitor,
}

impl Harness {
    fn new(settings: Option<ProctoringSettings>) -> Self {
        Self::with_store("t1", settings, InMemoryKeyValueStore::new(), MonitorOptions::default())
    }

    fn with_store(
        test_id: &str,
        settings: Option<ProctoringSettings>,
        store: InMemoryKeyValueStore,
        options: MonitorOptions,
    ) -> Self {
        let source = LocalEventSource::new();
        let audit = MemoryAuditTransport::new();
        let fullscreen = FakeFullscreen::default();
        let monitor = ProctoringMonitor::new(
            SessionId::new(test_id, "participant-token").unwrap(),
            settings,
            MonitorDeps {
                store: Box::new(store.clone()),
                source: Box::new(source.clone()),
                fullscreen: Box::new(fullscreen.clone()),
                audit: Some(Arc::new(audit.clone())),
            },
            options,
        );
        Self {
            source,
            store,
            audit,
            fullscreen,
            monitor,
        }
    }

    fn send(&self, signal: Signal) -> Signal {
        self.source.dispatch(signal)
    }

    fn flush(&self) {
        assert!(self.monitor.wait_for_audit(AUDIT_WAIT));
    }
}

fn enabled() -> ProctoringSettings {
    ProctoringSettings {
        enable_proctoring: true,
        ..ProctoringSettings::default()
    }
}

#[test]
fn tab_switches_block_exactly_at_threshold_and_stay_blocked() {
    let mut h = Harness::new(Some(ProctoringSettings {
        max_tab_switches: Some(3),
        ..enabled()
    }));
    assert!(h.monitor.activate());

    for i in 1..=6u32 {
        h.send(Signal::visibility(true));
        h.send(Signal::visibility(false));
        let state = h.monitor.state();
        assert_eq!(state.tab_switch_count, i.min(3));
        assert_eq!(state.test_blocked, i >= 3, "after {} switches", i);
    }
    assert_eq!(h.monitor.state().block_reason, Some(BlockReason::MaxTabSwitches));

    h.monitor.tick();
    assert_eq!(h.source.total_subscribers(), 0);
    assert!(h.monitor.state().test_blocked);
}

#[test]
fn visible_transition_is_not_counted() {
    let mut h = Harness::new(Some(enabled()));
    h.monitor.activate();
    h.send(Signal::visibility(true));
    h.send(Signal::visibility(false));
    let state = h.monitor.state();
    assert_eq!(state.tab_switch_count, 1);
    assert_eq!(state.violation_count, 1);
}

#[test]
fn reset_always_returns_to_clean_state() {
    let mut h = Harness::new(Some(ProctoringSettings {
        max_violations: Some(3),
        require_fullscreen: true,
        ..enabled()
    }));
    h.fullscreen.active.set(true);
    h.monitor.activate();
    h.send(Signal::visibility(true));
    h.send(Signal::fullscreen(false));
    assert!(h.monitor.state().fullscreen_warning);
    h.send(Signal::blur());
    assert!(h.monitor.state().test_blocked);

    h.monitor.reset();
    let state = h.monitor.state();
    assert_eq!(state.tab_switch_count, 0);
    assert_eq!(state.violation_count, 0);
    assert!(!state.test_blocked);
    assert!(!state.fullscreen_warning);
    assert!(h.store.is_empty());
}

#[test]
fn reset_on_inactive_monitor_clears_storage() {
    let mut store = InMemoryKeyValueStore::new();
    store.set("proctoring_t1_violations", "5").unwrap();
    let mut h = Harness::with_store("t1", None, store, MonitorOptions::default());
    h.monitor.reset();
    assert!(h.store.is_empty());
    assert_eq!(h.monitor.state().violation_count, 0);
}

#[test]
fn reload_restores_persisted_counts_and_reports_resume() {
    let mut store = InMemoryKeyValueStore::new();
    store.set("proctoring_t1_tabSwitches", "2").unwrap();
    store.set("proctoring_t1_violations", "3").unwrap();

    let mut h = Harness::with_store("t1", Some(enabled()), store, MonitorOptions::default());
    assert!(h.monitor.activate());
    let state = h.monitor.state();
    assert_eq!(state.tab_switch_count, 2);
    assert_eq!(state.violation_count, 3);

    h.flush();
    assert!(h.audit.reports_of(AuditEventType::TestStarted).is_empty());
    let resumed = h.audit.reports_of(AuditEventType::TestResumed);
    assert_eq!(resumed.len(), 1);
    assert_eq!(resumed[0].data_u64("previous_tab_switches"), Some(2));
    assert_eq!(resumed[0].data_u64("previous_violations"), Some(3));
}

#[test]
fn counts_survive_a_second_monitor_instance() {
    let store = InMemoryKeyValueStore::new();
    {
        let mut first =
            Harness::with_store("t1", Some(enabled()), store.clone(), MonitorOptions::default());
        first.monitor.activate();
        first.send(Signal::visibility(true));
        first.send(Signal::visibility(true));
        first.monitor.teardown();
    }
    let mut second = Harness::with_store("t1", Some(enabled()), store, MonitorOptions::default());
    second.monitor.activate();
    assert_eq!(second.monitor.state().tab_switch_count, 2);
    assert_eq!(second.monitor.state().violation_count, 2);
}

#[test]
fn clipboard_and_context_menu_counted_only_when_disallowed() {
    let mut strict = Harness::new(Some(enabled()));
    strict.monitor.activate();
    for signal in [
        Signal::copy(),
        Signal::cut(),
        Signal::paste(),
        Signal::context_menu(),
    ] {
        assert!(strict.send(signal).default_prevented());
    }
    assert_eq!(strict.monitor.state().violation_count, 4);

    let mut lenient = Harness::new(Some(ProctoringSettings {
        allow_copy_paste: true,
        allow_right_click: true,
        ..enabled()
    }));
    lenient.monitor.activate();
    for signal in [
        Signal::copy(),
        Signal::cut(),
        Signal::paste(),
        Signal::context_menu(),
        Signal::key(KeyPress::new("v").ctrl()),
    ] {
        assert!(!lenient.send(signal).default_prevented());
    }
    assert_eq!(lenient.monitor.state().violation_count, 0);
}

#[test]
fn keyboard_shortcuts() {
    let mut h = Harness::new(Some(ProctoringSettings {
        allow_copy_paste: true,
        ..enabled()
    }));
    h.monitor.activate();
    assert!(h.send(Signal::key(KeyPress::new("F12"))).default_prevented());
    assert!(h
        .send(Signal::key(KeyPress::new("i").ctrl().shift()))
        .default_prevented());
    assert!(!h.send(Signal::key(KeyPress::new("c").ctrl())).default_prevented());
    assert!(!h.send(Signal::key(KeyPress::new("a"))).default_prevented());
    assert_eq!(h.monitor.state().violation_count, 2);

    h.flush();
    let devtools = h.audit.reports_of(AuditEventType::DevToolsAttempt);
    assert_eq!(devtools.len(), 2);
    assert_eq!(devtools[1].event_data["key"], "Ctrl+Shift+I");
}

#[test]
fn copy_shortcut_is_prevented_when_clipboard_disallowed() {
    let mut h = Harness::new(Some(enabled()));
    h.monitor.activate();
    assert!(h.send(Signal::key(KeyPress::new("c").meta())).default_prevented());
    h.flush();
    let shortcuts = h.audit.reports_of(AuditEventType::KeyboardShortcut);
    assert_eq!(shortcuts.len(), 1);
    assert_eq!(shortcuts[0].data_u64("violation_count"), Some(1));
}

#[test]
fn audit_reports_carry_post_increment_counts() {
    let mut h = Harness::new(Some(enabled()));
    h.monitor.activate();
    h.send(Signal::blur());
    h.send(Signal::copy());
    h.send(Signal::visibility(true));
    h.flush();

    let reports = h.audit.reports();
    let types: Vec<AuditEventType> = reports.iter().map(|r| r.event_type).collect();
    assert_eq!(
        types,
        vec![
            AuditEventType::TestStarted,
            AuditEventType::WindowBlur,
            AuditEventType::CopyAttempt,
            AuditEventType::TabSwitch,
        ]
    );
    let counts: Vec<Option<u64>> = reports
        .iter()
        .map(|r| r.data_u64("violation_count"))
        .collect();
    assert_eq!(counts, vec![Some(0), Some(1), Some(2), Some(3)]);
    assert_eq!(reports[3].data_u64("persistent_tab_switches"), Some(1));
    assert_eq!(reports[3].data_u64("persistent_violations"), Some(3));
    assert!(reports.iter().all(|r| r.test_id == "t1"));
}

#[test]
fn fullscreen_exits_warn_and_block_at_threshold() {
    let mut h = Harness::new(Some(ProctoringSettings {
        require_fullscreen: true,
        max_fullscreen_exits: Some(2),
        ..enabled()
    }));
    h.fullscreen.active.set(true);
    h.monitor.activate();

    h.fullscreen.active.set(false);
    h.send(Signal::fullscreen(false));
    let state = h.monitor.state();
    assert!(state.fullscreen_warning);
    assert!(!state.test_blocked);
    assert_eq!(state.fullscreen_exit_count, 1);

    h.fullscreen.active.set(true);
    h.send(Signal::fullscreen(true));
    assert!(!h.monitor.state().fullscreen_warning);

    h.fullscreen.active.set(false);
    h.send(Signal::fullscreen(false));
    let state = h.monitor.state();
    assert!(state.test_blocked);
    assert_eq!(state.block_reason, Some(BlockReason::MaxFullscreenExits));
    assert!(!state.fullscreen_warning);
}

#[test]
fn back_to_back_fullscreen_exits_each_count() {
    let mut h = Harness::new(Some(ProctoringSettings {
        require_fullscreen: true,
        max_fullscreen_exits: Some(2),
        ..enabled()
    }));
    h.monitor.activate();
    h.send(Signal::fullscreen(false));
    assert!(h.monitor.state().fullscreen_warning);
    h.send(Signal::fullscreen(false));
    assert!(h.monitor.state().test_blocked);
}

#[test]
fn fullscreen_exit_ignored_when_not_required() {
    let mut h = Harness::new(Some(enabled()));
    h.monitor.activate();
    h.send(Signal::fullscreen(false));
    let state = h.monitor.state();
    assert_eq!(state.violation_count, 0);
    assert!(!state.fullscreen_warning);
}

#[test]
fn fullscreen_requests_follow_their_delays() {
    let options = MonitorOptions {
        fullscreen_initial_delay: Duration::from_millis(500),
        fullscreen_retry_delay: Duration::from_millis(1000),
        clear_storage_on_block: false,
    };
    let mut h = Harness::with_store(
        "t1",
        Some(ProctoringSettings {
            require_fullscreen: true,
            ..enabled()
        }),
        InMemoryKeyValueStore::new(),
        options,
    );
    let t0 = Instant::now();
    h.monitor.activate_at(t0);
    h.monitor.tick_at(t0 + Duration::from_millis(100));
    assert_eq!(h.fullscreen.requests.get(), 0);
    h.monitor.tick_at(t0 + Duration::from_millis(600));
    assert_eq!(h.fullscreen.requests.get(), 1);

    h.fullscreen.active.set(false);
    h.send(Signal::fullscreen(false));
    assert!(h.monitor.state().fullscreen_warning);
    h.monitor.tick();
    assert_eq!(h.fullscreen.requests.get(), 1);
    h.monitor.tick_at(Instant::now() + Duration::from_millis(1100));
    assert_eq!(h.fullscreen.requests.get(), 2);
    assert!(!h.monitor.state().fullscreen_warning);
}

#[test]
fn block_cancels_pending_fullscreen_request() {
    let mut h = Harness::new(Some(ProctoringSettings {
        require_fullscreen: true,
        max_fullscreen_exits: Some(1),
        ..enabled()
    }));
    h.fullscreen.active.set(true);
    h.monitor.activate();
    h.fullscreen.active.set(false);
    h.send(Signal::fullscreen(false));
    assert!(h.monitor.state().test_blocked);
    h.monitor.tick_at(Instant::now() + Duration::from_secs(5));
    assert_eq!(h.fullscreen.requests.get(), 0);
}

#[test]
fn teardown_cancels_pending_fullscreen_request() {
    let mut h = Harness::new(Some(ProctoringSettings {
        require_fullscreen: true,
        ..enabled()
    }));
    h.monitor.activate();
    h.monitor.teardown();
    assert_eq!(h.source.total_subscribers(), 0);
    h.monitor.tick_at(Instant::now() + Duration::from_secs(5));
    assert_eq!(h.fullscreen.requests.get(), 0);
}

#[test]
fn absent_or_disabled_settings_leave_monitor_inactive() {
    for settings in [None, Some(ProctoringSettings::default())] {
        let mut h = Harness::new(settings);
        assert!(!h.monitor.activate());
        assert!(!h.monitor.is_active());
        assert!(!h.send(Signal::copy()).default_prevented());
        h.send(Signal::visibility(true));
        assert_eq!(h.monitor.state(), Default::default());
        assert_eq!(h.source.total_subscribers(), 0);
        assert!(h.audit.reports().is_empty());
    }
}

#[test]
fn reactivation_keeps_one_subscription_set_and_one_start_event() {
    let mut h = Harness::new(Some(enabled()));
    assert!(h.monitor.activate());
    assert!(h.monitor.activate());
    for kind in SignalKind::ALL {
        assert_eq!(h.source.subscriber_count(kind), 1);
    }
    h.send(Signal::blur());
    assert_eq!(h.monitor.state().violation_count, 1);

    h.flush();
    assert_eq!(h.audit.reports_of(AuditEventType::TestStarted).len(), 1);
}

#[test]
fn server_flag_blocks_below_local_thresholds() {
    let mut h = Harness::new(Some(ProctoringSettings {
        max_violations: Some(100),
        ..enabled()
    }));
    h.audit.flag_on(AuditEventType::WindowBlur);
    h.monitor.activate();
    h.send(Signal::blur());
    h.flush();
    assert!(!h.monitor.state().test_blocked);

    h.monitor.tick();
    let state = h.monitor.state();
    assert!(state.test_blocked);
    assert_eq!(state.block_reason, Some(BlockReason::ServerFlagged));
    assert_eq!(h.source.total_subscribers(), 0);
}

#[test]
fn audit_failures_do_not_affect_local_state() {
    let mut h = Harness::new(Some(ProctoringSettings {
        max_violations: Some(2),
        ..enabled()
    }));
    h.audit.fail_posts(true);
    h.monitor.activate();
    h.send(Signal::blur());
    h.send(Signal::blur());
    h.flush();
    assert!(h.monitor.state().test_blocked);
    assert!(h.audit.reports().is_empty());
}

#[test]
fn storage_failure_keeps_counting_in_memory() {
    let mut h = Harness::new(Some(enabled()));
    h.monitor.activate();
    h.store.fail_writes(true);
    h.send(Signal::blur());
    h.send(Signal::blur());
    assert_eq!(h.monitor.state().violation_count, 2);
    assert_eq!(h.store.get("proctoring_t1_violations").unwrap(), None);
}

#[test]
fn session_loaded_over_threshold_starts_blocked() {
    let mut store = InMemoryKeyValueStore::new();
    store.set("proctoring_t1_tabSwitches", "3").unwrap();
    store.set("proctoring_t1_violations", "3").unwrap();
    let counts = LedgerSnapshot {
        tab_switches: 3,
        violations: 3,
        fullscreen_exits: 0,
    };
    store
        .set("proctoring_t1_seal", &seal_digest("t1", &counts))
        .unwrap();
    let mut h = Harness::with_store(
        "t1",
        Some(ProctoringSettings {
            max_tab_switches: Some(3),
            ..enabled()
        }),
        store,
        MonitorOptions::default(),
    );
    assert!(!h.monitor.activate());
    assert!(h.monitor.state().test_blocked);
    assert_eq!(h.source.total_subscribers(), 0);

    h.flush();
    let types: Vec<AuditEventType> = h.audit.reports().iter().map(|r| r.event_type).collect();
    assert_eq!(
        types,
        vec![AuditEventType::TestResumed, AuditEventType::TestBlocked]
    );
}

#[test]
fn unsealed_counters_are_reported() {
    let store = InMemoryKeyValueStore::new();
    {
        let mut first =
            Harness::with_store("t1", Some(enabled()), store.clone(), MonitorOptions::default());
        first.monitor.activate();
        first.send(Signal::blur());
        first.send(Signal::blur());
    }
    let mut edit = store.clone();
    edit.set("proctoring_t1_violations", "0").unwrap();
    edit.remove("proctoring_t1_seal").unwrap();

    let mut second = Harness::with_store("t1", Some(enabled()), store, MonitorOptions::default());
    second.monitor.activate();
    second.flush();
    let integrity = second.audit.reports_of(AuditEventType::IntegrityViolation);
    assert_eq!(integrity.len(), 1);
    assert_eq!(integrity[0].event_data["reason"], "ledger_seal_missing");
}

#[test]
fn fresh_session_without_seal_is_not_reported() {
    let mut h = Harness::new(Some(enabled()));
    h.monitor.activate();
    h.flush();
    assert!(h.audit.reports_of(AuditEventType::IntegrityViolation).is_empty());
}

#[test]
fn tampered_ledger_is_reported() {
    let store = InMemoryKeyValueStore::new();
    {
        let mut first =
            Harness::with_store("t1", Some(enabled()), store.clone(), MonitorOptions::default());
        first.monitor.activate();
        first.send(Signal::blur());
        first.send(Signal::blur());
    }
    let mut edit = store.clone();
    edit.set("proctoring_t1_violations", "0").unwrap();

    let mut second = Harness::with_store("t1", Some(enabled()), store, MonitorOptions::default());
    second.monitor.activate();
    second.flush();
    let integrity = second.audit.reports_of(AuditEventType::IntegrityViolation);
    assert_eq!(integrity.len(), 1);
    assert_eq!(integrity[0].event_data["reason"], "ledger_seal_mismatch");
}

#[test]
fn clear_on_block_removes_persisted_counts() {
    let options = MonitorOptions {
        clear_storage_on_block: true,
        ..MonitorOptions::default()
    };
    let mut h = Harness::with_store(
        "t1",
        Some(ProctoringSettings {
            max_violations: Some(1),
            ..enabled()
        }),
        InMemoryKeyValueStore::new(),
        options,
    );
    h.monitor.activate();
    h.send(Signal::context_menu());
    let state = h.monitor.state();
    assert!(state.test_blocked);
    assert_eq!(state.violation_count, 1);
    assert!(h.store.is_empty());
}

#[test]
fn blocked_report_names_reason() {
    let mut h = Harness::new(Some(ProctoringSettings {
        max_violations: Some(1),
        ..enabled()
    }));
    h.monitor.activate();
    h.send(Signal::paste());
    h.send(Signal::paste());
    h.flush();
    let blocked = h.audit.reports_of(AuditEventType::TestBlocked);
    assert_eq!(blocked.len(), 1);
    assert_eq!(blocked[0].event_data["reason"], "max_violations");
    assert_eq!(h.audit.reports_of(AuditEventType::PasteAttempt).len(), 1);
}

#[test]
fn refused_fullscreen_leaves_warning_raised() {
    let source = LocalEventSource::new();
    let mut monitor = ProctoringMonitor::new(
        SessionId::new("t1", "participant-token").unwrap(),
        Some(ProctoringSettings {
            require_fullscreen: true,
            ..enabled()
        }),
        MonitorDeps {
            store: Box::new(InMemoryKeyValueStore::new()),
            source: Box::new(source.clone()),
            fullscreen: Box::new(HeadlessFullscreen),
            audit: None,
        },
        MonitorOptions::default(),
    );
    let t0 = Instant::now();
    assert!(monitor.activate_at(t0));
    assert!(!monitor.state().fullscreen_warning);

    monitor.tick_at(t0 + Duration::from_secs(2));
    let state = monitor.state();
    assert!(state.fullscreen_warning);
    assert!(!state.test_blocked);
    assert_eq!(state.violation_count, 0);

    // Warning-only: an exit still counts, but no new request is scheduled.
    source.dispatch(Signal::fullscreen(false));
    monitor.tick_at(t0 + Duration::from_secs(10));
    let state = monitor.state();
    assert!(state.fullscreen_warning);
    assert_eq!(state.fullscreen_exit_count, 1);
}

#[test]
fn refused_fullscreen_without_requirement_raises_nothing() {
    let source = LocalEventSource::new();
    let mut monitor = ProctoringMonitor::new(
        SessionId::new("t1", "participant-token").unwrap(),
        Some(enabled()),
        MonitorDeps {
            store: Box::new(InMemoryKeyValueStore::new()),
            source: Box::new(source.clone()),
            fullscreen: Box::new(HeadlessFullscreen),
            audit: None,
        },
        MonitorOptions::default(),
    );
    let t0 = Instant::now();
    monitor.activate_at(t0);
    monitor.tick_at(t0 + Duration::from_secs(2));
    assert!(!monitor.state().fullscreen_warning);
}

struct SlowAudit {
    inner: MemoryAuditTransport,
    delay: Duration,
}

impl AuditTransport for SlowAudit {
    fn post(&self, report: &AuditReport) -> Result<AuditResponse> {
        std::thread::sleep(self.delay);
        self.inner.post(report)
    }
}

#[test]
fn teardown_returns_without_waiting_on_audit_delivery() {
    let source = LocalEventSource::new();
    let inner = MemoryAuditTransport::new();
    let mut monitor = ProctoringMonitor::new(
        SessionId::new("t1", "participant-token").unwrap(),
        Some(enabled()),
        MonitorDeps {
            store: Box::new(InMemoryKeyValueStore::new()),
            source: Box::new(source.clone()),
            fullscreen: Box::new(FakeFullscreen::default()),
            audit: Some(Arc::new(SlowAudit {
                inner: inner.clone(),
                delay: Duration::from_millis(400),
            })),
        },
        MonitorOptions::default(),
    );
    monitor.activate();
    for _ in 0..4 {
        source.dispatch(Signal::blur());
    }

    let started = Instant::now();
    monitor.teardown();
    drop(monitor);
    assert!(started.elapsed() < Duration::from_millis(300));
    assert_eq!(source.total_subscribers(), 0);

    // Queued reports are still delivered in the background.
    let deadline = Instant::now() + Duration::from_secs(10);
    while inner.reports().len() < 5 && Instant::now() < deadline {
        std::thread::sleep(Duration::from_millis(10));
    }
    assert_eq!(inner.reports().len(), 5);
}
