//! Proctoring Monitor
//!
//! This crate implements the exam-integrity monitor of an online-assessment
//! client: a watcher that detects suspicious participant behavior during a
//! timed session and keeps a violation ledger that survives page reloads.
//!
//! # Architecture
//!
//! Components, leaves first:
//!
//! 1. **KeyValueStore**: durable per-key string storage (`storage`).
//! 2. **ViolationLedger**: persisted counters for one session (`ledger`).
//! 3. **BlockingPolicy**: pure threshold evaluation (`policy`).
//! 4. **FullscreenEnforcer**: fullscreen requests and compliance (`fullscreen`).
//! 5. **EventWatcher**: platform signals to ledger mutations (`watcher`).
//! 6. **AuditReporter**: fire-and-forget remote audit log (`audit`).
//! 7. **ProctoringMonitor**: per-session lifecycle (`monitor`).
//!
//! The monitor is a deterrent. It reacts to what the platform reports and
//! cannot see anything the platform does not deliver.

use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::OnceLock;
use std::time::{SystemTime, UNIX_EPOCH};

pub mod audit;
pub mod config;
pub mod fullscreen;
pub mod ledger;
pub mod monitor;
pub mod policy;
pub mod source;
pub mod storage;
pub mod watcher;

pub use audit::{
    AuditReport, AuditReporter, AuditResponse, AuditTransport, HttpAuditTransport,
    MemoryAuditTransport,
};
pub use config::{AuditSettings, MonitorConfig};
pub use fullscreen::{FullscreenControl, FullscreenEnforcer, HeadlessFullscreen};
pub use ledger::{Counter, LedgerSnapshot, LoadOutcome, SealStatus, ViolationLedger};
pub use monitor::{MonitorDeps, MonitorOptions, ProctoringMonitor};
pub use policy::BlockingPolicy;
pub use source::{EventSource, LocalEventSource, SignalHandler, SubscriptionId};
pub use storage::{InMemoryKeyValueStore, KeyValueStore, SqliteKeyValueStore};
pub use watcher::{classify_shortcut, EventWatcher, ShortcutClass};

pub(crate) fn now_s() -> Result<u64> {
    Ok(SystemTime::now().duration_since(UNIX_EPOCH)?.as_secs())
}

// -------------------- Session Identity --------------------

/// One participant's attempt at one test.
///
/// The test id is embedded in storage keys, so it is held to an allowlist.
/// The participant token doubles as the audit bearer credential and is
/// never printed.
#[derive(Clone, PartialEq, Eq)]
pub struct SessionId {
    test_id: String,
    participant_token: String,
}

impl SessionId {
    pub fn new(test_id: &str, participant_token: &str) -> Result<Self> {
        validate_test_id(test_id)?;
        Ok(Self {
            test_id: test_id.to_string(),
            participant_token: participant_token.to_string(),
        })
    }

    pub fn test_id(&self) -> &str {
        &self.test_id
    }

    pub fn participant_token(&self) -> &str {
        &self.participant_token
    }
}

impl fmt::Debug for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionId")
            .field("test_id", &self.test_id)
            .field("participant_token", &"<redacted>")
            .finish()
    }
}

/// Allowed: "t1", "exam_2024-fall", "42".
/// Disallowed: empty ids, whitespace, and anything outside [A-Za-z0-9_-].
pub fn validate_test_id(test_id: &str) -> Result<()> {
    static TEST_ID_RE: OnceLock<regex::Regex> = OnceLock::new();
    let re = TEST_ID_RE.get_or_init(|| {
        regex::Regex::new(r"^[A-Za-z0-9_-]{1,128}$").expect("static test id pattern")
    });
    if !re.is_match(test_id) {
        return Err(anyhow!("test_id must match ^[A-Za-z0-9_-]{{1,128}}$"));
    }
    Ok(())
}

// -------------------- Settings --------------------

/// Per-session proctoring settings, as supplied by the test-configuration
/// loader. Absent thresholds mean "no limit of that kind".
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ProctoringSettings {
    pub enable_proctoring: bool,
    pub max_tab_switches: Option<u32>,
    pub max_violations: Option<u32>,
    pub max_fullscreen_exits: Option<u32>,
    pub allow_copy_paste: bool,
    pub allow_right_click: bool,
    pub require_fullscreen: bool,
}

impl ProctoringSettings {
    pub fn from_json(raw: &str) -> Result<Self> {
        let settings: Self = serde_json::from_str(raw)
            .map_err(|e| anyhow!("invalid proctoring settings: {}", e))?;
        Ok(settings.normalized())
    }

    /// A zero threshold would block an untouched session; it is read as
    /// "no limit".
    pub fn normalized(mut self) -> Self {
        self.max_tab_switches = self.max_tab_switches.filter(|&n| n > 0);
        self.max_violations = self.max_violations.filter(|&n| n > 0);
        self.max_fullscreen_exits = self.max_fullscreen_exits.filter(|&n| n > 0);
        self
    }
}

// -------------------- Signals --------------------

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum SignalKind {
    VisibilityChange,
    WindowBlur,
    Copy,
    Cut,
    Paste,
    ContextMenu,
    FullscreenChange,
    KeyDown,
}

impl SignalKind {
    pub const ALL: [SignalKind; 8] = [
        SignalKind::VisibilityChange,
        SignalKind::WindowBlur,
        SignalKind::Copy,
        SignalKind::Cut,
        SignalKind::Paste,
        SignalKind::ContextMenu,
        SignalKind::FullscreenChange,
        SignalKind::KeyDown,
    ];
}

/// A key press as delivered by the platform, with modifier state.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct KeyPress {
    pub key: String,
    pub ctrl: bool,
    pub shift: bool,
    pub alt: bool,
    pub meta: bool,
}

impl KeyPress {
    pub fn new(key: &str) -> Self {
        Self {
            key: key.to_string(),
            ..Self::default()
        }
    }

    pub fn ctrl(mut self) -> Self {
        self.ctrl = true;
        self
    }

    pub fn shift(mut self) -> Self {
        self.shift = true;
        self
    }

    pub fn alt(mut self) -> Self {
        self.alt = true;
        self
    }

    pub fn meta(mut self) -> Self {
        self.meta = true;
        self
    }

    /// Human-readable combination, e.g. "Ctrl+Shift+I".
    pub fn combo(&self) -> String {
        let mut parts = Vec::new();
        if self.ctrl {
            parts.push("Ctrl".to_string());
        }
        if self.meta {
            parts.push("Meta".to_string());
        }
        if self.alt {
            parts.push("Alt".to_string());
        }
        if self.shift {
            parts.push("Shift".to_string());
        }
        parts.push(if self.key.chars().count() == 1 {
            self.key.to_uppercase()
        } else {
            self.key.clone()
        });
        parts.join("+")
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SignalPayload {
    None,
    Visibility { hidden: bool },
    Fullscreen { active: bool },
    Key(KeyPress),
}

/// One platform-delivered occurrence. Handlers may cancel the platform's
/// default action through [`Signal::prevent_default`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Signal {
    kind: SignalKind,
    payload: SignalPayload,
    default_prevented: bool,
}

impl Signal {
    fn with(kind: SignalKind, payload: SignalPayload) -> Self {
        Self {
            kind,
            payload,
            default_prevented: false,
        }
    }

    pub fn visibility(hidden: bool) -> Self {
        Self::with(
            SignalKind::VisibilityChange,
            SignalPayload::Visibility { hidden },
        )
    }

    pub fn blur() -> Self {
        Self::with(SignalKind::WindowBlur, SignalPayload::None)
    }

    pub fn copy() -> Self {
        Self::with(SignalKind::Copy, SignalPayload::None)
    }

    pub fn cut() -> Self {
        Self::with(SignalKind::Cut, SignalPayload::None)
    }

    pub fn paste() -> Self {
        Self::with(SignalKind::Paste, SignalPayload::None)
    }

    pub fn context_menu() -> Self {
        Self::with(SignalKind::ContextMenu, SignalPayload::None)
    }

    pub fn fullscreen(active: bool) -> Self {
        Self::with(
            SignalKind::FullscreenChange,
            SignalPayload::Fullscreen { active },
        )
    }

    pub fn key(press: KeyPress) -> Self {
        Self::with(SignalKind::KeyDown, SignalPayload::Key(press))
    }

    pub fn kind(&self) -> SignalKind {
        self.kind
    }

    pub fn payload(&self) -> &SignalPayload {
        &self.payload
    }

    pub fn prevent_default(&mut self) {
        self.default_prevented = true;
    }

    pub fn default_prevented(&self) -> bool {
        self.default_prevented
    }
}

// -------------------- Audit Event Types --------------------

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum AuditEventType {
    TestStarted,
    TestResumed,
    TabSwitch,
    WindowBlur,
    CopyAttempt,
    PasteAttempt,
    RightClick,
    FullscreenExit,
    KeyboardShortcut,
    DevToolsAttempt,
    TestBlocked,
    IntegrityViolation,
}

impl AuditEventType {
    pub fn as_str(self) -> &'static str {
        match self {
            AuditEventType::TestStarted => "test_started",
            AuditEventType::TestResumed => "test_resumed",
            AuditEventType::TabSwitch => "tab_switch",
            AuditEventType::WindowBlur => "window_blur",
            AuditEventType::CopyAttempt => "copy_attempt",
            AuditEventType::PasteAttempt => "paste_attempt",
            AuditEventType::RightClick => "right_click",
            AuditEventType::FullscreenExit => "fullscreen_exit",
            AuditEventType::KeyboardShortcut => "keyboard_shortcut",
            AuditEventType::DevToolsAttempt => "dev_tools_attempt",
            AuditEventType::TestBlocked => "test_blocked",
            AuditEventType::IntegrityViolation => "integrity_violation",
        }
    }
}

// -------------------- Monitor State --------------------

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum BlockReason {
    MaxTabSwitches,
    MaxViolations,
    MaxFullscreenExits,
    ServerFlagged,
}

impl BlockReason {
    pub fn as_str(self) -> &'static str {
        match self {
            BlockReason::MaxTabSwitches => "max_tab_switches",
            BlockReason::MaxViolations => "max_violations",
            BlockReason::MaxFullscreenExits => "max_fullscreen_exits",
            BlockReason::ServerFlagged => "server_flagged",
        }
    }
}

/// What the consuming UI sees. The UI freezes answer submission while
/// `test_blocked` is set.
#[derive(Clone, Copy, Debug, Default, Serialize, PartialEq, Eq)]
pub struct MonitorState {
    pub active: bool,
    pub fullscreen_warning: bool,
    pub test_blocked: bool,
    pub violation_count: u32,
    pub tab_switch_count: u32,
    pub fullscreen_exit_count: u32,
    pub block_reason: Option<BlockReason>,
}
