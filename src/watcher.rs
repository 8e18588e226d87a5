//! Signal translation.
//!
//! | Signal | Counted when | Counters | Audit event |
//! |---|---|---|---|
//! | document hidden | always | tab switches, violations | `tab_switch` |
//! | window blur | always | violations | `window_blur` |
//! | copy / cut / paste | copy-paste not allowed | violations | `copy_attempt` / `paste_attempt` |
//! | context menu | right click not allowed | violations | `right_click` |
//! | fullscreen exit | fullscreen required | violations, fullscreen exits | `fullscreen_exit` |
//! | copy/paste shortcut | copy-paste not allowed | violations | `keyboard_shortcut` |
//! | developer-tools shortcut | always | violations | `dev_tools_attempt` |
//!
//! Counted signals that have a platform default (clipboard, context menu,
//! shortcuts) also have that default prevented.

use serde_json::{Map, Value};
use std::cell::RefCell;
use std::rc::Rc;
use std::time::Instant;

use crate::ledger::Counter;
use crate::monitor::SessionCore;
use crate::source::{EventSource, SubscriptionId};
use crate::{AuditEventType, KeyPress, Signal, SignalKind, SignalPayload};

/// The set of subscriptions belonging to one activation.
#[derive(Debug, Default)]
pub struct EventWatcher {
    subscriptions: Vec<SubscriptionId>,
}

impl EventWatcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_attached(&self) -> bool {
        !self.subscriptions.is_empty()
    }

    /// Subscribes one handler per signal kind. A second call while
    /// attached is a no-op, so re-activation never double counts.
    ///
    /// Handlers hold the shared session core and read it at call time,
    /// never a copy taken at subscription time.
    pub(crate) fn attach(
        &mut self,
        source: &mut dyn EventSource,
        core: &Rc<RefCell<SessionCore>>,
    ) -> usize {
        if self.is_attached() {
            return 0;
        }
        for kind in SignalKind::ALL {
            let core = Rc::clone(core);
            let id = source.subscribe(
                kind,
                Box::new(move |signal| match core.try_borrow_mut() {
                    Ok(mut core) => handle_signal(&mut core, signal, Instant::now()),
                    Err(_) => log::warn!("re-entrant {:?} signal dropped", signal.kind()),
                }),
            );
            self.subscriptions.push(id);
        }
        log::debug!("attached {} signal subscriptions", self.subscriptions.len());
        self.subscriptions.len()
    }

    pub fn detach(&mut self, source: &mut dyn EventSource) -> usize {
        let mut detached = 0;
        for id in self.subscriptions.drain(..) {
            if source.unsubscribe(id) {
                detached += 1;
            }
        }
        if detached > 0 {
            log::debug!("detached {} signal subscriptions", detached);
        }
        detached
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ShortcutClass {
    DevTools,
    CopyPaste,
    Other,
}

/// F12, Ctrl+Shift+I/J/C, Cmd+Option+I/J/C and view-source are developer
/// tools; Ctrl/Cmd + C/V/X are clipboard shortcuts. Developer-tools
/// combinations win where the two overlap (Ctrl+Shift+C).
pub fn classify_shortcut(press: &KeyPress) -> ShortcutClass {
    let key = press.key.to_lowercase();
    let inspector_key = matches!(key.as_str(), "i" | "j" | "c");
    if key == "f12"
        || (press.ctrl && press.shift && inspector_key)
        || (press.meta && press.alt && inspector_key)
        || ((press.ctrl || press.meta) && key == "u")
    {
        return ShortcutClass::DevTools;
    }
    if (press.ctrl || press.meta) && matches!(key.as_str(), "c" | "v" | "x") {
        return ShortcutClass::CopyPaste;
    }
    ShortcutClass::Other
}

pub(crate) fn handle_signal(core: &mut SessionCore, signal: &mut Signal, now: Instant) {
    core.absorb_server_flags();
    if core.ledger.is_blocked() {
        return;
    }
    let allow_copy_paste = core.settings.allow_copy_paste;
    let allow_right_click = core.settings.allow_right_click;
    let require_fullscreen = core.settings.require_fullscreen;

    match (signal.kind(), signal.payload().clone()) {
        (SignalKind::VisibilityChange, SignalPayload::Visibility { hidden }) => {
            if hidden {
                core.record(
                    AuditEventType::TabSwitch,
                    &[Counter::TabSwitches, Counter::Violations],
                    Map::new(),
                );
            }
        }
        (SignalKind::WindowBlur, _) => {
            core.record(AuditEventType::WindowBlur, &[Counter::Violations], Map::new());
        }
        (kind @ (SignalKind::Copy | SignalKind::Cut | SignalKind::Paste), _) => {
            if allow_copy_paste {
                return;
            }
            signal.prevent_default();
            let (event_type, action) = match kind {
                SignalKind::Paste => (AuditEventType::PasteAttempt, "paste"),
                SignalKind::Cut => (AuditEventType::CopyAttempt, "cut"),
                _ => (AuditEventType::CopyAttempt, "copy"),
            };
            core.record(event_type, &[Counter::Violations], data("action", action));
        }
        (SignalKind::ContextMenu, _) => {
            if allow_right_click {
                return;
            }
            signal.prevent_default();
            core.record(AuditEventType::RightClick, &[Counter::Violations], Map::new());
        }
        (SignalKind::FullscreenChange, SignalPayload::Fullscreen { active }) => {
            if active {
                core.fullscreen_restored();
            } else if require_fullscreen {
                core.ledger.set_fullscreen_warning(true);
                core.record(
                    AuditEventType::FullscreenExit,
                    &[Counter::Violations, Counter::FullscreenExits],
                    Map::new(),
                );
                if !core.ledger.is_blocked() {
                    core.enforcer.on_exit(now);
                }
            }
        }
        (SignalKind::KeyDown, SignalPayload::Key(press)) => match classify_shortcut(&press) {
            ShortcutClass::DevTools => {
                signal.prevent_default();
                core.record(
                    AuditEventType::DevToolsAttempt,
                    &[Counter::Violations],
                    data("key", &press.combo()),
                );
            }
            ShortcutClass::CopyPaste if !allow_copy_paste => {
                signal.prevent_default();
                core.record(
                    AuditEventType::KeyboardShortcut,
                    &[Counter::Violations],
                    data("key", &press.combo()),
                );
            }
            _ => {}
        },
        (kind, payload) => {
            log::debug!("ignoring {:?} signal with payload {:?}", kind, payload);
        }
    }
}

fn data(key: &str, value: &str) -> Map<String, Value> {
    let mut map = Map::new();
    map.insert(key.to_string(), Value::from(value));
    map
}
