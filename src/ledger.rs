//! Violation ledger: per-session counters persisted on every mutation.
//!
//! Storage layout (decimal-integer strings):
//!
//! - `proctoring_<testId>_tabSwitches`
//! - `proctoring_<testId>_violations`
//! - `proctoring_<testId>_fullscreenExits`
//! - `proctoring_<testId>_seal` (hex SHA-256 over the test id and counters)
//!
//! The in-memory counters are authoritative for a live session. A failed
//! storage write is logged and the session continues on memory alone.

use serde::Serialize;
use sha2::{Digest, Sha256};

use crate::storage::KeyValueStore;
use crate::{BlockReason, SessionId};

const KEY_PREFIX: &str = "proctoring_";
const SEAL_SUFFIX: &str = "seal";

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Counter {
    TabSwitches,
    Violations,
    FullscreenExits,
}

impl Counter {
    pub const ALL: [Counter; 3] = [
        Counter::TabSwitches,
        Counter::Violations,
        Counter::FullscreenExits,
    ];

    fn key_suffix(self) -> &'static str {
        match self {
            Counter::TabSwitches => "tabSwitches",
            Counter::Violations => "violations",
            Counter::FullscreenExits => "fullscreenExits",
        }
    }
}

pub fn storage_key(test_id: &str, counter: Counter) -> String {
    format!("{}{}_{}", KEY_PREFIX, test_id, counter.key_suffix())
}

pub fn seal_key(test_id: &str) -> String {
    format!("{}{}_{}", KEY_PREFIX, test_id, SEAL_SUFFIX)
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct LedgerSnapshot {
    pub tab_switches: u32,
    pub violations: u32,
    pub fullscreen_exits: u32,
}

impl LedgerSnapshot {
    pub fn get(&self, counter: Counter) -> u32 {
        match counter {
            Counter::TabSwitches => self.tab_switches,
            Counter::Violations => self.violations,
            Counter::FullscreenExits => self.fullscreen_exits,
        }
    }

    fn slot(&mut self, counter: Counter) -> &mut u32 {
        match counter {
            Counter::TabSwitches => &mut self.tab_switches,
            Counter::Violations => &mut self.violations,
            Counter::FullscreenExits => &mut self.fullscreen_exits,
        }
    }

    pub fn is_zero(&self) -> bool {
        self.tab_switches == 0 && self.violations == 0 && self.fullscreen_exits == 0
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SealStatus {
    /// Seal present and matching the stored counters.
    Valid,
    /// No seal stored. Harmless for a fresh session; with non-zero
    /// counters the seal key was removed or never written.
    Missing,
    /// Seal present but the counters were edited behind the monitor's back.
    Mismatch,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LoadOutcome {
    pub snapshot: LedgerSnapshot,
    pub seal: SealStatus,
}

pub struct ViolationLedger {
    test_id: String,
    store: Box<dyn KeyValueStore>,
    counts: LedgerSnapshot,
    blocked: Option<BlockReason>,
    fullscreen_warning: bool,
}

impl ViolationLedger {
    /// Opens the ledger for `session`, reading any counts persisted by an
    /// earlier page load. Missing or unparsable values read as zero.
    pub fn load(session: &SessionId, store: Box<dyn KeyValueStore>) -> (Self, LoadOutcome) {
        let mut ledger = Self {
            test_id: session.test_id().to_string(),
            store,
            counts: LedgerSnapshot::default(),
            blocked: None,
            fullscreen_warning: false,
        };
        for counter in Counter::ALL {
            *ledger.counts.slot(counter) = ledger.read_counter(counter);
        }
        let seal = ledger.check_seal();
        match seal {
            SealStatus::Mismatch => log::warn!(
                "ledger seal mismatch for test {}: stored counters were modified",
                ledger.test_id
            ),
            SealStatus::Missing if !ledger.counts.is_zero() => log::warn!(
                "ledger for test {} has counters but no seal",
                ledger.test_id
            ),
            _ => {}
        }
        let outcome = LoadOutcome {
            snapshot: ledger.counts,
            seal,
        };
        (ledger, outcome)
    }

    /// Gives the backing store back, e.g. to reopen the ledger later.
    pub fn into_store(self) -> Box<dyn KeyValueStore> {
        self.store
    }

    pub fn test_id(&self) -> &str {
        &self.test_id
    }

    pub fn snapshot(&self) -> LedgerSnapshot {
        self.counts
    }

    pub fn count(&self, counter: Counter) -> u32 {
        self.counts.get(counter)
    }

    /// Increments `counter`, persists every counter, and returns the new
    /// value.
    pub fn increment(&mut self, counter: Counter) -> u32 {
        let slot = self.counts.slot(counter);
        *slot = slot.saturating_add(1);
        let value = *slot;
        self.persist();
        value
    }

    /// Zeroes every counter, clears the session flags, and removes the
    /// stored keys.
    pub fn reset(&mut self) {
        self.counts = LedgerSnapshot::default();
        self.blocked = None;
        self.fullscreen_warning = false;
        self.clear_storage();
    }

    /// Removes the stored keys while leaving the in-memory state untouched.
    pub fn clear_storage(&mut self) {
        let mut keys: Vec<String> = Counter::ALL
            .iter()
            .map(|&counter| storage_key(&self.test_id, counter))
            .collect();
        keys.push(seal_key(&self.test_id));
        for key in keys {
            if let Err(e) = self.store.remove(&key) {
                log::warn!("ledger storage remove failed for {}: {}", key, e);
            }
        }
    }

    pub fn blocked(&self) -> Option<BlockReason> {
        self.blocked
    }

    pub fn is_blocked(&self) -> bool {
        self.blocked.is_some()
    }

    /// Marks the session blocked. Returns `true` only on the transition;
    /// an already-blocked session keeps its first reason.
    pub fn block(&mut self, reason: BlockReason) -> bool {
        if self.blocked.is_some() {
            return false;
        }
        self.blocked = Some(reason);
        self.fullscreen_warning = false;
        true
    }

    pub fn fullscreen_warning(&self) -> bool {
        self.fullscreen_warning
    }

    pub fn set_fullscreen_warning(&mut self, warning: bool) {
        self.fullscreen_warning = warning && self.blocked.is_none();
    }

    fn read_counter(&self, counter: Counter) -> u32 {
        let key = storage_key(&self.test_id, counter);
        match self.store.get(&key) {
            Ok(Some(raw)) => raw.trim().parse::<u32>().unwrap_or_else(|_| {
                log::debug!("ledger value for {} is not a count; reading as 0", key);
                0
            }),
            Ok(None) => 0,
            Err(e) => {
                log::warn!("ledger storage read failed for {}: {}", key, e);
                0
            }
        }
    }

    fn check_seal(&self) -> SealStatus {
        match self.store.get(&seal_key(&self.test_id)) {
            Ok(Some(stored)) if stored == seal_digest(&self.test_id, &self.counts) => {
                SealStatus::Valid
            }
            Ok(Some(_)) => SealStatus::Mismatch,
            Ok(None) => SealStatus::Missing,
            Err(e) => {
                log::warn!("ledger seal read failed for test {}: {}", self.test_id, e);
                SealStatus::Missing
            }
        }
    }

    fn persist(&mut self) {
        let mut writes: Vec<(String, String)> = Counter::ALL
            .iter()
            .map(|&counter| {
                (
                    storage_key(&self.test_id, counter),
                    self.counts.get(counter).to_string(),
                )
            })
            .collect();
        writes.push((
            seal_key(&self.test_id),
            seal_digest(&self.test_id, &self.counts),
        ));
        for (key, value) in writes {
            if let Err(e) = self.store.set(&key, &value) {
                log::warn!("ledger storage write failed for {}: {}", key, e);
            }
        }
    }
}

pub fn seal_digest(test_id: &str, counts: &LedgerSnapshot) -> String {
    let mut hasher = Sha256::new();
    hasher.update(b"proctoring-ledger:v1");
    hasher.update(test_id.as_bytes());
    hasher.update(counts.tab_switches.to_be_bytes());
    hasher.update(counts.violations.to_be_bytes());
    hasher.update(counts.fullscreen_exits.to_be_bytes());
    hex::encode(hasher.finalize())
}
