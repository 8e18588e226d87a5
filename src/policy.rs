use crate::ledger::LedgerSnapshot;
use crate::{BlockReason, ProctoringSettings};

/// Threshold evaluation against the ledger. Pure: no state, no I/O.
pub struct BlockingPolicy;

impl BlockingPolicy {
    /// True iff any configured threshold is met or exceeded.
    pub fn evaluate(
        settings: &ProctoringSettings,
        tab_switch_count: u32,
        violation_count: u32,
        fullscreen_exit_count: u32,
    ) -> bool {
        Self::reason(
            settings,
            &LedgerSnapshot {
                tab_switches: tab_switch_count,
                violations: violation_count,
                fullscreen_exits: fullscreen_exit_count,
            },
        )
        .is_some()
    }

    /// The first threshold that trips, checked in tab-switch, violation,
    /// fullscreen-exit order.
    pub fn reason(settings: &ProctoringSettings, counts: &LedgerSnapshot) -> Option<BlockReason> {
        let met = |limit: Option<u32>, count: u32| limit.is_some_and(|limit| count >= limit);
        if met(settings.max_tab_switches, counts.tab_switches) {
            return Some(BlockReason::MaxTabSwitches);
        }
        if met(settings.max_violations, counts.violations) {
            return Some(BlockReason::MaxViolations);
        }
        if met(settings.max_fullscreen_exits, counts.fullscreen_exits) {
            return Some(BlockReason::MaxFullscreenExits);
        }
        None
    }
}
