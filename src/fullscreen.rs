//! Fullscreen compliance.
//!
//! Requests are never issued inline from a signal handler: they are
//! scheduled with a deadline and fired from the monitor's lifecycle tick.
//! At most one request is pending at any time.

use anyhow::{anyhow, Result};
use std::time::{Duration, Instant};

/// Platform fullscreen API.
pub trait FullscreenControl {
    fn is_fullscreen(&self) -> bool;

    fn request_fullscreen(&mut self) -> Result<()>;
}

/// A platform with no fullscreen API. Every request fails, so enforcement
/// runs in warning-only mode.
#[derive(Clone, Copy, Debug, Default)]
pub struct HeadlessFullscreen;

impl FullscreenControl for HeadlessFullscreen {
    fn is_fullscreen(&self) -> bool {
        false
    }

    fn request_fullscreen(&mut self) -> Result<()> {
        Err(anyhow!("fullscreen is not supported on this platform"))
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RequestKind {
    Initial,
    Retry,
}

#[derive(Clone, Copy, Debug)]
struct PendingRequest {
    due: Instant,
    kind: RequestKind,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FireOutcome {
    Idle,
    Requested(RequestKind),
    AlreadyFullscreen,
    Failed(RequestKind),
}

pub struct FullscreenEnforcer {
    control: Box<dyn FullscreenControl>,
    initial_delay: Duration,
    retry_delay: Duration,
    pending: Option<PendingRequest>,
    warning_only: bool,
}

impl FullscreenEnforcer {
    pub fn new(
        control: Box<dyn FullscreenControl>,
        initial_delay: Duration,
        retry_delay: Duration,
    ) -> Self {
        Self {
            control,
            initial_delay,
            retry_delay,
            pending: None,
            warning_only: false,
        }
    }

    pub fn is_fullscreen(&self) -> bool {
        self.control.is_fullscreen()
    }

    /// Once a request has been refused the enforcer stops prompting and
    /// only the warning flag remains.
    pub fn is_warning_only(&self) -> bool {
        self.warning_only
    }

    pub fn pending_due(&self) -> Option<Instant> {
        self.pending.map(|p| p.due)
    }

    /// Schedules the first request of a session when fullscreen is
    /// required and not already active. The delay keeps the request clear
    /// of the initial paint, where browsers reject it.
    pub fn on_activate(&mut self, now: Instant, required: bool) -> bool {
        if !required || self.control.is_fullscreen() {
            return false;
        }
        self.schedule(now + self.initial_delay, RequestKind::Initial)
    }

    /// Schedules the single re-request after an unexpected exit.
    pub fn on_exit(&mut self, now: Instant) -> bool {
        self.schedule(now + self.retry_delay, RequestKind::Retry)
    }

    /// Compliance restored; nothing left to request.
    pub fn on_restore(&mut self) {
        self.cancel();
    }

    /// Drops the pending request, if any. Returns whether one was pending.
    pub fn cancel(&mut self) -> bool {
        match self.pending.take() {
            Some(pending) => {
                log::debug!("cancelled pending {:?} fullscreen request", pending.kind);
                true
            }
            None => false,
        }
    }

    /// Fires the pending request once its deadline has passed.
    pub fn poll(&mut self, now: Instant) -> FireOutcome {
        let Some(pending) = self.pending else {
            return FireOutcome::Idle;
        };
        if now < pending.due {
            return FireOutcome::Idle;
        }
        self.pending = None;
        if self.control.is_fullscreen() {
            return FireOutcome::AlreadyFullscreen;
        }
        match self.control.request_fullscreen() {
            Ok(()) => {
                log::debug!("{:?} fullscreen request issued", pending.kind);
                FireOutcome::Requested(pending.kind)
            }
            Err(e) => {
                log::warn!(
                    "fullscreen request failed ({}); continuing in warning-only mode",
                    e
                );
                self.warning_only = true;
                FireOutcome::Failed(pending.kind)
            }
        }
    }

    fn schedule(&mut self, due: Instant, kind: RequestKind) -> bool {
        if self.warning_only || self.pending.is_some() {
            return false;
        }
        log::debug!("scheduling {:?} fullscreen request", kind);
        self.pending = Some(PendingRequest { due, kind });
        true
    }
}
