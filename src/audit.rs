//! Remote audit log.
//!
//! Reports are handed to a worker thread and the caller never waits for
//! the outcome. Delivery is best effort: a failed post is logged and
//! dropped. The one thing that flows back is the server's `flagged`
//! verdict, delivered over a channel that the monitor drains on its own
//! schedule.

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use url::Url;
use zeroize::Zeroizing;

use crate::AuditEventType;

pub const AUDIT_LOG_PATH: &str = "proctoring/log";

/// Body of `POST /proctoring/log`.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct AuditReport {
    pub test_id: String,
    pub event_type: AuditEventType,
    pub event_data: Map<String, Value>,
}

impl AuditReport {
    pub fn new(test_id: &str, event_type: AuditEventType, event_data: Map<String, Value>) -> Self {
        Self {
            test_id: test_id.to_string(),
            event_type,
            event_data,
        }
    }

    pub fn data_u64(&self, key: &str) -> Option<u64> {
        self.event_data.get(key).and_then(Value::as_u64)
    }
}

/// Optional response shape. `flagged = true` forces the session blocked.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct AuditResponse {
    pub success: bool,
    pub flagged: bool,
}

pub trait AuditTransport: Send + Sync {
    fn post(&self, report: &AuditReport) -> Result<AuditResponse>;
}

pub struct HttpAuditTransport {
    endpoint: Url,
    token: Zeroizing<String>,
    agent: ureq::Agent,
}

impl HttpAuditTransport {
    /// `base_url` is the API root; reports go to `<base_url>/proctoring/log`.
    pub fn new(base_url: &str, token: &str, timeout: Duration) -> Result<Self> {
        let endpoint = audit_endpoint(base_url)?;
        if token.trim().is_empty() {
            return Err(anyhow!("audit bearer token must not be empty"));
        }
        let agent = ureq::AgentBuilder::new().timeout(timeout).build();
        Ok(Self {
            endpoint,
            token: Zeroizing::new(token.trim().to_string()),
            agent,
        })
    }

    pub fn endpoint(&self) -> &Url {
        &self.endpoint
    }
}

impl AuditTransport for HttpAuditTransport {
    fn post(&self, report: &AuditReport) -> Result<AuditResponse> {
        let bearer = Zeroizing::new(format!("Bearer {}", self.token.as_str()));
        let response = self
            .agent
            .post(self.endpoint.as_str())
            .set("Authorization", bearer.as_str())
            .send_json(report)
            .with_context(|| format!("post {} to audit endpoint", report.event_type.as_str()))?;
        let body = response.into_string().context("read audit response")?;
        Ok(parse_audit_response(&body))
    }
}

pub fn audit_endpoint(base_url: &str) -> Result<Url> {
    let mut base = base_url.trim().to_string();
    if !base.ends_with('/') {
        base.push('/');
    }
    let base = Url::parse(&base).map_err(|e| anyhow!("invalid audit url {}: {}", base_url, e))?;
    if base.scheme() != "http" && base.scheme() != "https" {
        return Err(anyhow!("audit url must use http or https: {}", base_url));
    }
    Ok(base.join(AUDIT_LOG_PATH)?)
}

/// The response body is optional; anything that is not the documented
/// shape reads as "accepted, not flagged".
pub fn parse_audit_response(body: &str) -> AuditResponse {
    if body.trim().is_empty() {
        return AuditResponse {
            success: true,
            flagged: false,
        };
    }
    serde_json::from_str(body).unwrap_or_else(|e| {
        log::debug!("audit response is not JSON ({}); treating as accepted", e);
        AuditResponse {
            success: true,
            flagged: false,
        }
    })
}

/// Records reports in memory instead of sending them. Used for dry runs
/// and as a test double; `flag_on` makes the given event type come back
/// flagged.
#[derive(Clone, Default)]
pub struct MemoryAuditTransport {
    reports: Arc<Mutex<Vec<AuditReport>>>,
    flag_on: Arc<Mutex<Option<AuditEventType>>>,
    fail: Arc<Mutex<bool>>,
}

impl MemoryAuditTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn flag_on(&self, event_type: AuditEventType) {
        if let Ok(mut slot) = self.flag_on.lock() {
            *slot = Some(event_type);
        }
    }

    pub fn fail_posts(&self, fail: bool) {
        if let Ok(mut slot) = self.fail.lock() {
            *slot = fail;
        }
    }

    pub fn reports(&self) -> Vec<AuditReport> {
        self.reports
            .lock()
            .map(|reports| reports.clone())
            .unwrap_or_default()
    }

    pub fn reports_of(&self, event_type: AuditEventType) -> Vec<AuditReport> {
        self.reports()
            .into_iter()
            .filter(|report| report.event_type == event_type)
            .collect()
    }
}

impl AuditTransport for MemoryAuditTransport {
    fn post(&self, report: &AuditReport) -> Result<AuditResponse> {
        let failing = *self
            .fail
            .lock()
            .map_err(|_| anyhow!("audit transport lock poisoned"))?;
        if failing {
            return Err(anyhow!("connection refused"));
        }
        self.reports
            .lock()
            .map_err(|_| anyhow!("audit transport lock poisoned"))?
            .push(report.clone());
        let flag_on = *self
            .flag_on
            .lock()
            .map_err(|_| anyhow!("audit transport lock poisoned"))?;
        Ok(AuditResponse {
            success: true,
            flagged: flag_on == Some(report.event_type),
        })
    }
}

pub struct AuditReporter {
    sender: Option<Sender<AuditReport>>,
    flagged: Option<Receiver<AuditEventType>>,
    in_flight: Arc<AtomicUsize>,
}

impl AuditReporter {
    pub fn spawn(transport: Arc<dyn AuditTransport>) -> Self {
        let (sender, reports) = mpsc::channel::<AuditReport>();
        let (flag_tx, flagged) = mpsc::channel();
        let in_flight = Arc::new(AtomicUsize::new(0));
        let in_flight_worker = in_flight.clone();
        std::thread::spawn(move || {
            for report in reports {
                match transport.post(&report) {
                    Ok(response) => {
                        if response.flagged {
                            log::warn!(
                                "audit endpoint flagged session for test {} on {}",
                                report.test_id,
                                report.event_type.as_str()
                            );
                            if flag_tx.send(report.event_type).is_err() {
                                log::debug!("reporter gone; flag for test {} not delivered", report.test_id);
                            }
                        }
                    }
                    Err(e) => {
                        log::warn!(
                            "audit report {} dropped: {:#}",
                            report.event_type.as_str(),
                            e
                        );
                    }
                }
                in_flight_worker.fetch_sub(1, Ordering::SeqCst);
            }
        });
        Self {
            sender: Some(sender),
            flagged: Some(flagged),
            in_flight,
        }
    }

    /// A reporter with nowhere to send; every report is discarded.
    pub fn disabled() -> Self {
        Self {
            sender: None,
            flagged: None,
            in_flight: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Queues `report` and returns immediately.
    pub fn send(&self, report: AuditReport) {
        let Some(sender) = &self.sender else {
            log::debug!("audit disabled; {} not sent", report.event_type.as_str());
            return;
        };
        self.in_flight.fetch_add(1, Ordering::SeqCst);
        if let Err(mpsc::SendError(report)) = sender.send(report) {
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            log::warn!(
                "audit worker gone; {} not sent",
                report.event_type.as_str()
            );
        }
    }

    /// First server-flagged event received since the last call, if any.
    pub fn take_flagged(&self) -> Option<AuditEventType> {
        let flagged = self.flagged.as_ref()?;
        let mut first = None;
        while let Ok(event_type) = flagged.try_recv() {
            first.get_or_insert(event_type);
        }
        first
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    /// Waits until every queued report has been posted or dropped. Hosts
    /// never need this; it exists for tests and the replay tool.
    pub fn wait_idle(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        while self.in_flight() > 0 {
            if Instant::now() >= deadline {
                return false;
            }
            std::thread::sleep(Duration::from_millis(2));
        }
        true
    }

    /// Closes the queue. The detached worker posts what is left and then
    /// exits; nothing here waits on the network.
    pub fn shutdown(&mut self) {
        if self.sender.take().is_some() {
            log::debug!("audit queue closed with {} report(s) in flight", self.in_flight());
        }
    }
}

impl Drop for AuditReporter {
    fn drop(&mut self) {
        self.shutdown();
    }
}
