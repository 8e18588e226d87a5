//! proctor_replay - drive a monitor from a scripted signal sequence
//!
//! Each script line is one JSON step, e.g. `{"signal":"hidden"}`,
//! `{"signal":"key","key":"c","ctrl":true}` or `{"signal":"wait","ms":1200}`.
//! The monitor state after every step is written to stdout as JSON.

use anyhow::{anyhow, Context, Result};
use clap::Parser;
use serde::Deserialize;
use std::cell::Cell;
use std::io::{BufRead, BufReader};
use std::rc::Rc;
use std::sync::Arc;
use std::time::Duration;

use proctor_monitor::{
    AuditTransport, FullscreenControl, HttpAuditTransport, KeyPress, LocalEventSource,
    MemoryAuditTransport, MonitorConfig, MonitorDeps, ProctoringMonitor, ProctoringSettings,
    SessionId, Signal, SqliteKeyValueStore,
};

#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Args {
    /// Test identifier (scopes the persisted ledger).
    #[arg(long)]
    test_id: String,
    /// Participant bearer token for the audit endpoint.
    #[arg(long, env = "PROCTOR_AUDIT_TOKEN", hide_env_values = true)]
    token: Option<String>,
    /// JSON file with the test's proctoring settings.
    #[arg(long)]
    settings: String,
    /// JSON-lines signal script.
    #[arg(long)]
    script: String,
    /// Record audit reports locally and print them instead of posting.
    #[arg(long)]
    dry_run: bool,
    /// Start with the window already in fullscreen.
    #[arg(long)]
    fullscreen: bool,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "signal", rename_all = "snake_case")]
enum Step {
    Hidden,
    Visible,
    Blur,
    Copy,
    Cut,
    Paste,
    ContextMenu,
    FullscreenExit,
    FullscreenEnter,
    Key(KeyPress),
    Wait { ms: u64 },
    Submit,
}

/// Fullscreen state driven by the script's enter/exit steps. A request
/// succeeds and enters fullscreen.
#[derive(Clone)]
struct ScriptFullscreen {
    active: Rc<Cell<bool>>,
}

impl FullscreenControl for ScriptFullscreen {
    fn is_fullscreen(&self) -> bool {
        self.active.get()
    }

    fn request_fullscreen(&mut self) -> Result<()> {
        log::info!("fullscreen requested");
        self.active.set(true);
        Ok(())
    }
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();
    let cfg = MonitorConfig::load()?;

    let settings_raw = std::fs::read_to_string(&args.settings)
        .with_context(|| format!("read settings file {}", args.settings))?;
    let settings = ProctoringSettings::from_json(&settings_raw)?;

    let token = args
        .token
        .clone()
        .or_else(|| cfg.audit.token.clone())
        .unwrap_or_default();
    let session = SessionId::new(&args.test_id, &token)?;

    let recorder = MemoryAuditTransport::new();
    let audit: Arc<dyn AuditTransport> = if args.dry_run {
        Arc::new(recorder.clone())
    } else {
        if token.trim().is_empty() {
            return Err(anyhow!(
                "an audit token is required unless --dry-run is given"
            ));
        }
        let transport = HttpAuditTransport::new(&cfg.audit.url, &token, cfg.audit.timeout)?;
        log::info!("audit reports go to {}", transport.endpoint());
        Arc::new(transport)
    };

    let source = LocalEventSource::new();
    let fullscreen_active = Rc::new(Cell::new(args.fullscreen));
    let mut monitor = ProctoringMonitor::new(
        session,
        Some(settings),
        MonitorDeps {
            store: Box::new(SqliteKeyValueStore::open(&cfg.db_path)?),
            source: Box::new(source.clone()),
            fullscreen: Box::new(ScriptFullscreen {
                active: fullscreen_active.clone(),
            }),
            audit: Some(audit),
        },
        cfg.monitor_options(),
    );

    if !monitor.activate() {
        log::warn!("monitor did not attach (disabled settings or session already blocked)");
    }
    print_state(&monitor, "activate")?;

    let script = std::fs::File::open(&args.script)
        .with_context(|| format!("open script {}", args.script))?;
    for (idx, line) in BufReader::new(script).lines().enumerate() {
        let line = line?;
        if line.trim().is_empty() || line.trim_start().starts_with('#') {
            continue;
        }
        let step: Step = serde_json::from_str(&line)
            .with_context(|| format!("script line {}: invalid step", idx + 1))?;
        let label = format!("{:?}", step);
        match step {
            Step::Hidden => {
                source.dispatch(Signal::visibility(true));
            }
            Step::Visible => {
                source.dispatch(Signal::visibility(false));
            }
            Step::Blur => {
                source.dispatch(Signal::blur());
            }
            Step::Copy => {
                source.dispatch(Signal::copy());
            }
            Step::Cut => {
                source.dispatch(Signal::cut());
            }
            Step::Paste => {
                source.dispatch(Signal::paste());
            }
            Step::ContextMenu => {
                source.dispatch(Signal::context_menu());
            }
            Step::FullscreenExit => {
                fullscreen_active.set(false);
                source.dispatch(Signal::fullscreen(false));
            }
            Step::FullscreenEnter => {
                fullscreen_active.set(true);
                source.dispatch(Signal::fullscreen(true));
            }
            Step::Key(press) => {
                let signal = source.dispatch(Signal::key(press));
                log::debug!("key default prevented: {}", signal.default_prevented());
            }
            Step::Wait { ms } => std::thread::sleep(Duration::from_millis(ms)),
            Step::Submit => monitor.reset(),
        }
        monitor.tick();
        print_state(&monitor, &label)?;
    }

    monitor.wait_for_audit(Duration::from_secs(10));
    monitor.tick();
    print_state(&monitor, "final")?;
    monitor.teardown();

    if args.dry_run {
        for report in recorder.reports() {
            println!("{}", serde_json::to_string(&report)?);
        }
    }
    Ok(())
}

fn print_state(monitor: &ProctoringMonitor, step: &str) -> Result<()> {
    let state = serde_json::to_value(monitor.state())?;
    println!("{}", serde_json::json!({ "step": step, "state": state }));
    Ok(())
}
