//! JSON-line host for a [`Runtime`].
//!
//! Reads one request per stdin line, drives the decay and phase timers, and
//! writes every outbound bus event and every reply as one JSON line on
//! stdout. Runs on a current-thread runtime: the core is `!Send`.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;
use std::time::Duration;

use anyhow::{Context, Result};
use mnemo_core::{
    CrossFrameMessage, Phase, PublishOptions, Runtime, Topic, TransitionOutcome, TransitionSource,
};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tokio::io::{AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

/// How often stabilization and failsafe deadlines are checked.
const PHASE_POLL_MS: u64 = 100;

#[derive(Debug, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Request {
    /// Publish on any channel, as a local collaborator.
    Publish {
        channel: String,
        #[serde(default)]
        data: Value,
    },
    /// Deliver a cross-frame message from `origin`.
    Frame {
        origin: String,
        message: CrossFrameMessage,
    },
    Visibility {
        state: String,
    },
    Navigate {
        path: String,
    },
    Transition {
        phase: Phase,
        #[serde(default = "manual")]
        source: TransitionSource,
    },
    Intensity {
        value: f64,
    },
    Hold,
    Release,
    /// Run a decay cycle now instead of waiting for the timer.
    Cycle,
    Metrics,
    Shutdown,
}

fn manual() -> TransitionSource {
    TransitionSource::Manual
}

#[derive(Debug, Serialize)]
struct Reply {
    reply: &'static str,
    ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

impl Reply {
    fn ok(reply: &'static str, result: Value) -> Self {
        Self {
            reply,
            ok: true,
            result: Some(result),
            error: None,
        }
    }

    fn err(reply: &'static str, error: impl ToString) -> Self {
        Self {
            reply,
            ok: false,
            result: None,
            error: Some(error.to_string()),
        }
    }
}

/// Lines waiting to be written to stdout.
pub type Outbox = Rc<RefCell<VecDeque<String>>>;

/// Subscribe to every outbound channel and queue each event as a JSON line.
pub fn attach_output(runtime: &Runtime) -> Result<Outbox> {
    let outbox: Outbox = Rc::new(RefCell::new(VecDeque::new()));
    for topic in Topic::OUTBOUND {
        let channel = runtime.bus().channel(topic).to_string();
        let sink = Rc::clone(&outbox);
        runtime
            .bus()
            .subscribe(&channel, move |envelope| {
                let line = serde_json::to_string(envelope)?;
                sink.borrow_mut().push_back(line);
                Ok(())
            })
            .with_context(|| format!("failed to subscribe to {channel}"))?;
    }
    Ok(outbox)
}

/// Apply one request. Returns the reply and whether the host should stop.
fn handle(runtime: &Runtime, request: Request) -> (Reply, bool) {
    let reply = match request {
        Request::Publish { channel, data } => {
            let notified = runtime.bus().publish_with(
                &channel,
                data,
                PublishOptions {
                    source: Some("stdin".into()),
                },
            );
            Reply::ok("publish", json!({ "notified": notified }))
        }
        Request::Frame { origin, message } => match runtime.receive_frame_message(&origin, message) {
            Ok(notified) => Reply::ok("frame", json!({ "notified": notified })),
            Err(e) => Reply::err("frame", e),
        },
        Request::Visibility { state } => {
            let channel = runtime.bus().channel(Topic::Visibility).to_string();
            let notified = runtime.bus().publish(&channel, json!({ "state": state }));
            Reply::ok("visibility", json!({ "notified": notified }))
        }
        Request::Navigate { path } => {
            let channel = runtime.bus().channel(Topic::Navigation).to_string();
            let notified = runtime.bus().publish(&channel, json!({ "path": path }));
            Reply::ok("navigate", json!({ "notified": notified }))
        }
        Request::Transition { phase, source } => match runtime.request_transition(phase, source) {
            Ok(TransitionOutcome::Unchanged) => Reply::ok("transition", json!({ "changed": false })),
            Ok(TransitionOutcome::Transitioned(record)) => {
                Reply::ok("transition", json!({ "changed": true, "record": record }))
            }
            Err(rejected) => Reply::err("transition", rejected.reason),
        },
        Request::Intensity { value } => {
            runtime.set_intensity(value);
            Reply::ok("intensity", json!(runtime.bus().state()))
        }
        Request::Hold => Reply::ok("hold", json!({ "held": runtime.hold_stabilization() })),
        Request::Release => {
            runtime.release_stabilization();
            Reply::ok("release", json!({ "inFlight": runtime.controller().is_in_flight() }))
        }
        Request::Cycle => match runtime.run_decay_cycle() {
            Some(report) => Reply::ok("cycle", json!(report)),
            None => Reply::err("cycle", "a decay cycle is already running"),
        },
        Request::Metrics => Reply::ok(
            "metrics",
            json!({ "state": runtime.bus().state(), "metrics": runtime.metrics() }),
        ),
        Request::Shutdown => return (Reply::ok("shutdown", Value::Null), true),
    };
    (reply, false)
}

fn handle_line(runtime: &Runtime, line: &str) -> (Reply, bool) {
    match serde_json::from_str::<Request>(line) {
        Ok(request) => handle(runtime, request),
        Err(e) => {
            tracing::warn!("invalid request: {e}");
            (Reply::err("invalid", format!("invalid request: {e}")), false)
        }
    }
}

async fn flush<W: AsyncWrite + Unpin>(out: &mut W, outbox: &Outbox) -> Result<()> {
    let lines: Vec<String> = outbox.borrow_mut().drain(..).collect();
    for line in lines {
        out.write_all(line.as_bytes()).await?;
        out.write_all(b"\n").await?;
    }
    out.flush().await?;
    Ok(())
}

fn queue_reply(outbox: &Outbox, reply: &Reply) {
    match serde_json::to_string(reply) {
        Ok(line) => outbox.borrow_mut().push_back(line),
        Err(e) => tracing::error!("failed to encode reply: {e}"),
    }
}

/// Serve until stdin closes, a shutdown request arrives or `cancel` fires.
/// A snapshot is written on the way out.
pub async fn serve(
    runtime: &Runtime,
    outbox: Outbox,
    cancel: CancellationToken,
    cycle_interval_ms: u64,
) -> Result<()> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdout = tokio::io::stdout();

    let mut decay = tokio::time::interval(Duration::from_millis(cycle_interval_ms.max(1)));
    decay.set_missed_tick_behavior(MissedTickBehavior::Skip);
    decay.tick().await;
    let mut phase = tokio::time::interval(Duration::from_millis(PHASE_POLL_MS));
    phase.set_missed_tick_behavior(MissedTickBehavior::Skip);

    flush(&mut stdout, &outbox).await?;
    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                tracing::info!("shutdown requested");
                break;
            }
            line = lines.next_line() => {
                let Some(line) = line.context("failed to read stdin")? else {
                    tracing::debug!("stdin closed");
                    break;
                };
                if line.trim().is_empty() {
                    continue;
                }
                let (reply, stop) = handle_line(runtime, &line);
                queue_reply(&outbox, &reply);
                if stop {
                    break;
                }
            }
            _ = decay.tick() => {
                if let Some(report) = runtime.run_decay_cycle() {
                    tracing::debug!(cycle = report.cycle, active = report.active, "decay cycle");
                }
            }
            _ = phase.tick() => runtime.poll_timers(),
        }
        flush(&mut stdout, &outbox).await?;
    }

    let durability = runtime.suspend();
    tracing::info!(?durability, "final snapshot written");
    flush(&mut stdout, &outbox).await?;
    Ok(())
}

/// Cancel `token` on Ctrl-C or, on unix, SIGTERM.
pub async fn watch_signals(token: CancellationToken) {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::warn!("failed to listen for ctrl-c: {e}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{SignalKind, signal};
        match signal(SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                tracing::warn!("failed to listen for SIGTERM: {e}");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
    token.cancel();
}
