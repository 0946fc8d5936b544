//! Session event streaming
//!
//! One bounded channel per session. Progress events (`tool_started`,
//! `content_delta`) are dropped when the client falls behind; terminal
//! events (`tool_completed`, `tool_error`, `done`) wait for room for as
//! long as the client stays connected. Sequence numbers are assigned on
//! enqueue, so the client always sees a gap-free, strictly increasing
//! sequence.

use crate::config::StreamConfig;
use crate::executor::ToolExecutor;
use crate::llm::LanguageModel;
use crate::models::{EventKind, Session, StreamEvent, ToolCallResult, ToolOutcome, ToolSpec};
use crate::selector::{SelectionResult, ToolSelector};
use futures::stream::{self, BoxStream, StreamExt};
use serde_json::{json, Value};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, error, info, warn};

/// Result of a single `emit`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EmitStatus {
    /// Enqueued with this sequence number.
    Delivered(u64),
    /// Buffer full (progress events only) or a second `done`.
    Dropped,
    /// Client gone; nothing more will be pushed.
    Cancelled,
}

/// Producer half of a session stream.
pub struct EventSink {
    session_id: uuid::Uuid,
    tx: mpsc::Sender<StreamEvent>,
    next_seq: Mutex<u64>,
    cancelled: AtomicBool,
    done_sent: AtomicBool,
    dropped: AtomicU64,
    slow_consumer_warning: Duration,
}

impl EventSink {
    pub async fn emit(&self, kind: EventKind, payload: Value) -> EmitStatus {
        if self.is_cancelled() {
            return EmitStatus::Cancelled;
        }
        if kind == EventKind::Done && self.done_sent.swap(true, Ordering::SeqCst) {
            warn!(session_id = %self.session_id, "Ignoring second done event");
            return EmitStatus::Dropped;
        }

        // Held across the reservation so enqueue order matches sequence order
        let mut next_seq = self.next_seq.lock().await;

        let permit = if kind.is_terminal() {
            match self.reserve_terminal(kind).await {
                Some(permit) => permit,
                None => return self.cancel("client disconnected"),
            }
        } else {
            match self.tx.try_reserve() {
                Ok(permit) => permit,
                Err(mpsc::error::TrySendError::Full(())) => {
                    self.dropped.fetch_add(1, Ordering::Relaxed);
                    debug!(session_id = %self.session_id, ?kind, "Stream buffer full, event dropped");
                    return EmitStatus::Dropped;
                }
                Err(mpsc::error::TrySendError::Closed(())) => {
                    return self.cancel("client disconnected")
                }
            }
        };

        let sequence_no = *next_seq;
        permit.send(StreamEvent {
            sequence_no,
            kind,
            payload,
        });
        *next_seq += 1;

        EmitStatus::Delivered(sequence_no)
    }

    /// Wait for buffer space until the receiver drains or goes away.
    async fn reserve_terminal(&self, kind: EventKind) -> Option<mpsc::Permit<'_, StreamEvent>> {
        let interval = self.slow_consumer_warning.max(Duration::from_millis(1));
        let mut waited = Duration::ZERO;
        loop {
            match tokio::time::timeout(interval, self.tx.reserve()).await {
                Ok(reserved) => return reserved.ok(),
                Err(_) => {
                    waited += interval;
                    warn!(
                        session_id = %self.session_id,
                        ?kind,
                        waited_ms = waited.as_millis() as u64,
                        "Client slow to drain stream, terminal event still waiting"
                    );
                }
            }
        }
    }

    fn cancel(&self, reason: &str) -> EmitStatus {
        if !self.cancelled.swap(true, Ordering::SeqCst) {
            info!(session_id = %self.session_id, reason, "Session stream cancelled");
        }
        EmitStatus::Cancelled
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst) || self.tx.is_closed()
    }

    /// Progress events dropped for backpressure so far.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    pub fn done_sent(&self) -> bool {
        self.done_sent.load(Ordering::SeqCst)
    }
}

/// Consumer half of a session stream. Dropping it disconnects the session.
pub struct EventSource {
    pub session: Session,
    pub selection: SelectionResult,
    rx: mpsc::Receiver<StreamEvent>,
}

impl EventSource {
    pub async fn recv(&mut self) -> Option<StreamEvent> {
        self.rx.recv().await
    }

    pub fn into_stream(self) -> BoxStream<'static, StreamEvent> {
        stream::unfold(self.rx, |mut rx| async move {
            rx.recv().await.map(|event| (event, rx))
        })
        .boxed()
    }

    /// Drain every event until the producer finishes.
    pub async fn collect(self) -> Vec<StreamEvent> {
        self.into_stream().collect().await
    }
}

pub struct StreamCoordinator {
    selector: Arc<ToolSelector>,
    executor: ToolExecutor,
    config: StreamConfig,
}

impl StreamCoordinator {
    pub fn new(selector: Arc<ToolSelector>, executor: ToolExecutor, config: StreamConfig) -> Self {
        Self {
            selector,
            executor,
            config,
        }
    }

    /// Create the bounded channel for a session.
    pub fn open(&self, session: Session, selection: SelectionResult) -> (Arc<EventSink>, EventSource) {
        let (tx, rx) = mpsc::channel(self.config.buffer_capacity.max(1));

        let sink = Arc::new(EventSink {
            session_id: session.session_id,
            tx,
            next_seq: Mutex::new(0),
            cancelled: AtomicBool::new(false),
            done_sent: AtomicBool::new(false),
            dropped: AtomicU64::new(0),
            slow_consumer_warning: self.config.slow_consumer_warning,
        });

        let source = EventSource {
            session,
            selection,
            rx,
        };
        (sink, source)
    }

    /// Select tools, open the session stream and spawn its pump. The
    /// returned source yields events until `done`.
    pub async fn run(self: &Arc<Self>, session: Session, llm: Arc<dyn LanguageModel>) -> EventSource {
        let catalog = self.executor.catalog();
        let selection = self.selector.select(&session.query, &catalog).await;

        let candidates: Vec<ToolSpec> = selection
            .candidates
            .iter()
            .filter_map(|c| catalog.iter().find(|s| s.name == c.name).cloned())
            .collect();

        let (sink, source) = self.open(session.clone(), selection);
        info!(
            session_id = %session.session_id,
            candidates = ?candidates.iter().map(|c| &c.name).collect::<Vec<_>>(),
            "Session started"
        );

        let this = Arc::clone(self);
        let pump_sink = Arc::clone(&sink);
        let pump = tokio::spawn(async move {
            this.pump(&pump_sink, &session, &candidates, llm).await;
        });

        // The pump owns `done`; a panic must still end the stream
        tokio::spawn(async move {
            if let Err(e) = pump.await {
                error!(error = %e, "Session pump failed");
                if !sink.done_sent() {
                    sink.emit(
                        EventKind::Done,
                        json!({ "status": "error", "error": "session pump failed" }),
                    )
                    .await;
                }
            }
        });

        source
    }

    async fn pump(
        &self,
        sink: &EventSink,
        session: &Session,
        candidates: &[ToolSpec],
        llm: Arc<dyn LanguageModel>,
    ) {
        let calls = match llm.plan_calls(&session.query, candidates).await {
            Ok(calls) => calls,
            Err(e) => {
                warn!(session_id = %session.session_id, error = %e, "LLM planning failed");
                sink.emit(
                    EventKind::Done,
                    json!({ "status": "error", "error": e.to_string(), "tool_calls": 0 }),
                )
                .await;
                return;
            }
        };

        let total = calls.len();
        debug!(session_id = %session.session_id, total, "Dispatching tool calls");

        // Dispatch before announcing so a disconnect never prevents the work
        let mut completions = self.executor.execute(calls.clone());

        for call in &calls {
            let status = sink
                .emit(
                    EventKind::ToolStarted,
                    json!({ "call_id": call.id, "tool": call.name, "arguments": call.arguments }),
                )
                .await;
            if status == EmitStatus::Cancelled {
                return;
            }
        }

        let mut results: Vec<ToolCallResult> = Vec::with_capacity(total);
        while let Some(result) = completions.next().await {
            let (kind, payload) = tool_event(&result);
            if sink.emit(kind, payload).await == EmitStatus::Cancelled {
                debug!(session_id = %session.session_id, "Client gone, abandoning stream");
                return;
            }
            results.push(result);
        }

        let completed = results.iter().filter(|r| r.outcome.is_success()).count();
        let mut failure: Option<String> = None;

        match llm.stream_answer(&session.query, &results).await {
            Ok(mut deltas) => {
                while let Some(delta) = deltas.next().await {
                    match delta {
                        Ok(text) => {
                            let status = sink
                                .emit(EventKind::ContentDelta, json!({ "delta": text }))
                                .await;
                            if status == EmitStatus::Cancelled {
                                return;
                            }
                        }
                        Err(e) => {
                            failure = Some(e.to_string());
                            break;
                        }
                    }
                }
            }
            Err(e) => failure = Some(e.to_string()),
        }

        let mut payload = json!({
            "status": if failure.is_some() { "error" } else { "ok" },
            "session_id": session.session_id,
            "tool_calls": total,
            "completed": completed,
            "failed": total - completed,
            "dropped_events": sink.dropped(),
        });
        if let Some(message) = &failure {
            warn!(session_id = %session.session_id, error = %message, "LLM answer failed");
            payload["error"] = json!(message);
        }

        sink.emit(EventKind::Done, payload).await;
        info!(session_id = %session.session_id, total, completed, "Session finished");
    }
}

fn tool_event(result: &ToolCallResult) -> (EventKind, Value) {
    let mut payload = json!({
        "call_id": result.call.id,
        "tool": result.call.name,
        "state": result.call.state,
        "elapsed_ms": result.elapsed_ms,
        "deduplicated": result.deduplicated,
    });

    match &result.outcome {
        ToolOutcome::CacheHit { value } | ToolOutcome::Completed { value } => {
            payload["result"] = value.clone();
            (EventKind::ToolCompleted, payload)
        }
        ToolOutcome::Error { kind, message } => {
            payload["error"] = json!({ "kind": kind, "message": message });
            (EventKind::ToolError, payload)
        }
        ToolOutcome::TimedOut => {
            payload["error"] = json!({ "kind": "timeout", "message": "per-call budget exceeded" });
            (EventKind::ToolError, payload)
        }
    }
}
