use super::admission::{AdmissionRequest, Gatekeeper, SessionPermit};
use crate::bus::{EventBus, EventCallback, StatsCallback, StatsEntry, TelemetryEvent, Unsubscribe};
use crate::error::{Result, WardenError};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use futures_util::stream::{self, Stream, StreamExt};
use serde::Serialize;
use serde_json::json;
use std::convert::Infallible;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

/// Item queued by bus callbacks for one session
enum Outbound {
    Event(TelemetryEvent),
    Stats(Arc<Vec<StatsEntry>>),
    Close(&'static str),
}

/// Sends a close frame when the bus drops this session's callback without the session ending
struct DetachNotice(mpsc::Sender<Outbound>);

impl DetachNotice {
    fn forward(&self, item: Outbound) {
        if self.0.try_send(item).is_err() {
            tracing::debug!("observer queue full, dropping stream item");
        }
    }
}

impl Drop for DetachNotice {
    fn drop(&mut self) {
        let _ = self.0.try_send(Outbound::Close("detached"));
    }
}

/// Numbers the events of one stream from 1
#[derive(Debug, Default)]
struct Sequence {
    last: u64,
}

impl Sequence {
    fn event<T: Serialize>(&mut self, name: &str, data: &T) -> Event {
        self.last += 1;
        let id = self.last.to_string();
        Event::default()
            .id(&id)
            .event(name)
            .json_data(data)
            .unwrap_or_else(|e| {
                tracing::warn!(event = name, "failed to serialize stream payload: {}", e);
                Event::default().id(id).event(name).data("null")
            })
    }
}

/// Everything a live session owns; dropping it unsubscribes and frees the counters
struct SessionState {
    id: u64,
    rx: mpsc::Receiver<Outbound>,
    seq: Sequence,
    shutdown: watch::Receiver<bool>,
    done: bool,
    _subscription: Unsubscribe,
    permit: SessionPermit,
}

impl Drop for SessionState {
    fn drop(&mut self) {
        tracing::debug!(session = self.id, subject = %self.permit.subject(), "stream session closed");
    }
}

/// Events of one admitted stream; responds as `text/event-stream` with keep-alive comments
pub struct SessionStream {
    id: u64,
    heartbeat: Duration,
    inner: Pin<Box<dyn Stream<Item = Event> + Send>>,
}

impl SessionStream {
    pub fn id(&self) -> u64 {
        self.id
    }
}

impl Stream for SessionStream {
    type Item = std::result::Result<Event, Infallible>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.inner.as_mut().poll_next(cx).map(|frame| frame.map(Ok))
    }
}

impl IntoResponse for SessionStream {
    fn into_response(self) -> Response {
        let keep_alive = KeepAlive::new().interval(self.heartbeat).text("hb");
        (
            [("x-accel-buffering", "no")],
            Sse::new(self).keep_alive(keep_alive),
        )
            .into_response()
    }
}

fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

async fn next_frame(mut state: SessionState) -> Option<(Event, SessionState)> {
    if state.done {
        return None;
    }

    // A receiver subscribed after close_all never sees `changed()`
    if *state.shutdown.borrow_and_update() {
        state.done = true;
        let close = state.seq.event("close", &json!({ "reason": "server-shutdown" }));
        return Some((close, state));
    }

    let frame = tokio::select! {
        biased;
        _ = state.shutdown.changed() => {
            state.done = true;
            state.seq.event("close", &json!({ "reason": "server-shutdown" }))
        }
        item = state.rx.recv() => match item {
            Some(Outbound::Event(event)) => state.seq.event(event.event_name(), &event),
            Some(Outbound::Stats(stats)) => state.seq.event("processes", &*stats),
            Some(Outbound::Close(reason)) => {
                state.done = true;
                state.seq.event("close", &json!({ "reason": reason }))
            }
            None => {
                state.done = true;
                state.seq.event("close", &json!({ "reason": "closed" }))
            }
        },
    };

    Some((frame, state))
}

/// Opens admitted streams on top of the event bus and ends them all on shutdown
pub struct StreamHub {
    bus: EventBus,
    gate: Gatekeeper,
    shutdown: watch::Sender<bool>,
    next_id: AtomicU64,
}

impl StreamHub {
    pub fn new(bus: EventBus, gate: Gatekeeper) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            bus,
            gate,
            shutdown,
            next_id: AtomicU64::new(1),
        }
    }

    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    pub fn gate(&self) -> &Gatekeeper {
        &self.gate
    }

    /// Streams currently open
    pub fn active(&self) -> usize {
        self.gate.counters().global()
    }

    fn ensure_open(&self) -> Result<()> {
        if *self.shutdown.borrow() {
            return Err(WardenError::SubscriptionFailed(
                "stream hub is shutting down".to_string(),
            ));
        }
        Ok(())
    }

    /// Live telemetry of one process, preceded by `hello` and the process's backlog
    pub fn open_process_stream(&self, request: &AdmissionRequest<'_>, process: &str) -> Result<SessionStream> {
        self.ensure_open()?;
        let admitted = self.gate.admit(request, Some(process))?;

        let (tx, rx) = mpsc::channel(self.gate.config().session_buffer.max(1));
        let notice = DetachNotice(tx);
        let callback: EventCallback = Arc::new(move |event: &TelemetryEvent| {
            notice.forward(Outbound::Event(event.clone()));
        });
        // A failed subscribe drops the permit here, returning the slots
        let subscription = self.bus.subscribe(process, callback)?;

        let mut seq = Sequence::default();
        let mut initial = vec![
            Event::default().retry(self.gate.config().retry),
            seq.event(
                "hello",
                &json!({ "subject": admitted.claims.subject, "process": process, "ts": now_ms() }),
            ),
        ];
        initial.extend(
            subscription
                .initial
                .iter()
                .map(|event| seq.event(event.event_name(), event)),
        );

        Ok(self.assemble(initial, seq, rx, subscription.handle, admitted.permit))
    }

    /// Periodic fleet snapshots, preceded by `hello` and the latest (or a fresh) snapshot
    pub async fn open_all_stream(&self, request: &AdmissionRequest<'_>) -> Result<SessionStream> {
        self.ensure_open()?;
        let admitted = self.gate.admit(request, None)?;

        let (tx, rx) = mpsc::channel(self.gate.config().session_buffer.max(1));
        let notice = DetachNotice(tx);
        let callback: StatsCallback = Arc::new(move |stats: Arc<Vec<StatsEntry>>| {
            notice.forward(Outbound::Stats(stats));
        });
        let handle = self.bus.subscribe_all(callback)?;

        let mut seq = Sequence::default();
        let mut initial = vec![
            Event::default().retry(self.gate.config().retry),
            seq.event(
                "hello",
                &json!({ "subject": admitted.claims.subject, "ts": now_ms() }),
            ),
        ];

        let snapshot = match self.bus.latest_stats() {
            Some(stats) => Some(stats),
            None => match self.bus.get_snapshot().await {
                Ok(stats) => Some(Arc::new(stats)),
                Err(e) => {
                    tracing::warn!("initial snapshot failed: {}", e);
                    None
                }
            },
        };
        if let Some(stats) = snapshot {
            initial.push(seq.event("processes", &*stats));
        }

        Ok(self.assemble(initial, seq, rx, handle, admitted.permit))
    }

    fn assemble(
        &self,
        initial: Vec<Event>,
        seq: Sequence,
        rx: mpsc::Receiver<Outbound>,
        subscription: Unsubscribe,
        permit: SessionPermit,
    ) -> SessionStream {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);

        tracing::debug!(session = id, subject = %permit.subject(), "stream session opened");

        let state = SessionState {
            id,
            rx,
            seq,
            shutdown: self.shutdown.subscribe(),
            done: false,
            _subscription: subscription,
            permit,
        };

        SessionStream {
            id,
            heartbeat: self.gate.config().heartbeat,
            inner: Box::pin(stream::iter(initial).chain(stream::unfold(state, next_frame))),
        }
    }

    /// End every open stream through the normal close path
    pub fn close_all(&self) {
        self.shutdown.send_replace(true);
        tracing::info!(active = self.active(), "closing all stream sessions");
    }

    /// Periodically sweep rate-limit keys and idle subject counters
    pub fn spawn_sweeper(self: &Arc<Self>) -> JoinHandle<()> {
        let weak = Arc::downgrade(self);
        let config = self.gate.config();
        let period = config.rate_key_ttl.min(config.subject_counter_ttl);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                let Some(hub) = weak.upgrade() else {
                    break;
                };
                hub.gate.sweep();
            }
        })
    }
}
