// Event aggregation bus - normalizes push records, keeps bounded history and fans out

mod event;
mod ring;
mod stats;

pub use event::{parse_progress, strip_manager_timestamp, TelemetryEvent, TelemetryKind};
pub use ring::RingBuffer;
pub use stats::{build_snapshot, ErrorDetail, HostSample, ProcessStats, StatsEntry, SystemStats, SYSTEM_ENTRY};

use crate::adapter::{BusPayload, BusRecord, ProcessAdapter, ProcessStatus, SupervisedProcess};
use crate::config::BusConfig;
use crate::error::{CapacityScope, Result, WardenError};
use crate::process::ProcessMonitor;
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tokio::time::Instant;

/// Per-process listener
pub type EventCallback = Arc<dyn Fn(&TelemetryEvent) + Send + Sync>;

/// All-processes listener; receives every polled snapshot
pub type StatsCallback = Arc<dyn Fn(Arc<Vec<StatsEntry>>) + Send + Sync>;

/// Minimal view returned by [`EventBus::list_processes`]
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProcessSummary {
    pub name: String,
    pub pm_id: u32,
    pub status: ProcessStatus,
}

struct Tracked {
    rings: HashMap<String, RingBuffer<TelemetryEvent>>,
    /// Tracked names in creation order
    order: VecDeque<String>,
    subscribers: HashMap<String, Vec<(u64, EventCallback)>>,
}

struct Poller {
    subscribers: Vec<(u64, StatsCallback)>,
    task: Option<JoinHandle<()>>,
    last_poll_at: Option<Instant>,
    immediate_scheduled: bool,
    latest: Option<Arc<Vec<StatsEntry>>>,
}

struct BusInner {
    adapter: Arc<dyn ProcessAdapter>,
    config: BusConfig,
    tracked: Mutex<Tracked>,
    poller: Mutex<Poller>,
    monitor: Mutex<ProcessMonitor>,
    cores: usize,
    polling: AtomicBool,
    closed: AtomicBool,
    next_id: AtomicU64,
}

/// Recover the guard from a poisoned lock; every critical section leaves state consistent
fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Held for the duration of one stats poll; dropping it (even on cancellation) clears the flag
struct PollingFlag(Arc<BusInner>);

impl PollingFlag {
    /// `None` while another poll is in flight
    fn acquire(inner: &Arc<BusInner>) -> Option<Self> {
        if inner.polling.swap(true, Ordering::SeqCst) {
            None
        } else {
            Some(Self(Arc::clone(inner)))
        }
    }
}

impl Drop for PollingFlag {
    fn drop(&mut self) {
        self.0.polling.store(false, Ordering::SeqCst);
    }
}

/// Fan-in/fan-out relay between the process manager and observers
#[derive(Clone)]
pub struct EventBus {
    inner: Arc<BusInner>,
}

impl EventBus {
    pub fn new(adapter: Arc<dyn ProcessAdapter>, config: BusConfig) -> Self {
        let monitor = ProcessMonitor::new();
        let cores = monitor.cpu_count();
        Self {
            inner: Arc::new(BusInner {
                adapter,
                config,
                tracked: Mutex::new(Tracked {
                    rings: HashMap::new(),
                    order: VecDeque::new(),
                    subscribers: HashMap::new(),
                }),
                poller: Mutex::new(Poller {
                    subscribers: Vec::new(),
                    task: None,
                    last_poll_at: None,
                    immediate_scheduled: false,
                    latest: None,
                }),
                monitor: Mutex::new(monitor),
                cores,
                polling: AtomicBool::new(false),
                closed: AtomicBool::new(false),
                next_id: AtomicU64::new(1),
            }),
        }
    }

    pub fn config(&self) -> &BusConfig {
        &self.inner.config
    }

    pub fn adapter(&self) -> &Arc<dyn ProcessAdapter> {
        &self.inner.adapter
    }

    /// Attach to the adapter's push channel and relay records until it closes
    ///
    /// Failing to reach the push channel is a startup error.
    pub fn start(&self) -> Result<JoinHandle<()>> {
        let mut rx = self.inner.adapter.bus()?;
        let bus = self.clone();

        Ok(tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(record) => bus.handle_record(record),
                    Err(RecvError::Lagged(skipped)) => {
                        tracing::warn!(skipped, "bus consumer lagged, records dropped");
                    }
                    Err(RecvError::Closed) => {
                        tracing::warn!("process manager bus closed");
                        bus.inner.closed.store(true, Ordering::SeqCst);
                        break;
                    }
                }
            }
        }))
    }

    /// Normalize one raw record and publish the resulting events
    pub fn handle_record(&self, record: BusRecord) {
        let BusRecord {
            process_name: name,
            numeric_id: pm_id,
            payload,
        } = record;
        if name.is_empty() {
            return;
        }

        match payload {
            BusPayload::Log(text) => {
                let data = strip_manager_timestamp(&text).to_string();
                self.publish(
                    &name,
                    TelemetryEvent::new(&name, pm_id, now_ms(), TelemetryKind::Log { data }),
                );
                if let Some(progress) = parse_progress(&text) {
                    self.publish(
                        &name,
                        TelemetryEvent::new(
                            &name,
                            pm_id,
                            now_ms(),
                            TelemetryKind::Progress { progress, raw: text },
                        ),
                    );
                }
            }
            BusPayload::ErrorLog(text) => {
                let data = strip_manager_timestamp(&text).to_string();
                self.publish(
                    &name,
                    TelemetryEvent::new(&name, pm_id, now_ms(), TelemetryKind::ErrorLog { data }),
                );
            }
            BusPayload::Lifecycle(status) => {
                self.publish(
                    &name,
                    TelemetryEvent::new(
                        &name,
                        pm_id,
                        now_ms(),
                        TelemetryKind::Status {
                            status: status.clone(),
                        },
                    ),
                );
                self.log_lifecycle(&name, pm_id, &status);
            }
        }
    }

    fn log_lifecycle(&self, name: &str, pm_id: u32, status: &str) {
        match status {
            "exit" | "stop" | "restart" | "online" => {
                tracing::info!(event = "process_event", process = %name, pm_id, status, "process event");
                if status == "exit" {
                    let adapter = Arc::clone(&self.inner.adapter);
                    let name = name.to_string();
                    tokio::spawn(async move {
                        match adapter.describe(&name).await {
                            Ok(Some(proc)) if proc.is_stopped_by_user() => {}
                            Ok(proc) => {
                                let proc = proc.unwrap_or_default();
                                tracing::error!(
                                    event = "unexpected_exit",
                                    process = %name,
                                    pm_id,
                                    note = proc.note.as_deref().unwrap_or(""),
                                    exit_code = ?proc.exit_code,
                                    exit_signal = ?proc.exit_signal,
                                    "process exited unexpectedly"
                                );
                            }
                            Err(e) => {
                                tracing::warn!(process = %name, "describe after exit failed: {}", e);
                            }
                        }
                    });
                }
            }
            "launch" | "error" | "unexpected" => {
                tracing::warn!(
                    event = "process_event_unusual",
                    process = %name,
                    pm_id,
                    status,
                    "unusual process event"
                );
            }
            _ => {}
        }
    }

    /// Append to the process's history, notify its listeners and nudge the stats poller
    pub fn publish(&self, name: &str, event: TelemetryEvent) {
        if name.is_empty() || !self.inner.config.is_allowed(name) {
            return;
        }

        let (listeners, detached) = {
            let mut tracked = lock(&self.inner.tracked);
            let detached = self.ensure_tracked(&mut tracked, name);
            if let Some(ring) = tracked.rings.get_mut(name) {
                ring.push(event.clone());
            }
            let listeners: Vec<EventCallback> = tracked
                .subscribers
                .get(name)
                .map(|subs| subs.iter().map(|(_, cb)| Arc::clone(cb)).collect())
                .unwrap_or_default();
            (listeners, detached)
        };
        drop(detached);

        for listener in listeners {
            if catch_unwind(AssertUnwindSafe(|| listener(&event))).is_err() {
                tracing::error!(process = %name, "subscriber callback panicked");
            }
        }

        self.schedule_immediate_poll();
    }

    /// Track `name`, evicting the oldest tracked name past the ceiling.
    /// Returns the listeners detached by the eviction so they drop outside the lock.
    fn ensure_tracked(&self, tracked: &mut Tracked, name: &str) -> Vec<(u64, EventCallback)> {
        if tracked.rings.contains_key(name) {
            return Vec::new();
        }

        tracked
            .rings
            .insert(name.to_string(), RingBuffer::new(self.inner.config.ring_size));
        tracked.order.push_back(name.to_string());

        let mut detached = Vec::new();
        while tracked.order.len() > self.inner.config.max_tracked.max(1) {
            let Some(oldest) = tracked.order.pop_front() else {
                break;
            };
            tracked.rings.remove(&oldest);
            if let Some(subs) = tracked.subscribers.remove(&oldest) {
                detached.extend(subs);
            }
            tracing::debug!(process = %oldest, "evicted tracked process");
        }
        detached
    }

    /// Register a live listener for one process and return its backlog
    pub fn subscribe(&self, name: &str, callback: EventCallback) -> Result<Subscription> {
        if !self.inner.config.is_allowed(name) {
            return Err(WardenError::ProcessNotAllowed(name.to_string()));
        }
        if self.inner.closed.load(Ordering::SeqCst) {
            return Err(WardenError::SubscriptionFailed(
                "process manager bus is closed".to_string(),
            ));
        }

        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let mut tracked = lock(&self.inner.tracked);
        tracked
            .subscribers
            .entry(name.to_string())
            .or_default()
            .push((id, callback));
        let initial = tracked
            .rings
            .get(name)
            .map(|ring| ring.snapshot())
            .unwrap_or_default();

        Ok(Subscription {
            initial,
            handle: Unsubscribe {
                bus: Arc::downgrade(&self.inner),
                target: Target::Process(name.to_string()),
                id,
                active: true,
            },
        })
    }

    /// Register for periodic snapshots; the first registration starts the poller
    pub fn subscribe_all(&self, callback: StatsCallback) -> Result<Unsubscribe> {
        let mut poller = lock(&self.inner.poller);
        if poller.subscribers.len() >= self.inner.config.max_all_subscribers {
            return Err(WardenError::CapacityExceeded(
                CapacityScope::AllProcessSubscribers,
            ));
        }

        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        poller.subscribers.push((id, callback));
        if poller.task.is_none() {
            poller.task = Some(Self::spawn_poller(&self.inner));
            tracing::debug!("stats poller started");
        }

        Ok(Unsubscribe {
            bus: Arc::downgrade(&self.inner),
            target: Target::AllProcesses,
            id,
            active: true,
        })
    }

    fn spawn_poller(inner: &Arc<BusInner>) -> JoinHandle<()> {
        let weak = Arc::downgrade(inner);
        let period = inner.config.stats_interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                let Some(inner) = weak.upgrade() else {
                    break;
                };
                if let Some(flag) = PollingFlag::acquire(&inner) {
                    drop(inner);
                    Self::poll_stats(flag, "interval").await;
                }
            }
        })
    }

    /// One stats poll, broadcast to every all-process listener
    async fn poll_stats(flag: PollingFlag, reason: &'static str) {
        let inner = &flag.0;

        match Self::snapshot_of(inner).await {
            Ok(stats) => {
                let stats = Arc::new(stats);
                let listeners: Vec<StatsCallback> = {
                    let mut poller = lock(&inner.poller);
                    poller.latest = Some(Arc::clone(&stats));
                    poller.last_poll_at = Some(Instant::now());
                    poller
                        .subscribers
                        .iter()
                        .map(|(_, cb)| Arc::clone(cb))
                        .collect()
                };
                for listener in listeners {
                    let stats = Arc::clone(&stats);
                    if catch_unwind(AssertUnwindSafe(|| listener(stats))).is_err() {
                        tracing::error!("stats subscriber callback panicked");
                    }
                }
            }
            Err(e) => {
                tracing::warn!(reason, "stats poll failed: {}", e);
            }
        }
    }

    fn schedule_immediate_poll(&self) {
        let mut poller = lock(&self.inner.poller);
        if poller.subscribers.is_empty() {
            return;
        }

        let gap = self.inner.config.min_immediate_poll_gap;
        let recent = poller
            .last_poll_at
            .is_some_and(|at| at.elapsed() < gap);

        if recent {
            if poller.immediate_scheduled {
                return;
            }
            poller.immediate_scheduled = true;
            let inner = Arc::clone(&self.inner);
            tokio::spawn(async move {
                tokio::time::sleep(gap).await;
                lock(&inner.poller).immediate_scheduled = false;
                if let Some(flag) = PollingFlag::acquire(&inner) {
                    drop(inner);
                    Self::poll_stats(flag, "immediate").await;
                }
            });
        } else if let Some(flag) = PollingFlag::acquire(&self.inner) {
            // Claimed synchronously so a burst of records yields a single poll.
            tokio::spawn(Self::poll_stats(flag, "immediate"));
        }
    }

    async fn snapshot_of(inner: &Arc<BusInner>) -> Result<Vec<StatsEntry>> {
        let list = inner.adapter.list().await?;
        let pids: Vec<u32> = list.iter().filter_map(|p| p.pid).collect();
        let host = {
            let mut monitor = lock(&inner.monitor);
            HostSample {
                resident: monitor.resident_memory(&pids),
                cores: inner.cores,
                total_memory: monitor.total_memory(),
            }
        };
        Ok(build_snapshot(list, &host, now_ms(), |name| {
            inner.config.is_allowed(name)
        }))
    }

    /// Fresh snapshot of every visible process plus the `__system__` entry
    pub async fn get_snapshot(&self) -> Result<Vec<StatsEntry>> {
        Self::snapshot_of(&self.inner).await
    }

    /// Last snapshot the poller produced
    pub fn latest_stats(&self) -> Option<Arc<Vec<StatsEntry>>> {
        lock(&self.inner.poller).latest.clone()
    }

    pub async fn list_processes(&self) -> Result<Vec<ProcessSummary>> {
        let list = self.inner.adapter.list().await?;
        Ok(list
            .into_iter()
            .filter(|p| self.inner.config.is_allowed(&p.name))
            .map(|p| ProcessSummary {
                name: p.name,
                pm_id: p.numeric_id,
                status: p.status,
            })
            .collect())
    }

    pub async fn describe(&self, name: &str) -> Result<Option<SupervisedProcess>> {
        if !self.inner.config.is_allowed(name) {
            return Err(WardenError::ProcessNotAllowed(name.to_string()));
        }
        self.inner.adapter.describe(name).await
    }

    pub fn cores(&self) -> usize {
        self.inner.cores
    }

    pub fn subscriber_count(&self, name: &str) -> usize {
        lock(&self.inner.tracked)
            .subscribers
            .get(name)
            .map_or(0, Vec::len)
    }

    pub fn all_subscriber_count(&self) -> usize {
        lock(&self.inner.poller).subscribers.len()
    }

    pub fn is_poller_running(&self) -> bool {
        lock(&self.inner.poller).task.is_some()
    }

    pub fn tracked_names(&self) -> Vec<String> {
        lock(&self.inner.tracked).order.iter().cloned().collect()
    }

    pub fn backlog(&self, name: &str) -> Vec<TelemetryEvent> {
        lock(&self.inner.tracked)
            .rings
            .get(name)
            .map(|ring| ring.snapshot())
            .unwrap_or_default()
    }
}

enum Target {
    Process(String),
    AllProcesses,
}

/// Releases a bus registration exactly once, on `unsubscribe` or drop
pub struct Unsubscribe {
    bus: Weak<BusInner>,
    target: Target,
    id: u64,
    active: bool,
}

impl Unsubscribe {
    pub fn unsubscribe(mut self) {
        self.release();
    }

    fn release(&mut self) {
        if !std::mem::take(&mut self.active) {
            return;
        }
        let Some(inner) = self.bus.upgrade() else {
            return;
        };

        match &self.target {
            Target::Process(name) => {
                let removed = {
                    let mut tracked = lock(&inner.tracked);
                    let mut removed = None;
                    if let Some(subs) = tracked.subscribers.get_mut(name) {
                        if let Some(pos) = subs.iter().position(|(id, _)| *id == self.id) {
                            removed = Some(subs.remove(pos));
                        }
                        if subs.is_empty() {
                            tracked.subscribers.remove(name);
                        }
                    }
                    removed
                };
                drop(removed);
            }
            Target::AllProcesses => {
                let (removed, task) = {
                    let mut poller = lock(&inner.poller);
                    let removed = poller
                        .subscribers
                        .iter()
                        .position(|(id, _)| *id == self.id)
                        .map(|pos| poller.subscribers.remove(pos));
                    let task = if poller.subscribers.is_empty() {
                        poller.task.take()
                    } else {
                        None
                    };
                    (removed, task)
                };
                drop(removed);
                if let Some(task) = task {
                    task.abort();
                    tracing::debug!("stats poller stopped");
                }
            }
        }
    }
}

impl Drop for Unsubscribe {
    fn drop(&mut self) {
        self.release();
    }
}

/// Result of [`EventBus::subscribe`]
pub struct Subscription {
    /// Ring-buffer contents at subscription time, oldest first
    pub initial: Vec<TelemetryEvent>,
    pub handle: Unsubscribe,
}
