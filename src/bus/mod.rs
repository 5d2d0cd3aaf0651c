// SPDX-License-Identifier: MIT
//! Streaming progress bus — fan-out of lifecycle events to subscribers.
//!
//! Each subscriber owns a bounded outbound channel the transport drains;
//! the bus is a producer into those channels and never touches sockets.
//! Backpressure is byte-accounted against a per-subscriber high-water
//! mark:
//!
//! - progress-class events are dropped for a subscriber over its HWM;
//! - terminal events block up to 250 ms for room, then the subscriber is
//!   marked `lagging` and the event is recorded as missed;
//! - other events are recorded as missed immediately when there is no
//!   room.
//!
//! Events are serialized once per publish and the buffer shared across
//! subscribers; heartbeats are the exception since their payload carries
//! a per-subscriber `lagged` flag.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::json;
use tokio::sync::{mpsc, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::events::{Event, EventType};
use crate::metrics::SharedMetrics;

/// How long a terminal event may block waiting for buffer room.
const TERMINAL_SEND_WAIT: Duration = Duration::from_millis(250);
/// Poll granularity while waiting for buffer room.
const SEND_POLL: Duration = Duration::from_millis(10);
/// Outbound channel capacity in frames; the byte HWM is the real limit.
const CHANNEL_FRAMES: usize = 1024;
/// Per-subscriber missed-event ring size.
const MISSED_RING: usize = 64;
/// Heartbeat cadence.
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);
/// Subscribers silent for this long (two missed pongs) are closed.
pub const IDLE_TIMEOUT: Duration = Duration::from_secs(60);

// ─── Frames ───────────────────────────────────────────────────────────────────

/// One serialized event on its way to a subscriber's transport.
#[derive(Debug, Clone)]
pub struct Frame {
    pub json: Arc<str>,
    /// Serialized size used for buffer accounting; the transport calls
    /// [`Subscriber::on_drained`] with this after the socket write.
    pub bytes: usize,
}

impl Frame {
    fn new(json: Arc<str>) -> Self {
        let bytes = json.len();
        Self { json, bytes }
    }
}

// ─── Subscription set ─────────────────────────────────────────────────────────

/// Channels a subscriber listens on. Channel names are event type names;
/// an empty initial list means "everything".
#[derive(Debug, Clone)]
struct Subscription {
    all: bool,
    channels: HashSet<String>,
}

impl Subscription {
    fn from_channels(channels: &[String]) -> Self {
        if channels.is_empty() {
            Self {
                all: true,
                channels: HashSet::new(),
            }
        } else {
            Self {
                all: false,
                channels: channels.iter().cloned().collect(),
            }
        }
    }

    fn matches(&self, event_type: EventType) -> bool {
        self.all || self.channels.contains(event_type.as_str())
    }
}

// ─── Subscriber ───────────────────────────────────────────────────────────────

/// Compact record of an event a lagging subscriber did not receive.
#[derive(Debug, Clone, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MissedEvent {
    pub event_type: EventType,
    pub task_id: Option<String>,
    pub step_id: Option<String>,
    pub timestamp: chrono::DateTime<chrono::Utc>,
}

/// Bus-side state for one connected client.
pub struct Subscriber {
    pub client_id: String,
    tx: mpsc::Sender<Frame>,
    buffered_bytes: Arc<AtomicUsize>,
    lagging: AtomicBool,
    subscription: std::sync::Mutex<Subscription>,
    missed: std::sync::Mutex<VecDeque<MissedEvent>>,
    last_activity: std::sync::Mutex<Instant>,
    metrics: SharedMetrics,
}

impl Subscriber {
    /// Transport calls this after writing a frame to the socket.
    pub fn on_drained(&self, bytes: usize) {
        self.buffered_bytes.fetch_sub(bytes, Ordering::Relaxed);
        self.metrics
            .stream_bytes_buffered
            .fetch_sub(bytes as u64, Ordering::Relaxed);
    }

    /// Transport calls this on any inbound traffic (messages and pongs).
    pub fn touch(&self) {
        *self.last_activity.lock().expect("activity lock") = Instant::now();
    }

    pub fn is_lagging(&self) -> bool {
        self.lagging.load(Ordering::Relaxed)
    }

    pub fn buffered_bytes(&self) -> usize {
        self.buffered_bytes.load(Ordering::Relaxed)
    }

    /// Add channels to the subscription.
    pub fn subscribe(&self, channels: &[String]) {
        let mut sub = self.subscription.lock().expect("subscription lock");
        if channels.is_empty() {
            sub.all = true;
        } else {
            sub.all = false;
            for c in channels {
                sub.channels.insert(c.clone());
            }
        }
    }

    /// Remove channels; removing the last leaves the subscriber mute.
    pub fn unsubscribe(&self, channels: &[String]) {
        let mut sub = self.subscription.lock().expect("subscription lock");
        sub.all = false;
        for c in channels {
            sub.channels.remove(c);
        }
    }

    pub fn subscribed_channels(&self) -> Vec<String> {
        let sub = self.subscription.lock().expect("subscription lock");
        if sub.all {
            vec!["*".to_string()]
        } else {
            let mut v: Vec<String> = sub.channels.iter().cloned().collect();
            v.sort();
            v
        }
    }

    /// Drain and return the missed-event record.
    pub fn take_missed(&self) -> Vec<MissedEvent> {
        self.missed.lock().expect("missed lock").drain(..).collect()
    }

    fn record_missed(&self, event: &Event) {
        let mut missed = self.missed.lock().expect("missed lock");
        if missed.len() == MISSED_RING {
            missed.pop_front();
        }
        missed.push_back(MissedEvent {
            event_type: event.event_type,
            task_id: event.task_id.clone(),
            step_id: event.step_id.clone(),
            timestamp: event.timestamp,
        });
    }

    fn idle_for(&self) -> Duration {
        self.last_activity
            .lock()
            .expect("activity lock")
            .elapsed()
    }
}

enum Offer {
    Delivered,
    OverHwm,
    Closed,
}

// ─── Bus ──────────────────────────────────────────────────────────────────────

pub struct ProgressBus {
    subscribers: RwLock<HashMap<String, Arc<Subscriber>>>,
    max_buffered_bytes: usize,
    /// Metrics broadcast cadence; adjustable at runtime, floored at 250.
    broadcast_ms: std::sync::atomic::AtomicU64,
    metrics: SharedMetrics,
    /// Guards the periodic metrics broadcast: a tick is skipped entirely
    /// while the previous broadcast is still in flight.
    broadcast_in_flight: AtomicBool,
}

impl ProgressBus {
    pub fn new(max_buffered_bytes: usize, broadcast_ms: u64, metrics: SharedMetrics) -> Self {
        Self {
            subscribers: RwLock::new(HashMap::new()),
            max_buffered_bytes,
            broadcast_ms: std::sync::atomic::AtomicU64::new(broadcast_ms.max(250)),
            metrics,
            broadcast_in_flight: AtomicBool::new(false),
        }
    }

    /// Change the metrics broadcast cadence; takes effect next tick.
    pub fn set_broadcast_ms(&self, ms: u64) -> u64 {
        let clamped = ms.max(250);
        self.broadcast_ms.store(clamped, Ordering::Relaxed);
        clamped
    }

    pub fn broadcast_ms(&self) -> u64 {
        self.broadcast_ms.load(Ordering::Relaxed)
    }

    /// Attach a subscriber; the returned receiver is the transport's drain.
    pub async fn attach(
        &self,
        client_id: impl Into<String>,
        channels: &[String],
    ) -> (Arc<Subscriber>, mpsc::Receiver<Frame>) {
        let client_id = client_id.into();
        let (tx, rx) = mpsc::channel(CHANNEL_FRAMES);
        let subscriber = Arc::new(Subscriber {
            client_id: client_id.clone(),
            tx,
            buffered_bytes: Arc::new(AtomicUsize::new(0)),
            lagging: AtomicBool::new(false),
            subscription: std::sync::Mutex::new(Subscription::from_channels(channels)),
            missed: std::sync::Mutex::new(VecDeque::new()),
            last_activity: std::sync::Mutex::new(Instant::now()),
            metrics: self.metrics.clone(),
        });
        let mut subs = self.subscribers.write().await;
        subs.insert(client_id.clone(), subscriber.clone());
        self.metrics
            .stream_clients
            .store(subs.len() as u64, Ordering::Relaxed);
        info!(client_id = %client_id, "subscriber attached");
        (subscriber, rx)
    }

    /// Detach on disconnect; forgets any still-buffered bytes.
    pub async fn detach(&self, client_id: &str) {
        let mut subs = self.subscribers.write().await;
        if let Some(sub) = subs.remove(client_id) {
            let leftover = sub.buffered_bytes.swap(0, Ordering::Relaxed);
            self.metrics
                .stream_bytes_buffered
                .fetch_sub(leftover as u64, Ordering::Relaxed);
            info!(client_id = %client_id, "subscriber detached");
        }
        self.metrics
            .stream_clients
            .store(subs.len() as u64, Ordering::Relaxed);
    }

    pub async fn subscriber(&self, client_id: &str) -> Option<Arc<Subscriber>> {
        self.subscribers.read().await.get(client_id).cloned()
    }

    pub async fn subscriber_count(&self) -> usize {
        self.subscribers.read().await.len()
    }

    fn offer(&self, sub: &Subscriber, frame: &Frame) -> Offer {
        if sub.buffered_bytes.load(Ordering::Relaxed) + frame.bytes > self.max_buffered_bytes {
            return Offer::OverHwm;
        }
        match sub.tx.try_send(frame.clone()) {
            Ok(()) => {
                sub.buffered_bytes.fetch_add(frame.bytes, Ordering::Relaxed);
                self.metrics
                    .stream_bytes_buffered
                    .fetch_add(frame.bytes as u64, Ordering::Relaxed);
                Offer::Delivered
            }
            Err(mpsc::error::TrySendError::Full(_)) => Offer::OverHwm,
            Err(mpsc::error::TrySendError::Closed(_)) => Offer::Closed,
        }
    }

    /// Multicast an event to every matching subscriber.
    ///
    /// The payload is serialized once; per-subscriber delivery applies the
    /// backpressure policy. Per-subscriber FIFO ordering holds because the
    /// publisher enqueues into each subscriber channel in event order.
    pub async fn publish(&self, event: &Event) {
        let json: Arc<str> = match serde_json::to_string(event) {
            Ok(s) => Arc::from(s.as_str()),
            Err(e) => {
                warn!(err = %e, "failed to serialize event — dropping");
                return;
            }
        };
        let frame = Frame::new(json);

        let subs: Vec<Arc<Subscriber>> =
            self.subscribers.read().await.values().cloned().collect();
        for sub in subs {
            if !sub
                .subscription
                .lock()
                .expect("subscription lock")
                .matches(event.event_type)
            {
                continue;
            }
            match self.offer(&sub, &frame) {
                Offer::Delivered => {}
                Offer::Closed => {}
                Offer::OverHwm if event.is_droppable() => {
                    // Progress events are droppable by contract; the
                    // subscriber catches up on the next tick.
                    debug!(client_id = %sub.client_id, "dropping progress event for slow subscriber");
                }
                Offer::OverHwm if event.must_not_drop() => {
                    // Terminal events get a short grace window.
                    let deadline = Instant::now() + TERMINAL_SEND_WAIT;
                    let mut delivered = false;
                    while Instant::now() < deadline {
                        tokio::time::sleep(SEND_POLL).await;
                        if matches!(self.offer(&sub, &frame), Offer::Delivered) {
                            delivered = true;
                            break;
                        }
                    }
                    if !delivered {
                        sub.lagging.store(true, Ordering::Relaxed);
                        sub.record_missed(event);
                        warn!(
                            client_id = %sub.client_id,
                            event = %event.event_type,
                            "subscriber lagging — terminal event recorded as missed"
                        );
                    }
                }
                Offer::OverHwm => {
                    sub.lagging.store(true, Ordering::Relaxed);
                    sub.record_missed(event);
                }
            }
        }
    }

    /// Heartbeat pass: close idle subscribers, send the rest a heartbeat
    /// event carrying their `lagged` flag.
    ///
    /// Heartbeats are serialized per subscriber (the payload differs) and
    /// delivered best-effort.
    pub async fn heartbeat_tick(&self) {
        let idle: Vec<String> = {
            let subs = self.subscribers.read().await;
            subs.values()
                .filter(|s| s.idle_for() >= IDLE_TIMEOUT)
                .map(|s| s.client_id.clone())
                .collect()
        };
        for client_id in idle {
            info!(client_id = %client_id, "closing idle subscriber (missed pongs)");
            self.detach(&client_id).await;
        }

        let subs: Vec<Arc<Subscriber>> =
            self.subscribers.read().await.values().cloned().collect();
        for sub in subs {
            let lagged = sub.lagging.load(Ordering::Relaxed);
            let missed_count = sub.missed.lock().expect("missed lock").len();
            let event = Event::bare(
                EventType::Heartbeat,
                json!({ "lagged": lagged, "missed": missed_count }),
            );
            let Ok(json) = serde_json::to_string(&event) else {
                continue;
            };
            let frame = Frame::new(Arc::from(json.as_str()));
            if matches!(self.offer(&sub, &frame), Offer::Delivered) && !lagged {
                continue;
            }
            // A subscriber that has drained back under the HWM stops
            // being lagging once a heartbeat reporting the lag lands.
            if lagged && sub.buffered_bytes.load(Ordering::Relaxed) < self.max_buffered_bytes {
                sub.lagging.store(false, Ordering::Relaxed);
            }
        }
    }

    /// Periodic metrics broadcast; skipped while the previous one is
    /// still in flight.
    pub async fn broadcast_metrics(&self) {
        if self
            .broadcast_in_flight
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            debug!("metrics broadcast still in flight — skipping tick");
            return;
        }
        let event = Event::bare(EventType::Heartbeat, json!({ "metrics": self.metrics.snapshot() }));
        self.publish(&event).await;
        self.broadcast_in_flight.store(false, Ordering::Release);
    }

    /// Run heartbeat + metrics timers until cancelled.
    pub async fn run(&self, cancel: CancellationToken) {
        tokio::join!(
            self.heartbeat_loop(cancel.clone()),
            self.broadcast_loop(cancel)
        );
    }

    async fn heartbeat_loop(&self, cancel: CancellationToken) {
        let mut heartbeat = tokio::time::interval(HEARTBEAT_INTERVAL);
        heartbeat.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // The interval's immediate first tick is harmless: one heartbeat
        // right after startup.
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = heartbeat.tick() => self.heartbeat_tick().await,
            }
        }
    }

    async fn broadcast_loop(&self, cancel: CancellationToken) {
        loop {
            let wait = Duration::from_millis(self.broadcast_ms());
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(wait) => self.broadcast_metrics().await,
            }
        }
    }

    /// Final shutdown event, then drop every subscriber channel.
    pub async fn shutdown(&self) {
        self.publish(&Event::bare(EventType::Shutdown, json!({ "reason": "shutdown" })))
            .await;
        let mut subs = self.subscribers.write().await;
        subs.clear();
        self.metrics.stream_clients.store(0, Ordering::Relaxed);
    }
}

/// Thread-safe shared bus.
pub type SharedBus = Arc<ProgressBus>;
