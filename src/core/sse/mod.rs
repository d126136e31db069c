// src/core/sse/mod.rs

//! The SSE Hub (spec §4.E): per-request subscriptions fanned out from a
//! coalescer callback. Per-client bounded channel + heartbeat grounded on
//! `other_examples/Unleash broadcaster.rs`; drop-oldest-on-full + lag
//! counting grounded on `core/pubsub/handler.rs`'s `Lagged` handling, adapted
//! from "resubscribe on lag" (broadcast channel semantics) to "drop oldest
//! queued frame" (spec's explicit backpressure policy).

use crate::core::coalescer::CoalescerHandle;
use crate::core::errors::{ClusterMuxError, Result};
use crate::core::informer::{ClusterObject, InformerKey, InformerRegistry, SubscriptionHandle};
use async_stream::stream;
use axum::response::sse::Event;
use dashmap::DashMap;
use serde::Serialize;
use std::collections::VecDeque;
use std::convert::Infallible;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tracing::{debug, warn};
use uuid::Uuid;

pub type SubscriptionId = Uuid;

/// A transform turns a full cache snapshot (list endpoints) into the JSON
/// payload for one SSE frame. Real per-kind transforms (Pod, ConfigMap, ...)
/// are registered by `http::routes`; this trait is the seam spec §9 calls
/// for ("collapse into one generic ResourceEndpoint").
pub trait Transform: Send + Sync {
    fn event_name(&self) -> &'static str;
    fn render(&self, objects: &[ClusterObject]) -> serde_json::Value;
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event")]
pub enum SseFrame {
    #[serde(rename = "data")]
    Data { kind: String, data: serde_json::Value },
    #[serde(rename = "permission-error")]
    PermissionError {
        resource: String,
        verb: String,
        namespace: Option<String>,
        message: String,
    },
    #[serde(rename = "error")]
    Error { message: String },
    #[serde(rename = "slow-client")]
    SlowClient,
}

impl SseFrame {
    fn into_axum_event(self) -> Event {
        match self {
            SseFrame::Data { kind, data } => Event::default().event(kind).json_data(data).unwrap_or_else(|_| Event::default()),
            SseFrame::PermissionError { resource, verb, namespace, message } => {
                let payload = serde_json::json!({ "resource": resource, "verb": verb, "namespace": namespace, "message": message });
                Event::default().event("permission-error").json_data(payload).unwrap_or_else(|_| Event::default())
            }
            SseFrame::Error { message } => Event::default()
                .event("error")
                .json_data(serde_json::json!({ "message": message }))
                .unwrap_or_else(|_| Event::default()),
            SseFrame::SlowClient => Event::default().event("slow-client").data(""),
        }
    }
}

/// Bounded, drop-oldest-on-full frame queue (spec §4.E backpressure policy).
struct FrameQueue {
    queue: parking_lot::Mutex<VecDeque<SseFrame>>,
    notify: Notify,
    capacity: usize,
    lag: AtomicU32,
    closed: std::sync::atomic::AtomicBool,
}

impl FrameQueue {
    fn new(capacity: usize) -> Self {
        Self {
            queue: parking_lot::Mutex::new(VecDeque::with_capacity(capacity)),
            notify: Notify::new(),
            capacity,
            lag: AtomicU32::new(0),
            closed: std::sync::atomic::AtomicBool::new(false),
        }
    }

    /// Returns the current lag count after pushing.
    fn push(&self, frame: SseFrame) -> u32 {
        let mut q = self.queue.lock();
        if q.len() >= self.capacity {
            q.pop_front();
            self.lag.fetch_add(1, Ordering::SeqCst);
        }
        q.push_back(frame);
        drop(q);
        self.notify.notify_one();
        self.lag.load(Ordering::SeqCst)
    }

    async fn recv(&self) -> Option<SseFrame> {
        loop {
            if self.closed.load(Ordering::SeqCst) {
                return None;
            }
            if let Some(frame) = self.queue.lock().pop_front() {
                return Some(frame);
            }
            self.notify.notified().await;
        }
    }

    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.notify.notify_one();
    }
}

struct SubscriberEntry {
    queue: Arc<FrameQueue>,
    transform: Arc<dyn Transform>,
}

pub struct SseHub {
    coalescer: CoalescerHandle,
    informer_registry: Arc<InformerRegistry>,
    subs_by_key: DashMap<InformerKey, Arc<DashMap<SubscriptionId, SubscriberEntry>>>,
    buffer_frames: usize,
    slow_client_threshold: u32,
    heartbeat: Duration,
}

impl SseHub {
    pub fn new(
        coalescer: CoalescerHandle,
        informer_registry: Arc<InformerRegistry>,
        buffer_frames: usize,
        slow_client_threshold: u32,
        heartbeat: Duration,
    ) -> Arc<Self> {
        Arc::new(Self {
            coalescer,
            informer_registry,
            subs_by_key: DashMap::new(),
            buffer_frames,
            slow_client_threshold,
            heartbeat,
        })
    }

    /// Registers a subscription against an already-SYNCED informer
    /// (`informer_sub`) and returns a boxed stream ready to hand to
    /// `axum::response::sse::Sse`.
    pub fn stream(
        self: &Arc<Self>,
        informer_sub: SubscriptionHandle,
        transform: Arc<dyn Transform>,
    ) -> impl futures::Stream<Item = std::result::Result<Event, Infallible>> + Send + 'static {
        let key = informer_sub.key().clone();
        let id = Uuid::new_v4();
        let queue = Arc::new(FrameQueue::new(self.buffer_frames));

        let key_subs = self
            .subs_by_key
            .entry(key.clone())
            .or_insert_with(|| Arc::new(DashMap::new()))
            .clone();
        let first_for_key = key_subs.is_empty();
        key_subs.insert(
            id,
            SubscriberEntry {
                queue: queue.clone(),
                transform: transform.clone(),
            },
        );

        if first_for_key {
            self.register_fanout_callback(key.clone(), key_subs.clone());
        }

        // Initial frame: the informer is already SYNCED (registry.subscribe
        // waited for it), so this is an atomic snapshot, not a torn read.
        if let Ok(objects) = self.informer_registry.snapshot(&key) {
            queue.push(SseFrame::Data {
                kind: transform.event_name().to_string(),
                data: transform.render(&objects),
            });
        }

        let heartbeat = self.heartbeat;
        let slow_threshold = self.slow_client_threshold;
        let hub = self.clone();
        let key_for_cleanup = key.clone();
        let key_subs_for_cleanup = key_subs.clone();

        stream! {
            // Keep `informer_sub` and `transform` alive for the stream's
            // lifetime: dropping `informer_sub` triggers the Informer
            // Registry's `unsubscribe` cascade (spec §4.E cancellation).
            let _informer_sub = informer_sub;
            let mut hb = tokio::time::interval(heartbeat);
            hb.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            hb.tick().await; // first tick fires immediately; discard it.

            loop {
                tokio::select! {
                    biased;
                    frame = queue.recv() => {
                        let Some(frame) = frame else { break };
                        yield Ok(frame.into_axum_event());
                        if queue.lag.load(Ordering::SeqCst) >= slow_threshold {
                            warn!(key = %key, "slow client disconnected");
                            yield Ok(SseFrame::SlowClient.into_axum_event());
                            break;
                        }
                    }
                    _ = hb.tick() => {
                        yield Ok(Event::default().comment("heartbeat"));
                    }
                }
            }

            queue.close();
            key_subs_for_cleanup.remove(&id);
            if key_subs_for_cleanup.is_empty() {
                hub.subs_by_key.remove(&key_for_cleanup);
            }
            debug!(key = %key_for_cleanup, subscription = %id, "sse subscription ended");
        }
    }

    /// Opens an SSE stream that immediately yields one permission-error
    /// frame and then closes, used when `InformerRegistry::subscribe`
    /// itself fails with `PermissionDenied` — the handshake still
    /// succeeds and the denial arrives as an in-band frame instead of a
    /// failed HTTP request (spec §4.E/S2: "first event is a
    /// permission-error frame ... no secrets event frame is emitted").
    pub fn permission_error_stream(
        &self,
        err: &ClusterMuxError,
    ) -> impl futures::Stream<Item = std::result::Result<Event, Infallible>> + Send + 'static {
        let frame = match err {
            ClusterMuxError::PermissionDenied {
                resource,
                verb,
                namespace,
                message,
            } => SseFrame::PermissionError {
                resource: resource.clone(),
                verb: verb.clone(),
                namespace: namespace.clone(),
                message: message.clone(),
            },
            other => SseFrame::Error { message: other.to_string() },
        };
        stream! {
            yield Ok(frame.into_axum_event());
        }
    }

    fn register_fanout_callback(
        self: &Arc<Self>,
        key: InformerKey,
        key_subs: Arc<DashMap<SubscriptionId, SubscriberEntry>>,
    ) {
        let informer_registry = self.informer_registry.clone();
        let key_for_snapshot = key.clone();
        self.coalescer.register_callback(
            key,
            Arc::new(move || {
                let Ok(objects) = informer_registry.snapshot(&key_for_snapshot) else {
                    return;
                };
                for entry in key_subs.iter() {
                    let frame = SseFrame::Data {
                        kind: entry.transform.event_name().to_string(),
                        data: entry.transform.render(&objects),
                    };
                    entry.queue.push(frame);
                }
            }),
        );
    }

    /// Broadcasts a permission-error frame to every current subscriber of
    /// `key`, used when an informer transitions to DEGRADED due to an RBAC
    /// failure (spec §7/S2).
    pub fn broadcast_permission_error(&self, key: &InformerKey, err: &ClusterMuxError) {
        let ClusterMuxError::PermissionDenied { resource, verb, namespace, message } = err else {
            return;
        };
        if let Some(subs) = self.subs_by_key.get(key) {
            for entry in subs.iter() {
                entry.queue.push(SseFrame::PermissionError {
                    resource: resource.clone(),
                    verb: verb.clone(),
                    namespace: namespace.clone(),
                    message: message.clone(),
                });
            }
        }
    }

    pub fn subscriber_count(&self, key: &InformerKey) -> usize {
        self.subs_by_key.get(key).map(|s| s.len()).unwrap_or(0)
    }
}

/// Monotonic frame counter exposed for metrics; intentionally unused by
/// hub logic itself to keep the hot path lock-free (see `core/metrics.rs`).
pub static FRAMES_SENT: AtomicU64 = AtomicU64::new(0);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn drop_oldest_on_full_increments_lag() {
        let q = FrameQueue::new(2);
        q.push(SseFrame::Error { message: "1".into() });
        q.push(SseFrame::Error { message: "2".into() });
        let lag = q.push(SseFrame::Error { message: "3".into() });
        assert_eq!(lag, 1);
        assert_eq!(q.queue.lock().len(), 2);
    }

    #[tokio::test]
    async fn recv_returns_none_after_close() {
        let q = FrameQueue::new(4);
        q.close();
        assert!(q.recv().await.is_none());
    }

    #[tokio::test]
    async fn recv_yields_pushed_frame() {
        let q = Arc::new(FrameQueue::new(4));
        q.push(SseFrame::Error { message: "hi".into() });
        let frame = q.recv().await.unwrap();
        matches!(frame, SseFrame::Error { .. });
    }

    #[tokio::test]
    async fn permission_error_stream_yields_single_frame_then_closes() {
        use crate::core::client_factory::{ClientFactory, KubeConfigResolver};
        use crate::core::coalescer::Coalescer;
        use futures::StreamExt;
        use tokio_util::sync::CancellationToken;

        struct FailingResolver;
        #[async_trait::async_trait]
        impl KubeConfigResolver for FailingResolver {
            async fn resolve(&self, _c: &str, _n: &str) -> Result<kube::Config> {
                Err(ClusterMuxError::Unavailable("no cluster in unit test".into()))
            }
        }

        let err = ClusterMuxError::PermissionDenied {
            resource: "secrets".into(),
            verb: "list".into(),
            namespace: Some("default".into()),
            message: "forbidden".into(),
        };

        let factory = Arc::new(ClientFactory::new(10.0, 20, Arc::new(FailingResolver)));
        let registry = InformerRegistry::new(
            factory,
            Coalescer::spawn(Duration::from_millis(50), 100, CancellationToken::new()),
            CancellationToken::new(),
            Duration::from_secs(1),
            Duration::from_millis(50),
        );
        let hub = SseHub::new(
            Coalescer::spawn(Duration::from_millis(50), 100, CancellationToken::new()),
            registry,
            8,
            100,
            Duration::from_secs(30),
        );

        let mut stream = Box::pin(hub.permission_error_stream(&err));
        assert!(stream.next().await.is_some());
        assert!(stream.next().await.is_none());
    }
}
