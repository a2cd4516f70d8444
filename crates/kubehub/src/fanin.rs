//! Watch fan-in: N per-cluster upstream watches multiplexed into one stream.
//!
//! One worker task per live upstream. Workers relabel object identity and
//! forward into a single bounded sink; the sink is closed exactly once, by
//! whichever party first observes the termination condition.

use std::pin::Pin;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::task::{Context, Poll};
use std::time::{Duration, Instant};

use futures::{Stream, StreamExt};
use kube::Resource;
use meridian_core::identity::make_unique;
use meridian_core::{AggregateError, ClusterId, FieldSelector, WatchEvent};
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::{ClusterRegistry, UpstreamStream, WatchRequest};

#[derive(Debug, Clone)]
pub struct FanInConfig {
    /// Server-side timeout applied to each upstream watch.
    pub watch_timeout: Duration,
    pub sink_capacity: usize,
    /// End the whole session when the first upstream ends.
    pub terminate_on_first_close: bool,
}

impl Default for FanInConfig {
    fn default() -> Self {
        Self { watch_timeout: Duration::from_secs(1200), sink_capacity: 2048, terminate_on_first_close: true }
    }
}

impl FanInConfig {
    pub fn from_env() -> Self {
        let d = Self::default();
        let watch_timeout = std::env::var("MERIDIAN_WATCH_TIMEOUT_SECS")
            .ok()
            .and_then(|s| s.parse::<u64>().ok())
            .map(Duration::from_secs)
            .unwrap_or(d.watch_timeout);
        let sink_capacity = std::env::var("MERIDIAN_QUEUE_CAP")
            .ok()
            .and_then(|s| s.parse::<usize>().ok())
            .filter(|n| *n > 0)
            .unwrap_or(d.sink_capacity);
        let terminate_on_first_close = std::env::var("MERIDIAN_TERMINATE_ON_FIRST_CLOSE")
            .ok()
            .map(|s| !matches!(s.trim().to_ascii_lowercase().as_str(), "0" | "false" | "no" | "off"))
            .unwrap_or(d.terminate_on_first_close);
        Self { watch_timeout, sink_capacity, terminate_on_first_close }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionPhase {
    Streaming,
    /// Sink closed, some workers still winding down.
    Closing,
    Closed,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FanInStats {
    pub forwarded: u64,
    pub dropped_after_close: u64,
    /// Number of Open->Closed sink transitions; never above 1.
    pub closes: u64,
}

enum SinkState<K> {
    Open(mpsc::Sender<WatchEvent<K>>),
    Closed,
}

enum Reserve<K> {
    Full(mpsc::Sender<WatchEvent<K>>),
    Closed,
    ConsumerGone,
}

struct Shared<K> {
    session: Uuid,
    sink: Mutex<SinkState<K>>,
    cancel: CancellationToken,
    /// Caller's field selector, matched against relabelled objects.
    fields: FieldSelector,
    terminate_on_first_close: bool,
    upstreams_left: AtomicUsize,
    forwarded: AtomicU64,
    dropped: AtomicU64,
    closes: AtomicU64,
}

impl<K> Shared<K> {
    fn is_closed(&self) -> bool {
        matches!(*self.sink.lock().unwrap_or_else(PoisonError::into_inner), SinkState::Closed)
    }

    /// The only place the shared sender is dropped. Returns whether this call closed it.
    fn close(&self, cause: &'static str) -> bool {
        {
            let mut sink = self.sink.lock().unwrap_or_else(PoisonError::into_inner);
            if matches!(*sink, SinkState::Closed) {
                return false;
            }
            *sink = SinkState::Closed;
        }
        self.closes.fetch_add(1, Ordering::SeqCst);
        self.cancel.cancel();
        info!(session = %self.session, cause, forwarded = self.forwarded.load(Ordering::Relaxed), "watch session closed");
        true
    }

    fn upstream_ended(&self, cluster: &ClusterId) {
        let left = self.upstreams_left.fetch_sub(1, Ordering::SeqCst).saturating_sub(1);
        info!(session = %self.session, cluster = %cluster, left, "upstream watch ended");
        if self.terminate_on_first_close || left == 0 {
            self.close("upstream ended");
        }
    }

    /// Forward one event. Returns false once the session no longer accepts events.
    async fn forward(&self, ev: WatchEvent<K>) -> bool {
        let outcome = {
            let sink = self.sink.lock().unwrap_or_else(PoisonError::into_inner);
            match &*sink {
                SinkState::Closed => Reserve::Closed,
                SinkState::Open(tx) => match tx.try_reserve() {
                    Ok(permit) => {
                        permit.send(ev);
                        self.forwarded.fetch_add(1, Ordering::Relaxed);
                        return true;
                    }
                    Err(TrySendError::Full(())) => Reserve::Full(tx.clone()),
                    Err(TrySendError::Closed(())) => Reserve::ConsumerGone,
                },
            }
        };
        let spare = match outcome {
            Reserve::Full(spare) => spare,
            Reserve::Closed => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                return false;
            }
            Reserve::ConsumerGone => {
                self.close("consumer gone");
                return false;
            }
        };
        // Sink full: wait for capacity without holding the lock, then re-check.
        let permit = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => None,
            p = spare.reserve_owned() => match p {
                Ok(p) => Some(p),
                Err(_) => {
                    self.close("consumer gone");
                    return false;
                }
            },
        };
        let Some(permit) = permit else {
            self.dropped.fetch_add(1, Ordering::Relaxed);
            return false;
        };
        let sink = self.sink.lock().unwrap_or_else(PoisonError::into_inner);
        if let SinkState::Open(_) = &*sink {
            let _sender = permit.send(ev);
            self.forwarded.fetch_add(1, Ordering::Relaxed);
            true
        } else {
            self.dropped.fetch_add(1, Ordering::Relaxed);
            false
        }
    }
}

async fn run_worker<K>(shared: Arc<Shared<K>>, cluster: ClusterId, mut upstream: UpstreamStream<K>)
where
    K: Resource + Send + 'static,
{
    debug!(session = %shared.session, cluster = %cluster, "worker started");
    loop {
        let next = tokio::select! {
            biased;
            _ = shared.cancel.cancelled() => {
                debug!(session = %shared.session, cluster = %cluster, "worker cancelled");
                return;
            }
            ev = upstream.next() => ev,
        };
        let Some(ev) = next else {
            shared.upstream_ended(&cluster);
            return;
        };
        if let WatchEvent::Error(status) = &ev {
            warn!(session = %shared.session, cluster = %cluster, code = status.code, reason = %status.reason, "upstream error event");
        }
        let ev = ev.map_object(|mut obj| {
            make_unique(&mut obj, &cluster);
            obj
        });
        if ev.object().is_some_and(|o| !shared.fields.matches_object(o)) {
            continue;
        }
        if !shared.forward(ev).await {
            debug!(session = %shared.session, cluster = %cluster, "session closed; worker exiting");
            return;
        }
        metrics::counter!("meridian_watch_events_forwarded_total", 1u64, "cluster" => cluster.to_string());
    }
}

/// Entry point of the fan-in engine.
pub struct FanIn;

impl FanIn {
    /// Open one upstream watch per ready cluster with a live client and start streaming.
    ///
    /// Failure to enumerate ready clusters is fatal. Clusters without a client, whose
    /// watch call fails, or that the field selector rules out are skipped; with no
    /// upstream left the returned stream is empty.
    pub async fn start<K>(
        registry: Arc<dyn ClusterRegistry<K>>,
        request: WatchRequest,
        config: &FanInConfig,
    ) -> Result<ProxyWatch<K>, AggregateError>
    where
        K: Resource + Send + 'static,
    {
        let t0 = Instant::now();
        let session = Uuid::new_v4();
        let clusters = registry.ready_clusters().map_err(AggregateError::registry)?;
        let request = WatchRequest { timeout: request.timeout.or(Some(config.watch_timeout)), ..request };

        let mut upstreams = Vec::with_capacity(clusters.len());
        for c in &clusters {
            let Some(fields) = request.fields.for_cluster(&c.id) else {
                debug!(session = %session, cluster = %c.id, fields = %request.fields, "field selector excludes cluster; skipping");
                continue;
            };
            let Some(client) = registry.client_for(&c.id) else {
                warn!(session = %session, cluster = %c.id, "no client for cluster; skipping");
                metrics::counter!("meridian_watch_upstream_failed_total", 1u64, "reason" => "no_client");
                continue;
            };
            let upstream = WatchRequest { fields, ..request.clone() };
            match client.watch(&upstream).await {
                Ok(stream) => upstreams.push((c.id.clone(), stream)),
                Err(e) => {
                    warn!(session = %session, cluster = %c.id, error = %format!("{e:#}"), "upstream watch failed; skipping");
                    metrics::counter!("meridian_watch_upstream_failed_total", 1u64, "reason" => "watch_error");
                }
            }
        }

        let (tx, rx) = mpsc::channel(config.sink_capacity.max(1));
        let shared = Arc::new(Shared {
            session,
            sink: Mutex::new(SinkState::Open(tx)),
            cancel: CancellationToken::new(),
            fields: request.fields.clone(),
            terminate_on_first_close: config.terminate_on_first_close,
            upstreams_left: AtomicUsize::new(upstreams.len()),
            forwarded: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
            closes: AtomicU64::new(0),
        });
        info!(
            session = %session,
            ready = clusters.len(),
            upstreams = upstreams.len(),
            namespace = ?request.namespace,
            labels = %request.labels,
            fields = %request.fields,
            took_ms = %t0.elapsed().as_millis(),
            "watch session started"
        );
        if upstreams.is_empty() {
            shared.close("no upstream watches");
        }
        let workers = upstreams
            .into_iter()
            .map(|(cluster, stream)| tokio::spawn(run_worker(Arc::clone(&shared), cluster, stream)))
            .collect();
        metrics::increment_gauge!("meridian_watch_sessions_active", 1.0);
        Ok(ProxyWatch { shared, rx, workers })
    }
}

/// Outward handle of one fan-in session. Dropping it cancels the session.
pub struct ProxyWatch<K> {
    shared: Arc<Shared<K>>,
    rx: mpsc::Receiver<WatchEvent<K>>,
    workers: Vec<JoinHandle<()>>,
}

impl<K> ProxyWatch<K> {
    pub fn session_id(&self) -> Uuid { self.shared.session }

    /// Next event; `None` once the sink is closed and drained.
    pub async fn next(&mut self) -> Option<WatchEvent<K>> { self.rx.recv().await }

    /// Cancel the session. Idempotent, also after natural termination.
    pub fn stop(&self) {
        if self.shared.close("stopped") {
            debug!(session = %self.shared.session, "watch session stopped by caller");
        }
    }

    /// Cancel and wait for every worker to exit.
    pub async fn shutdown(&mut self) {
        self.stop();
        for h in self.workers.drain(..) {
            if let Err(e) = h.await {
                if e.is_panic() {
                    warn!(session = %self.shared.session, error = %e, "watch worker panicked");
                }
            }
        }
    }

    pub fn live_workers(&self) -> usize { self.workers.iter().filter(|h| !h.is_finished()).count() }

    pub fn phase(&self) -> SessionPhase {
        if !self.shared.is_closed() {
            SessionPhase::Streaming
        } else if self.live_workers() > 0 {
            SessionPhase::Closing
        } else {
            SessionPhase::Closed
        }
    }

    pub fn stats(&self) -> FanInStats {
        FanInStats {
            forwarded: self.shared.forwarded.load(Ordering::SeqCst),
            dropped_after_close: self.shared.dropped.load(Ordering::SeqCst),
            closes: self.shared.closes.load(Ordering::SeqCst),
        }
    }
}

impl<K> Stream for ProxyWatch<K> {
    type Item = WatchEvent<K>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.get_mut().rx.poll_recv(cx)
    }
}

impl<K> Drop for ProxyWatch<K> {
    fn drop(&mut self) {
        self.shared.close("handle dropped");
        metrics::decrement_gauge!("meridian_watch_sessions_active", 1.0);
    }
}
