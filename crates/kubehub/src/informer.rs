//! List + watch session keeping one remote collection in sync.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use futures::StreamExt;
use kinformer_core::addressing::ResourceTarget;
use kinformer_core::{reconcile, Error, EventType, Identified, ObjectKey, Result, UnstructuredList, WatchEvent};
use metrics::{counter, histogram};
use rustc_hash::FxHashMap;
use tokio::sync::{broadcast, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::bus::{MutationBus, MutationNotice};
use crate::discovery::ApiVersionResourceCache;
use crate::transport::{ApiRequest, Transport, WatchMode, WatchRequest};
use crate::watch::{sleep_until_opt, Backoff, ChannelState, FrameDecoder, Heartbeat, DEFAULT_BACKOFF_BASE, DEFAULT_BACKOFF_MAX, DEFAULT_HEARTBEAT};

#[derive(Debug, Clone)]
pub struct InformerConfig {
    /// Backend base URL for LIST and chunked watches.
    pub base_path: String,
    /// When set, watches go over WebSocket against this base instead.
    pub watch_ws_base_path: Option<String>,
    /// Server heartbeat interval; `None` disables the dead-man timer.
    pub heartbeat: Option<Duration>,
    pub backoff_base: Duration,
    pub backoff_max: Duration,
}

impl InformerConfig {
    pub fn new(base_path: impl Into<String>) -> Self {
        Self {
            base_path: base_path.into(),
            watch_ws_base_path: None,
            heartbeat: Some(DEFAULT_HEARTBEAT),
            backoff_base: DEFAULT_BACKOFF_BASE,
            backoff_max: DEFAULT_BACKOFF_MAX,
        }
    }

    pub fn watch_mode(&self) -> WatchMode {
        if self.watch_ws_base_path.is_some() { WatchMode::WebSocket } else { WatchMode::Chunked }
    }
}

/// Receives snapshots and user-visible events from an informer session.
#[async_trait]
pub trait InformerSink: Send + Sync + 'static {
    /// Initial snapshot and every relist arrive with `event == None`; each
    /// applied event arrives with the updated collection.
    async fn on_response(&self, list: &UnstructuredList, event: Option<&WatchEvent>) -> Result<()>;

    /// A change callers should be told about. Always follows `on_response`.
    async fn on_event(&self, event: &WatchEvent);
}

/// Stops a session. Idempotent; clones share the session.
#[derive(Debug, Clone)]
pub struct StopHandle {
    cancel: CancellationToken,
    state: watch::Receiver<ChannelState>,
}

impl StopHandle {
    pub fn stop(&self) { self.cancel.cancel(); }
    pub fn is_stopped(&self) -> bool { self.cancel.is_cancelled() }
    pub fn state(&self) -> watch::Receiver<ChannelState> { self.state.clone() }
    pub fn current_state(&self) -> ChannelState { *self.state.borrow() }

    /// Resolves once the session task has exited.
    pub async fn closed(&self) {
        let mut rx = self.state.clone();
        let _ = rx.wait_for(|s| *s == ChannelState::Closed).await;
    }
}

pub struct ResourceInformer {
    target: ResourceTarget,
    config: InformerConfig,
    transport: Arc<dyn Transport>,
    discovery: Arc<ApiVersionResourceCache>,
    bus: MutationBus,
}

impl ResourceInformer {
    pub fn new(
        target: ResourceTarget,
        config: InformerConfig,
        transport: Arc<dyn Transport>,
        discovery: Arc<ApiVersionResourceCache>,
        bus: MutationBus,
    ) -> Self {
        Self { target, config, transport, discovery, bus }
    }

    pub fn target(&self) -> &ResourceTarget { &self.target }

    pub fn collection_url(&self) -> String { self.target.url(&self.config.base_path) }

    pub fn watch_request(&self, resource_version: &str) -> WatchRequest {
        let base = self.config.watch_ws_base_path.as_deref().unwrap_or(&self.config.base_path);
        WatchRequest::new(self.target.url(base), resource_version, self.config.watch_mode())
    }

    /// One LIST round trip. Items missing `kind`/`apiVersion` inherit the list's.
    pub async fn list(&self, cancel: &CancellationToken) -> Result<UnstructuredList> {
        let url = self.collection_url();
        let t0 = Instant::now();
        let value = tokio::select! {
            _ = cancel.cancelled() => return Err(Error::Cancelled),
            r = self.transport.request(ApiRequest::get(&url)) => r?,
        };
        let mut list = UnstructuredList::from_value(value)?;
        let kind = list.item_kind().to_string();
        for item in list.items.iter_mut() {
            if item.kind.is_empty() {
                item.kind = kind.clone();
            }
            if item.api_version.is_empty() {
                item.api_version = list.api_version.clone();
            }
        }
        histogram!("informer_list_ms", t0.elapsed().as_secs_f64() * 1000.0);
        counter!("informer_lists_total", 1u64);
        info!(url = %url, items = list.items.len(), rv = ?list.resource_version(), "list complete");
        Ok(list)
    }

    /// Resolve, LIST, hand the snapshot to `sink`, then keep it current in a
    /// background task. A failed initial LIST is returned to the caller;
    /// later failures reconnect with backoff.
    pub async fn list_watch(self, sink: Arc<dyn InformerSink>, cancel: CancellationToken) -> Result<StopHandle> {
        let cancel = cancel.child_token();
        let descriptor = self
            .discovery
            .resolve_by_name(&self.target.resource_base_path, &self.target.resource, Some(&cancel))
            .await?
            .ok_or_else(|| Error::UnrecognizedResource {
                api_version: self.target.resource_base_path.clone(),
                kind: self.target.resource.clone(),
            })?;
        let watchable = descriptor.supports("watch");
        let bus_rx = self.bus.subscribe();
        let list = self.list(&cancel).await?;
        sink.on_response(&list, None).await?;

        if !watchable {
            info!(resource = %self.target.resource, "resource has no watch verb; local mutations only");
        }
        let (session, state) = Session::new(self, sink, list, bus_rx, cancel.clone(), watchable);
        tokio::spawn(session.run());
        Ok(StopHandle { cancel, state })
    }
}

/// Unanswered echoes older than this are forgotten.
const ECHO_TTL: Duration = Duration::from_secs(60);
const MAX_ECHOES: usize = 1024;

/// A local change already surfaced, awaiting its network copy.
struct Echo {
    event_type: EventType,
    resource_version: Option<String>,
    at: tokio::time::Instant,
}

enum Outcome {
    Stopped,
    Disconnected,
}

struct Session {
    informer: ResourceInformer,
    sink: Arc<dyn InformerSink>,
    list: UnstructuredList,
    bus_rx: broadcast::Receiver<Arc<MutationNotice>>,
    state: watch::Sender<ChannelState>,
    cancel: CancellationToken,
    backoff: Backoff,
    heartbeat: Heartbeat,
    echoes: FxHashMap<ObjectKey, Echo>,
    watchable: bool,
}

impl Session {
    fn new(
        informer: ResourceInformer,
        sink: Arc<dyn InformerSink>,
        list: UnstructuredList,
        bus_rx: broadcast::Receiver<Arc<MutationNotice>>,
        cancel: CancellationToken,
        watchable: bool,
    ) -> (Self, watch::Receiver<ChannelState>) {
        let (state, state_rx) = watch::channel(ChannelState::Idle);
        let backoff = Backoff::new(informer.config.backoff_base, informer.config.backoff_max);
        let heartbeat = Heartbeat::new(informer.config.heartbeat);
        let session = Session {
            informer,
            sink,
            list,
            bus_rx,
            state,
            cancel,
            backoff,
            heartbeat,
            echoes: FxHashMap::default(),
            watchable,
        };
        (session, state_rx)
    }

    async fn run(mut self) {
        loop {
            let outcome = if self.watchable { self.watch_once().await } else { self.local_only().await };
            match outcome {
                Outcome::Stopped => break,
                Outcome::Disconnected => {
                    self.state.send_replace(ChannelState::Reconnecting);
                    if !self.relist().await {
                        break;
                    }
                }
            }
        }
        self.state.send_replace(ChannelState::Closed);
        debug!(resource = %self.informer.target.resource, "informer session closed");
    }

    async fn watch_once(&mut self) -> Outcome {
        self.state.send_replace(ChannelState::Connecting);
        let rv = self.list.resource_version().unwrap_or_default().to_string();
        let req = self.informer.watch_request(&rv);
        let url = req.url.clone();
        let conn = self.cancel.child_token();
        let opened = tokio::select! {
            _ = self.cancel.cancelled() => return Outcome::Stopped,
            r = self.informer.transport.watch(req, conn.clone()) => r,
        };
        let mut stream = match opened {
            Ok(s) => s,
            Err(e) => {
                warn!(url = %url, error = %e, "watch connect failed");
                return Outcome::Disconnected;
            }
        };
        self.state.send_replace(ChannelState::Open);
        self.backoff.reset();
        info!(url = %url, rv = %rv, "watch open");

        let mut decoder = FrameDecoder::new();
        let mut deadline = self.heartbeat.deadline();
        let outcome = 'conn: loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break Outcome::Stopped,
                _ = sleep_until_opt(deadline) => {
                    warn!(url = %url, "no heartbeat within timeout; closing watch");
                    break Outcome::Disconnected;
                }
                notice = self.bus_rx.recv() => self.on_notice(notice).await,
                chunk = stream.next() => match chunk {
                    Some(Ok(chunk)) => {
                        deadline = self.heartbeat.deadline();
                        for ev in decoder.decode(chunk) {
                            if !self.on_network_event(ev).await {
                                break 'conn Outcome::Disconnected;
                            }
                        }
                    }
                    Some(Err(e)) => {
                        warn!(url = %url, error = %e, "watch stream error");
                        break Outcome::Disconnected;
                    }
                    None => {
                        info!(url = %url, "watch stream ended");
                        break Outcome::Disconnected;
                    }
                },
            }
        };
        conn.cancel();
        outcome
    }

    async fn local_only(&mut self) -> Outcome {
        self.state.send_replace(ChannelState::Open);
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => return Outcome::Stopped,
                notice = self.bus_rx.recv() => self.on_notice(notice).await,
            }
        }
    }

    /// Sleep per backoff, then LIST again until it succeeds. `false` when stopped meanwhile.
    async fn relist(&mut self) -> bool {
        loop {
            let delay = self.backoff.next_delay();
            counter!("informer_reconnects_total", 1u64);
            info!(
                resource = %self.informer.target.resource,
                attempt = self.backoff.attempt(),
                delay_ms = delay.as_millis() as u64,
                "scheduling reconnect"
            );
            tokio::select! {
                _ = self.cancel.cancelled() => return false,
                _ = tokio::time::sleep(delay) => {}
            }
            match self.informer.list(&self.cancel).await {
                Ok(list) => {
                    self.list = list;
                    self.echoes.clear();
                    if let Err(e) = self.sink.on_response(&self.list, None).await {
                        warn!(error = %e, "sink rejected relisted snapshot");
                    }
                    return true;
                }
                Err(Error::Cancelled) => return false,
                Err(e) => warn!(resource = %self.informer.target.resource, error = %e, "relist failed"),
            }
        }
    }

    /// `false` when the server reported a stream error and the channel must reconnect.
    async fn on_network_event(&mut self, ev: WatchEvent) -> bool {
        match ev.event_type {
            EventType::Ping => true,
            EventType::Bookmark => {
                if let Some(rv) = ev.object.resource_version() {
                    self.list.metadata.resource_version = Some(rv.to_string());
                }
                true
            }
            EventType::Error => {
                warn!(resource = %self.informer.target.resource, status = ?ev.object.body.get("message"), "watch error event");
                false
            }
            EventType::Added | EventType::Modified | EventType::Deleted => {
                let key = ev.object.key();
                let echo = self.echoes.remove(&key);
                let is_echo = matches!(&echo, Some(e) if e.event_type == ev.event_type
                    && (e.resource_version.is_none() || e.resource_version.as_deref() == ev.object.resource_version()));
                if let Some(rv) = ev.object.resource_version() {
                    self.list.metadata.resource_version = Some(rv.to_string());
                }
                self.apply(ev, !is_echo).await;
                true
            }
        }
    }

    async fn on_notice(&mut self, notice: std::result::Result<Arc<MutationNotice>, broadcast::error::RecvError>) {
        let notice = match notice {
            Ok(n) => n,
            Err(broadcast::error::RecvError::Lagged(n)) => {
                warn!(skipped = n, "mutation bus lagged");
                return;
            }
            Err(broadcast::error::RecvError::Closed) => return,
        };
        if notice.base_path != self.informer.config.base_path {
            return;
        }
        let admitted: Vec<_> = notice.items.iter().filter(|o| self.list.admits(o)).cloned().collect();
        for obj in admitted {
            let key = obj.key();
            let existed = self.list.items.iter().any(|it| it.object_key() == key);
            let rv = match notice.event_type {
                EventType::Deleted => None,
                _ => obj.resource_version().map(str::to_string),
            };
            let ev = WatchEvent::new(notice.event_type, obj);
            if existed {
                self.apply(ev, false).await;
            } else {
                if self.watchable {
                    self.expect_echo(key, notice.event_type, rv);
                }
                self.apply(ev, true).await;
            }
        }
    }

    /// Remember a surfaced change so its network copy stays silent. Without
    /// a watch stream no copy ever arrives, so nothing is kept.
    fn expect_echo(&mut self, key: ObjectKey, event_type: EventType, resource_version: Option<String>) {
        let now = tokio::time::Instant::now();
        self.echoes.retain(|_, e| now.duration_since(e.at) < ECHO_TTL);
        if self.echoes.len() >= MAX_ECHOES {
            let oldest = self.echoes.iter().min_by_key(|(_, e)| e.at).map(|(k, _)| k.clone());
            if let Some(k) = oldest {
                self.echoes.remove(&k);
            }
        }
        self.echoes.insert(key, Echo { event_type, resource_version, at: now });
    }

    async fn apply(&mut self, ev: WatchEvent, notify: bool) {
        reconcile(&mut self.list.items, ev.event_type, ev.object.clone());
        counter!("informer_events_total", 1u64);
        if let Err(e) = self.sink.on_response(&self.list, Some(&ev)).await {
            warn!(error = %e, event = %ev.event_type, "sink failed to apply event");
        }
        if notify {
            self.sink.on_event(&ev).await;
        } else {
            counter!("informer_events_suppressed_total", 1u64);
            debug!(event = %ev.event_type, id = %ev.object.identity(), "notification suppressed");
        }
    }
}
