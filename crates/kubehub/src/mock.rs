//! Simple in-memory transport for tests: canned responses and scriptable watch streams.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use futures::channel::mpsc::{unbounded, UnboundedSender};
use futures::StreamExt;
use kinformer_core::{Error, Result, WatchEvent};
use rustc_hash::FxHashMap;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::transport::{ApiRequest, Transport, Verb, WatchChunk, WatchRequest, WatchSource};

#[derive(Default)]
struct MockState {
    /// Queue per (verb, url); the last entry is sticky.
    responses: FxHashMap<(Verb, String), VecDeque<Result<Value>>>,
    requests: Vec<ApiRequest>,
    watches: Vec<(WatchRequest, UnboundedSender<Result<WatchChunk>>)>,
    watch_failures: usize,
}

#[derive(Default)]
pub struct MockTransport {
    state: Mutex<MockState>,
    delay: Option<Duration>,
}

impl MockTransport {
    pub fn new() -> Self { Self::default() }

    /// Every `request` sleeps this long before answering.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(|p| p.into_inner())
    }

    pub fn on(&self, verb: Verb, url: &str, response: Value) { self.respond(verb, url, Ok(response)); }

    pub fn on_error(&self, verb: Verb, url: &str, err: Error) { self.respond(verb, url, Err(err)); }

    pub fn respond(&self, verb: Verb, url: &str, response: Result<Value>) {
        self.lock().responses.entry((verb, url.to_string())).or_default().push_back(response);
    }

    /// Fail the next `n` watch attempts with a transport error.
    pub fn fail_watches(&self, n: usize) { self.lock().watch_failures = n; }

    pub fn requests(&self) -> Vec<ApiRequest> { self.lock().requests.clone() }

    pub fn count(&self, verb: Verb, url: &str) -> usize {
        self.lock().requests.iter().filter(|r| r.verb == verb && r.url == url).count()
    }

    pub fn watch_requests(&self) -> Vec<WatchRequest> { self.lock().watches.iter().map(|(r, _)| r.clone()).collect() }

    pub fn watch_count(&self, url: &str) -> usize { self.lock().watches.iter().filter(|(r, _)| r.url == url).count() }

    /// Deliver one event on the most recent open watch for `url`.
    pub fn push_event(&self, url: &str, event: &WatchEvent) -> bool {
        match serde_json::to_string(event) {
            Ok(text) => self.push_chunk(url, WatchChunk::Frame(text)),
            Err(_) => false,
        }
    }

    pub fn push_chunk(&self, url: &str, chunk: WatchChunk) -> bool {
        let st = self.lock();
        st.watches
            .iter()
            .rev()
            .find(|(r, tx)| r.url == url && !tx.is_closed())
            .map(|(_, tx)| tx.unbounded_send(Ok(chunk)).is_ok())
            .unwrap_or(false)
    }

    /// End every open watch stream for `url`, as a dropped connection would.
    pub fn close_watch(&self, url: &str) {
        let mut st = self.lock();
        st.watches.iter_mut().filter(|(r, _)| r.url == url).for_each(|(_, tx)| tx.close_channel());
    }

    /// Wait until at least `n` watches were opened on `url`.
    pub async fn wait_for_watch(&self, url: &str, n: usize) {
        while self.watch_count(url) < n {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn request(&self, req: ApiRequest) -> Result<Value> {
        if let Some(d) = self.delay {
            tokio::time::sleep(d).await;
        }
        let mut st = self.lock();
        st.requests.push(req.clone());
        let key = (req.verb, req.url.clone());
        match st.responses.get_mut(&key) {
            Some(q) if q.len() > 1 => q.pop_front().unwrap_or_else(|| Err(Error::transport("empty"))),
            Some(q) => q.front().cloned().unwrap_or_else(|| Err(Error::transport("empty"))),
            None => Err(Error::NotFound { identity: req.url }),
        }
    }

    async fn watch(&self, req: WatchRequest, cancel: CancellationToken) -> Result<WatchSource> {
        let mut st = self.lock();
        let (tx, rx) = unbounded();
        st.watches.push((req, tx));
        if st.watch_failures > 0 {
            st.watch_failures -= 1;
            return Err(Error::transport("watch refused"));
        }
        Ok(rx.take_until(cancel.cancelled_owned()).boxed())
    }
}
