//! An in-memory [`Transport`] for driving workflows without a network.
//!
//! Replies are produced by a handler closure and delayed with [`tokio::time::sleep`], so tests
//! running with a paused clock observe exact durations.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use reqwest::StatusCode;
use serde_json::Value;
use tokio::time::Instant;

use crate::error::Result;
use crate::http::{Reply, Transport};

/// What the mock answers to a single call.
#[derive(Clone, Debug)]
pub struct MockReply {
    pub delay: Duration,
    pub body: String,
}

impl MockReply {
    pub fn json(delay: Duration, body: Value) -> Self {
        Self {
            delay,
            body: body.to_string(),
        }
    }
}

/// A call observed by the mock.
#[derive(Clone, Debug)]
pub struct Call {
    pub endpoint: String,
    pub body: Value,
    pub started: Instant,
    /// When the reply was sent, or `None` while the call is outstanding.
    pub finished: Option<Instant>,
}

type Handler = dyn Fn(&str, &Value) -> MockReply + Send + Sync;

pub struct MockTransport {
    handler: Box<Handler>,
    calls: Mutex<Vec<Call>>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl fmt::Debug for MockTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MockTransport")
            .field("calls", &self.calls)
            .field("in_flight", &self.in_flight)
            .field("max_in_flight", &self.max_in_flight)
            .finish_non_exhaustive()
    }
}

impl MockTransport {
    pub fn new<F>(handler: F) -> Arc<Self>
    where
        F: Fn(&str, &Value) -> MockReply + Send + Sync + 'static,
    {
        Arc::new(Self {
            handler: Box::new(handler),
            calls: Mutex::new(Vec::new()),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
        })
    }

    /// All calls so far, in the order they were started.
    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    /// The highest number of calls that were outstanding at the same time.
    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    /// The highest number of tasks that had calls outstanding at the same time.
    ///
    /// A task spans from the start of its first call to the end of its last call. `task_of`
    /// extracts the task index from a call.
    pub fn max_tasks_in_flight(&self, task_of: impl Fn(&Call) -> usize) -> usize {
        let mut spans: BTreeMap<usize, (Instant, Instant)> = BTreeMap::new();
        for call in self.calls() {
            let finished = call.finished.expect("call still outstanding");
            let span = spans.entry(task_of(&call)).or_insert((call.started, finished));
            span.0 = span.0.min(call.started);
            span.1 = span.1.max(finished);
        }

        // ends sort before starts at the same instant, a freed permit is reused immediately
        let mut events: Vec<(Instant, i32)> = spans
            .values()
            .flat_map(|&(start, end)| [(start, 1), (end, -1)])
            .collect();
        events.sort();

        let mut current = 0;
        let mut max = 0;
        for (_, delta) in events {
            current += delta;
            max = max.max(current);
        }
        max as usize
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn post(&self, endpoint: &str, body: Bytes, max_size: usize) -> Result<Reply> {
        let body: Value = serde_json::from_slice(&body)?;
        let reply = (self.handler)(endpoint, &body);

        let position = {
            let mut calls = self.calls.lock().unwrap();
            calls.push(Call {
                endpoint: endpoint.to_owned(),
                body,
                started: Instant::now(),
                finished: None,
            });
            calls.len() - 1
        };

        let current = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(current, Ordering::SeqCst);
        tokio::time::sleep(reply.delay).await;
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        self.calls.lock().unwrap()[position].finished = Some(Instant::now());

        let mut body = Bytes::from(reply.body);
        let truncated = body.len() > max_size;
        body.truncate(max_size);

        Ok(Reply {
            status: StatusCode::OK,
            body,
            truncated,
        })
    }
}

/// Asserts that a measured duration in seconds matches `expected`.
///
/// Timers may fire up to a millisecond late, even on a paused clock.
#[track_caller]
pub fn assert_secs(actual: f64, expected: f64) {
    assert!(
        (actual - expected).abs() < 0.01,
        "expected {expected}s, got {actual}s"
    );
}
