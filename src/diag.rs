//! Diagnostics: measurement spans and logger context prefixes.
//!
//! The converter layers produce a tree of timing spans that the scheduler
//! aggregates on the main thread. Workers do not share the tree; they report
//! their metrics inside task replies and the scheduler records them here.

use std::collections::BTreeMap;
use std::time::Instant;

/// Where a log line originates. The prefix is a pure function of the kind,
/// so concurrent lines from the same worker always carry the same prefix and
/// two distinct worker indices can never collide.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ContextKind {
    Main,
    Bootstrap,
    Worker(u8),
}

impl ContextKind {
    pub fn prefix(self) -> String {
        match self {
            ContextKind::Main => "main".to_string(),
            ContextKind::Bootstrap => "bootstrap".to_string(),
            ContextKind::Worker(n) => format!("worker-{n:02}"),
        }
    }
}

/// Logger context handed to every converter at construction.
#[derive(Debug, Clone)]
pub struct LogContext {
    kind: ContextKind,
    prefix: String,
}

impl LogContext {
    pub fn new(kind: ContextKind) -> Self {
        LogContext {
            prefix: kind.prefix(),
            kind,
        }
    }

    pub fn kind(&self) -> ContextKind {
        self.kind
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }
}

impl Default for LogContext {
    fn default() -> Self {
        LogContext::new(ContextKind::Main)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SpanId(pub u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpanStatus {
    Open,
    Closed,
    Aborted,
}

/// One measurement span. Timestamps are milliseconds since the owning
/// [`SpanTree`] was created.
#[derive(Debug, Clone)]
pub struct Span {
    pub id: SpanId,
    pub name: String,
    pub parent: Option<SpanId>,
    pub attributes: BTreeMap<String, String>,
    pub metrics: BTreeMap<String, f64>,
    pub start_ms: f64,
    pub end_ms: Option<f64>,
    pub status: SpanStatus,
}

/// Span tree owned by the scheduler thread.
#[derive(Debug)]
pub struct SpanTree {
    epoch: Instant,
    spans: Vec<Span>,
}

impl SpanTree {
    pub fn new() -> Self {
        SpanTree {
            epoch: Instant::now(),
            spans: Vec::new(),
        }
    }

    fn now_ms(&self) -> f64 {
        self.epoch.elapsed().as_secs_f64() * 1000.0
    }

    pub fn open(&mut self, name: &str, parent: Option<SpanId>) -> SpanId {
        let id = SpanId(self.spans.len() as u64);
        let start_ms = self.now_ms();
        self.spans.push(Span {
            id,
            name: name.to_string(),
            parent,
            attributes: BTreeMap::new(),
            metrics: BTreeMap::new(),
            start_ms,
            end_ms: None,
            status: SpanStatus::Open,
        });
        id
    }

    pub fn set_attribute(&mut self, id: SpanId, key: &str, value: impl Into<String>) {
        if let Some(span) = self.spans.get_mut(id.0 as usize) {
            span.attributes.insert(key.to_string(), value.into());
        }
    }

    /// Adds to a numeric metric, creating it at zero first.
    pub fn add_metric(&mut self, id: SpanId, key: &str, value: f64) {
        if let Some(span) = self.spans.get_mut(id.0 as usize) {
            *span.metrics.entry(key.to_string()).or_insert(0.0) += value;
        }
    }

    pub fn close(&mut self, id: SpanId) {
        let end = self.now_ms();
        if let Some(span) = self.spans.get_mut(id.0 as usize) {
            if span.status == SpanStatus::Open {
                span.end_ms = Some(end);
                span.status = SpanStatus::Closed;
            }
        }
    }

    pub fn abort(&mut self, id: SpanId) {
        let end = self.now_ms();
        if let Some(span) = self.spans.get_mut(id.0 as usize) {
            if span.status == SpanStatus::Open {
                span.end_ms = Some(end);
                span.status = SpanStatus::Aborted;
            }
        }
    }

    /// Aborts every span still open. Called on cancellation.
    pub fn abort_open(&mut self) {
        let end = self.now_ms();
        for span in &mut self.spans {
            if span.status == SpanStatus::Open {
                span.end_ms = Some(end);
                span.status = SpanStatus::Aborted;
            }
        }
    }

    pub fn spans(&self) -> &[Span] {
        &self.spans
    }

    pub fn get(&self, id: SpanId) -> Option<&Span> {
        self.spans.get(id.0 as usize)
    }
}

impl Default for SpanTree {
    fn default() -> Self {
        SpanTree::new()
    }
}
