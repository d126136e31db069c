// src/core/trace/mod.rs

//! The Trace Ring (spec §4.I): a bounded, strict-FIFO in-memory span buffer
//! with query, service-map, and export. Single-writer-queue + copy-on-read
//! snapshot under a short lock mirrors the Informer cache's concurrency
//! policy (`core/informer/cache.rs`), generalized from "objects keyed by
//! UID" to "spans in FIFO arrival order".

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{HashSet, VecDeque};
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SpanStatus {
    Ok,
    Error,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TraceSpan {
    pub trace_id: String,
    pub span_id: String,
    pub parent_id: Option<String>,
    pub service: String,
    pub operation: String,
    pub start: DateTime<Utc>,
    pub duration: Duration,
    pub attributes: std::collections::BTreeMap<String, String>,
    pub status: SpanStatus,
}

#[derive(Debug, Default, Clone)]
pub struct TraceQuery {
    pub since: Option<DateTime<Utc>>,
    pub until: Option<DateTime<Utc>>,
    pub service: Option<String>,
    pub operation: Option<String>,
    pub min_duration: Option<Duration>,
    pub status: Option<SpanStatus>,
    pub limit: Option<usize>,
}

impl TraceQuery {
    fn matches(&self, span: &TraceSpan) -> bool {
        if let Some(since) = self.since {
            if span.start < since {
                return false;
            }
        }
        if let Some(until) = self.until {
            if span.start > until {
                return false;
            }
        }
        if let Some(service) = &self.service {
            if &span.service != service {
                return false;
            }
        }
        if let Some(op) = &self.operation {
            if &span.operation != op {
                return false;
            }
        }
        if let Some(min_dur) = self.min_duration {
            if span.duration < min_dur {
                return false;
            }
        }
        if let Some(status) = self.status {
            if span.status != status {
                return false;
            }
        }
        true
    }
}

#[derive(Debug, Serialize)]
pub struct TracePage {
    pub spans: Vec<TraceSpan>,
    pub total_matched: usize,
}

#[derive(Debug, Serialize)]
pub struct ServiceEdge {
    pub from: String,
    pub to: String,
    pub call_count: usize,
}

#[derive(Debug, Serialize)]
pub struct ServiceMap {
    pub services: Vec<String>,
    pub edges: Vec<ServiceEdge>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExportFormat {
    Json,
    Otlp,
}

/// Seam for an optional, larger-bound persistence backend (spec §4.I:
/// "optional, persist to the credential store's SQLite if present"). No
/// implementor ships with this crate; the ring works in pure in-memory
/// mode until one is wired in.
pub trait TracePersistence: Send + Sync {
    fn persist(&self, span: &TraceSpan);
}

pub struct TraceRing {
    capacity: usize,
    spans: Mutex<VecDeque<TraceSpan>>,
    persistence: Option<Box<dyn TracePersistence>>,
}

impl TraceRing {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            spans: Mutex::new(VecDeque::with_capacity(capacity.min(4096))),
            persistence: None,
        }
    }

    pub fn with_persistence(capacity: usize, persistence: Box<dyn TracePersistence>) -> Self {
        Self {
            capacity,
            spans: Mutex::new(VecDeque::with_capacity(capacity.min(4096))),
            persistence: Some(persistence),
        }
    }

    /// Strict FIFO eviction: the oldest span is dropped once the ring is full.
    pub fn ingest(&self, span: TraceSpan) {
        if let Some(p) = &self.persistence {
            p.persist(&span);
        }
        let mut spans = self.spans.lock();
        if spans.len() >= self.capacity {
            spans.pop_front();
        }
        spans.push_back(span);
    }

    pub fn len(&self) -> usize {
        self.spans.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Copy-on-read snapshot: clones under a short lock, filters and pages
    /// outside it so readers never hold the lock during the scan.
    pub fn query(&self, q: &TraceQuery) -> TracePage {
        let snapshot: Vec<TraceSpan> = self.spans.lock().iter().cloned().collect();
        let matched: Vec<TraceSpan> = snapshot.into_iter().filter(|s| q.matches(s)).collect();
        let total_matched = matched.len();
        let spans = match q.limit {
            Some(limit) => matched.into_iter().take(limit).collect(),
            None => matched,
        };
        TracePage { spans, total_matched }
    }

    /// Builds a service call graph from parent/child span relationships
    /// within each trace: an edge `parent.service -> child.service` per
    /// distinct child span sharing that trace, summed across traces.
    pub fn service_map(&self) -> ServiceMap {
        let snapshot: Vec<TraceSpan> = self.spans.lock().iter().cloned().collect();
        let by_span: std::collections::HashMap<&str, &TraceSpan> =
            snapshot.iter().map(|s| (s.span_id.as_str(), s)).collect();

        let mut services: HashSet<String> = HashSet::new();
        let mut edge_counts: std::collections::HashMap<(String, String), usize> = std::collections::HashMap::new();

        for span in &snapshot {
            services.insert(span.service.clone());
            if let Some(parent_id) = &span.parent_id {
                if let Some(parent) = by_span.get(parent_id.as_str()) {
                    if parent.service != span.service {
                        *edge_counts
                            .entry((parent.service.clone(), span.service.clone()))
                            .or_insert(0) += 1;
                    }
                }
            }
        }

        let edges = edge_counts
            .into_iter()
            .map(|((from, to), call_count)| ServiceEdge { from, to, call_count })
            .collect();

        ServiceMap {
            services: services.into_iter().collect(),
            edges,
        }
    }

    /// JSON export is fully implemented; OTLP export is a documented stub
    /// (DESIGN.md's Open Question decision) returning `Invalid` until an
    /// OTLP exporter crate is introduced.
    pub fn export(&self, format: ExportFormat) -> crate::core::errors::Result<Vec<u8>> {
        match format {
            ExportFormat::Json => {
                let snapshot: Vec<TraceSpan> = self.spans.lock().iter().cloned().collect();
                serde_json::to_vec(&snapshot).map_err(crate::core::errors::ClusterMuxError::from)
            }
            ExportFormat::Otlp => Err(crate::core::errors::ClusterMuxError::Invalid(
                "OTLP export is not implemented".into(),
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn span(trace: &str, id: &str, parent: Option<&str>, service: &str) -> TraceSpan {
        TraceSpan {
            trace_id: trace.into(),
            span_id: id.into(),
            parent_id: parent.map(String::from),
            service: service.into(),
            operation: "op".into(),
            start: Utc::now(),
            duration: Duration::from_millis(5),
            attributes: Default::default(),
            status: SpanStatus::Ok,
        }
    }

    #[test]
    fn fifo_eviction_drops_oldest() {
        let ring = TraceRing::new(2);
        ring.ingest(span("t", "1", None, "a"));
        ring.ingest(span("t", "2", None, "a"));
        ring.ingest(span("t", "3", None, "a"));
        let page = ring.query(&TraceQuery::default());
        assert_eq!(page.spans.len(), 2);
        assert_eq!(page.spans[0].span_id, "2");
        assert_eq!(page.spans[1].span_id, "3");
    }

    #[test]
    fn query_filters_by_service_and_status() {
        let ring = TraceRing::new(10);
        ring.ingest(span("t", "1", None, "api"));
        let mut errored = span("t", "2", None, "db");
        errored.status = SpanStatus::Error;
        ring.ingest(errored);

        let page = ring.query(&TraceQuery {
            status: Some(SpanStatus::Error),
            ..Default::default()
        });
        assert_eq!(page.spans.len(), 1);
        assert_eq!(page.spans[0].service, "db");
    }

    #[test]
    fn service_map_builds_edge_between_parent_and_child() {
        let ring = TraceRing::new(10);
        ring.ingest(span("t", "root", None, "gateway"));
        ring.ingest(span("t", "child", Some("root"), "backend"));
        let map = ring.service_map();
        assert_eq!(map.edges.len(), 1);
        assert_eq!(map.edges[0].from, "gateway");
        assert_eq!(map.edges[0].to, "backend");
    }

    #[test]
    fn otlp_export_is_a_documented_stub() {
        let ring = TraceRing::new(10);
        let err = ring.export(ExportFormat::Otlp).unwrap_err();
        assert_eq!(err.kind(), "invalid");
    }

    #[test]
    fn json_export_round_trips_span_count() {
        let ring = TraceRing::new(10);
        ring.ingest(span("t", "1", None, "a"));
        let bytes = ring.export(ExportFormat::Json).unwrap();
        let spans: Vec<TraceSpan> = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(spans.len(), 1);
    }
}
