use std::{
    collections::{BTreeMap, HashMap, VecDeque},
    sync::{
        atomic::{AtomicU64, Ordering},
        Mutex, MutexGuard, PoisonError,
    },
    time::Duration,
};

use serde::Serialize;

use crate::error::LimitKind;

const LATENCY_WINDOW: usize = 100;

#[derive(Debug, Default)]
struct BatchAverage {
    count: u64,
    average: f64,
}

/// Gateway counters. Cheap to update from any task; shared through an `Arc`.
#[derive(Debug, Default)]
pub struct GatewayMetrics {
    connections_total: AtomicU64,
    connections_active: AtomicU64,
    connection_errors: AtomicU64,
    auth_failures: AtomicU64,
    messages_received: AtomicU64,
    messages_sent: AtomicU64,
    bytes_received: AtomicU64,
    bytes_sent: AtomicU64,
    compressed_frames: AtomicU64,
    protocol_errors: AtomicU64,
    upstream_errors: AtomicU64,
    delivery_errors: AtomicU64,
    events_published: AtomicU64,
    events_delivered: AtomicU64,
    heartbeat_evictions: AtomicU64,
    batches: Mutex<BatchAverage>,
    latency_ms: Mutex<VecDeque<f64>>,
    admission_rejections: Mutex<HashMap<String, u64>>,
    rate_limited: Mutex<HashMap<String, u64>>,
}

/// Point-in-time copy of every counter.
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct MetricsSnapshot {
    pub connections_total: u64,
    pub connections_active: u64,
    pub connection_errors: u64,
    pub auth_failures: u64,
    pub messages_received: u64,
    pub messages_sent: u64,
    pub bytes_received: u64,
    pub bytes_sent: u64,
    pub compressed_frames: u64,
    pub protocol_errors: u64,
    pub upstream_errors: u64,
    pub delivery_errors: u64,
    pub events_published: u64,
    pub events_delivered: u64,
    pub heartbeat_evictions: u64,
    pub batches_total: u64,
    pub average_batch_size: f64,
    pub average_latency_ms: f64,
    pub admission_rejections: BTreeMap<String, u64>,
    pub rate_limited: BTreeMap<String, u64>,
    pub subscribers: BTreeMap<String, usize>,
}

impl GatewayMetrics {
    pub fn connection_opened(&self) {
        self.connections_total.fetch_add(1, Ordering::Relaxed);
        self.connections_active.fetch_add(1, Ordering::Relaxed);
    }

    pub fn connection_closed(&self) {
        let _ = self.connections_active.fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| {
            Some(n.saturating_sub(1))
        });
    }

    pub fn connection_error(&self) {
        self.connection_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn auth_failure(&self) {
        self.auth_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn admission_rejected(&self, reason: &str) {
        increment_label_counter(&self.admission_rejections, reason, 1);
    }

    pub fn rate_limited(&self, kind: LimitKind) {
        increment_label_counter(&self.rate_limited, kind.as_str(), 1);
    }

    pub fn message_received(&self, bytes: usize) {
        self.messages_received.fetch_add(1, Ordering::Relaxed);
        self.bytes_received.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub fn message_sent(&self, bytes: usize, compressed: bool) {
        self.messages_sent.fetch_add(1, Ordering::Relaxed);
        self.bytes_sent.fetch_add(bytes as u64, Ordering::Relaxed);
        if compressed {
            self.compressed_frames.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn protocol_error(&self) {
        self.protocol_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn upstream_error(&self) {
        self.upstream_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn delivery_error(&self) {
        self.delivery_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn event_published(&self) {
        self.events_published.fetch_add(1, Ordering::Relaxed);
    }

    pub fn events_delivered(&self, count: usize) {
        self.events_delivered.fetch_add(count as u64, Ordering::Relaxed);
    }

    pub fn heartbeat_evicted(&self, count: usize) {
        self.heartbeat_evictions.fetch_add(count as u64, Ordering::Relaxed);
    }

    /// Running average: `avg' = avg + (size - avg) / count`.
    pub fn record_batch(&self, size: usize) {
        let mut batches = lock(&self.batches);
        batches.count += 1;
        batches.average += (size as f64 - batches.average) / batches.count as f64;
    }

    /// Keeps the last 100 samples.
    pub fn record_latency(&self, latency: Duration) {
        let mut samples = lock(&self.latency_ms);
        if samples.len() == LATENCY_WINDOW {
            samples.pop_front();
        }
        samples.push_back(latency.as_secs_f64() * 1000.0);
    }

    pub fn snapshot(&self, subscribers: BTreeMap<String, usize>) -> MetricsSnapshot {
        let (batches_total, average_batch_size) = {
            let batches = lock(&self.batches);
            (batches.count, batches.average)
        };
        let average_latency_ms = {
            let samples = lock(&self.latency_ms);
            if samples.is_empty() {
                0.0
            } else {
                samples.iter().sum::<f64>() / samples.len() as f64
            }
        };

        MetricsSnapshot {
            connections_total: self.connections_total.load(Ordering::Relaxed),
            connections_active: self.connections_active.load(Ordering::Relaxed),
            connection_errors: self.connection_errors.load(Ordering::Relaxed),
            auth_failures: self.auth_failures.load(Ordering::Relaxed),
            messages_received: self.messages_received.load(Ordering::Relaxed),
            messages_sent: self.messages_sent.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            compressed_frames: self.compressed_frames.load(Ordering::Relaxed),
            protocol_errors: self.protocol_errors.load(Ordering::Relaxed),
            upstream_errors: self.upstream_errors.load(Ordering::Relaxed),
            delivery_errors: self.delivery_errors.load(Ordering::Relaxed),
            events_published: self.events_published.load(Ordering::Relaxed),
            events_delivered: self.events_delivered.load(Ordering::Relaxed),
            heartbeat_evictions: self.heartbeat_evictions.load(Ordering::Relaxed),
            batches_total,
            average_batch_size,
            average_latency_ms,
            admission_rejections: sorted(&self.admission_rejections),
            rate_limited: sorted(&self.rate_limited),
            subscribers,
        }
    }
}

impl MetricsSnapshot {
    pub fn render_prometheus(&self) -> String {
        let mut output = String::new();

        let counters: [(&str, &str, u64); 15] = [
            ("gateway_connections_total", "Connections admitted since start.", self.connections_total),
            ("gateway_connection_errors_total", "Socket errors on open connections.", self.connection_errors),
            ("gateway_auth_failures_total", "Rejected or missing authentication tokens.", self.auth_failures),
            ("gateway_messages_received_total", "Inbound client messages.", self.messages_received),
            ("gateway_messages_sent_total", "Outbound frames queued to clients.", self.messages_sent),
            ("gateway_bytes_received_total", "Inbound message bytes.", self.bytes_received),
            ("gateway_bytes_sent_total", "Outbound frame bytes after compression.", self.bytes_sent),
            ("gateway_compressed_frames_total", "Outbound frames sent zlib-compressed.", self.compressed_frames),
            ("gateway_protocol_errors_total", "Malformed or rejected client messages.", self.protocol_errors),
            ("gateway_upstream_errors_total", "Failed or short-circuited event bus calls.", self.upstream_errors),
            ("gateway_delivery_errors_total", "Frames that could not reach a connection.", self.delivery_errors),
            ("gateway_events_published_total", "Events accepted by the event bus.", self.events_published),
            ("gateway_events_delivered_total", "Events handed to subscribers.", self.events_delivered),
            ("gateway_heartbeat_evictions_total", "Connections closed for missed heartbeats.", self.heartbeat_evictions),
            ("gateway_batches_total", "Batch frames flushed.", self.batches_total),
        ];
        for (name, help, value) in counters {
            push_header(&mut output, name, help, "counter");
            output.push_str(&format!("{name} {value}\n"));
        }

        push_header(&mut output, "gateway_connections_active", "Currently open connections.", "gauge");
        output.push_str(&format!("gateway_connections_active {}\n", self.connections_active));

        push_header(&mut output, "gateway_batch_size_average", "Running average events per batch.", "gauge");
        output.push_str(&format!("gateway_batch_size_average {}\n", self.average_batch_size));

        push_header(
            &mut output,
            "gateway_pong_latency_ms",
            "Average ping round trip over the last 100 samples.",
            "gauge",
        );
        output.push_str(&format!("gateway_pong_latency_ms {}\n", self.average_latency_ms));

        push_header(
            &mut output,
            "gateway_admission_rejections_total",
            "Connections refused during admission by reason.",
            "counter",
        );
        append_label_lines(&mut output, "gateway_admission_rejections_total", "reason", &self.admission_rejections);

        push_header(&mut output, "gateway_rate_limited_total", "Rate limit rejections by kind.", "counter");
        append_label_lines(&mut output, "gateway_rate_limited_total", "kind", &self.rate_limited);

        push_header(&mut output, "gateway_subscribers", "Connections subscribed per event type.", "gauge");
        append_label_lines(&mut output, "gateway_subscribers", "event_type", &self.subscribers);

        output
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn increment_label_counter(map: &Mutex<HashMap<String, u64>>, label: &str, delta: u64) {
    let mut guard = lock(map);
    let value = guard.entry(label.to_string()).or_insert(0);
    *value = value.saturating_add(delta);
}

fn sorted(map: &Mutex<HashMap<String, u64>>) -> BTreeMap<String, u64> {
    lock(map).iter().map(|(label, value)| (label.clone(), *value)).collect()
}

fn push_header(output: &mut String, name: &str, help: &str, kind: &str) {
    output.push_str(&format!("# HELP {name} {help}\n# TYPE {name} {kind}\n"));
}

fn append_label_lines<V: std::fmt::Display>(
    output: &mut String,
    metric_name: &str,
    label_name: &str,
    entries: &BTreeMap<String, V>,
) {
    for (label, value) in entries {
        output.push_str(&format!(
            "{metric_name}{{{label_name}=\"{}\"}} {value}\n",
            escape_label_value(label),
        ));
    }
}

fn escape_label_value(value: &str) -> String {
    value.replace('\\', "\\\\").replace('\n', "\\n").replace('"', "\\\"")
}
