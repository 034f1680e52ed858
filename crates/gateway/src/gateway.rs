// The gateway orchestrator.
//
// Every piece of connection state lives in one `ConnectionRegistry` behind an
// async mutex. Handlers never await while holding it: outbound frames go onto
// each connection's channel, and auth validation and bus publishes run with
// the lock released.

use std::borrow::Cow;
use std::future::Future;
use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex, MutexGuard as StdMutexGuard, PoisonError};
use std::time::Duration;

use beacon_common::protocol::ws::{
    now_millis, AckPayload, BatchAction, BatchControlPayload, ConnectedPayload, Envelope,
    EventPayload, MessageType, PingPayload, PublishPayload, SubscribePayload, UnsubscribePayload,
    CURRENT_PROTOCOL_VERSION, SUPPORTED_PROTOCOL_VERSIONS,
};
use beacon_common::types::{GatewayEvent, DEFAULT_EVENT_SOURCE};
use serde::Serialize;
use serde_json::Value;
use tokio::sync::{broadcast::error::RecvError, mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::auth::{AuthDecision, AuthValidator};
use crate::batch::{BatchScheduler, Enqueued};
use crate::bus::{BreakerError, CircuitBreaker, CircuitState, EventBus, PUBLISH_CIRCUIT};
use crate::codec;
use crate::config::{ConfigError, GatewayConfig};
use crate::error::{
    error_envelope, AdmissionError, LimitKind, ProtocolError, RateLimitError, UpstreamError,
};
use crate::heartbeat::{HeartbeatMonitor, SweepReport};
use crate::metrics::{GatewayMetrics, MetricsSnapshot};
use crate::rate_limit::CleanupReport;
use crate::registry::{
    AdmissionRequest, CloseReason, ConnectionInfo, ConnectionRegistry, Outbound,
    RemovedConnection, Route,
};
use crate::subscription::{Subscription, SubscriptionError};

/// What a client presented when opening its socket.
#[derive(Debug, Clone)]
pub struct ConnectRequest {
    pub address: IpAddr,
    pub token: Option<String>,
    /// Id of an earlier connection this one resumes.
    pub requested_id: Option<String>,
    pub protocol: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Admitted {
    pub connection_id: String,
    pub user_id: Option<String>,
}

/// JSON body of `GET /v1/stats`.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GatewayStats {
    pub connections: usize,
    pub subscriptions: usize,
    pub rate_buckets: usize,
    pub blocked_addresses: usize,
    pub publish_circuit: &'static str,
    pub accepting: bool,
    pub metrics: MetricsSnapshot,
}

enum InboundFrame<'a> {
    Text(&'a str),
    /// zlib-compressed JSON from a binary frame.
    Compressed(&'a [u8]),
}

impl InboundFrame<'_> {
    fn len(&self) -> usize {
        match self {
            Self::Text(text) => text.len(),
            Self::Compressed(bytes) => bytes.len(),
        }
    }
}

enum Rejection {
    /// `blocked` is set once the violation put the source address under a
    /// block; every connection from that address is then closed.
    RateLimited { error: RateLimitError, blocked: bool },
    Protocol { error: ProtocolError, correlation_id: Option<String> },
}

impl Rejection {
    fn protocol(error: ProtocolError) -> Self {
        Self::Protocol { error, correlation_id: None }
    }
}

struct PendingPublish {
    event: GatewayEvent,
    correlation_id: String,
}

struct Inner {
    config: GatewayConfig,
    state: Mutex<ConnectionRegistry>,
    batcher: BatchScheduler,
    heartbeat: HeartbeatMonitor,
    metrics: Arc<GatewayMetrics>,
    bus: Arc<dyn EventBus>,
    breaker: CircuitBreaker,
    auth: Option<Arc<dyn AuthValidator>>,
    accepting: AtomicBool,
    /// Number of live socket tasks; shutdown waits for zero.
    open_sockets: watch::Sender<usize>,
    tasks: StdMutex<Vec<JoinHandle<()>>>,
}

#[derive(Clone)]
pub struct Gateway {
    inner: Arc<Inner>,
}

/// Held by a socket task for its whole life.
pub struct SocketGuard {
    gateway: Gateway,
}

impl Drop for SocketGuard {
    fn drop(&mut self) {
        self.gateway.inner.open_sockets.send_modify(|open| *open = open.saturating_sub(1));
    }
}

impl Gateway {
    pub fn new(
        config: GatewayConfig,
        bus: Arc<dyn EventBus>,
        auth: Option<Arc<dyn AuthValidator>>,
        metrics: Arc<GatewayMetrics>,
    ) -> Result<Self, ConfigError> {
        config.validate()?;

        let batcher = BatchScheduler::new(config.batch.clone());
        let registry = ConnectionRegistry::new(
            &config.limits,
            config.rate_limit.clone(),
            batcher.compression_threshold(),
        );
        let (open_sockets, _) = watch::channel(0);

        Ok(Self {
            inner: Arc::new(Inner {
                heartbeat: HeartbeatMonitor::new(config.heartbeat.clone()),
                breaker: CircuitBreaker::new(config.circuit_breaker.clone()),
                state: Mutex::new(registry),
                batcher,
                metrics,
                bus,
                auth,
                accepting: AtomicBool::new(true),
                open_sockets,
                tasks: StdMutex::new(Vec::new()),
                config,
            }),
        })
    }

    pub fn config(&self) -> &GatewayConfig {
        &self.inner.config
    }

    pub fn metrics(&self) -> &Arc<GatewayMetrics> {
        &self.inner.metrics
    }

    pub fn is_accepting(&self) -> bool {
        self.inner.accepting.load(Ordering::SeqCst)
    }

    /// Spawn the bus bridge and the periodic sweeps. Calling it twice is a no-op.
    pub fn start(&self) {
        let mut tasks = self.tasks();
        if !tasks.is_empty() {
            return;
        }

        // Subscribe before returning so nothing published afterwards is missed.
        let mut events = self.inner.bus.subscribe();
        let gateway = self.clone();
        tasks.push(tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(event) => {
                        gateway.dispatch_event(event).await;
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(skipped, "event bridge lagged behind the bus, events dropped");
                    }
                    Err(RecvError::Closed) => {
                        info!("event bus closed, stopping bridge");
                        break;
                    }
                }
            }
        }));

        tasks.push(self.spawn_periodic(self.inner.heartbeat.interval(), |gateway| async move {
            gateway.sweep_heartbeats().await;
        }));

        tasks.push(self.spawn_periodic(self.inner.config.cleanup_interval, |gateway| async move {
            let report = gateway.cleanup().await;
            if report != CleanupReport::default() {
                debug!(
                    buckets_removed = report.buckets_removed,
                    addresses_removed = report.addresses_removed,
                    "rate limiter cleanup"
                );
            }
        }));

        tasks.push(self.spawn_periodic(self.inner.config.metrics_interval, |gateway| async move {
            let snapshot = gateway.metrics_snapshot().await;
            info!(
                connections_active = snapshot.connections_active,
                messages_received = snapshot.messages_received,
                messages_sent = snapshot.messages_sent,
                events_delivered = snapshot.events_delivered,
                batches = snapshot.batches_total,
                average_batch_size = snapshot.average_batch_size,
                average_latency_ms = snapshot.average_latency_ms,
                "gateway metrics"
            );
        }));
    }

    /// Count a live socket task until the guard drops.
    pub fn socket_opened(&self) -> SocketGuard {
        self.inner.open_sockets.send_modify(|open| *open += 1);
        SocketGuard { gateway: self.clone() }
    }

    /// Admission: shutdown and protocol checks, address block and global
    /// ceiling, token validation (lock released), then the registry insert
    /// with the ceiling rechecked and the per-address limit applied.
    pub async fn admit(
        &self,
        request: ConnectRequest,
        outbound: mpsc::UnboundedSender<Outbound>,
    ) -> Result<Admitted, AdmissionError> {
        let address = request.address;
        let result = self.try_admit(request, outbound).await;

        if let Err(error) = &result {
            let metrics = &self.inner.metrics;
            metrics.admission_rejected(error.metric_label());
            match error {
                AdmissionError::MissingToken | AdmissionError::AuthRejected => metrics.auth_failure(),
                AdmissionError::AddressLimit { .. } => {
                    metrics.rate_limited(LimitKind::ConnectionLimit)
                }
                AdmissionError::Blocked { .. } => metrics.rate_limited(LimitKind::Blocked),
                _ => {}
            }
            warn!(%address, reason = error.metric_label(), error = %error, "connection rejected");
        }

        result
    }

    async fn try_admit(
        &self,
        request: ConnectRequest,
        outbound: mpsc::UnboundedSender<Outbound>,
    ) -> Result<Admitted, AdmissionError> {
        if !self.is_accepting() {
            return Err(AdmissionError::ShuttingDown);
        }
        if let Some(protocol) = request.protocol.as_deref() {
            if !SUPPORTED_PROTOCOL_VERSIONS.contains(&protocol) {
                return Err(AdmissionError::UnsupportedProtocol(protocol.to_owned()));
            }
        }

        self.inner.state.lock().await.precheck(
            request.address,
            request.requested_id.as_deref(),
            Instant::now(),
        )?;

        let user_id = self.authenticate(request.token.as_deref()).await?;

        let mut state = self.inner.state.lock().await;
        if !self.is_accepting() {
            return Err(AdmissionError::ShuttingDown);
        }
        let admission = state.admit(
            AdmissionRequest {
                address: request.address,
                requested_id: request.requested_id,
                user_id: user_id.clone(),
            },
            outbound,
            Instant::now(),
        )?;

        if let Some(old) = &admission.superseded {
            self.inner.metrics.connection_closed();
            info!(connection_id = %old.id, "connection superseded by reconnect");
        }
        self.inner.metrics.connection_opened();

        let connection_id = admission.connection_id;
        info!(
            connection_id = %connection_id,
            address = %request.address,
            user_id = user_id.as_deref().unwrap_or("-"),
            "connection admitted"
        );

        let config = &self.inner.config;
        let handshake = ConnectedPayload {
            connection_id: connection_id.clone(),
            user_id: user_id.clone(),
            protocol_version: CURRENT_PROTOCOL_VERSION.to_owned(),
            server_time: now_millis(),
            heartbeat_interval_ms: config.heartbeat.interval.as_millis() as u64,
            max_message_size: config.limits.max_message_size_bytes,
            compression: config.batch.compression_enabled,
            compression_threshold: config.batch.compression_threshold_bytes,
        };
        // The handshake is never compressed; the client learns about
        // compression from it.
        self.reply(&mut state, &connection_id, MessageType::Connected, &handshake, None, false);

        Ok(Admitted { connection_id, user_id })
    }

    async fn authenticate(&self, token: Option<&str>) -> Result<Option<String>, AdmissionError> {
        let required = self.inner.config.auth.enabled;
        let Some(token) = token else {
            return if required { Err(AdmissionError::MissingToken) } else { Ok(None) };
        };

        match &self.inner.auth {
            Some(validator) => match validator.validate(token).await {
                AuthDecision::Accepted { user_id } => Ok(user_id),
                AuthDecision::Rejected => Err(AdmissionError::AuthRejected),
            },
            None if required => {
                warn!("auth is required but no validator is configured");
                Err(AdmissionError::AuthRejected)
            }
            None => Ok(None),
        }
    }

    pub async fn handle_text(&self, connection_id: &str, raw: &str) {
        self.handle_frame(connection_id, InboundFrame::Text(raw)).await;
    }

    pub async fn handle_binary(&self, connection_id: &str, bytes: &[u8]) {
        self.handle_frame(connection_id, InboundFrame::Compressed(bytes)).await;
    }

    async fn handle_frame(&self, connection_id: &str, frame: InboundFrame<'_>) {
        let publish = {
            let mut state = self.inner.state.lock().await;
            if !state.contains(connection_id) {
                return;
            }
            match self.process_frame(&mut state, connection_id, frame, Instant::now()) {
                Ok(publish) => publish,
                Err(rejection) => {
                    self.reject(&mut state, connection_id, rejection);
                    None
                }
            }
        };

        if let Some(publish) = publish {
            self.publish(connection_id, publish).await;
        }
    }

    /// Rate limit, then size and parse, then dispatch.
    fn process_frame(
        &self,
        state: &mut ConnectionRegistry,
        connection_id: &str,
        frame: InboundFrame<'_>,
        now: Instant,
    ) -> Result<Option<PendingPublish>, Rejection> {
        let size = frame.len();
        let (identity, address) = {
            let Some(connection) = state.get_mut(connection_id) else {
                return Ok(None);
            };
            connection.record_inbound(size, now);
            (connection.rate_identity().to_owned(), connection.address)
        };
        self.inner.metrics.message_received(size);

        if let Err(error) = state.limiter_mut().check_message(&identity, address, now) {
            let blocked = state.limiter_mut().is_blocked(address, now);
            return Err(Rejection::RateLimited { error, blocked });
        }

        let max = self.inner.config.limits.max_message_size_bytes;
        let text: Cow<'_, str> = match frame {
            InboundFrame::Text(text) => Cow::Borrowed(text),
            InboundFrame::Compressed(bytes) => Cow::Owned(
                codec::decompress(bytes, max)
                    .map_err(|error| Rejection::protocol(ProtocolError::Decompress(error)))?,
            ),
        };
        if text.len() > max {
            return Err(Rejection::protocol(ProtocolError::TooLarge { size: text.len(), max }));
        }

        let envelope: Envelope = serde_json::from_str(&text)
            .map_err(|error| Rejection::protocol(ProtocolError::Malformed(error)))?;
        let correlation_id = envelope.reply_correlation_id();

        self.dispatch(state, connection_id, envelope, now).map_err(|error| Rejection::Protocol {
            error,
            correlation_id: Some(correlation_id),
        })
    }

    fn dispatch(
        &self,
        state: &mut ConnectionRegistry,
        connection_id: &str,
        envelope: Envelope,
        now: Instant,
    ) -> Result<Option<PendingPublish>, ProtocolError> {
        let correlation_id = envelope.reply_correlation_id();

        match envelope.kind {
            MessageType::Subscribe => {
                let payload: SubscribePayload = envelope.payload_as()?;
                let subscription = Subscription::from_payload(payload, now)?;
                let subscription_id = subscription.id.clone();
                let event_types = subscription.event_types.join(",");

                let replaced = state.subscribe(connection_id, subscription)?;
                debug!(
                    connection_id,
                    subscription_id = %subscription_id,
                    event_types = %event_types,
                    replaced = replaced.is_some(),
                    "subscribed"
                );

                let ack = AckPayload {
                    success: true,
                    subscription_id: Some(subscription_id),
                    ..AckPayload::default()
                };
                self.reply(state, connection_id, MessageType::Ack, &ack, Some(correlation_id), true);
                Ok(None)
            }
            MessageType::Unsubscribe => {
                let payload: UnsubscribePayload = envelope.payload_as()?;
                state.unsubscribe(connection_id, &payload.subscription_id)?;
                debug!(connection_id, subscription_id = %payload.subscription_id, "unsubscribed");

                let ack = AckPayload {
                    success: true,
                    subscription_id: Some(payload.subscription_id),
                    ..AckPayload::default()
                };
                self.reply(state, connection_id, MessageType::Ack, &ack, Some(correlation_id), true);
                Ok(None)
            }
            MessageType::Publish => {
                let payload: PublishPayload = envelope.payload_as()?;
                let event = event_from_publish(payload)?;
                Ok(Some(PendingPublish { event, correlation_id }))
            }
            MessageType::Ping => {
                let pong = PingPayload { server_time: Some(now_millis()) };
                self.reply(state, connection_id, MessageType::Pong, &pong, Some(correlation_id), true);
                Ok(None)
            }
            MessageType::Pong => {
                if let Some(latency) = state.get_mut(connection_id).and_then(|c| c.record_pong(now)) {
                    self.inner.metrics.record_latency(latency);
                }
                Ok(None)
            }
            MessageType::Batch => {
                let control: BatchControlPayload = envelope.payload_as()?;
                match control.action {
                    BatchAction::Flush => {
                        let flushed = self.flush_pending(
                            state,
                            connection_id,
                            control.subscription_id.as_deref(),
                        )?;
                        debug!(connection_id, flushed, "batches flushed on request");
                    }
                }

                let ack = AckPayload {
                    success: true,
                    subscription_id: control.subscription_id,
                    ..AckPayload::default()
                };
                self.reply(state, connection_id, MessageType::Ack, &ack, Some(correlation_id), true);
                Ok(None)
            }
            MessageType::Connected | MessageType::Event | MessageType::Ack | MessageType::Error => {
                Err(ProtocolError::Unsupported(envelope.kind.as_str()))
            }
        }
    }

    /// Forward a client publish to the bus through the circuit breaker and
    /// ack the publisher. Runs without the state lock.
    async fn publish(&self, connection_id: &str, pending: PendingPublish) {
        let PendingPublish { event, correlation_id } = pending;
        let event_id = event.id.clone();
        let event_type = event.event_type.clone();

        let bus = Arc::clone(&self.inner.bus);
        let outcome = self
            .inner
            .breaker
            .execute(PUBLISH_CIRCUIT, async move { bus.publish(event).await }, None)
            .await
            .map_err(|error| match error {
                BreakerError::Open { name } => UpstreamError::CircuitOpen { name },
                BreakerError::Inner(error) => UpstreamError::Bus(error.to_string()),
            });

        let ack = match outcome {
            Ok(()) => {
                self.inner.metrics.event_published();
                debug!(connection_id, event_id = %event_id, event_type = %event_type, "event published");
                AckPayload { success: true, event_id: Some(event_id), ..AckPayload::default() }
            }
            Err(error) => {
                self.inner.metrics.upstream_error();
                warn!(connection_id, event_type = %event_type, error = %error, "publish failed");
                AckPayload {
                    success: false,
                    event_id: Some(event_id),
                    error: Some(error.to_string()),
                    ..AckPayload::default()
                }
            }
        };

        let mut state = self.inner.state.lock().await;
        self.reply(&mut state, connection_id, MessageType::Ack, &ack, Some(correlation_id), true);
    }

    /// Fan one event out to every matching subscription, highest priority
    /// first. Returns how many subscriptions it was routed to.
    pub async fn dispatch_event(&self, event: GatewayEvent) -> usize {
        let mut state = self.inner.state.lock().await;
        let routes = state.route(&event);

        let mut delivered = 0;
        for route in &routes {
            if route.batching {
                self.enqueue_batched(&mut state, route, event.clone());
                continue;
            }

            let payload =
                EventPayload { subscription_id: route.subscription_id.clone(), event: event.clone() };
            match Envelope::new(MessageType::Event, &payload) {
                Ok(envelope) => {
                    if self.deliver(&mut state, &route.connection_id, &envelope, route.compressible) {
                        delivered += 1;
                    }
                }
                Err(error) => warn!(event_id = %event.id, error = %error, "failed to encode event"),
            }
        }
        self.inner.metrics.events_delivered(delivered);

        routes.len()
    }

    fn enqueue_batched(&self, state: &mut ConnectionRegistry, route: &Route, event: GatewayEvent) {
        let Some(connection) = state.get_mut(&route.connection_id) else {
            return;
        };
        let Some(options) =
            connection.subscriptions.get(&route.subscription_id).map(|s| s.options.clone())
        else {
            return;
        };
        let queue = connection.batches.entry(route.subscription_id.clone()).or_default();

        match self.inner.batcher.enqueue(queue, &options, event) {
            Enqueued::Flush(events) => {
                self.send_batch(state, &route.connection_id, &route.subscription_id, events);
            }
            Enqueued::ArmTimer { generation, delay } => {
                let gateway = self.clone();
                let connection_id = route.connection_id.clone();
                let subscription_id = route.subscription_id.clone();
                let timer = tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    gateway.flush_timer(&connection_id, &subscription_id, generation).await;
                });
                // Armed under the lock, so the timer cannot run before this.
                self.inner.batcher.arm(queue, generation, timer.abort_handle());
            }
            Enqueued::Queued => {}
        }
    }

    async fn flush_timer(&self, connection_id: &str, subscription_id: &str, generation: u64) {
        let mut state = self.inner.state.lock().await;
        let Some(events) = state
            .get_mut(connection_id)
            .and_then(|connection| connection.batches.get_mut(subscription_id))
            .and_then(|queue| self.inner.batcher.take_expired(queue, generation))
        else {
            return;
        };
        self.send_batch(&mut state, connection_id, subscription_id, events);
    }

    /// Flush one subscription's queue, or all of the connection's queues.
    fn flush_pending(
        &self,
        state: &mut ConnectionRegistry,
        connection_id: &str,
        subscription_id: Option<&str>,
    ) -> Result<usize, SubscriptionError> {
        let Some(connection) = state.get_mut(connection_id) else {
            return Ok(0);
        };

        let targets: Vec<String> = match subscription_id {
            Some(id) if !connection.subscriptions.contains_key(id) => {
                return Err(SubscriptionError::NotFound { subscription_id: id.to_owned() });
            }
            Some(id) => vec![id.to_owned()],
            None => connection.batches.keys().cloned().collect(),
        };

        let mut batches = Vec::new();
        for id in targets {
            if let Some(events) =
                connection.batches.get_mut(&id).and_then(|queue| self.inner.batcher.flush(queue))
            {
                batches.push((id, events));
            }
        }

        let flushed = batches.len();
        for (id, events) in batches {
            self.send_batch(state, connection_id, &id, events);
        }
        Ok(flushed)
    }

    fn send_batch(
        &self,
        state: &mut ConnectionRegistry,
        connection_id: &str,
        subscription_id: &str,
        events: Vec<GatewayEvent>,
    ) {
        let size = events.len();
        let compressible = state
            .get(connection_id)
            .and_then(|connection| connection.subscriptions.get(subscription_id))
            .is_none_or(|subscription| subscription.options.compression != Some(false));

        match BatchScheduler::batch_envelope(subscription_id, events) {
            Ok(envelope) => {
                if self.deliver(state, connection_id, &envelope, compressible) {
                    self.inner.metrics.record_batch(size);
                    self.inner.metrics.events_delivered(size);
                }
            }
            Err(error) => {
                warn!(connection_id, subscription_id, error = %error, "failed to encode batch")
            }
        }
    }

    fn reply<T: Serialize>(
        &self,
        state: &mut ConnectionRegistry,
        connection_id: &str,
        kind: MessageType,
        payload: &T,
        correlation_id: Option<String>,
        compressible: bool,
    ) {
        match Envelope::new(kind, payload) {
            Ok(envelope) => {
                let envelope = envelope.with_correlation_id(correlation_id);
                self.deliver(state, connection_id, &envelope, compressible);
            }
            Err(error) => {
                warn!(connection_id, kind = kind.as_str(), error = %error, "failed to encode reply")
            }
        }
    }

    fn reject(&self, state: &mut ConnectionRegistry, connection_id: &str, rejection: Rejection) {
        match rejection {
            Rejection::RateLimited { error, blocked } => {
                self.inner.metrics.rate_limited(error.kind);
                let envelope =
                    error_envelope(error.code(), error.to_string(), Some(error.retry_after_secs), None);
                self.deliver(state, connection_id, &envelope, true);
                if blocked {
                    self.close_blocked_address(state, connection_id);
                }
            }
            Rejection::Protocol { error, correlation_id } => {
                self.inner.metrics.protocol_error();
                debug!(connection_id, code = error.code().as_str(), error = %error, "rejected frame");
                let envelope = error_envelope(error.code(), error.to_string(), None, correlation_id);
                self.deliver(state, connection_id, &envelope, true);
            }
        }
    }

    /// Close every connection sharing the offender's address.
    fn close_blocked_address(&self, state: &mut ConnectionRegistry, connection_id: &str) {
        let Some(address) = state.get(connection_id).map(|connection| connection.address) else {
            return;
        };
        let ids = state.ids_for_address(address);
        warn!(connection_id, %address, connections = ids.len(), "closing connections from blocked address");
        for id in ids {
            self.close(state, &id, CloseReason::AddressBlocked);
        }
    }

    /// Queue a frame for the connection. A failed hand-off tears the
    /// connection down.
    fn deliver(
        &self,
        state: &mut ConnectionRegistry,
        connection_id: &str,
        envelope: &Envelope,
        compressible: bool,
    ) -> bool {
        let Some(connection) = state.get_mut(connection_id) else {
            return false;
        };
        match connection.send(envelope, compressible) {
            Ok(sent) => {
                self.inner.metrics.message_sent(sent.bytes, sent.compressed);
                true
            }
            Err(error) => {
                self.inner.metrics.delivery_error();
                warn!(connection_id, error = %error, "delivery failed, closing connection");
                self.close(state, connection_id, CloseReason::DeliveryFailed);
                false
            }
        }
    }

    fn close(
        &self,
        state: &mut ConnectionRegistry,
        connection_id: &str,
        reason: CloseReason,
    ) -> Option<RemovedConnection> {
        let removed = state.remove(connection_id, reason)?;
        self.inner.metrics.connection_closed();
        info!(
            connection_id,
            reason = reason.as_str(),
            duration_ms = removed.stats.connected_at.elapsed().as_millis() as u64,
            messages_received = removed.stats.messages_received,
            messages_sent = removed.stats.messages_sent,
            "connection closed"
        );
        Some(removed)
    }

    /// Tear a connection down. Idempotent.
    pub async fn disconnect(
        &self,
        connection_id: &str,
        reason: CloseReason,
    ) -> Option<RemovedConnection> {
        if reason == CloseReason::SocketError {
            self.inner.metrics.connection_error();
        }
        let mut state = self.inner.state.lock().await;
        self.close(&mut state, connection_id, reason)
    }

    /// Called when a socket task exits. Does nothing once a reconnect has
    /// taken the id over or the connection was already removed.
    pub async fn release(
        &self,
        connection_id: &str,
        outbound: &mpsc::UnboundedSender<Outbound>,
        reason: CloseReason,
    ) -> Option<RemovedConnection> {
        let mut state = self.inner.state.lock().await;
        if !state.is_served_by(connection_id, outbound) {
            return None;
        }
        if reason == CloseReason::SocketError {
            self.inner.metrics.connection_error();
        }
        self.close(&mut state, connection_id, reason)
    }

    /// Transport-level pong.
    pub async fn handle_pong(&self, connection_id: &str) {
        let mut state = self.inner.state.lock().await;
        if let Some(latency) =
            state.get_mut(connection_id).and_then(|connection| connection.record_pong(Instant::now()))
        {
            self.inner.metrics.record_latency(latency);
        }
    }

    /// Record activity that carries no message, e.g. a transport ping.
    pub async fn touch(&self, connection_id: &str) -> bool {
        self.inner.state.lock().await.touch(connection_id, Instant::now())
    }

    pub async fn sweep_heartbeats(&self) -> SweepReport {
        let report = {
            let mut state = self.inner.state.lock().await;
            self.inner.heartbeat.sweep(&mut state, Instant::now())
        };

        let metrics = &self.inner.metrics;
        let mut timed_out = 0;
        for removed in &report.evicted {
            metrics.connection_closed();
            match removed.reason {
                CloseReason::HeartbeatTimeout => timed_out += 1,
                _ => metrics.connection_error(),
            }
        }
        metrics.heartbeat_evicted(timed_out);
        report
    }

    pub async fn cleanup(&self) -> CleanupReport {
        self.inner.state.lock().await.limiter_mut().cleanup(Instant::now())
    }

    /// Clear the rate bucket for `identity` and any block on `address`.
    pub async fn reset_limits(&self, identity: &str, address: Option<IpAddr>) {
        let mut state = self.inner.state.lock().await;
        state.limiter_mut().reset_limits(identity, address);
        info!(identity, address = ?address, "rate limits reset");
    }

    pub async fn metrics_snapshot(&self) -> MetricsSnapshot {
        let subscribers = self.inner.state.lock().await.index().subscriber_counts();
        self.inner.metrics.snapshot(subscribers)
    }

    pub async fn stats(&self) -> GatewayStats {
        let (connections, subscriptions, rate_buckets, blocked_addresses, subscribers) = {
            let state = self.inner.state.lock().await;
            (
                state.len(),
                state.subscription_count(),
                state.limiter().bucket_count(),
                state.limiter().blocked_address_count(Instant::now()),
                state.index().subscriber_counts(),
            )
        };

        GatewayStats {
            connections,
            subscriptions,
            rate_buckets,
            blocked_addresses,
            publish_circuit: self.circuit_state().as_str(),
            accepting: self.is_accepting(),
            metrics: self.inner.metrics.snapshot(subscribers),
        }
    }

    pub fn circuit_state(&self) -> CircuitState {
        self.inner.breaker.state(PUBLISH_CIRCUIT)
    }

    pub async fn connection_count(&self) -> usize {
        self.inner.state.lock().await.len()
    }

    pub async fn connection_info(&self, connection_id: &str) -> Option<ConnectionInfo> {
        self.inner.state.lock().await.get(connection_id).map(|connection| connection.info())
    }

    /// Stop admitting, deliver pending batches, close every connection with
    /// `1000 server shutdown`, then wait up to `grace` for socket tasks to exit.
    pub async fn shutdown(&self, grace: Duration) {
        if !self.inner.accepting.swap(false, Ordering::SeqCst) {
            return;
        }

        let tasks = std::mem::take(&mut *self.tasks());
        for task in tasks {
            task.abort();
        }

        let closed = {
            let mut state = self.inner.state.lock().await;
            let ids: Vec<String> = state.connections().map(|connection| connection.id.clone()).collect();
            for id in &ids {
                let _ = self.flush_pending(&mut state, id, None);
            }
            let removed = state.drain(CloseReason::Shutdown);
            for _ in &removed {
                self.inner.metrics.connection_closed();
            }
            removed.len()
        };
        info!(closed, "gateway draining connections");

        let mut sockets = self.inner.open_sockets.subscribe();
        let drained =
            tokio::time::timeout(grace, sockets.wait_for(|open| *open == 0)).await.is_ok();
        if drained {
            info!("all sockets closed");
        } else {
            warn!(remaining = *sockets.borrow(), "shutdown grace period elapsed with sockets open");
        }
    }

    fn spawn_periodic<F, Fut>(&self, period: Duration, mut tick: F) -> JoinHandle<()>
    where
        F: FnMut(Gateway) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let gateway = self.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            interval.reset(); // skip immediate first tick
            loop {
                interval.tick().await;
                tick(gateway.clone()).await;
            }
        })
    }

    fn tasks(&self) -> StdMutexGuard<'_, Vec<JoinHandle<()>>> {
        self.inner.tasks.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Wrap a client publish as a canonical event. The source comes from
/// `metadata.source` when present.
fn event_from_publish(payload: PublishPayload) -> Result<GatewayEvent, ProtocolError> {
    let event_type = payload.event_type.trim().to_owned();
    if event_type.is_empty() {
        return Err(ProtocolError::InvalidPublish("event type must not be empty"));
    }

    let metadata = payload.metadata.unwrap_or_default();
    let source = metadata
        .get("source")
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|source| !source.is_empty())
        .unwrap_or(DEFAULT_EVENT_SOURCE)
        .to_owned();

    Ok(GatewayEvent::new(event_type, payload.payload, source).with_metadata(metadata))
}
