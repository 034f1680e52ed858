// Live connections and everything keyed by them.
//
// The registry owns the subscription index and the rate limiter so that
// admitting or removing a connection updates all three in one step. Callers
// hold the gateway's state lock around every registry call.

use std::collections::HashMap;
use std::net::IpAddr;

use beacon_common::protocol::{close_code, ws::{Envelope, Priority}};
use beacon_common::types::GatewayEvent;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::debug;
use uuid::Uuid;

use crate::batch::BatchQueue;
use crate::codec::{self, EncodedFrame};
use crate::config::LimitsConfig;
use crate::error::{AdmissionError, DeliveryError};
use crate::rate_limit::{RateLimitConfig, RateLimiter};
use crate::subscription::{Subscription, SubscriptionError, SubscriptionIndex};

const MAX_CONNECTION_ID_LEN: usize = 128;

/// Work handed to a connection's socket task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outbound {
    Frame(EncodedFrame),
    /// Transport-level ping; the client's pong counts as activity.
    Ping,
    /// Send a close frame and stop. Always the last item on the channel.
    Close { code: u16, reason: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    ClientClosed,
    SocketError,
    HeartbeatTimeout,
    Superseded,
    DeliveryFailed,
    /// Rate limit violations escalated to a block on the source address.
    AddressBlocked,
    Shutdown,
}

impl CloseReason {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::ClientClosed => "client_closed",
            Self::SocketError => "socket_error",
            Self::HeartbeatTimeout => "heartbeat_timeout",
            Self::Superseded => "superseded",
            Self::DeliveryFailed => "delivery_failed",
            Self::AddressBlocked => "address_blocked",
            Self::Shutdown => "shutdown",
        }
    }

    /// Reason text carried in the close frame.
    pub const fn description(self) -> &'static str {
        match self {
            Self::ClientClosed => "client closed",
            Self::SocketError => "socket error",
            Self::HeartbeatTimeout => "heartbeat timeout",
            Self::Superseded => "superseded",
            Self::DeliveryFailed => "delivery failed",
            Self::AddressBlocked => "address blocked",
            Self::Shutdown => "server shutdown",
        }
    }

    pub const fn close_code(self) -> u16 {
        match self {
            Self::HeartbeatTimeout => close_code::HEARTBEAT_TIMEOUT,
            Self::AddressBlocked => close_code::POLICY_VIOLATION,
            _ => close_code::NORMAL,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ConnectionStats {
    pub connected_at: Instant,
    pub last_activity: Instant,
    pub last_ping_sent: Option<Instant>,
    pub messages_received: u64,
    pub messages_sent: u64,
    pub bytes_received: u64,
    pub bytes_sent: u64,
}

impl ConnectionStats {
    fn new(now: Instant) -> Self {
        Self {
            connected_at: now,
            last_activity: now,
            last_ping_sent: None,
            messages_received: 0,
            messages_sent: 0,
            bytes_received: 0,
            bytes_sent: 0,
        }
    }
}

/// What a successful [`Connection::send`] put on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SentFrame {
    pub bytes: usize,
    pub compressed: bool,
}

#[derive(Debug)]
pub struct Connection {
    pub id: String,
    pub user_id: Option<String>,
    pub address: IpAddr,
    pub connected_at_utc: DateTime<Utc>,
    pub subscriptions: HashMap<String, Subscription>,
    pub(crate) batches: HashMap<String, BatchQueue>,
    pub stats: ConnectionStats,
    outbound: mpsc::UnboundedSender<Outbound>,
    compression_threshold: Option<usize>,
}

impl Connection {
    /// Key for message rate limiting: the user when known, else the connection.
    pub fn rate_identity(&self) -> &str {
        self.user_id.as_deref().unwrap_or(&self.id)
    }

    pub fn touch(&mut self, now: Instant) {
        self.stats.last_activity = now;
    }

    pub fn record_inbound(&mut self, bytes: usize, now: Instant) {
        self.stats.messages_received += 1;
        self.stats.bytes_received += bytes as u64;
        self.touch(now);
    }

    /// Encode and queue a frame. `compressible` is false for subscriptions
    /// that opted out of compression.
    pub fn send(&mut self, envelope: &Envelope, compressible: bool) -> Result<SentFrame, DeliveryError> {
        let threshold = if compressible { self.compression_threshold } else { None };
        let frame = codec::encode(envelope, threshold)?;
        let sent = SentFrame { bytes: frame.len(), compressed: frame.is_compressed() };

        self.outbound
            .send(Outbound::Frame(frame))
            .map_err(|_| DeliveryError::ChannelClosed(self.id.clone()))?;
        self.stats.messages_sent += 1;
        self.stats.bytes_sent += sent.bytes as u64;
        Ok(sent)
    }

    pub fn ping(&mut self, now: Instant) -> Result<(), DeliveryError> {
        self.outbound
            .send(Outbound::Ping)
            .map_err(|_| DeliveryError::ChannelClosed(self.id.clone()))?;
        self.stats.last_ping_sent = Some(now);
        Ok(())
    }

    /// Round trip of the outstanding ping, clearing it.
    pub fn record_pong(&mut self, now: Instant) -> Option<std::time::Duration> {
        self.touch(now);
        self.stats.last_ping_sent.take().map(|sent| now.saturating_duration_since(sent))
    }

    pub fn info(&self) -> ConnectionInfo {
        let mut subscriptions: Vec<String> = self.subscriptions.keys().cloned().collect();
        subscriptions.sort();
        ConnectionInfo {
            id: self.id.clone(),
            user_id: self.user_id.clone(),
            address: self.address,
            connected_at: self.connected_at_utc,
            subscriptions,
            messages_received: self.stats.messages_received,
            messages_sent: self.stats.messages_sent,
            bytes_received: self.stats.bytes_received,
            bytes_sent: self.stats.bytes_sent,
        }
    }

    fn close(&mut self, reason: CloseReason) {
        for queue in self.batches.values_mut() {
            queue.cancel_timer();
        }
        // A closed channel means the socket task is already gone.
        let _ = self.outbound.send(Outbound::Close {
            code: reason.close_code(),
            reason: reason.description().to_owned(),
        });
    }
}

/// Serializable view of a connection for stats endpoints and logs.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionInfo {
    pub id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    pub address: IpAddr,
    pub connected_at: DateTime<Utc>,
    pub subscriptions: Vec<String>,
    pub messages_received: u64,
    pub messages_sent: u64,
    pub bytes_received: u64,
    pub bytes_sent: u64,
}

#[derive(Debug)]
pub struct AdmissionRequest {
    pub address: IpAddr,
    /// Client-proposed id, used for reconnects.
    pub requested_id: Option<String>,
    pub user_id: Option<String>,
}

#[derive(Debug)]
pub struct Admission {
    pub connection_id: String,
    /// The earlier connection this one replaced, if any.
    pub superseded: Option<RemovedConnection>,
}

#[derive(Debug, Clone)]
pub struct RemovedConnection {
    pub id: String,
    pub user_id: Option<String>,
    pub address: IpAddr,
    pub reason: CloseReason,
    pub subscriptions: usize,
    pub stats: ConnectionStats,
}

/// Where one event goes: a single subscription on a single connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Route {
    pub connection_id: String,
    pub subscription_id: String,
    pub priority: Priority,
    pub batching: bool,
    pub compressible: bool,
}

#[derive(Debug)]
pub struct ConnectionRegistry {
    connections: HashMap<String, Connection>,
    index: SubscriptionIndex,
    limiter: RateLimiter,
    max_connections: usize,
    max_subscriptions: usize,
    compression_threshold: Option<usize>,
}

impl ConnectionRegistry {
    pub fn new(
        limits: &LimitsConfig,
        rate_limit: RateLimitConfig,
        compression_threshold: Option<usize>,
    ) -> Self {
        Self {
            connections: HashMap::new(),
            index: SubscriptionIndex::new(),
            limiter: RateLimiter::new(rate_limit),
            max_connections: limits.max_connections,
            max_subscriptions: limits.max_subscriptions_per_connection,
            compression_threshold,
        }
    }

    /// Checks that do not need the caller's identity: address block, then the
    /// global ceiling. Run before authentication so rejected clients cost little.
    pub fn precheck(
        &mut self,
        address: IpAddr,
        requested_id: Option<&str>,
        now: Instant,
    ) -> Result<(), AdmissionError> {
        if let Some(retry_after_secs) = self.limiter.blocked_for(address, now) {
            return Err(AdmissionError::Blocked { address, retry_after_secs });
        }
        let reconnecting = requested_id
            .and_then(|id| self.connections.get(id))
            .is_some_and(|existing| existing.address == address);
        if !reconnecting && self.connections.len() >= self.max_connections {
            return Err(AdmissionError::CapacityExceeded { max: self.max_connections });
        }
        Ok(())
    }

    /// Admit a connection. Rechecks the global ceiling since authentication
    /// ran outside the lock, then applies the per-address limit.
    ///
    /// A requested id that is live from the same address supersedes the old
    /// connection. A requested id held by another address is ignored.
    pub fn admit(
        &mut self,
        request: AdmissionRequest,
        outbound: mpsc::UnboundedSender<Outbound>,
        now: Instant,
    ) -> Result<Admission, AdmissionError> {
        let AdmissionRequest { address, requested_id, user_id } = request;
        let (connection_id, supersedes) = self.resolve_id(requested_id, address);

        if !supersedes && self.connections.len() >= self.max_connections {
            return Err(AdmissionError::CapacityExceeded { max: self.max_connections });
        }
        self.limiter
            .check_connection(address, &connection_id, now)
            .map_err(|error| AdmissionError::from_rate_limit(address, error))?;

        let superseded =
            if supersedes { self.remove(&connection_id, CloseReason::Superseded) } else { None };

        self.limiter.track_connection(address, &connection_id, now);
        self.connections.insert(
            connection_id.clone(),
            Connection {
                id: connection_id.clone(),
                user_id,
                address,
                connected_at_utc: Utc::now(),
                subscriptions: HashMap::new(),
                batches: HashMap::new(),
                stats: ConnectionStats::new(now),
                outbound,
                compression_threshold: self.compression_threshold,
            },
        );

        Ok(Admission { connection_id, superseded })
    }

    /// Remove a connection and everything keyed by it, then tell its socket
    /// task to close. Returns `None` if it was already gone, so each
    /// connection is closed at most once.
    pub fn remove(&mut self, connection_id: &str, reason: CloseReason) -> Option<RemovedConnection> {
        let mut connection = self.connections.remove(connection_id)?;
        self.index.purge_connection(connection_id, &connection.subscriptions);
        self.limiter.untrack_connection(connection.address, connection_id);
        connection.close(reason);

        debug!(connection_id, reason = reason.as_str(), "connection removed");
        Some(RemovedConnection {
            id: connection.id.clone(),
            user_id: connection.user_id.clone(),
            address: connection.address,
            reason,
            subscriptions: connection.subscriptions.len(),
            stats: connection.stats,
        })
    }

    /// Ids of every live connection opened from `address`.
    pub fn ids_for_address(&self, address: IpAddr) -> Vec<String> {
        self.connections
            .values()
            .filter(|connection| connection.address == address)
            .map(|connection| connection.id.clone())
            .collect()
    }

    /// Remove every connection, e.g. on shutdown.
    pub fn drain(&mut self, reason: CloseReason) -> Vec<RemovedConnection> {
        let ids: Vec<String> = self.connections.keys().cloned().collect();
        ids.iter().filter_map(|id| self.remove(id, reason)).collect()
    }

    pub fn subscribe(
        &mut self,
        connection_id: &str,
        subscription: Subscription,
    ) -> Result<Option<Subscription>, SubscriptionError> {
        let connection = self.connections.get_mut(connection_id).ok_or_else(|| {
            SubscriptionError::UnknownConnection { connection_id: connection_id.to_owned() }
        })?;
        let subscription_id = subscription.id.clone();
        let replaced = self.index.subscribe(
            connection_id,
            &mut connection.subscriptions,
            subscription,
            self.max_subscriptions,
        )?;
        if replaced.is_some() {
            connection.batches.remove(&subscription_id);
        }
        Ok(replaced)
    }

    /// Drop a subscription. Any partially filled batch for it is discarded.
    pub fn unsubscribe(
        &mut self,
        connection_id: &str,
        subscription_id: &str,
    ) -> Result<Subscription, SubscriptionError> {
        let connection = self.connections.get_mut(connection_id).ok_or_else(|| {
            SubscriptionError::UnknownConnection { connection_id: connection_id.to_owned() }
        })?;
        let removed =
            self.index.unsubscribe(connection_id, &mut connection.subscriptions, subscription_id)?;
        connection.batches.remove(subscription_id);
        Ok(removed)
    }

    /// Every subscription the event should reach, highest priority first.
    pub fn route(&self, event: &GatewayEvent) -> Vec<Route> {
        let mut routes = Vec::new();
        for connection_id in self.index.matching(&event.event_type) {
            let Some(connection) = self.connections.get(connection_id) else {
                continue;
            };
            for subscription in connection.subscriptions.values() {
                if subscription.matches(event) {
                    routes.push(Route {
                        connection_id: connection.id.clone(),
                        subscription_id: subscription.id.clone(),
                        priority: subscription.priority(),
                        batching: subscription.options.batching,
                        compressible: subscription.options.compression != Some(false),
                    });
                }
            }
        }
        routes.sort_by(|a, b| b.priority.cmp(&a.priority));
        routes
    }

    pub fn get(&self, connection_id: &str) -> Option<&Connection> {
        self.connections.get(connection_id)
    }

    pub fn get_mut(&mut self, connection_id: &str) -> Option<&mut Connection> {
        self.connections.get_mut(connection_id)
    }

    pub fn contains(&self, connection_id: &str) -> bool {
        self.connections.contains_key(connection_id)
    }

    /// Whether `connection_id` is still served through `outbound`. False once
    /// a reconnect has taken the id over.
    pub fn is_served_by(&self, connection_id: &str, outbound: &mpsc::UnboundedSender<Outbound>) -> bool {
        self.connections
            .get(connection_id)
            .is_some_and(|connection| connection.outbound.same_channel(outbound))
    }

    pub fn touch(&mut self, connection_id: &str, now: Instant) -> bool {
        match self.connections.get_mut(connection_id) {
            Some(connection) => {
                connection.touch(now);
                true
            }
            None => false,
        }
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    pub fn connections(&self) -> impl Iterator<Item = &Connection> {
        self.connections.values()
    }

    pub fn connections_mut(&mut self) -> impl Iterator<Item = &mut Connection> {
        self.connections.values_mut()
    }

    pub fn index(&self) -> &SubscriptionIndex {
        &self.index
    }

    pub fn limiter(&self) -> &RateLimiter {
        &self.limiter
    }

    pub fn limiter_mut(&mut self) -> &mut RateLimiter {
        &mut self.limiter
    }

    pub fn subscription_count(&self) -> usize {
        self.connections.values().map(|connection| connection.subscriptions.len()).sum()
    }

    fn resolve_id(&self, requested: Option<String>, address: IpAddr) -> (String, bool) {
        let requested = requested
            .map(|id| id.trim().to_owned())
            .filter(|id| !id.is_empty() && id.len() <= MAX_CONNECTION_ID_LEN);

        match requested {
            Some(id) => match self.connections.get(&id) {
                Some(existing) if existing.address == address => (id, true),
                Some(_) => {
                    debug!(requested_id = %id, %address, "requested id held by another address");
                    (Uuid::new_v4().to_string(), false)
                }
                None => (id, false),
            },
            None => (Uuid::new_v4().to_string(), false),
        }
    }
}
