// Subscriptions and the event-type inverted index.

use std::collections::{BTreeMap, HashMap};

use beacon_common::protocol::ws::{
    Priority, SubscribePayload, SubscriptionFilter, SubscriptionOptions,
};
use beacon_common::types::GatewayEvent;
use thiserror::Error;
use tokio::time::Instant;

use crate::error::ProtocolError;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SubscriptionError {
    #[error("connection already holds the maximum of {max} subscriptions")]
    LimitExceeded { max: usize },
    #[error("subscription `{subscription_id}` not found")]
    NotFound { subscription_id: String },
    #[error("connection `{connection_id}` is not registered")]
    UnknownConnection { connection_id: String },
}

/// A client's interest in a set of event types, owned by one connection.
#[derive(Debug, Clone)]
pub struct Subscription {
    pub id: String,
    /// Deduplicated, in request order.
    pub event_types: Vec<String>,
    pub filter: SubscriptionFilter,
    pub options: SubscriptionOptions,
    pub created_at: Instant,
}

impl Subscription {
    pub fn from_payload(payload: SubscribePayload, now: Instant) -> Result<Self, ProtocolError> {
        let id = payload.id.trim().to_owned();
        if id.is_empty() {
            return Err(ProtocolError::InvalidSubscription("subscription id must not be empty"));
        }

        let mut event_types: Vec<String> = Vec::with_capacity(payload.event_types.len());
        for event_type in payload.event_types {
            let event_type = event_type.trim().to_owned();
            if event_type.is_empty() {
                return Err(ProtocolError::InvalidSubscription("event types must not be empty"));
            }
            if !event_types.contains(&event_type) {
                event_types.push(event_type);
            }
        }
        if event_types.is_empty() {
            return Err(ProtocolError::InvalidSubscription(
                "subscription needs at least one event type",
            ));
        }

        Ok(Self {
            id,
            event_types,
            filter: payload.filters.unwrap_or_default(),
            options: payload.options.unwrap_or_default(),
            created_at: now,
        })
    }

    pub fn priority(&self) -> Priority {
        self.options.priority
    }

    /// True when the event's type is covered and every filter criterion holds.
    pub fn matches(&self, event: &GatewayEvent) -> bool {
        self.event_types.iter().any(|event_type| *event_type == event.event_type)
            && filter_matches(&self.filter, event)
    }
}

/// Source must match exactly; each metadata entry must be present and equal.
/// An absent criterion always passes.
pub fn filter_matches(filter: &SubscriptionFilter, event: &GatewayEvent) -> bool {
    if let Some(source) = &filter.source {
        if *source != event.source {
            return false;
        }
    }

    filter.metadata.as_ref().is_none_or(|wanted| {
        wanted.iter().all(|(key, value)| event.metadata.get(key) == Some(value))
    })
}

/// Event type -> connection ids holding at least one subscription for it.
///
/// Connection-side subscription maps are passed in by the registry so the
/// index and the owning connection never disagree: every mutation goes
/// through here and updates both.
#[derive(Debug, Default)]
pub struct SubscriptionIndex {
    // connection id -> number of that connection's subscriptions naming the type
    by_event_type: HashMap<String, HashMap<String, usize>>,
}

impl SubscriptionIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `subscription` for `connection_id`.
    ///
    /// Replacing an existing subscription id is allowed at the cap and returns
    /// the replaced subscription. Nothing is mutated on error.
    pub fn subscribe(
        &mut self,
        connection_id: &str,
        subscriptions: &mut HashMap<String, Subscription>,
        subscription: Subscription,
        max_per_connection: usize,
    ) -> Result<Option<Subscription>, SubscriptionError> {
        let replacing = subscriptions.contains_key(&subscription.id);
        if !replacing && subscriptions.len() >= max_per_connection {
            return Err(SubscriptionError::LimitExceeded { max: max_per_connection });
        }

        let previous = subscriptions.remove(&subscription.id);
        if let Some(previous) = &previous {
            self.release(connection_id, &previous.event_types);
        }
        for event_type in &subscription.event_types {
            *self
                .by_event_type
                .entry(event_type.clone())
                .or_default()
                .entry(connection_id.to_owned())
                .or_insert(0) += 1;
        }
        subscriptions.insert(subscription.id.clone(), subscription);

        Ok(previous)
    }

    pub fn unsubscribe(
        &mut self,
        connection_id: &str,
        subscriptions: &mut HashMap<String, Subscription>,
        subscription_id: &str,
    ) -> Result<Subscription, SubscriptionError> {
        let removed = subscriptions.remove(subscription_id).ok_or_else(|| {
            SubscriptionError::NotFound { subscription_id: subscription_id.to_owned() }
        })?;
        self.release(connection_id, &removed.event_types);
        Ok(removed)
    }

    /// Drop every index entry for a departing connection.
    pub fn purge_connection(
        &mut self,
        connection_id: &str,
        subscriptions: &HashMap<String, Subscription>,
    ) {
        for subscription in subscriptions.values() {
            self.release(connection_id, &subscription.event_types);
        }
    }

    pub fn matching<'a>(&'a self, event_type: &str) -> impl Iterator<Item = &'a str> + 'a {
        self.by_event_type
            .get(event_type)
            .into_iter()
            .flat_map(|connections| connections.keys().map(String::as_str))
    }

    /// Number of connections per subscribed event type.
    pub fn subscriber_counts(&self) -> BTreeMap<String, usize> {
        self.by_event_type
            .iter()
            .map(|(event_type, connections)| (event_type.clone(), connections.len()))
            .collect()
    }

    pub fn event_type_count(&self) -> usize {
        self.by_event_type.len()
    }

    fn release(&mut self, connection_id: &str, event_types: &[String]) {
        for event_type in event_types {
            let Some(connections) = self.by_event_type.get_mut(event_type) else {
                continue;
            };
            if let Some(count) = connections.get_mut(connection_id) {
                *count -= 1;
                if *count == 0 {
                    connections.remove(connection_id);
                }
            }
            if connections.is_empty() {
                self.by_event_type.remove(event_type);
            }
        }
    }
}
