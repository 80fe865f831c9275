// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Message Type Registry
//!
//! Maps the wire name carried by an envelope to the concrete message type
//! it stands for. The table is built once from a static list of
//! registrations supplied by a [`MessageSet`] (the sum type of every message
//! a service understands) and never mutated afterwards.

use crate::{
    context::MessageContext,
    dispatcher::{HandlerScope, MessageHandler},
    errors::{HandlerError, MessagingError},
    message::{Message, MessageKind},
};
use async_trait::async_trait;
use serde_json::value::RawValue;
use std::collections::HashMap;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// The closed set of messages a service exchanges, as one enum.
///
/// Implementors list one [`Registration`] per variant and route each
/// variant to its handler in [`MessageSet::dispatch`].
#[async_trait]
pub trait MessageSet: Sized + Send + 'static {
    fn registrations() -> Vec<Registration<Self>>;

    fn message_type(&self) -> &'static str;

    /// Hands the message to the handler registered for its concrete type.
    async fn dispatch(
        self,
        scope: &HandlerScope,
        context: &MessageContext,
        cancellation: &CancellationToken,
    ) -> Result<(), HandlerError>;
}

/// One known message type: its wire name, kind, expected handler and decoder.
pub struct Registration<S> {
    pub name: &'static str,
    pub kind: MessageKind,
    pub handler_contract: &'static str,
    decode: fn(&RawValue) -> Result<S, serde_json::Error>,
}

impl<S> Clone for Registration<S> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<S> Copy for Registration<S> {}

impl<S> std::fmt::Debug for Registration<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registration")
            .field("name", &self.name)
            .field("kind", &self.kind)
            .field("handler_contract", &self.handler_contract)
            .finish()
    }
}

impl<S> Registration<S> {
    /// Registers `M` as a variant of `S`.
    pub fn of<M>() -> Registration<S>
    where
        M: Message + Into<S>,
    {
        Registration {
            name: M::MESSAGE_TYPE,
            kind: M::KIND,
            handler_contract: std::any::type_name::<dyn MessageHandler<M>>(),
            decode: decode_as::<M, S>,
        }
    }

    /// Second-phase decoding of an envelope payload into this type.
    pub fn decode(&self, payload: &RawValue) -> Result<S, MessagingError> {
        (self.decode)(payload).map_err(|source| MessagingError::Serialization {
            message_type: self.name.to_owned(),
            source,
        })
    }
}

fn decode_as<M, S>(payload: &RawValue) -> Result<S, serde_json::Error>
where
    M: Message + Into<S>,
{
    serde_json::from_str::<M>(payload.get()).map(Into::into)
}

/// Read-only index of registrations by wire name.
#[derive(Debug)]
pub struct MessageTypeRegistry<S> {
    by_name: HashMap<&'static str, Registration<S>>,
}

impl<S: MessageSet> MessageTypeRegistry<S> {
    /// Builds the registry from every variant `S` declares.
    pub fn discover() -> MessageTypeRegistry<S> {
        Self::from_registrations(S::registrations())
    }

    /// Builds the registry from an explicit list. A repeated wire name keeps
    /// its first registration.
    pub fn from_registrations(
        registrations: impl IntoIterator<Item = Registration<S>>,
    ) -> MessageTypeRegistry<S> {
        let mut by_name = HashMap::new();

        for registration in registrations {
            if by_name.contains_key(registration.name) {
                warn!(
                    message_type = registration.name,
                    "duplicated message type registration ignored"
                );
                continue;
            }
            debug!(
                message_type = registration.name,
                handler = registration.handler_contract,
                "message type registered"
            );
            by_name.insert(registration.name, registration);
        }

        MessageTypeRegistry { by_name }
    }

    pub fn resolve(&self, name: &str) -> Option<&Registration<S>> {
        self.by_name.get(name)
    }

    /// Name of the handler trait the consumer expects for `name`.
    pub fn handler_contract(&self, name: &str) -> Option<&'static str> {
        self.by_name.get(name).map(|r| r.handler_contract)
    }

    /// Registrations of one kind, sorted by wire name.
    pub fn of_kind(&self, kind: MessageKind) -> Vec<Registration<S>> {
        let mut found: Vec<_> = self
            .by_name
            .values()
            .filter(|r| r.kind == kind)
            .copied()
            .collect();
        found.sort_by_key(|r| r.name);
        found
    }

    /// Every wire name, sorted.
    pub fn names(&self) -> Vec<&'static str> {
        let mut names: Vec<_> = self.by_name.keys().copied().collect();
        names.sort_unstable();
        names
    }

    pub fn len(&self) -> usize {
        self.by_name.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_name.is_empty()
    }
}
