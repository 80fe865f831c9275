// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Message Context Propagation
//!
//! A `MessageContext` carries the causal identity of a logical flow: the
//! correlation id shared by every message of one user action, and the id of
//! the message that directly caused the current one.
//!
//! The context is not stored in a thread-local. Each flow owns a
//! `ContextAccessor` value and hands it down explicitly; branching into a
//! concurrent child is a clone, so a child can never rewrite what its
//! parent or siblings see.

use crate::errors::MessagingError;
use chrono::{DateTime, Utc};
use uuid::Uuid;

/// Immutable causal identity of a message flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MessageContext {
    pub correlation_id: Uuid,
    pub causation_id: Option<Uuid>,
    pub timestamp: DateTime<Utc>,
}

impl MessageContext {
    /// Starts a new causal chain with a fresh correlation id and no cause.
    pub fn new() -> MessageContext {
        MessageContext {
            correlation_id: Uuid::new_v4(),
            causation_id: None,
            timestamp: Utc::now(),
        }
    }

    /// Same correlation and timestamp, different direct cause.
    pub fn caused_by(&self, causation_id: Uuid) -> MessageContext {
        MessageContext {
            correlation_id: self.correlation_id,
            causation_id: Some(causation_id),
            timestamp: self.timestamp,
        }
    }
}

impl Default for MessageContext {
    fn default() -> Self {
        Self::new()
    }
}

/// Holder of the context for one logical flow (a request, a delivery).
#[derive(Debug, Clone, Default)]
pub struct ContextAccessor {
    current: Option<MessageContext>,
}

impl ContextAccessor {
    /// An accessor with no context; the first `get_or_create` starts a chain.
    pub fn new() -> ContextAccessor {
        ContextAccessor { current: None }
    }

    /// An accessor continuing an existing chain, e.g. one read from an envelope.
    pub fn with_context(context: MessageContext) -> ContextAccessor {
        ContextAccessor {
            current: Some(context),
        }
    }

    pub fn current(&self) -> Option<&MessageContext> {
        self.current.as_ref()
    }

    /// Returns the flow's context, creating one if the flow has none yet.
    pub fn get_or_create(&mut self) -> MessageContext {
        *self.current.get_or_insert_with(MessageContext::new)
    }

    /// Installs an explicit context, replacing whatever the flow held.
    pub fn set_current(&mut self, context: MessageContext) {
        self.current = Some(context);
    }

    /// Records `id` as the direct cause of whatever the flow publishes next.
    ///
    /// The nil uuid is rejected, and so is a flow that has not established a
    /// context yet: a cause without a correlation chain is meaningless.
    pub fn set_causation_id(&mut self, id: Uuid) -> Result<MessageContext, MessagingError> {
        if id.is_nil() {
            return Err(MessagingError::InvalidArgument {
                name: "causation_id",
                reason: "the provided causation id is the nil uuid".to_owned(),
            });
        }

        let Some(current) = self.current else {
            return Err(MessagingError::InvalidArgument {
                name: "causation_id",
                reason: "no message context established for the current flow".to_owned(),
            });
        };

        let next = current.caused_by(id);
        self.current = Some(next);
        Ok(next)
    }

    /// Ends the flow. Must be called when the unit of work completes.
    pub fn clear(&mut self) {
        self.current = None;
    }

    /// Copy of this flow for a concurrent child.
    pub fn branch(&self) -> ContextAccessor {
        self.clone()
    }
}

impl From<MessageContext> for ContextAccessor {
    fn from(context: MessageContext) -> Self {
        ContextAccessor::with_context(context)
    }
}
