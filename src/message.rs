// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Message Contracts
//!
//! Every type that travels on the bus implements [`Message`]: it has a wire
//! name, an identifier the enrichment stage can fill in, and a declared
//! validation schema ([`Validate`]). Validation is written per type instead
//! of discovered by walking arbitrary object graphs, so nested collections
//! are validated by calling [`Violations::nested`] explicitly.

use serde::{de::DeserializeOwned, Serialize};
use serde_json::value::RawValue;
use std::fmt;
use uuid::Uuid;

/// Whether a message asks for something to happen or reports that it did.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageKind {
    Command,
    Event,
}

/// A type that can be published on and consumed from the bus.
pub trait Message: Serialize + DeserializeOwned + Validate + Send + Sync + 'static {
    /// Wire name; also the routing key and the queue name.
    const MESSAGE_TYPE: &'static str;
    const KIND: MessageKind;

    /// Identifier of this message; nil until assigned.
    fn message_id(&self) -> Uuid;

    fn assign_message_id(&mut self, id: Uuid);
}

/// Declared validation constraints of a message.
pub trait Validate {
    fn validate(&self, violations: &mut Violations);
}

/// Object-safe view of a [`Message`] used by the publish pipeline.
pub trait OutboundMessage: Send + Sync {
    fn wire_name(&self) -> &'static str;

    fn current_id(&self) -> Uuid;

    fn assign_id(&mut self, id: Uuid);

    fn collect_violations(&self, violations: &mut Violations);

    fn to_payload(&self) -> Result<Box<RawValue>, serde_json::Error>;
}

impl<M: Message> OutboundMessage for M {
    fn wire_name(&self) -> &'static str {
        M::MESSAGE_TYPE
    }

    fn current_id(&self) -> Uuid {
        self.message_id()
    }

    fn assign_id(&mut self, id: Uuid) {
        self.assign_message_id(id)
    }

    fn collect_violations(&self, violations: &mut Violations) {
        self.validate(violations)
    }

    fn to_payload(&self) -> Result<Box<RawValue>, serde_json::Error> {
        serde_json::value::to_raw_value(self)
    }
}

/// One failed constraint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Violation {
    pub field: String,
    pub message: String,
}

/// Every constraint a message failed; never fail-fast.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Violations {
    items: Vec<Violation>,
    prefix: String,
}

impl Violations {
    pub fn new() -> Violations {
        Violations::default()
    }

    pub fn push(&mut self, field: &str, message: impl Into<String>) {
        self.items.push(Violation {
            field: format!("{}{}", self.prefix, field),
            message: message.into(),
        });
    }

    /// Fails when `value` is empty or only whitespace.
    pub fn required(&mut self, field: &str, value: &str, message: &str) {
        if value.trim().is_empty() {
            self.push(field, message);
        }
    }

    /// Fails when `id` is the nil uuid.
    pub fn required_id(&mut self, field: &str, id: Uuid, message: &str) {
        if id.is_nil() {
            self.push(field, message);
        }
    }

    /// Fails when a non-empty `value` does not look like an email address.
    /// Emptiness is left to [`Violations::required`].
    pub fn email(&mut self, field: &str, value: &str, message: &str) {
        if !value.is_empty() && !is_email(value) {
            self.push(field, message);
        }
    }

    /// Fails when a non-empty `value` does not follow `template`, where `#`
    /// stands for one ASCII digit and every other character must match.
    pub fn template(&mut self, field: &str, value: &str, template: &str, message: &str) {
        if !value.is_empty() && !matches_template(value, template) {
            self.push(field, message);
        }
    }

    /// Validates every element of a nested collection, prefixing field names
    /// with `field[index].`.
    pub fn nested<V: Validate>(&mut self, field: &str, items: &[V]) {
        let outer = self.prefix.clone();
        for (index, item) in items.iter().enumerate() {
            self.prefix = format!("{}{}[{}].", outer, field, index);
            item.validate(self);
        }
        self.prefix = outer;
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Violation> {
        self.items.iter()
    }

    pub fn fields(&self) -> Vec<&str> {
        self.items.iter().map(|v| v.field.as_str()).collect()
    }
}

impl fmt::Display for Violations {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let messages: Vec<&str> = self.items.iter().map(|v| v.message.as_str()).collect();
        write!(f, "{}", messages.join(", "))
    }
}

fn is_email(value: &str) -> bool {
    if value.chars().any(char::is_whitespace) {
        return false;
    }

    let mut parts = value.split('@');
    let (Some(local), Some(domain), None) = (parts.next(), parts.next(), parts.next()) else {
        return false;
    };

    !local.is_empty()
        && domain.contains('.')
        && !domain.starts_with('.')
        && !domain.ends_with('.')
        && !domain.contains("..")
}

fn matches_template(value: &str, template: &str) -> bool {
    value.chars().count() == template.chars().count()
        && value.chars().zip(template.chars()).all(|(c, t)| match t {
            '#' => c.is_ascii_digit(),
            _ => c == t,
        })
}
