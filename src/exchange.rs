// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Exchange Definitions
//!
//! The bus publishes every message type through one direct exchange; this
//! module describes that exchange for the topology installer.

/// Definition of the bus's direct exchange.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExchangeDefinition {
    pub(crate) name: String,
    pub(crate) durable: bool,
}

impl ExchangeDefinition {
    /// Creates a non-durable direct exchange definition.
    pub fn new(name: &str) -> ExchangeDefinition {
        ExchangeDefinition {
            name: name.to_owned(),
            durable: false,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Makes the exchange durable, persisting across broker restarts.
    pub fn durable(mut self) -> Self {
        self.durable = true;
        self
    }

    pub fn kind(&self) -> lapin::ExchangeKind {
        lapin::ExchangeKind::Direct
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bus_exchange_is_durable_direct() {
        let def = ExchangeDefinition::new("client-manager").durable();

        assert_eq!(def.name(), "client-manager");
        assert!(def.durable);
        assert!(matches!(def.kind(), lapin::ExchangeKind::Direct));
    }
}
