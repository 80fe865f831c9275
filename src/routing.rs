// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Routing Convention
//!
//! Publisher and consumer never exchange topology information; both compute
//! the same `(exchange, routing key)` pair from the message type alone, so
//! the mapping must stay pure and deterministic.

use crate::configs::DEFAULT_EXCHANGE;

/// Where a message type is published and which queue binding receives it.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Route {
    pub exchange: String,
    pub routing_key: String,
}

/// Maps a message's wire type name to its route.
#[cfg_attr(test, mockall::automock)]
pub trait RoutingConvention: Send + Sync {
    fn resolve_for(&self, message_type: &str) -> Route;
}

/// One shared direct exchange; routing key is the simple type name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DefaultRoutingConvention {
    exchange: String,
}

impl DefaultRoutingConvention {
    pub fn new(exchange: &str) -> DefaultRoutingConvention {
        DefaultRoutingConvention {
            exchange: exchange.to_owned(),
        }
    }
}

impl Default for DefaultRoutingConvention {
    fn default() -> Self {
        DefaultRoutingConvention::new(DEFAULT_EXCHANGE)
    }
}

impl RoutingConvention for DefaultRoutingConvention {
    fn resolve_for(&self, message_type: &str) -> Route {
        // accept fully qualified names such as `contracts::CreateClient`
        let simple = message_type.rsplit("::").next().unwrap_or(message_type);

        Route {
            exchange: self.exchange.clone(),
            routing_key: simple.to_owned(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn routes_every_type_through_the_shared_exchange() {
        let convention = DefaultRoutingConvention::default();

        assert_eq!(
            convention.resolve_for("CreateClient"),
            Route {
                exchange: "client-manager".to_owned(),
                routing_key: "CreateClient".to_owned(),
            }
        );
        assert_eq!(
            convention.resolve_for("ClientCreated").exchange,
            convention.resolve_for("DeleteClient").exchange
        );
    }

    #[test]
    fn uses_the_simple_type_name() {
        let convention = DefaultRoutingConvention::new("bus");

        let route = convention.resolve_for("client_bus::contracts::UpdateClient");

        assert_eq!(route.exchange, "bus");
        assert_eq!(route.routing_key, "UpdateClient");
    }

    #[test]
    fn is_deterministic() {
        let a = DefaultRoutingConvention::default();
        let b = DefaultRoutingConvention::default();

        assert_eq!(a.resolve_for("ClientDeleted"), b.resolve_for("ClientDeleted"));
    }
}
