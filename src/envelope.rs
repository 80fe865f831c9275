// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Envelope Codec
//!
//! Wraps a message with its routing and causality metadata for the wire:
//!
//! ```json
//! {
//!   "EnvelopeId": "…", "MessageType": "CreateClient",
//!   "CorrelationId": "…", "CausationId": "00000000-0000-0000-0000-000000000000",
//!   "CreatedUtc": "2025-01-01T00:00:00Z", "Payload": { … }
//! }
//! ```
//!
//! Decoding happens in two phases. [`decode`] reads the envelope's own
//! fields and keeps the payload as raw JSON, because the wire type name is
//! all the consumer knows until the registry resolves it. [`decode_payload`]
//! then deserializes the payload into the resolved type.

use crate::{
    context::{ContextAccessor, MessageContext},
    errors::MessagingError,
    message::{Message, OutboundMessage},
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::value::RawValue;
use uuid::Uuid;

/// Wire wrapper around one serialized message.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Envelope {
    pub envelope_id: Uuid,
    pub message_type: String,
    pub correlation_id: Uuid,
    #[serde(with = "nil_as_none")]
    pub causation_id: Option<Uuid>,
    pub created_utc: DateTime<Utc>,
    pub payload: Box<RawValue>,
}

/// An envelope whose payload has not been decoded yet.
pub type EnvelopeShell = Envelope;

impl Envelope {
    pub fn to_bytes(&self) -> Result<Vec<u8>, MessagingError> {
        serde_json::to_vec(self).map_err(|source| MessagingError::Serialization {
            message_type: self.message_type.clone(),
            source,
        })
    }

    /// The context a consumer resumes the flow with.
    pub fn message_context(&self) -> MessageContext {
        MessageContext {
            correlation_id: self.correlation_id,
            causation_id: self.causation_id,
            timestamp: self.created_utc,
        }
    }
}

/// Wraps `message` using the flow's current context.
///
/// The flow must already have a context; encoding never invents one.
pub fn encode<M>(message: &M, context: &ContextAccessor) -> Result<Envelope, MessagingError>
where
    M: OutboundMessage + ?Sized,
{
    let current = context.current().ok_or(MessagingError::MissingContext)?;

    let payload = message
        .to_payload()
        .map_err(|source| MessagingError::Serialization {
            message_type: message.wire_name().to_owned(),
            source,
        })?;

    Ok(Envelope {
        envelope_id: Uuid::new_v4(),
        message_type: message.wire_name().to_owned(),
        correlation_id: current.correlation_id,
        causation_id: current.causation_id,
        created_utc: Utc::now(),
        payload,
    })
}

/// First phase: the envelope's own fields, payload left untouched.
pub fn decode(bytes: &[u8]) -> Result<EnvelopeShell, MessagingError> {
    serde_json::from_slice(bytes).map_err(MessagingError::MalformedEnvelope)
}

/// Second phase: the payload as the concrete type `M`.
pub fn decode_payload<M: Message>(shell: &EnvelopeShell) -> Result<M, MessagingError> {
    serde_json::from_str(shell.payload.get()).map_err(|source| MessagingError::Serialization {
        message_type: M::MESSAGE_TYPE.to_owned(),
        source,
    })
}

/// The wire always carries a uuid; "no cause" is the nil uuid.
mod nil_as_none {
    use serde::{Deserialize, Deserializer, Serializer};
    use uuid::Uuid;

    pub fn serialize<S: Serializer>(value: &Option<Uuid>, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(&value.unwrap_or_else(Uuid::nil))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<Uuid>, D::Error> {
        let value = Option::<Uuid>::deserialize(deserializer)?;
        Ok(value.filter(|id| !id.is_nil()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::contracts::{CreateClient, CreatePhone};

    fn client() -> CreateClient {
        CreateClient {
            id: Uuid::new_v4(),
            first_name: "Leia".to_owned(),
            last_name: "Organa".to_owned(),
            email: "leia@alderaan.org".to_owned(),
            phones: vec![CreatePhone {
                id: Uuid::new_v4(),
                client_id: Uuid::nil(),
                phone_number: "+1 (555) 123-4567".to_owned(),
                phone_type: "mobile".to_owned(),
            }],
        }
    }

    #[test]
    fn encode_requires_a_context() {
        let err = encode(&client(), &ContextAccessor::new()).unwrap_err();
        assert!(matches!(err, MessagingError::MissingContext));
    }

    #[test]
    fn round_trips_through_bytes() {
        let mut context = ContextAccessor::new();
        let flow = context.get_or_create();
        let message = client();

        let bytes = encode(&message, &context).unwrap().to_bytes().unwrap();
        let shell = decode(&bytes).unwrap();
        let decoded: CreateClient = decode_payload(&shell).unwrap();

        assert_eq!(decoded, message);
        assert_eq!(shell.message_type, "CreateClient");
        assert_eq!(shell.correlation_id, flow.correlation_id);
        assert_eq!(shell.causation_id, None);
    }

    #[test]
    fn missing_cause_travels_as_nil_uuid() {
        let mut context = ContextAccessor::new();
        context.get_or_create();

        let bytes = encode(&client(), &context).unwrap().to_bytes().unwrap();
        let json: serde_json::Value = serde_json::from_slice(&bytes).unwrap();

        assert_eq!(json["CausationId"], Uuid::nil().to_string());
        assert!(json["Payload"].is_object());
    }

    #[test]
    fn carries_the_cause_and_restores_the_context() {
        let mut context = ContextAccessor::new();
        context.get_or_create();
        let cause = Uuid::new_v4();
        let flow = context.set_causation_id(cause).unwrap();

        let envelope = encode(&client(), &context).unwrap();
        let shell = decode(&envelope.to_bytes().unwrap()).unwrap();
        let restored = shell.message_context();

        assert_eq!(restored.correlation_id, flow.correlation_id);
        assert_eq!(restored.causation_id, Some(cause));
        assert_eq!(restored.timestamp, envelope.created_utc);
    }

    #[test]
    fn rejects_bytes_that_are_not_an_envelope() {
        assert!(matches!(
            decode(b"not json"),
            Err(MessagingError::MalformedEnvelope(_))
        ));
        assert!(matches!(
            decode(br#"{"MessageType":"CreateClient"}"#),
            Err(MessagingError::MalformedEnvelope(_))
        ));
    }

    #[test]
    fn payload_of_the_wrong_shape_fails_second_phase() {
        let mut context = ContextAccessor::new();
        context.get_or_create();
        let envelope = encode(&client(), &context).unwrap();

        let result = decode_payload::<crate::contracts::ChangeClientArchiveStatus>(&envelope);

        assert!(matches!(result, Err(MessagingError::Serialization { .. })));
    }
}
