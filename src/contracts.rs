// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Client Manager Contracts
//!
//! Commands sent to the worker and the events it emits back. Field names go
//! on the wire in PascalCase so both sides of the bus agree on one shape.

use crate::{
    context::MessageContext,
    dispatcher::HandlerScope,
    errors::HandlerError,
    message::{Message, MessageKind, Validate, Violations},
    registry::{MessageSet, Registration},
};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Format every phone number must follow; `#` is a digit.
pub const PHONE_NUMBER_TEMPLATE: &str = "+# (###) ###-####";

macro_rules! impl_message {
    ($ty:ident, $kind:ident, $id:ident) => {
        impl Message for $ty {
            const MESSAGE_TYPE: &'static str = stringify!($ty);
            const KIND: MessageKind = MessageKind::$kind;

            fn message_id(&self) -> Uuid {
                self.$id
            }

            fn assign_message_id(&mut self, id: Uuid) {
                self.$id = id;
            }
        }
    };
}

macro_rules! message_set {
    ($set:ident { $($variant:ident),+ $(,)? }) => {
        /// Every message the client manager exchanges.
        #[derive(Debug, Clone, PartialEq)]
        pub enum $set {
            $($variant($variant)),+
        }

        $(
            impl From<$variant> for $set {
                fn from(message: $variant) -> Self {
                    $set::$variant(message)
                }
            }
        )+

        #[async_trait]
        impl MessageSet for $set {
            fn registrations() -> Vec<Registration<Self>> {
                vec![$(Registration::of::<$variant>()),+]
            }

            fn message_type(&self) -> &'static str {
                match self {
                    $($set::$variant(_) => <$variant as Message>::MESSAGE_TYPE),+
                }
            }

            async fn dispatch(
                self,
                scope: &HandlerScope,
                context: &MessageContext,
                cancellation: &CancellationToken,
            ) -> Result<(), HandlerError> {
                match self {
                    $($set::$variant(message) => scope.invoke(message, context, cancellation).await),+
                }
            }
        }
    };
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct CreateClient {
    pub id: Uuid,
    pub first_name: String,
    pub last_name: String,
    pub email: String,
    #[serde(default)]
    pub phones: Vec<CreatePhone>,
}

impl Validate for CreateClient {
    fn validate(&self, v: &mut Violations) {
        v.required("first_name", &self.first_name, "Client must have a first name");
        v.required("last_name", &self.last_name, "Client must have a last name");
        v.required("email", &self.email, "Client must have an email address");
        v.email("email", &self.email, "Client must have a valid email address");
        v.nested("phones", &self.phones);
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct UpdateClient {
    pub id: Uuid,
    pub first_name: String,
    pub last_name: String,
    pub email: String,
    pub is_archived: bool,
}

impl Validate for UpdateClient {
    fn validate(&self, v: &mut Violations) {
        v.required_id("id", self.id, "Client ID required to update client.");
        v.email("email", &self.email, "Client must have a valid email address.");
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct DeleteClient {
    pub id: Uuid,
}

impl Validate for DeleteClient {
    fn validate(&self, v: &mut Violations) {
        v.required_id("id", self.id, "Client ID required to delete client.");
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ChangeClientArchiveStatus {
    pub id: Uuid,
    pub is_archived: bool,
}

impl Validate for ChangeClientArchiveStatus {
    fn validate(&self, v: &mut Violations) {
        v.required_id("id", self.id, "Client ID required to change archive status.");
    }
}

/// A phone to attach to a client. When nested in [`CreateClient`] the
/// client id may be left nil; the worker fills it in.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct CreatePhone {
    pub id: Uuid,
    pub client_id: Uuid,
    pub phone_number: String,
    pub phone_type: String,
}

impl Validate for CreatePhone {
    fn validate(&self, v: &mut Violations) {
        v.required("phone_number", &self.phone_number, "A phone must have a number");
        v.template(
            "phone_number",
            &self.phone_number,
            PHONE_NUMBER_TEMPLATE,
            "Phone number must match +# (###) ###-####",
        );
        v.required("phone_type", &self.phone_type, "A phone must have a type");
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct UpdatePhone {
    pub id: Uuid,
    pub client_id: Uuid,
    pub number: String,
    pub phone_type: String,
}

impl Validate for UpdatePhone {
    fn validate(&self, v: &mut Violations) {
        v.required_id("id", self.id, "Phone ID required to update phone.");
        v.required_id("client_id", self.client_id, "The phone requires a client Id foreign key");
        v.template(
            "number",
            &self.number,
            PHONE_NUMBER_TEMPLATE,
            "Phone number must match +# (###) ###-####",
        );
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ClientCreated {
    pub client_id: Uuid,
    pub first_name: String,
    pub last_name: String,
    pub email: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ClientUpdated {
    pub id: Uuid,
    pub first_name: String,
    pub last_name: String,
    pub email: String,
    pub is_archived: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ClientDeleted {
    pub id: Uuid,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ClientArchiveStatusChanged {
    pub id: Uuid,
    pub first_name: String,
    pub last_name: String,
    pub email: String,
    pub is_archived: bool,
}

// events carry no declared constraints
impl Validate for ClientCreated {
    fn validate(&self, _: &mut Violations) {}
}

impl Validate for ClientUpdated {
    fn validate(&self, _: &mut Violations) {}
}

impl Validate for ClientDeleted {
    fn validate(&self, _: &mut Violations) {}
}

impl Validate for ClientArchiveStatusChanged {
    fn validate(&self, _: &mut Violations) {}
}

impl_message!(CreateClient, Command, id);
impl_message!(UpdateClient, Command, id);
impl_message!(DeleteClient, Command, id);
impl_message!(ChangeClientArchiveStatus, Command, id);
impl_message!(CreatePhone, Command, id);
impl_message!(UpdatePhone, Command, id);
impl_message!(ClientCreated, Event, client_id);
impl_message!(ClientUpdated, Event, id);
impl_message!(ClientDeleted, Event, id);
impl_message!(ClientArchiveStatusChanged, Event, id);

message_set!(ClientMessage {
    CreateClient,
    UpdateClient,
    DeleteClient,
    ChangeClientArchiveStatus,
    CreatePhone,
    UpdatePhone,
    ClientCreated,
    ClientUpdated,
    ClientDeleted,
    ClientArchiveStatusChanged,
});
