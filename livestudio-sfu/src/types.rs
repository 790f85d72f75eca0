//! Identifier newtypes shared by the protocol, the registries and the directory

use serde::{Deserialize, Serialize};
use std::fmt;

macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        pub struct $name(String);

        impl $name {
            pub fn new(id: impl Into<String>) -> Self {
                Self(id.into())
            }

            /// Generate a fresh random identifier
            #[must_use]
            pub fn random() -> Self {
                Self(nanoid::nanoid!(12))
            }

            #[must_use]
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl From<String> for $name {
            fn from(s: String) -> Self {
                Self(s)
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                Self(s.to_string())
            }
        }
    };
}

string_id!(
    /// Room (channel) the studio session belongs to
    RoomId
);

string_id!(
    /// Transport-layer identity of a connected client, stable for the connection
    SocketId
);

string_id!(
    /// Application identity of a participant
    UserId
);

string_id!(
    /// Server-assigned id of a published track
    ProducerId
);

string_id!(
    /// Server-assigned id of a consumed track
    ConsumerId
);

string_id!(
    /// Server-assigned id of a send or receive transport
    TransportId
);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ids_serialize_as_plain_strings() {
        let id = ProducerId::from("p1");
        assert_eq!(serde_json::to_string(&id).unwrap(), "\"p1\"");

        let back: ProducerId = serde_json::from_str("\"p1\"").unwrap();
        assert_eq!(back, id);
        assert_eq!(back.to_string(), "p1");
    }

    #[test]
    fn test_random_ids_are_distinct() {
        assert_ne!(SocketId::random(), SocketId::random());
        assert_eq!(RoomId::random().as_str().len(), 12);
    }
}
