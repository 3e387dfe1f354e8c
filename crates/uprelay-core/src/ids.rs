//! Opaque string handles used across the relay.
//!
//! [`Token`] and [`ServerId`] live in independent namespaces: the former is
//! chosen by the consumer application, the latter by the push server.

use std::fmt;

use rand::Rng;
use rand::distributions::Alphanumeric;
use serde::{Deserialize, Serialize};

macro_rules! string_handle {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            pub fn new(value: impl Into<String>) -> Self {
                Self(value.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(value: &str) -> Self {
                Self(value.to_string())
            }
        }

        impl From<String> for $name {
            fn from(value: String) -> Self {
                Self(value)
            }
        }
    };
}

string_handle!(
    /// Consumer-chosen registration handle.
    Token
);

string_handle!(
    /// Relay-chosen handle identifying a registration on the push server.
    ServerId
);

string_handle!(
    /// Identifier of the consumer application owning a registration.
    ServiceName
);

impl ServerId {
    /// Generate a random alphanumeric id of the given length.
    pub fn generate(len: usize) -> Self {
        let id: String = rand::thread_rng()
            .sample_iter(&Alphanumeric)
            .take(len)
            .map(char::from)
            .collect();
        Self(id)
    }
}
