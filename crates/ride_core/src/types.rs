//! Identifiers and the authenticated actor passed into every operation.

use std::fmt;

use serde::{Deserialize, Serialize};

macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            pub fn new(id: impl Into<String>) -> Self {
                Self(id.into())
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

string_id!(
    /// Stable id issued by the external identity provider.
    ActorId
);
string_id!(RideId);

/// Drivers are actors; the alias keeps signatures self-describing.
pub type DriverId = ActorId;
pub type RiderId = ActorId;

impl RideId {
    /// Time-ordered id (uuid v7) so ids sort roughly by creation.
    pub fn generate() -> Self {
        Self(format!("ride_{}", uuid7::uuid7()))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Rider,
    Driver,
}

/// Authenticated caller. The core trusts the id and role as given.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Actor {
    pub id: ActorId,
    pub role: Role,
}

impl Actor {
    pub fn rider(id: impl Into<String>) -> Self {
        Self {
            id: ActorId::new(id),
            role: Role::Rider,
        }
    }

    pub fn driver(id: impl Into<String>) -> Self {
        Self {
            id: ActorId::new(id),
            role: Role::Driver,
        }
    }

    pub fn is_driver(&self) -> bool {
        self.role == Role::Driver
    }
}
