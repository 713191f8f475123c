//! Strongly-typed identifiers for stark entities.
//!
//! Node, pod, deployment, pack, envelope, query, and correlation IDs are
//! UUID-backed and generated randomly. Service and group IDs are
//! operator-chosen names: a service ID doubles as the overlay hostname
//! (`<serviceId>.internal`), so it is constrained to a DNS label.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Errors that can occur when parsing identifiers.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum IdError {
    /// The input is not a valid UUID.
    #[error("invalid UUID format")]
    InvalidUuid,

    /// The input is empty.
    #[error("identifier is empty")]
    Empty,

    /// The input exceeds the maximum length.
    #[error("identifier too long: {got} chars, maximum is {max}")]
    TooLong {
        /// Maximum permitted length in characters.
        max: usize,
        /// Actual length of the input.
        got: usize,
    },

    /// The input contains a character outside the permitted set.
    #[error("invalid character {0:?} in identifier")]
    InvalidChar(char),
}

macro_rules! uuid_id {
    ($(#[$doc:meta])* $name:ident) => {
        $(#[$doc])*
        #[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(try_from = "String", into = "String")]
        pub struct $name(uuid::Uuid);

        impl $name {
            /// Create from an existing UUID.
            #[must_use]
            pub const fn from_uuid(uuid: uuid::Uuid) -> Self {
                Self(uuid)
            }

            /// Generate a new random identifier.
            #[must_use]
            pub fn generate() -> Self {
                Self(uuid::Uuid::new_v4())
            }

            /// Generate a deterministic identifier for tests.
            ///
            /// The UUID bytes are derived from a blake3 hash of the seed, so
            /// equal seeds always produce equal IDs.
            #[must_use]
            pub fn generate_deterministic(seed: u64) -> Self {
                let mut hasher = blake3::Hasher::new();
                hasher.update(stringify!($name).as_bytes());
                hasher.update(&seed.to_le_bytes());
                let digest = hasher.finalize();
                let mut bytes = [0u8; 16];
                bytes.copy_from_slice(&digest.as_bytes()[..16]);
                Self(uuid::Uuid::from_bytes(bytes))
            }

            /// Return the underlying UUID.
            #[must_use]
            pub const fn as_uuid(&self) -> &uuid::Uuid {
                &self.0
            }
        }

        impl FromStr for $name {
            type Err = IdError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                let uuid = uuid::Uuid::parse_str(s).map_err(|_| IdError::InvalidUuid)?;
                Ok(Self(uuid))
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, concat!(stringify!($name), "({})"), self.0)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl TryFrom<String> for $name {
            type Error = IdError;

            fn try_from(value: String) -> Result<Self, Self::Error> {
                value.parse()
            }
        }

        impl From<$name> for String {
            fn from(id: $name) -> Self {
                id.0.to_string()
            }
        }

        impl AsRef<[u8]> for $name {
            fn as_ref(&self) -> &[u8] {
                self.0.as_bytes()
            }
        }
    };
}

uuid_id! {
    /// Identifier of a registered node (one per agent process).
    NodeId
}

uuid_id! {
    /// Identifier of a single pod (one running instance of a pack).
    PodId
}

uuid_id! {
    /// Identifier of a deployment (a replica set without overlay identity).
    DeploymentId
}

uuid_id! {
    /// Identifier of a published pack bundle.
    PackId
}

uuid_id! {
    /// Identifier correlating a request envelope with its reply.
    EnvelopeId
}

uuid_id! {
    /// Identifier of an ephemeral fan-out query.
    QueryId
}

uuid_id! {
    /// Identifier correlating a wire frame with its response frame.
    CorrelationId
}

/// Identifier of a service, doubling as its overlay hostname.
///
/// A service ID is a DNS label: 1-63 characters from `[a-z0-9-]`, not
/// starting or ending with `-`. Parsing is case-insensitive; the stored form
/// is lowercase, matching the case-insensitive host rule of the overlay URL
/// grammar.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ServiceId(String);

impl ServiceId {
    /// Maximum length of a service ID, per the DNS label limit.
    pub const MAX_LEN: usize = 63;

    /// Return the lowercase string form.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl FromStr for ServiceId {
    type Err = IdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.is_empty() {
            return Err(IdError::Empty);
        }
        if s.len() > Self::MAX_LEN {
            return Err(IdError::TooLong {
                max: Self::MAX_LEN,
                got: s.len(),
            });
        }
        let lowered = s.to_ascii_lowercase();
        for c in lowered.chars() {
            if !(c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-') {
                return Err(IdError::InvalidChar(c));
            }
        }
        if lowered.starts_with('-') || lowered.ends_with('-') {
            return Err(IdError::InvalidChar('-'));
        }
        Ok(Self(lowered))
    }
}

impl fmt::Debug for ServiceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ServiceId({})", self.0)
    }
}

impl fmt::Display for ServiceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl TryFrom<String> for ServiceId {
    type Error = IdError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<ServiceId> for String {
    fn from(id: ServiceId) -> Self {
        id.0
    }
}

/// Identifier of an ephemeral pod group.
///
/// Group IDs are free-form non-empty strings chosen by pack code, e.g.
/// `chat:room`. They are bounded only by length.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct GroupId(String);

impl GroupId {
    /// Maximum length of a group ID.
    pub const MAX_LEN: usize = 256;

    /// Return the string form.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl FromStr for GroupId {
    type Err = IdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.is_empty() {
            return Err(IdError::Empty);
        }
        if s.len() > Self::MAX_LEN {
            return Err(IdError::TooLong {
                max: Self::MAX_LEN,
                got: s.len(),
            });
        }
        Ok(Self(s.to_string()))
    }
}

impl fmt::Debug for GroupId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "GroupId({})", self.0)
    }
}

impl fmt::Display for GroupId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl TryFrom<String> for GroupId {
    type Error = IdError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<GroupId> for String {
    fn from(id: GroupId) -> Self {
        id.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pod_id_roundtrip() {
        let id = PodId::generate();
        let s = id.to_string();
        let parsed: PodId = s.parse().unwrap();
        assert_eq!(id, parsed);
    }

    #[test]
    fn pod_id_deterministic() {
        let a = PodId::generate_deterministic(7);
        let b = PodId::generate_deterministic(7);
        let c = PodId::generate_deterministic(8);
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn distinct_types_distinct_deterministic_ids() {
        // Same seed must not collide across ID types.
        let pod = PodId::generate_deterministic(1);
        let node = NodeId::generate_deterministic(1);
        assert_ne!(pod.as_uuid(), node.as_uuid());
    }

    #[test]
    fn node_id_serde_json() {
        let id = NodeId::generate();
        let json = serde_json::to_string(&id).unwrap();
        let parsed: NodeId = serde_json::from_str(&json).unwrap();
        assert_eq!(id, parsed);
    }

    #[test]
    fn node_id_invalid_uuid() {
        let result: Result<NodeId, _> = "not-a-uuid".parse();
        assert!(matches!(result, Err(IdError::InvalidUuid)));
    }

    #[test]
    fn service_id_lowercases() {
        let id: ServiceId = "Billing".parse().unwrap();
        assert_eq!(id.as_str(), "billing");
    }

    #[test]
    fn service_id_rejects_empty() {
        let result: Result<ServiceId, _> = "".parse();
        assert!(matches!(result, Err(IdError::Empty)));
    }

    #[test]
    fn service_id_rejects_bad_chars() {
        let result: Result<ServiceId, _> = "my_service".parse();
        assert!(matches!(result, Err(IdError::InvalidChar('_'))));

        let result: Result<ServiceId, _> = "-leading".parse();
        assert!(matches!(result, Err(IdError::InvalidChar('-'))));
    }

    #[test]
    fn service_id_rejects_too_long() {
        let long = "a".repeat(64);
        let result: Result<ServiceId, _> = long.parse();
        assert!(matches!(result, Err(IdError::TooLong { max: 63, got: 64 })));
    }

    #[test]
    fn service_id_serde_roundtrip() {
        let id: ServiceId = "billing".parse().unwrap();
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, "\"billing\"");
        let parsed: ServiceId = serde_json::from_str(&json).unwrap();
        assert_eq!(id, parsed);
    }

    #[test]
    fn group_id_accepts_colon() {
        let id: GroupId = "chat:room".parse().unwrap();
        assert_eq!(id.as_str(), "chat:room");
    }

    #[test]
    fn group_id_rejects_empty() {
        let result: Result<GroupId, _> = "".parse();
        assert!(matches!(result, Err(IdError::Empty)));
    }
}
