//! Typed ID definitions.
//!
//! Each id is a ULID rendered as `{prefix}_{ulid}`. Ids are minted locally
//! and only parsed back when an operator supplies one (e.g. the node id).

macro_rules! prefixed_id {
    ($(#[$meta:meta])* $name:ident, $prefix:literal) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        pub struct $name(crate::Ulid);

        impl $name {
            pub const PREFIX: &'static str = $prefix;

            #[must_use]
            pub fn new() -> Self {
                Self(crate::Ulid::new())
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}_{}", Self::PREFIX, self.0)
            }
        }

        impl std::str::FromStr for $name {
            type Err = crate::IdError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                parse_prefixed(s, Self::PREFIX).map(Self)
            }
        }
    };
}

/// Split `{prefix}_{ulid}` and check the prefix.
fn parse_prefixed(s: &str, expected: &'static str) -> Result<crate::Ulid, crate::IdError> {
    if s.is_empty() {
        return Err(crate::IdError::Empty);
    }
    let (prefix, raw) = s
        .split_once('_')
        .ok_or(crate::IdError::MissingSeparator)?;
    if prefix != expected {
        return Err(crate::IdError::InvalidPrefix {
            expected,
            actual: prefix.to_string(),
        });
    }
    raw.parse()
        .map_err(|e: ulid::DecodeError| crate::IdError::InvalidUlid(e.to_string()))
}

prefixed_id!(
    /// One function invocation, from arrival to completion or drop.
    RequestId,
    "req"
);

prefixed_id!(
    /// A local execution container handed out by the node's warm pool.
    ContainerId,
    "ctr"
);

prefixed_id!(
    /// A scheduling node (the local node or an offload target).
    NodeId,
    "node"
);
