pub mod enricher;

use std::fmt;

use serde::{Serialize, Serializer};

use crate::geo::GeoLocation;

pub use self::enricher::Enricher;

/// Sentinel written on the wire for fields that could not be resolved.
pub const UNKNOWN: &str = "N/A";

/// Position of a relay within its circuit path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum Role {
    Entry,
    Middle,
    Exit,
}

impl Role {
    /// Role of the hop at `index` in a path of `len` hops.
    ///
    /// The last hop is always the exit, so a single-hop path yields `Exit`.
    pub const fn from_position(index: usize, len: usize) -> Self {
        if index + 1 == len {
            Self::Exit
        } else if index == 0 {
            Self::Entry
        } else {
            Self::Middle
        }
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Entry => "Entry",
            Self::Middle => "Middle",
            Self::Exit => "Exit",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A relay hop enriched with address, country, position and bandwidth.
///
/// Every field past `fingerprint` is resolved independently; `None` means
/// that lookup failed and the rest of the record is still usable.
#[derive(Debug, Clone, PartialEq)]
pub struct RelayRecord {
    pub fingerprint: String,
    pub nickname: Option<String>,
    pub address: Option<String>,
    /// Country label from the control channel.
    pub country: Option<String>,
    /// Coordinates from the geolocation database.
    pub location: Option<GeoLocation>,
    pub bandwidth: Option<u64>,
    pub role: Role,
}

impl RelayRecord {
    pub fn latitude(&self) -> Option<f64> {
        self.location.as_ref().map(|l| l.latitude)
    }

    pub fn longitude(&self) -> Option<f64> {
        self.location.as_ref().map(|l| l.longitude)
    }
}

/// Serialize `None` as the `"N/A"` sentinel.
pub(crate) fn or_unknown<T, S>(value: &Option<T>, serializer: S) -> Result<S::Ok, S::Error>
where
    T: Serialize,
    S: Serializer,
{
    match value {
        Some(v) => v.serialize(serializer),
        None => serializer.serialize_str(UNKNOWN),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_role_three_hop_path() {
        let roles: Vec<Role> = (0..3).map(|i| Role::from_position(i, 3)).collect();
        assert_eq!(roles, vec![Role::Entry, Role::Middle, Role::Exit]);
    }

    #[test]
    fn test_role_single_hop_is_exit() {
        assert_eq!(Role::from_position(0, 1), Role::Exit);
    }

    #[test]
    fn test_role_two_hop_path() {
        assert_eq!(Role::from_position(0, 2), Role::Entry);
        assert_eq!(Role::from_position(1, 2), Role::Exit);
    }

    #[test]
    fn test_role_long_path_interior_is_middle() {
        for i in 1..7 {
            assert_eq!(Role::from_position(i, 8), Role::Middle);
        }
        assert_eq!(Role::from_position(7, 8), Role::Exit);
    }

    #[test]
    fn test_role_serializes_as_name() {
        assert_eq!(serde_json::to_string(&Role::Middle).unwrap(), "\"Middle\"");
    }
}
