//! Write consistency levels.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// The minimum number of replica acknowledgements a write needs before it is
/// reported successful.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConsistencyLevel {
    /// One ack, where a queued hinted-handoff write counts as an ack.
    Any,
    /// One replica ack.
    #[default]
    One,
    /// A majority of replicas.
    Quorum,
    /// Every replica.
    All,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid consistency level: {0}")]
pub struct InvalidConsistencyLevel(pub String);

impl ConsistencyLevel {
    /// Acks required for a replica set of `n` owners.
    pub fn required_acks(self, n: usize) -> usize {
        match self {
            ConsistencyLevel::Any | ConsistencyLevel::One => 1,
            ConsistencyLevel::Quorum => n / 2 + 1,
            ConsistencyLevel::All => n,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ConsistencyLevel::Any => "any",
            ConsistencyLevel::One => "one",
            ConsistencyLevel::Quorum => "quorum",
            ConsistencyLevel::All => "all",
        }
    }
}

impl FromStr for ConsistencyLevel {
    type Err = InvalidConsistencyLevel;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "any" => Ok(ConsistencyLevel::Any),
            "one" => Ok(ConsistencyLevel::One),
            "quorum" => Ok(ConsistencyLevel::Quorum),
            "all" => Ok(ConsistencyLevel::All),
            _ => Err(InvalidConsistencyLevel(s.to_string())),
        }
    }
}

impl fmt::Display for ConsistencyLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_case_insensitive() {
        assert_eq!("any".parse::<ConsistencyLevel>().unwrap(), ConsistencyLevel::Any);
        assert_eq!("ONE".parse::<ConsistencyLevel>().unwrap(), ConsistencyLevel::One);
        assert_eq!("Quorum".parse::<ConsistencyLevel>().unwrap(), ConsistencyLevel::Quorum);
        assert_eq!("aLL".parse::<ConsistencyLevel>().unwrap(), ConsistencyLevel::All);
    }

    #[test]
    fn test_parse_rejects_unknown() {
        let err = "most".parse::<ConsistencyLevel>().unwrap_err();
        assert_eq!(err, InvalidConsistencyLevel("most".into()));
        assert!(err.to_string().contains("most"));
        assert!("".parse::<ConsistencyLevel>().is_err());
    }

    #[test]
    fn test_required_acks() {
        for n in 1..=7 {
            assert_eq!(ConsistencyLevel::Any.required_acks(n), 1);
            assert_eq!(ConsistencyLevel::One.required_acks(n), 1);
            assert_eq!(ConsistencyLevel::Quorum.required_acks(n), n / 2 + 1);
            assert_eq!(ConsistencyLevel::All.required_acks(n), n);
        }
        assert_eq!(ConsistencyLevel::Quorum.required_acks(3), 2);
        assert_eq!(ConsistencyLevel::Quorum.required_acks(4), 3);
    }

    #[test]
    fn test_display_roundtrip() {
        for level in [
            ConsistencyLevel::Any,
            ConsistencyLevel::One,
            ConsistencyLevel::Quorum,
            ConsistencyLevel::All,
        ] {
            assert_eq!(level.to_string().parse::<ConsistencyLevel>().unwrap(), level);
        }
    }
}
