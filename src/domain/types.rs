//! Shared domain enumerations.

use std::{fmt, str::FromStr};

use serde::{Deserialize, Serialize};

/// Status id the upstream assigns to every won ("closed") lead.
pub const WON_STATUS_ID: i64 = 142;

/// The cached collections served by this process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DatasetKind {
    /// Every lead created since the configured start date.
    Leads,
    /// Leads that reached a closing status.
    Closed,
}

impl DatasetKind {
    pub const ALL: [DatasetKind; 2] = [DatasetKind::Leads, DatasetKind::Closed];

    pub fn as_str(self) -> &'static str {
        match self {
            DatasetKind::Leads => "leads",
            DatasetKind::Closed => "closed",
        }
    }
}

impl fmt::Display for DatasetKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownDataset(pub String);

impl fmt::Display for UnknownDataset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unknown dataset `{}`", self.0)
    }
}

impl std::error::Error for UnknownDataset {}

impl FromStr for DatasetKind {
    type Err = UnknownDataset;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "leads" => Ok(DatasetKind::Leads),
            "closed" | "fechados" => Ok(DatasetKind::Closed),
            other => Err(UnknownDataset(other.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dataset_names_round_trip() {
        for kind in DatasetKind::ALL {
            assert_eq!(kind.as_str().parse::<DatasetKind>(), Ok(kind));
        }
    }

    #[test]
    fn legacy_closed_alias_is_accepted() {
        assert_eq!("fechados".parse::<DatasetKind>(), Ok(DatasetKind::Closed));
        assert!("posts".parse::<DatasetKind>().is_err());
    }
}
