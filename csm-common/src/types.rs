//! # Shared Value Types
//!
//! Small value types passed between the host surface, the session layer and
//! the cluster core.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::CoreErrorInfo;

/// Fully qualified document address.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DocumentId {
    pub bucket: String,
    pub scope: String,
    pub collection: String,
    pub key: String,
}

impl DocumentId {
    pub const DEFAULT_SCOPE: &'static str = "_default";
    pub const DEFAULT_COLLECTION: &'static str = "_default";

    pub fn new(
        bucket: impl Into<String>,
        scope: impl Into<String>,
        collection: impl Into<String>,
        key: impl Into<String>,
    ) -> Self {
        DocumentId {
            bucket: bucket.into(),
            scope: scope.into(),
            collection: collection.into(),
            key: key.into(),
        }
    }

    /// Address in the default scope and collection of `bucket`.
    pub fn in_default_collection(bucket: impl Into<String>, key: impl Into<String>) -> Self {
        DocumentId::new(bucket, Self::DEFAULT_SCOPE, Self::DEFAULT_COLLECTION, key)
    }

    /// `scope.collection` path of the keyspace.
    pub fn collection_path(&self) -> String {
        format!("{}.{}", self.scope, self.collection)
    }
}

impl fmt::Display for DocumentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}/{}", self.bucket, self.scope, self.collection, self.key)
    }
}

/// Synchronous replication requirement for a mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum DurabilityLevel {
    #[default]
    None,
    Majority,
    MajorityAndPersistToActive,
    PersistToMajority,
}

impl DurabilityLevel {
    pub const fn as_str(self) -> &'static str {
        match self {
            DurabilityLevel::None => "none",
            DurabilityLevel::Majority => "majority",
            DurabilityLevel::MajorityAndPersistToActive => "majorityAndPersistToActive",
            DurabilityLevel::PersistToMajority => "persistToMajority",
        }
    }

    /// Minimum number of replicas the level needs beyond the active node.
    pub const fn required_replicas(self) -> u32 {
        match self {
            DurabilityLevel::None => 0,
            _ => 1,
        }
    }
}

impl FromStr for DurabilityLevel {
    type Err = CoreErrorInfo;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "none" => Ok(DurabilityLevel::None),
            "majority" => Ok(DurabilityLevel::Majority),
            "majorityAndPersistToActive" => Ok(DurabilityLevel::MajorityAndPersistToActive),
            "persistToMajority" => Ok(DurabilityLevel::PersistToMajority),
            other => Err(CoreErrorInfo::invalid_argument(format!(
                "unknown durability level: {}",
                other
            ))),
        }
    }
}

impl fmt::Display for DurabilityLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Phase of a process duplication.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ForkEvent {
    /// Before duplication, in the original process.
    Prepare,
    /// After duplication, in the original process.
    Parent,
    /// After duplication, in the duplicated process.
    Child,
}

impl ForkEvent {
    pub const fn as_str(self) -> &'static str {
        match self {
            ForkEvent::Prepare => "prepare",
            ForkEvent::Parent => "parent",
            ForkEvent::Child => "child",
        }
    }

    /// True for the two post-duplication phases.
    pub const fn is_resume(self) -> bool {
        !matches!(self, ForkEvent::Prepare)
    }
}

impl FromStr for ForkEvent {
    type Err = CoreErrorInfo;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "prepare" => Ok(ForkEvent::Prepare),
            "parent" => Ok(ForkEvent::Parent),
            "child" => Ok(ForkEvent::Child),
            other => Err(CoreErrorInfo::invalid_argument(format!(
                "unexpected fork event: {}",
                other
            ))),
        }
    }
}

impl fmt::Display for ForkEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{CommonErrc, ErrorCode};

    #[test]
    fn durability_parses_host_spelling() {
        let level: DurabilityLevel = "majorityAndPersistToActive".parse().unwrap();
        assert_eq!(level, DurabilityLevel::MajorityAndPersistToActive);
        assert_eq!(level.to_string(), "majorityAndPersistToActive");
    }

    #[test]
    fn unknown_durability_is_invalid_argument() {
        let err = "quorum".parse::<DurabilityLevel>().unwrap_err();
        assert_eq!(err.code, ErrorCode::Common(CommonErrc::InvalidArgument));
        assert_eq!(err.message, "unknown durability level: quorum");
    }

    #[test]
    fn fork_event_parses() {
        assert_eq!("child".parse::<ForkEvent>().unwrap(), ForkEvent::Child);
        assert!(ForkEvent::Parent.is_resume());
        assert!(!ForkEvent::Prepare.is_resume());
        assert!("spoon".parse::<ForkEvent>().is_err());
    }

    #[test]
    fn document_id_display() {
        let id = DocumentId::in_default_collection("travel", "airline_10");
        assert_eq!(id.to_string(), "travel/_default/_default/airline_10");
        assert_eq!(id.collection_path(), "_default._default");
    }
}
