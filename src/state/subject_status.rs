use serde::{Deserialize, Serialize};
use std::fmt;

/// Terminal status of a fetched subject (product or category page)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SubjectStatus {
    /// Page fetched and extracted
    Recorded,

    /// The marketplace confirmed the page does not exist
    Absent,

    /// Retries exhausted or an unclassified error
    Failed,
}

impl SubjectStatus {
    pub fn to_db_string(&self) -> &'static str {
        match self {
            Self::Recorded => "recorded",
            Self::Absent => "absent",
            Self::Failed => "failed",
        }
    }

    pub fn from_db_string(s: &str) -> Option<Self> {
        match s {
            "recorded" => Some(Self::Recorded),
            "absent" => Some(Self::Absent),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }
}

impl fmt::Display for SubjectStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_db_string())
    }
}

/// Progress of the discovery crawl on a main category
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DiscoveryState {
    Created,
    Started,
    Completed,
}

impl DiscoveryState {
    pub fn to_db_string(&self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Started => "started",
            Self::Completed => "completed",
        }
    }

    pub fn from_db_string(s: &str) -> Option<Self> {
        match s {
            "created" => Some(Self::Created),
            "started" => Some(Self::Started),
            "completed" => Some(Self::Completed),
            _ => None,
        }
    }
}
