/// Scan lifecycle definitions
///
/// A scan moves `enqueued → active → {stalling, halting} → {stalled, completed}`.
/// A stalled scan can be resumed (`stalled → active`) or halted for good
/// (`stalled → completed`). `completed` is terminal.
use std::fmt;

/// Represents the current lifecycle state of a scan
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ScanState {
    /// Persisted and waiting for its turn
    Enqueued,

    /// Workers are fetching pages
    Active,

    /// Paused by the provider; in-flight requests are draining
    Stalling,

    /// Paused with nothing in flight, waiting for a resume
    Stalled,

    /// Stop requested; in-flight requests are draining
    Halting,

    /// Finished, counters snapshotted
    Completed,
}

impl ScanState {
    /// Returns true if the state machine permits moving from `self` to `to`
    ///
    /// Once a scan is `Stalling` the only legal target is `Stalled`, and once
    /// it is `Halting` the only legal target is `Completed`. Late callbacks
    /// requesting anything else are dropped by the caller.
    pub fn accepts(&self, to: ScanState) -> bool {
        matches!(
            (self, to),
            (Self::Enqueued, Self::Active)
                | (Self::Active, Self::Stalling)
                | (Self::Active, Self::Halting)
                | (Self::Stalling, Self::Stalled)
                | (Self::Halting, Self::Completed)
                | (Self::Stalled, Self::Active)
                | (Self::Stalled, Self::Completed)
        )
    }

    /// Returns true if no further transition is possible
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed)
    }

    /// Returns true if the scan occupies the manager's active slot
    pub fn is_live(&self) -> bool {
        matches!(
            self,
            Self::Active | Self::Stalling | Self::Stalled | Self::Halting
        )
    }

    /// Returns true if the scan is draining towards a pause or a stop
    pub fn is_draining(&self) -> bool {
        matches!(self, Self::Stalling | Self::Halting)
    }

    /// Converts the scan state to a database string representation
    pub fn to_db_string(&self) -> &'static str {
        match self {
            Self::Enqueued => "enqueued",
            Self::Active => "active",
            Self::Stalling => "stalling",
            Self::Stalled => "stalled",
            Self::Halting => "halting",
            Self::Completed => "completed",
        }
    }

    /// Parses a scan state from a database string representation
    ///
    /// Returns None if the string doesn't match any known state.
    pub fn from_db_string(s: &str) -> Option<Self> {
        match s {
            "enqueued" => Some(Self::Enqueued),
            "active" => Some(Self::Active),
            "stalling" => Some(Self::Stalling),
            "stalled" => Some(Self::Stalled),
            "halting" => Some(Self::Halting),
            "completed" => Some(Self::Completed),
            _ => None,
        }
    }

    /// Returns all possible scan states
    pub fn all_states() -> Vec<Self> {
        vec![
            Self::Enqueued,
            Self::Active,
            Self::Stalling,
            Self::Stalled,
            Self::Halting,
            Self::Completed,
        ]
    }
}

impl fmt::Display for ScanState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_db_string())
    }
}
