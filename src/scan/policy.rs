//! Retry policy keyed on the fetch error kind

use crate::fetcher::FetchErrorKind;

/// What a failed fetch means for the scan and its subject
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Requeue the task and pause the whole scan
    Stall,

    /// Requeue the task and shrink the worker pool
    Throttle,

    /// Requeue the subject with its rerequest count bumped
    Retry,

    /// Record the subject as permanently absent
    Absent,

    /// Record the subject as failed
    Failed,
}

/// Decides how to handle a failed fetch
///
/// # Arguments
///
/// * `kind` - Classification of the fetch error
/// * `rerequests` - Retries already spent on the subject
/// * `max_rerequests` - Retry budget per subject
pub fn classify(kind: FetchErrorKind, rerequests: u32, max_rerequests: u32) -> Disposition {
    match kind {
        FetchErrorKind::CredentialsExhausted => Disposition::Stall,
        FetchErrorKind::RateLimited => Disposition::Throttle,
        FetchErrorKind::NotFound => Disposition::Absent,
        FetchErrorKind::ServerError if rerequests < max_rerequests => Disposition::Retry,
        FetchErrorKind::ServerError | FetchErrorKind::Other => Disposition::Failed,
    }
}
