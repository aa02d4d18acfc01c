//! Classification of failed calls into renewable and pass-through failures

use crate::types::RequestAttempt;
use reqwest::StatusCode;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureClass {
    /// Unauthorized on a first attempt: eligible for one token renewal
    AuthFailure,
    /// Anything else: handed back to the caller unchanged
    NotAuthFailure,
}

/// Decide whether a failed call may enter token renewal
///
/// `status` is `None` when no response was received at all.
pub fn classify(status: Option<StatusCode>, attempt: &RequestAttempt) -> FailureClass {
    match status {
        Some(StatusCode::UNAUTHORIZED) if !attempt.retried() => FailureClass::AuthFailure,
        _ => FailureClass::NotAuthFailure,
    }
}
