use super::{InvocationWrapper, Next, Plugin};
use crate::core::{DbError, Result};
use crate::object::{DeclaredType, Invocation, MethodDescriptor, Marker};
use crate::result::Outcome;
use std::sync::Arc;

/// Decides whether a failed attempt is worth repeating.
pub type RetryPredicate = fn(&DbError) -> bool;

/// Re-runs the inner invocation of statement methods when it fails with a
/// retryable error.
///
/// Only methods bound to a statement are wrapped: repeating a default body or
/// a transaction callback could repeat side effects the caller does not
/// expect.
#[derive(Debug, Clone)]
pub struct RetryPlugin {
    max_attempts: usize,
    retryable: RetryPredicate,
}

fn engine_failure(err: &DbError) -> bool {
    matches!(err, DbError::Statement { .. })
}

impl RetryPlugin {
    pub fn new(max_attempts: usize) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            retryable: engine_failure,
        }
    }

    pub fn retry_when(mut self, predicate: RetryPredicate) -> Self {
        self.retryable = predicate;
        self
    }
}

impl Plugin for RetryPlugin {
    fn name(&self) -> &'static str {
        "retry"
    }

    fn wrapper_for(
        &self,
        _declared: &DeclaredType,
        method: &MethodDescriptor,
    ) -> Option<Arc<dyn InvocationWrapper>> {
        if !method.markers.iter().any(Marker::is_statement) {
            return None;
        }
        Some(Arc::new(self.clone()))
    }
}

impl InvocationWrapper for RetryPlugin {
    fn invoke(&self, invocation: &mut Invocation<'_>, next: Next<'_>) -> Result<Outcome> {
        let mut attempt = 1;
        loop {
            match next(invocation) {
                Err(err) if attempt < self.max_attempts && (self.retryable)(&err) => {
                    log::warn!(
                        "Attempt {}/{} of {} failed, retrying: {}",
                        attempt,
                        self.max_attempts,
                        invocation.method().name,
                        err
                    );
                    attempt += 1;
                }
                outcome => return outcome,
            }
        }
    }
}
