use super::{InvocationWrapper, Next, Plugin};
use crate::core::Result;
use crate::object::{DeclaredType, Invocation, MethodDescriptor};
use crate::result::Outcome;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{Level, event};

/// Records how long every sql object call takes.
///
/// Each call emits a DEBUG tracing event with the elapsed time. Calls slower
/// than the optional threshold are also reported with `log::warn!`.
#[derive(Debug, Clone, Default)]
pub struct TimingPlugin {
    slow_threshold: Option<Duration>,
}

impl TimingPlugin {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn slow_threshold(mut self, threshold: Duration) -> Self {
        self.slow_threshold = Some(threshold);
        self
    }
}

impl Plugin for TimingPlugin {
    fn name(&self) -> &'static str {
        "timing"
    }

    fn wrapper_for(
        &self,
        declared: &DeclaredType,
        _method: &MethodDescriptor,
    ) -> Option<Arc<dyn InvocationWrapper>> {
        Some(Arc::new(TimingWrapper {
            declared_type: declared.name,
            slow_threshold: self.slow_threshold,
        }))
    }
}

struct TimingWrapper {
    declared_type: &'static str,
    slow_threshold: Option<Duration>,
}

impl InvocationWrapper for TimingWrapper {
    fn invoke(&self, invocation: &mut Invocation<'_>, next: Next<'_>) -> Result<Outcome> {
        let started = Instant::now();
        let outcome = next(invocation);
        let elapsed = started.elapsed();

        event!(
            Level::DEBUG,
            declared_type = %self.declared_type,
            method = %invocation.method(),
            elapsed_us = elapsed.as_micros() as u64,
            ok = outcome.is_ok(),
            "sql object call timed"
        );

        if let Some(threshold) = self.slow_threshold {
            if elapsed > threshold {
                log::warn!(
                    "Slow sql object call {}::{} took {:?}",
                    self.declared_type,
                    invocation.method().name,
                    elapsed
                );
            }
        }
        outcome
    }
}
