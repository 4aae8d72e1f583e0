//! Safety supervisor: the only path into extension code.
//!
//! Every call is wrapped the same way:
//! 1. consult the circuit breaker,
//! 2. take an in-flight slot on the handle (fail fast when exhausted),
//! 3. run the call on the blocking pool inside `catch_unwind`,
//! 4. bound the wait with the configured timeout,
//! 5. record the outcome on the breaker and the statistics.
//!
//! A timed-out call keeps its slot and its `Arc` on the handle until the
//! extension really returns, so slots also bound abandoned native calls.

use std::any::Any;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::Value;
use tracing::{debug, error, warn};
use uuid::Uuid;

use super::error::{ExtensionError, Result};
use super::handle::ExtensionHandle;
use super::safety::{CircuitStatus, SafetyManager};
use super::system::{ExtensionMetricValue, ExtensionStats};
use crate::config::SafetyConfig;

/// Which capability a supervised call exercises.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    Command,
    ProduceMetrics,
    HealthCheck,
}

impl std::fmt::Display for Operation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Command => write!(f, "command"),
            Self::ProduceMetrics => write!(f, "produce_metrics"),
            Self::HealthCheck => write!(f, "health_check"),
        }
    }
}

pub struct SafetySupervisor {
    safety: SafetyManager,
    call_timeout: Duration,
}

impl SafetySupervisor {
    pub fn new(config: &SafetyConfig) -> Self {
        Self {
            safety: SafetyManager::new(config.failure_threshold, config.breaker_cooldown()),
            call_timeout: config.command_timeout(),
        }
    }

    pub fn call_timeout(&self) -> Duration {
        self.call_timeout
    }

    pub fn safety(&self) -> &SafetyManager {
        &self.safety
    }

    pub fn circuit_status(&self, extension_id: &str) -> CircuitStatus {
        self.safety.status(extension_id)
    }

    pub fn stats(&self, extension_id: &str) -> ExtensionStats {
        self.safety.stats(extension_id)
    }

    pub fn reset(&self, extension_id: &str) {
        self.safety.reset(extension_id);
    }

    pub fn forget(&self, extension_id: &str) {
        self.safety.remove(extension_id);
    }

    /// Execute a command whose arguments were already validated.
    pub async fn execute_command(
        &self,
        handle: Arc<ExtensionHandle>,
        command: impl Into<String>,
        args: Value,
    ) -> Result<Value> {
        let command = command.into();
        self.supervise(handle, Operation::Command, move |h| {
            h.run_command(&command, &args)
        })
        .await
    }

    pub async fn produce_metrics(
        &self,
        handle: Arc<ExtensionHandle>,
    ) -> Result<Vec<ExtensionMetricValue>> {
        self.supervise(handle, Operation::ProduceMetrics, |h| h.run_produce_metrics())
            .await
    }

    pub async fn health_check(&self, handle: Arc<ExtensionHandle>) -> Result<bool> {
        self.supervise(handle, Operation::HealthCheck, |h| h.run_health_check())
            .await
    }

    async fn supervise<T, F>(
        &self,
        handle: Arc<ExtensionHandle>,
        operation: Operation,
        call: F,
    ) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&ExtensionHandle) -> Result<T> + Send + 'static,
    {
        let extension_id = handle.id().to_string();

        let breaker = self.safety.breaker(&extension_id);
        if !breaker.allow_request() {
            debug!(extension_id = %extension_id, %operation, "Circuit open, call short-circuited");
            return Err(ExtensionError::CircuitOpen(extension_id));
        }

        let Some(slot) = handle.try_acquire_slot() else {
            // A half-open grant must not be held by a call that never runs.
            breaker.release_half_open();
            warn!(
                extension_id = %extension_id,
                %operation,
                max_in_flight = handle.max_in_flight(),
                "Rejecting call, in-flight limit reached"
            );
            return Err(ExtensionError::ResourceExceeded(format!(
                "{} calls already in flight for {}",
                handle.max_in_flight(),
                extension_id
            )));
        };

        let call_id = Uuid::new_v4();
        let started = Instant::now();
        let task_handle = handle.clone();
        let task = tokio::task::spawn_blocking(move || {
            let _slot = slot;
            catch_unwind(AssertUnwindSafe(|| call(&task_handle)))
        });

        let outcome = match tokio::time::timeout(self.call_timeout, task).await {
            Err(_) => {
                handle.interrupt();
                warn!(
                    extension_id = %extension_id,
                    %operation,
                    %call_id,
                    timeout_ms = self.call_timeout.as_millis() as u64,
                    "Extension call timed out, result will be discarded"
                );
                Err(ExtensionError::Timeout(self.call_timeout.as_millis() as u64))
            }
            Ok(Err(join_error)) => Err(ExtensionError::ExecutionFailed(format!(
                "extension task failed: {join_error}"
            ))),
            Ok(Ok(Err(payload))) => {
                let message = panic_message(payload.as_ref());
                error!(
                    extension_id = %extension_id,
                    %operation,
                    %call_id,
                    panic = %message,
                    "Extension panicked, fault contained"
                );
                Err(ExtensionError::ExecutionFailed(format!(
                    "extension panicked: {message}"
                )))
            }
            Ok(Ok(Ok(result))) => result.map_err(contain),
        };

        let elapsed = started.elapsed();
        self.record(&extension_id, operation, elapsed, &outcome);
        debug!(
            extension_id = %extension_id,
            %operation,
            %call_id,
            elapsed_ms = elapsed.as_millis() as u64,
            ok = outcome.is_ok(),
            "Extension call finished"
        );
        outcome
    }

    fn record<T>(
        &self,
        extension_id: &str,
        operation: Operation,
        elapsed: Duration,
        outcome: &Result<T>,
    ) {
        let breaker = self.safety.breaker(extension_id);
        let stats = self.safety.stats_cell(extension_id);
        let mut stats = stats.lock();

        stats.total_execution_time_ms += elapsed.as_millis() as u64;
        stats.last_execution_time = Some(chrono::Utc::now());

        match outcome {
            Ok(_) => {
                breaker.record_success();
                match operation {
                    Operation::Command => stats.commands_executed += 1,
                    Operation::ProduceMetrics => stats.metrics_produced += 1,
                    Operation::HealthCheck => stats.health_checks += 1,
                }
            }
            Err(err) => {
                if err.is_extension_fault() {
                    breaker.record_failure();
                } else {
                    // The extension answered; only the request was bad.
                    breaker.record_success();
                }
                stats.failures += 1;
                if matches!(err, ExtensionError::Timeout(_)) {
                    stats.timeouts += 1;
                }
                stats.last_error = Some(err.to_string());
            }
        }
    }
}

/// Traps never leave the supervisor as anything but `ExecutionFailed`.
fn contain(err: ExtensionError) -> ExtensionError {
    match err {
        ExtensionError::ModuleTrap(trap) => {
            ExtensionError::ExecutionFailed(format!("module trap: {trap}"))
        }
        other => other,
    }
}

pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
