//! Readiness Prober
//!
//! After a provider acknowledges an action the resource is only *requested*.
//! The prober polls the node's readiness signal until it proves the resource
//! usable by dependents, with a hard timeout:
//! - transient observe errors are retried within the same budget
//! - an explicit failure status from the underlying system fails at once
//! - cancellation is honoured between and during polls

use crate::error::ProbeError;
use crate::provider::{ObservedStatus, Observation, Provider};
use crate::types::{NodeKey, ValueMap};
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Timeout and poll cadence of a readiness signal
#[derive(Debug, Clone, PartialEq)]
pub struct ProbePolicy {
    pub timeout: Duration,
    pub interval: Duration,
    pub backoff: f64,
    pub max_interval: Duration,
}

impl Default for ProbePolicy {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(600),
            interval: Duration::from_secs(5),
            backoff: 1.5,
            max_interval: Duration::from_secs(30),
        }
    }
}

impl ProbePolicy {
    pub fn new(timeout: Duration, interval: Duration) -> Self {
        Self {
            timeout,
            interval,
            backoff: 1.0,
            max_interval: interval,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_backoff(mut self, backoff: f64, max_interval: Duration) -> Self {
        self.backoff = backoff;
        self.max_interval = max_interval;
        self
    }

    fn next_interval(&self, current: Duration) -> Duration {
        current.mul_f64(self.backoff.max(1.0)).min(self.max_interval)
    }

    fn validate(&self) -> Result<(), String> {
        if self.timeout.is_zero() {
            return Err("readiness timeout must be positive".into());
        }
        if self.interval.is_zero() {
            return Err("readiness poll interval must be positive".into());
        }
        if !self.backoff.is_finite() || self.backoff < 1.0 {
            return Err(format!("backoff multiplier {} must be >= 1", self.backoff));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ReadyPredicate {
    StatusReady,
    OutputPresent(String),
    OutputEquals { output: String, value: Value },
}

impl ReadyPredicate {
    pub fn holds(&self, observation: &Observation) -> bool {
        match self {
            ReadyPredicate::StatusReady => observation.status == ObservedStatus::Ready,
            ReadyPredicate::OutputPresent(name) => observation
                .outputs
                .get(name)
                .is_some_and(|v| !v.is_null()),
            ReadyPredicate::OutputEquals { output, value } => {
                observation.outputs.get(output) == Some(value)
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ReadinessSignal {
    PollUntil {
        predicate: ReadyPredicate,
        policy: ProbePolicy,
    },
    ConditionCount {
        condition: String,
        min: usize,
        policy: ProbePolicy,
    },
    FixedDelay {
        delay: Duration,
        policy: ProbePolicy,
    },
    /// Settles when an external party reports through the [`CallbackHub`].
    Callback { policy: ProbePolicy },
}

impl Default for ReadinessSignal {
    fn default() -> Self {
        ReadinessSignal::PollUntil {
            predicate: ReadyPredicate::StatusReady,
            policy: ProbePolicy::default(),
        }
    }
}

impl ReadinessSignal {
    pub fn status_ready(policy: ProbePolicy) -> Self {
        ReadinessSignal::PollUntil {
            predicate: ReadyPredicate::StatusReady,
            policy,
        }
    }

    pub fn output_present(output: impl Into<String>, policy: ProbePolicy) -> Self {
        ReadinessSignal::PollUntil {
            predicate: ReadyPredicate::OutputPresent(output.into()),
            policy,
        }
    }

    pub fn conditions(condition: impl Into<String>, min: usize, policy: ProbePolicy) -> Self {
        ReadinessSignal::ConditionCount {
            condition: condition.into(),
            min,
            policy,
        }
    }

    pub fn policy(&self) -> &ProbePolicy {
        match self {
            ReadinessSignal::PollUntil { policy, .. }
            | ReadinessSignal::ConditionCount { policy, .. }
            | ReadinessSignal::FixedDelay { policy, .. }
            | ReadinessSignal::Callback { policy } => policy,
        }
    }

    pub fn validate(&self) -> Result<(), String> {
        self.policy().validate()?;
        match self {
            ReadinessSignal::FixedDelay { delay, policy } if *delay >= policy.timeout => Err(
                format!("fixed delay {delay:?} must be shorter than timeout {:?}", policy.timeout),
            ),
            ReadinessSignal::ConditionCount { min: 0, .. } => {
                Err("condition count must be at least 1".into())
            }
            _ => Ok(()),
        }
    }

    fn check(&self, observation: &Observation) -> bool {
        match self {
            ReadinessSignal::PollUntil { predicate, .. } => predicate.holds(observation),
            ReadinessSignal::ConditionCount { condition, min, .. } => {
                observation.true_conditions(condition) >= *min
            }
            ReadinessSignal::FixedDelay { .. } | ReadinessSignal::Callback { .. } => true,
        }
    }
}

pub type CallbackResult = Result<ValueMap, String>;

enum Slot {
    Waiting(oneshot::Sender<CallbackResult>),
    Delivered(CallbackResult),
    /// A wait timed out or was cancelled; its late report is dropped.
    Abandoned,
}

/// Rendezvous for webhook-style readiness reports.
///
/// Notifications that arrive before the prober starts waiting are kept and
/// handed over on registration. After a wait is abandoned the next report for
/// that key belongs to the abandoned attempt and is discarded, so a later run
/// never settles on it.
#[derive(Default)]
pub struct CallbackHub {
    slots: Mutex<HashMap<NodeKey, Slot>>,
}

impl CallbackHub {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn notify(&self, key: &NodeKey, result: CallbackResult) {
        let mut slots = self.slots.lock();
        match slots.remove(key) {
            Some(Slot::Waiting(tx)) => {
                if let Err(result) = tx.send(result) {
                    slots.insert(key.clone(), Slot::Delivered(result));
                }
            }
            Some(Slot::Abandoned) => {
                tracing::warn!(node = %key, "discarding callback for an abandoned wait");
            }
            _ => {
                slots.insert(key.clone(), Slot::Delivered(result));
            }
        }
    }

    fn register(&self, key: &NodeKey) -> oneshot::Receiver<CallbackResult> {
        let (tx, rx) = oneshot::channel();
        let mut slots = self.slots.lock();
        match slots.remove(key) {
            Some(Slot::Delivered(result)) => {
                let _ = tx.send(result);
            }
            _ => {
                slots.insert(key.clone(), Slot::Waiting(tx));
            }
        }
        rx
    }

    fn abandon(&self, key: &NodeKey) {
        let mut slots = self.slots.lock();
        match slots.remove(key) {
            Some(Slot::Waiting(_)) => {
                slots.insert(key.clone(), Slot::Abandoned);
            }
            // A report that raced the timeout belongs to this attempt.
            _ => {}
        }
    }
}

impl std::fmt::Debug for CallbackHub {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallbackHub")
            .field("slots", &self.slots.lock().len())
            .finish()
    }
}

#[derive(Debug, Default)]
pub struct ReadinessProber {
    callbacks: std::sync::Arc<CallbackHub>,
}

impl ReadinessProber {
    pub fn new(callbacks: std::sync::Arc<CallbackHub>) -> Self {
        Self { callbacks }
    }

    pub fn callbacks(&self) -> &std::sync::Arc<CallbackHub> {
        &self.callbacks
    }

    /// Wait until `signal` passes for `key`, returning the observed outputs.
    pub async fn probe(
        &self,
        key: &NodeKey,
        signal: &ReadinessSignal,
        provider: &dyn Provider,
        cancel: &CancellationToken,
    ) -> Result<ValueMap, ProbeError> {
        signal.validate().map_err(ProbeError::InvalidSignal)?;
        let policy = signal.policy();
        let started = Instant::now();
        let deadline = started + policy.timeout;

        match signal {
            ReadinessSignal::FixedDelay { delay, .. } => {
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => return Err(ProbeError::Cancelled),
                    _ = tokio::time::sleep(*delay) => {}
                }
                // The delay itself is the signal; observing only picks up outputs.
                let mut interval = policy.interval;
                let mut last_error = None;
                loop {
                    match self.observe_once(key, provider, deadline, cancel).await? {
                        Ok(observation) => {
                            return match observation.status {
                                ObservedStatus::Failed(reason) => Err(ProbeError::Negative(reason)),
                                _ => Ok(observation.outputs),
                            }
                        }
                        Err(reason) => {
                            tracing::warn!(node = %key, %reason, "transient probe error after delay");
                            last_error = Some(reason);
                        }
                    }
                    self.pause(&mut interval, policy, deadline, started, &last_error, cancel)
                        .await?;
                }
            }
            ReadinessSignal::Callback { .. } => {
                let rx = self.callbacks.register(key);
                let outcome = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => Err(ProbeError::Cancelled),
                    _ = tokio::time::sleep_until(deadline) => Err(ProbeError::Timeout {
                        elapsed_ms: elapsed_ms(started),
                        last_error: Some("no callback received".into()),
                    }),
                    received = rx => match received {
                        Ok(Ok(outputs)) => Ok(outputs),
                        Ok(Err(reason)) => Err(ProbeError::Negative(reason)),
                        Err(_) => Err(ProbeError::Negative("callback channel closed".into())),
                    },
                };
                if matches!(
                    outcome,
                    Err(ProbeError::Timeout { .. } | ProbeError::Cancelled)
                ) {
                    self.callbacks.abandon(key);
                }
                outcome
            }
            ReadinessSignal::PollUntil { .. } | ReadinessSignal::ConditionCount { .. } => {
                self.poll(key, signal, provider, started, deadline, cancel)
                    .await
            }
        }
    }

    /// Wait until the provider reports the resource gone.
    pub async fn wait_absent(
        &self,
        key: &NodeKey,
        policy: &ProbePolicy,
        provider: &dyn Provider,
        cancel: &CancellationToken,
    ) -> Result<(), ProbeError> {
        let started = Instant::now();
        let deadline = started + policy.timeout;
        let mut interval = policy.interval;
        let mut last_error = None;
        loop {
            match self.observe_once(key, provider, deadline, cancel).await? {
                Ok(observation) if observation.status == ObservedStatus::Missing => return Ok(()),
                Ok(observation) => last_error = Some(format!("still {}", observation.status)),
                Err(reason) => last_error = Some(reason),
            }
            tracing::debug!(node = %key, "waiting for deletion");
            self.pause(&mut interval, policy, deadline, started, &last_error, cancel)
                .await?;
        }
    }

    async fn poll(
        &self,
        key: &NodeKey,
        signal: &ReadinessSignal,
        provider: &dyn Provider,
        started: Instant,
        deadline: Instant,
        cancel: &CancellationToken,
    ) -> Result<ValueMap, ProbeError> {
        let policy = signal.policy();
        let mut interval = policy.interval;
        let mut last_error: Option<String> = None;
        let mut attempt = 0u32;

        loop {
            attempt += 1;
            match self.observe_once(key, provider, deadline, cancel).await? {
                Ok(observation) => {
                    if let ObservedStatus::Failed(reason) = &observation.status {
                        tracing::warn!(node = %key, %reason, "resource reported failure");
                        return Err(ProbeError::Negative(reason.clone()));
                    }
                    if signal.check(&observation) {
                        tracing::debug!(node = %key, attempt, "readiness signal passed");
                        return Ok(observation.outputs);
                    }
                    last_error = Some(format!("not ready: status {}", observation.status));
                }
                Err(reason) => {
                    tracing::warn!(node = %key, attempt, %reason, "transient probe error");
                    last_error = Some(reason);
                }
            }
            tracing::debug!(node = %key, attempt, ?interval, "resource not ready, polling again");
            self.pause(&mut interval, policy, deadline, started, &last_error, cancel)
                .await?;
        }
    }

    /// One observe call bounded by the deadline. The inner `Err` carries a
    /// transient failure; definitive provider errors become `Negative`.
    async fn observe_once(
        &self,
        key: &NodeKey,
        provider: &dyn Provider,
        deadline: Instant,
        cancel: &CancellationToken,
    ) -> Result<Result<Observation, String>, ProbeError> {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return Ok(Err("deadline reached before observe".into()));
        }
        let observed = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(ProbeError::Cancelled),
            r = tokio::time::timeout(remaining, provider.observe(key)) => r,
        };
        match observed {
            Err(_) => Ok(Err("observe call exceeded the readiness deadline".into())),
            Ok(Ok(observation)) => Ok(Ok(observation)),
            Ok(Err(e)) if e.is_transient() => Ok(Err(e.to_string())),
            Ok(Err(e)) => Err(ProbeError::Negative(e.to_string())),
        }
    }

    async fn pause(
        &self,
        interval: &mut Duration,
        policy: &ProbePolicy,
        deadline: Instant,
        started: Instant,
        last_error: &Option<String>,
        cancel: &CancellationToken,
    ) -> Result<(), ProbeError> {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return Err(ProbeError::Timeout {
                elapsed_ms: elapsed_ms(started),
                last_error: last_error.clone(),
            });
        }
        let wait = (*interval).min(remaining);
        tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(ProbeError::Cancelled),
            _ = tokio::time::sleep(wait) => {}
        }
        *interval = policy.next_interval(*interval);
        if Instant::now() >= deadline {
            return Err(ProbeError::Timeout {
                elapsed_ms: elapsed_ms(started),
                last_error: last_error.clone(),
            });
        }
        Ok(())
    }
}

fn elapsed_ms(started: Instant) -> u64 {
    u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX)
}
