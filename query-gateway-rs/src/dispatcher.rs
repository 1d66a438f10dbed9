//! Concurrent fan-out of a dispatch plan.
//!
//! Every planned service is called in parallel under its own deadline. The
//! deadline covers the retry too. The batch as a whole is bounded by the
//! largest entry timeout plus a margin; anything still running at that
//! point is recorded as a timeout, so one outcome per entry always comes
//! back.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use error_handling_rs::{ErrorKind, RetryPolicy};
use futures_util::stream::{FuturesUnordered, StreamExt};
use metrics::{histogram, increment_counter};
use tracing::{debug, warn};

use crate::domain_client::DomainClient;
use crate::models::{DispatchPlan, DomainPayload, OutcomeStatus, PlanEntry, ServiceOutcome};

pub struct Dispatcher {
    client: Arc<dyn DomainClient>,
    retry: RetryPolicy,
    batch_margin: Duration,
}

impl Dispatcher {
    pub fn new(client: Arc<dyn DomainClient>, retry: RetryPolicy, batch_margin: Duration) -> Self {
        Self { client, retry, batch_margin }
    }

    /// Retries once after `retry_backoff` on connection failures only
    pub fn with_settings(
        client: Arc<dyn DomainClient>,
        retry_backoff: Duration,
        batch_margin: Duration,
    ) -> Self {
        Self::new(
            client,
            RetryPolicy::transient_network("domain-dispatch", retry_backoff),
            batch_margin,
        )
    }

    /// Runs the plan; outcomes come back in plan order
    pub async fn execute(&self, plan: &DispatchPlan) -> Vec<ServiceOutcome> {
        self.execute_with(plan, |_| {}).await
    }

    /// Runs the plan, calling `on_outcome` as each service finishes, in
    /// completion order. Outcomes come back in plan order.
    pub async fn execute_with<F>(&self, plan: &DispatchPlan, mut on_outcome: F) -> Vec<ServiceOutcome>
    where
        F: FnMut(&ServiceOutcome),
    {
        if plan.entries.is_empty() {
            return Vec::new();
        }

        let ceiling = plan.max_timeout() + self.batch_margin;
        let started = Instant::now();

        let mut pending: FuturesUnordered<_> = plan
            .entries
            .iter()
            .enumerate()
            .map(|(index, entry)| async move { (index, self.run_entry(entry).await) })
            .collect();

        let mut slots: Vec<Option<ServiceOutcome>> = vec![None; plan.entries.len()];
        let batch_deadline = tokio::time::sleep(ceiling);
        tokio::pin!(batch_deadline);

        loop {
            tokio::select! {
                next = pending.next() => match next {
                    Some((index, outcome)) => {
                        on_outcome(&outcome);
                        slots[index] = Some(outcome);
                    }
                    None => break,
                },
                _ = &mut batch_deadline => {
                    warn!(
                        query_id = %plan.query_id,
                        ceiling_ms = ceiling.as_millis() as u64,
                        "Dispatch batch ceiling reached"
                    );
                    break;
                }
            }
        }
        // cancels whatever is still in flight
        drop(pending);

        let elapsed = started.elapsed();
        let mut outcomes = Vec::with_capacity(slots.len());
        for (entry, slot) in plan.entries.iter().zip(slots) {
            let outcome = match slot {
                Some(outcome) => outcome,
                None => {
                    let outcome = ServiceOutcome::failure(
                        &entry.descriptor.name,
                        OutcomeStatus::Timeout,
                        format!("no answer within the {}ms batch ceiling", ceiling.as_millis()),
                        elapsed,
                        1,
                    );
                    on_outcome(&outcome);
                    outcome
                }
            };
            outcomes.push(outcome);
        }

        outcomes
    }

    async fn run_entry(&self, entry: &PlanEntry) -> ServiceOutcome {
        let name = entry.descriptor.name.as_str();
        let attempts = AtomicU32::new(0);
        let started = Instant::now();

        let call = self.retry.retry(name, |attempt| {
            attempts.store(attempt, Ordering::Relaxed);
            let client = self.client.clone();
            let descriptor = entry.descriptor.clone();
            let request = entry.sub_request.clone();
            async move { client.query(&descriptor, &request).await }
        });

        let result = tokio::time::timeout(entry.timeout, call).await;
        let elapsed = started.elapsed();
        let attempts = attempts.load(Ordering::Relaxed).max(1);

        let outcome = match result {
            Ok(Ok(body)) => ServiceOutcome::success(
                name,
                DomainPayload::from_response(entry.descriptor.domain, body),
                elapsed,
                attempts,
            ),
            Ok(Err(err)) if err.kind == ErrorKind::Timeout => {
                ServiceOutcome::failure(name, OutcomeStatus::Timeout, err.message, elapsed, attempts)
            }
            Ok(Err(err)) => {
                let message = match err.status {
                    Some(status) => format!("{} (HTTP {})", err.message, status),
                    None => err.message,
                };
                ServiceOutcome::failure(name, OutcomeStatus::Error, message, elapsed, attempts)
            }
            Err(_) => ServiceOutcome::failure(
                name,
                OutcomeStatus::Timeout,
                format!("no answer within {}ms", entry.timeout.as_millis()),
                elapsed,
                attempts,
            ),
        };

        debug!(
            service = %name,
            status = outcome.status.as_str(),
            elapsed_ms = outcome.elapsed_ms,
            attempts,
            degraded = entry.degraded,
            "Domain call finished"
        );
        histogram!(
            "gateway_domain_call_duration_ms",
            elapsed.as_millis() as f64,
            "service" => name.to_string()
        );
        increment_counter!(
            "gateway_domain_calls_total",
            "service" => name.to_string(),
            "status" => outcome.status.as_str()
        );

        outcome
    }
}
