//! Health table and prober.
//!
//! The table is an `ArcSwap` of an immutable map: readers load the last
//! recorded snapshot without waiting, the prober publishes a new map after
//! every probe.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use backoff::backoff::Backoff;
use backoff::ExponentialBackoff;
use chrono::{DateTime, Utc};
use config_rs::HealthSettings;
use futures_util::future::join_all;
use metrics::increment_counter;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::domain_client::DomainClient;
use crate::error::GatewayError;
use crate::models::{HealthState, HealthStatus, ServiceDescriptor};
use crate::registry::ServiceRegistry;

pub type HealthSnapshot = Arc<HashMap<String, HealthStatus>>;

/// State of `name` in a snapshot; absent services are `unknown`
pub fn state_in(snapshot: &HashMap<String, HealthStatus>, name: &str) -> HealthState {
    snapshot.get(name).map(|s| s.state).unwrap_or_default()
}

/// Applies one probe result to a status.
///
/// A success always means `healthy`. A failure of a service never seen alive
/// means `unreachable`; otherwise `degraded` until `failure_threshold`
/// consecutive failures, then `unreachable`.
pub fn next_status(
    previous: &HealthStatus,
    probe_ok: bool,
    failure_threshold: u32,
    checked_at: DateTime<Utc>,
) -> HealthStatus {
    if probe_ok {
        return HealthStatus {
            service_name: previous.service_name.clone(),
            state: HealthState::Healthy,
            last_checked_at: Some(checked_at),
            consecutive_failures: 0,
        };
    }

    let consecutive_failures = previous.consecutive_failures.saturating_add(1);
    let state = match previous.state {
        HealthState::Unknown | HealthState::Unreachable => HealthState::Unreachable,
        _ if consecutive_failures >= failure_threshold => HealthState::Unreachable,
        _ => HealthState::Degraded,
    };

    HealthStatus {
        service_name: previous.service_name.clone(),
        state,
        last_checked_at: Some(checked_at),
        consecutive_failures,
    }
}

pub struct HealthTable {
    statuses: ArcSwap<HashMap<String, HealthStatus>>,
    failure_threshold: u32,
}

impl HealthTable {
    pub fn new<I, S>(names: I, failure_threshold: u32) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let statuses = names
            .into_iter()
            .map(|n| {
                let name = n.into();
                (name.clone(), HealthStatus::unknown(name))
            })
            .collect();

        Self {
            statuses: ArcSwap::from_pointee(statuses),
            failure_threshold: failure_threshold.max(1),
        }
    }

    /// Last recorded state of every service
    pub fn snapshot(&self) -> HealthSnapshot {
        self.statuses.load_full()
    }

    /// Non-blocking read of the last recorded status
    pub fn current_status(&self, name: &str) -> HealthStatus {
        self.statuses
            .load()
            .get(name)
            .cloned()
            .unwrap_or_else(|| HealthStatus::unknown(name))
    }

    /// Records one probe result and returns the new status
    pub fn record(&self, name: &str, probe_ok: bool) -> HealthStatus {
        let now = Utc::now();
        let threshold = self.failure_threshold;

        let previous = self.statuses.rcu(|current| {
            let mut next = HashMap::clone(current);
            let prior = current
                .get(name)
                .cloned()
                .unwrap_or_else(|| HealthStatus::unknown(name));
            next.insert(name.to_string(), next_status(&prior, probe_ok, threshold, now));
            next
        });

        let prior = previous
            .get(name)
            .cloned()
            .unwrap_or_else(|| HealthStatus::unknown(name));
        next_status(&prior, probe_ok, threshold, now)
    }

    /// Keeps statuses of `names` that are already known, adds the rest as
    /// `unknown` and drops everything else.
    pub fn sync<S: AsRef<str>>(&self, names: &[S]) {
        self.statuses.rcu(|current| {
            names
                .iter()
                .map(|n| {
                    let name = n.as_ref();
                    let status = current
                        .get(name)
                        .cloned()
                        .unwrap_or_else(|| HealthStatus::unknown(name));
                    (name.to_string(), status)
                })
                .collect::<HashMap<_, _>>()
        });
    }

    /// Overwrites a status; used when state is known out of band
    pub fn set(&self, status: HealthStatus) {
        self.statuses.rcu(|current| {
            let mut next = HashMap::clone(current);
            next.insert(status.service_name.clone(), status.clone());
            next
        });
    }
}

/// Periodic prober and startup readiness gate
pub struct HealthProber {
    registry: Arc<ServiceRegistry>,
    table: Arc<HealthTable>,
    client: Arc<dyn DomainClient>,
    settings: HealthSettings,
}

impl HealthProber {
    pub fn new(
        registry: Arc<ServiceRegistry>,
        table: Arc<HealthTable>,
        client: Arc<dyn DomainClient>,
        settings: HealthSettings,
    ) -> Self {
        Self { registry, table, client, settings }
    }

    pub fn table(&self) -> &Arc<HealthTable> {
        &self.table
    }

    /// Probes one service and records the result. Never fails.
    pub async fn probe(&self, descriptor: &ServiceDescriptor) -> HealthStatus {
        let timeout = Duration::from_millis(self.settings.probe_timeout_ms);
        let probe_ok = match self.client.health(descriptor, timeout).await {
            Ok(()) => true,
            Err(err) => {
                debug!(service = %descriptor.name, error = %err, "Health probe failed");
                false
            }
        };

        increment_counter!(
            "gateway_health_probes_total",
            "service" => descriptor.name.clone(),
            "result" => if probe_ok { "ok" } else { "failed" }
        );

        let previous = self.table.current_status(&descriptor.name).state;
        let status = self.table.record(&descriptor.name, probe_ok);
        if status.state != previous {
            info!(
                service = %descriptor.name,
                from = ?previous,
                to = ?status.state,
                consecutive_failures = status.consecutive_failures,
                "Service health changed"
            );
        }
        status
    }

    /// Probes every registered service concurrently; returns how many are healthy
    pub async fn probe_all(&self) -> usize {
        let services = self.registry.all();
        let statuses = join_all(services.iter().map(|d| self.probe(d))).await;
        statuses
            .iter()
            .filter(|s| s.state == HealthState::Healthy)
            .count()
    }

    /// Runs probe rounds on a fixed interval until the task is aborted
    pub fn spawn(self: Arc<Self>) -> JoinHandle<()> {
        let period = Duration::from_millis(self.settings.probe_interval_ms);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                interval.tick().await;
                let healthy = self.probe_all().await;
                debug!(healthy, total = self.registry.snapshot().len(), "Health probe round finished");
            }
        })
    }

    /// Probe rounds with exponential backoff until at least
    /// `min_ready_services` are healthy. Only fails when `fail_if_unready`.
    pub async fn wait_until_ready(&self) -> Result<usize, GatewayError> {
        let total = self.registry.snapshot().len();
        let required = self.settings.min_ready_services.min(total);
        let attempts = self.settings.readiness_attempts.max(1);

        let initial = Duration::from_millis(self.settings.readiness_initial_backoff_ms);
        let mut backoff = ExponentialBackoff {
            current_interval: initial,
            initial_interval: initial,
            max_interval: Duration::from_millis(self.settings.readiness_max_backoff_ms),
            multiplier: 2.0,
            randomization_factor: 0.1,
            max_elapsed_time: None,
            ..ExponentialBackoff::default()
        };

        let mut healthy = 0;
        for attempt in 1..=attempts {
            healthy = self.probe_all().await;
            if healthy >= required {
                info!(healthy, total, attempt, "Domain services ready");
                return Ok(healthy);
            }

            if attempt < attempts {
                let wait = backoff
                    .next_backoff()
                    .unwrap_or_else(|| Duration::from_millis(self.settings.readiness_max_backoff_ms));
                warn!(
                    healthy,
                    required,
                    attempt,
                    wait_ms = wait.as_millis() as u64,
                    "Waiting for domain services"
                );
                tokio::time::sleep(wait).await;
            }
        }

        let message = format!("{} of {} services healthy, {} required", healthy, total, required);
        if self.settings.fail_if_unready {
            Err(GatewayError::NotReady(message))
        } else {
            warn!("Starting degraded: {}", message);
            Ok(healthy)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain_client::HttpDomainClient;
    use crate::models::Domain;
    use crate::registry::tests::descriptor;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn status(state: HealthState, failures: u32) -> HealthStatus {
        HealthStatus {
            service_name: "genomics".into(),
            state,
            last_checked_at: None,
            consecutive_failures: failures,
        }
    }

    #[test]
    fn test_transitions() {
        let now = Utc::now();

        let s = next_status(&status(HealthState::Unknown, 0), true, 3, now);
        assert_eq!(s.state, HealthState::Healthy);

        let s = next_status(&status(HealthState::Unknown, 0), false, 3, now);
        assert_eq!(s.state, HealthState::Unreachable);
        assert_eq!(s.consecutive_failures, 1);

        let s = next_status(&status(HealthState::Healthy, 0), false, 3, now);
        assert_eq!(s.state, HealthState::Degraded);

        let s = next_status(&status(HealthState::Degraded, 1), false, 3, now);
        assert_eq!(s.state, HealthState::Degraded);
        assert_eq!(s.consecutive_failures, 2);

        let s = next_status(&status(HealthState::Degraded, 2), false, 3, now);
        assert_eq!(s.state, HealthState::Unreachable);

        let s = next_status(&status(HealthState::Unreachable, 7), true, 3, now);
        assert_eq!(s.state, HealthState::Healthy);
        assert_eq!(s.consecutive_failures, 0);
        assert_eq!(s.last_checked_at, Some(now));
    }

    #[test]
    fn test_threshold_of_one() {
        let s = next_status(&status(HealthState::Healthy, 0), false, 1, Utc::now());
        assert_eq!(s.state, HealthState::Unreachable);
    }

    #[test]
    fn test_table_record_and_sync() {
        let table = HealthTable::new(["genomics", "literature"], 3);
        assert_eq!(table.current_status("genomics").state, HealthState::Unknown);

        table.record("genomics", true);
        let before = table.snapshot();
        table.record("genomics", false);

        assert_eq!(state_in(&before, "genomics"), HealthState::Healthy);
        assert_eq!(table.current_status("genomics").state, HealthState::Degraded);

        table.sync(&["genomics", "metabolics"]);
        let snapshot = table.snapshot();
        assert_eq!(state_in(&snapshot, "genomics"), HealthState::Degraded);
        assert_eq!(state_in(&snapshot, "metabolics"), HealthState::Unknown);
        assert!(!snapshot.contains_key("literature"));
    }

    async fn prober_for(servers: &[(&str, &MockServer)], settings: HealthSettings) -> HealthProber {
        let registry = ServiceRegistry::new();
        for (name, server) in servers {
            let mut d = descriptor(name, Domain::Genomics, &["gene"]);
            d.base_url = server.uri();
            registry.register(d).unwrap();
        }
        let registry = Arc::new(registry);
        let table = Arc::new(HealthTable::new(registry.snapshot().names(), settings.failure_threshold));
        HealthProber::new(registry, table, Arc::new(HttpDomainClient::new().unwrap()), settings)
    }

    #[tokio::test]
    async fn test_probe_all_records_state() {
        let up = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/health"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"status": "ok"})))
            .mount(&up)
            .await;
        let down = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&down)
            .await;

        let prober = prober_for(&[("up", &up), ("down", &down)], HealthSettings::default()).await;
        assert_eq!(prober.probe_all().await, 1);

        let table = prober.table();
        assert_eq!(table.current_status("up").state, HealthState::Healthy);
        assert_eq!(table.current_status("down").state, HealthState::Unreachable);
        assert!(table.current_status("down").last_checked_at.is_some());
    }

    #[tokio::test]
    async fn test_readiness_does_not_fail_by_default() {
        let down = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&down)
            .await;

        let settings = HealthSettings {
            readiness_attempts: 2,
            readiness_initial_backoff_ms: 5,
            readiness_max_backoff_ms: 10,
            ..HealthSettings::default()
        };
        let prober = prober_for(&[("down", &down)], settings.clone()).await;
        assert_eq!(prober.wait_until_ready().await.unwrap(), 0);

        let strict = HealthSettings { fail_if_unready: true, ..settings };
        let prober = prober_for(&[("down", &down)], strict).await;
        assert!(matches!(prober.wait_until_ready().await, Err(GatewayError::NotReady(_))));
    }
}
