//! Data model shared by the routing, dispatch and synthesis stages.

use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use config_rs::{QueryMethod, ServiceEntry};
use serde::{Deserialize, Serialize, Serializer};
use serde_json::Value;

use crate::error::GatewayError;

/// The closed set of knowledge areas a domain service can answer for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Domain {
    Genomics,
    Anatomics,
    Literature,
    Metabolics,
    Populomics,
    DigitalTwin,
    Users,
}

impl Domain {
    /// Section heading used in synthesized summaries
    pub fn label(&self) -> &'static str {
        match self {
            Domain::Genomics => "Genomics",
            Domain::Anatomics => "Anatomics",
            Domain::Literature => "Literature",
            Domain::Metabolics => "Metabolics",
            Domain::Populomics => "Populomics",
            Domain::DigitalTwin => "Digital twin",
            Domain::Users => "User profile",
        }
    }
}

impl fmt::Display for Domain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

impl FromStr for Domain {
    type Err = GatewayError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized: String = s
            .trim()
            .to_ascii_lowercase()
            .chars()
            .filter(|c| c.is_ascii_alphanumeric())
            .collect();

        match normalized.as_str() {
            "genomics" => Ok(Domain::Genomics),
            "anatomics" => Ok(Domain::Anatomics),
            "literature" => Ok(Domain::Literature),
            "metabolics" => Ok(Domain::Metabolics),
            "populomics" => Ok(Domain::Populomics),
            "digitaltwin" | "twin" => Ok(Domain::DigitalTwin),
            "users" | "user" => Ok(Domain::Users),
            _ => Err(GatewayError::InvalidService(format!("unknown domain `{}`", s))),
        }
    }
}

fn serialize_millis<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_u64(duration.as_millis() as u64)
}

/// A registered domain service. Immutable once registered.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ServiceDescriptor {
    pub name: String,
    pub domain: Domain,
    pub base_url: String,
    pub capability_tags: BTreeSet<String>,
    pub health_path: String,
    pub query_path: String,
    pub query_method: QueryMethod,
    #[serde(rename = "declared_timeout_ms", serialize_with = "serialize_millis")]
    pub declared_timeout: Duration,
}

impl ServiceDescriptor {
    /// Builds a descriptor from a `[[service]]` table
    pub fn from_entry(entry: &ServiceEntry, default_timeout: Duration) -> Result<Self, GatewayError> {
        let domain = entry.domain.parse::<Domain>()?;
        let capability_tags: BTreeSet<String> = entry
            .capability_tags
            .iter()
            .map(|t| t.trim().to_lowercase())
            .filter(|t| !t.is_empty())
            .collect();

        if capability_tags.is_empty() {
            return Err(GatewayError::InvalidService(format!(
                "service `{}` declares no capability tags",
                entry.name
            )));
        }

        Ok(Self {
            name: entry.name.clone(),
            domain,
            base_url: entry.base_url.trim_end_matches('/').to_string(),
            capability_tags,
            health_path: entry.health_path.clone(),
            query_path: entry.query_path.clone(),
            query_method: entry.query_method,
            declared_timeout: entry
                .timeout_ms
                .map(Duration::from_millis)
                .unwrap_or(default_timeout),
        })
    }

    pub fn health_url(&self) -> String {
        format!("{}/{}", self.base_url, self.health_path.trim_start_matches('/'))
    }
}

/// Liveness of a service as last observed by the prober
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthState {
    #[default]
    Unknown,
    Healthy,
    Degraded,
    Unreachable,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthStatus {
    pub service_name: String,
    pub state: HealthState,
    pub last_checked_at: Option<DateTime<Utc>>,
    pub consecutive_failures: u32,
}

impl HealthStatus {
    pub fn unknown<S: Into<String>>(service_name: S) -> Self {
        Self {
            service_name: service_name.into(),
            state: HealthState::Unknown,
            last_checked_at: None,
            consecutive_failures: 0,
        }
    }
}

/// Body of `POST /chat/{user_id}` and `POST /chat/{user_id}/stream`
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ChatRequest {
    pub message: String,
    #[serde(default)]
    pub conversation_id: Option<String>,
    /// Capability tags supplied by structured callers, unioned with the
    /// ones extracted from `message`
    #[serde(default)]
    pub tags: Vec<String>,
}

/// What each domain service receives
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubRequest {
    pub query_id: String,
    pub query: String,
    pub user_id: String,
    pub conversation_id: String,
    pub matched_tags: Vec<String>,
    /// Prior queries of the conversation, oldest first
    pub context: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct PlanEntry {
    pub descriptor: Arc<ServiceDescriptor>,
    pub sub_request: SubRequest,
    /// Declared timeout, reduced when the service is degraded
    pub timeout: Duration,
    pub degraded: bool,
}

/// Services selected for one query, in registry order
#[derive(Debug, Clone)]
pub struct DispatchPlan {
    pub query_id: String,
    pub implied_tags: BTreeSet<String>,
    pub entries: Vec<PlanEntry>,
    /// Matched but unreachable at plan time
    pub skipped: Vec<String>,
}

impl DispatchPlan {
    pub fn max_timeout(&self) -> Duration {
        self.entries
            .iter()
            .map(|e| e.timeout)
            .max()
            .unwrap_or(Duration::ZERO)
    }

    pub fn service_names(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|e| e.descriptor.name.as_str())
    }
}

/// The part of a domain answer every domain shares
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DomainAnswer {
    /// The service's own `status` field, if it sent one
    pub status: Option<String>,
    /// One-line headline lifted from the answer
    pub summary: Option<String>,
    pub data: Value,
}

/// A domain answer tagged with the domain that produced it
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "domain", rename_all = "snake_case")]
pub enum DomainPayload {
    Genomics(DomainAnswer),
    Anatomics(DomainAnswer),
    Literature(DomainAnswer),
    Metabolics(DomainAnswer),
    Populomics(DomainAnswer),
    DigitalTwin(DomainAnswer),
    Users(DomainAnswer),
}

const COMMON_HEADLINE_KEYS: &[&str] = &["summary", "response", "description", "message"];

impl DomainPayload {
    /// Wraps a raw JSON answer from a service of `domain`
    pub fn from_response(domain: Domain, body: Value) -> Self {
        let status = body
            .get("status")
            .and_then(Value::as_str)
            .map(str::to_string);

        let summary = Self::headline_keys(domain)
            .iter()
            .chain(COMMON_HEADLINE_KEYS)
            .find_map(|key| body.get(*key).and_then(Value::as_str))
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string);

        let answer = DomainAnswer { status, summary, data: body };

        match domain {
            Domain::Genomics => DomainPayload::Genomics(answer),
            Domain::Anatomics => DomainPayload::Anatomics(answer),
            Domain::Literature => DomainPayload::Literature(answer),
            Domain::Metabolics => DomainPayload::Metabolics(answer),
            Domain::Populomics => DomainPayload::Populomics(answer),
            Domain::DigitalTwin => DomainPayload::DigitalTwin(answer),
            Domain::Users => DomainPayload::Users(answer),
        }
    }

    /// Domain-specific fields checked before the common ones
    fn headline_keys(domain: Domain) -> &'static [&'static str] {
        match domain {
            Domain::Genomics => &["interpretation", "clinical_significance"],
            Domain::Anatomics => &["anatomical_summary"],
            Domain::Literature => &["synthesis", "knowledge_summary"],
            Domain::Metabolics => &["metabolic_summary"],
            Domain::Populomics => &["risk_summary"],
            Domain::DigitalTwin => &["model_summary"],
            Domain::Users => &[],
        }
    }

    pub fn domain(&self) -> Domain {
        match self {
            DomainPayload::Genomics(_) => Domain::Genomics,
            DomainPayload::Anatomics(_) => Domain::Anatomics,
            DomainPayload::Literature(_) => Domain::Literature,
            DomainPayload::Metabolics(_) => Domain::Metabolics,
            DomainPayload::Populomics(_) => Domain::Populomics,
            DomainPayload::DigitalTwin(_) => Domain::DigitalTwin,
            DomainPayload::Users(_) => Domain::Users,
        }
    }

    pub fn answer(&self) -> &DomainAnswer {
        match self {
            DomainPayload::Genomics(a)
            | DomainPayload::Anatomics(a)
            | DomainPayload::Literature(a)
            | DomainPayload::Metabolics(a)
            | DomainPayload::Populomics(a)
            | DomainPayload::DigitalTwin(a)
            | DomainPayload::Users(a) => a,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutcomeStatus {
    Success,
    Timeout,
    Error,
    SkippedUnhealthy,
}

impl OutcomeStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OutcomeStatus::Success => "success",
            OutcomeStatus::Timeout => "timeout",
            OutcomeStatus::Error => "error",
            OutcomeStatus::SkippedUnhealthy => "skipped_unhealthy",
        }
    }
}

/// Terminal result of one planned service call
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceOutcome {
    pub service_name: String,
    pub status: OutcomeStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payload: Option<DomainPayload>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub elapsed_ms: u64,
    /// Number of calls made; 0 for skipped services
    pub attempts: u32,
}

impl ServiceOutcome {
    pub fn success(service_name: &str, payload: DomainPayload, elapsed: Duration, attempts: u32) -> Self {
        Self {
            service_name: service_name.to_string(),
            status: OutcomeStatus::Success,
            payload: Some(payload),
            error: None,
            elapsed_ms: elapsed.as_millis() as u64,
            attempts,
        }
    }

    pub fn failure<S: Into<String>>(
        service_name: &str,
        status: OutcomeStatus,
        error: S,
        elapsed: Duration,
        attempts: u32,
    ) -> Self {
        Self {
            service_name: service_name.to_string(),
            status,
            payload: None,
            error: Some(error.into()),
            elapsed_ms: elapsed.as_millis() as u64,
            attempts,
        }
    }

    pub fn skipped(service_name: &str) -> Self {
        Self::failure(
            service_name,
            OutcomeStatus::SkippedUnhealthy,
            "service unreachable at plan time",
            Duration::ZERO,
            0,
        )
    }

    pub fn is_success(&self) -> bool {
        self.status == OutcomeStatus::Success
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverallStatus {
    Complete,
    Partial,
    Failed,
}

impl OverallStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OverallStatus::Complete => "complete",
            OverallStatus::Partial => "partial",
            OverallStatus::Failed => "failed",
        }
    }
}

/// The merged answer to one query
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregatedResult {
    pub query_id: String,
    /// Dispatched services in plan order, then skipped ones
    pub outcomes: Vec<ServiceOutcome>,
    pub synthesized_summary: Option<String>,
    pub contributing_services: Vec<String>,
    pub failed_services: Vec<String>,
    pub skipped_services: Vec<String>,
    pub overall_status: OverallStatus,
}

/// `AggregatedResult` plus the conversation it belongs to
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatResponse {
    #[serde(flatten)]
    pub result: AggregatedResult,
    pub conversation_id: String,
    pub user_id: String,
    pub timestamp: DateTime<Utc>,
}

/// Phase of the streaming state machine, sent as the event's `status`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProgressPhase {
    Queued,
    Dispatching,
    ServiceCompleted,
    Synthesizing,
    Done,
    Error,
}

impl ProgressPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProgressPhase::Queued => "queued",
            ProgressPhase::Dispatching => "dispatching",
            ProgressPhase::ServiceCompleted => "service_completed",
            ProgressPhase::Synthesizing => "synthesizing",
            ProgressPhase::Done => "done",
            ProgressPhase::Error => "error",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, ProgressPhase::Done | ProgressPhase::Error)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressEvent {
    pub query_id: String,
    pub sequence_number: u64,
    pub status: ProgressPhase,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub service: Option<String>,
    /// Only set on `done`
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Box<ChatResponse>>,
}

/// One completed query in a conversation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversationTurn {
    pub query_id: String,
    pub query: String,
    pub summary: Option<String>,
    pub overall_status: OverallStatus,
    pub matched_tags: Vec<String>,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct HistoryResponse {
    pub conversation_id: String,
    pub user_id: String,
    pub turns: Vec<ConversationTurn>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct NewConversationResponse {
    pub conversation_id: String,
    pub user_id: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    pub healthy: bool,
    pub service_name: String,
    pub uptime_seconds: u64,
    pub status: String,
    pub healthy_services: usize,
    pub total_services: usize,
    pub services: Vec<HealthStatus>,
}

/// Entry of `GET /services`
#[derive(Debug, Serialize)]
pub struct ServiceCatalogEntry {
    #[serde(flatten)]
    pub descriptor: ServiceDescriptor,
    pub health: HealthStatus,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct RegistryReloadResponse {
    pub services: Vec<String>,
    pub added: Vec<String>,
    pub removed: Vec<String>,
}
