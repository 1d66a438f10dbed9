//! One query from request to answer: route, dispatch, synthesize, record.

use std::sync::Arc;

use chrono::Utc;
use metrics::increment_counter;
use tokio::sync::mpsc::UnboundedSender;
use tracing::{info, warn};
use uuid::Uuid;

use crate::dispatcher::Dispatcher;
use crate::error::GatewayError;
use crate::health::HealthTable;
use crate::models::{ChatRequest, ChatResponse, ConversationTurn, ProgressEvent};
use crate::progress::ProgressPublisher;
use crate::registry::ServiceRegistry;
use crate::router::{QueryRouter, RouteRequest};
use crate::session::ConversationStore;
use crate::synthesizer::Synthesizer;
use crate::validation::validate_user_id;

/// A validated query whose caller owns the conversation
#[derive(Debug, Clone)]
pub struct PreparedQuery {
    pub query_id: String,
    pub user_id: String,
    pub conversation_id: String,
    pub message: String,
    pub tags: Vec<String>,
}

pub struct QueryPipeline {
    registry: Arc<ServiceRegistry>,
    health: Arc<HealthTable>,
    router: QueryRouter,
    dispatcher: Dispatcher,
    synthesizer: Synthesizer,
    conversations: ConversationStore,
}

impl QueryPipeline {
    pub fn new(
        registry: Arc<ServiceRegistry>,
        health: Arc<HealthTable>,
        router: QueryRouter,
        dispatcher: Dispatcher,
        synthesizer: Synthesizer,
        conversations: ConversationStore,
    ) -> Self {
        Self { registry, health, router, dispatcher, synthesizer, conversations }
    }

    pub fn conversations(&self) -> &ConversationStore {
        &self.conversations
    }

    /// Assigns ids and checks conversation ownership before any work starts
    pub async fn prepare(&self, user_id: &str, request: ChatRequest) -> Result<PreparedQuery, GatewayError> {
        validate_user_id(user_id)?;

        let conversation_id = ConversationStore::resolve_id(request.conversation_id.as_deref());
        self.conversations.open(&conversation_id, user_id).await?;

        Ok(PreparedQuery {
            query_id: Uuid::new_v4().to_string(),
            user_id: user_id.to_string(),
            conversation_id,
            message: request.message,
            tags: request.tags,
        })
    }

    /// Runs a prepared query, publishing progress to `sink` when given.
    ///
    /// Per-service failures never fail the query; only routing and
    /// conversation errors do.
    pub async fn execute(
        &self,
        query: PreparedQuery,
        sink: Option<UnboundedSender<ProgressEvent>>,
    ) -> Result<ChatResponse, GatewayError> {
        let mut progress = ProgressPublisher::new(query.query_id.clone(), sink);
        progress.queued();

        let result = self.run(&query, &mut progress).await;
        match &result {
            Ok(response) => {
                increment_counter!(
                    "gateway_queries_total",
                    "status" => response.result.overall_status.as_str()
                );
            }
            Err(err) => {
                warn!(query_id = %query.query_id, error = %err, "Query rejected");
                increment_counter!("gateway_queries_total", "status" => err.kind());
                progress.error(err.to_string());
            }
        }
        result
    }

    async fn run(&self, query: &PreparedQuery, progress: &mut ProgressPublisher) -> Result<ChatResponse, GatewayError> {
        let mut conversation = self
            .conversations
            .acquire(&query.conversation_id, &query.user_id)
            .await?;
        let context = self.conversations.context(&conversation);

        let registry = self.registry.snapshot();
        let health = self.health.snapshot();
        let plan = self.router.plan(
            &RouteRequest {
                query_id: &query.query_id,
                user_id: &query.user_id,
                conversation_id: &query.conversation_id,
                message: &query.message,
                explicit_tags: &query.tags,
            },
            &context,
            &registry,
            &health,
        )?;

        info!(
            query_id = %query.query_id,
            conversation_id = %query.conversation_id,
            tags = ?plan.implied_tags,
            services = ?plan.service_names().collect::<Vec<_>>(),
            skipped = ?plan.skipped,
            "Dispatch plan ready"
        );

        progress.dispatching(plan.entries.len());
        let outcomes = self
            .dispatcher
            .execute_with(&plan, |outcome| {
                progress.service_completed(outcome);
            })
            .await;

        progress.synthesizing();
        let result = self.synthesizer.synthesize(&plan, &query.message, &outcomes);

        self.conversations.append(
            &mut conversation,
            ConversationTurn {
                query_id: query.query_id.clone(),
                query: query.message.clone(),
                summary: result.synthesized_summary.clone(),
                overall_status: result.overall_status,
                matched_tags: plan.implied_tags.iter().cloned().collect(),
                timestamp: Utc::now(),
            },
        );
        drop(conversation);

        info!(
            query_id = %query.query_id,
            status = result.overall_status.as_str(),
            contributing = result.contributing_services.len(),
            failed = result.failed_services.len(),
            skipped = result.skipped_services.len(),
            "Query finished"
        );

        let response = ChatResponse {
            result,
            conversation_id: query.conversation_id.clone(),
            user_id: query.user_id.clone(),
            timestamp: Utc::now(),
        };
        progress.done(response.clone());
        Ok(response)
    }
}
