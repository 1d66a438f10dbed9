//! Merges service outcomes into one answer.
//!
//! Synthesis is deterministic: the same plan and outcomes always give an
//! identical `AggregatedResult`.

use std::sync::Arc;

use crate::models::{
    AggregatedResult, DispatchPlan, DomainPayload, OutcomeStatus, OverallStatus, ServiceOutcome,
};

const MAX_SECTION_CHARS: usize = 200;

/// Combines successful payloads, given in dispatch order, into a summary
pub trait SummaryStrategy: Send + Sync {
    fn summarize(&self, query: &str, successes: &[(&str, &DomainPayload)]) -> Option<String>;
}

/// One `[Domain] headline` line per contributing service
#[derive(Debug, Clone, Copy, Default)]
pub struct SectionedSummary;

impl SummaryStrategy for SectionedSummary {
    fn summarize(&self, _query: &str, successes: &[(&str, &DomainPayload)]) -> Option<String> {
        if successes.is_empty() {
            return None;
        }

        let sections: Vec<String> = successes
            .iter()
            .map(|(_, payload)| {
                let answer = payload.answer();
                let body = match &answer.summary {
                    Some(headline) => headline.clone(),
                    None => truncate(&answer.data.to_string(), MAX_SECTION_CHARS),
                };
                format!("[{}] {}", payload.domain().label(), body)
            })
            .collect();

        Some(sections.join("\n"))
    }
}

fn truncate(text: &str, max_chars: usize) -> String {
    match text.char_indices().nth(max_chars) {
        Some((cut, _)) => format!("{}…", &text[..cut]),
        None => text.to_string(),
    }
}

pub struct Synthesizer {
    strategy: Arc<dyn SummaryStrategy>,
}

impl Default for Synthesizer {
    fn default() -> Self {
        Self::new(Arc::new(SectionedSummary))
    }
}

impl Synthesizer {
    pub fn new(strategy: Arc<dyn SummaryStrategy>) -> Self {
        Self { strategy }
    }

    /// Orders outcomes by plan, appends the skipped services and derives the
    /// overall status. Outcomes for services outside the plan are ignored.
    pub fn synthesize(&self, plan: &DispatchPlan, query: &str, outcomes: &[ServiceOutcome]) -> AggregatedResult {
        let mut ordered: Vec<ServiceOutcome> = plan
            .entries
            .iter()
            .filter_map(|entry| {
                outcomes
                    .iter()
                    .find(|o| o.service_name == entry.descriptor.name)
                    .cloned()
            })
            .collect();
        ordered.extend(plan.skipped.iter().map(|name| ServiceOutcome::skipped(name)));

        let successes: Vec<(&str, &DomainPayload)> = ordered
            .iter()
            .filter(|o| o.is_success())
            .filter_map(|o| o.payload.as_ref().map(|p| (o.service_name.as_str(), p)))
            .collect();

        let contributing_services: Vec<String> = successes.iter().map(|(name, _)| name.to_string()).collect();
        let failed_services: Vec<String> = ordered
            .iter()
            .filter(|o| matches!(o.status, OutcomeStatus::Timeout | OutcomeStatus::Error))
            .map(|o| o.service_name.clone())
            .collect();

        let overall_status = if ordered.is_empty() || successes.is_empty() {
            OverallStatus::Failed
        } else if successes.len() == ordered.len() {
            OverallStatus::Complete
        } else {
            OverallStatus::Partial
        };

        let synthesized_summary = self.strategy.summarize(query, &successes);

        AggregatedResult {
            query_id: plan.query_id.clone(),
            skipped_services: plan.skipped.clone(),
            outcomes: ordered,
            synthesized_summary,
            contributing_services,
            failed_services,
            overall_status,
        }
    }
}
