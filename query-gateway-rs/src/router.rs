//! Query routing: from a message to a dispatch plan.
//!
//! Routing is a pure function of the query, the conversation context and
//! the registry and health snapshots. How capability tags are derived from
//! free text is behind [`TagExtractor`].

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;

use regex::Regex;

use crate::error::GatewayError;
use crate::models::{DispatchPlan, HealthState, HealthStatus, PlanEntry, SubRequest};
use crate::registry::RegistrySnapshot;

lazy_static::lazy_static! {
    // BRCA1, TP53, CYP2D6; digit-free symbols come from configuration
    static ref GENE_SYMBOL: Regex =
        Regex::new(r"^[A-Z][A-Z0-9]{1,5}[0-9][A-Z0-9]{0,3}$").expect("Invalid regex");
    static ref RSID: Regex = Regex::new(r"^rs[0-9]+$").expect("Invalid regex");
}

/// Derives capability tags from a free-text query
pub trait TagExtractor: Send + Sync {
    /// `known_tags` is the union of every registered service's tags
    fn extract(&self, query: &str, known_tags: &BTreeSet<String>) -> BTreeSet<String>;
}

/// Token and keyword matching plus gene symbol and rsID recognition
#[derive(Debug, Clone, Default)]
pub struct KeywordTagExtractor {
    keywords: BTreeMap<String, Vec<String>>,
    gene_symbols: BTreeSet<String>,
}

impl KeywordTagExtractor {
    pub fn new(keywords: BTreeMap<String, Vec<String>>) -> Self {
        let keywords = keywords
            .into_iter()
            .map(|(word, tags)| {
                (
                    word.to_lowercase(),
                    tags.into_iter().map(|t| t.to_lowercase()).collect(),
                )
            })
            .collect();
        Self {
            keywords,
            gene_symbols: BTreeSet::new(),
        }
    }

    /// Symbols such as APOE that carry no digit and would otherwise be
    /// indistinguishable from shouted words
    pub fn with_gene_symbols<I, S>(mut self, symbols: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.gene_symbols = symbols
            .into_iter()
            .map(|s| s.as_ref().to_uppercase())
            .collect();
        self
    }
}

impl TagExtractor for KeywordTagExtractor {
    fn extract(&self, query: &str, known_tags: &BTreeSet<String>) -> BTreeSet<String> {
        let raw_tokens: Vec<&str> = query
            .split(|c: char| !(c.is_alphanumeric() || c == '_' || c == '-'))
            .map(|t| t.trim_matches('-'))
            .filter(|t| !t.is_empty())
            .collect();

        let tokens: Vec<String> = raw_tokens.iter().map(|t| t.to_lowercase()).collect();
        let mut tags = BTreeSet::new();

        let consider = |candidate: &str, tags: &mut BTreeSet<String>| {
            if known_tags.contains(candidate) {
                tags.insert(candidate.to_string());
            }
            if let Some(mapped) = self.keywords.get(candidate) {
                tags.extend(mapped.iter().cloned());
            }
        };

        for token in &tokens {
            consider(token, &mut tags);
            let underscored = token.replace('-', "_");
            if underscored != *token {
                consider(&underscored, &mut tags);
            }
        }

        // "digital twin" → "digital_twin"
        for pair in tokens.windows(2) {
            consider(&format!("{}_{}", pair[0], pair[1]), &mut tags);
        }

        for raw in &raw_tokens {
            if GENE_SYMBOL.is_match(raw) || self.gene_symbols.contains(*raw) {
                tags.insert("gene".to_string());
            }
            if RSID.is_match(&raw.to_lowercase()) {
                tags.insert("variant".to_string());
            }
        }

        tags
    }
}

/// Inputs of one routing decision
#[derive(Debug, Clone)]
pub struct RouteRequest<'a> {
    pub query_id: &'a str,
    pub user_id: &'a str,
    pub conversation_id: &'a str,
    pub message: &'a str,
    pub explicit_tags: &'a [String],
}

/// What the router needs from the conversation
#[derive(Debug, Clone, Default, PartialEq)]
pub struct QueryContext {
    /// Recent prior queries, oldest first
    pub prior_queries: Vec<String>,
    /// Tags of the most recent routed turn
    pub last_tags: Vec<String>,
}

pub struct QueryRouter {
    extractor: Arc<dyn TagExtractor>,
    degraded_timeout_factor: f64,
}

impl QueryRouter {
    pub fn new(extractor: Arc<dyn TagExtractor>, degraded_timeout_factor: f64) -> Self {
        Self { extractor, degraded_timeout_factor }
    }

    /// Capability tags implied by a query
    pub fn implied_tags(
        &self,
        request: &RouteRequest<'_>,
        context: &QueryContext,
        registry: &RegistrySnapshot,
    ) -> BTreeSet<String> {
        let known_tags: BTreeSet<String> = registry
            .all()
            .iter()
            .flat_map(|d| d.capability_tags.iter().cloned())
            .collect();

        let mut implied = self.extractor.extract(request.message, &known_tags);
        implied.extend(request.explicit_tags.iter().map(|t| t.to_lowercase()));

        // follow-up questions inherit the previous turn's topic
        if implied.is_empty() {
            implied.extend(context.last_tags.iter().cloned());
        }

        implied
    }

    /// Selects every service whose tags intersect the implied ones, in
    /// registry order. Unreachable services go to `skipped`; degraded ones
    /// get a reduced timeout.
    pub fn plan(
        &self,
        request: &RouteRequest<'_>,
        context: &QueryContext,
        registry: &RegistrySnapshot,
        health: &HashMap<String, HealthStatus>,
    ) -> Result<DispatchPlan, GatewayError> {
        let implied = self.implied_tags(request, context, registry);

        let mut entries = Vec::new();
        let mut skipped = Vec::new();

        for descriptor in registry.all() {
            let matched: Vec<String> = descriptor
                .capability_tags
                .intersection(&implied)
                .cloned()
                .collect();
            if matched.is_empty() {
                continue;
            }

            let state = crate::health::state_in(health, &descriptor.name);
            match state {
                HealthState::Unreachable => skipped.push(descriptor.name.clone()),
                _ => {
                    let degraded = state == HealthState::Degraded;
                    let timeout = if degraded {
                        self.reduced_timeout(descriptor.declared_timeout)
                    } else {
                        descriptor.declared_timeout
                    };

                    entries.push(PlanEntry {
                        descriptor: descriptor.clone(),
                        sub_request: SubRequest {
                            query_id: request.query_id.to_string(),
                            query: request.message.to_string(),
                            user_id: request.user_id.to_string(),
                            conversation_id: request.conversation_id.to_string(),
                            matched_tags: matched,
                            context: context.prior_queries.clone(),
                        },
                        timeout,
                        degraded,
                    });
                }
            }
        }

        if entries.is_empty() && skipped.is_empty() {
            return Err(GatewayError::NoRoute {
                implied_tags: implied.into_iter().collect(),
            });
        }

        Ok(DispatchPlan {
            query_id: request.query_id.to_string(),
            implied_tags: implied,
            entries,
            skipped,
        })
    }

    fn reduced_timeout(&self, declared: Duration) -> Duration {
        declared
            .mul_f64(self.degraded_timeout_factor)
            .max(Duration::from_millis(1))
    }
}
