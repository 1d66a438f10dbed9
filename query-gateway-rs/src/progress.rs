//! Per-query progress event publisher.
//!
//! `queued → dispatching → service_completed* → synthesizing → done`, or
//! `error` from any non-terminal phase. Every accepted transition emits one
//! event; sequence numbers start at 1 and have no gaps. A closed sink only
//! stops delivery, the query itself carries on.

use tokio::sync::mpsc::UnboundedSender;
use tracing::{debug, warn};

use crate::models::{ChatResponse, ProgressEvent, ProgressPhase, ServiceOutcome};

pub struct ProgressPublisher {
    query_id: String,
    sequence: u64,
    phase: Option<ProgressPhase>,
    sink: Option<UnboundedSender<ProgressEvent>>,
    closed: bool,
}

impl ProgressPublisher {
    /// `sink` is `None` for non-streaming queries
    pub fn new<S: Into<String>>(query_id: S, sink: Option<UnboundedSender<ProgressEvent>>) -> Self {
        Self {
            query_id: query_id.into(),
            sequence: 0,
            phase: None,
            sink,
            closed: false,
        }
    }

    pub fn queued(&mut self) -> bool {
        self.emit(ProgressPhase::Queued, "Query received".to_string(), None, None)
    }

    pub fn dispatching(&mut self, services: usize) -> bool {
        let message = format!("Dispatching to {} service{}", services, if services == 1 { "" } else { "s" });
        self.emit(ProgressPhase::Dispatching, message, None, None)
    }

    pub fn service_completed(&mut self, outcome: &ServiceOutcome) -> bool {
        let message = format!("{} finished: {}", outcome.service_name, outcome.status.as_str());
        self.emit(
            ProgressPhase::ServiceCompleted,
            message,
            Some(outcome.service_name.clone()),
            None,
        )
    }

    pub fn synthesizing(&mut self) -> bool {
        self.emit(ProgressPhase::Synthesizing, "Combining answers".to_string(), None, None)
    }

    pub fn done(&mut self, response: ChatResponse) -> bool {
        let message = format!("Query {}", response.result.overall_status.as_str());
        self.emit(ProgressPhase::Done, message, None, Some(Box::new(response)))
    }

    pub fn error<S: Into<String>>(&mut self, message: S) -> bool {
        self.emit(ProgressPhase::Error, message.into(), None, None)
    }

    pub fn phase(&self) -> Option<ProgressPhase> {
        self.phase
    }

    pub fn is_terminal(&self) -> bool {
        self.phase.map_or(false, |p| p.is_terminal())
    }

    /// The receiving side has gone away
    pub fn is_closed(&self) -> bool {
        self.closed
    }

    pub fn last_sequence(&self) -> u64 {
        self.sequence
    }

    fn can_enter(&self, next: ProgressPhase) -> bool {
        use ProgressPhase::*;
        match (self.phase, next) {
            (None, Queued) => true,
            (Some(current), Error) => !current.is_terminal(),
            (Some(Queued), Dispatching) => true,
            (Some(Dispatching | ServiceCompleted), ServiceCompleted | Synthesizing) => true,
            (Some(Synthesizing), Done) => true,
            _ => false,
        }
    }

    /// Returns whether the transition was accepted
    fn emit(
        &mut self,
        next: ProgressPhase,
        message: String,
        service: Option<String>,
        result: Option<Box<ChatResponse>>,
    ) -> bool {
        if !self.can_enter(next) {
            warn!(
                query_id = %self.query_id,
                from = ?self.phase,
                to = ?next,
                "Rejected progress transition"
            );
            return false;
        }

        self.phase = Some(next);
        self.sequence += 1;

        if self.closed {
            return true;
        }

        if let Some(sink) = &self.sink {
            let event = ProgressEvent {
                query_id: self.query_id.clone(),
                sequence_number: self.sequence,
                status: next,
                message,
                service,
                result,
            };
            if sink.send(event).is_err() {
                debug!(query_id = %self.query_id, "Progress receiver dropped, no further events");
                self.closed = true;
            }
        }

        true
    }
}
