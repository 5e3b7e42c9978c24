//! Saga domain events.

use common::AggregateId;
use domain::DomainEvent;
use event_store::Version;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Events recorded by a saga instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum SagaEvent {
    /// A triggering event created the instance.
    SagaStarted(SagaStartedData),

    /// A forward step attempt began.
    StepStarted(StepStartedData),

    /// A forward step completed; its output is kept for later steps.
    StepCompleted(StepCompletedData),

    StepFailed(StepFailedData),

    /// A forward step gave up and compensation begins.
    CompensationStarted(CompensationStartedData),

    CompensationStepCompleted(CompensationStepData),

    CompensationStepFailed(StepFailedData),

    SagaCompleted,

    /// The saga ended without completing.
    SagaFailed(SagaFailedData),
}

impl DomainEvent for SagaEvent {
    fn event_type(&self) -> &'static str {
        match self {
            SagaEvent::SagaStarted(_) => "SagaStarted",
            SagaEvent::StepStarted(_) => "StepStarted",
            SagaEvent::StepCompleted(_) => "StepCompleted",
            SagaEvent::StepFailed(_) => "StepFailed",
            SagaEvent::CompensationStarted(_) => "CompensationStarted",
            SagaEvent::CompensationStepCompleted(_) => "CompensationStepCompleted",
            SagaEvent::CompensationStepFailed(_) => "CompensationStepFailed",
            SagaEvent::SagaCompleted => "SagaCompleted",
            SagaEvent::SagaFailed(_) => "SagaFailed",
        }
    }
}

/// The event that started a saga.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SagaTrigger {
    pub event_type: String,
    pub aggregate_id: AggregateId,
    pub version: Version,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SagaStartedData {
    pub saga_type: String,
    pub correlation_key: String,
    pub trigger: SagaTrigger,
    /// Payload of the triggering event.
    pub data: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepStartedData {
    pub step: String,
    pub index: usize,
    pub attempt: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepCompletedData {
    pub step: String,
    pub index: usize,
    pub output: Value,
}

/// A failed attempt, forward or compensating.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepFailedData {
    pub step: String,
    pub index: usize,
    pub attempt: u32,
    pub error: String,
    pub will_retry: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompensationStartedData {
    pub failed_step: String,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompensationStepData {
    pub step: String,
    pub index: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SagaFailedData {
    pub reason: String,
    /// Set when a compensation could not finish.
    pub requires_intervention: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn serializes_with_type_tag() {
        let event = SagaEvent::StepCompleted(StepCompletedData {
            step: "reserve-stock".into(),
            index: 1,
            output: serde_json::json!({ "reservation_id": "r-1" }),
        });

        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "StepCompleted");
        assert_eq!(json["data"]["output"]["reservation_id"], "r-1");
        assert_eq!(serde_json::from_value::<SagaEvent>(json).unwrap(), event);
    }

    #[test]
    fn unit_variant_round_trips() {
        let json = serde_json::to_value(&SagaEvent::SagaCompleted).unwrap();
        assert_eq!(json["type"], "SagaCompleted");
        assert_eq!(
            serde_json::from_value::<SagaEvent>(json).unwrap(),
            SagaEvent::SagaCompleted
        );
    }
}
