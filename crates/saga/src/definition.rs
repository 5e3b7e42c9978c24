//! Saga definitions: the ordered steps of one saga type and the events that
//! start it.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use common::{AggregateId, IsolationContext};
use domain::{Aggregate, CommandBus};
use event_store::EventEnvelope;
use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::error::StepError;
use crate::events::SagaTrigger;
use crate::instance::SagaInstance;

/// What a step sees while it runs.
pub struct StepContext<'a> {
    saga_id: AggregateId,
    correlation_key: &'a str,
    trigger: Option<&'a SagaTrigger>,
    isolation: &'a IsolationContext,
    data: &'a Value,
    outputs: &'a BTreeMap<String, Value>,
    attempt: u32,
    commands: &'a CommandBus,
}

impl<'a> StepContext<'a> {
    pub(crate) fn new(instance: &'a SagaInstance, attempt: u32, commands: &'a CommandBus) -> Self {
        Self {
            saga_id: instance.id(),
            correlation_key: instance.correlation_key(),
            trigger: instance.trigger(),
            isolation: instance.isolation(),
            data: instance.data(),
            outputs: instance.outputs(),
            attempt,
            commands,
        }
    }

    pub fn saga_id(&self) -> AggregateId {
        self.saga_id
    }

    pub fn correlation_key(&self) -> &str {
        self.correlation_key
    }

    /// The event that started the saga.
    pub fn trigger(&self) -> Option<&SagaTrigger> {
        self.trigger
    }

    /// Scope of the triggering event. Commands issued by the step run in it.
    pub fn isolation(&self) -> &IsolationContext {
        self.isolation
    }

    /// 1-based attempt number of the current run.
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn commands(&self) -> &CommandBus {
        self.commands
    }

    /// Decodes the triggering event's payload.
    pub fn trigger_data<T: DeserializeOwned>(&self) -> Result<T, StepError> {
        Ok(T::deserialize(self.data)?)
    }

    /// Decodes the output of an earlier completed step.
    pub fn output<T: DeserializeOwned>(&self, step: &str) -> Result<T, StepError> {
        let value = self
            .outputs
            .get(step)
            .ok_or_else(|| StepError::Rejected(format!("no output recorded for step '{step}'")))?;
        Ok(T::deserialize(value)?)
    }
}

/// One forward step with its compensation.
///
/// A step may run more than once: after a retriable failure, or when a saga
/// is resumed after a restart. Both actions must be idempotent.
#[async_trait]
pub trait SagaStep: Send + Sync {
    fn name(&self) -> &'static str;

    /// Runs the step. The returned value is stored as the step's output.
    async fn execute(&self, ctx: &StepContext<'_>) -> Result<Value, StepError>;

    /// Undoes a completed step.
    async fn compensate(&self, _ctx: &StepContext<'_>) -> Result<(), StepError> {
        Ok(())
    }
}

type Correlator = Arc<dyn Fn(&EventEnvelope) -> Option<String> + Send + Sync>;

/// A saga type: its trigger events, correlation rule, and ordered steps.
#[derive(Clone)]
pub struct SagaDefinition {
    name: &'static str,
    triggers: Vec<String>,
    correlate: Correlator,
    steps: Vec<Arc<dyn SagaStep>>,
}

impl SagaDefinition {
    /// A definition that correlates by the triggering event's aggregate id.
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            triggers: Vec::new(),
            correlate: Arc::new(|event| Some(event.aggregate_id.to_string())),
            steps: Vec::new(),
        }
    }

    pub fn started_by(mut self, event_type: impl Into<String>) -> Self {
        self.triggers.push(event_type.into());
        self
    }

    /// Overrides how the correlation key is read from a triggering event.
    /// Events that yield `None` are ignored.
    pub fn correlate_by<F>(mut self, correlate: F) -> Self
    where
        F: Fn(&EventEnvelope) -> Option<String> + Send + Sync + 'static,
    {
        self.correlate = Arc::new(correlate);
        self
    }

    pub fn step(mut self, step: Arc<dyn SagaStep>) -> Self {
        self.steps.push(step);
        self
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn triggers(&self) -> &[String] {
        &self.triggers
    }

    pub fn steps(&self) -> &[Arc<dyn SagaStep>] {
        &self.steps
    }

    pub fn is_started_by(&self, event_type: &str) -> bool {
        self.triggers.iter().any(|trigger| trigger == event_type)
    }

    pub fn correlation_key(&self, event: &EventEnvelope) -> Option<String> {
        (self.correlate)(event)
    }

    /// The instance id for a correlation key. Stable across restarts.
    pub fn saga_id(&self, correlation_key: &str) -> AggregateId {
        AggregateId::derive(self.name, correlation_key)
    }
}

impl fmt::Debug for SagaDefinition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SagaDefinition")
            .field("name", &self.name)
            .field("triggers", &self.triggers)
            .field(
                "steps",
                &self.steps.iter().map(|step| step.name()).collect::<Vec<_>>(),
            )
            .finish()
    }
}
