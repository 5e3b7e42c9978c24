//! Saga instance aggregate.

use std::collections::BTreeMap;

use common::{AggregateId, IsolationContext};
use domain::{Aggregate, AggregateMeta};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{Result, SagaError};
use crate::events::{
    CompensationStartedData, CompensationStepData, SagaEvent, SagaFailedData, SagaStartedData,
    SagaTrigger, StepCompletedData, StepFailedData, StepStartedData,
};
use crate::state::SagaState;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StepPhase {
    Forward,
    Compensation,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum StepOutcome {
    Started,
    Succeeded,
    Failed { error: String },
}

/// One entry of a saga's step history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepRecord {
    pub step: String,
    pub index: usize,
    pub phase: StepPhase,
    pub attempt: u32,
    pub outcome: StepOutcome,
}

/// An event-sourced saga instance.
///
/// The instance id is derived from the saga type and correlation key, so a
/// triggering event delivered twice lands on the same instance.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SagaInstance {
    meta: AggregateMeta<SagaEvent>,
    saga_type: String,
    correlation_key: String,
    state: SagaState,
    trigger: Option<SagaTrigger>,
    data: Value,
    step_history: Vec<StepRecord>,
    outputs: BTreeMap<String, Value>,
    /// Forward step indices in completion order.
    completed: Vec<usize>,
    compensated: Vec<usize>,
    next_step: usize,
    failure_reason: Option<String>,
    requires_intervention: bool,
}

impl Aggregate for SagaInstance {
    type Event = SagaEvent;

    fn aggregate_type() -> &'static str {
        "Saga"
    }

    fn meta(&self) -> &AggregateMeta<SagaEvent> {
        &self.meta
    }

    fn meta_mut(&mut self) -> &mut AggregateMeta<SagaEvent> {
        &mut self.meta
    }

    fn apply(&mut self, event: &SagaEvent) {
        match event {
            SagaEvent::SagaStarted(data) => {
                self.saga_type = data.saga_type.clone();
                self.correlation_key = data.correlation_key.clone();
                self.trigger = Some(data.trigger.clone());
                self.data = data.data.clone();
                self.state = SagaState::Running;
            }
            SagaEvent::StepStarted(data) => self.step_history.push(StepRecord {
                step: data.step.clone(),
                index: data.index,
                phase: StepPhase::Forward,
                attempt: data.attempt,
                outcome: StepOutcome::Started,
            }),
            SagaEvent::StepCompleted(data) => {
                let attempt = self.attempts(StepPhase::Forward, data.index);
                self.step_history.push(StepRecord {
                    step: data.step.clone(),
                    index: data.index,
                    phase: StepPhase::Forward,
                    attempt,
                    outcome: StepOutcome::Succeeded,
                });
                self.outputs.insert(data.step.clone(), data.output.clone());
                self.completed.push(data.index);
                self.next_step = data.index + 1;
            }
            SagaEvent::StepFailed(data) => {
                self.push_failure(StepPhase::Forward, data);
            }
            SagaEvent::CompensationStarted(data) => {
                self.state = SagaState::Compensating;
                self.failure_reason = Some(format!("{}: {}", data.failed_step, data.reason));
            }
            SagaEvent::CompensationStepCompleted(data) => {
                let attempt = self.attempts(StepPhase::Compensation, data.index) + 1;
                self.step_history.push(StepRecord {
                    step: data.step.clone(),
                    index: data.index,
                    phase: StepPhase::Compensation,
                    attempt,
                    outcome: StepOutcome::Succeeded,
                });
                self.compensated.push(data.index);
            }
            SagaEvent::CompensationStepFailed(data) => {
                self.push_failure(StepPhase::Compensation, data);
            }
            SagaEvent::SagaCompleted => self.state = SagaState::Completed,
            SagaEvent::SagaFailed(data) => {
                self.state = SagaState::Failed;
                self.requires_intervention = data.requires_intervention;
                if data.requires_intervention || self.failure_reason.is_none() {
                    self.failure_reason = Some(data.reason.clone());
                }
            }
        }
    }
}

// Query methods
impl SagaInstance {
    pub fn saga_type(&self) -> &str {
        &self.saga_type
    }

    pub fn correlation_key(&self) -> &str {
        &self.correlation_key
    }

    pub fn state(&self) -> SagaState {
        self.state
    }

    pub fn trigger(&self) -> Option<&SagaTrigger> {
        self.trigger.as_ref()
    }

    /// Payload of the triggering event.
    pub fn data(&self) -> &Value {
        &self.data
    }

    pub fn step_history(&self) -> &[StepRecord] {
        &self.step_history
    }

    pub fn outputs(&self) -> &BTreeMap<String, Value> {
        &self.outputs
    }

    pub fn output(&self, step: &str) -> Option<&Value> {
        self.outputs.get(step)
    }

    /// Index of the next forward step to run.
    pub fn next_step(&self) -> usize {
        self.next_step
    }

    pub fn completed_steps(&self) -> &[usize] {
        &self.completed
    }

    pub fn compensated_steps(&self) -> &[usize] {
        &self.compensated
    }

    /// The most recently completed forward step that is not compensated yet.
    pub fn next_compensation(&self) -> Option<usize> {
        self.completed
            .iter()
            .rev()
            .copied()
            .find(|index| !self.compensated.contains(index))
    }

    pub fn failure_reason(&self) -> Option<&str> {
        self.failure_reason.as_deref()
    }

    pub fn requires_intervention(&self) -> bool {
        self.requires_intervention
    }

    /// Attempts recorded so far for one step in one phase.
    pub fn attempts(&self, phase: StepPhase, index: usize) -> u32 {
        self.step_history
            .iter()
            .filter(|record| record.phase == phase && record.index == index)
            .map(|record| record.attempt)
            .max()
            .unwrap_or(0)
    }
}

// Command methods
impl SagaInstance {
    /// Creates a running instance. It is at version 0 with one pending
    /// `SagaStarted` event.
    pub fn start(
        id: AggregateId,
        isolation: IsolationContext,
        saga_type: impl Into<String>,
        correlation_key: impl Into<String>,
        trigger: SagaTrigger,
        data: Value,
    ) -> Self {
        let mut instance = Self::blank(id, isolation);
        instance.record(SagaEvent::SagaStarted(SagaStartedData {
            saga_type: saga_type.into(),
            correlation_key: correlation_key.into(),
            trigger,
            data,
        }));
        instance
    }

    pub fn begin_step(&mut self, index: usize, step: &str, attempt: u32) -> Result<()> {
        self.ensure_state(SagaState::Running)?;
        self.ensure_next(index)?;
        self.record(SagaEvent::StepStarted(StepStartedData {
            step: step.to_string(),
            index,
            attempt,
        }));
        Ok(())
    }

    pub fn complete_step(&mut self, index: usize, step: &str, output: Value) -> Result<()> {
        self.ensure_state(SagaState::Running)?;
        self.ensure_next(index)?;
        self.record(SagaEvent::StepCompleted(StepCompletedData {
            step: step.to_string(),
            index,
            output,
        }));
        Ok(())
    }

    pub fn fail_step(
        &mut self,
        index: usize,
        step: &str,
        attempt: u32,
        error: impl Into<String>,
        will_retry: bool,
    ) -> Result<()> {
        self.ensure_state(SagaState::Running)?;
        self.ensure_next(index)?;
        self.record(SagaEvent::StepFailed(StepFailedData {
            step: step.to_string(),
            index,
            attempt,
            error: error.into(),
            will_retry,
        }));
        Ok(())
    }

    pub fn begin_compensation(&mut self, failed_step: &str, reason: impl Into<String>) -> Result<()> {
        self.transition(SagaState::Compensating)?;
        self.record(SagaEvent::CompensationStarted(CompensationStartedData {
            failed_step: failed_step.to_string(),
            reason: reason.into(),
        }));
        Ok(())
    }

    /// Records a compensation. Only the next one in reverse completion order
    /// is accepted.
    pub fn complete_compensation(&mut self, index: usize, step: &str) -> Result<()> {
        self.ensure_state(SagaState::Compensating)?;
        self.ensure_compensation(index)?;
        self.record(SagaEvent::CompensationStepCompleted(CompensationStepData {
            step: step.to_string(),
            index,
        }));
        Ok(())
    }

    pub fn fail_compensation(
        &mut self,
        index: usize,
        step: &str,
        attempt: u32,
        error: impl Into<String>,
        will_retry: bool,
    ) -> Result<()> {
        self.ensure_state(SagaState::Compensating)?;
        self.ensure_compensation(index)?;
        self.record(SagaEvent::CompensationStepFailed(StepFailedData {
            step: step.to_string(),
            index,
            attempt,
            error: error.into(),
            will_retry,
        }));
        Ok(())
    }

    pub fn complete(&mut self) -> Result<()> {
        self.transition(SagaState::Completed)?;
        self.record(SagaEvent::SagaCompleted);
        Ok(())
    }

    pub fn fail(&mut self, reason: impl Into<String>, requires_intervention: bool) -> Result<()> {
        self.transition(SagaState::Failed)?;
        self.record(SagaEvent::SagaFailed(SagaFailedData {
            reason: reason.into(),
            requires_intervention,
        }));
        Ok(())
    }

    fn transition(&self, next: SagaState) -> Result<()> {
        if self.state.can_transition_to(next) {
            Ok(())
        } else {
            Err(SagaError::InvalidTransition {
                from: self.state,
                to: next,
            })
        }
    }

    fn ensure_state(&self, expected: SagaState) -> Result<()> {
        if self.state == expected {
            Ok(())
        } else {
            Err(SagaError::InvalidTransition {
                from: self.state,
                to: expected,
            })
        }
    }

    fn ensure_next(&self, index: usize) -> Result<()> {
        if index == self.next_step {
            Ok(())
        } else {
            Err(SagaError::OutOfOrderStep {
                expected: self.next_step,
                found: index,
            })
        }
    }

    fn ensure_compensation(&self, index: usize) -> Result<()> {
        match self.next_compensation() {
            Some(expected) if expected == index => Ok(()),
            expected => Err(SagaError::OutOfOrderCompensation {
                expected,
                found: index,
            }),
        }
    }

    fn push_failure(&mut self, phase: StepPhase, data: &StepFailedData) {
        self.step_history.push(StepRecord {
            step: data.step.clone(),
            index: data.index,
            phase,
            attempt: data.attempt,
            outcome: StepOutcome::Failed {
                error: data.error.clone(),
            },
        });
    }
}
