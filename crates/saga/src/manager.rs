//! The saga manager: starts sagas from events, drives them step by step,
//! and compensates on failure.

use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use common::{AggregateId, IsolationContext};
use domain::{Aggregate, CommandBus, DomainError, Repository};
use event_bus::{EventHandler, EventHandlerError};
use event_store::{EventEnvelope, EventQuery};
use tracing::{debug, error, info, instrument, warn};

use crate::definition::{SagaDefinition, StepContext};
use crate::error::{Result, SagaError};
use crate::events::SagaTrigger;
use crate::instance::{SagaInstance, StepPhase};
use crate::state::SagaState;

/// Retry bounds for saga steps.
#[derive(Debug, Clone)]
pub struct SagaPolicy {
    /// Attempts per forward step before compensation starts.
    pub max_step_attempts: u32,
    /// Attempts per compensation before the saga is parked.
    pub max_compensation_attempts: u32,
    pub backoff: Duration,
}

impl Default for SagaPolicy {
    fn default() -> Self {
        Self {
            max_step_attempts: 3,
            max_compensation_attempts: 3,
            backoff: Duration::from_millis(100),
        }
    }
}

pub struct SagaManagerBuilder {
    repository: Repository<SagaInstance>,
    policy: SagaPolicy,
    definitions: Vec<SagaDefinition>,
}

impl SagaManagerBuilder {
    pub fn policy(mut self, policy: SagaPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn definition(mut self, definition: SagaDefinition) -> Self {
        self.definitions.push(definition);
        self
    }

    pub fn build(self) -> Result<SagaManager> {
        for (position, definition) in self.definitions.iter().enumerate() {
            if self.definitions[..position]
                .iter()
                .any(|earlier| earlier.name() == definition.name())
            {
                return Err(SagaError::DuplicateSaga(definition.name()));
            }
        }

        Ok(SagaManager {
            inner: Arc::new(Inner {
                definitions: self.definitions,
                repository: self.repository,
                policy: self.policy,
                commands: OnceLock::new(),
            }),
        })
    }
}

struct Inner {
    definitions: Vec<SagaDefinition>,
    repository: Repository<SagaInstance>,
    policy: SagaPolicy,
    commands: OnceLock<CommandBus>,
}

/// Runs registered sagas. Subscribe it to the event bus for
/// [`SagaManager::event_types`], then [`SagaManager::connect`] the command
/// bus its steps dispatch on.
///
/// Instances are persisted through their own repository, loaded in the
/// platform scope, and saved after every recorded event, so a restart
/// resumes from the last recorded step.
#[derive(Clone)]
pub struct SagaManager {
    inner: Arc<Inner>,
}

impl SagaManager {
    pub fn builder(repository: Repository<SagaInstance>) -> SagaManagerBuilder {
        SagaManagerBuilder {
            repository,
            policy: SagaPolicy::default(),
            definitions: Vec::new(),
        }
    }

    /// Sets the command bus used by steps. Only the first call takes effect.
    pub fn connect(&self, commands: CommandBus) {
        if self.inner.commands.set(commands).is_err() {
            warn!("saga manager already connected, keeping the first command bus");
        }
    }

    /// Event types that start at least one saga.
    pub fn event_types(&self) -> Vec<String> {
        let mut types: Vec<String> = Vec::new();
        for trigger in self.inner.definitions.iter().flat_map(|d| d.triggers()) {
            if !types.contains(trigger) {
                types.push(trigger.clone());
            }
        }
        types
    }

    pub fn policy(&self) -> &SagaPolicy {
        &self.inner.policy
    }

    pub fn repository(&self) -> &Repository<SagaInstance> {
        &self.inner.repository
    }

    pub async fn get(&self, saga_id: AggregateId) -> Result<SagaInstance> {
        Ok(self
            .inner
            .repository
            .load(saga_id, &IsolationContext::platform())
            .await?)
    }

    /// Starts or continues every saga the event triggers.
    ///
    /// Each saga runs to a terminal state or until it errors. One saga's
    /// error does not stop the others; the first error is returned.
    #[instrument(skip(self, event), fields(event_type = %event.event_type, aggregate_id = %event.aggregate_id))]
    pub async fn handle_event(&self, event: &EventEnvelope) -> Result<()> {
        let commands = self.commands()?;
        let mut first_error = None;

        for definition in &self.inner.definitions {
            if !definition.is_started_by(&event.event_type) {
                continue;
            }
            let Some(key) = definition.correlation_key(event) else {
                debug!(saga = definition.name(), "event carries no correlation key");
                continue;
            };

            let result = match self.open(definition, key, event).await {
                Ok(instance) => self.drive(definition, instance, commands).await,
                Err(error) => Err(error),
            };
            if let Err(error) = result {
                first_error.get_or_insert(error);
            }
        }

        first_error.map_or(Ok(()), Err)
    }

    /// Drives every non-terminal saga found in the store. Returns how many
    /// were picked up. Failures are logged per saga.
    #[instrument(skip(self))]
    pub async fn resume_in_flight(&self) -> Result<usize> {
        let commands = self.commands()?;
        let started = self
            .inner
            .repository
            .event_store()
            .query_events(
                EventQuery::for_aggregate_type(SagaInstance::aggregate_type())
                    .event_type("SagaStarted"),
            )
            .await?;

        let mut resumed = 0;
        for event in started {
            let instance = match self.get(event.aggregate_id).await {
                Ok(instance) => instance,
                Err(error) => {
                    warn!(saga_id = %event.aggregate_id, %error, "could not load saga");
                    continue;
                }
            };
            if instance.state().is_terminal() {
                continue;
            }
            let definition = match self.definition(instance.saga_type()) {
                Ok(definition) => definition,
                Err(error) => {
                    warn!(saga_id = %instance.id(), %error, "cannot resume saga");
                    continue;
                }
            };

            info!(saga_id = %instance.id(), saga = definition.name(), state = %instance.state(), "resuming saga");
            resumed += 1;
            if let Err(error) = self.drive(definition, instance, commands).await {
                warn!(saga_id = %event.aggregate_id, %error, "resumed saga did not finish");
            }
        }
        Ok(resumed)
    }

    /// Sagas parked in `Failed` that need an operator.
    pub async fn parked(&self) -> Result<Vec<SagaInstance>> {
        let failed = self
            .inner
            .repository
            .event_store()
            .query_events(
                EventQuery::for_aggregate_type(SagaInstance::aggregate_type())
                    .event_type("SagaFailed"),
            )
            .await?;

        let mut parked = Vec::new();
        for event in failed {
            let instance = self.get(event.aggregate_id).await?;
            if instance.requires_intervention() {
                parked.push(instance);
            }
        }
        Ok(parked)
    }

    fn commands(&self) -> Result<&CommandBus> {
        self.inner.commands.get().ok_or(SagaError::NotConnected)
    }

    /// The registered definition called `name`.
    pub fn definition(&self, name: &str) -> Result<&SagaDefinition> {
        self.inner
            .definitions
            .iter()
            .find(|d| d.name() == name)
            .ok_or_else(|| SagaError::UnknownSaga(name.to_string()))
    }

    /// Loads the instance for `key`, creating it when the event is the
    /// first trigger seen.
    async fn open(
        &self,
        definition: &SagaDefinition,
        key: String,
        event: &EventEnvelope,
    ) -> Result<SagaInstance> {
        let saga_id = definition.saga_id(&key);
        match self.get(saga_id).await {
            Err(SagaError::Domain(DomainError::NotFound { .. })) => {}
            existing => return existing,
        }

        let mut instance = SagaInstance::start(
            saga_id,
            event.isolation.clone(),
            definition.name(),
            key,
            SagaTrigger {
                event_type: event.event_type.clone(),
                aggregate_id: event.aggregate_id,
                version: event.version,
            },
            event.payload.clone(),
        );
        match self.inner.repository.save(&mut instance).await {
            Ok(_) => {
                metrics::counter!("saga_started_total", "saga" => definition.name()).increment(1);
                info!(%saga_id, saga = definition.name(), "saga started");
                Ok(instance)
            }
            // Another delivery created it first.
            Err(DomainError::AlreadyExists { .. }) => self.get(saga_id).await,
            Err(error) => Err(error.into()),
        }
    }

    #[instrument(skip_all, fields(saga = definition.name(), saga_id = %instance.id()))]
    async fn drive(
        &self,
        definition: &SagaDefinition,
        mut instance: SagaInstance,
        commands: &CommandBus,
    ) -> Result<()> {
        if instance.state().is_terminal() {
            debug!(state = %instance.state(), "saga already finished");
            return Ok(());
        }

        let started = Instant::now();
        let result = self.run(definition, &mut instance, commands).await;
        metrics::histogram!("saga_duration_seconds", "saga" => definition.name())
            .record(started.elapsed().as_secs_f64());
        result
    }

    async fn run(
        &self,
        definition: &SagaDefinition,
        instance: &mut SagaInstance,
        commands: &CommandBus,
    ) -> Result<()> {
        loop {
            match instance.state() {
                SagaState::Running if instance.next_step() >= definition.steps().len() => {
                    instance.complete()?;
                    self.save(instance).await?;
                    metrics::counter!("saga_completed_total", "saga" => definition.name())
                        .increment(1);
                    info!("saga completed");
                    return Ok(());
                }
                SagaState::Running => self.run_step(definition, instance, commands).await?,
                SagaState::Compensating => match instance.next_compensation() {
                    Some(index) => {
                        self.run_compensation(definition, instance, index, commands)
                            .await?
                    }
                    None => {
                        let reason = instance
                            .failure_reason()
                            .unwrap_or("step failed")
                            .to_string();
                        instance.fail(reason, false)?;
                        self.save(instance).await?;
                        metrics::counter!("saga_failed_total", "saga" => definition.name())
                            .increment(1);
                        info!(reason = instance.failure_reason(), "saga failed, compensation complete");
                        return Ok(());
                    }
                },
                SagaState::Completed | SagaState::Failed => return Ok(()),
                SagaState::NotStarted => {
                    return Err(SagaError::InvalidTransition {
                        from: SagaState::NotStarted,
                        to: SagaState::Running,
                    });
                }
            }
        }
    }

    /// Runs the next forward step until it completes or gives up.
    async fn run_step(
        &self,
        definition: &SagaDefinition,
        instance: &mut SagaInstance,
        commands: &CommandBus,
    ) -> Result<()> {
        let index = instance.next_step();
        let Some(step) = definition.steps().get(index) else {
            let reason = format!("step {index} is not defined");
            warn!(index, "saga points past its definition, compensating");
            instance.begin_compensation(&format!("#{index}"), reason)?;
            return self.save(instance).await;
        };
        let max_attempts = self.inner.policy.max_step_attempts.max(1);
        let mut attempt = instance.attempts(StepPhase::Forward, index) + 1;

        loop {
            instance.begin_step(index, step.name(), attempt)?;
            self.save(instance).await?;

            let result = step
                .execute(&StepContext::new(instance, attempt, commands))
                .await;
            match result {
                Ok(output) => {
                    instance.complete_step(index, step.name(), output)?;
                    self.save(instance).await?;
                    debug!(step = step.name(), attempt, "step completed");
                    return Ok(());
                }
                Err(error) => {
                    let will_retry = error.is_retriable() && attempt < max_attempts;
                    instance.fail_step(index, step.name(), attempt, error.to_string(), will_retry)?;
                    if will_retry {
                        self.save(instance).await?;
                        warn!(step = step.name(), attempt, %error, "step failed, retrying");
                        tokio::time::sleep(self.inner.policy.backoff).await;
                        attempt += 1;
                        continue;
                    }

                    warn!(step = step.name(), attempt, %error, "step failed, compensating");
                    instance.begin_compensation(step.name(), error.to_string())?;
                    self.save(instance).await?;
                    return Ok(());
                }
            }
        }
    }

    /// Compensates one completed step. Parks the saga when the compensation
    /// keeps failing.
    async fn run_compensation(
        &self,
        definition: &SagaDefinition,
        instance: &mut SagaInstance,
        index: usize,
        commands: &CommandBus,
    ) -> Result<()> {
        let Some(step) = definition.steps().get(index) else {
            let reason = format!("step {index} is not defined, cannot compensate it");
            self.park(definition, instance, reason).await?;
            return Err(SagaError::StepNotDefined {
                saga_id: instance.id(),
                index,
            });
        };
        let max_attempts = self.inner.policy.max_compensation_attempts.max(1);
        let mut attempt = instance.attempts(StepPhase::Compensation, index) + 1;

        loop {
            let result = step
                .compensate(&StepContext::new(instance, attempt, commands))
                .await;
            let error = match result {
                Ok(()) => {
                    instance.complete_compensation(index, step.name())?;
                    self.save(instance).await?;
                    info!(step = step.name(), "step compensated");
                    return Ok(());
                }
                Err(error) => error,
            };

            let will_retry = error.is_retriable() && attempt < max_attempts;
            instance.fail_compensation(index, step.name(), attempt, error.to_string(), will_retry)?;
            if will_retry {
                self.save(instance).await?;
                warn!(step = step.name(), attempt, %error, "compensation failed, retrying");
                tokio::time::sleep(self.inner.policy.backoff).await;
                attempt += 1;
                continue;
            }

            let reason = format!("compensation of '{}' failed: {error}", step.name());
            self.park(definition, instance, reason).await?;
            return Err(SagaError::CompensationFailed {
                saga_id: instance.id(),
                step: step.name().to_string(),
                reason: error.to_string(),
            });
        }
    }

    /// Records the saga as failed and waiting for an operator.
    async fn park(
        &self,
        definition: &SagaDefinition,
        instance: &mut SagaInstance,
        reason: String,
    ) -> Result<()> {
        error!(%reason, "saga parked, requires intervention");
        instance.fail(reason, true)?;
        self.save(instance).await?;
        metrics::counter!("saga_parked_total", "saga" => definition.name()).increment(1);
        Ok(())
    }

    async fn save(&self, instance: &mut SagaInstance) -> Result<()> {
        self.inner.repository.save(instance).await?;
        Ok(())
    }
}

#[async_trait]
impl EventHandler for SagaManager {
    fn name(&self) -> &'static str {
        "saga-manager"
    }

    async fn handle(&self, event: &EventEnvelope) -> std::result::Result<(), EventHandlerError> {
        self.handle_event(event).await.map_err(|error| match error {
            SagaError::CompensationFailed { .. }
            | SagaError::StepNotDefined { .. }
            | SagaError::InvalidTransition { .. }
            | SagaError::OutOfOrderStep { .. }
            | SagaError::OutOfOrderCompensation { .. } => {
                EventHandlerError::Rejected(error.to_string())
            }
            other => EventHandlerError::Failed(other.to_string()),
        })
    }
}
