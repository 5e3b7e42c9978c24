//! Command trait and the command bus.

use std::any::type_name;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use common::IsolationContext;

use crate::error::DomainError;
use crate::registry::HandlerRegistry;

/// A request to change state.
pub trait Command: Send + Sync + 'static {
    /// Value returned to the caller on success.
    type Output: Send + 'static;

    /// Checks the command on its own, before any aggregate is loaded.
    fn validate(&self) -> Result<(), DomainError> {
        Ok(())
    }
}

/// Handles one command type.
///
/// `isolation` is the caller's already-resolved context.
#[async_trait]
pub trait CommandHandler<C: Command>: Send + Sync {
    async fn handle(&self, isolation: &IsolationContext, command: C)
    -> Result<C::Output, DomainError>;
}

/// Collects command handlers before the bus accepts traffic.
pub struct CommandBusBuilder {
    registry: HandlerRegistry,
}

impl CommandBusBuilder {
    /// Registers the handler for `C`. Fails if `C` already has one.
    pub fn register<C: Command>(
        mut self,
        handler: Arc<dyn CommandHandler<C>>,
    ) -> Result<Self, DomainError> {
        self.registry.insert::<C, _>(handler)?;
        Ok(self)
    }

    pub fn build(self) -> CommandBus {
        CommandBus {
            registry: Arc::new(self.registry),
        }
    }
}

/// Dispatches each command to its single registered handler.
///
/// Dispatch never retries and never swallows a handler error.
#[derive(Clone)]
pub struct CommandBus {
    registry: Arc<HandlerRegistry>,
}

impl CommandBus {
    pub fn builder() -> CommandBusBuilder {
        CommandBusBuilder {
            registry: HandlerRegistry::new("command"),
        }
    }

    /// Type names of the registered commands.
    pub fn registered(&self) -> Vec<&'static str> {
        self.registry.registered()
    }

    /// Validates `command` and runs its handler under `isolation`.
    #[tracing::instrument(skip_all, fields(command = type_name::<C>(), isolation = %isolation))]
    pub async fn dispatch<C: Command>(
        &self,
        isolation: &IsolationContext,
        command: C,
    ) -> Result<C::Output, DomainError> {
        let name = type_name::<C>();
        metrics::counter!("commands_dispatched_total", "command" => name).increment(1);

        let handler = self
            .registry
            .get::<C, Arc<dyn CommandHandler<C>>>()
            .inspect_err(|_| {
                metrics::counter!("command_failures_total", "command" => name, "kind" => "handler_not_found")
                    .increment(1);
            })?
            .clone();

        let started = Instant::now();
        let result = match command.validate() {
            Ok(()) => handler.handle(isolation, command).await,
            Err(error) => Err(error),
        };
        metrics::histogram!("command_duration_seconds", "command" => name)
            .record(started.elapsed().as_secs_f64());

        if let Err(error) = &result {
            metrics::counter!("command_failures_total", "command" => name, "kind" => error.kind())
                .increment(1);
            if error.is_retriable() {
                tracing::warn!(%error, "command hit a concurrency conflict");
            } else {
                tracing::debug!(%error, "command failed");
            }
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    struct Rename {
        name: String,
    }

    impl Command for Rename {
        type Output = usize;

        fn validate(&self) -> Result<(), DomainError> {
            if self.name.is_empty() {
                return Err(DomainError::Validation("name must not be empty".into()));
            }
            Ok(())
        }
    }

    struct Unregistered;

    impl Command for Unregistered {
        type Output = ();
    }

    #[derive(Default)]
    struct RenameHandler {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl CommandHandler<Rename> for RenameHandler {
        async fn handle(
            &self,
            _isolation: &IsolationContext,
            command: Rename,
        ) -> Result<usize, DomainError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(command.name.len())
        }
    }

    fn tenant() -> IsolationContext {
        IsolationContext::tenant("acme").unwrap()
    }

    #[tokio::test]
    async fn dispatch_reaches_the_registered_handler() {
        let handler = Arc::new(RenameHandler::default());
        let bus = CommandBus::builder()
            .register::<Rename>(handler.clone())
            .unwrap()
            .build();

        let output = bus
            .dispatch(&tenant(), Rename { name: "widget".into() })
            .await
            .unwrap();

        assert_eq!(output, 6);
        assert_eq!(handler.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn invalid_commands_never_reach_the_handler() {
        let handler = Arc::new(RenameHandler::default());
        let bus = CommandBus::builder()
            .register::<Rename>(handler.clone())
            .unwrap()
            .build();

        let error = bus
            .dispatch(&tenant(), Rename { name: String::new() })
            .await
            .unwrap_err();

        assert!(matches!(error, DomainError::Validation(_)));
        assert_eq!(handler.calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn duplicate_registration_fails_at_startup() {
        let result = CommandBus::builder()
            .register::<Rename>(Arc::new(RenameHandler::default()))
            .unwrap()
            .register::<Rename>(Arc::new(RenameHandler::default()));

        assert!(matches!(
            result,
            Err(DomainError::DuplicateHandler { kind: "command", .. })
        ));
    }

    #[tokio::test]
    async fn unregistered_command_is_an_error() {
        let bus = CommandBus::builder().build();
        let error = bus.dispatch(&tenant(), Unregistered).await.unwrap_err();
        assert!(matches!(error, DomainError::HandlerNotFound { .. }));
    }
}
