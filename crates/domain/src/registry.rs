//! Type-keyed handler table shared by the command and query buses.

use std::any::{Any, TypeId, type_name};
use std::collections::HashMap;

use crate::error::DomainError;

struct Entry {
    type_name: &'static str,
    handler: Box<dyn Any + Send + Sync>,
}

/// Maps a message type to exactly one handler.
///
/// Filled once at startup and read-only afterwards.
pub(crate) struct HandlerRegistry {
    kind: &'static str,
    entries: HashMap<TypeId, Entry>,
}

impl HandlerRegistry {
    pub(crate) fn new(kind: &'static str) -> Self {
        Self {
            kind,
            entries: HashMap::new(),
        }
    }

    /// Registers `handler` for messages of type `M`.
    pub(crate) fn insert<M: 'static, H: Send + Sync + 'static>(
        &mut self,
        handler: H,
    ) -> Result<(), DomainError> {
        let type_name = type_name::<M>();
        if self.entries.contains_key(&TypeId::of::<M>()) {
            return Err(DomainError::DuplicateHandler {
                kind: self.kind,
                type_name,
            });
        }
        self.entries.insert(
            TypeId::of::<M>(),
            Entry {
                type_name,
                handler: Box::new(handler),
            },
        );
        Ok(())
    }

    pub(crate) fn get<M: 'static, H: 'static>(&self) -> Result<&H, DomainError> {
        self.entries
            .get(&TypeId::of::<M>())
            .and_then(|entry| entry.handler.downcast_ref::<H>())
            .ok_or(DomainError::HandlerNotFound {
                kind: self.kind,
                type_name: type_name::<M>(),
            })
    }

    pub(crate) fn registered(&self) -> Vec<&'static str> {
        let mut names: Vec<_> = self.entries.values().map(|entry| entry.type_name).collect();
        names.sort_unstable();
        names
    }
}
