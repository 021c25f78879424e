//! Registry mapping each job kind to its handler.

use std::{collections::HashMap, sync::Arc};

use super::{
    entity::JobKind, error::JobError, handlers, ipam::IpAllocator, provider::InstanceProvider,
    runner::JobHandler,
};

/// Keeps track of which handler runs which [`JobKind`].
#[derive(Clone, Default)]
pub struct HandlerRegistry {
    handlers: HashMap<JobKind, Arc<dyn JobHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry with the built-in handler for every kind.
    pub fn with_defaults(provider: Arc<dyn InstanceProvider>, allocator: IpAllocator) -> Self {
        let mut registry = Self::new();
        registry.add_defaults(&provider, &allocator);
        registry
    }

    /// Register the built-in handler for every kind, replacing earlier ones.
    pub fn add_defaults(&mut self, provider: &Arc<dyn InstanceProvider>, allocator: &IpAllocator) {
        for kind in JobKind::ALL {
            self.add_handler(kind, handlers::handler_for(kind, provider, allocator));
        }
    }

    /// Register (or replace) the handler for `kind`.
    pub fn add_handler(&mut self, kind: JobKind, handler: Arc<dyn JobHandler>) {
        self.handlers.insert(kind, handler);
    }

    pub(crate) fn handler(&self, kind: JobKind) -> Result<Arc<dyn JobHandler>, JobError> {
        self.handlers
            .get(&kind)
            .cloned()
            .ok_or(JobError::NoHandlerRegistered(kind))
    }

    pub fn contains(&self, kind: JobKind) -> bool {
        self.handlers.contains_key(&kind)
    }

    /// Get a list of all registered job kinds.
    pub fn registered_kinds(&self) -> Vec<JobKind> {
        self.handlers.keys().copied().collect()
    }
}

impl std::fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandlerRegistry")
            .field("kinds", &self.registered_kinds())
            .finish()
    }
}
