//! Event alias registry.
//!
//! Maps an [`EventKind`] to a stable string alias (e.g. `"escalation.alert"`)
//! used when events are reported to the transport for observability. The
//! registry is an ordinary value threaded through call setup; each kind may be
//! registered once.

use std::collections::HashMap;

use crate::error::WiringError;
use crate::event::EventKind;

#[derive(Debug, Clone, Default)]
pub struct EventRegistry {
    aliases: HashMap<EventKind, String>,
}

impl EventRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `alias` for `kind`. Fails if the kind already has an alias.
    pub fn register(
        &mut self,
        alias: impl Into<String>,
        kind: EventKind,
    ) -> Result<(), WiringError> {
        let alias = alias.into();
        if alias.trim().is_empty() {
            return Err(WiringError::EmptyAlias(kind.to_string()));
        }
        if let Some(existing) = self.aliases.get(&kind) {
            return Err(WiringError::DuplicateAlias {
                kind,
                existing: existing.clone(),
            });
        }
        tracing::debug!(kind = %kind, alias = %alias, "Registered event alias");
        self.aliases.insert(kind, alias);
        Ok(())
    }

    pub fn get(&self, kind: &EventKind) -> Option<&str> {
        self.aliases.get(kind).map(String::as_str)
    }

    pub fn kinds(&self) -> impl Iterator<Item = &EventKind> {
        self.aliases.keys()
    }

    pub fn len(&self) -> usize {
        self.aliases.len()
    }

    pub fn is_empty(&self) -> bool {
        self.aliases.is_empty()
    }
}
