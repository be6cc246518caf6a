//! Content-type to handler registry
//!
//! Handlers are stored in an append-only list and content types map to
//! positions in it, so handlers registered while a walk is in progress
//! never invalidate positions already handed out. Each handler carries a
//! set of lifecycle marks used to guarantee a single `__begin__` and a
//! single `__end__` call even when it claims several types.

use super::{HandlerInfo, PartHandler};
use std::collections::{BTreeSet, HashMap};
use tracing::debug;

/// Lifecycle stages a handler has been through in the current pass
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Mark {
    Initialized,
    Finalized,
}

/// A registered handler with its fixed-up attributes
pub struct RegisteredHandler {
    pub handler: Box<dyn PartHandler>,
    pub info: HandlerInfo,
    pub marks: BTreeSet<Mark>,
}

impl std::fmt::Debug for RegisteredHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RegisteredHandler")
            .field("name", &self.handler.name())
            .field("info", &self.info)
            .field("marks", &self.marks)
            .finish()
    }
}

#[derive(Debug, Default)]
pub struct HandlerRegistry {
    handlers: Vec<RegisteredHandler>,
    by_type: HashMap<String, usize>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler for every type it lists, replacing earlier owners
    ///
    /// Returns the handler's position.
    pub fn register(&mut self, handler: Box<dyn PartHandler>) -> usize {
        let info = HandlerInfo::fixup(handler.as_ref());
        let idx = self.handlers.len();
        for ctype in &info.types {
            self.by_type.insert(ctype.clone(), idx);
        }
        debug!("Registered handler {} for {:?}", handler.name(), info.types);
        self.handlers.push(RegisteredHandler {
            handler,
            info,
            marks: BTreeSet::new(),
        });
        idx
    }

    /// Register handlers only for types nobody has claimed yet
    ///
    /// Returns the types that were newly claimed.
    pub fn register_defaults(&mut self, defaults: Vec<Box<dyn PartHandler>>) -> Vec<String> {
        let mut claimed = Vec::new();
        for handler in defaults {
            let info = HandlerInfo::fixup(handler.as_ref());
            let free: Vec<String> = info
                .types
                .iter()
                .filter(|t| !self.by_type.contains_key(*t))
                .cloned()
                .collect();
            if free.is_empty() {
                continue;
            }

            let idx = self.handlers.len();
            for ctype in &free {
                self.by_type.insert(ctype.clone(), idx);
            }
            claimed.extend(free);
            self.handlers.push(RegisteredHandler {
                handler,
                info,
                marks: BTreeSet::new(),
            });
        }
        claimed
    }

    pub fn is_registered(&self, content_type: &str) -> bool {
        self.by_type.contains_key(content_type)
    }

    /// Position of the handler owning a type
    pub fn lookup(&self, content_type: &str) -> Option<usize> {
        self.by_type.get(content_type).copied()
    }

    pub fn get(&self, idx: usize) -> Option<&RegisteredHandler> {
        self.handlers.get(idx)
    }

    pub fn get_mut(&mut self, idx: usize) -> Option<&mut RegisteredHandler> {
        self.handlers.get_mut(idx)
    }

    /// Positions of handlers that still own at least one type, in registration order
    pub fn active(&self) -> Vec<usize> {
        let owned: BTreeSet<usize> = self.by_type.values().copied().collect();
        owned.into_iter().collect()
    }

    /// Registered content types, sorted
    pub fn types(&self) -> Vec<&str> {
        let mut types: Vec<&str> = self.by_type.keys().map(String::as_str).collect();
        types.sort_unstable();
        types
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;

    struct Claims(&'static str, Vec<&'static str>);

    #[async_trait]
    impl PartHandler for Claims {
        fn name(&self) -> &str {
            self.0
        }
        fn list_types(&self) -> Vec<String> {
            self.1.iter().map(|s| s.to_string()).collect()
        }
    }

    #[test]
    fn test_register_overrides() {
        let mut registry = HandlerRegistry::new();
        let first = registry.register(Box::new(Claims("first", vec!["text/a", "text/b"])));
        let second = registry.register(Box::new(Claims("second", vec!["text/b"])));

        assert_eq!(registry.lookup("text/a"), Some(first));
        assert_eq!(registry.lookup("text/b"), Some(second));
        assert_eq!(registry.active(), vec![first, second]);
    }

    #[test]
    fn test_fully_replaced_handler_is_inactive() {
        let mut registry = HandlerRegistry::new();
        registry.register(Box::new(Claims("old", vec!["text/a"])));
        let new = registry.register(Box::new(Claims("new", vec!["text/a"])));

        assert_eq!(registry.active(), vec![new]);
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn test_register_defaults_never_override() {
        let mut registry = HandlerRegistry::new();
        let custom = registry.register(Box::new(Claims("custom", vec!["text/cloud-config"])));

        let claimed = registry.register_defaults(vec![
            Box::new(Claims("cc", vec!["text/cloud-config"])),
            Box::new(Claims("ss", vec!["text/x-shellscript"])),
        ]);

        assert_eq!(claimed, vec!["text/x-shellscript"]);
        assert_eq!(registry.lookup("text/cloud-config"), Some(custom));
        assert_eq!(registry.types(), vec!["text/cloud-config", "text/x-shellscript"]);
        assert_eq!(registry.len(), 2);
    }
}
