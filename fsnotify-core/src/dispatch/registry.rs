//! Handler registry with reference-counted categories

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use crate::error::WatchError;
use crate::event::{ChangeEvent, ChangeKind};

/// Callback invoked for every event of one category
pub type EventHandler = Arc<dyn Fn(&ChangeEvent) + Send + Sync>;

/// Callback invoked for every fault raised through the error category
pub type ErrorHandler = Arc<dyn Fn(&WatchError) + Send + Sync>;

/// Identity of one registration, used to unsubscribe
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct HandlerId(u64);

impl fmt::Display for HandlerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "handler-{}", self.0)
    }
}

/// What a handler is registered for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Category {
    Event(ChangeKind),
    Error,
}

struct Registration<H> {
    id: HandlerId,
    handler: H,
}

/// Result of adding or removing a registration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Transition {
    pub category: Category,
    /// The category went from zero to one handler, or from one to zero
    pub edge: bool,
}

/// Handlers per category, kept in insertion order
#[derive(Default)]
pub(crate) struct HandlerRegistry {
    next_id: u64,
    events: HashMap<ChangeKind, Vec<Registration<EventHandler>>>,
    errors: Vec<Registration<ErrorHandler>>,
}

impl HandlerRegistry {
    fn allocate(&mut self) -> HandlerId {
        self.next_id += 1;
        HandlerId(self.next_id)
    }

    pub fn add_event(&mut self, kind: ChangeKind, handler: EventHandler) -> (HandlerId, Transition) {
        let id = self.allocate();
        let handlers = self.events.entry(kind).or_default();
        handlers.push(Registration { id, handler });
        (id, Transition { category: Category::Event(kind), edge: handlers.len() == 1 })
    }

    pub fn add_error(&mut self, handler: ErrorHandler) -> (HandlerId, Transition) {
        let id = self.allocate();
        self.errors.push(Registration { id, handler });
        (id, Transition { category: Category::Error, edge: self.errors.len() == 1 })
    }

    pub fn remove(&mut self, id: HandlerId) -> Option<Transition> {
        if let Some(index) = self.errors.iter().position(|r| r.id == id) {
            self.errors.remove(index);
            return Some(Transition { category: Category::Error, edge: self.errors.is_empty() });
        }

        let (kind, handlers) =
            self.events.iter_mut().find(|(_, handlers)| handlers.iter().any(|r| r.id == id))?;
        let kind = *kind;
        handlers.retain(|r| r.id != id);
        let edge = handlers.is_empty();
        if edge {
            self.events.remove(&kind);
        }
        Some(Transition { category: Category::Event(kind), edge })
    }

    /// Snapshot of the handlers for one category
    pub fn event_handlers(&self, kind: ChangeKind) -> Vec<EventHandler> {
        self.events
            .get(&kind)
            .map(|handlers| handlers.iter().map(|r| r.handler.clone()).collect())
            .unwrap_or_default()
    }

    pub fn error_handlers(&self) -> Vec<ErrorHandler> {
        self.errors.iter().map(|r| r.handler.clone()).collect()
    }

    pub fn count(&self, category: Category) -> usize {
        match category {
            Category::Event(kind) => self.events.get(&kind).map_or(0, Vec::len),
            Category::Error => self.errors.len(),
        }
    }

    pub fn has_handlers(&self, kind: ChangeKind) -> bool {
        self.count(Category::Event(kind)) > 0
    }

    pub fn clear(&mut self) {
        self.events.clear();
        self.errors.clear();
    }
}
