//! Synchronous in-process notification of overlay changes.

use std::fmt;
use std::panic::{self, AssertUnwindSafe};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::warn;

use metalayer_core::{OverlayKey, OverlayScope};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum OverlayEventKind {
    #[serde(rename = "overlay.applied")]
    Applied,
    #[serde(rename = "overlay.removed")]
    Removed,
}

impl OverlayEventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Applied => "overlay.applied",
            Self::Removed => "overlay.removed",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OverlayEvent {
    pub kind: OverlayEventKind,
    pub base_type: String,
    pub base_name: String,
    pub scope: OverlayScope,
    pub tenant_id: Option<String>,
    pub actor: String,
    pub timestamp: DateTime<Utc>,
}

impl OverlayEvent {
    pub fn new(kind: OverlayEventKind, key: &OverlayKey, actor: &str) -> Self {
        Self {
            kind,
            base_type: key.base_type.clone(),
            base_name: key.base_name.clone(),
            scope: key.scope.clone(),
            tenant_id: key.tenant_id.clone(),
            actor: actor.to_string(),
            timestamp: Utc::now(),
        }
    }
}

pub type SubscriberError = Box<dyn std::error::Error + Send + Sync>;

type Subscriber = Box<dyn Fn(&OverlayEvent) -> Result<(), SubscriberError> + Send + Sync>;

/// Delivers every event to every subscriber in registration order. A failing
/// or panicking subscriber is logged and skipped.
#[derive(Default)]
pub struct EventEmitter {
    subscribers: Vec<Subscriber>,
}

impl EventEmitter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe<F>(&mut self, subscriber: F)
    where
        F: Fn(&OverlayEvent) -> Result<(), SubscriberError> + Send + Sync + 'static,
    {
        self.subscribers.push(Box::new(subscriber));
    }

    pub fn len(&self) -> usize {
        self.subscribers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.subscribers.is_empty()
    }

    pub fn emit(&self, event: &OverlayEvent) {
        for (index, subscriber) in self.subscribers.iter().enumerate() {
            match panic::catch_unwind(AssertUnwindSafe(|| subscriber(event))) {
                Ok(Ok(())) => {}
                Ok(Err(err)) => warn!(
                    subscriber = index,
                    event = event.kind.as_str(),
                    error = %err,
                    "event subscriber failed"
                ),
                Err(_) => warn!(
                    subscriber = index,
                    event = event.kind.as_str(),
                    "event subscriber panicked"
                ),
            }
        }
    }
}

impl fmt::Debug for EventEmitter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventEmitter")
            .field("subscribers", &self.subscribers.len())
            .finish()
    }
}
