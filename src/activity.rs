//! Activity: a triggered/started/finished workflow around user logic
//!
//! Registered as a subscription handler, an [`Activity`] reacts to each
//! triggering event by publishing
//!
//! ```text
//! ActivityTriggered -> pre_call -> ActivityStarted -> call -> ActivityFinished -> post_call
//! ```
//!
//! If triggering succeeded and a later phase fails before the finished event
//! is queued, an `EiffelActivityCanceledEvent` carrying the error text is
//! published and the error is returned to the subscriber. Each run keeps its
//! own state, so one activity may serve several subscriptions.

use crate::error::Result;
use crate::event::{Event, Source, CONTEXT};
use crate::publisher::Publisher;
use crate::subscriber::{EventHandler, HandlerResult};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

pub const TRIGGERED: &str = "EiffelActivityTriggeredEvent";
pub const STARTED: &str = "EiffelActivityStartedEvent";
pub const FINISHED: &str = "EiffelActivityFinishedEvent";
pub const CANCELED: &str = "EiffelActivityCanceledEvent";

const ACTIVITY_EXECUTION: &str = "ACTIVITY_EXECUTION";
const CAUSE: &str = "CAUSE";

/// User logic run by an [`Activity`]
///
/// `context` is the triggering event's context, or the id of the activity's
/// triggered event when the trigger has none.
pub trait ActivityLogic: Send + Sync {
    fn pre_call(&self, _event: &Event, _context: &str) -> HandlerResult {
        Ok(())
    }

    /// Primary business logic
    fn call(&self, event: &Event, context: &str) -> HandlerResult;

    fn post_call(&self, _event: &Event, _context: &str) -> HandlerResult {
        Ok(())
    }
}

impl<F> ActivityLogic for F
where
    F: Fn(&Event, &str) -> HandlerResult + Send + Sync,
{
    fn call(&self, event: &Event, context: &str) -> HandlerResult {
        self(event, context)
    }
}

/// Trigger category recorded on the triggered event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TriggerType {
    Manual,
    EiffelEvent,
    SourceChange,
    Environment,
    Timer,
    Other,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Trigger {
    #[serde(rename = "type")]
    pub trigger_type: TriggerType,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExecutionType {
    Manual,
    SemiAutomated,
    Automated,
    Other,
}

/// Named workflow that publishes its own lifecycle events
pub struct Activity {
    name: String,
    publisher: Arc<Publisher>,
    source: Source,
    triggers: Vec<Trigger>,
    execution_type: Option<ExecutionType>,
    logic: Box<dyn ActivityLogic>,
}

impl Activity {
    /// Create an activity; every lifecycle event is stamped with `source`
    pub fn new(
        name: impl Into<String>,
        publisher: Arc<Publisher>,
        source: Source,
        logic: impl ActivityLogic + 'static,
    ) -> Self {
        Self {
            name: name.into(),
            publisher,
            source,
            triggers: Vec::new(),
            execution_type: None,
            logic: Box::new(logic),
        }
    }

    pub fn with_trigger(mut self, trigger_type: TriggerType, description: Option<String>) -> Self {
        self.triggers.push(Trigger {
            trigger_type,
            description,
        });
        self
    }

    pub fn with_execution_type(mut self, execution_type: ExecutionType) -> Self {
        self.execution_type = Some(execution_type);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Build and queue one lifecycle event
    fn emit(
        &self,
        event_type: &str,
        context: Option<&str>,
        build: impl FnOnce(&mut Event) -> Result<()>,
    ) -> Result<Event> {
        let mut event = Event::latest(event_type)?;
        event.meta_mut().set_source(&self.source);
        build(&mut event)?;
        if let Some(context) = context {
            event.links.add(CONTEXT, context);
        }
        self.publisher.send_event(&event)?;
        tracing::debug!(activity = %self.name, event_type, event_id = %event.id(), "Activity event queued");
        Ok(event)
    }

    fn trigger(&self, cause: &Event, context: Option<&str>) -> Result<Event> {
        self.emit(TRIGGERED, context, |event| {
            event.data.add("name", self.name.as_str());
            if !self.triggers.is_empty() {
                event.data.add("triggers", serde_json::to_value(&self.triggers)?);
            }
            if let Some(execution_type) = self.execution_type {
                event
                    .data
                    .add("executionType", serde_json::to_value(execution_type)?);
            }
            event.links.add(CAUSE, cause);
            Ok(())
        })
    }

    /// The phases after triggering; sets `finished` once the finished event is queued
    fn execute(
        &self,
        event: &Event,
        context: Option<&str>,
        triggered: &Event,
        finished: &mut bool,
    ) -> HandlerResult {
        let call_context = context.unwrap_or(triggered.id());

        self.logic.pre_call(event, call_context)?;
        let started = self.emit(STARTED, context, |e| {
            e.links.add(ACTIVITY_EXECUTION, triggered);
            Ok(())
        })?;

        self.logic.call(event, call_context)?;
        self.emit(FINISHED, context, |e| {
            e.data
                .add("outcome", serde_json::json!({ "conclusion": "SUCCESSFUL" }));
            e.links.add(ACTIVITY_EXECUTION, triggered);
            e.links.add(CAUSE, &started);
            Ok(())
        })?;
        *finished = true;

        self.logic.post_call(event, call_context)
    }

    fn cancel(&self, triggered: &Event, context: Option<&str>, reason: &str) {
        let canceled = self.emit(CANCELED, context, |e| {
            e.data.add("reason", reason);
            e.links.add(ACTIVITY_EXECUTION, triggered);
            Ok(())
        });
        if let Err(e) = canceled {
            tracing::error!(activity = %self.name, error = %e, "Failed to send activity canceled event");
        }
    }
}

impl EventHandler for Activity {
    fn handle(&self, event: &Event, context: Option<&str>) -> HandlerResult {
        let triggered = self.trigger(event, context)?;
        tracing::info!(
            activity = %self.name,
            trigger = %event.id(),
            triggered = %triggered.id(),
            "Activity triggered"
        );

        let mut finished = false;
        let result = self.execute(event, context, &triggered, &mut finished);
        match &result {
            Ok(()) => tracing::info!(activity = %self.name, triggered = %triggered.id(), "Activity finished"),
            Err(e) if !finished => {
                tracing::warn!(activity = %self.name, error = %e, "Activity canceled");
                self.cancel(&triggered, context, &e.to_string());
            }
            Err(e) => tracing::error!(activity = %self.name, error = %e, "Activity post_call failed"),
        }
        result
    }
}

impl std::fmt::Debug for Activity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Activity")
            .field("name", &self.name)
            .field("triggers", &self.triggers)
            .field("execution_type", &self.execution_type)
            .finish_non_exhaustive()
    }
}
