//! The two named events external code raises when it changes data behind
//! the views' backs, and their translation into typed bus events.

use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, warn};

use crate::actions::{Action, ActionError};
use crate::bus::{Bus, BusEvent, Provenance};
use crate::datetime::{CanonicalDate, normalize_at};
use crate::model::{EntityId, WorkItem};

pub const DAILY_STEPS_UPDATED: &str = "dailyStepsUpdated";
pub const ASSISTANT_ACTION_COMPLETED: &str = "assistantActionCompleted";

#[derive(Debug, Clone, Deserialize)]
pub struct DailyStepsUpdated {
    #[serde(default)]
    pub steps: Vec<Value>,

    #[serde(default)]
    pub source: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AssistantActionCompleted {
    #[serde(default)]
    pub actions: Vec<RawAction>,
}

/// One entry of an `assistantActionCompleted` event, before validation.
#[derive(Debug, Clone, Deserialize)]
pub struct RawAction {
    #[serde(rename = "type")]
    pub kind: String,

    pub operation: String,

    #[serde(default)]
    pub success: bool,

    #[serde(default)]
    pub data: Value,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExternalChange {
    Step(Action),
    Habits,
    Ignored,
}

#[derive(Debug, Deserialize)]
struct IdPayload {
    id: EntityId,

    #[serde(default)]
    date: Option<String>,
}

impl RawAction {
    /// Validates the payload into a typed change. Failed actions are ignored.
    pub fn into_change(self, today: CanonicalDate) -> Result<ExternalChange, ActionError> {
        if !self.success {
            return Ok(ExternalChange::Ignored);
        }

        let kind = self.kind.to_ascii_lowercase();
        let operation = self.operation.to_ascii_lowercase();
        match kind.as_str() {
            "habit" | "habits" => Ok(ExternalChange::Habits),
            "step" | "steps" | "dailystep" => {
                let action = step_action(&kind, &operation, self.data, today)?;
                action.validate()?;
                Ok(ExternalChange::Step(action))
            }
            "milestone" | "area" | "goal" => Ok(ExternalChange::Ignored),
            _ => Err(ActionError::Unsupported { kind, operation }),
        }
    }
}

fn malformed(kind: &str, err: &serde_json::Error) -> ActionError {
    ActionError::Malformed {
        kind: kind.to_string(),
        reason: err.to_string(),
    }
}

fn step_action(
    kind: &str,
    operation: &str,
    data: Value,
    today: CanonicalDate,
) -> Result<Action, ActionError> {
    match operation {
        "create" | "add" => {
            let item: WorkItem = serde_json::from_value(data).map_err(|e| malformed(kind, &e))?;
            Ok(Action::Create { item })
        }
        "update" | "edit" | "move" => {
            let item: WorkItem = serde_json::from_value(data).map_err(|e| malformed(kind, &e))?;
            Ok(Action::Update { item })
        }
        "delete" | "remove" => {
            let payload: IdPayload =
                serde_json::from_value(data).map_err(|e| malformed(kind, &e))?;
            Ok(Action::Delete { id: payload.id })
        }
        "complete" | "toggle" => {
            let payload: IdPayload =
                serde_json::from_value(data).map_err(|e| malformed(kind, &e))?;
            let on = payload
                .date
                .as_deref()
                .and_then(|raw| normalize_at(raw, today))
                .unwrap_or(today);
            Ok(Action::Complete { id: payload.id, on })
        }
        _ => Err(ActionError::Unsupported {
            kind: kind.to_string(),
            operation: operation.to_string(),
        }),
    }
}

/// Maps a named external event and its `detail` onto bus events. Unknown
/// names and malformed details produce nothing.
#[tracing::instrument(skip(detail))]
pub fn translate(name: &str, detail: &Value, today: CanonicalDate) -> Vec<BusEvent> {
    match name {
        DAILY_STEPS_UPDATED => {
            let parsed: DailyStepsUpdated = match serde_json::from_value(detail.clone()) {
                Ok(parsed) => parsed,
                Err(err) => {
                    warn!(error = %err, "malformed dailyStepsUpdated detail");
                    return vec![];
                }
            };
            let items = parsed
                .steps
                .into_iter()
                .filter_map(|raw| match serde_json::from_value::<WorkItem>(raw) {
                    Ok(item) => Some(item),
                    Err(err) => {
                        warn!(error = %err, "dropping malformed step");
                        None
                    }
                })
                .collect();
            vec![BusEvent::WorkingSetChanged {
                items,
                source: parsed.source.map(Provenance::new),
            }]
        }
        ASSISTANT_ACTION_COMPLETED => {
            let parsed: AssistantActionCompleted = match serde_json::from_value(detail.clone()) {
                Ok(parsed) => parsed,
                Err(err) => {
                    warn!(error = %err, "malformed assistantActionCompleted detail");
                    return vec![];
                }
            };

            let mut actions = Vec::new();
            let mut habits_touched = false;
            for raw in parsed.actions {
                match raw.into_change(today) {
                    Ok(ExternalChange::Step(action)) => actions.push(action),
                    Ok(ExternalChange::Habits) => habits_touched = true,
                    Ok(ExternalChange::Ignored) => {}
                    Err(err) => warn!(error = %err, "rejected external action"),
                }
            }

            let mut events = Vec::new();
            if !actions.is_empty() {
                events.push(BusEvent::ActionsCompleted {
                    actions,
                    source: None,
                });
            }
            if habits_touched {
                events.push(BusEvent::HabitSetChanged { source: None });
            }
            events
        }
        other => {
            debug!(name = other, "ignoring unknown external event");
            vec![]
        }
    }
}

/// Translates and publishes an external event; returns the number of
/// handler invocations.
pub fn dispatch_external(bus: &Bus, name: &str, detail: &Value, today: CanonicalDate) -> usize {
    translate(name, detail, today)
        .into_iter()
        .map(|event| bus.publish(event))
        .sum()
}
