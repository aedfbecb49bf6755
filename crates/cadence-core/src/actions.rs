use serde::{Deserialize, Serialize};

use crate::datetime::{CanonicalDate, parse_weekday_name};
use crate::model::{EntityId, Habit, HabitFrequency, Milestone, WorkItem};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ActionError {
    #[error("title cannot be empty")]
    EmptyTitle,

    #[error("habit name cannot be empty")]
    EmptyHabitName,

    #[error("habit {0} has no days selected")]
    NoDaysSelected(String),

    #[error("unknown weekday: {0}")]
    UnknownWeekday(String),

    #[error("recurrence interval must be at least 1")]
    ZeroInterval,

    #[error("progress must be between 0 and 100, got {0}")]
    ProgressOutOfRange(i32),

    #[error("area name cannot be empty")]
    EmptyAreaName,

    #[error("no such item: {0}")]
    UnknownItem(EntityId),

    #[error("malformed {kind} action: {reason}")]
    Malformed { kind: String, reason: String },

    #[error("unsupported action {kind}/{operation}")]
    Unsupported { kind: String, operation: String },
}

/// A mutation of the working set, validated before it touches any state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum Action {
    Create { item: WorkItem },
    Update { item: WorkItem },
    Delete { id: EntityId },
    Complete { id: EntityId, on: CanonicalDate },
}

impl Action {
    pub fn target(&self) -> &EntityId {
        match self {
            Self::Create { item } | Self::Update { item } => &item.id,
            Self::Delete { id } | Self::Complete { id, .. } => id,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Create { .. } => "create",
            Self::Update { .. } => "update",
            Self::Delete { .. } => "delete",
            Self::Complete { .. } => "complete",
        }
    }

    pub fn validate(&self) -> Result<(), ActionError> {
        match self {
            Self::Create { item } | Self::Update { item } => validate_item(item),
            Self::Delete { .. } | Self::Complete { .. } => Ok(()),
        }
    }
}

pub fn validate_item(item: &WorkItem) -> Result<(), ActionError> {
    if item.title.trim().is_empty() {
        return Err(ActionError::EmptyTitle);
    }
    if let Some(rule) = &item.recurrence {
        if rule.interval == 0 {
            return Err(ActionError::ZeroInterval);
        }
        validate_days(&rule.selected_days)?;
    }
    Ok(())
}

pub fn validate_habit(habit: &Habit) -> Result<(), ActionError> {
    if habit.name.trim().is_empty() {
        return Err(ActionError::EmptyHabitName);
    }
    validate_days(&habit.selected_days)?;
    if habit.frequency != HabitFrequency::Daily && habit.selected_days.is_empty() {
        return Err(ActionError::NoDaysSelected(habit.name.clone()));
    }
    Ok(())
}

pub fn validate_milestone(milestone: &Milestone) -> Result<(), ActionError> {
    if milestone.title.trim().is_empty() {
        return Err(ActionError::EmptyTitle);
    }
    validate_progress(milestone.progress)
}

pub fn validate_progress(progress: i32) -> Result<(), ActionError> {
    if (0..=100).contains(&progress) {
        Ok(())
    } else {
        Err(ActionError::ProgressOutOfRange(progress))
    }
}

fn validate_days(days: &[String]) -> Result<(), ActionError> {
    match days.iter().find(|day| parse_weekday_name(day).is_none()) {
        Some(bad) => Err(ActionError::UnknownWeekday(bad.clone())),
        None => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::{Action, ActionError, validate_habit, validate_progress};
    use crate::model::{
        EntityId, Frequency, Habit, HabitFrequency, RecurrenceDescriptor, WorkItem,
    };

    #[test]
    fn blank_titles_are_rejected() {
        let action = Action::Create {
            item: WorkItem::new(EntityId::temporary(), "   "),
        };
        assert_eq!(action.validate(), Err(ActionError::EmptyTitle));
    }

    #[test]
    fn zero_interval_is_rejected() {
        let mut item = WorkItem::new(EntityId::new("a"), "stretch");
        let mut rule = RecurrenceDescriptor::every(Frequency::Daily);
        rule.interval = 0;
        item.recurrence = Some(rule);
        assert_eq!(
            Action::Update { item }.validate(),
            Err(ActionError::ZeroInterval)
        );
    }

    #[test]
    fn weekly_habit_needs_valid_days() {
        let mut habit = Habit::new(EntityId::new("h"), "gym", HabitFrequency::Weekly);
        assert!(matches!(
            validate_habit(&habit),
            Err(ActionError::NoDaysSelected(_))
        ));
        habit.selected_days = vec!["funday".into()];
        assert_eq!(
            validate_habit(&habit),
            Err(ActionError::UnknownWeekday("funday".into()))
        );
        habit.selected_days = vec!["monday".into(), "fri".into()];
        assert_eq!(validate_habit(&habit), Ok(()));
    }

    #[test]
    fn progress_range() {
        assert!(validate_progress(0).is_ok());
        assert!(validate_progress(100).is_ok());
        assert!(validate_progress(55).is_ok());
        assert_eq!(validate_progress(101), Err(ActionError::ProgressOutOfRange(101)));
        assert_eq!(validate_progress(-1), Err(ActionError::ProgressOutOfRange(-1)));
    }

    #[test]
    fn actions_carry_a_discriminant() {
        let action = Action::Delete {
            id: EntityId::new("7"),
        };
        let json = serde_json::to_value(&action).expect("serialize action");
        assert_eq!(json["kind"], "delete");
        assert_eq!(json["id"], "7");
    }
}
