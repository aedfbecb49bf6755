//! The request/response surface of the planner server. List calls return
//! authoritative snapshots; mutation calls return the entity as the server
//! stored it.

use serde::{Deserialize, Serialize};

use crate::datetime::CanonicalDate;
use crate::model::{Area, EntityId, Habit, Milestone, WorkItem};
use crate::recurrence::effective_date;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ApiError {
    /// The request never produced a response.
    #[error("transport failure: {0}")]
    Transport(String),

    /// The server answered with a non-2xx status.
    #[error("server returned status {status}: {message}")]
    Status { status: u16, message: String },

    #[error("{entity} {id} not found")]
    NotFound { entity: &'static str, id: EntityId },

    #[error("could not decode response: {0}")]
    Decode(String),
}

impl ApiError {
    pub fn not_found(entity: &'static str, id: &EntityId) -> Self {
        Self::NotFound {
            entity,
            id: id.clone(),
        }
    }

    /// Failures worth retrying later; everything else will fail again.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Transport(_) => true,
            Self::Status { status, .. } => *status >= 500,
            Self::NotFound { .. } | Self::Decode(_) => false,
        }
    }
}

/// Filters for the step list endpoint.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StepQuery {
    #[serde(default)]
    pub from: Option<CanonicalDate>,

    #[serde(default)]
    pub to: Option<CanonicalDate>,

    #[serde(default)]
    pub area_id: Option<EntityId>,

    #[serde(default)]
    pub goal_id: Option<EntityId>,
}

impl StepQuery {
    pub fn until(to: CanonicalDate) -> Self {
        Self {
            to: Some(to),
            ..Self::default()
        }
    }

    /// A date bound excludes undated items.
    pub fn matches(&self, item: &WorkItem) -> bool {
        if self.area_id.is_some() && item.area_id != self.area_id {
            return false;
        }
        if self.goal_id.is_some() && item.goal_id != self.goal_id {
            return false;
        }
        if self.from.is_none() && self.to.is_none() {
            return true;
        }
        let Some(date) = effective_date(item) else {
            return false;
        };
        self.from.is_none_or(|from| date >= from) && self.to.is_none_or(|to| date <= to)
    }
}

pub trait PlannerApi {
    fn list_steps(&self, query: &StepQuery) -> Result<Vec<WorkItem>, ApiError>;
    fn create_step(&mut self, item: &WorkItem) -> Result<WorkItem, ApiError>;
    fn update_step(&mut self, item: &WorkItem) -> Result<WorkItem, ApiError>;
    fn delete_step(&mut self, id: &EntityId) -> Result<WorkItem, ApiError>;

    fn list_habits(&self) -> Result<Vec<Habit>, ApiError>;
    fn create_habit(&mut self, habit: &Habit) -> Result<Habit, ApiError>;
    fn update_habit(&mut self, habit: &Habit) -> Result<Habit, ApiError>;
    fn delete_habit(&mut self, id: &EntityId) -> Result<Habit, ApiError>;
    fn mark_habit_complete(&mut self, id: &EntityId, date: CanonicalDate)
    -> Result<Habit, ApiError>;

    fn list_milestones(&self, area: Option<&EntityId>) -> Result<Vec<Milestone>, ApiError>;
    fn create_milestone(&mut self, milestone: &Milestone) -> Result<Milestone, ApiError>;
    fn update_milestone(&mut self, milestone: &Milestone) -> Result<Milestone, ApiError>;
    fn delete_milestone(&mut self, id: &EntityId) -> Result<Milestone, ApiError>;
    /// Completing a milestone removes it.
    fn complete_milestone(&mut self, id: &EntityId) -> Result<Milestone, ApiError>;

    fn list_areas(&self) -> Result<Vec<Area>, ApiError>;
    fn create_area(&mut self, area: &Area) -> Result<Area, ApiError>;
    fn update_area(&mut self, area: &Area) -> Result<Area, ApiError>;
    /// Children are detached unless `with_related` is set, in which case
    /// they are deleted with the area.
    fn delete_area(&mut self, id: &EntityId, with_related: bool) -> Result<Area, ApiError>;
}

#[cfg(test)]
mod tests {
    use super::{ApiError, StepQuery};
    use crate::datetime::CanonicalDate;
    use crate::model::{EntityId, WorkItem};

    fn day(d: u32) -> CanonicalDate {
        CanonicalDate::from_ymd(2026, 10, d).expect("valid date")
    }

    #[test]
    fn date_range_filters_on_effective_date() {
        let query = StepQuery {
            from: Some(day(10)),
            to: Some(day(20)),
            ..StepQuery::default()
        };
        let mut inside = WorkItem::new(EntityId::new("1"), "in");
        inside.scheduled_date = Some(day(15));
        let mut outside = WorkItem::new(EntityId::new("2"), "out");
        outside.scheduled_date = Some(day(21));
        let undated = WorkItem::new(EntityId::new("3"), "undated");

        assert!(query.matches(&inside));
        assert!(!query.matches(&outside));
        assert!(!query.matches(&undated));
        assert!(StepQuery::default().matches(&undated));
    }

    #[test]
    fn area_filter() {
        let query = StepQuery {
            area_id: Some(EntityId::new("home")),
            ..StepQuery::default()
        };
        let mut item = WorkItem::new(EntityId::new("1"), "dishes");
        assert!(!query.matches(&item));
        item.area_id = Some(EntityId::new("home"));
        assert!(query.matches(&item));
    }

    #[test]
    fn transient_classification() {
        assert!(ApiError::Transport("reset".into()).is_transient());
        assert!(
            ApiError::Status {
                status: 503,
                message: "busy".into()
            }
            .is_transient()
        );
        assert!(
            !ApiError::Status {
                status: 422,
                message: "bad".into()
            }
            .is_transient()
        );
    }
}
