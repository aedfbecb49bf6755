use std::cmp::Ordering;

use tracing::info;

use crate::actions::{ActionError, validate_milestone, validate_progress};
use crate::api::PlannerApi;
use crate::feed::MutationError;
use crate::model::{EntityId, Milestone};

impl Milestone {
    /// A copy carrying `progress`, which must be a percentage.
    pub fn with_progress(&self, progress: i32) -> Result<Self, ActionError> {
        validate_progress(progress)?;
        Ok(Self {
            progress,
            ..self.clone()
        })
    }
}

/// Dated milestones first in date order, then undated ones; title breaks
/// ties.
fn by_date_then_title(a: &Milestone, b: &Milestone) -> Ordering {
    let dated = match (a.completed_date, b.completed_date) {
        (Some(x), Some(y)) => x.cmp(&y),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => Ordering::Equal,
    };
    dated.then_with(|| a.title.cmp(&b.title))
}

pub fn milestones_for_area<'a>(milestones: &'a [Milestone], area: &EntityId) -> Vec<&'a Milestone> {
    let mut out: Vec<&Milestone> = milestones.iter().filter(|m| &m.area_id == area).collect();
    out.sort_by(|a, b| by_date_then_title(a, b));
    out
}

#[tracing::instrument(skip(api, milestone), fields(title = %milestone.title))]
pub fn create<A: PlannerApi>(api: &mut A, milestone: &Milestone) -> Result<Milestone, MutationError> {
    validate_milestone(milestone)?;
    Ok(api.create_milestone(milestone)?)
}

#[tracing::instrument(skip(api))]
pub fn set_progress<A: PlannerApi>(
    api: &mut A,
    id: &EntityId,
    progress: i32,
) -> Result<Milestone, MutationError> {
    validate_progress(progress)?;
    let current = api
        .list_milestones(None)?
        .into_iter()
        .find(|m| &m.id == id)
        .ok_or_else(|| ActionError::UnknownItem(id.clone()))?;
    let updated = api.update_milestone(&current.with_progress(progress)?)?;
    info!(progress, "milestone progress updated");
    Ok(updated)
}

/// Completing removes the milestone from the server.
#[tracing::instrument(skip(api))]
pub fn complete<A: PlannerApi>(api: &mut A, id: &EntityId) -> Result<Milestone, MutationError> {
    Ok(api.complete_milestone(id)?)
}
