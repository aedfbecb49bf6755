use std::fs;
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, anyhow};
use chrono::Utc;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tempfile::NamedTempFile;
use tracing::{debug, info};

use crate::api::{ApiError, PlannerApi, StepQuery};
use crate::datetime::CanonicalDate;
use crate::habits;
use crate::model::{Area, EntityId, Habit, Milestone, WorkItem};

/// A file-backed planner server: one JSON document per line, one file per
/// entity kind, every write replacing the file atomically.
#[derive(Debug)]
pub struct DataStore {
    pub data_dir: PathBuf,
    pub steps_path: PathBuf,
    pub habits_path: PathBuf,
    pub milestones_path: PathBuf,
    pub areas_path: PathBuf,
}

impl DataStore {
    #[tracing::instrument(skip(data_dir))]
    pub fn open(data_dir: &Path) -> anyhow::Result<Self> {
        let data_dir = data_dir.to_path_buf();
        fs::create_dir_all(&data_dir)
            .with_context(|| format!("failed to create {}", data_dir.display()))?;

        let steps_path = data_dir.join("steps.data");
        let habits_path = data_dir.join("habits.data");
        let milestones_path = data_dir.join("milestones.data");
        let areas_path = data_dir.join("areas.data");

        for path in [&steps_path, &habits_path, &milestones_path, &areas_path] {
            if !path.exists() {
                fs::write(path, "")
                    .with_context(|| format!("failed to create {}", path.display()))?;
            }
        }

        info!(data_dir = %data_dir.display(), "opened datastore");

        Ok(Self {
            data_dir,
            steps_path,
            habits_path,
            milestones_path,
            areas_path,
        })
    }

    pub fn load_steps(&self) -> anyhow::Result<Vec<WorkItem>> {
        load_jsonl(&self.steps_path).context("failed to load steps.data")
    }

    pub fn load_habits(&self) -> anyhow::Result<Vec<Habit>> {
        load_jsonl(&self.habits_path).context("failed to load habits.data")
    }

    pub fn load_milestones(&self) -> anyhow::Result<Vec<Milestone>> {
        load_jsonl(&self.milestones_path).context("failed to load milestones.data")
    }

    pub fn load_areas(&self) -> anyhow::Result<Vec<Area>> {
        load_jsonl(&self.areas_path).context("failed to load areas.data")
    }

    /// Loads `path`, lets `edit` change the records, then writes them back.
    /// Nothing is written when `edit` fails.
    fn mutate<T, R>(
        &self,
        path: &Path,
        edit: impl FnOnce(&mut Vec<T>) -> Result<R, ApiError>,
    ) -> Result<R, ApiError>
    where
        T: Serialize + DeserializeOwned,
    {
        let mut records: Vec<T> = load_jsonl(path).map_err(transport)?;
        let result = edit(&mut records)?;
        save_jsonl_atomic(path, &records).map_err(transport)?;
        Ok(result)
    }
}

fn transport(err: anyhow::Error) -> ApiError {
    ApiError::Transport(format!("{err:#}"))
}

/// Ids the client made up are replaced with permanent ones.
fn assign_id(id: &EntityId) -> EntityId {
    if id.is_temporary() || id.as_str().is_empty() {
        EntityId::generate()
    } else {
        id.clone()
    }
}

fn replace_by_id<T: Clone>(
    records: &mut [T],
    entity: &'static str,
    value: &T,
    id_of: impl Fn(&T) -> &EntityId,
) -> Result<T, ApiError> {
    let id = id_of(value);
    let slot = records
        .iter_mut()
        .find(|record| id_of(record) == id)
        .ok_or_else(|| ApiError::not_found(entity, id))?;
    *slot = value.clone();
    Ok(value.clone())
}

fn remove_by_id<T>(
    records: &mut Vec<T>,
    entity: &'static str,
    id: &EntityId,
    id_of: impl Fn(&T) -> &EntityId,
) -> Result<T, ApiError> {
    let pos = records
        .iter()
        .position(|record| id_of(record) == id)
        .ok_or_else(|| ApiError::not_found(entity, id))?;
    Ok(records.remove(pos))
}

impl PlannerApi for DataStore {
    #[tracing::instrument(skip(self))]
    fn list_steps(&self, query: &StepQuery) -> Result<Vec<WorkItem>, ApiError> {
        let steps = self.load_steps().map_err(transport)?;
        Ok(steps.into_iter().filter(|item| query.matches(item)).collect())
    }

    #[tracing::instrument(skip(self, item), fields(title = %item.title))]
    fn create_step(&mut self, item: &WorkItem) -> Result<WorkItem, ApiError> {
        let mut created = item.clone();
        created.id = assign_id(&item.id);
        self.mutate(&self.steps_path, |steps: &mut Vec<WorkItem>| {
            steps.push(created.clone());
            Ok(created)
        })
    }

    #[tracing::instrument(skip(self, item), fields(id = %item.id))]
    fn update_step(&mut self, item: &WorkItem) -> Result<WorkItem, ApiError> {
        self.mutate(&self.steps_path, |steps: &mut Vec<WorkItem>| {
            replace_by_id(steps, "step", item, |s| &s.id)
        })
    }

    #[tracing::instrument(skip(self))]
    fn delete_step(&mut self, id: &EntityId) -> Result<WorkItem, ApiError> {
        self.mutate(&self.steps_path, |steps: &mut Vec<WorkItem>| {
            remove_by_id(steps, "step", id, |s| &s.id)
        })
    }

    fn list_habits(&self) -> Result<Vec<Habit>, ApiError> {
        self.load_habits().map_err(transport)
    }

    #[tracing::instrument(skip(self, habit), fields(name = %habit.name))]
    fn create_habit(&mut self, habit: &Habit) -> Result<Habit, ApiError> {
        let mut created = habit.clone();
        created.id = assign_id(&habit.id);
        self.mutate(&self.habits_path, |habits: &mut Vec<Habit>| {
            habits.push(created.clone());
            Ok(created)
        })
    }

    #[tracing::instrument(skip(self, habit), fields(id = %habit.id))]
    fn update_habit(&mut self, habit: &Habit) -> Result<Habit, ApiError> {
        self.mutate(&self.habits_path, |habits: &mut Vec<Habit>| {
            replace_by_id(habits, "habit", habit, |h| &h.id)
        })
    }

    #[tracing::instrument(skip(self))]
    fn delete_habit(&mut self, id: &EntityId) -> Result<Habit, ApiError> {
        self.mutate(&self.habits_path, |habits: &mut Vec<Habit>| {
            remove_by_id(habits, "habit", id, |h| &h.id)
        })
    }

    #[tracing::instrument(skip(self))]
    fn mark_habit_complete(&mut self, id: &EntityId, date: CanonicalDate) -> Result<Habit, ApiError> {
        self.mutate(&self.habits_path, |records: &mut Vec<Habit>| {
            let habit = records
                .iter_mut()
                .find(|habit| &habit.id == id)
                .ok_or_else(|| ApiError::not_found("habit", id))?;
            if !habits::mark_complete(habit, date) {
                debug!("completion already recorded");
            }
            Ok(habit.clone())
        })
    }

    fn list_milestones(&self, area: Option<&EntityId>) -> Result<Vec<Milestone>, ApiError> {
        let milestones = self.load_milestones().map_err(transport)?;
        Ok(milestones
            .into_iter()
            .filter(|m| area.is_none_or(|area| &m.area_id == area))
            .collect())
    }

    #[tracing::instrument(skip(self, milestone), fields(title = %milestone.title))]
    fn create_milestone(&mut self, milestone: &Milestone) -> Result<Milestone, ApiError> {
        let now = Utc::now();
        let mut created = milestone.clone();
        created.id = assign_id(&milestone.id);
        created.created_at = Some(now);
        created.updated_at = Some(now);
        self.mutate(&self.milestones_path, |milestones: &mut Vec<Milestone>| {
            milestones.push(created.clone());
            Ok(created)
        })
    }

    #[tracing::instrument(skip(self, milestone), fields(id = %milestone.id))]
    fn update_milestone(&mut self, milestone: &Milestone) -> Result<Milestone, ApiError> {
        let mut updated = milestone.clone();
        updated.updated_at = Some(Utc::now());
        self.mutate(&self.milestones_path, |milestones: &mut Vec<Milestone>| {
            replace_by_id(milestones, "milestone", &updated, |m| &m.id)
        })
    }

    #[tracing::instrument(skip(self))]
    fn delete_milestone(&mut self, id: &EntityId) -> Result<Milestone, ApiError> {
        self.mutate(&self.milestones_path, |milestones: &mut Vec<Milestone>| {
            remove_by_id(milestones, "milestone", id, |m| &m.id)
        })
    }

    #[tracing::instrument(skip(self))]
    fn complete_milestone(&mut self, id: &EntityId) -> Result<Milestone, ApiError> {
        let mut removed = self.delete_milestone(id)?;
        removed.completed_date = Some(CanonicalDate::today());
        removed.progress = 100;
        info!(title = %removed.title, "milestone completed");
        Ok(removed)
    }

    fn list_areas(&self) -> Result<Vec<Area>, ApiError> {
        self.load_areas().map_err(transport)
    }

    #[tracing::instrument(skip(self, area), fields(name = %area.name))]
    fn create_area(&mut self, area: &Area) -> Result<Area, ApiError> {
        let mut created = area.clone();
        created.id = assign_id(&area.id);
        self.mutate(&self.areas_path, |areas: &mut Vec<Area>| {
            areas.push(created.clone());
            Ok(created)
        })
    }

    #[tracing::instrument(skip(self, area), fields(id = %area.id))]
    fn update_area(&mut self, area: &Area) -> Result<Area, ApiError> {
        self.mutate(&self.areas_path, |areas: &mut Vec<Area>| {
            replace_by_id(areas, "area", area, |a| &a.id)
        })
    }

    #[tracing::instrument(skip(self))]
    fn delete_area(&mut self, id: &EntityId, with_related: bool) -> Result<Area, ApiError> {
        let removed = self.mutate(&self.areas_path, |areas: &mut Vec<Area>| {
            remove_by_id(areas, "area", id, |a| &a.id)
        })?;

        let in_area = |area_id: &Option<EntityId>| area_id.as_ref() == Some(id);

        let touched_steps = self.mutate(&self.steps_path, |steps: &mut Vec<WorkItem>| {
            let before = steps.len();
            if with_related {
                steps.retain(|step| !in_area(&step.area_id));
                return Ok(before - steps.len());
            }
            let mut detached = 0;
            for step in steps.iter_mut().filter(|step| in_area(&step.area_id)) {
                step.area_id = None;
                detached += 1;
            }
            Ok(detached)
        })?;

        let touched_habits = self.mutate(&self.habits_path, |habits: &mut Vec<Habit>| {
            let before = habits.len();
            if with_related {
                habits.retain(|habit| !in_area(&habit.area_id));
                return Ok(before - habits.len());
            }
            let mut detached = 0;
            for habit in habits.iter_mut().filter(|habit| in_area(&habit.area_id)) {
                habit.area_id = None;
                detached += 1;
            }
            Ok(detached)
        })?;

        // Milestones cannot exist without an area, so they only go away
        // with the related data.
        let mut removed_milestones = 0;
        if with_related {
            removed_milestones = self.mutate(&self.milestones_path, |milestones: &mut Vec<Milestone>| {
                let before = milestones.len();
                milestones.retain(|m| &m.area_id != id);
                Ok(before - milestones.len())
            })?;
        }

        info!(
            with_related,
            steps = touched_steps,
            habits = touched_habits,
            milestones = removed_milestones,
            "deleted area"
        );
        Ok(removed)
    }
}

#[tracing::instrument(skip(path))]
fn load_jsonl<T: DeserializeOwned>(path: &Path) -> anyhow::Result<Vec<T>> {
    debug!(file = %path.display(), "loading jsonl");
    let file = fs::File::open(path)?;
    let reader = BufReader::new(file);

    let mut out = Vec::new();
    for (idx, line) in reader.lines().enumerate() {
        let line = line?;
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }

        let record: T = serde_json::from_str(trimmed)
            .with_context(|| format!("failed parsing {} line {}", path.display(), idx + 1))?;
        out.push(record);
    }

    debug!(count = out.len(), "loaded records from jsonl");
    Ok(out)
}

#[tracing::instrument(skip(path, records))]
fn save_jsonl_atomic<T: Serialize>(path: &Path, records: &[T]) -> anyhow::Result<()> {
    debug!(file = %path.display(), count = records.len(), "saving jsonl atomically");

    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    let mut temp = NamedTempFile::new_in(dir)?;
    for record in records {
        let serialized = serde_json::to_string(record)?;
        writeln!(temp, "{serialized}")?;
    }
    temp.flush()?;

    temp.persist(path)
        .map_err(|err| anyhow!("failed to persist {}: {}", path.display(), err))?;

    Ok(())
}
