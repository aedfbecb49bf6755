use std::collections::BTreeSet;

use anyhow::anyhow;
use tracing::{
  info,
  instrument
};

use super::{
  Session,
  resolve_id
};
use crate::actions::ActionError;
use crate::api::PlannerApi;
use crate::cli::{
  AreaCommand,
  HabitCommand,
  MilestoneCommand
};
use crate::habits::{
  HabitBoard,
  current_streak,
  habits_for_day
};
use crate::milestones::{
  self,
  milestones_for_area
};
use crate::model::{
  Area,
  EntityId,
  Habit,
  Milestone
};

#[instrument(skip(session, cmd))]
pub(super) fn cmd_habit(
  session: &mut Session<'_>,
  cmd: HabitCommand
) -> anyhow::Result<()> {
  let mut board =
    HabitBoard::watch(&session.bus);
  board.refresh(&*session.store)?;

  match cmd {
    | HabitCommand::Add {
      name,
      frequency,
      days,
      area,
      reminder
    } => {
      info!("command habit add");
      let mut habit = Habit::new(
        EntityId::temporary(),
        name.join(" "),
        frequency.into()
      );
      habit.selected_days = days;
      habit.area_id =
        area.map(EntityId::new);
      habit.reminder_time = reminder;

      let created = board.create(
        &mut *session.store,
        habit
      )?;
      println!(
        "Created habit {}.",
        created.id
      );
    }
    | HabitCommand::Check { id, on } => {
      info!("command habit check");
      let day =
        session.date_or_today(on.as_deref())?;
      let ids: Vec<EntityId> = board
        .habits()
        .iter()
        .map(|habit| habit.id.clone())
        .collect();
      let id =
        resolve_id(&ids, &id, "habit")?;
      let habit = board.check(
        &mut *session.store,
        &id,
        day
      )?;
      println!(
        "Checked '{}' for {day}; streak \
         {}.",
        habit.name,
        current_streak(&habit, day)
      );
    }
    | HabitCommand::List { on } => {
      info!("command habit list");
      let day =
        session.date_or_today(on.as_deref())?;
      let scheduled =
        habits_for_day(board.habits(), day);
      session
        .renderer
        .print_habits(&scheduled, day)?;
    }
  }
  Ok(())
}

#[instrument(skip(session, cmd))]
pub(super) fn cmd_milestone(
  session: &mut Session<'_>,
  cmd: MilestoneCommand
) -> anyhow::Result<()> {
  let store = &mut *session.store;
  match cmd {
    | MilestoneCommand::Add {
      area,
      title,
      description,
      progress
    } => {
      info!("command milestone add");
      let areas = store.list_areas()?;
      let area_ids: Vec<EntityId> = areas
        .into_iter()
        .map(|area| area.id)
        .collect();
      let area_id = resolve_id(
        &area_ids, &area, "area"
      )?;

      let mut milestone = Milestone::new(
        EntityId::temporary(),
        area_id,
        title.join(" ")
      );
      milestone.description = description;
      milestone.progress = progress;

      let created = milestones::create(
        store, &milestone
      )?;
      println!(
        "Created milestone {}.",
        created.id
      );
    }
    | MilestoneCommand::Progress {
      id,
      percent
    } => {
      info!("command milestone progress");
      let id =
        resolve_milestone(&*store, &id)?;
      let updated = milestones::set_progress(
        store, &id, percent
      )?;
      println!(
        "'{}' is at {}%.",
        updated.title, updated.progress
      );
    }
    | MilestoneCommand::Complete { id } => {
      info!("command milestone complete");
      let id =
        resolve_milestone(&*store, &id)?;
      let done =
        milestones::complete(store, &id)?;
      println!(
        "Completed milestone '{}'.",
        done.title
      );
    }
    | MilestoneCommand::List { area } => {
      info!("command milestone list");
      let all = store.list_milestones(None)?;
      let areas: Vec<EntityId> = match area
      {
        | Some(raw) => {
          let known: BTreeSet<EntityId> =
            store
              .list_areas()?
              .into_iter()
              .map(|area| area.id)
              .chain(
                all
                  .iter()
                  .map(|m| m.area_id.clone())
              )
              .collect();
          vec![resolve_id(
            &known, &raw, "area"
          )?]
        }
        | None => all
          .iter()
          .map(|m| m.area_id.clone())
          .collect::<BTreeSet<_>>()
          .into_iter()
          .collect()
      };

      let ordered: Vec<&Milestone> = areas
        .iter()
        .flat_map(|area| {
          milestones_for_area(&all, area)
        })
        .collect();
      session
        .renderer
        .print_milestones(&ordered)?;
    }
  }
  Ok(())
}

fn resolve_milestone<A: PlannerApi>(
  api: &A,
  raw: &str
) -> anyhow::Result<EntityId> {
  let ids: Vec<EntityId> = api
    .list_milestones(None)?
    .into_iter()
    .map(|m| m.id)
    .collect();
  resolve_id(&ids, raw, "milestone")
}

#[instrument(skip(session, cmd))]
pub(super) fn cmd_area(
  session: &mut Session<'_>,
  cmd: AreaCommand
) -> anyhow::Result<()> {
  let store = &mut *session.store;
  match cmd {
    | AreaCommand::Add {
      name,
      color,
      icon
    } => {
      info!("command area add");
      let name = name.join(" ");
      if name.trim().is_empty() {
        return Err(
          ActionError::EmptyAreaName.into()
        );
      }
      let mut area = Area::new(
        EntityId::temporary(),
        name
      );
      area.color = color;
      area.icon = icon;
      let created =
        store.create_area(&area)?;
      println!(
        "Created area {}.",
        created.id
      );
    }
    | AreaCommand::List => {
      info!("command area list");
      let mut areas = store.list_areas()?;
      areas.sort_by(|a, b| {
        a.name.cmp(&b.name)
      });
      session
        .renderer
        .print_areas(&areas)?;
    }
    | AreaCommand::Delete {
      id,
      with_related
    } => {
      info!("command area delete");
      let ids: Vec<EntityId> = store
        .list_areas()?
        .into_iter()
        .map(|area| area.id)
        .collect();
      let id = resolve_id(&ids, &id, "area")
        .map_err(|err| {
          anyhow!("{err}; see `cadence area list`")
        })?;
      let removed =
        store.delete_area(&id, with_related)?;
      println!(
        "Deleted area '{}'.",
        removed.name
      );
    }
  }
  Ok(())
}
