use anyhow::anyhow;
use tracing::{
  debug,
  info,
  instrument
};

use super::{
  Session,
  resolve_id
};
use crate::actions::Action;
use crate::cli::{
  AddArgs,
  EditArgs
};
use crate::feed::{
  FeedKind,
  FeedView
};
use crate::model::{
  EntityId,
  RecurrenceDescriptor,
  WorkItem
};
use crate::recurrence::effective_date;

fn find_step(
  view: &FeedView,
  raw: &str
) -> anyhow::Result<WorkItem> {
  let ids: Vec<EntityId> = view
    .with_engine(|engine| {
      engine
        .items()
        .iter()
        .map(|item| item.id.clone())
        .collect()
    });
  let id =
    resolve_id(&ids, raw, "step")?;
  view.get(&id).ok_or_else(|| {
    anyhow!("step {id} disappeared")
  })
}

#[instrument(skip(session, args))]
pub(super) fn cmd_add(
  session: &mut Session<'_>,
  args: AddArgs
) -> anyhow::Result<()> {
  info!("command add");

  let mut item = WorkItem::new(
    EntityId::temporary(),
    args.title.join(" ")
  );
  item.scheduled_date = args
    .date
    .as_deref()
    .map(|raw| {
      super::parse_date(
        raw,
        session.today
      )
    })
    .transpose()?;
  item.is_important = args.important;
  item.is_urgent = args.urgent;
  item.area_id =
    args.area.map(EntityId::new);
  item.goal_id =
    args.goal.map(EntityId::new);

  if let Some(repeat) = args.repeat {
    let mut rule =
      RecurrenceDescriptor::every(
        repeat.into()
      );
    rule.interval = args.every;
    rule.selected_days = args.days;
    item.current_instance_date =
      Some(
        item
          .scheduled_date
          .unwrap_or(session.today)
      );
    item.scheduled_date =
      item.current_instance_date;
    item.recurrence = Some(rule);
  }

  let mut view = session
    .mount_feed("add", FeedKind::All)?;
  let created = view
    .perform(
      &mut *session.store,
      Action::Create { item }
    )?
    .ok_or_else(|| {
      anyhow!(
        "server did not return the \
         created step"
      )
    })?;

  println!(
    "Created step {}.",
    created.id
  );
  Ok(())
}

#[instrument(skip(session))]
pub(super) fn cmd_done(
  session: &mut Session<'_>,
  raw_id: &str,
  on: Option<&str>
) -> anyhow::Result<()> {
  info!("command done");

  let on = session.date_or_today(on)?;
  let mut view = session
    .mount_feed("done", FeedKind::All)?;
  let item = find_step(&view, raw_id)?;
  let confirmed = view.perform(
    &mut *session.store,
    Action::Complete {
      id: item.id.clone(),
      on
    }
  )?;

  match confirmed.as_ref().and_then(
    |step| {
      step
        .is_recurring()
        .then(|| effective_date(step))
        .flatten()
    }
  ) {
    | Some(next) => println!(
      "Completed '{}'; next on {next}.",
      item.title
    ),
    | None => println!(
      "Completed '{}'.",
      item.title
    )
  }
  Ok(())
}

#[instrument(skip(session))]
pub(super) fn cmd_delete(
  session: &mut Session<'_>,
  raw_id: &str
) -> anyhow::Result<()> {
  info!("command delete");

  let mut view = session
    .mount_feed("delete", FeedKind::All)?;
  let item = find_step(&view, raw_id)?;
  view.perform(
    &mut *session.store,
    Action::Delete {
      id: item.id.clone()
    }
  )?;

  println!("Deleted '{}'.", item.title);
  Ok(())
}

#[instrument(skip(session, args))]
pub(super) fn cmd_edit(
  session: &mut Session<'_>,
  args: EditArgs
) -> anyhow::Result<()> {
  info!("command edit");

  let mut view = session
    .mount_feed("edit", FeedKind::All)?;
  let mut item =
    find_step(&view, &args.id)?;

  if let Some(title) = args.title {
    item.title = title;
  }
  if args.clear_date {
    item.scheduled_date = None;
  }
  if let Some(raw) = args.date.as_deref()
  {
    let date = super::parse_date(
      raw,
      session.today
    )?;
    item.scheduled_date = Some(date);
    if item.is_recurring() {
      item.current_instance_date =
        Some(date);
    }
  }
  if let Some(important) =
    args.important
  {
    item.is_important = important;
  }
  if let Some(urgent) = args.urgent {
    item.is_urgent = urgent;
  }

  let title = item.title.clone();
  view.perform(
    &mut *session.store,
    Action::Update { item }
  )?;
  println!("Updated '{title}'.");
  Ok(())
}

#[instrument(skip(session))]
pub(super) fn cmd_feed(
  session: &mut Session<'_>,
  kind: FeedKind,
  pages: usize
) -> anyhow::Result<()> {
  info!(?kind, "command feed");

  let mut view =
    session.mount_feed("feed", kind)?;
  for _ in 1..pages.max(1) {
    view.reveal_more();
  }

  let total = view.items().len();
  let visible = view.visible();
  debug!(
    total,
    shown = visible.len(),
    "rendering feed"
  );
  session.renderer.print_feed(
    &visible,
    total,
    session.today
  )
}
