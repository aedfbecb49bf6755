mod planning;
mod steps;

use anyhow::anyhow;
use chrono::{DateTime, Utc};
use tracing::{debug, instrument};

use crate::bus::Bus;
use crate::cli::Command;
use crate::config::Config;
use crate::datastore::DataStore;
use crate::datetime::{CanonicalDate, normalize_at};
use crate::feed::{FeedKind, FeedSettings, FeedView, FetchOutcome};
use crate::model::EntityId;
use crate::render::Renderer;

/// What every command handler gets to work with.
pub struct Session<'a> {
    pub store: &'a mut DataStore,
    pub renderer: &'a Renderer,
    pub bus: Bus,
    pub settings: FeedSettings,
    pub today: CanonicalDate,
    pub now: DateTime<Utc>,
}

impl Session<'_> {
    /// Mounts a feed and loads it from the store.
    pub fn mount_feed(&mut self, name: &str, kind: FeedKind) -> anyhow::Result<FeedView> {
        let mut view = FeedView::mount(name, kind, &self.bus, self.settings, self.today);
        match view.refresh(&*self.store, self.now) {
            FetchOutcome::Failed(err) => Err(anyhow!(err).context("failed to load steps")),
            FetchOutcome::Applied(outcome) => {
                debug!(
                    size = view.len(),
                    decode_failures = outcome.decode_failures,
                    "feed loaded"
                );
                Ok(view)
            }
            FetchOutcome::Stale | FetchOutcome::Discarded => Ok(view),
        }
    }

    pub fn date_or_today(&self, raw: Option<&str>) -> anyhow::Result<CanonicalDate> {
        match raw {
            None => Ok(self.today),
            Some(raw) => parse_date(raw, self.today),
        }
    }
}

pub fn parse_date(raw: &str, today: CanonicalDate) -> anyhow::Result<CanonicalDate> {
    normalize_at(raw, today).ok_or_else(|| anyhow!("unrecognised date: {raw}"))
}

/// Resolves `raw` to an id: an exact match, or else the single id it is a
/// prefix of.
pub fn resolve_id<'a>(
    ids: impl IntoIterator<Item = &'a EntityId>,
    raw: &str,
    entity: &str,
) -> anyhow::Result<EntityId> {
    let raw = raw.trim();
    let mut matches = Vec::new();
    for id in ids {
        if id.as_str() == raw {
            return Ok(id.clone());
        }
        if id.as_str().starts_with(raw) {
            matches.push(id);
        }
    }

    match matches.as_slice() {
        [] => Err(anyhow!("no {entity} matches {raw}")),
        [only] => Ok((*only).clone()),
        many => Err(anyhow!("{raw} is ambiguous: {} {entity}s match", many.len())),
    }
}

#[instrument(skip_all)]
pub fn dispatch(
    store: &mut DataStore,
    cfg: &Config,
    renderer: &Renderer,
    command: Option<Command>,
) -> anyhow::Result<()> {
    let mut session = Session {
        store,
        renderer,
        bus: Bus::new(),
        settings: FeedSettings::from_config(cfg),
        today: CanonicalDate::today(),
        now: Utc::now(),
    };

    let command = command.unwrap_or(Command::Today);
    debug!(?command, today = %session.today, "dispatching");

    match command {
        Command::Add(args) => steps::cmd_add(&mut session, args),
        Command::Done { id, on } => steps::cmd_done(&mut session, &id, on.as_deref()),
        Command::Delete { id } => steps::cmd_delete(&mut session, &id),
        Command::Edit(args) => steps::cmd_edit(&mut session, args),
        Command::Today => steps::cmd_feed(&mut session, FeedKind::Today, 1),
        Command::Upcoming { pages } => steps::cmd_feed(&mut session, FeedKind::Upcoming, pages),
        Command::Habit(cmd) => planning::cmd_habit(&mut session, cmd),
        Command::Milestone(cmd) => planning::cmd_milestone(&mut session, cmd),
        Command::Area(cmd) => planning::cmd_area(&mut session, cmd),
    }
}

#[cfg(test)]
mod tests {
    use super::{parse_date, resolve_id};
    use crate::datetime::CanonicalDate;
    use crate::model::EntityId;

    #[test]
    fn ids_resolve_by_unique_prefix() {
        let ids = vec![
            EntityId::new("a1b2"),
            EntityId::new("a1c3"),
            EntityId::new("ff00"),
        ];
        assert_eq!(resolve_id(&ids, "ff", "step").expect("unique"), EntityId::new("ff00"));
        assert_eq!(resolve_id(&ids, "a1c", "step").expect("unique"), EntityId::new("a1c3"));
        assert!(resolve_id(&ids, "a1", "step").is_err());
        assert!(resolve_id(&ids, "zz", "step").is_err());
    }

    #[test]
    fn exact_match_beats_prefix() {
        let ids = vec![EntityId::new("7"), EntityId::new("70")];
        assert_eq!(resolve_id(&ids, "7", "step").expect("exact"), EntityId::new("7"));
    }

    #[test]
    fn dates_accept_keywords() {
        let today = CanonicalDate::from_ymd(2026, 10, 16).expect("valid date");
        assert_eq!(
            parse_date("tomorrow", today).expect("keyword"),
            CanonicalDate::from_ymd(2026, 10, 17).expect("valid date")
        );
        assert!(parse_date("next-ish", today).is_err());
    }
}
