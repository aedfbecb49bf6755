//! A mounted feed: one reconciliation engine, a reveal window and a poller,
//! wired to the shared bus.
//!
//! Every mutation runs the same pipeline. The action is validated, applied
//! optimistically, announced on the bus, sent to the server, and finally
//! confirmed or rolled back (with a second announcement either way).

use std::cell::RefCell;
use std::rc::Rc;

use chrono::{DateTime, Duration, Utc};
use tracing::{debug, info, warn};

use crate::actions::{Action, ActionError};
use crate::api::{ApiError, PlannerApi, StepQuery};
use crate::bus::{Bus, BusEvent, Provenance, Subscription, Topic, WeakBus};
use crate::config::Config;
use crate::datetime::CanonicalDate;
use crate::model::{EntityId, WorkItem};
use crate::ordering;
use crate::poller::{Admission, DEFAULT_POLL_INTERVAL_SECS, FetchTicket, Poller};
use crate::reconcile::{MergeOutcome, ReconcileEngine};
use crate::window::{DEFAULT_INITIAL_REVEAL, DEFAULT_REVEAL_STEP, FeedWindow};

#[derive(Debug, thiserror::Error)]
pub enum MutationError {
    #[error(transparent)]
    Action(#[from] ActionError),

    #[error(transparent)]
    Api(#[from] ApiError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FeedKind {
    /// Overdue plus due today.
    Today,
    /// Overdue plus the next month.
    Upcoming,
    /// Every schedulable item, sorted.
    All,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FeedSettings {
    pub initial_reveal: usize,
    pub reveal_step: usize,
    pub poll_interval: Duration,
    /// Republish a neighbour's snapshot after merging it, if it changed
    /// anything here.
    pub relay: bool,
}

impl Default for FeedSettings {
    fn default() -> Self {
        Self {
            initial_reveal: DEFAULT_INITIAL_REVEAL,
            reveal_step: DEFAULT_REVEAL_STEP,
            poll_interval: Duration::seconds(DEFAULT_POLL_INTERVAL_SECS),
            relay: true,
        }
    }
}

impl FeedSettings {
    pub fn from_config(config: &Config) -> Self {
        let defaults = Self::default();
        Self {
            initial_reveal: config
                .get_usize("feed.initial")
                .unwrap_or(defaults.initial_reveal),
            reveal_step: config.get_usize("feed.step").unwrap_or(defaults.reveal_step),
            poll_interval: config
                .get_i64("poll.interval")
                .map(Duration::seconds)
                .unwrap_or(defaults.poll_interval),
            relay: config.get_bool("feed.relay").unwrap_or(defaults.relay),
        }
    }
}

#[derive(Debug)]
pub enum FetchOutcome {
    Applied(MergeOutcome),
    /// An older fetch resolved after a newer one was applied.
    Stale,
    /// The feed was unmounted while the fetch was in flight.
    Discarded,
    Failed(ApiError),
}

#[derive(Debug)]
struct FeedState {
    engine: ReconcileEngine,
    needs_refresh: bool,
}

#[derive(Debug)]
pub struct FeedView {
    name: Provenance,
    kind: FeedKind,
    today: CanonicalDate,
    bus: Bus,
    state: Rc<RefCell<FeedState>>,
    window: FeedWindow,
    poller: Poller,
    subscriptions: Vec<Subscription>,
}

fn publish_snapshot(bus: &Bus, name: &Provenance, items: Vec<WorkItem>) -> usize {
    bus.publish(BusEvent::WorkingSetChanged {
        items,
        source: Some(name.clone()),
    })
}

fn on_working_set(
    state: &Rc<RefCell<FeedState>>,
    relay: Option<(&WeakBus, &Provenance)>,
    items: &[WorkItem],
) {
    let (outcome, snapshot) = {
        let mut state = state.borrow_mut();
        let outcome = state.engine.apply_snapshot(items.to_vec());
        (outcome, state.engine.items().to_vec())
    };
    if !outcome.changed {
        return;
    }
    if let Some((weak, name)) = relay
        && let Some(bus) = weak.upgrade()
    {
        debug!(source = %name, "relaying merged working set");
        publish_snapshot(&bus, name, snapshot);
    }
}

fn on_actions_completed(state: &Rc<RefCell<FeedState>>, actions: &[Action]) {
    let mut state = state.borrow_mut();
    for action in actions {
        let target = action.target().clone();
        let applied = state.engine.apply_local(action.clone());
        match (applied, action) {
            (Err(err), _) => warn!(error = %err, id = %target, "could not mirror external action"),
            (Ok(()), Action::Delete { .. }) => {}
            (Ok(()), Action::Create { item } | Action::Update { item }) => {
                state.engine.confirm(&target, Some(item.clone()));
            }
            (Ok(()), Action::Complete { .. }) => state.engine.confirm(&target, None),
        }
    }
    // The server is the judge of what those actions really did.
    state.needs_refresh = true;
}

impl FeedView {
    /// Creates a view and subscribes it to the bus. `name` seeds the view's
    /// provenance; two mounted views never share one.
    pub fn mount(
        name: &str,
        kind: FeedKind,
        bus: &Bus,
        settings: FeedSettings,
        today: CanonicalDate,
    ) -> Self {
        let name = Provenance::unique(name);
        let state = Rc::new(RefCell::new(FeedState {
            engine: ReconcileEngine::new(),
            needs_refresh: true,
        }));

        let working = {
            let state = Rc::clone(&state);
            let weak = bus.downgrade();
            let me = name.clone();
            let relay = settings.relay;
            bus.subscribe(Topic::WorkingSetChanged, Some(name.clone()), move |event| {
                if let BusEvent::WorkingSetChanged { items, .. } = event {
                    on_working_set(&state, relay.then_some((&weak, &me)), items);
                }
            })
        };

        let completed = {
            let state = Rc::clone(&state);
            bus.subscribe(Topic::ActionsCompleted, Some(name.clone()), move |event| {
                if let BusEvent::ActionsCompleted { actions, .. } = event {
                    on_actions_completed(&state, actions);
                }
            })
        };

        info!(name = %name, ?kind, "mounted feed");
        Self {
            name,
            kind,
            today,
            bus: bus.clone(),
            state,
            window: FeedWindow::new(settings.initial_reveal, settings.reveal_step),
            poller: Poller::new(settings.poll_interval),
            subscriptions: vec![working, completed],
        }
    }

    pub fn name(&self) -> &Provenance {
        &self.name
    }

    pub fn kind(&self) -> FeedKind {
        self.kind
    }

    pub fn today(&self) -> CanonicalDate {
        self.today
    }

    /// Moves the view to a new calendar day; overdue status follows.
    pub fn set_today(&mut self, today: CanonicalDate) {
        self.today = today;
    }

    pub fn is_mounted(&self) -> bool {
        !self.poller.is_cancelled()
    }

    pub fn needs_refresh(&self) -> bool {
        self.state.borrow().needs_refresh
    }

    pub fn get(&self, id: &EntityId) -> Option<WorkItem> {
        self.state.borrow().engine.get(id).cloned()
    }

    pub fn len(&self) -> usize {
        self.state.borrow().engine.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state.borrow().engine.is_empty()
    }

    pub fn with_engine<R>(&self, read: impl FnOnce(&ReconcileEngine) -> R) -> R {
        read(&self.state.borrow().engine)
    }

    /// The feed, filtered for this view's kind and sorted.
    pub fn items(&self) -> Vec<WorkItem> {
        let state = self.state.borrow();
        let all = state.engine.items();
        match self.kind {
            FeedKind::Today => ordering::today_view(all, self.today),
            FeedKind::Upcoming => ordering::upcoming(all, self.today),
            FeedKind::All => {
                let schedulable: Vec<WorkItem> = all
                    .iter()
                    .filter(|item| item.is_schedulable())
                    .cloned()
                    .collect();
                ordering::order(&schedulable, self.today)
            }
        }
    }

    /// The rendered prefix of [`FeedView::items`].
    pub fn visible(&self) -> Vec<WorkItem> {
        self.window.slice(&self.items()).to_vec()
    }

    pub fn window(&self) -> FeedWindow {
        self.window
    }

    pub fn reveal_more(&mut self) -> usize {
        let total = self.items().len();
        self.window.on_sentinel_visible(total)
    }

    /// Whether the view should refetch now.
    pub fn poll_due(&self, now: DateTime<Utc>) -> bool {
        self.is_mounted() && (self.needs_refresh() || self.poller.poll_due(now))
    }

    pub fn begin_fetch(&mut self, now: DateTime<Utc>) -> Option<FetchTicket> {
        if !self.is_mounted() {
            return None;
        }
        Some(self.poller.issue(now))
    }

    /// Applies the response to a fetch issued by [`FeedView::begin_fetch`].
    /// Failures leave the working set untouched.
    #[tracing::instrument(skip(self, ticket, result), fields(feed = %self.name, seq = ticket.seq()))]
    pub fn finish_fetch(
        &mut self,
        ticket: &FetchTicket,
        result: Result<Vec<WorkItem>, ApiError>,
    ) -> FetchOutcome {
        let items = match result {
            Ok(items) => items,
            Err(err) => {
                warn!(error = %err, transient = err.is_transient(), "fetch failed");
                return FetchOutcome::Failed(err);
            }
        };

        match self.poller.admit(ticket) {
            Admission::Apply => {}
            Admission::Stale { .. } => return FetchOutcome::Stale,
            Admission::Cancelled => return FetchOutcome::Discarded,
        }

        let outcome = {
            let mut state = self.state.borrow_mut();
            state.needs_refresh = false;
            state.engine.apply_snapshot(items)
        };
        if outcome.changed {
            self.broadcast();
        }
        FetchOutcome::Applied(outcome)
    }

    /// Fetches every step and merges the result.
    pub fn refresh<A: PlannerApi>(&mut self, api: &A, now: DateTime<Utc>) -> FetchOutcome {
        let Some(ticket) = self.begin_fetch(now) else {
            return FetchOutcome::Discarded;
        };
        let result = api.list_steps(&StepQuery::default());
        self.finish_fetch(&ticket, result)
    }

    /// Runs `action` through validate, optimistic apply, server call and
    /// confirm or rollback. Returns the server's copy of the item, if the
    /// operation produced one.
    #[tracing::instrument(skip(self, api, action), fields(feed = %self.name, action = action.name(), id = %action.target()))]
    pub fn perform<A: PlannerApi>(
        &mut self,
        api: &mut A,
        action: Action,
    ) -> Result<Option<WorkItem>, MutationError> {
        action.validate()?;
        let target = action.target().clone();
        let before_delete = match &action {
            Action::Delete { id } => self.get(id),
            _ => None,
        };

        self.state.borrow_mut().engine.apply_local(action.clone())?;
        self.broadcast();

        let result = match &action {
            Action::Create { item } => api.create_step(item).map(Some),
            Action::Update { item } => api.update_step(item).map(Some),
            Action::Complete { .. } => match self.get(&target) {
                Some(staged) => api.update_step(&staged).map(Some),
                None => Ok(None),
            },
            Action::Delete { id } => match api.delete_step(id) {
                Ok(_) => Ok(None),
                Err(ApiError::NotFound { .. }) => {
                    debug!("already gone on the server");
                    Ok(None)
                }
                Err(err) => Err(err),
            },
        };

        let outcome = {
            let mut state = self.state.borrow_mut();
            match (result, &action) {
                (Ok(Some(created)), Action::Create { .. }) => {
                    state.engine.confirm_create(&target, created.clone());
                    Ok(Some(created))
                }
                (Ok(confirmed), _) => {
                    state.engine.confirm(&target, confirmed.clone());
                    Ok(confirmed)
                }
                (Err(err), Action::Delete { .. }) => {
                    if let Some(item) = before_delete {
                        state.engine.reject_delete(item);
                    }
                    Err(err)
                }
                (Err(err), _) => {
                    state.engine.reject(&target);
                    Err(err)
                }
            }
        };
        self.broadcast();

        match outcome {
            Ok(item) => {
                info!("mutation confirmed");
                Ok(item)
            }
            Err(err) => {
                warn!(error = %err, "mutation rejected; rolled back");
                Err(err.into())
            }
        }
    }

    fn broadcast(&self) -> usize {
        let items = self.state.borrow().engine.items().to_vec();
        publish_snapshot(&self.bus, &self.name, items)
    }

    /// Cancels in-flight fetches and leaves the bus. Idempotent.
    pub fn unmount(&mut self) {
        if !self.is_mounted() {
            return;
        }
        self.poller.cancel();
        self.subscriptions.clear();
        info!(name = %self.name, "unmounted feed");
    }
}

impl Drop for FeedView {
    fn drop(&mut self) {
        self.unmount();
    }
}

#[cfg(test)]
mod tests {
    use chrono::{TimeZone, Utc};

    use super::{FeedKind, FeedSettings, FeedView, FetchOutcome};
    use crate::api::ApiError;
    use crate::bus::{Bus, Topic};
    use crate::datetime::CanonicalDate;
    use crate::model::{EntityId, WorkItem};

    fn today() -> CanonicalDate {
        CanonicalDate::from_ymd(2026, 10, 16).expect("valid date")
    }

    fn dated(id: &str, title: &str, day: u32) -> WorkItem {
        let mut item = WorkItem::new(EntityId::new(id), title);
        item.scheduled_date = CanonicalDate::from_ymd(2026, 10, day);
        item
    }

    fn now() -> chrono::DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 10, 16, 9, 0, 0)
            .single()
            .expect("valid instant")
    }

    #[test]
    fn today_feed_filters_and_sorts() {
        let bus = Bus::new();
        let mut view = FeedView::mount("today", FeedKind::Today, &bus, FeedSettings::default(), today());
        let ticket = view.begin_fetch(now()).expect("mounted");
        let outcome = view.finish_fetch(
            &ticket,
            Ok(vec![dated("1", "later", 20), dated("2", "now", 16), dated("3", "late", 12)]),
        );
        assert!(matches!(outcome, FetchOutcome::Applied(merge) if merge.changed));

        let titles: Vec<String> = view.items().into_iter().map(|i| i.title).collect();
        assert_eq!(titles, vec!["late", "now"]);
        assert!(!view.needs_refresh());
    }

    #[test]
    fn failed_fetch_keeps_state() {
        let bus = Bus::new();
        let mut view = FeedView::mount("all", FeedKind::All, &bus, FeedSettings::default(), today());
        let first = view.begin_fetch(now()).expect("mounted");
        view.finish_fetch(&first, Ok(vec![dated("1", "keep", 16)]));

        let second = view.begin_fetch(now()).expect("mounted");
        let outcome = view.finish_fetch(&second, Err(ApiError::Transport("offline".into())));
        assert!(matches!(outcome, FetchOutcome::Failed(_)));
        assert_eq!(view.len(), 1);
    }

    #[test]
    fn unmount_discards_in_flight_fetch() {
        let bus = Bus::new();
        let mut view = FeedView::mount("all", FeedKind::All, &bus, FeedSettings::default(), today());
        let ticket = view.begin_fetch(now()).expect("mounted");
        view.unmount();

        assert!(matches!(
            view.finish_fetch(&ticket, Ok(vec![dated("1", "late", 16)])),
            FetchOutcome::Discarded
        ));
        assert!(view.is_empty());
        assert_eq!(bus.subscriber_count(Topic::WorkingSetChanged), 0);
        assert!(view.begin_fetch(now()).is_none());
    }
}
