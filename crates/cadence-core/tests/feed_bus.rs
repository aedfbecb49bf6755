use cadence_core::actions::Action;
use cadence_core::api::{PlannerApi, StepQuery};
use cadence_core::bus::{Bus, BusEvent, Provenance, Topic};
use cadence_core::datastore::DataStore;
use cadence_core::datetime::CanonicalDate;
use cadence_core::events::{ASSISTANT_ACTION_COMPLETED, DAILY_STEPS_UPDATED, dispatch_external};
use cadence_core::feed::{FeedKind, FeedSettings, FeedView, FetchOutcome, MutationError};
use cadence_core::model::{EntityId, WorkItem};
use cadence_core::reconcile::TombstoneOrigin;
use chrono::{DateTime, TimeZone, Utc};
use serde_json::json;
use tempfile::tempdir;

fn today() -> CanonicalDate {
    CanonicalDate::from_ymd(2026, 10, 16).expect("valid date")
}

fn now() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 10, 16, 8, 30, 0)
        .single()
        .expect("valid instant")
}

fn dated(id: &str, title: &str, day: u32) -> WorkItem {
    let mut item = WorkItem::new(EntityId::new(id), title);
    item.scheduled_date = CanonicalDate::from_ymd(2026, 10, day);
    item
}

fn mount(name: &str, kind: FeedKind, bus: &Bus) -> FeedView {
    FeedView::mount(name, kind, bus, FeedSettings::default(), today())
}

#[test]
fn mutation_reaches_neighbouring_view() {
    let temp = tempdir().expect("tempdir");
    let mut store = DataStore::open(temp.path()).expect("open datastore");
    store.create_step(&dated("1", "existing", 16)).expect("seed");

    let bus = Bus::new();
    let mut today_view = mount("today", FeedKind::Today, &bus);
    let mut upcoming_view = mount("upcoming", FeedKind::Upcoming, &bus);
    assert!(matches!(today_view.refresh(&store, now()), FetchOutcome::Applied(_)));
    assert!(matches!(upcoming_view.refresh(&store, now()), FetchOutcome::Applied(_)));

    let mut draft = dated("ignored", "buy paint", 18);
    draft.id = EntityId::temporary();
    let created = today_view
        .perform(&mut store, Action::Create { item: draft.clone() })
        .expect("create")
        .expect("server copy");

    assert!(!created.id.is_temporary());
    assert!(upcoming_view.get(&created.id).is_some());
    assert!(upcoming_view.get(&draft.id).is_none());
    let titles: Vec<String> = upcoming_view.items().into_iter().map(|i| i.title).collect();
    assert_eq!(titles, vec!["existing", "buy paint"]);
    // Not due today, so the originating view does not show it.
    assert_eq!(today_view.items().len(), 1);
}

#[test]
fn rejected_update_rolls_back_everywhere() {
    let temp = tempdir().expect("tempdir");
    let mut store = DataStore::open(temp.path()).expect("open datastore");
    store.create_step(&dated("1", "original", 16)).expect("seed");

    let bus = Bus::new();
    let mut editor = mount("editor", FeedKind::All, &bus);
    let mut watcher = mount("watcher", FeedKind::All, &bus);
    editor.refresh(&store, now());
    watcher.refresh(&store, now());

    // Someone else removed it on the server in the meantime.
    store.delete_step(&EntityId::new("1")).expect("server delete");

    let err = editor
        .perform(&mut store, Action::Update { item: dated("1", "renamed", 16) })
        .expect_err("server no longer has it");
    assert!(matches!(err, MutationError::Api(_)));

    for view in [&editor, &watcher] {
        assert_eq!(
            view.get(&EntityId::new("1")).map(|i| i.title),
            Some("original".to_string())
        );
    }
}

#[test]
fn fetch_issued_before_a_delete_does_not_bring_it_back() {
    let temp = tempdir().expect("tempdir");
    let mut store = DataStore::open(temp.path()).expect("open datastore");
    store.create_step(&dated("x", "old chore", 16)).expect("seed");
    store.create_step(&dated("y", "other chore", 16)).expect("seed");

    let bus = Bus::new();
    let mut mine = mount("mine", FeedKind::All, &bus);
    let mut theirs = mount("theirs", FeedKind::All, &bus);
    mine.refresh(&store, now());
    theirs.refresh(&store, now());

    let in_flight = mine.begin_fetch(now()).expect("mounted");
    mine.perform(&mut store, Action::Delete { id: EntityId::new("x") })
        .expect("delete");

    // The neighbour relayed a list without `x`; the tombstone must hold.
    let x = EntityId::new("x");
    assert_eq!(
        mine.with_engine(|engine| engine.tombstone_origin(&x)),
        Some(TombstoneOrigin::LocalDelete)
    );

    let outcome = mine.finish_fetch(
        &in_flight,
        Ok(vec![dated("x", "old chore", 16), dated("y", "other chore", 16)]),
    );
    assert!(matches!(
        outcome,
        FetchOutcome::Applied(merge) if merge.dropped_tombstoned == 1 && merge.revived == 0
    ));
    assert!(mine.get(&x).is_none());
    assert!(theirs.get(&x).is_none());
    assert_eq!(mine.len(), 1);
}

#[test]
fn stale_neighbour_broadcast_does_not_undo_a_delete() {
    let temp = tempdir().expect("tempdir");
    let mut store = DataStore::open(temp.path()).expect("open datastore");
    store.create_step(&dated("x", "old chore", 16)).expect("seed");
    store.create_step(&dated("y", "other chore", 16)).expect("seed");

    let bus = Bus::new();
    let mut view = mount("mine", FeedKind::All, &bus);
    view.refresh(&store, now());
    view.perform(&mut store, Action::Delete { id: EntityId::new("x") })
        .expect("delete");

    bus.publish(BusEvent::WorkingSetChanged {
        items: vec![dated("x", "old chore", 16), dated("y", "other chore", 16)],
        source: Some(Provenance::new("slow-neighbour")),
    });
    assert!(view.get(&EntityId::new("x")).is_none());

    bus.publish(BusEvent::WorkingSetChanged {
        items: vec![dated("y", "other chore", 16)],
        source: Some(Provenance::new("slow-neighbour")),
    });
    view.refresh(&store, now());
    assert!(view.get(&EntityId::new("x")).is_none());

    // Only recreating it here lifts the tombstone.
    view.perform(&mut store, Action::Create { item: dated("x", "old chore", 16) })
        .expect("recreate");
    assert!(view.get(&EntityId::new("x")).is_some());
}

#[test]
fn invalid_action_never_reaches_the_server() {
    let temp = tempdir().expect("tempdir");
    let mut store = DataStore::open(temp.path()).expect("open datastore");
    let bus = Bus::new();
    let mut view = mount("all", FeedKind::All, &bus);
    view.refresh(&store, now());

    let err = view
        .perform(&mut store, Action::Create { item: dated("tmp-x", "   ", 16) })
        .expect_err("empty title");
    assert!(matches!(err, MutationError::Action(_)));
    assert!(view.is_empty());
    assert!(store.list_steps(&StepQuery::default()).expect("list").is_empty());
}

#[test]
fn out_of_order_fetches_keep_the_newest() {
    let bus = Bus::new();
    let mut view = mount("all", FeedKind::All, &bus);
    let older = view.begin_fetch(now()).expect("mounted");
    let newer = view.begin_fetch(now()).expect("mounted");

    assert!(matches!(
        view.finish_fetch(&newer, Ok(vec![dated("1", "a", 16), dated("2", "b", 17)])),
        FetchOutcome::Applied(_)
    ));
    assert!(matches!(
        view.finish_fetch(&older, Ok(vec![dated("1", "a", 16)])),
        FetchOutcome::Stale
    ));
    assert_eq!(view.len(), 2);
}

#[test]
fn external_events_reach_mounted_views() {
    let bus = Bus::new();
    let mut view = mount("today", FeedKind::Today, &bus);
    let ticket = view.begin_fetch(now()).expect("mounted");
    view.finish_fetch(&ticket, Ok(vec![dated("5", "call bank", 16), dated("6", "email", 16)]));
    assert!(!view.needs_refresh());

    dispatch_external(
        &bus,
        ASSISTANT_ACTION_COMPLETED,
        &json!({ "actions": [
            { "type": "step", "operation": "complete", "success": true, "data": { "id": 5 } }
        ]}),
        today(),
    );
    assert!(view.needs_refresh());
    assert_eq!(view.get(&EntityId::new("5")).map(|i| i.completed), Some(true));
    let titles: Vec<String> = view.items().into_iter().map(|i| i.title).collect();
    assert_eq!(titles, vec!["email"]);

    dispatch_external(
        &bus,
        DAILY_STEPS_UPDATED,
        &json!({ "steps": [ { "id": 6, "title": "email", "date": "2026-10-16" } ], "source": "assistant" }),
        today(),
    );
    assert_eq!(view.len(), 1);
}

#[test]
fn relaying_views_settle() {
    let bus = Bus::new();
    let views: Vec<FeedView> = ["a", "b", "c"]
        .into_iter()
        .map(|name| mount(name, FeedKind::All, &bus))
        .collect();

    let hits = dispatch_external(
        &bus,
        DAILY_STEPS_UPDATED,
        &json!({ "steps": [ { "id": 1, "title": "one", "date": "2026-10-16" } ] }),
        today(),
    );
    assert!(hits >= views.len());
    for view in &views {
        assert_eq!(view.len(), 1);
    }
}

#[test]
fn windowing_reveals_in_steps() {
    let temp = tempdir().expect("tempdir");
    let mut store = DataStore::open(temp.path()).expect("open datastore");
    for n in 0..57 {
        store
            .create_step(&dated(&format!("s{n:02}"), &format!("step {n}"), 20))
            .expect("seed");
    }

    let bus = Bus::new();
    let mut view = mount("upcoming", FeedKind::Upcoming, &bus);
    view.refresh(&store, now());
    assert_eq!(view.items().len(), 57);
    assert_eq!(view.visible().len(), 20);
    assert_eq!(view.reveal_more(), 40);
    assert_eq!(view.reveal_more(), 57);
    assert!(view.window().is_complete(57));
    assert_eq!(view.reveal_more(), 57);
}

#[test]
fn dropping_a_view_leaves_the_bus() {
    let bus = Bus::new();
    {
        let _view = mount("short-lived", FeedKind::All, &bus);
        assert_eq!(bus.subscriber_count(Topic::WorkingSetChanged), 1);
    }
    assert_eq!(bus.subscriber_count(Topic::WorkingSetChanged), 0);
    assert_eq!(bus.subscriber_count(Topic::ActionsCompleted), 0);
}
