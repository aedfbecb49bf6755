use std::cmp::Reverse;
use std::sync::OnceLock;

use regex::Regex;
use tracing::trace;

use crate::datetime::CanonicalDate;
use crate::model::WorkItem;
use crate::recurrence::{effective_date, is_overdue};

/// Upcoming feeds stop this many months past today.
const UPCOMING_HORIZON_MONTHS: u32 = 1;

/// Unnumbered titles sort after numbered ones within a group; ties keep
/// insertion order because the sort is stable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
struct SortKey {
    not_overdue: bool,
    undated: bool,
    date: Option<CanonicalDate>,
    priority: Reverse<u8>,
    unnumbered: bool,
    ordinal: u64,
}

fn ordinal_regex() -> Option<&'static Regex> {
    static ORDINAL: OnceLock<Option<Regex>> = OnceLock::new();
    ORDINAL
        .get_or_init(|| Regex::new(r"^(\d+)/\d+").ok())
        .as_ref()
}

/// The `N` of a leading `N/M` in a title ("2/7 Buy materials" -> 2).
pub fn ordinal_prefix(title: &str) -> Option<u64> {
    ordinal_regex()?
        .captures(title)
        .and_then(|caps| caps.get(1))
        .and_then(|m| m.as_str().parse().ok())
}

fn sort_key(item: &WorkItem, today: CanonicalDate) -> SortKey {
    let date = effective_date(item);
    let ordinal = ordinal_prefix(&item.title);
    SortKey {
        not_overdue: !is_overdue(item, today),
        undated: date.is_none(),
        date,
        priority: Reverse(item.priority_score()),
        unnumbered: ordinal.is_none(),
        ordinal: ordinal.unwrap_or(0),
    }
}

/// Sorts in place: overdue first, then date ascending, then priority
/// descending, then title ordinal. Ties keep their relative order.
pub fn order_in_place(items: &mut [WorkItem], today: CanonicalDate) {
    items.sort_by_cached_key(|item| sort_key(item, today));
}

#[must_use]
pub fn order(items: &[WorkItem], today: CanonicalDate) -> Vec<WorkItem> {
    let mut out = items.to_vec();
    order_in_place(&mut out, today);
    out
}

#[must_use]
pub fn upcoming_horizon(today: CanonicalDate) -> Option<CanonicalDate> {
    today.add_months(UPCOMING_HORIZON_MONTHS)
}

/// Whether an item belongs in the upcoming feed. Overdue items always do.
pub fn in_upcoming(item: &WorkItem, today: CanonicalDate) -> bool {
    if !item.is_schedulable() || item.is_done() {
        return false;
    }
    let Some(date) = effective_date(item) else {
        return false;
    };
    if date < today {
        return true;
    }
    upcoming_horizon(today).is_none_or(|limit| date <= limit)
}

#[tracing::instrument(skip(items), fields(total = items.len()))]
pub fn upcoming(items: &[WorkItem], today: CanonicalDate) -> Vec<WorkItem> {
    let mut out: Vec<WorkItem> = items
        .iter()
        .filter(|item| in_upcoming(item, today))
        .cloned()
        .collect();
    order_in_place(&mut out, today);
    trace!(kept = out.len(), "built upcoming feed");
    out
}

/// Overdue work plus everything due today.
#[tracing::instrument(skip(items), fields(total = items.len()))]
pub fn today_view(items: &[WorkItem], today: CanonicalDate) -> Vec<WorkItem> {
    let mut out: Vec<WorkItem> = items
        .iter()
        .filter(|item| item.is_schedulable() && !item.is_done())
        .filter(|item| effective_date(item).is_some_and(|date| date <= today))
        .cloned()
        .collect();
    order_in_place(&mut out, today);
    out
}

#[cfg(test)]
mod tests {
    use super::{order, ordinal_prefix, today_view, upcoming};
    use crate::datetime::CanonicalDate;
    use crate::model::{EntityId, Frequency, RecurrenceDescriptor, WorkItem};

    fn today() -> CanonicalDate {
        CanonicalDate::from_ymd(2026, 10, 16).expect("valid date")
    }

    fn item(id: &str, title: &str, date: Option<CanonicalDate>) -> WorkItem {
        let mut out = WorkItem::new(EntityId::new(id), title);
        out.scheduled_date = date;
        out
    }

    fn ids(items: &[WorkItem]) -> Vec<&str> {
        items.iter().map(|i| i.id.as_str()).collect()
    }

    #[test]
    fn overdue_then_priority() {
        let yesterday = today().sub_days(1);
        let a = item("A", "old chore", yesterday);
        let mut b = item("B", "important", Some(today()));
        b.is_important = true;
        let c = item("C", "plain", Some(today()));

        let sorted = order(&[c, b, a], today());
        assert_eq!(ids(&sorted), vec!["A", "B", "C"]);
    }

    #[test]
    fn ordinal_prefix_breaks_ties() {
        let two = item("two", "2/3 Step", Some(today()));
        let one = item("one", "1/3 Step", Some(today()));
        let sorted = order(&[two, one], today());
        let titles: Vec<&str> = sorted.iter().map(|i| i.title.as_str()).collect();
        assert_eq!(titles, vec!["1/3 Step", "2/3 Step"]);
    }

    #[test]
    fn unnumbered_titles_keep_insertion_order() {
        let items = vec![
            item("x", "sweep", Some(today())),
            item("y", "10/12 paint", Some(today())),
            item("z", "dust", Some(today())),
            item("w", "9/12 sand", Some(today())),
        ];
        assert_eq!(ids(&order(&items, today())), vec!["w", "y", "x", "z"]);
    }

    #[test]
    fn order_is_idempotent() {
        let mut urgent = item("u", "urgent", today().add_days(2));
        urgent.is_urgent = true;
        let items = vec![
            item("n", "no date", None),
            urgent,
            item("o", "overdue", today().sub_days(5)),
            item("p", "1/2 part", today().add_days(2)),
            item("q", "later", today().add_days(9)),
        ];
        let once = order(&items, today());
        let twice = order(&once, today());
        assert_eq!(once, twice);
        assert_eq!(ids(&once), vec!["o", "u", "p", "q", "n"]);
    }

    #[test]
    fn completed_items_are_not_overdue() {
        let mut done = item("d", "done", today().sub_days(3));
        done.completed = true;
        let open = item("o", "open", today().sub_days(1));
        assert_eq!(ids(&order(&[done, open], today())), vec!["o", "d"]);
    }

    #[test]
    fn upcoming_respects_horizon_but_keeps_old_overdue() {
        let items = vec![
            item("far", "far away", today().add_days(45)),
            item("edge", "a month out", CanonicalDate::from_ymd(2026, 11, 16)),
            item("ancient", "forgotten", today().sub_days(400)),
            item("undated", "someday", None),
        ];
        assert_eq!(ids(&upcoming(&items, today())), vec!["ancient", "edge"]);
    }

    #[test]
    fn upcoming_excludes_history_rows_and_finished_work() {
        let mut template = item("t", "template", Some(today()));
        template.hidden = true;
        let mut occurrence = item("o", "occurrence", Some(today()));
        occurrence.parent_recurring_id = Some(EntityId::new("t"));
        let mut done = item("d", "done", Some(today()));
        done.completed = true;
        let live = item("l", "live", Some(today()));

        assert_eq!(
            ids(&upcoming(&[template, occurrence, done, live], today())),
            vec!["l"]
        );
    }

    #[test]
    fn stale_recurring_item_surfaces_once_as_overdue() {
        let mut habit_like = item("r", "journal", None);
        habit_like.recurrence = Some(RecurrenceDescriptor::every(Frequency::Daily));
        habit_like.current_instance_date = today().sub_days(30);
        let future = item("f", "future", today().add_days(1));

        let feed = upcoming(&[future, habit_like], today());
        assert_eq!(ids(&feed), vec!["r", "f"]);
        assert_eq!(ids(&today_view(&feed, today())), vec!["r"]);
    }

    #[test]
    fn parses_ordinal_prefix() {
        assert_eq!(ordinal_prefix("2/7 Buy materials"), Some(2));
        assert_eq!(ordinal_prefix("Buy 2/7 materials"), None);
        assert_eq!(ordinal_prefix("12/ nothing"), None);
    }
}
