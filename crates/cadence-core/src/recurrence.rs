use std::collections::BTreeSet;

use chrono::Datelike;
use tracing::{debug, warn};

use crate::datetime::{CanonicalDate, parse_weekday_name};
use crate::model::{Frequency, RecurrenceDescriptor, WorkItem};

/// The date an item is scheduled on: the recurrence pointer for recurring
/// items, the scheduled date otherwise. `None` for undated items and for
/// recurring items whose pointer was never established.
pub fn effective_date(item: &WorkItem) -> Option<CanonicalDate> {
    if item.is_recurring() {
        item.current_instance_date
    } else {
        item.scheduled_date
    }
}

pub fn is_due_on(item: &WorkItem, date: CanonicalDate) -> bool {
    item.is_schedulable() && effective_date(item) == Some(date)
}

/// A past, unfinished occurrence. Undetermined recurring items are never
/// overdue.
pub fn is_overdue(item: &WorkItem, today: CanonicalDate) -> bool {
    item.is_schedulable() && !item.is_done() && effective_date(item).is_some_and(|d| d < today)
}

/// One period after `base`.
pub fn next_after(rule: &RecurrenceDescriptor, base: CanonicalDate) -> Option<CanonicalDate> {
    let interval = rule.interval.max(1);
    match rule.frequency {
        Frequency::Daily => base.add_days(u64::from(interval)),
        Frequency::Weekly if !rule.selected_days.is_empty() => {
            next_selected_weekday(rule, base, interval)
        }
        Frequency::Weekly => base.add_days(7 * u64::from(interval)),
        Frequency::Monthly => base.add_months(interval),
        Frequency::Yearly => base.add_months(interval.saturating_mul(12)),
    }
}

fn next_selected_weekday(
    rule: &RecurrenceDescriptor,
    base: CanonicalDate,
    interval: u32,
) -> Option<CanonicalDate> {
    let days: BTreeSet<u32> = rule
        .selected_days
        .iter()
        .filter_map(|raw| {
            let parsed = parse_weekday_name(raw);
            if parsed.is_none() {
                warn!(day = %raw, "ignoring unknown weekday in recurrence");
            }
            parsed
        })
        .map(|day| day.num_days_from_monday())
        .collect();

    if days.is_empty() {
        return base.add_days(7 * u64::from(interval));
    }

    let base_week = base.naive().iso_week();
    for offset in 1..=7 {
        let candidate = base.add_days(offset)?;
        if !days.contains(&candidate.weekday().num_days_from_monday()) {
            continue;
        }
        if candidate.naive().iso_week() == base_week {
            return Some(candidate);
        }
        // Wrapped into the following week: skip the idle weeks.
        return candidate.add_days(7 * u64::from(interval - 1));
    }
    None
}

/// Next occurrence after completing on `completion_date`. Never moves the
/// pointer backward: completing early advances from the current pointer.
/// Missed occurrences are not replayed.
pub fn advance(item: &WorkItem, completion_date: CanonicalDate) -> Option<CanonicalDate> {
    let rule = item.recurrence.as_ref()?;
    let next = next_after(rule, completion_date)?;
    match item.current_instance_date {
        Some(current) if next <= current => next_after(rule, current),
        _ => Some(next),
    }
}

/// Marks `item` as completed on `completion_date`. Recurring items move
/// their pointer and stay incomplete.
pub fn complete(item: &mut WorkItem, completion_date: CanonicalDate) {
    if item.is_recurring() {
        let next = advance(item, completion_date);
        debug!(
            id = %item.id,
            from = ?item.current_instance_date,
            to = ?next,
            "advanced recurrence pointer"
        );
        item.current_instance_date = next;
        item.completed = false;
    } else {
        item.completed = true;
    }
}
