use std::cell::Cell;
use std::rc::Rc;

use tracing::{debug, info, warn};

use crate::actions::validate_habit;
use crate::api::PlannerApi;
use crate::bus::{Bus, BusEvent, Provenance, Subscription, Topic};
use crate::datetime::{CanonicalDate, parse_weekday_name};
use crate::feed::MutationError;
use crate::model::{EntityId, Habit, HabitFrequency};

/// Daily habits are always scheduled; weekly and custom ones only on their
/// selected weekdays.
pub fn is_scheduled_for(habit: &Habit, date: CanonicalDate) -> bool {
    match habit.frequency {
        HabitFrequency::Daily => true,
        HabitFrequency::Weekly | HabitFrequency::Custom => habit
            .selected_days
            .iter()
            .filter_map(|day| parse_weekday_name(day))
            .any(|day| day == date.weekday()),
    }
}

pub fn is_completed_on(habit: &Habit, date: CanonicalDate) -> bool {
    habit
        .completions
        .get(&date.to_string())
        .copied()
        .unwrap_or(false)
}

/// Records a completion. The ledger only ever gains `true` entries; returns
/// whether this call added one.
pub fn mark_complete(habit: &mut Habit, date: CanonicalDate) -> bool {
    let key = date.to_string();
    if habit.completions.get(&key).copied().unwrap_or(false) {
        return false;
    }
    habit.completions.insert(key, true);
    true
}

/// Consecutive scheduled days completed, counting back from today. An open
/// today does not break the streak.
pub fn current_streak(habit: &Habit, today: CanonicalDate) -> u32 {
    let Some(earliest) = habit
        .completions
        .iter()
        .filter(|(_, done)| **done)
        .filter_map(|(raw, _)| raw.parse::<CanonicalDate>().ok())
        .min()
    else {
        return 0;
    };

    let mut streak = 0;
    let mut cursor = today;
    if is_scheduled_for(habit, today) && !is_completed_on(habit, today) {
        match today.sub_days(1) {
            Some(yesterday) => cursor = yesterday,
            None => return 0,
        }
    }

    while cursor >= earliest {
        if is_scheduled_for(habit, cursor) {
            if !is_completed_on(habit, cursor) {
                break;
            }
            streak += 1;
        }
        match cursor.sub_days(1) {
            Some(previous) => cursor = previous,
            None => break,
        }
    }
    streak
}

pub fn habits_for_day(habits: &[Habit], date: CanonicalDate) -> Vec<&Habit> {
    habits
        .iter()
        .filter(|habit| is_scheduled_for(habit, date))
        .collect()
}

/// The habit list one view shows. It is marked stale whenever anyone else
/// signals a habit change and must then be refetched.
#[derive(Debug)]
pub struct HabitBoard {
    name: Provenance,
    bus: Bus,
    habits: Vec<Habit>,
    stale: Rc<Cell<bool>>,
    _subscription: Subscription,
}

impl HabitBoard {
    pub fn watch(bus: &Bus) -> Self {
        let name = Provenance::unique("habits");
        let stale = Rc::new(Cell::new(true));
        let flag = Rc::clone(&stale);
        let subscription = bus.subscribe(Topic::HabitSetChanged, Some(name.clone()), move |_| {
            debug!("habit set changed elsewhere; marking stale");
            flag.set(true);
        });
        Self {
            name,
            bus: bus.clone(),
            habits: vec![],
            stale,
            _subscription: subscription,
        }
    }

    pub fn habits(&self) -> &[Habit] {
        &self.habits
    }

    pub fn is_stale(&self) -> bool {
        self.stale.get()
    }

    pub fn get(&self, id: &EntityId) -> Option<&Habit> {
        self.habits.iter().find(|habit| &habit.id == id)
    }

    /// Refetches the list. A failed fetch keeps the current habits.
    #[tracing::instrument(skip(self, api))]
    pub fn refresh<A: PlannerApi>(&mut self, api: &A) -> Result<(), MutationError> {
        match api.list_habits() {
            Ok(habits) => {
                self.habits = habits;
                self.stale.set(false);
                Ok(())
            }
            Err(err) => {
                warn!(error = %err, "habit refresh failed; keeping current list");
                Err(err.into())
            }
        }
    }

    #[tracing::instrument(skip(self, api, habit), fields(name = %habit.name))]
    pub fn create<A: PlannerApi>(&mut self, api: &mut A, habit: Habit) -> Result<Habit, MutationError> {
        validate_habit(&habit)?;
        let created = api.create_habit(&habit)?;
        self.habits.push(created.clone());
        self.announce();
        Ok(created)
    }

    /// Optimistically ticks off `id` for `date`, rolling back if the server
    /// refuses.
    #[tracing::instrument(skip(self, api))]
    pub fn check<A: PlannerApi>(
        &mut self,
        api: &mut A,
        id: &EntityId,
        date: CanonicalDate,
    ) -> Result<Habit, MutationError> {
        let pos = self
            .habits
            .iter()
            .position(|habit| &habit.id == id)
            .ok_or_else(|| crate::actions::ActionError::UnknownItem(id.clone()))?;

        let previous = self.habits[pos].clone();
        if !mark_complete(&mut self.habits[pos], date) {
            debug!("already completed on this day");
            return Ok(previous);
        }

        match api.mark_habit_complete(id, date) {
            Ok(confirmed) => {
                self.habits[pos] = confirmed.clone();
                info!(streak = current_streak(&confirmed, date), "habit checked");
                self.announce();
                Ok(confirmed)
            }
            Err(err) => {
                self.habits[pos] = previous;
                warn!(error = %err, "habit check rejected; rolled back");
                Err(err.into())
            }
        }
    }

    fn announce(&self) {
        self.bus.publish(BusEvent::HabitSetChanged {
            source: Some(self.name.clone()),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::{current_streak, habits_for_day, is_scheduled_for, mark_complete};
    use crate::datetime::CanonicalDate;
    use crate::model::{EntityId, Habit, HabitFrequency};

    fn day(d: u32) -> CanonicalDate {
        CanonicalDate::from_ymd(2026, 10, d).expect("valid date")
    }

    fn weekly(days: &[&str]) -> Habit {
        let mut habit = Habit::new(EntityId::new("w"), "gym", HabitFrequency::Weekly);
        habit.selected_days = days.iter().map(|d| d.to_string()).collect();
        habit
    }

    #[test]
    fn schedule_follows_frequency() {
        let daily = Habit::new(EntityId::new("d"), "read", HabitFrequency::Daily);
        let gym = weekly(&["monday", "friday"]);
        // 2026-10-16 is a Friday, 2026-10-17 a Saturday.
        assert!(is_scheduled_for(&daily, day(17)));
        assert!(is_scheduled_for(&gym, day(16)));
        assert!(!is_scheduled_for(&gym, day(17)));

        let habits = vec![daily, gym];
        assert_eq!(habits_for_day(&habits, day(17)).len(), 1);
    }

    #[test]
    fn ledger_is_append_only() {
        let mut habit = Habit::new(EntityId::new("d"), "read", HabitFrequency::Daily);
        assert!(mark_complete(&mut habit, day(16)));
        assert!(!mark_complete(&mut habit, day(16)));
        assert_eq!(habit.completions.get("2026-10-16"), Some(&true));
    }

    #[test]
    fn streak_skips_unscheduled_days_and_open_today() {
        let mut gym = weekly(&["monday", "wednesday", "friday"]);
        for d in [5, 7, 9, 12, 14] {
            mark_complete(&mut gym, day(d));
        }
        // Friday the 16th is scheduled but not done yet.
        assert_eq!(current_streak(&gym, day(16)), 5);
        mark_complete(&mut gym, day(16));
        assert_eq!(current_streak(&gym, day(16)), 6);
    }

    #[test]
    fn missed_day_breaks_streak() {
        let mut habit = Habit::new(EntityId::new("d"), "read", HabitFrequency::Daily);
        for d in [10, 11, 13, 14, 15] {
            mark_complete(&mut habit, day(d));
        }
        assert_eq!(current_streak(&habit, day(16)), 3);
        assert_eq!(current_streak(&Habit::new(EntityId::new("e"), "x", HabitFrequency::Daily), day(16)), 0);
    }
}
