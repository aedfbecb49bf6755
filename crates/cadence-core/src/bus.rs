//! Synchronous publish/subscribe between mounted views.
//!
//! A [`Bus`] is an explicit object handed to every view that wants to hear
//! about working-set changes; there is no process-global instance. Delivery
//! is synchronous, in subscription order, on the caller's stack. Events carry
//! an optional [`Provenance`]; a subscriber registered under the same
//! provenance never receives its own events, which is what keeps a view that
//! republishes in reaction to a neighbour from looping.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::fmt;
use std::rc::{Rc, Weak};

use tracing::{debug, trace};
use uuid::Uuid;

use crate::actions::Action;
use crate::model::WorkItem;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Topic {
    WorkingSetChanged,
    HabitSetChanged,
    ActionsCompleted,
}

/// Identifies the component an event came from.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Provenance(String);

impl Provenance {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    /// A name no other component shares.
    pub fn unique(prefix: &str) -> Self {
        Self(format!("{prefix}-{}", Uuid::new_v4().simple()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Provenance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BusEvent {
    /// A view's reconciled item list.
    WorkingSetChanged {
        items: Vec<WorkItem>,
        source: Option<Provenance>,
    },
    /// Habits changed somewhere; subscribers refetch.
    HabitSetChanged { source: Option<Provenance> },
    /// Mutations an out-of-band agent already applied on the server.
    ActionsCompleted {
        actions: Vec<Action>,
        source: Option<Provenance>,
    },
}

impl BusEvent {
    pub fn topic(&self) -> Topic {
        match self {
            Self::WorkingSetChanged { .. } => Topic::WorkingSetChanged,
            Self::HabitSetChanged { .. } => Topic::HabitSetChanged,
            Self::ActionsCompleted { .. } => Topic::ActionsCompleted,
        }
    }

    pub fn source(&self) -> Option<&Provenance> {
        match self {
            Self::WorkingSetChanged { source, .. }
            | Self::HabitSetChanged { source }
            | Self::ActionsCompleted { source, .. } => source.as_ref(),
        }
    }
}

/// A handler plus the events that reached it while it was running.
struct Slot {
    handler: RefCell<Box<dyn FnMut(&BusEvent)>>,
    backlog: RefCell<VecDeque<BusEvent>>,
}

struct Entry {
    id: u64,
    topic: Topic,
    owner: Option<Provenance>,
    slot: Rc<Slot>,
}

#[derive(Default)]
struct Registry {
    next_id: u64,
    entries: Vec<Entry>,
}

impl Registry {
    fn contains(&self, id: u64) -> bool {
        self.entries.iter().any(|entry| entry.id == id)
    }

    fn remove(&mut self, id: u64) -> bool {
        let before = self.entries.len();
        self.entries.retain(|entry| entry.id != id);
        before != self.entries.len()
    }
}

/// Cheap to clone; clones share subscribers.
#[derive(Clone, Default)]
pub struct Bus {
    registry: Rc<RefCell<Registry>>,
}

impl fmt::Debug for Bus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Bus")
            .field("subscribers", &self.registry.borrow().entries.len())
            .finish()
    }
}

impl Bus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `handler` for `topic`. Events published under `owner` are
    /// not delivered back to it.
    pub fn subscribe<F>(&self, topic: Topic, owner: Option<Provenance>, handler: F) -> Subscription
    where
        F: FnMut(&BusEvent) + 'static,
    {
        let mut registry = self.registry.borrow_mut();
        let id = registry.next_id;
        registry.next_id += 1;
        debug!(id, ?topic, owner = ?owner, "subscribed");
        registry.entries.push(Entry {
            id,
            topic,
            owner,
            slot: Rc::new(Slot {
                handler: RefCell::new(Box::new(handler)),
                backlog: RefCell::new(VecDeque::new()),
            }),
        });
        Subscription {
            id,
            registry: Rc::downgrade(&self.registry),
        }
    }

    /// Delivers `event` to every current subscriber of its topic and returns
    /// how many deliveries were made. Handlers may publish from inside a
    /// delivery; a subscriber whose handler is still running gets the event
    /// queued and handled as soon as that handler returns.
    #[tracing::instrument(skip(self, event), fields(topic = ?event.topic(), source = ?event.source()))]
    pub fn publish(&self, event: BusEvent) -> usize {
        let topic = event.topic();
        let targets: Vec<(u64, Option<Provenance>, Rc<Slot>)> = self
            .registry
            .borrow()
            .entries
            .iter()
            .filter(|entry| entry.topic == topic)
            .map(|entry| (entry.id, entry.owner.clone(), Rc::clone(&entry.slot)))
            .collect();

        let mut delivered = 0;
        for (id, owner, slot) in targets {
            if owner.is_some() && owner.as_ref() == event.source() {
                trace!(id, "skipping subscriber's own event");
                continue;
            }
            // Unsubscribed by an earlier handler in this same delivery.
            if !self.registry.borrow().contains(id) {
                continue;
            }
            self.deliver(id, &slot, &event);
            delivered += 1;
        }
        delivered
    }

    fn deliver(&self, id: u64, slot: &Slot, event: &BusEvent) {
        let Ok(mut handler) = slot.handler.try_borrow_mut() else {
            debug!(id, "handler is running; queueing event");
            slot.backlog.borrow_mut().push_back(event.clone());
            return;
        };
        (&mut *handler)(event);
        loop {
            let next = slot.backlog.borrow_mut().pop_front();
            let Some(next) = next else {
                break;
            };
            if !self.registry.borrow().contains(id) {
                trace!(id, "dropping backlog of a removed subscriber");
                slot.backlog.borrow_mut().clear();
                break;
            }
            (&mut *handler)(&next);
        }
    }

    /// A handle that does not keep the bus alive, for capturing inside
    /// handlers registered on this same bus.
    pub fn downgrade(&self) -> WeakBus {
        WeakBus {
            registry: Rc::downgrade(&self.registry),
        }
    }

    pub fn subscriber_count(&self, topic: Topic) -> usize {
        self.registry
            .borrow()
            .entries
            .iter()
            .filter(|entry| entry.topic == topic)
            .count()
    }
}

#[derive(Clone)]
pub struct WeakBus {
    registry: Weak<RefCell<Registry>>,
}

impl WeakBus {
    pub fn upgrade(&self) -> Option<Bus> {
        self.registry.upgrade().map(|registry| Bus { registry })
    }
}

/// Removes its handler when unsubscribed or dropped.
#[derive(Debug)]
pub struct Subscription {
    id: u64,
    registry: Weak<RefCell<Registry>>,
}

impl Subscription {
    pub fn unsubscribe(self) {
        drop(self);
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(shared) = self.registry.upgrade()
            && let Ok(mut registry) = shared.try_borrow_mut()
            && registry.remove(self.id)
        {
            debug!(id = self.id, "unsubscribed");
        }
    }
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;
    use std::rc::Rc;

    use super::{Bus, BusEvent, Provenance, Subscription, Topic};

    fn habit_signal(source: Option<&str>) -> BusEvent {
        BusEvent::HabitSetChanged {
            source: source.map(Provenance::new),
        }
    }

    #[test]
    fn delivers_in_subscription_order() {
        let bus = Bus::new();
        let log = Rc::new(RefCell::new(Vec::new()));
        let first = {
            let log = Rc::clone(&log);
            bus.subscribe(Topic::HabitSetChanged, None, move |_| log.borrow_mut().push(1))
        };
        let second = {
            let log = Rc::clone(&log);
            bus.subscribe(Topic::HabitSetChanged, None, move |_| log.borrow_mut().push(2))
        };

        assert_eq!(bus.publish(habit_signal(None)), 2);
        assert_eq!(*log.borrow(), vec![1, 2]);
        drop((first, second));
    }

    #[test]
    fn other_topics_are_not_delivered() {
        let bus = Bus::new();
        let _sub = bus.subscribe(Topic::WorkingSetChanged, None, |_| {});
        assert_eq!(bus.publish(habit_signal(None)), 0);
    }

    #[test]
    fn dropping_subscription_unsubscribes() {
        let bus = Bus::new();
        let sub = bus.subscribe(Topic::HabitSetChanged, None, |_| {});
        assert_eq!(bus.subscriber_count(Topic::HabitSetChanged), 1);
        sub.unsubscribe();
        assert_eq!(bus.subscriber_count(Topic::HabitSetChanged), 0);
        assert_eq!(bus.publish(habit_signal(None)), 0);
    }

    #[test]
    fn own_events_are_skipped() {
        let bus = Bus::new();
        let hits = Rc::new(RefCell::new(0));
        let _sub = {
            let hits = Rc::clone(&hits);
            bus.subscribe(
                Topic::HabitSetChanged,
                Some(Provenance::new("today")),
                move |_| *hits.borrow_mut() += 1,
            )
        };

        bus.publish(habit_signal(Some("today")));
        assert_eq!(*hits.borrow(), 0);
        bus.publish(habit_signal(Some("upcoming")));
        assert_eq!(*hits.borrow(), 1);
    }

    fn recorder(
        bus: &Bus,
        name: &'static str,
        republish_on: Option<&'static str>,
    ) -> (Rc<RefCell<Vec<Option<String>>>>, Subscription) {
        let seen = Rc::new(RefCell::new(Vec::new()));
        let log = Rc::clone(&seen);
        let relay = bus.downgrade();
        let sub = bus.subscribe(
            Topic::HabitSetChanged,
            Some(Provenance::new(name)),
            move |event| {
                let source = event.source().map(Provenance::to_string);
                log.borrow_mut().push(source.clone());
                if source.as_deref() == republish_on
                    && let Some(bus) = relay.upgrade()
                {
                    bus.publish(habit_signal(Some(name)));
                }
            },
        );
        (seen, sub)
    }

    #[test]
    fn republish_reaches_the_handler_that_started_the_chain() {
        let bus = Bus::new();
        // `a` relays untagged events; `b` answers whatever `a` says.
        let (a_seen, _a) = recorder(&bus, "a", None);
        let (b_seen, _b) = recorder(&bus, "b", Some("a"));

        assert_eq!(bus.publish(habit_signal(None)), 2);
        assert_eq!(*a_seen.borrow(), vec![None, Some("b".to_string())]);
        assert_eq!(*b_seen.borrow(), vec![Some("a".to_string()), None]);
    }

    #[test]
    fn tagged_republish_settles() {
        let bus = Bus::new();
        let (a_seen, _a) = recorder(&bus, "a", None);
        let (b_seen, _b) = recorder(&bus, "b", None);

        bus.publish(habit_signal(None));
        // Each relays the untagged event once and hears the other's relay
        // once; nobody hears its own tag.
        assert_eq!(*a_seen.borrow(), vec![None, Some("b".to_string())]);
        assert_eq!(*b_seen.borrow(), vec![Some("a".to_string()), None]);
    }

    #[test]
    fn backlog_is_dropped_after_unsubscribe() {
        let bus = Bus::new();
        let seen = Rc::new(RefCell::new(Vec::new()));
        let holder: Rc<RefCell<Option<Subscription>>> = Rc::new(RefCell::new(None));
        let sub = {
            let seen = Rc::clone(&seen);
            let holder = Rc::clone(&holder);
            let relay = bus.downgrade();
            bus.subscribe(Topic::HabitSetChanged, None, move |event| {
                seen.borrow_mut().push(event.source().map(Provenance::to_string));
                if event.source().is_none()
                    && let Some(bus) = relay.upgrade()
                {
                    bus.publish(habit_signal(Some("elsewhere")));
                    holder.borrow_mut().take();
                }
            })
        };
        *holder.borrow_mut() = Some(sub);

        bus.publish(habit_signal(None));
        assert_eq!(*seen.borrow(), vec![None]);
        assert_eq!(bus.subscriber_count(Topic::HabitSetChanged), 0);
    }
}
