//! Decides when a feed refetches and whether a fetch that came back may be
//! applied. Merging is someone else's job.

use std::cell::Cell;
use std::rc::Rc;

use chrono::{DateTime, Duration, Utc};
use tracing::debug;

pub const DEFAULT_POLL_INTERVAL_SECS: i64 = 30;

/// Shared flag; once cancelled it stays cancelled.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken(Rc<Cell<bool>>);

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.set(true);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.get()
    }
}

/// An issued fetch. Hand it back with the response.
#[derive(Debug, Clone)]
pub struct FetchTicket {
    seq: u64,
    issued_at: DateTime<Utc>,
    token: CancellationToken,
}

impl FetchTicket {
    pub fn seq(&self) -> u64 {
        self.seq
    }

    pub fn issued_at(&self) -> DateTime<Utc> {
        self.issued_at
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Apply,
    /// Issued before the most recently applied response.
    Stale { seq: u64, last_applied: u64 },
    Cancelled,
}

#[derive(Debug)]
pub struct Poller {
    interval: Duration,
    next_seq: u64,
    last_applied: Option<u64>,
    last_issued_at: Option<DateTime<Utc>>,
    token: CancellationToken,
}

impl Default for Poller {
    fn default() -> Self {
        Self::new(Duration::seconds(DEFAULT_POLL_INTERVAL_SECS))
    }
}

impl Poller {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            next_seq: 1,
            last_applied: None,
            last_issued_at: None,
            token: CancellationToken::new(),
        }
    }

    /// Nothing issued yet, or the interval has passed since the last fetch.
    pub fn poll_due(&self, now: DateTime<Utc>) -> bool {
        if self.token.is_cancelled() {
            return false;
        }
        self.last_issued_at
            .is_none_or(|last| now.signed_duration_since(last) >= self.interval)
    }

    pub fn issue(&mut self, now: DateTime<Utc>) -> FetchTicket {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.last_issued_at = Some(now);
        debug!(seq, "issued fetch");
        FetchTicket {
            seq,
            issued_at: now,
            token: self.token.clone(),
        }
    }

    /// Whether a successful response for `ticket` may be applied. Admitting
    /// it makes every older ticket stale.
    pub fn admit(&mut self, ticket: &FetchTicket) -> Admission {
        if ticket.is_cancelled() {
            debug!(seq = ticket.seq, "discarding fetch after cancellation");
            return Admission::Cancelled;
        }
        if let Some(last_applied) = self.last_applied
            && ticket.seq <= last_applied
        {
            debug!(seq = ticket.seq, last_applied, "dropping out-of-order fetch");
            return Admission::Stale {
                seq: ticket.seq,
                last_applied,
            };
        }
        self.last_applied = Some(ticket.seq);
        Admission::Apply
    }

    pub fn last_applied(&self) -> Option<u64> {
        self.last_applied
    }

    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }
}

#[cfg(test)]
mod tests {
    use chrono::{Duration, TimeZone, Utc};

    use super::{Admission, Poller};

    fn at(seconds: i64) -> chrono::DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 10, 16, 9, 0, 0)
            .single()
            .expect("valid instant")
            + Duration::seconds(seconds)
    }

    #[test]
    fn late_older_response_is_dropped() {
        let mut poller = Poller::new(Duration::seconds(30));
        let first = poller.issue(at(0));
        let second = poller.issue(at(1));

        assert_eq!(poller.admit(&second), Admission::Apply);
        assert_eq!(
            poller.admit(&first),
            Admission::Stale {
                seq: 1,
                last_applied: 2
            }
        );
        assert_eq!(poller.last_applied(), Some(2));
    }

    #[test]
    fn in_order_responses_apply() {
        let mut poller = Poller::default();
        let first = poller.issue(at(0));
        let second = poller.issue(at(1));
        assert_eq!(poller.admit(&first), Admission::Apply);
        assert_eq!(poller.admit(&second), Admission::Apply);
    }

    #[test]
    fn cancelled_tickets_are_discarded() {
        let mut poller = Poller::default();
        let ticket = poller.issue(at(0));
        poller.cancel();
        assert_eq!(poller.admit(&ticket), Admission::Cancelled);
        assert!(!poller.poll_due(at(3600)));
    }

    #[test]
    fn polls_on_interval() {
        let mut poller = Poller::new(Duration::seconds(30));
        assert!(poller.poll_due(at(0)));
        poller.issue(at(0));
        assert!(!poller.poll_due(at(29)));
        assert!(poller.poll_due(at(30)));
    }
}
