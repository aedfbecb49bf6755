use tracing::debug;

pub const DEFAULT_INITIAL_REVEAL: usize = 20;
pub const DEFAULT_REVEAL_STEP: usize = 20;

/// The first `reveal` items of an already sorted feed.
pub fn window<T>(sorted: &[T], reveal: usize) -> &[T] {
    &sorted[..reveal.min(sorted.len())]
}

/// How much of a sorted feed is rendered. Grows by a fixed step each time
/// the sentinel below the last rendered row becomes visible and never
/// shrinks while the feed is mounted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FeedWindow {
    reveal: usize,
    step: usize,
}

impl Default for FeedWindow {
    fn default() -> Self {
        Self::new(DEFAULT_INITIAL_REVEAL, DEFAULT_REVEAL_STEP)
    }
}

impl FeedWindow {
    pub fn new(initial: usize, step: usize) -> Self {
        Self {
            reveal: initial.max(1),
            step: step.max(1),
        }
    }

    /// Rows currently rendered for a feed of `total` items.
    pub fn visible_count(&self, total: usize) -> usize {
        self.reveal.min(total)
    }

    pub fn is_complete(&self, total: usize) -> bool {
        self.reveal >= total
    }

    pub fn slice<'a, T>(&self, sorted: &'a [T]) -> &'a [T] {
        window(sorted, self.reveal)
    }

    /// Sentinel became visible. Returns the new visible count; a feed that
    /// is already fully shown is left alone.
    pub fn on_sentinel_visible(&mut self, total: usize) -> usize {
        if self.is_complete(total) {
            return self.visible_count(total);
        }
        self.reveal = self.reveal.saturating_add(self.step);
        debug!(reveal = self.reveal, total, "revealed more of the feed");
        self.visible_count(total)
    }
}

#[cfg(test)]
mod tests {
    use super::{FeedWindow, window};

    #[test]
    fn fifty_seven_items_take_two_triggers() {
        let feed: Vec<u32> = (0..57).collect();
        let mut win = FeedWindow::new(20, 20);
        assert_eq!(win.slice(&feed).len(), 20);

        let mut triggers = 0;
        while !win.is_complete(feed.len()) {
            win.on_sentinel_visible(feed.len());
            triggers += 1;
        }
        assert_eq!(triggers, 2);
        assert_eq!(win.slice(&feed), feed.as_slice());
    }

    #[test]
    fn reveal_is_clamped_and_monotonic() {
        let mut win = FeedWindow::new(20, 20);
        assert_eq!(win.on_sentinel_visible(57), 40);
        assert_eq!(win.on_sentinel_visible(57), 57);
        assert_eq!(win.on_sentinel_visible(57), 57);
        // The feed shrinking does not lose the reveal it had.
        assert_eq!(win.visible_count(10), 10);
        assert_eq!(win.visible_count(200), 60);
    }

    #[test]
    fn short_feeds_show_everything() {
        let feed = [1, 2, 3];
        assert_eq!(window(&feed, 20), &feed);
        assert_eq!(window(&feed, 0), &[] as &[i32]);
    }
}
