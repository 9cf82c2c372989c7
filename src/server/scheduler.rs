//! Per-session frame scheduling.
//!
//! Couples the dirty-signal producer (reader worker, via its pipe) to a
//! rate-limited consumer: renders for one session are at least
//! [`MIN_FRAME_INTERVAL`] apart. The first dirty signal after a quiet
//! period renders eagerly; signals arriving inside the interval coalesce
//! into a single deferred render on a timer.
//!
//! Decisions are pure over an injected `now`, so the clamp properties
//! are tested without sleeping; the reactor glue lives in the server.

use std::time::{Duration, Instant};

use crate::reactor::TaskId;

/// Minimum time between renders of a single session (125 Hz ceiling).
pub const MIN_FRAME_INTERVAL: Duration = Duration::from_millis(8);

/// What to do about a dirty signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DirtyDecision {
    /// Render immediately and call [`FrameScheduler::mark_rendered`].
    RenderNow,
    /// Schedule a render timer for the returned delay, then call
    /// [`FrameScheduler::timer_scheduled`] with its task id.
    Schedule(Duration),
    /// A render timer is already pending; the signal coalesces into it.
    AlreadyScheduled,
}

#[derive(Debug, Default)]
pub struct FrameScheduler {
    last_render: Option<Instant>,
    render_timer: Option<TaskId>,
}

impl FrameScheduler {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Decide how to handle a dirty signal observed at `now`.
    pub fn on_dirty(&mut self, now: Instant) -> DirtyDecision {
        if self.render_timer.is_some() {
            return DirtyDecision::AlreadyScheduled;
        }
        match self.last_render {
            None => DirtyDecision::RenderNow,
            Some(last) => {
                let elapsed = now.saturating_duration_since(last);
                if elapsed >= MIN_FRAME_INTERVAL {
                    DirtyDecision::RenderNow
                } else {
                    DirtyDecision::Schedule(MIN_FRAME_INTERVAL - elapsed)
                }
            }
        }
    }

    /// A render happened at `now`.
    pub fn mark_rendered(&mut self, now: Instant) {
        self.last_render = Some(now);
    }

    /// The deferred-render timer was submitted.
    pub fn timer_scheduled(&mut self, task: TaskId) {
        self.render_timer = Some(task);
    }

    /// The render timer fired. Returns false for a stale fire (timer was
    /// already cancelled or superseded) — the caller must not render.
    pub fn timer_fired(&mut self, task: TaskId) -> bool {
        if self.render_timer == Some(task) {
            self.render_timer = None;
            true
        } else {
            false
        }
    }

    /// Take the pending timer for cancellation at session teardown.
    pub fn take_timer(&mut self) -> Option<TaskId> {
        self.render_timer.take()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Drives a scheduler against a synthetic clock, modelling the
    /// server glue: RenderNow renders, Schedule arms a timer that fires
    /// and renders at its deadline.
    struct Sim {
        scheduler: FrameScheduler,
        start: Instant,
        now: Instant,
        timer_deadline: Option<(TaskId, Instant)>,
        next_task: TaskId,
        /// Offsets from start of every render.
        render_times: Vec<Duration>,
    }

    impl Sim {
        fn new() -> Self {
            let start = Instant::now();
            Self {
                scheduler: FrameScheduler::new(),
                start,
                now: start,
                timer_deadline: None,
                next_task: 1,
                render_times: Vec::new(),
            }
        }

        fn renders(&self) -> u32 {
            self.render_times.len() as u32
        }

        fn render(&mut self) {
            self.render_times.push(self.now - self.start);
            self.scheduler.mark_rendered(self.now);
        }

        fn advance(&mut self, by: Duration) {
            let target = self.now + by;
            // Fire the pending timer if its deadline falls inside.
            if let Some((task, deadline)) = self.timer_deadline {
                if deadline <= target {
                    self.now = deadline;
                    self.timer_deadline = None;
                    if self.scheduler.timer_fired(task) {
                        self.render();
                    }
                }
            }
            self.now = target;
        }

        fn dirty(&mut self) {
            match self.scheduler.on_dirty(self.now) {
                DirtyDecision::RenderNow => self.render(),
                DirtyDecision::Schedule(delay) => {
                    let task = self.next_task;
                    self.next_task += 1;
                    self.timer_deadline = Some((task, self.now + delay));
                    self.scheduler.timer_scheduled(task);
                }
                DirtyDecision::AlreadyScheduled => {}
            }
        }
    }

    #[test]
    fn test_first_dirty_renders_eagerly() {
        let mut sim = Sim::new();
        sim.dirty();
        assert_eq!(sim.renders(), 1);
    }

    #[test]
    fn test_saturated_dirty_stream_respects_clamp() {
        // Dirty every 500µs for 100ms: renders inside the window must be
        // within one of T/INTERVAL.
        let mut sim = Sim::new();
        let steps: u32 = 200;
        let step = Duration::from_micros(500);
        for _ in 0..steps {
            sim.dirty();
            sim.advance(step);
        }
        // Let any trailing timer fire (its render lands past the window).
        sim.advance(MIN_FRAME_INTERVAL);

        let window = step * steps;
        let in_window = sim
            .render_times
            .iter()
            .filter(|t| **t < window)
            .count() as u32;
        let floor = (window.as_micros() / MIN_FRAME_INTERVAL.as_micros()) as u32;
        assert!(
            in_window >= floor && in_window <= floor + 1,
            "renders {in_window} outside [{floor}, {}]",
            floor + 1
        );
    }

    #[test]
    fn test_single_dirty_renders_within_interval() {
        let mut sim = Sim::new();
        sim.dirty();
        sim.advance(Duration::from_millis(1));

        // One signal inside the interval defers, but never past t+INTERVAL.
        sim.dirty();
        let dirty_at = *sim.render_times.last().unwrap() + Duration::from_millis(1);
        assert_eq!(sim.renders(), 1);
        sim.advance(MIN_FRAME_INTERVAL);
        assert_eq!(sim.renders(), 2);
        assert!(*sim.render_times.last().unwrap() <= dirty_at + MIN_FRAME_INTERVAL);
    }

    #[test]
    fn test_signals_inside_interval_coalesce() {
        let mut sim = Sim::new();
        sim.dirty(); // renders
        for _ in 0..10 {
            sim.advance(Duration::from_micros(100));
            sim.dirty();
        }
        sim.advance(MIN_FRAME_INTERVAL);
        assert_eq!(sim.renders(), 2, "burst coalesces into one deferred render");
    }

    #[test]
    fn test_quiet_period_renders_eagerly_again() {
        let mut sim = Sim::new();
        sim.dirty();
        sim.advance(MIN_FRAME_INTERVAL * 3);
        sim.dirty();
        assert_eq!(sim.renders(), 2);
    }

    #[test]
    fn test_cancelled_timer_never_renders() {
        let mut scheduler = FrameScheduler::new();
        let now = Instant::now();
        scheduler.mark_rendered(now);

        let decision = scheduler.on_dirty(now + Duration::from_millis(1));
        assert!(matches!(decision, DirtyDecision::Schedule(_)));
        scheduler.timer_scheduled(42);

        // Session teardown cancels the timer...
        assert_eq!(scheduler.take_timer(), Some(42));
        // ...so a late fire is stale and must not render.
        assert!(!scheduler.timer_fired(42));
    }

    #[test]
    fn test_stale_timer_id_is_ignored() {
        let mut scheduler = FrameScheduler::new();
        scheduler.timer_scheduled(7);
        assert!(!scheduler.timer_fired(99));
        assert!(scheduler.timer_fired(7));
    }
}
