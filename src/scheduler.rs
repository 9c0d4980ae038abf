//! Fixed-interval stepping of the simulation
//!
//! The scheduler owns the ping-pong parity and decides, for every tick, which
//! bind group the compute pass reads and which one the render pass reads. It
//! never touches the GPU itself: it hands a [`TickPlan`] to whoever executes
//! it, so the sequencing can be checked without a device.

use std::time::Duration;

use crate::{config::GridDescriptor, rendering::VERTEX_COUNT, sim::gpucompute::Parity};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SchedulerState {
    Idle,
    Stepping,
}

/// Everything needed to encode one tick
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TickPlan {
    /// Generation produced by this tick, starting at 1
    pub step: u64,
    /// Bind group for the compute pass; reads slot `compute_bind_group`
    pub compute_bind_group: Parity,
    /// Bind group for the render pass; reads the slot the compute pass wrote
    pub render_bind_group: Parity,
    pub workgroups: [u32; 2],
    pub vertex_count: u32,
    pub instance_count: u32,
}

impl TickPlan {
    /// Slot written by the compute pass of this tick
    pub fn written_slot(&self) -> Parity {
        self.compute_bind_group.flipped()
    }
}

#[derive(Debug, PartialEq, Eq, thiserror::Error)]
pub enum SchedulerError {
    #[error("tick {0} is still being encoded")]
    TickInFlight(u64),
}

#[derive(Debug, thiserror::Error)]
pub enum TickError<E: std::error::Error + 'static> {
    #[error(transparent)]
    Scheduler(#[from] SchedulerError),
    #[error("tick could not be executed: {0}")]
    Execute(#[source] E),
}

pub struct StepScheduler {
    grid: GridDescriptor,
    parity: Parity,
    completed_steps: u64,
    state: SchedulerState,
    pending: bool,
    coalesced: u64,
}

impl StepScheduler {
    pub fn new(grid: GridDescriptor) -> StepScheduler {
        StepScheduler {
            grid,
            parity: Parity::EVEN,
            completed_steps: 0,
            state: SchedulerState::Idle,
            pending: false,
            coalesced: 0,
        }
    }

    /// Slot holding the most recent generation
    pub fn current_slot(&self) -> Parity {
        self.parity
    }

    pub fn completed_steps(&self) -> u64 {
        self.completed_steps
    }

    pub fn state(&self) -> SchedulerState {
        self.state
    }

    /// Timer fires that were merged into an already pending tick
    pub fn coalesced_ticks(&self) -> u64 {
        self.coalesced
    }

    /// Record a timer fire. At most one tick is ever pending, so returns
    /// `false` when this fire was folded into an existing one.
    pub fn request_tick(&mut self) -> bool {
        if self.pending {
            self.coalesced += 1;
            log::trace!("timer fired with a tick already pending");
            false
        } else {
            self.pending = true;
            true
        }
    }

    /// Run the pending tick, if any
    pub fn run_pending<F, E>(&mut self, execute: F) -> Result<Option<TickPlan>, TickError<E>>
    where
        F: FnOnce(&TickPlan) -> Result<(), E>,
        E: std::error::Error + 'static,
    {
        if !self.pending {
            return Ok(None);
        }
        self.pending = false;
        self.run_tick(execute).map(Some)
    }

    /// Plan a tick, hand it to `execute` and commit the parity change only if
    /// execution succeeded
    pub fn run_tick<F, E>(&mut self, execute: F) -> Result<TickPlan, TickError<E>>
    where
        F: FnOnce(&TickPlan) -> Result<(), E>,
        E: std::error::Error + 'static,
    {
        let plan = self.begin_tick()?;
        match execute(&plan) {
            Ok(()) => {
                self.finish_tick();
                Ok(plan)
            }
            Err(e) => {
                self.abort_tick();
                Err(TickError::Execute(e))
            }
        }
    }

    /// Enter `Stepping` and flip parity between the compute and render
    /// selections
    pub fn begin_tick(&mut self) -> Result<TickPlan, SchedulerError> {
        let step = self.completed_steps + 1;
        if self.state == SchedulerState::Stepping {
            return Err(SchedulerError::TickInFlight(step));
        }
        self.state = SchedulerState::Stepping;

        let compute_bind_group = self.parity;
        self.parity.flip();
        let render_bind_group = self.parity;

        Ok(TickPlan {
            step,
            compute_bind_group,
            render_bind_group,
            workgroups: self.grid.workgroup_counts(),
            vertex_count: VERTEX_COUNT,
            instance_count: self.grid.cell_count(),
        })
    }

    /// The tick was submitted
    pub fn finish_tick(&mut self) {
        debug_assert_eq!(self.state, SchedulerState::Stepping);
        self.state = SchedulerState::Idle;
        self.completed_steps += 1;
    }

    /// Nothing was submitted, so the slot written last is unchanged
    pub fn abort_tick(&mut self) {
        debug_assert_eq!(self.state, SchedulerState::Stepping);
        self.parity.flip();
        self.state = SchedulerState::Idle;
    }
}

/// Turns wall-clock time into timer fires at a fixed period
pub struct TickClock {
    interval_ms: f64,
    next_due: Option<f64>,
    skipped: u64,
}

impl TickClock {
    pub fn new(interval: Duration) -> TickClock {
        TickClock {
            interval_ms: interval.as_secs_f64() * 1000.0,
            next_due: None,
            skipped: 0,
        }
    }

    /// Whether the timer fires at `now_ms`. The first poll always fires. When
    /// more than one period was missed the schedule restarts from `now_ms`
    /// rather than firing repeatedly to catch up.
    pub fn poll(&mut self, now_ms: f64) -> bool {
        match self.next_due {
            None => {
                self.next_due = Some(now_ms + self.interval_ms);
                true
            }
            Some(due) if now_ms >= due => {
                let mut next = due + self.interval_ms;
                if now_ms >= next {
                    let missed = ((now_ms - due) / self.interval_ms).floor() as u64;
                    self.skipped += missed;
                    log::debug!("tick clock fell behind by {missed} periods, resynchronising");
                    next = now_ms + self.interval_ms;
                }
                self.next_due = Some(next);
                true
            }
            Some(_) => false,
        }
    }

    /// Time until the next fire, zero when already due
    pub fn time_until_due(&self, now_ms: f64) -> Duration {
        match self.next_due {
            Some(due) if due > now_ms => Duration::from_secs_f64((due - now_ms) / 1000.0),
            _ => Duration::ZERO,
        }
    }

    pub fn skipped_periods(&self) -> u64 {
        self.skipped
    }
}

/// Milliseconds since the Unix epoch
pub fn now_ms() -> f64 {
    #[cfg(target_arch = "wasm32")]
    {
        js_sys::Date::now()
    }
    #[cfg(not(target_arch = "wasm32"))]
    {
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_secs_f64() * 1000.0)
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, thiserror::Error)]
    #[error("surface unavailable")]
    struct NoSurface;

    fn grid(w: u32, h: u32) -> GridDescriptor {
        GridDescriptor::new(w, h, 8).unwrap()
    }

    fn ok(_: &TickPlan) -> Result<(), NoSurface> {
        Ok(())
    }

    #[test]
    fn test_render_reads_slot_just_written() {
        let mut scheduler = StepScheduler::new(grid(256, 256));
        let mut previous_render = scheduler.current_slot();
        for t in 0..64u64 {
            let plan = scheduler.run_tick(ok).unwrap();
            assert_eq!(plan.step, t + 1);
            assert_eq!(plan.render_bind_group, plan.written_slot());
            assert_ne!(plan.compute_bind_group, plan.render_bind_group);
            assert_ne!(plan.render_bind_group, previous_render);
            // Compute reads whatever was rendered last tick
            assert_eq!(plan.compute_bind_group, previous_render);
            assert_eq!(scheduler.current_slot(), plan.render_bind_group);
            previous_render = plan.render_bind_group;
        }
        assert_eq!(scheduler.completed_steps(), 64);
    }

    #[test]
    fn test_first_tick_reads_seeded_slot() {
        let mut scheduler = StepScheduler::new(grid(16, 16));
        let plan = scheduler.run_tick(ok).unwrap();
        assert_eq!(plan.compute_bind_group, Parity::EVEN);
        assert_eq!(plan.render_bind_group, Parity::ODD);
    }

    #[test]
    fn test_instance_count_matches_grid() {
        for (w, h) in [(1, 1), (3, 3), (37, 29), (256, 256), (1000, 3)] {
            let mut scheduler = StepScheduler::new(grid(w, h));
            for _ in 0..3 {
                let plan = scheduler.run_tick(ok).unwrap();
                assert_eq!(plan.instance_count, w * h);
                assert_eq!(plan.vertex_count, 6);
                assert_eq!(plan.workgroups, [w.div_ceil(8), h.div_ceil(8)]);
            }
        }
    }

    #[test]
    fn test_tick_is_not_reentrant() {
        let mut scheduler = StepScheduler::new(grid(8, 8));
        let plan = scheduler.begin_tick().unwrap();
        assert_eq!(scheduler.state(), SchedulerState::Stepping);
        assert_eq!(
            scheduler.begin_tick(),
            Err(SchedulerError::TickInFlight(plan.step))
        );
        scheduler.finish_tick();
        assert_eq!(scheduler.state(), SchedulerState::Idle);
        assert!(scheduler.begin_tick().is_ok());
    }

    #[test]
    fn test_failed_tick_keeps_parity() {
        let mut scheduler = StepScheduler::new(grid(8, 8));
        scheduler.run_tick(ok).unwrap();
        let before = scheduler.current_slot();

        let result = scheduler.run_tick(|_| Err(NoSurface));
        assert!(matches!(result, Err(TickError::Execute(NoSurface))));
        assert_eq!(scheduler.current_slot(), before);
        assert_eq!(scheduler.completed_steps(), 1);
        assert_eq!(scheduler.state(), SchedulerState::Idle);

        let plan = scheduler.run_tick(ok).unwrap();
        assert_eq!(plan.step, 2);
        assert_eq!(plan.compute_bind_group, before);
    }

    #[test]
    fn test_timer_fires_coalesce() {
        let mut scheduler = StepScheduler::new(grid(8, 8));
        assert_eq!(scheduler.run_pending(ok).unwrap(), None);

        assert!(scheduler.request_tick());
        assert!(!scheduler.request_tick());
        assert!(!scheduler.request_tick());
        assert_eq!(scheduler.coalesced_ticks(), 2);

        assert!(scheduler.run_pending(ok).unwrap().is_some());
        assert_eq!(scheduler.run_pending(ok).unwrap(), None);
        assert_eq!(scheduler.completed_steps(), 1);
    }

    #[test]
    fn test_clock_fires_on_period() {
        let mut clock = TickClock::new(Duration::from_millis(32));
        assert!(clock.poll(1000.0));
        assert!(!clock.poll(1010.0));
        let wait = clock.time_until_due(1010.0);
        assert!(wait > Duration::from_millis(21) && wait < Duration::from_millis(23));
        assert!(clock.poll(1032.0));
        assert!(!clock.poll(1063.0));
        assert!(clock.poll(1064.0));
        assert_eq!(clock.skipped_periods(), 0);
    }

    #[test]
    fn test_clock_resyncs_after_stall() {
        let mut clock = TickClock::new(Duration::from_millis(32));
        assert!(clock.poll(0.0));
        // Stalled for ~10 periods: one fire, not ten
        assert!(clock.poll(330.0));
        assert!(!clock.poll(331.0));
        assert_eq!(clock.skipped_periods(), 9);
        assert!(clock.poll(362.0));
    }
}
