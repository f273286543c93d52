//! Tick timing and interpolation.
//!
//! The server sends discrete snapshots at tick boundaries. The client renders
//! at its own rate, so each frame computes how far it is between the last two
//! received ticks (`intra_tick`) and which tick the local prediction should
//! simulate (`pred_tick`).
//!
//! All functions take `now` explicitly; nothing here reads the wall clock.

use std::time::{Duration, Instant};

use engine_shared::config::EngineConfig;

/// Largest `f32` strictly below 1.0.
const BELOW_ONE: f32 = 1.0 - f32::EPSILON;

/// Highest server tick a session accepts. Leaves room for the prediction
/// offset on top of it.
pub const MAX_TICK: i32 = i32::MAX / 2;

/// Server ticks are non-negative and at most [`MAX_TICK`].
pub fn is_valid_tick(tick: i32) -> bool {
    (0..=MAX_TICK).contains(&tick)
}

/// What `TickClock::on_tick` did with a received tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickAdvance {
    /// `prev = cur`, `cur = tick`.
    Advanced,
    /// First tick, or the gap exceeded the jitter threshold; clock snapped.
    Resynced,
    /// Tick is not newer than the current one.
    Stale,
}

/// Per-session server tick clock.
#[derive(Debug, Clone)]
pub struct TickClock {
    tick_duration: Duration,
    prediction_margin: i32,
    jitter_threshold: i32,

    prev_tick: i32,
    cur_tick: i32,
    /// Local time the current tick was received.
    cur_tick_at: Option<Instant>,
    intra_tick: f32,
    tick_time: f32,

    pred_tick: i32,
    pred_intra_tick: f32,
}

impl TickClock {
    pub fn new(cfg: &EngineConfig) -> Self {
        let mut clock = Self {
            tick_duration: cfg.tick_duration(),
            prediction_margin: cfg.prediction_margin_ticks as i32,
            jitter_threshold: cfg.jitter_threshold_ticks as i32,
            prev_tick: -1,
            cur_tick: -1,
            cur_tick_at: None,
            intra_tick: 0.0,
            tick_time: 0.0,
            pred_tick: -1,
            pred_intra_tick: 0.0,
        };
        clock.reset();
        clock
    }

    /// Re-reads policy values; tick counters are left alone.
    pub fn configure(&mut self, cfg: &EngineConfig) {
        self.tick_duration = cfg.tick_duration();
        self.prediction_margin = cfg.prediction_margin_ticks as i32;
        self.jitter_threshold = cfg.jitter_threshold_ticks as i32;
    }

    /// Forgets every tick. Used on connect, disconnect and enter-game.
    pub fn reset(&mut self) {
        self.prev_tick = -1;
        self.cur_tick = -1;
        self.cur_tick_at = None;
        self.intra_tick = 0.0;
        self.tick_time = 0.0;
        self.pred_tick = -1;
        self.pred_intra_tick = 0.0;
    }

    pub fn is_synced(&self) -> bool {
        self.cur_tick_at.is_some()
    }

    /// Would `tick` be accepted by `on_tick`?
    pub fn accepts(&self, tick: i32) -> bool {
        !self.is_synced() || tick > self.cur_tick
    }

    /// Records a newly applied server tick received at `now`.
    pub fn on_tick(&mut self, tick: i32, now: Instant) -> TickAdvance {
        if !self.accepts(tick) {
            return TickAdvance::Stale;
        }

        let gap = i64::from(tick) - i64::from(self.cur_tick);
        let advance = if !self.is_synced() || gap > i64::from(self.jitter_threshold) {
            self.prev_tick = tick.saturating_sub(1);
            TickAdvance::Resynced
        } else {
            self.prev_tick = self.cur_tick;
            TickAdvance::Advanced
        };
        self.cur_tick = tick;
        self.cur_tick_at = Some(now);
        self.update(now);
        advance
    }

    /// Recomputes the interpolation and prediction values for a render frame.
    pub fn update(&mut self, now: Instant) {
        let Some(at) = self.cur_tick_at else {
            return;
        };
        let tick_secs = self.tick_duration.as_secs_f32();
        let elapsed = now.saturating_duration_since(at).as_secs_f32();

        let span = (i64::from(self.cur_tick) - i64::from(self.prev_tick)).max(1) as f32 * tick_secs;
        self.intra_tick = (elapsed / span).clamp(0.0, BELOW_ONE);
        self.tick_time = elapsed / tick_secs;

        let ticks_ahead = elapsed / tick_secs;
        let whole = ticks_ahead.floor();
        // `as` saturates on huge elapsed times.
        self.pred_tick = self
            .cur_tick
            .saturating_add(self.prediction_margin)
            .saturating_add(whole as i32);
        self.pred_intra_tick = (ticks_ahead - whole).clamp(0.0, BELOW_ONE);
    }

    pub fn prev_tick(&self) -> i32 {
        self.prev_tick
    }

    pub fn cur_tick(&self) -> i32 {
        self.cur_tick
    }

    /// Fraction in `[0, 1)` between `prev_tick` and `cur_tick`.
    pub fn intra_tick(&self) -> f32 {
        self.intra_tick
    }

    /// Ticks elapsed since the current tick arrived, unclamped.
    pub fn tick_time(&self) -> f32 {
        self.tick_time
    }

    pub fn pred_tick(&self) -> i32 {
        self.pred_tick
    }

    pub fn pred_intra_tick(&self) -> f32 {
        self.pred_intra_tick
    }

    pub fn tick_duration(&self) -> Duration {
        self.tick_duration
    }
}

/// Process-wide frame timing, independent of any session.
#[derive(Debug, Clone)]
pub struct FrameClock {
    start: Instant,
    last_frame: Option<Instant>,
    local_time: f32,
    frame_time: f32,
    tick_hz: u32,
}

impl FrameClock {
    pub fn new(start: Instant, tick_hz: u32) -> Self {
        Self {
            start,
            last_frame: None,
            local_time: 0.0,
            frame_time: 0.0,
            tick_hz: tick_hz.max(1),
        }
    }

    pub fn set_tick_hz(&mut self, tick_hz: u32) {
        self.tick_hz = tick_hz.max(1);
    }

    /// Marks the start of a render frame.
    pub fn begin_frame(&mut self, now: Instant) {
        if let Some(last) = self.last_frame {
            self.frame_time = now.saturating_duration_since(last).as_secs_f32();
        }
        self.last_frame = Some(now);
        self.local_time = now.saturating_duration_since(self.start).as_secs_f32();
    }

    /// Seconds since start, as of the last frame.
    pub fn local_time(&self) -> f32 {
        self.local_time
    }

    /// Duration of the last frame in seconds.
    pub fn render_frame_time(&self) -> f32 {
        self.frame_time
    }

    /// Ticks at the game tick rate since start.
    pub fn menu_tick(&self) -> i64 {
        (f64::from(self.local_time) * f64::from(self.tick_hz)) as i64
    }

    pub fn game_tick_speed(&self) -> u32 {
        self.tick_hz
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn clock() -> TickClock {
        TickClock::new(&EngineConfig::default())
    }

    #[test]
    fn first_tick_resyncs() {
        let mut c = clock();
        let t0 = Instant::now();
        assert_eq!(c.on_tick(100, t0), TickAdvance::Resynced);
        assert_eq!(c.cur_tick(), 100);
        assert_eq!(c.prev_tick(), 99);
        assert_eq!(c.pred_tick(), 102);
    }

    #[test]
    fn stale_and_duplicate_ticks_are_ignored() {
        let mut c = clock();
        let t0 = Instant::now();
        c.on_tick(10, t0);
        assert_eq!(c.on_tick(10, t0), TickAdvance::Stale);
        assert_eq!(c.on_tick(9, t0), TickAdvance::Stale);
        assert_eq!(c.cur_tick(), 10);
    }

    #[test]
    fn large_gap_snaps() {
        let mut c = clock();
        let t0 = Instant::now();
        c.on_tick(10, t0);
        assert_eq!(c.on_tick(12, t0), TickAdvance::Advanced);
        assert_eq!(c.prev_tick(), 10);
        assert_eq!(c.on_tick(100, t0), TickAdvance::Resynced);
        assert_eq!(c.prev_tick(), 99);
    }

    #[test]
    fn intra_tick_stays_below_one() {
        let mut c = clock();
        let t0 = Instant::now();
        c.on_tick(1, t0);
        c.update(t0 + Duration::from_millis(10));
        assert!((c.intra_tick() - 0.5).abs() < 1e-3);
        c.update(t0 + Duration::from_secs(5));
        assert!(c.intra_tick() < 1.0);
        assert!(c.intra_tick() >= 0.0);
    }

    #[test]
    fn prediction_runs_ahead_with_elapsed_time() {
        let mut c = clock();
        let t0 = Instant::now();
        c.on_tick(50, t0);
        c.update(t0 + Duration::from_millis(50));
        assert_eq!(c.pred_tick(), 50 + 2 + 2);
        assert!((c.pred_intra_tick() - 0.5).abs() < 1e-3);
    }

    #[test]
    fn extreme_ticks_saturate() {
        let mut c = clock();
        let t0 = Instant::now();
        assert_eq!(c.on_tick(-100, t0), TickAdvance::Resynced);
        assert_eq!(c.on_tick(i32::MAX - 10, t0), TickAdvance::Resynced);
        assert_eq!(c.prev_tick(), i32::MAX - 11);
        c.update(t0 + Duration::from_secs(3600));
        assert_eq!(c.pred_tick(), i32::MAX);
        assert!(c.intra_tick() < 1.0);

        let mut c = clock();
        c.on_tick(i32::MIN, t0);
        assert_eq!(c.prev_tick(), i32::MIN);
        assert!(c.pred_tick() < 0);
    }

    #[test]
    fn tick_range() {
        assert!(is_valid_tick(0));
        assert!(is_valid_tick(MAX_TICK));
        assert!(!is_valid_tick(-1));
        assert!(!is_valid_tick(MAX_TICK + 1));
        assert!(!is_valid_tick(i32::MAX));
    }

    #[test]
    fn reset_forgets_ticks() {
        let mut c = clock();
        c.on_tick(7, Instant::now());
        c.reset();
        assert!(!c.is_synced());
        assert_eq!(c.cur_tick(), -1);
        assert!(c.accepts(1));
    }

    #[test]
    fn frame_clock_counts_menu_ticks() {
        let t0 = Instant::now();
        let mut f = FrameClock::new(t0, 50);
        f.begin_frame(t0 + Duration::from_millis(100));
        f.begin_frame(t0 + Duration::from_millis(130));
        assert_eq!(f.menu_tick(), 6);
        assert!((f.render_frame_time() - 0.03).abs() < 1e-4);
    }
}
