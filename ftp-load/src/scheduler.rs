//! Drives a load strategy from a profile.
//!
//! The owner calls [`LoadScheduler::tick`] every [`RAMP_QUANTUM`] while the
//! scheduler runs.  When the profile is exhausted the load drops to zero and
//! the state-change callback reports `false`.

use tokio::time::Instant;

pub use crate::load_profile::RAMP_QUANTUM;
use crate::load_profile::LoadProfile;
use crate::load_strategy::LoadStrategy;

/// Invoked with `true` on start and `false` when the profile ends or the
/// scheduler is stopped.
pub type StateCallback = Box<dyn FnMut(bool) + Send>;

/// Runs a [`LoadProfile`] against wall time and feeds each value to a
/// [`LoadStrategy`].  The owner calls [`tick`](Self::tick) on its own cadence.
pub struct LoadScheduler {
    profile: LoadProfile,
    started_at: Option<Instant>,
    on_state_change: StateCallback,
}

impl LoadScheduler {
    pub fn new(profile: LoadProfile, on_state_change: StateCallback) -> Self {
        Self {
            profile,
            started_at: None,
            on_state_change,
        }
    }

    pub fn is_running(&self) -> bool {
        self.started_at.is_some()
    }

    pub fn profile(&self) -> &LoadProfile {
        &self.profile
    }

    pub fn start(&mut self, now: Instant, strategy: &mut dyn LoadStrategy) {
        if self.is_running() {
            return;
        }
        log::info!(
            "[scheduler] starting {:?} profile, {:?} long",
            strategy.load_type(),
            self.profile.duration()
        );
        self.started_at = Some(now);
        (self.on_state_change)(true);
        self.tick(now, strategy);
    }

    /// Reports `false` through the callback if the scheduler was running.
    pub fn stop(&mut self) {
        if self.started_at.take().is_some() {
            log::info!("[scheduler] stopped");
            (self.on_state_change)(false);
        }
    }

    /// Push the current profile value into `strategy`.  Returns false once
    /// the scheduler is no longer running.
    pub fn tick(&mut self, now: Instant, strategy: &mut dyn LoadStrategy) -> bool {
        let Some(started_at) = self.started_at else {
            return false;
        };
        let elapsed = now.saturating_duration_since(started_at);
        let (value, next) = self.profile.eval(elapsed);
        strategy.set_load(value, now);
        if next.is_none() {
            log::info!("[scheduler] profile complete after {elapsed:?}");
            strategy.set_load(0, now);
            self.stop();
            return false;
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{LoadPhase, LoadProfileConfig, LoadType};
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    #[derive(Default)]
    struct Log {
        loads: Vec<i64>,
    }

    struct MockStrategy(Arc<Mutex<Log>>);

    impl LoadStrategy for MockStrategy {
        fn load_type(&self) -> LoadType {
            LoadType::Connections
        }
        fn set_load(&mut self, load: i64, _now: Instant) {
            self.0.lock().unwrap().loads.push(load);
        }
        fn connection_closed(&mut self) {}
        fn load(&self) -> i64 {
            self.0.lock().unwrap().loads.last().copied().unwrap_or(0)
        }
    }

    fn scheduler(states: Arc<Mutex<Vec<bool>>>) -> LoadScheduler {
        let cfg = LoadProfileConfig {
            phases: vec![LoadPhase::flat(10, Duration::from_secs(10), Duration::from_secs(10))],
            ..LoadProfileConfig::default()
        };
        LoadScheduler::new(
            LoadProfile::new(&cfg),
            Box::new(move |running| states.lock().unwrap().push(running)),
        )
    }

    #[test]
    fn start_reports_running_and_pushes_first_value() {
        let states = Arc::new(Mutex::new(Vec::new()));
        let log = Arc::new(Mutex::new(Log::default()));
        let mut strategy = MockStrategy(log.clone());
        let mut sched = scheduler(states.clone());

        let t0 = Instant::now();
        sched.start(t0, &mut strategy);
        sched.start(t0, &mut strategy);
        assert!(sched.is_running());
        assert!(sched.tick(t0 + Duration::from_secs(5), &mut strategy));
        assert_eq!(*states.lock().unwrap(), vec![true]);
        assert_eq!(log.lock().unwrap().loads, vec![0, 5]);
    }

    #[test]
    fn profile_end_drops_load_and_reports_stopped() {
        let states = Arc::new(Mutex::new(Vec::new()));
        let log = Arc::new(Mutex::new(Log::default()));
        let mut strategy = MockStrategy(log.clone());
        let mut sched = scheduler(states.clone());

        let t0 = Instant::now();
        sched.start(t0, &mut strategy);
        assert!(!sched.tick(t0 + Duration::from_secs(20), &mut strategy));
        assert!(!sched.is_running());
        assert!(!sched.tick(t0 + Duration::from_secs(21), &mut strategy));
        assert_eq!(*states.lock().unwrap(), vec![true, false]);
        assert_eq!(log.lock().unwrap().loads, vec![0, 10, 0]);
    }

    #[test]
    fn stop_is_reported_once() {
        let states = Arc::new(Mutex::new(Vec::new()));
        let mut strategy = MockStrategy(Arc::default());
        let mut sched = scheduler(states.clone());
        sched.start(Instant::now(), &mut strategy);
        sched.stop();
        sched.stop();
        assert_eq!(*states.lock().unwrap(), vec![true, false]);
    }
}
