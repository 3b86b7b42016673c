//! Load strategies: turn the profile's load value into spawn requests.
//!
//! ```text
//!   scheduler ──set_load(v)──▶ strategy ──intended / available──▶ LoadControl
//!   block     ──connection_closed()──▶ strategy
//! ```
//!
//! Static strategies hold a target population and top it up whenever a
//! connection closes.  Rate strategies turn a per-second rate into a quota
//! released at each scheduler tick, carrying the fractional remainder.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;

use crate::config::LoadType;

/// Most AVAILABLE_LOAD messages allowed in flight to the I/O side.
pub const MAX_AVAILABLE_OUT: u32 = 2;

/// What a strategy drives.  Implemented by the client block.
pub trait LoadControl: Send + Sync {
    /// Keep `load` connections (or concurrent transactions) in flight.
    fn set_intended_load(&self, load: u32);

    /// Release `load` more connections (or transactions) now.  Returns false
    /// when the I/O side still has too many grants to work through; the
    /// caller keeps the credit and retries next tick.
    fn set_available_load(&self, load: u32) -> bool;
}

pub trait LoadStrategy: Send {
    fn load_type(&self) -> LoadType;

    /// New value from the scheduler.
    fn set_load(&mut self, load: i64, now: Instant);

    /// A connection owned by the block has closed.
    fn connection_closed(&mut self);

    /// Re-send the current target, e.g. after dynamic load is switched off.
    fn refresh(&mut self) {}

    /// Last value passed to `set_load`.
    fn load(&self) -> i64;
}

/// Connections needed to carry `load` bytes/s at `per_connection` each.
pub fn bandwidth_target(load: i64, per_connection: u32) -> u32 {
    if load <= 0 || per_connection == 0 {
        return 0;
    }
    let per = i64::from(per_connection);
    let n = (load + per - 1) / per;
    u32::try_from(n).unwrap_or(u32::MAX)
}

fn clamp_load(load: i64) -> u32 {
    u32::try_from(load.max(0)).unwrap_or(u32::MAX)
}

pub fn make_strategy(
    load_type: LoadType,
    bandwidth_per_connection: u32,
    ctl: Arc<dyn LoadControl>,
) -> Box<dyn LoadStrategy> {
    match load_type {
        LoadType::Connections | LoadType::Transactions => {
            Box::new(StaticStrategy::new(load_type, ctl))
        }
        LoadType::ConnectionsPerTimeUnit | LoadType::TransactionsPerTimeUnit => {
            Box::new(RateStrategy::new(load_type, ctl))
        }
        LoadType::Bandwidth => Box::new(BandwidthStrategy::new(bandwidth_per_connection, ctl)),
    }
}

// ---------------------------------------------------------------------------
// Static: connections, transactions
// ---------------------------------------------------------------------------

pub struct StaticStrategy {
    load_type: LoadType,
    ctl: Arc<dyn LoadControl>,
    load: i64,
    sent: Option<u32>,
}

impl StaticStrategy {
    pub fn new(load_type: LoadType, ctl: Arc<dyn LoadControl>) -> Self {
        Self {
            load_type,
            ctl,
            load: 0,
            sent: None,
        }
    }

    fn push(&mut self) {
        let target = clamp_load(self.load);
        self.sent = Some(target);
        self.ctl.set_intended_load(target);
    }
}

impl LoadStrategy for StaticStrategy {
    fn load_type(&self) -> LoadType {
        self.load_type
    }

    fn set_load(&mut self, load: i64, _now: Instant) {
        self.load = load;
        if self.sent != Some(clamp_load(load)) {
            log::trace!("[strategy {:?}] target {load}", self.load_type);
            self.push();
        }
    }

    fn connection_closed(&mut self) {
        if self.sent.is_some() {
            self.push();
        }
    }

    fn refresh(&mut self) {
        self.push();
    }

    fn load(&self) -> i64 {
        self.load
    }
}

// ---------------------------------------------------------------------------
// Rate: connections per time unit, transactions per time unit
// ---------------------------------------------------------------------------

pub struct RateStrategy {
    load_type: LoadType,
    ctl: Arc<dyn LoadControl>,
    load: i64,
    credit: f64,
    last: Option<Instant>,
}

impl RateStrategy {
    pub fn new(load_type: LoadType, ctl: Arc<dyn LoadControl>) -> Self {
        Self {
            load_type,
            ctl,
            load: 0,
            credit: 0.0,
            last: None,
        }
    }

    /// Whole units of credit waiting to be released.
    pub fn credit(&self) -> f64 {
        self.credit
    }
}

impl LoadStrategy for RateStrategy {
    fn load_type(&self) -> LoadType {
        self.load_type
    }

    fn set_load(&mut self, load: i64, now: Instant) {
        let elapsed = self
            .last
            .map_or(Duration::ZERO, |last| now.saturating_duration_since(last));
        self.last = Some(now);
        self.load = load;

        if load <= 0 {
            self.credit = 0.0;
            return;
        }
        self.credit += load as f64 * elapsed.as_secs_f64();
        let whole = self.credit.floor();
        if whole < 1.0 {
            return;
        }
        let grant = if whole >= f64::from(u32::MAX) {
            u32::MAX
        } else {
            whole as u32
        };
        if self.ctl.set_available_load(grant) {
            self.credit -= f64::from(grant);
        } else {
            log::trace!(
                "[strategy {:?}] holding {grant} until the I/O side catches up",
                self.load_type
            );
        }
    }

    fn connection_closed(&mut self) {}

    fn load(&self) -> i64 {
        self.load
    }
}

// ---------------------------------------------------------------------------
// Bandwidth
// ---------------------------------------------------------------------------

pub struct BandwidthStrategy {
    per_connection: u32,
    ctl: Arc<dyn LoadControl>,
    load: i64,
    sent: Option<u32>,
}

impl BandwidthStrategy {
    pub fn new(per_connection: u32, ctl: Arc<dyn LoadControl>) -> Self {
        Self {
            per_connection,
            ctl,
            load: 0,
            sent: None,
        }
    }

    fn push(&mut self) {
        let target = bandwidth_target(self.load, self.per_connection);
        self.sent = Some(target);
        self.ctl.set_intended_load(target);
    }
}

impl LoadStrategy for BandwidthStrategy {
    fn load_type(&self) -> LoadType {
        LoadType::Bandwidth
    }

    fn set_load(&mut self, load: i64, _now: Instant) {
        self.load = load;
        if self.sent != Some(bandwidth_target(load, self.per_connection)) {
            self.push();
        }
    }

    fn connection_closed(&mut self) {
        if self.sent.is_some() {
            self.push();
        }
    }

    fn refresh(&mut self) {
        self.push();
    }

    fn load(&self) -> i64 {
        self.load
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Mutex;

    #[derive(Default)]
    struct Recorder {
        intended: Mutex<Vec<u32>>,
        available: Mutex<Vec<u32>>,
        refuse: AtomicBool,
    }

    impl LoadControl for Recorder {
        fn set_intended_load(&self, load: u32) {
            self.intended.lock().unwrap().push(load);
        }
        fn set_available_load(&self, load: u32) -> bool {
            if self.refuse.load(Ordering::Relaxed) {
                return false;
            }
            self.available.lock().unwrap().push(load);
            true
        }
    }

    #[test]
    fn bandwidth_target_rounds_up() {
        assert_eq!(bandwidth_target(0, 100), 0);
        assert_eq!(bandwidth_target(-5, 100), 0);
        assert_eq!(bandwidth_target(1, 100), 1);
        assert_eq!(bandwidth_target(250, 100), 3);
        assert_eq!(bandwidth_target(300, 100), 3);
        assert_eq!(bandwidth_target(300, 0), 0);
    }

    #[test]
    fn static_target_is_sent_on_change_and_close() {
        let rec = Arc::new(Recorder::default());
        let mut s = make_strategy(LoadType::Connections, 0, rec.clone());
        let now = Instant::now();

        s.set_load(5, now);
        s.set_load(5, now);
        s.connection_closed();
        s.set_load(3, now);
        assert_eq!(*rec.intended.lock().unwrap(), vec![5, 5, 3]);
    }

    #[test]
    fn close_before_first_target_is_ignored() {
        let rec = Arc::new(Recorder::default());
        let mut s = make_strategy(LoadType::Transactions, 0, rec.clone());
        s.connection_closed();
        assert!(rec.intended.lock().unwrap().is_empty());
    }

    #[test]
    fn rate_accumulates_fractional_credit() {
        let rec = Arc::new(Recorder::default());
        let mut s = RateStrategy::new(LoadType::ConnectionsPerTimeUnit, rec.clone());
        let t0 = Instant::now();

        s.set_load(2, t0);
        // 2/s over 250 ms is half a connection; nothing yet.
        s.set_load(2, t0 + Duration::from_millis(250));
        assert!(rec.available.lock().unwrap().is_empty());
        s.set_load(2, t0 + Duration::from_millis(500));
        s.set_load(2, t0 + Duration::from_millis(2000));
        assert_eq!(*rec.available.lock().unwrap(), vec![1, 3]);
        assert!(s.credit() < 1.0);
    }

    #[test]
    fn refused_grant_keeps_credit() {
        let rec = Arc::new(Recorder::default());
        let mut s = RateStrategy::new(LoadType::TransactionsPerTimeUnit, rec.clone());
        let t0 = Instant::now();
        s.set_load(8, t0);
        rec.refuse.store(true, Ordering::Relaxed);
        s.set_load(8, t0 + Duration::from_millis(250));
        assert_eq!(s.credit(), 2.0);

        rec.refuse.store(false, Ordering::Relaxed);
        s.set_load(8, t0 + Duration::from_millis(500));
        assert_eq!(*rec.available.lock().unwrap(), vec![4]);
    }

    #[test]
    fn zero_rate_drops_credit() {
        let rec = Arc::new(Recorder::default());
        let mut s = RateStrategy::new(LoadType::ConnectionsPerTimeUnit, rec.clone());
        let t0 = Instant::now();
        s.set_load(5, t0);
        s.set_load(5, t0 + Duration::from_millis(100));
        s.set_load(0, t0 + Duration::from_millis(200));
        assert_eq!(s.credit(), 0.0);
        assert!(rec.available.lock().unwrap().is_empty());
    }

    #[test]
    fn bandwidth_recomputes_connection_count() {
        let rec = Arc::new(Recorder::default());
        let mut s = make_strategy(LoadType::Bandwidth, 1000, rec.clone());
        let now = Instant::now();
        s.set_load(2500, now);
        s.set_load(2600, now);
        s.set_load(0, now);
        s.refresh();
        assert_eq!(*rec.intended.lock().unwrap(), vec![3, 0, 0]);
    }
}
