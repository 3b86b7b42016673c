//! Load profile evaluation.
//!
//! A profile is a sequence of phases laid end to end on a time axis.  Each
//! phase picks up from the value the previous one ended on (`y0`) and shapes
//! the load with its pattern:
//!
//! ```text
//!   Flat      Stair        Burst          Sawtooth      Sinusoid
//!    ____         __                      _   _
//!   /          __|        /\    /\       | |_| |_       /\    /\
//!  /        __|        __/  \__/  \__   _|              \/    \/
//! ```
//!
//! [`LoadProfile::eval`] returns the load at an elapsed time together with
//! the time at which the value next changes, so a scheduler can skip ticks
//! through flat stretches.

use std::f64::consts::PI;
use std::time::Duration;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::config::{LoadPattern, LoadPhase, LoadProfileConfig, MAX_PROFILE_DURATION};

/// Re-evaluation step while a phase is ramping.
pub const RAMP_QUANTUM: Duration = Duration::from_millis(50);

#[derive(Debug, Clone)]
struct PhaseProgram {
    phase: LoadPhase,
    y0: i64,
    start: Duration,
    duration: Duration,
    /// Random pattern only: per-segment offsets above `y0`.
    targets: Vec<i64>,
}

fn lerp(from: i64, to: i64, at: Duration, span: Duration) -> i64 {
    if span.is_zero() {
        return to;
    }
    let frac = at.as_secs_f64() / span.as_secs_f64();
    from + ((to - from) as f64 * frac).round() as i64
}

impl PhaseProgram {
    fn new(phase: LoadPhase, y0: i64, start: Duration, seed: u64) -> Self {
        let targets = if phase.pattern == LoadPattern::Random {
            let mut rng = StdRng::seed_from_u64(seed);
            (0..phase.repetitions)
                .map(|_| i64::from(rng.random_range(0..=phase.height)))
                .collect()
        } else {
            Vec::new()
        };
        Self {
            phase,
            y0,
            start,
            // Validated profiles always fit; saturate otherwise.
            duration: phase.duration().unwrap_or(MAX_PROFILE_DURATION),
            targets,
        }
    }

    fn height(&self) -> i64 {
        i64::from(self.phase.height)
    }

    fn period(&self) -> Duration {
        self.phase.ramp_time + self.phase.steady_time
    }

    fn end_value(&self) -> i64 {
        let reps = i64::from(self.phase.repetitions);
        match self.phase.pattern {
            LoadPattern::Flat => self.height(),
            LoadPattern::Stair => self.y0 + self.height() * reps,
            LoadPattern::Sawtooth if reps > 0 => self.y0 + self.height(),
            LoadPattern::Sawtooth
            | LoadPattern::Burst
            | LoadPattern::Sinusoid
            | LoadPattern::Random => self.y0,
        }
    }

    /// Index of the repetition containing `t`, and the offset into it.
    fn segment(&self, t: Duration) -> (u32, Duration) {
        let period = self.period();
        if period.is_zero() || self.phase.repetitions == 0 {
            return (0, t);
        }
        let k = (t.as_nanos() / period.as_nanos()) as u32;
        let k = k.min(self.phase.repetitions - 1);
        (k, t.saturating_sub(period * k))
    }

    /// Value at `t` (relative to the phase start) and the relative time of
    /// the next change.
    fn eval(&self, t: Duration) -> (i64, Option<Duration>) {
        if t >= self.duration {
            return (self.end_value(), None);
        }
        let ramp = self.phase.ramp_time;
        let h = self.height();
        let y0 = self.y0;

        match self.phase.pattern {
            LoadPattern::Flat => {
                if t < ramp {
                    (lerp(y0, h, t, ramp), Some(t + RAMP_QUANTUM))
                } else {
                    (h, Some(self.duration))
                }
            }
            LoadPattern::Stair => {
                let (k, u) = self.segment(t);
                let base = y0 + h * i64::from(k);
                if u < ramp {
                    (lerp(base, base + h, u, ramp), Some(t + RAMP_QUANTUM))
                } else {
                    (base + h, Some(self.period() * (k + 1)))
                }
            }
            LoadPattern::Burst => {
                let (k, u) = self.segment(t);
                let peak = y0 + h * i64::from(k + 1);
                let half = ramp / 2;
                // Taller bursts are sampled more finely.
                let step = RAMP_QUANTUM / (k + 1);
                if u < half {
                    (lerp(y0, peak, u, half), Some(t + step))
                } else if u < ramp {
                    (lerp(peak, y0, u - half, ramp - half), Some(t + step))
                } else {
                    (y0, Some(self.period() * (k + 1)))
                }
            }
            LoadPattern::Sawtooth => {
                let (k, u) = self.segment(t);
                if u < ramp {
                    (y0, Some(self.period() * k + ramp))
                } else {
                    (y0 + h, Some(self.period() * (k + 1)))
                }
            }
            LoadPattern::Sinusoid => {
                let angle = 2.0 * PI * t.as_secs_f64() / self.period().as_secs_f64();
                let v = y0 + (h as f64 * angle.sin()).round() as i64;
                (v.max(0), Some(t + RAMP_QUANTUM))
            }
            LoadPattern::Random => {
                let (k, u) = self.segment(t);
                let idx = k as usize;
                let from = match idx {
                    0 => y0,
                    _ => y0 + self.targets.get(idx - 1).copied().unwrap_or(0),
                };
                let to = y0 + self.targets.get(idx).copied().unwrap_or(0);
                if u < ramp {
                    (lerp(from, to, u, ramp), Some(t + RAMP_QUANTUM))
                } else {
                    (to, Some(self.period() * (k + 1)))
                }
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct LoadProfile {
    phases: Vec<PhaseProgram>,
    duration: Duration,
}

impl LoadProfile {
    pub fn new(cfg: &LoadProfileConfig) -> Self {
        let mut phases = Vec::with_capacity(cfg.phases.len());
        let mut y0 = 0;
        let mut start = Duration::ZERO;
        for (i, phase) in cfg.phases.iter().enumerate() {
            let seed = cfg.randomization_seed.wrapping_add(i as u64);
            let program = PhaseProgram::new(*phase, y0, start, seed);
            y0 = program.end_value();
            start = start.saturating_add(program.duration);
            phases.push(program);
        }
        Self {
            phases,
            duration: start,
        }
    }

    pub fn duration(&self) -> Duration {
        self.duration
    }

    /// Load at `elapsed`, and the elapsed time at which to evaluate again
    /// (`None` once the profile is over).
    pub fn eval(&self, elapsed: Duration) -> (i64, Option<Duration>) {
        for p in &self.phases {
            if elapsed < p.start + p.duration {
                let (value, next) = p.eval(elapsed - p.start);
                return (value, next.map(|n| p.start + n));
            }
        }
        match self.phases.last() {
            Some(p) => (p.end_value(), None),
            None => (0, None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const Y0: i64 = 1000;

    fn secs(s: u64) -> Duration {
        Duration::from_secs(s)
    }

    fn program(pattern: LoadPattern, reps: u32, ramp: u64, steady: u64) -> PhaseProgram {
        let phase = LoadPhase {
            pattern,
            height: 100,
            ramp_time: secs(ramp),
            steady_time: secs(steady),
            repetitions: reps,
        };
        PhaseProgram::new(phase, Y0, Duration::ZERO, 7)
    }

    #[test]
    fn flat_ramps_from_previous_level() {
        let p = program(LoadPattern::Flat, 1, 10, 50);
        assert_eq!(p.duration, secs(60));
        assert_eq!(p.eval(Duration::ZERO), (Y0, Some(RAMP_QUANTUM)));
        assert_eq!(p.eval(secs(5)), (550, Some(secs(5) + RAMP_QUANTUM)));
        assert_eq!(p.eval(secs(10)), (100, Some(secs(60))));
        assert_eq!(p.eval(secs(35)), (100, Some(secs(60))));
        assert_eq!(p.eval(secs(60)), (100, None));
    }

    #[test]
    fn stair_climbs_one_height_per_step() {
        let p = program(LoadPattern::Stair, 4, 10, 50);
        assert_eq!(p.duration, secs(240));
        assert_eq!(p.eval(secs(5)).0, Y0 + 50);
        assert_eq!(p.eval(secs(10)), (Y0 + 100, Some(secs(60))));
        assert_eq!(p.eval(secs(65)).0, Y0 + 150);
        assert_eq!(p.eval(secs(70)), (Y0 + 200, Some(secs(120))));
        assert_eq!(p.eval(secs(240)), (Y0 + 400, None));
    }

    #[test]
    fn burst_peaks_grow_each_repetition() {
        let p = program(LoadPattern::Burst, 4, 40, 20);
        assert_eq!(p.duration, secs(240));
        assert_eq!(p.eval(secs(10)).0, Y0 + 50);
        assert_eq!(p.eval(secs(20)), (Y0 + 100, Some(secs(20) + RAMP_QUANTUM)));
        assert_eq!(p.eval(secs(30)).0, Y0 + 50);
        assert_eq!(p.eval(secs(50)), (Y0, Some(secs(60))));
        assert_eq!(p.eval(secs(70)), (Y0 + 100, Some(secs(70) + RAMP_QUANTUM / 2)));
        assert_eq!(p.eval(secs(80)).0, Y0 + 200);
        assert_eq!(p.eval(secs(110)), (Y0, Some(secs(120))));
        assert_eq!(p.eval(secs(240)), (Y0, None));
    }

    #[test]
    fn sawtooth_alternates_pause_and_height() {
        let p = program(LoadPattern::Sawtooth, 4, 30, 30);
        assert_eq!(p.eval(Duration::ZERO), (Y0, Some(secs(30))));
        assert_eq!(p.eval(secs(45)), (Y0 + 100, Some(secs(60))));
        assert_eq!(p.eval(secs(75)), (Y0, Some(secs(90))));
        assert_eq!(p.eval(secs(240)), (Y0 + 100, None));
    }

    #[test]
    fn sinusoid_swings_around_y0() {
        let p = program(LoadPattern::Sinusoid, 4, 30, 30);
        assert_eq!(p.duration, secs(240));
        assert_eq!(p.eval(Duration::ZERO).0, Y0);
        assert_eq!(p.eval(secs(15)).0, Y0 + 100);
        assert_eq!(p.eval(secs(30)).0, Y0);
        assert_eq!(p.eval(secs(45)).0, Y0 - 100);
        assert_eq!(p.eval(secs(75)).0, Y0 + 100);
        assert_eq!(p.eval(secs(240)), (Y0, None));
    }

    #[test]
    fn random_stays_within_height_and_is_seeded() {
        let p = program(LoadPattern::Random, 100, 30, 30);
        assert_eq!(p.duration, secs(6000));
        assert_eq!(p.eval(Duration::ZERO).0, Y0);
        for rep in 0..100 {
            let v = p.eval(secs(60) * rep).0;
            assert!((Y0..=Y0 + 100).contains(&v), "rep {rep}: {v}");
        }
        assert_eq!(p.eval(secs(6000)), (Y0, None));

        let q = program(LoadPattern::Random, 100, 30, 30);
        assert_eq!(p.targets, q.targets);
    }

    #[test]
    fn phases_chain_their_levels() {
        let cfg = LoadProfileConfig {
            phases: vec![
                LoadPhase::flat(0, Duration::ZERO, secs(10)),
                LoadPhase {
                    pattern: LoadPattern::Stair,
                    height: 100,
                    ramp_time: secs(30),
                    steady_time: Duration::ZERO,
                    repetitions: 1,
                },
                LoadPhase::flat(40, secs(10), secs(10)),
            ],
            ..LoadProfileConfig::default()
        };
        let profile = LoadProfile::new(&cfg);
        assert_eq!(profile.duration(), secs(60));
        assert_eq!(profile.eval(secs(5)), (0, Some(secs(10))));
        assert_eq!(profile.eval(secs(25)).0, 50);
        assert_eq!(profile.eval(secs(45)).0, 70);
        assert_eq!(profile.eval(secs(55)), (40, Some(secs(60))));
        assert_eq!(profile.eval(secs(600)), (40, None));
    }
}
