use thiserror::Error;

/// Who gets the next tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tick {
    Mutator,
    Collector,
}

/// How mutator and collector ticks are interleaved.
#[derive(Debug, Clone, PartialEq)]
pub enum GcPolicy {
    /// Repeat the pattern forever.
    Schedule(Vec<Tick>),

    /// Give each tick to the collector with probability `collector`, drawn
    /// from a generator seeded with `seed`.
    Probability { collector: f64, seed: u64 },

    /// Never collect, not even when memory runs out.
    Disabled,
}

impl Default for GcPolicy {
    fn default() -> Self {
        GcPolicy::Schedule(vec![Tick::Mutator, Tick::Collector])
    }
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum PolicyError {
    #[error("unknown gc policy '{0}' (expected schedule:<m|c...>, p:<probability> or off)")]
    Unknown(String),

    #[error("schedule '{0}' must be made of 'm' and 'c' and contain at least one 'm'")]
    BadSchedule(String),

    #[error("collector probability must be a number in [0, 1), got '{0}'")]
    BadProbability(String),
}

impl GcPolicy {
    /// Parse the command-line form: `schedule:mcm`, `p:0.25` or `off`.
    pub fn parse(text: &str) -> Result<GcPolicy, PolicyError> {
        if text == "off" {
            return Ok(GcPolicy::Disabled);
        }

        if let Some(pattern) = text.strip_prefix("schedule:") {
            let ticks = pattern
                .chars()
                .map(|c| match c {
                    'm' => Ok(Tick::Mutator),
                    'c' => Ok(Tick::Collector),
                    _ => Err(PolicyError::BadSchedule(pattern.to_string())),
                })
                .collect::<Result<Vec<_>, _>>()?;
            if !ticks.contains(&Tick::Mutator) {
                return Err(PolicyError::BadSchedule(pattern.to_string()));
            }
            return Ok(GcPolicy::Schedule(ticks));
        }

        if let Some(p) = text.strip_prefix("p:") {
            return match p.parse::<f64>() {
                Ok(collector) if (0.0..1.0).contains(&collector) => Ok(GcPolicy::Probability {
                    collector,
                    seed: DEFAULT_SEED,
                }),
                _ => Err(PolicyError::BadProbability(p.to_string())),
            };
        }

        Err(PolicyError::Unknown(text.to_string()))
    }

    /// Replace the seed of a probabilistic policy.
    pub fn with_seed(self, seed: u64) -> GcPolicy {
        match self {
            GcPolicy::Probability { collector, .. } => GcPolicy::Probability { collector, seed },
            other => other,
        }
    }

    pub fn collects(&self) -> bool {
        !matches!(self, GcPolicy::Disabled)
    }
}

const DEFAULT_SEED: u64 = 0x12345678_9abcdef0;

/// Hands out ticks according to a [`GcPolicy`].
#[derive(Debug, Clone)]
pub struct Scheduler {
    policy: GcPolicy,
    position: usize,
    state: u64,
}

impl Scheduler {
    pub fn new(policy: GcPolicy) -> Self {
        let policy = match policy {
            // a schedule without mutator ticks would never finish
            GcPolicy::Schedule(mut ticks) if !ticks.contains(&Tick::Mutator) => {
                log::warn!("gc schedule has no mutator tick, appending one");
                ticks.push(Tick::Mutator);
                GcPolicy::Schedule(ticks)
            }
            GcPolicy::Probability { collector, seed } => GcPolicy::Probability {
                collector: collector.clamp(0.0, 0.99),
                seed,
            },
            other => other,
        };
        let state = match policy {
            // xorshift gets stuck at zero
            GcPolicy::Probability { seed: 0, .. } => DEFAULT_SEED,
            GcPolicy::Probability { seed, .. } => seed,
            _ => DEFAULT_SEED,
        };
        Self {
            policy,
            position: 0,
            state,
        }
    }

    pub fn policy(&self) -> &GcPolicy {
        &self.policy
    }

    pub fn next_tick(&mut self) -> Tick {
        match &self.policy {
            GcPolicy::Disabled => Tick::Mutator,
            GcPolicy::Schedule(ticks) => {
                let tick = ticks[self.position % ticks.len()];
                self.position = (self.position + 1) % ticks.len();
                tick
            }
            GcPolicy::Probability { collector, .. } => {
                let collector = *collector;
                if self.next_unit() < collector {
                    Tick::Collector
                } else {
                    Tick::Mutator
                }
            }
        }
    }

    /// Uniform in [0, 1).
    fn next_unit(&mut self) -> f64 {
        (self.next_u64() >> 11) as f64 / (1u64 << 53) as f64
    }

    /// xorshift64
    fn next_u64(&mut self) -> u64 {
        let mut x = self.state;
        x ^= x << 13;
        x ^= x >> 7;
        x ^= x << 17;
        self.state = x;
        x
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn take(scheduler: &mut Scheduler, n: usize) -> Vec<Tick> {
        (0..n).map(|_| scheduler.next_tick()).collect()
    }

    #[test]
    fn test_default_alternates() {
        let mut s = Scheduler::new(GcPolicy::default());
        assert_eq!(
            take(&mut s, 4),
            vec![Tick::Mutator, Tick::Collector, Tick::Mutator, Tick::Collector]
        );
    }

    #[test]
    fn test_schedule_cycles() {
        let mut s = Scheduler::new(GcPolicy::parse("schedule:mcc").unwrap());
        let ticks = take(&mut s, 6);
        assert_eq!(ticks[0], Tick::Mutator);
        assert_eq!(ticks[3], Tick::Mutator);
        assert_eq!(ticks.iter().filter(|t| **t == Tick::Collector).count(), 4);
    }

    #[test]
    fn test_probability_is_deterministic_per_seed() {
        let policy = GcPolicy::parse("p:0.3").unwrap().with_seed(7);
        let a = take(&mut Scheduler::new(policy.clone()), 200);
        let b = take(&mut Scheduler::new(policy), 200);
        assert_eq!(a, b);

        let collector = a.iter().filter(|t| **t == Tick::Collector).count();
        assert!(collector > 20 && collector < 120, "got {}", collector);
    }

    #[test]
    fn test_disabled_only_runs_mutator() {
        let mut s = Scheduler::new(GcPolicy::Disabled);
        assert!(take(&mut s, 10).iter().all(|t| *t == Tick::Mutator));
        assert!(!GcPolicy::Disabled.collects());
    }

    #[test]
    fn test_schedule_without_mutator_is_fixed() {
        let mut s = Scheduler::new(GcPolicy::Schedule(vec![Tick::Collector]));
        assert!(take(&mut s, 4).contains(&Tick::Mutator));
    }

    #[test]
    fn test_parse_errors() {
        assert_eq!(GcPolicy::parse("off").unwrap(), GcPolicy::Disabled);
        assert!(matches!(
            GcPolicy::parse("schedule:mx"),
            Err(PolicyError::BadSchedule(_))
        ));
        assert!(matches!(
            GcPolicy::parse("schedule:cc"),
            Err(PolicyError::BadSchedule(_))
        ));
        assert!(matches!(
            GcPolicy::parse("p:1.5"),
            Err(PolicyError::BadProbability(_))
        ));
        assert!(matches!(
            GcPolicy::parse("sometimes"),
            Err(PolicyError::Unknown(_))
        ));
    }
}
