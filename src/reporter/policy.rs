use std::time::Duration;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SamplingMode {
    Normal,
    LowPower,
}

/// Cadence and accuracy the reporter should use after a fix.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SamplingDecision {
    pub mode: SamplingMode,
    pub interval: Duration,
    pub high_accuracy: bool,
}

#[derive(Clone, Debug)]
pub struct SamplingPolicy {
    pub normal_interval: Duration,
    pub low_power_interval: Duration,
    /// Used in low-power mode when the reserve itself is low.
    pub critical_interval: Duration,
    /// Fraction of battery, `0.0..=1.0`.
    pub low_reserve_threshold: f64,
    /// Metres per second below which the device counts as stationary.
    pub stationary_speed: f64,
}

impl Default for SamplingPolicy {
    fn default() -> Self {
        Self {
            normal_interval: Duration::from_secs(10),
            low_power_interval: Duration::from_secs(60),
            critical_interval: Duration::from_secs(120),
            low_reserve_threshold: 0.15,
            stationary_speed: 0.5,
        }
    }
}

impl SamplingPolicy {
    pub fn with_normal_interval(mut self, interval: Duration) -> Self {
        self.normal_interval = interval;
        self
    }

    /// Unknown speed or reserve never triggers low-power mode on its own.
    pub fn decide(&self, speed: Option<f64>, reserve: Option<f64>) -> SamplingDecision {
        let low_reserve = reserve.map_or(false, |r| r < self.low_reserve_threshold);
        let stationary = speed.map_or(false, |s| s.abs() < self.stationary_speed);

        if low_reserve || stationary {
            SamplingDecision {
                mode: SamplingMode::LowPower,
                interval: if low_reserve {
                    self.critical_interval
                } else {
                    self.low_power_interval
                },
                high_accuracy: false,
            }
        } else {
            self.normal()
        }
    }

    pub fn normal(&self) -> SamplingDecision {
        SamplingDecision {
            mode: SamplingMode::Normal,
            interval: self.normal_interval,
            high_accuracy: true,
        }
    }
}
