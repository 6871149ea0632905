//! Sample-rate timer division.
//!
//! The hardware timer that paces the stream is 16-bit; its update rate is
//! `timer_clock / ((prescaler + 1) * (reload + 1))`. [`TimerDivision::derive`]
//! picks the pair that best approximates a target sample rate: the smallest
//! reload with the prescaler held at zero, growing the prescaler only when
//! the reload would overflow 16 bits.

/// A prescaler/reload pair for the sample-rate timer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimerDivision {
    /// Prescaler register value (clock divides by `prescaler + 1`).
    pub prescaler: u16,
    /// Auto-reload register value (period is `reload + 1` counts).
    pub reload: u16,
}

impl TimerDivision {
    /// Derive the division for `sample_rate_hz` from `timer_clock_hz`.
    ///
    /// Zero inputs are treated as 1 so the derivation is total; the
    /// caller is expected to have validated the configuration.
    pub fn derive(timer_clock_hz: u32, sample_rate_hz: u32) -> Self {
        let timer_clock = u64::from(timer_clock_hz.max(1));
        let sample_rate = u64::from(sample_rate_hz.max(1));

        let ticks = (timer_clock / sample_rate).max(1);

        let mut prescaler: u64 = 0;
        if ticks > 65_536 {
            prescaler = (ticks + 65_535) / 65_536 - 1;
            if prescaler > 0xFFFF {
                prescaler = 0xFFFF;
            }
        }

        let reload_plus1 = (timer_clock / (sample_rate * (prescaler + 1))).clamp(1, 65_536);

        Self {
            prescaler: prescaler as u16,
            reload: (reload_plus1 - 1) as u16,
        }
    }

    /// Update rate actually produced by this division.
    pub fn achieved_hz(&self, timer_clock_hz: u32) -> f64 {
        let divider = (u64::from(self.prescaler) + 1) * (u64::from(self.reload) + 1);
        f64::from(timer_clock_hz) / divider as f64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TIMER_CLOCK_HZ: u32 = 240_000_000;

    fn assert_within_one_percent(target_hz: u32) {
        let division = TimerDivision::derive(TIMER_CLOCK_HZ, target_hz);
        let achieved = division.achieved_hz(TIMER_CLOCK_HZ);
        let error = (achieved - f64::from(target_hz)).abs() / f64::from(target_hz);
        assert!(
            error < 0.01,
            "{target_hz} Hz -> {division:?} achieves {achieved} Hz (error {error})"
        );
    }

    #[test]
    fn common_rates_within_one_percent() {
        assert_within_one_percent(48_000);
        assert_within_one_percent(240_000);
        assert_within_one_percent(120_000);
        assert_within_one_percent(44_100);
    }

    #[test]
    fn exact_division_prefers_zero_prescaler() {
        let division = TimerDivision::derive(TIMER_CLOCK_HZ, 48_000);
        assert_eq!(division.prescaler, 0);
        assert_eq!(division.reload, 4999);
    }

    #[test]
    fn slow_rates_grow_the_prescaler() {
        // 10 Hz needs 24M ticks, far past 16 bits.
        let division = TimerDivision::derive(TIMER_CLOCK_HZ, 10);
        assert!(division.prescaler > 0);
        let achieved = division.achieved_hz(TIMER_CLOCK_HZ);
        assert!((achieved - 10.0).abs() / 10.0 < 0.01);
    }

    #[test]
    fn degenerate_inputs_are_total() {
        let division = TimerDivision::derive(0, 0);
        assert_eq!(division.reload, 0);
        assert_eq!(division.prescaler, 0);
    }
}
