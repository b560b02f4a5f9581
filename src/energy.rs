use std::time::Duration;

use clap::ValueEnum;

const SECONDS_PER_HOUR: f64 = 3600.0;

/// How the cumulative import/export counters evolve between samples.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, ValueEnum)]
pub enum AccumulationPolicy {
    /// Keep the counters at their configured starting values.
    Hold,
    /// Integrate grid power over the time between samples.
    #[default]
    Integrate,
}

/// Cumulative grid energy.
///
/// Configured starting values are in the feed's unit (kWh). The encoder
/// keeps its running counters in Wh, see [`EnergyCounters::scaled`].
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct EnergyCounters {
    pub imported: f64,
    pub exported: f64,
}

impl EnergyCounters {
    pub fn new(imported: f64, exported: f64) -> Self {
        Self { imported, exported }
    }

    /// Both counters multiplied by `factor`.
    pub fn scaled(&self, factor: f64) -> Self {
        Self::new(self.imported * factor, self.exported * factor)
    }

    /// Add `grid_watts` held for `elapsed`. Positive grid power is drawn
    /// from the grid, negative power is fed into it.
    pub fn integrate(&mut self, grid_watts: f64, elapsed: Duration) {
        let wh = grid_watts.abs() * elapsed.as_secs_f64() / SECONDS_PER_HOUR;
        if grid_watts > 0.0 {
            self.imported += wh;
        } else if grid_watts < 0.0 {
            self.exported += wh;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn one_kilowatt_for_an_hour() {
        let mut counters = EnergyCounters::default();
        counters.integrate(1000.0, Duration::from_secs(3600));
        assert_eq!(counters, EnergyCounters::new(1000.0, 0.0));

        counters.integrate(-500.0, Duration::from_secs(7200));
        assert_eq!(counters, EnergyCounters::new(1000.0, 1000.0));
    }

    #[test]
    fn scaling_converts_both_counters() {
        assert_eq!(
            EnergyCounters::new(12.0, 7.5).scaled(1000.0),
            EnergyCounters::new(12000.0, 7500.0)
        );
    }

    #[test]
    fn zero_power_or_zero_time_changes_nothing() {
        let mut counters = EnergyCounters::new(3.0, 4.0);
        counters.integrate(0.0, Duration::from_secs(60));
        counters.integrate(2500.0, Duration::ZERO);
        assert_eq!(counters, EnergyCounters::new(3.0, 4.0));
    }
}
