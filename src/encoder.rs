//! Turns PowerStream output samples into the meter data block.
//!
//! The feed reports how much power the device pushes into the house. A grid
//! meter sees that as negative consumption, so the sample is negated before
//! encoding. Only the total real power and the total imported/exported
//! energy fields of the block carry data; everything else stays zero.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Instant;

use tracing::{info, warn};

use crate::codec::encode_f32;
use crate::energy::{AccumulationPolicy, EnergyCounters};
use crate::error::SampleError;
use crate::registers::{METER_BLOCK_LEN, RegisterTable};
use crate::traits::HandleSample;

// Offsets of the populated fields inside the model 213 data block
pub const TOTAL_POWER_OFFSET: usize = 26;
pub const TOTAL_EXPORTED_WH_OFFSET: usize = 58;
pub const TOTAL_IMPORTED_WH_OFFSET: usize = 66;

pub const DEFAULT_CORRECTION_FACTOR: f64 = 1000.0;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PowerSample {
    /// Device output in W, positive while the device feeds the house.
    pub output_watts: f64,
    pub received_at: Instant,
}

impl PowerSample {
    pub fn new(output_watts: f64, received_at: Instant) -> Self {
        Self {
            output_watts,
            received_at,
        }
    }

    pub fn now(output_watts: f64) -> Self {
        Self::new(output_watts, Instant::now())
    }
}

/// The quantities committed to the register table, as a client decodes them.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct MeterReading {
    pub power_w: f32,
    pub imported_wh: f32,
    pub exported_wh: f32,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EncoderSettings {
    /// Multiplier from the configured starting counters' unit to Wh.
    pub correction_factor: f64,
    pub accumulation: AccumulationPolicy,
}

impl Default for EncoderSettings {
    fn default() -> Self {
        Self {
            correction_factor: DEFAULT_CORRECTION_FACTOR,
            accumulation: AccumulationPolicy::default(),
        }
    }
}

#[derive(Debug)]
struct EncoderState {
    energy: EnergyCounters,
    last_sample: Option<PowerSample>,
}

pub struct MeterEncoder {
    table: Arc<RegisterTable>,
    settings: EncoderSettings,
    state: Mutex<EncoderState>,
}

impl MeterEncoder {
    /// `initial` is in the feed's energy unit and is converted to Wh with
    /// the correction factor; integrated energy is added in Wh directly.
    pub fn new(table: Arc<RegisterTable>, settings: EncoderSettings, initial: EnergyCounters) -> Self {
        Self {
            table,
            state: Mutex::new(EncoderState {
                energy: initial.scaled(settings.correction_factor),
                last_sample: None,
            }),
            settings,
        }
    }

    /// Encode `sample` and commit the full meter block.
    ///
    /// A sample that cannot be represented is logged and dropped; the
    /// registers and energy counters keep their previous values.
    pub fn update(&self, sample: PowerSample) -> Result<MeterReading, SampleError> {
        if let Err(err) = validate(sample.output_watts) {
            warn!("Skipping telemetry update: {}", err);
            return Err(err);
        }

        let mut state = self.lock_state();
        let mut sample = sample;
        let previous = state.last_sample;
        if let Some(previous) = previous {
            self.accumulate(&mut state.energy, previous, sample.received_at);
            // a heartbeat may already have integrated past this sample's stamp
            sample.received_at = sample.received_at.max(previous.received_at);
        }
        state.last_sample = Some(sample);
        Ok(self.commit(&state.energy, sample.output_watts))
    }

    /// Re-encode the last known sample as of `now`, if there is one.
    pub fn refresh(&self, now: Instant) -> Option<MeterReading> {
        let mut state = self.lock_state();
        let previous = state.last_sample?;
        self.accumulate(&mut state.energy, previous, now);
        state.last_sample = Some(PowerSample::new(previous.output_watts, now.max(previous.received_at)));
        Some(self.commit(&state.energy, previous.output_watts))
    }

    /// Running counters in Wh.
    pub fn energy(&self) -> EnergyCounters {
        self.lock_state().energy
    }

    fn accumulate(&self, energy: &mut EnergyCounters, previous: PowerSample, now: Instant) {
        if self.settings.accumulation == AccumulationPolicy::Integrate {
            let elapsed = now.saturating_duration_since(previous.received_at);
            energy.integrate(grid_power(previous.output_watts), elapsed);
        }
    }

    fn commit(&self, energy: &EnergyCounters, output_watts: f64) -> MeterReading {
        let reading = MeterReading {
            power_w: grid_power(output_watts) as f32,
            imported_wh: energy.imported.trunc() as f32,
            exported_wh: energy.exported.trunc() as f32,
        };

        self.table.replace_meter_block(encode_meter_block(&reading));
        info!(
            power_w = reading.power_w,
            imported_wh = reading.imported_wh,
            exported_wh = reading.exported_wh,
            "Updated meter registers"
        );
        reading
    }

    fn lock_state(&self) -> MutexGuard<'_, EncoderState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl HandleSample for MeterEncoder {
    fn handle_sample(&self, sample: PowerSample) {
        // rejected samples are already logged by update
        let _ = self.update(sample);
    }
}

/// Build the 124-register model 213 data block for `reading`.
pub fn encode_meter_block(reading: &MeterReading) -> [u16; METER_BLOCK_LEN] {
    let mut block = [0u16; METER_BLOCK_LEN];
    let fields = [
        (TOTAL_POWER_OFFSET, reading.power_w),
        (TOTAL_EXPORTED_WH_OFFSET, reading.exported_wh),
        (TOTAL_IMPORTED_WH_OFFSET, reading.imported_wh),
    ];
    for (offset, value) in fields {
        block[offset..offset + 2].copy_from_slice(&encode_f32(value));
    }
    block
}

/// Device output seen from the grid meter. Subtracting from zero keeps a
/// 0 W sample at +0.0.
fn grid_power(output_watts: f64) -> f64 {
    0.0 - output_watts
}

fn validate(output_watts: f64) -> Result<(), SampleError> {
    if !output_watts.is_finite() {
        Err(SampleError::NonFinite(output_watts))
    } else if output_watts.abs() > f64::from(f32::MAX) {
        Err(SampleError::OutOfRange(output_watts))
    } else {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::codec::decode_f32;
    use crate::registers::{DeviceIdentity, METER_BLOCK_START};

    fn meter_encoder(settings: EncoderSettings, energy: EnergyCounters) -> (Arc<RegisterTable>, MeterEncoder) {
        let table = Arc::new(RegisterTable::new(&DeviceIdentity::default(), 2).unwrap());
        let encoder = MeterEncoder::new(table.clone(), settings, energy);
        (table, encoder)
    }

    fn field(table: &RegisterTable, offset: usize) -> f32 {
        let block = table.meter_block();
        decode_f32([block[offset], block[offset + 1]])
    }

    fn hold() -> EncoderSettings {
        EncoderSettings {
            accumulation: AccumulationPolicy::Hold,
            ..EncoderSettings::default()
        }
    }

    #[test]
    fn zero_watts_leaves_the_power_registers_empty() {
        let (table, encoder) = meter_encoder(hold(), EnergyCounters::default());
        encoder.update(PowerSample::now(0.0)).unwrap();
        assert_eq!(table.meter_block(), [0; METER_BLOCK_LEN]);
    }

    #[test]
    fn device_output_is_reported_as_negative_grid_power() {
        let (table, encoder) = meter_encoder(hold(), EnergyCounters::default());
        let reading = encoder.update(PowerSample::now(123.4)).unwrap();

        assert_eq!(reading.power_w, -123.4);
        let block = table.meter_block();
        assert_eq!(&block[TOTAL_POWER_OFFSET..TOTAL_POWER_OFFSET + 2], &[0xC2F6, 0xCCCD]);
        assert_eq!(field(&table, TOTAL_POWER_OFFSET), -123.4);
    }

    #[test]
    fn energy_counters_are_scaled_and_truncated() {
        let (table, encoder) = meter_encoder(hold(), EnergyCounters::new(12.0, 7.5));
        encoder.update(PowerSample::now(50.0)).unwrap();
        assert_eq!(field(&table, TOTAL_IMPORTED_WH_OFFSET), 12000.0);
        assert_eq!(field(&table, TOTAL_EXPORTED_WH_OFFSET), 7500.0);

        let (table, encoder) = meter_encoder(hold(), EnergyCounters::new(0.0012349, 0.0));
        encoder.update(PowerSample::now(50.0)).unwrap();
        assert_eq!(field(&table, TOTAL_IMPORTED_WH_OFFSET), 1.0);
    }

    #[test]
    fn only_the_live_fields_are_populated() {
        let (table, encoder) = meter_encoder(hold(), EnergyCounters::new(1.0, 2.0));
        encoder.update(PowerSample::now(-400.0)).unwrap();
        let block = table.meter_block();
        for (index, value) in block.iter().enumerate() {
            let live = [TOTAL_POWER_OFFSET, TOTAL_EXPORTED_WH_OFFSET, TOTAL_IMPORTED_WH_OFFSET]
                .iter()
                .any(|offset| index == *offset || index == offset + 1);
            if !live {
                assert_eq!(*value, 0, "register {} should be zero", index);
            }
        }
        assert_eq!(field(&table, TOTAL_POWER_OFFSET), 400.0);
    }

    #[test]
    fn non_finite_samples_keep_the_previous_image() {
        let (table, encoder) = meter_encoder(EncoderSettings::default(), EnergyCounters::default());
        let start = Instant::now();
        encoder.update(PowerSample::new(250.0, start)).unwrap();
        let before = table.meter_block();

        let later = start + Duration::from_secs(60);
        assert_eq!(
            encoder.update(PowerSample::new(f64::NAN, later)).map_err(|e| e.to_string()),
            Err("power sample is not finite: NaN".to_string())
        );
        assert_eq!(
            encoder.update(PowerSample::new(f64::INFINITY, later)),
            Err(SampleError::NonFinite(f64::INFINITY))
        );
        assert_eq!(
            encoder.update(PowerSample::new(1e39, later)),
            Err(SampleError::OutOfRange(1e39))
        );

        assert_eq!(table.meter_block(), before);
        assert_eq!(encoder.energy(), EnergyCounters::default());
    }

    #[test]
    fn integrate_accumulates_between_samples() {
        let (table, encoder) = meter_encoder(EncoderSettings::default(), EnergyCounters::default());
        let start = Instant::now();

        // 1 kW of output for an hour is 1 kWh exported
        encoder.update(PowerSample::new(1000.0, start)).unwrap();
        encoder
            .update(PowerSample::new(-2000.0, start + Duration::from_secs(3600)))
            .unwrap();
        assert_eq!(field(&table, TOTAL_EXPORTED_WH_OFFSET), 1000.0);
        assert_eq!(field(&table, TOTAL_IMPORTED_WH_OFFSET), 0.0);

        // then 2 kW drawn from the grid for half an hour
        let reading = encoder
            .update(PowerSample::new(0.0, start + Duration::from_secs(5400)))
            .unwrap();
        assert_eq!(reading.imported_wh, 1000.0);
        assert_eq!(reading.exported_wh, 1000.0);
        assert_eq!(reading.power_w, 0.0);
    }

    #[test]
    fn hold_keeps_the_configured_counters() {
        let (_, encoder) = meter_encoder(hold(), EnergyCounters::new(5.0, 6.0));
        let start = Instant::now();
        encoder.update(PowerSample::new(1000.0, start)).unwrap();
        encoder
            .update(PowerSample::new(1000.0, start + Duration::from_secs(3600)))
            .unwrap();
        assert_eq!(encoder.energy(), EnergyCounters::new(5000.0, 6000.0));
    }

    #[test]
    fn refresh_reencodes_the_last_sample() {
        let (table, encoder) = meter_encoder(EncoderSettings::default(), EnergyCounters::default());
        let start = Instant::now();
        assert_eq!(encoder.refresh(start), None);

        encoder.update(PowerSample::new(-3600.0, start)).unwrap();
        table.replace_meter_block([0; METER_BLOCK_LEN]);

        let reading = encoder.refresh(start + Duration::from_secs(1000)).unwrap();
        assert_eq!(reading.power_w, 3600.0);
        assert_eq!(reading.imported_wh, 1000.0);
        assert_eq!(field(&table, TOTAL_POWER_OFFSET), 3600.0);
        assert_eq!(table.read(METER_BLOCK_START + TOTAL_POWER_OFFSET as u16, 2).unwrap()[0], 0x4561);
    }

    #[test]
    fn late_stamped_sample_after_heartbeat_is_not_integrated_twice() {
        let (_, encoder) = meter_encoder(EncoderSettings::default(), EnergyCounters::default());
        let start = Instant::now();

        // 3.6 kW drawn from the grid throughout
        encoder.update(PowerSample::new(-3600.0, start)).unwrap();
        encoder.refresh(start + Duration::from_secs(2000)).unwrap();
        encoder
            .update(PowerSample::new(-3600.0, start + Duration::from_secs(1000)))
            .unwrap();
        let reading = encoder
            .update(PowerSample::new(-3600.0, start + Duration::from_secs(3000)))
            .unwrap();

        assert_eq!(encoder.energy(), EnergyCounters::new(3000.0, 0.0));
        assert_eq!(reading.imported_wh, 3000.0);
    }

    #[test]
    fn correction_factor_only_scales_the_starting_counters() {
        let settings = EncoderSettings {
            correction_factor: 10.0,
            ..EncoderSettings::default()
        };
        let (table, encoder) = meter_encoder(settings, EnergyCounters::new(1.0, 2.0));
        let start = Instant::now();

        // 1 kW fed into the grid for an hour
        encoder.update(PowerSample::new(1000.0, start)).unwrap();
        let reading = encoder
            .update(PowerSample::new(1000.0, start + Duration::from_secs(3600)))
            .unwrap();

        assert_eq!(reading.imported_wh, 10.0);
        assert_eq!(reading.exported_wh, 1020.0);
        assert_eq!(field(&table, TOTAL_EXPORTED_WH_OFFSET), 1020.0);
    }
}
