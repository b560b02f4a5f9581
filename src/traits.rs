use crate::encoder::PowerSample;

/// Receives every telemetry sample the feed delivers.
pub trait HandleSample {
    fn handle_sample(&self, sample: PowerSample);
}
