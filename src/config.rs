use std::net::IpAddr;

use clap::Parser;

use crate::auth::ApiCredentials;
use crate::encoder::{DEFAULT_CORRECTION_FACTOR, EncoderSettings};
use crate::energy::{AccumulationPolicy, EnergyCounters};
use crate::error::ConfigError;
use crate::registers::DeviceIdentity;

/// Emulates a SunSpec smart meter over Modbus-TCP, fed by an EcoFlow PowerStream
#[derive(Debug, Clone, Parser)]
#[command(author, version, about, long_about = None)]
pub struct Config {
    /// Address the Modbus server binds to
    #[arg(long, env = "MODBUS_LISTEN", default_value = "0.0.0.0")]
    pub listen: IpAddr,

    /// Modbus-TCP port
    #[arg(short, long, env = "MODBUS_PORT", default_value_t = 502)]
    pub port: u16,

    /// Meter address offset, reported as 239 + offset
    #[arg(long, env = "SMART_METER_ADDRESS", default_value_t = 2)]
    pub device_offset: u16,

    /// Multiplier from the starting counters' unit (kWh) to Wh
    #[arg(long, env = "CORRECTION_FACTOR", default_value_t = DEFAULT_CORRECTION_FACTOR)]
    pub correction_factor: f64,

    /// Whether import/export counters integrate power or hold their initial values
    #[arg(long, env = "ENERGY_ACCUMULATION", value_enum, default_value_t = AccumulationPolicy::Integrate)]
    pub accumulation: AccumulationPolicy,

    /// Imported energy at startup, in kWh
    #[arg(long, env = "INITIAL_IMPORT_KWH", default_value_t = 0.0)]
    pub initial_import: f64,

    /// Exported energy at startup, in kWh
    #[arg(long, env = "INITIAL_EXPORT_KWH", default_value_t = 0.0)]
    pub initial_export: f64,

    /// Re-encode the last sample this often when the feed is quiet
    #[arg(long, env = "HEARTBEAT_SECS")]
    pub heartbeat_secs: Option<u64>,

    #[arg(long, env = "METER_MANUFACTURER", default_value = "Fronius")]
    pub manufacturer: String,

    #[arg(long, env = "METER_MODEL", default_value = "Smart Meter 63A")]
    pub model: String,

    #[arg(long, env = "METER_SERIAL", default_value = "00000001")]
    pub meter_serial: String,

    /// EcoFlow open API base URL
    #[arg(long, env = "ECOFLOW_API_HOST")]
    pub api_host: Option<String>,

    #[arg(long, env = "ECOFLOW_API_ACCESS_KEY", hide_env_values = true)]
    pub access_key: Option<String>,

    #[arg(long, env = "ECOFLOW_API_SECRET_KEY", hide_env_values = true)]
    pub secret_key: Option<String>,

    /// Serial number of the PowerStream to follow
    #[arg(long, env = "ECOFLOW_POWERSTREAM_SN")]
    pub serial_number: Option<String>,

    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    pub log_level: tracing::Level,
}

impl Config {
    /// Check everything that does not need the network.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.correction_factor.is_finite() || self.correction_factor <= 0.0 {
            return Err(ConfigError::InvalidCorrectionFactor(self.correction_factor));
        }
        for (counter, value) in [("import", self.initial_import), ("export", self.initial_export)] {
            if !value.is_finite() || value < 0.0 {
                return Err(ConfigError::InvalidInitialEnergy { counter, value });
            }
        }
        self.api_credentials()?;
        self.serial_number()?;
        Ok(())
    }

    pub fn identity(&self) -> DeviceIdentity {
        DeviceIdentity {
            manufacturer: self.manufacturer.clone(),
            model: self.model.clone(),
            serial: self.meter_serial.clone(),
            ..DeviceIdentity::default()
        }
    }

    pub fn encoder_settings(&self) -> EncoderSettings {
        EncoderSettings {
            correction_factor: self.correction_factor,
            accumulation: self.accumulation,
        }
    }

    pub fn initial_energy(&self) -> EnergyCounters {
        EnergyCounters::new(self.initial_import, self.initial_export)
    }

    pub fn api_credentials(&self) -> Result<ApiCredentials, ConfigError> {
        Ok(ApiCredentials {
            host: required(&self.api_host, "ECOFLOW_API_HOST")?,
            access_key: required(&self.access_key, "ECOFLOW_API_ACCESS_KEY")?,
            secret_key: required(&self.secret_key, "ECOFLOW_API_SECRET_KEY")?,
        })
    }

    pub fn serial_number(&self) -> Result<String, ConfigError> {
        required(&self.serial_number, "ECOFLOW_POWERSTREAM_SN")
    }
}

fn required(value: &Option<String>, name: &'static str) -> Result<String, ConfigError> {
    value
        .as_deref()
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(str::to_string)
        .ok_or(ConfigError::MissingSetting(name))
}
