//! SunSpec smart-meter emulation for EcoFlow PowerStream inverters.
//!
//! A Fronius-style inverter polls what it believes is its grid meter over
//! Modbus-TCP. This crate answers those polls from a [`RegisterTable`] that
//! the [`MeterEncoder`] rewrites whenever the EcoFlow cloud feed reports a
//! new output power.

pub mod auth;
pub mod codec;
pub mod config;
pub mod encoder;
pub mod energy;
pub mod error;
pub mod feed;
pub mod registers;
pub mod server;
pub mod traits;

pub use config::Config;
pub use encoder::{EncoderSettings, MeterEncoder, MeterReading, PowerSample};
pub use energy::{AccumulationPolicy, EnergyCounters};
pub use feed::EcoflowFeed;
pub use registers::{DeviceIdentity, RegisterTable};
pub use server::SmartMeterService;
pub use traits::HandleSample;
