//! Data model: datastreams, datafeeds, applications, devices and assets,
//! plus the reading/marker rows and support types (alarms, occurrence
//! clusters) that flow between components.

mod alarm;
mod application;
mod asset;
mod datafeed;
mod datastream;
mod device;
mod enums;
mod occurrence_cluster;
mod readings;

pub use alarm::*;
pub use application::*;
pub use asset::*;
pub use datafeed::*;
pub use datastream::*;
pub use device::*;
pub use enums::*;
pub use occurrence_cluster::*;
pub use readings::*;
