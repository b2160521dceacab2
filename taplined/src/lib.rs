mod error;
pub use error::*;

pub mod supervisor;

#[cfg(feature = "pcap")]
pub mod tap;
