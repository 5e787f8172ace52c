//! Shroud — encrypted peer-to-peer overlay networking
//!
//! Each node attaches a virtual L3 tunnel with a private address drawn from
//! a shared overlay subnet. Packets written to that interface are enveloped,
//! sealed with AES-128-GCM under an X25519-agreed session key, and forwarded
//! over a public UDP socket to the peer owning the destination address. A
//! distributed key/value store is the control plane: it holds the overlay
//! definition and the live peer set under expiring leases.

pub mod api;
pub mod config;
pub mod crypto;
pub mod device;
pub mod error;
pub mod mapping;
pub mod metric;
pub mod payload;
pub mod plugin;
pub mod router;
pub mod socket;
pub mod store;
pub mod supervisor;
pub mod worker;

pub use config::Config;
pub use crypto::KeyPair;
pub use error::{Error, Result};
pub use mapping::{Mapping, MappingRecord};
pub use router::RouteTable;

/// The crate version, exposed for startup logging
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
