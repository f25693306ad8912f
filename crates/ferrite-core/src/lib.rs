//! Cycle-accurate DDR5 memory-system timing engine.
//!
//! The hierarchy mirrors the device: a [`controller::MemoryController`]
//! fans out to sub-channels, each sub-channel owns ranks, each rank owns
//! banks. Requests enter as line addresses; what comes back is pure timing.

pub mod address;
pub mod bank;
pub mod command;
pub mod config;
pub mod controller;
pub mod error;
pub mod rank;
pub mod rng;
pub mod stats;
pub mod subchannel;
pub mod transaction;

pub use address::{AddressMapper, DecodedAddress};
pub use command::{Command, CommandKind};
pub use config::{DramConfig, DramTiming, MappingKind, PagePolicy, RfmMode, SpeedGrade};
pub use controller::MemoryController;
pub use error::Error;
