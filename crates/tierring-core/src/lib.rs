#![warn(missing_docs)]

//! Tierring core: weighted, failure-domain aware partition rings
//!
//! A [`RingBuilder`] assigns every replica of every partition to a device,
//! spreading replicas across regions, zones, servers and devices and keeping
//! each device's share proportional to its weight. The builder emits
//! [`RingData`], which is written to a compact versioned file. Readers load
//! that file into a [`Ring`] to map object paths to partitions, partitions to
//! devices, and to walk handoff devices when primaries are unavailable.

pub mod builder;
pub mod config;
pub mod device;
pub mod error;
pub mod hash;
pub mod reload;
pub mod ring;
pub mod ring_data;
pub mod tier;

pub use builder::{RebalanceSummary, RingBuilder, ValidationStats, BUILDER_FORMAT_VERSION, INFINITE_BALANCE, MAX_PART_HOURS};
pub use config::RingConfig;
pub use device::{BuilderDevice, Device, DeviceId, DevicePattern, DeviceRegistry, DeviceSpec};
pub use error::{RingError, RingResult};
pub use hash::PathHasher;
pub use reload::spawn_reload_task;
pub use ring::{HandoffNodes, Ring};
pub use ring_data::{RingData, RING_FORMAT_VERSION, RING_MAGIC};
pub use tier::{Tier, TierIndex, TIER_DEPTH};
