//! Builder state persistence.
//!
//! The builder file is a bincode blob whose first two fields are a magic
//! number and a format version, so a reader can reject foreign or newer files
//! before decoding the rest.

use std::fs::{self, File};
use std::io::Write;
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use super::RingBuilder;
use crate::device::{DeviceId, DeviceRegistry};
use crate::error::{RingError, RingResult};

/// Builder file magic: "RBLD" = 0x52424c44
pub const BUILDER_MAGIC: u32 = 0x52424c44;
/// Current builder file format version.
pub const BUILDER_FORMAT_VERSION: u32 = 1;

#[derive(Debug, Deserialize)]
struct BuilderHeader {
    magic: u32,
    version: u32,
}

#[derive(Debug, Serialize, Deserialize)]
struct BuilderState {
    magic: u32,
    version: u32,
    part_power: u32,
    replicas: f64,
    min_part_hours: u32,
    parts: u64,
    devs: DeviceRegistry,
    devs_changed: bool,
    builder_version: u64,
    replica2part2dev: Vec<Vec<DeviceId>>,
    last_part_moves_epoch: Option<u64>,
    last_part_moves: Vec<u8>,
    last_part_gather_start: u64,
    remove_devs: Vec<DeviceId>,
}

impl RingBuilder {
    /// Serializes the full builder state.
    pub fn to_bytes(&self) -> RingResult<Vec<u8>> {
        let state = BuilderState {
            magic: BUILDER_MAGIC,
            version: BUILDER_FORMAT_VERSION,
            part_power: self.part_power,
            replicas: self.replicas,
            min_part_hours: self.min_part_hours,
            parts: self.parts as u64,
            devs: self.devs.clone(),
            devs_changed: self.devs_changed,
            builder_version: self.version,
            replica2part2dev: self.replica2part2dev.clone(),
            last_part_moves_epoch: self.last_part_moves_epoch,
            last_part_moves: self.last_part_moves.clone(),
            last_part_gather_start: self.last_part_gather_start as u64,
            remove_devs: self.remove_devs.clone(),
        };
        bincode::serialize(&state).map_err(|e| RingError::Serialization {
            reason: e.to_string(),
        })
    }

    /// Restores a builder from [`to_bytes`](Self::to_bytes) output.
    pub fn from_bytes(data: &[u8]) -> RingResult<Self> {
        let header: BuilderHeader =
            bincode::deserialize(data).map_err(|e| RingError::CorruptRing {
                reason: format!("builder header unreadable: {}", e),
            })?;
        if header.magic != BUILDER_MAGIC {
            debug!(
                expected = BUILDER_MAGIC,
                actual = header.magic,
                "invalid builder magic"
            );
            return Err(RingError::CorruptRing {
                reason: format!(
                    "invalid builder magic: expected {:#x}, got {:#x}",
                    BUILDER_MAGIC, header.magic
                ),
            });
        }
        if header.version != BUILDER_FORMAT_VERSION {
            return Err(RingError::UnknownFormatVersion {
                version: header.version,
            });
        }

        let state: BuilderState =
            bincode::deserialize(data).map_err(|e| RingError::CorruptRing {
                reason: format!("builder state unreadable: {}", e),
            })?;
        let parts = 1u64
            .checked_shl(state.part_power)
            .filter(|_| state.part_power <= 32);
        if parts != Some(state.parts) {
            return Err(RingError::CorruptRing {
                reason: format!(
                    "part count {} does not match part power {}",
                    state.parts, state.part_power
                ),
            });
        }

        let builder = Self {
            part_power: state.part_power,
            replicas: state.replicas,
            min_part_hours: state.min_part_hours,
            parts: state.parts as usize,
            devs: state.devs,
            devs_changed: state.devs_changed,
            version: state.builder_version,
            replica2part2dev: state.replica2part2dev,
            last_part_moves_epoch: state.last_part_moves_epoch,
            last_part_moves: state.last_part_moves,
            last_part_gather_start: state.last_part_gather_start as usize,
            remove_devs: state.remove_devs,
            ring: None,
        };
        builder.check_state()?;
        Ok(builder)
    }

    /// Structural checks on a decoded builder, so a stale or edited file
    /// fails at load instead of during the next rebalance.
    fn check_state(&self) -> RingResult<()> {
        let corrupt = |reason: String| RingError::CorruptRing { reason };

        match self.last_part_moves_epoch {
            None if !self.last_part_moves.is_empty() || !self.replica2part2dev.is_empty() => {
                return Err(corrupt(
                    "partitions are assigned but the cooldown epoch is unset".to_string(),
                ));
            }
            Some(_) if self.last_part_moves.len() != self.parts => {
                return Err(corrupt(format!(
                    "cooldown table has {} entries for {} partitions",
                    self.last_part_moves.len(),
                    self.parts
                )));
            }
            _ => {}
        }

        let last = self.replica2part2dev.len().saturating_sub(1);
        for (replica, part2dev) in self.replica2part2dev.iter().enumerate() {
            let fits = if replica == last {
                !part2dev.is_empty() && part2dev.len() <= self.parts
            } else {
                part2dev.len() == self.parts
            };
            if !fits {
                return Err(corrupt(format!(
                    "replica {} has {} partitions, expected {}",
                    replica,
                    part2dev.len(),
                    self.parts
                )));
            }
        }

        if let Some(&id) = self.remove_devs.iter().find(|&&id| !self.devs.contains(id)) {
            return Err(corrupt(format!("device {} queued for removal does not exist", id)));
        }

        self.validate(false).map_err(|e| match e {
            RingError::Validation(reason) => corrupt(reason),
            other => other,
        })?;
        Ok(())
    }

    /// Writes the builder to `path` through a temporary file and a rename.
    pub fn save(&self, path: impl AsRef<Path>) -> RingResult<()> {
        let path = path.as_ref();
        let encoded = self.to_bytes()?;
        let mut tmp_path = path.to_path_buf();
        tmp_path.set_extension("tmp");

        {
            let mut tmp_file = File::create(&tmp_path)?;
            tmp_file.write_all(&encoded)?;
            tmp_file.sync_all()?;
        }
        fs::rename(&tmp_path, path)?;

        info!(path = %path.display(), bytes = encoded.len(), version = self.version, "saved builder");
        Ok(())
    }

    /// Reads a builder previously written by [`save`](Self::save).
    pub fn load(path: impl AsRef<Path>) -> RingResult<Self> {
        let path = path.as_ref();
        let data = fs::read(path)?;
        let builder = Self::from_bytes(&data)?;
        debug!(path = %path.display(), devices = builder.devs.len(), "loaded builder");
        Ok(builder)
    }
}
