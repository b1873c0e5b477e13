//! Ring builder: device registry mutations, rebalancing and validation.
//!
//! The builder owns the partition-to-device assignment and is single-writer.
//! Mutations (`add_dev`, `set_dev_weight`, `remove_dev`) never rebalance on
//! their own so that several changes can be applied before one
//! [`RingBuilder::rebalance`].

mod gather;
mod persist;
mod placement;

use std::collections::BTreeMap;
use std::time::{SystemTime, UNIX_EPOCH};

use rand::rngs::StdRng;
use rand::SeedableRng;
use tracing::{debug, info};

use crate::device::{BuilderDevice, Device, DeviceId, DevicePattern, DeviceRegistry, DeviceSpec};
use crate::error::{RingError, RingResult};
use crate::ring_data::RingData;

pub use persist::BUILDER_FORMAT_VERSION;

/// Balance reported when a zero-weight device still holds partitions.
pub const INFINITE_BALANCE: f64 = 999.99;

/// Saturation value of the per-partition move-cooldown counters.
pub const MAX_PART_HOURS: u8 = 0xff;

const SECS_PER_HOUR: u64 = 3600;

/// A batch of `(partition, replica indices)` pairs awaiting placement.
pub(crate) type PartReplicas = Vec<(usize, Vec<usize>)>;

/// Outcome of a rebalance.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RebalanceSummary {
    /// Partitions touched during this rebalance.
    pub parts_moved: usize,
    /// Final balance: the worst device skew in percent.
    pub balance: f64,
}

/// Optional statistics returned by [`RingBuilder::validate`].
#[derive(Debug, Clone, PartialEq)]
pub struct ValidationStats {
    /// Partition-replicas per device slot, indexed by device id.
    pub dev_usage: Vec<u32>,
    /// Worst skew in percent from any device's weight-proportional target.
    pub worst: f64,
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Builds [`RingData`] by assigning partition replicas to weighted devices.
#[derive(Debug, Clone)]
pub struct RingBuilder {
    part_power: u32,
    replicas: f64,
    min_part_hours: u32,
    parts: usize,
    devs: DeviceRegistry,
    devs_changed: bool,
    version: u64,
    /// Replica index -> partition -> device id.
    replica2part2dev: Vec<Vec<DeviceId>>,
    /// Unix time the cooldown counters are relative to; `None` until the first balance.
    last_part_moves_epoch: Option<u64>,
    /// Hours since each partition last moved, saturating at 255.
    last_part_moves: Vec<u8>,
    last_part_gather_start: usize,
    remove_devs: Vec<DeviceId>,
    ring: Option<RingData>,
}

impl RingBuilder {
    /// Creates a builder for `2^part_power` partitions.
    pub fn new(part_power: u32, replicas: f64, min_part_hours: u32) -> RingResult<Self> {
        if part_power > 32 {
            return Err(RingError::InvalidParameter(format!(
                "part_power must be at most 32 (was {})",
                part_power
            )));
        }
        validate_replicas(replicas)?;
        Ok(Self {
            part_power,
            replicas,
            min_part_hours,
            parts: 1usize << part_power,
            devs: DeviceRegistry::new(),
            devs_changed: false,
            version: 0,
            replica2part2dev: Vec::new(),
            last_part_moves_epoch: None,
            last_part_moves: Vec::new(),
            last_part_gather_start: 0,
            remove_devs: Vec::new(),
            ring: None,
        })
    }

    /// Partition power.
    pub fn part_power(&self) -> u32 {
        self.part_power
    }

    /// Number of partitions.
    pub fn parts(&self) -> usize {
        self.parts
    }

    /// Replica count, possibly fractional.
    pub fn replicas(&self) -> f64 {
        self.replicas
    }

    /// Minimum hours between moves of the same partition.
    pub fn min_part_hours(&self) -> u32 {
        self.min_part_hours
    }

    /// Whether devices changed since the last rebalance.
    pub fn devs_changed(&self) -> bool {
        self.devs_changed
    }

    /// Monotonic change counter.
    pub fn version(&self) -> u64 {
        self.version
    }

    /// The device registry.
    pub fn devices(&self) -> &DeviceRegistry {
        &self.devs
    }

    /// Ids of devices removed but not yet drained.
    pub fn pending_removals(&self) -> &[DeviceId] {
        &self.remove_devs
    }

    /// The assignment table: replica index -> partition -> device id.
    pub fn assignments(&self) -> &[Vec<DeviceId>] {
        &self.replica2part2dev
    }

    /// Hours since `part` last moved, or `None` before the first balance.
    pub fn hours_since_moved(&self, part: usize) -> Option<u8> {
        self.last_part_moves.get(part).copied()
    }

    /// Total replica slots: `parts * replicas`.
    fn max_slots(&self) -> i64 {
        (self.parts as f64 * self.replicas) as i64
    }

    /// Partitions each unit of weight should hold.
    pub fn weight_of_one_part(&self) -> RingResult<f64> {
        let total = self.devs.total_weight();
        if total <= 0.0 {
            return Err(RingError::EmptyRing);
        }
        Ok(self.parts as f64 * self.replicas / total)
    }

    /// Adds a device. Does not rebalance.
    ///
    /// Takes the next id after the highest live id unless the spec names one;
    /// naming the id of a live device fails with `DuplicateDevice`.
    pub fn add_dev(&mut self, spec: DeviceSpec) -> RingResult<DeviceId> {
        validate_weight(spec.weight)?;
        let id = self.devs.insert(spec)?;
        self.set_parts_wanted()?;
        self.mark_changed();
        if let Some(dev) = self.devs.get(id) {
            info!(id, device = %dev.info, weight = dev.info.weight, "added device");
        }
        Ok(id)
    }

    /// Changes a device's weight. Does not rebalance.
    pub fn set_dev_weight(&mut self, id: DeviceId, weight: f64) -> RingResult<()> {
        validate_weight(weight)?;
        self.devs.require_mut(id)?.info.weight = weight;
        self.set_parts_wanted()?;
        self.mark_changed();
        info!(id, weight, "set device weight");
        Ok(())
    }

    /// Sets a device's weight to zero and queues it for deletion once its
    /// partitions have been reassigned. Does not rebalance.
    pub fn remove_dev(&mut self, id: DeviceId) -> RingResult<()> {
        self.devs.require_mut(id)?.info.weight = 0.0;
        if !self.remove_devs.contains(&id) {
            self.remove_devs.push(id);
        }
        self.set_parts_wanted()?;
        self.mark_changed();
        info!(id, "queued device for removal");
        Ok(())
    }

    /// Changes the replica count. Marks devices changed when the total
    /// number of replica slots changes.
    pub fn set_replicas(&mut self, replicas: f64) -> RingResult<()> {
        validate_replicas(replicas)?;
        let old_slots = self.max_slots();
        self.replicas = replicas;
        if old_slots != self.max_slots() {
            self.devs_changed = true;
        }
        self.ring = None;
        self.set_parts_wanted()
    }

    /// Changes how long a partition must stay put before it may move again.
    pub fn change_min_part_hours(&mut self, min_part_hours: u32) {
        self.min_part_hours = min_part_hours;
    }

    /// Marks every partition as moved 255 hours ago so the next rebalance is
    /// free to move anything.
    pub fn pretend_min_part_hours_passed(&mut self) {
        self.last_part_moves.fill(MAX_PART_HOURS);
    }

    /// Returns the live devices matching `pattern`.
    pub fn search_devs(&self, pattern: &DevicePattern) -> Vec<&Device> {
        self.devs.search(pattern).into_iter().map(|d| &d.info).collect()
    }

    /// Distinct devices holding replicas of `part`, in replica order.
    pub fn get_part_devices(&self, part: usize) -> Vec<&Device> {
        let mut out: Vec<&Device> = Vec::new();
        for dev in self.devs_for_part(part) {
            if !out.iter().any(|d| d.id == dev.info.id) {
                out.push(&dev.info);
            }
        }
        out
    }

    /// Ring data for the current assignment, cached until the next change.
    pub fn get_ring(&mut self) -> &RingData {
        let part_shift = 32 - self.part_power;
        self.ring.get_or_insert_with(|| {
            RingData::new(
                self.replica2part2dev.clone(),
                self.devs.ring_devices(),
                part_shift,
            )
        })
    }

    fn mark_changed(&mut self) {
        self.devs_changed = true;
        self.version += 1;
        self.ring = None;
    }

    /// Recomputes every device's `parts_wanted` from its weight.
    fn set_parts_wanted(&mut self) -> RingResult<()> {
        let weight_of_one_part = if self.devs.iter().any(|d| d.info.weight > 0.0) {
            self.weight_of_one_part()?
        } else {
            0.0
        };
        let drain = -self.max_slots();
        for dev in self.devs.iter_mut() {
            dev.parts_wanted = if dev.info.weight > 0.0 {
                (weight_of_one_part * dev.info.weight) as i64 - dev.parts as i64
            } else {
                drain
            };
        }
        Ok(())
    }

    /// Rebalances using the current wall clock.
    ///
    /// A seed makes the run reproducible.
    pub fn rebalance(&mut self, seed: Option<u64>) -> RingResult<RebalanceSummary> {
        self.rebalance_at(seed, unix_now())
    }

    /// Rebalances as if the current time were `now` (seconds since the epoch).
    pub fn rebalance_at(&mut self, seed: Option<u64>, now: u64) -> RingResult<RebalanceSummary> {
        self.weight_of_one_part()?;
        let mut rng = match seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        self.ring = None;

        if self.last_part_moves_epoch.is_none() {
            return self.initial_balance(now, &mut rng);
        }

        self.update_last_part_moves(now);
        let (new_parts, removed_replicas) = self.adjust_replica2part2dev_size();
        self.set_parts_wanted()?;
        let mut parts_moved = removed_replicas + new_parts.len();
        self.reassign_parts(&new_parts, &mut rng)?;

        let mut last_balance = 0.0;
        let mut iterations = 0u32;
        let balance = loop {
            iterations += 1;
            let batch = self.gather_reassign_parts(&mut rng);
            debug!(iteration = iterations, batch = batch.len(), "gathered partitions to reassign");
            self.reassign_parts(&batch, &mut rng)?;
            parts_moved += batch.len();
            self.recycle_removed_devs();
            let balance = self.get_balance()?;
            if balance < 1.0 || (last_balance - balance).abs() < 1.0 || parts_moved >= self.parts {
                break balance;
            }
            last_balance = balance;
        };

        self.devs_changed = false;
        self.version += 1;
        info!(parts_moved, balance, iterations, version = self.version, "rebalanced ring");
        Ok(RebalanceSummary {
            parts_moved,
            balance,
        })
    }

    fn initial_balance(&mut self, now: u64, rng: &mut StdRng) -> RingResult<RebalanceSummary> {
        self.last_part_moves = vec![0; self.parts];
        self.last_part_moves_epoch = Some(now);
        let (to_assign, _) = self.adjust_replica2part2dev_size();
        self.set_parts_wanted()?;
        self.reassign_parts(&to_assign, rng)?;
        self.recycle_removed_devs();

        let balance = self.get_balance()?;
        self.devs_changed = false;
        self.version += 1;
        info!(parts = self.parts, balance, "initial ring balance");
        Ok(RebalanceSummary {
            parts_moved: self.parts,
            balance,
        })
    }

    /// Advances the cooldown counters by the whole hours elapsed since the
    /// epoch. Leftover seconds carry over to the next call.
    fn update_last_part_moves(&mut self, now: u64) {
        let Some(epoch) = self.last_part_moves_epoch else {
            return;
        };
        let elapsed_hours = now.saturating_sub(epoch) / SECS_PER_HOUR;
        if elapsed_hours == 0 {
            return;
        }
        let step = elapsed_hours.min(MAX_PART_HOURS as u64) as u8;
        for hours in self.last_part_moves.iter_mut() {
            *hours = hours.saturating_add(step);
        }
        self.last_part_moves_epoch = Some(epoch + elapsed_hours * SECS_PER_HOUR);
    }

    /// Resizes the replica arrays to the current replica count.
    ///
    /// With `parts = 256` and `replicas = 2.25` the table ends up with two
    /// arrays of 256 entries and one of 64. Returns the slots that need a
    /// device, grouped by partition, and the number of slots dropped.
    fn adjust_replica2part2dev_size(&mut self) -> (PartReplicas, usize) {
        let whole = self.replicas.trunc() as usize;
        let fraction = self.replicas.fract();
        let mut desired = vec![self.parts; whole];
        let partial = (self.parts as f64 * fraction) as usize;
        if partial > 0 {
            desired.push(partial);
        }

        let mut removed = 0;
        let mut to_assign: BTreeMap<usize, Vec<usize>> = BTreeMap::new();

        if self.replica2part2dev.len() > desired.len() {
            for part2dev in self.replica2part2dev.drain(desired.len()..) {
                for dev_id in part2dev {
                    if let Some(dev) = self.devs.get_mut(dev_id) {
                        dev.parts = dev.parts.saturating_sub(1);
                    }
                    removed += 1;
                }
            }
        }

        for (replica, &length) in desired.iter().enumerate() {
            match self.replica2part2dev.get_mut(replica) {
                Some(part2dev) if part2dev.len() < length => {
                    for part in part2dev.len()..length {
                        to_assign.entry(part).or_default().push(replica);
                    }
                    part2dev.resize(length, 0);
                }
                Some(part2dev) if part2dev.len() > length => {
                    for dev_id in part2dev.drain(length..) {
                        if let Some(dev) = self.devs.get_mut(dev_id) {
                            dev.parts = dev.parts.saturating_sub(1);
                        }
                        removed += 1;
                    }
                }
                Some(_) => {}
                None => {
                    for part in 0..length {
                        to_assign.entry(part).or_default().push(replica);
                    }
                    self.replica2part2dev.push(vec![0; length]);
                }
            }
        }

        if removed > 0 || !to_assign.is_empty() {
            debug!(removed, to_assign = to_assign.len(), "resized replica table");
        }
        (to_assign.into_iter().collect(), removed)
    }

    /// Drops fully drained devices that were queued for removal.
    fn recycle_removed_devs(&mut self) {
        let devs = &mut self.devs;
        self.remove_devs.retain(|&id| match devs.get(id).map(|d| d.parts == 0) {
            Some(true) => {
                devs.tombstone(id);
                info!(id, "removed drained device");
                false
            }
            Some(false) => true,
            None => false,
        });
    }

    /// Worst skew in percent between any device's holdings and its
    /// weight-proportional target. A zero-weight device still holding
    /// partitions scores [`INFINITE_BALANCE`].
    pub fn get_balance(&self) -> RingResult<f64> {
        let weight_of_one_part = self.weight_of_one_part()?;
        let mut balance: f64 = 0.0;
        for dev in self.devs.iter() {
            if dev.info.weight <= 0.0 {
                if dev.parts > 0 {
                    return Ok(INFINITE_BALANCE);
                }
                continue;
            }
            let dev_skew = skew(dev.parts, dev.info.weight, weight_of_one_part);
            balance = balance.max(dev_skew);
        }
        Ok(balance)
    }

    /// Checks that device accounting agrees with the assignment table, that
    /// every slot points at a live device, and that every port is usable.
    ///
    /// With `stats`, also returns per-device usage and the worst skew.
    pub fn validate(&self, stats: bool) -> RingResult<Option<ValidationStats>> {
        let parts_on_devs: u64 = self.devs.iter().map(|d| d.parts as u64).sum();
        let parts_in_map: u64 = self.replica2part2dev.iter().map(|p| p.len() as u64).sum();
        if parts_on_devs != parts_in_map {
            return Err(RingError::Validation(format!(
                "All partitions are not double accounted for: {} != {}",
                parts_on_devs, parts_in_map
            )));
        }

        let mut dev_usage = vec![0u32; self.devs.slot_count()];
        for (replica, part2dev) in self.replica2part2dev.iter().enumerate() {
            for (part, &dev_id) in part2dev.iter().enumerate() {
                if !self.devs.contains(dev_id) {
                    return Err(RingError::Validation(format!(
                        "Partition {}, replica {} was not allocated to a device.",
                        part, replica
                    )));
                }
                dev_usage[dev_id as usize] += 1;
            }
        }

        for dev in self.devs.iter() {
            if dev.info.port == 0 {
                return Err(RingError::Validation(format!(
                    "Device {} has port 0, which is not a usable port.",
                    dev.info.id
                )));
            }
            let used = dev_usage[dev.info.id as usize];
            if used != dev.parts {
                return Err(RingError::Validation(format!(
                    "Device {} claims {} partitions but holds {} in the table.",
                    dev.info.id, dev.parts, used
                )));
            }
        }

        if !stats {
            return Ok(None);
        }

        let weight_of_one_part = self.weight_of_one_part()?;
        let mut worst: f64 = 0.0;
        for dev in self.devs.iter() {
            let used = dev_usage[dev.info.id as usize];
            if dev.info.weight <= 0.0 {
                if used > 0 {
                    worst = INFINITE_BALANCE;
                    break;
                }
                continue;
            }
            worst = worst.max(skew(used, dev.info.weight, weight_of_one_part));
        }
        Ok(Some(ValidationStats { dev_usage, worst }))
    }

    /// Devices holding replicas of `part`, duplicates included.
    fn devs_for_part(&self, part: usize) -> impl Iterator<Item = &BuilderDevice> + '_ {
        self.replica2part2dev
            .iter()
            .filter_map(move |part2dev| part2dev.get(part))
            .filter_map(move |&id| self.devs.get(id))
    }
}

/// Replica indices that exist for `part` (partial replicas may not).
pub(crate) fn replicas_for_part(table: &[Vec<DeviceId>], part: usize) -> Vec<usize> {
    table
        .iter()
        .enumerate()
        .filter(|(_, part2dev)| part < part2dev.len())
        .map(|(replica, _)| replica)
        .collect()
}

fn skew(parts: u32, weight: f64, weight_of_one_part: f64) -> f64 {
    (100.0 * parts as f64 / (weight * weight_of_one_part) - 100.0).abs()
}

fn validate_replicas(replicas: f64) -> RingResult<()> {
    if !replicas.is_finite() || replicas < 1.0 {
        return Err(RingError::InvalidParameter(format!(
            "replicas must be at least 1 (was {:.6})",
            replicas
        )));
    }
    Ok(())
}

fn validate_weight(weight: f64) -> RingResult<()> {
    if !weight.is_finite() || weight < 0.0 {
        return Err(RingError::InvalidParameter(format!(
            "weight must be a non-negative number (was {})",
            weight
        )));
    }
    Ok(())
}
