//! Selection of partition replicas that should move on the next pass.

use std::collections::{BTreeMap, HashMap, HashSet};

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::Rng;
use tracing::debug;

use super::{replicas_for_part, PartReplicas, RingBuilder};
use crate::device::DeviceId;
use crate::tier::TierIndex;

impl RingBuilder {
    /// Collects `(partition, replicas)` pairs to reassign, in three passes:
    ///
    /// 1. every replica on a device queued for removal, ignoring the cooldown;
    /// 2. replicas of partitions concentrated in one tier beyond what the
    ///    replica count requires, once their cooldown has elapsed;
    /// 3. replicas on overweight devices, once their cooldown has elapsed,
    ///    scanning from a slowly drifting random start.
    ///
    /// Devices giving up a replica in passes 1-3 have their `parts` and
    /// `parts_wanted` adjusted here, before placement runs. The result is
    /// shuffled.
    pub(crate) fn gather_reassign_parts(&mut self, rng: &mut StdRng) -> PartReplicas {
        let removed = self.gather_removed_dev_parts();
        let spread = self.gather_spread_out_parts(&removed);
        let mut reassign = self.gather_overweight_parts(&removed, &spread, rng);

        debug!(
            removed = removed.len(),
            spread = spread.len(),
            overweight = reassign.len(),
            "gathered reassignment candidates"
        );
        reassign.extend(spread);
        reassign.extend(removed);

        let mut list: PartReplicas = reassign.into_iter().collect();
        list.shuffle(rng);
        list
    }

    fn gather_removed_dev_parts(&mut self) -> BTreeMap<usize, Vec<usize>> {
        let mut removed: BTreeMap<usize, Vec<usize>> = BTreeMap::new();
        let draining: HashSet<DeviceId> = self
            .remove_devs
            .iter()
            .copied()
            .filter(|&id| self.devs.get(id).is_some_and(|d| d.parts > 0))
            .collect();
        if draining.is_empty() {
            return removed;
        }

        for (replica, part2dev) in self.replica2part2dev.iter().enumerate() {
            for (part, dev_id) in part2dev.iter().enumerate() {
                if !draining.contains(dev_id) {
                    continue;
                }
                self.last_part_moves[part] = 0;
                if let Some(dev) = self.devs.get_mut(*dev_id) {
                    dev.parts = dev.parts.saturating_sub(1);
                    dev.parts_wanted += 1;
                }
                removed.entry(part).or_default().push(replica);
            }
        }
        removed
    }

    fn gather_spread_out_parts(
        &mut self,
        removed: &BTreeMap<usize, Vec<usize>>,
    ) -> BTreeMap<usize, Vec<usize>> {
        let mut spread: BTreeMap<usize, Vec<usize>> = BTreeMap::new();
        let index = TierIndex::build(self.devs.iter().map(|d| &d.info));
        let max_allowed = index.max_replicas_by_tier(self.replicas);

        for part in 0..self.parts {
            if removed.contains_key(&part) {
                continue;
            }
            let replicas = replicas_for_part(&self.replica2part2dev, part);

            let mut replicas_at_tier: HashMap<usize, u32> = HashMap::new();
            for &replica in &replicas {
                let dev_id = self.replica2part2dev[replica][part];
                if let Some(chain) = index.chain(dev_id) {
                    for &tier in chain {
                        *replicas_at_tier.entry(tier).or_insert(0) += 1;
                    }
                }
            }

            for replica in replicas {
                if (self.last_part_moves[part] as u32) < self.min_part_hours {
                    break;
                }
                let dev_id = self.replica2part2dev[replica][part];
                let Some(chain) = index.chain(dev_id) else {
                    continue;
                };
                let at_risk = chain.iter().any(|tier| {
                    replicas_at_tier.get(tier).copied().unwrap_or(0) as f64 > max_allowed[*tier]
                });
                if !at_risk {
                    continue;
                }

                self.last_part_moves[part] = 0;
                spread.entry(part).or_default().push(replica);
                if let Some(dev) = self.devs.get_mut(dev_id) {
                    dev.parts_wanted += 1;
                    dev.parts = dev.parts.saturating_sub(1);
                }
                for tier in chain {
                    if let Some(count) = replicas_at_tier.get_mut(tier) {
                        *count -= 1;
                    }
                }
            }
        }
        spread
    }

    fn gather_overweight_parts(
        &mut self,
        removed: &BTreeMap<usize, Vec<usize>>,
        spread: &BTreeMap<usize, Vec<usize>>,
        rng: &mut StdRng,
    ) -> BTreeMap<usize, Vec<usize>> {
        let mut reassign: BTreeMap<usize, Vec<usize>> = BTreeMap::new();

        let start = self.last_part_gather_start / 4 + rng.gen_range(0..=self.parts / 2);
        self.last_part_gather_start = start;

        for (replica, part2dev) in self.replica2part2dev.iter().enumerate() {
            let len = part2dev.len();
            if len == 0 {
                continue;
            }
            // partial replicas scale the start so sequential runs drift alike
            let this_start = ((start as u128 * len as u128) / self.parts as u128) as usize % len;

            for part in (this_start..len).chain(0..this_start) {
                if (self.last_part_moves[part] as u32) < self.min_part_hours {
                    continue;
                }
                if removed.contains_key(&part) || spread.contains_key(&part) {
                    continue;
                }
                let Some(dev) = self.devs.get_mut(part2dev[part]) else {
                    continue;
                };
                if dev.parts_wanted < 0 {
                    self.last_part_moves[part] = 0;
                    dev.parts_wanted += 1;
                    dev.parts = dev.parts.saturating_sub(1);
                    reassign.entry(part).or_default().push(replica);
                }
            }
        }
        reassign
    }
}
