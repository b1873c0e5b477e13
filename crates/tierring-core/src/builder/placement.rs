//! Placement of partition replicas onto devices.
//!
//! Devices are ordered by a want key (how many more partition-replicas they
//! want, then a random tiebreak, then id). Each tier keeps its devices sorted
//! by that key, and each tier keeps its children sorted by their best device
//! key. Placing a replica walks down from the root, at every level preferring
//! the child with the fewest replicas of the partition and, among those, the
//! hungriest one. The chosen device is then re-keyed in every list it sits in
//! so later picks in the same batch see the updated demand.

use std::collections::{HashMap, HashSet};

use rand::rngs::StdRng;
use rand::Rng;

use super::{replicas_for_part, RingBuilder};
use crate::device::DeviceId;
use crate::error::{RingError, RingResult};
use crate::tier::{tiers_for_dev, TierIndex, TIER_DEPTH};

/// Ordering key for device demand. Larger sorts later and is picked first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub(crate) struct SortKey {
    want: i64,
    tiebreak: u16,
    id: DeviceId,
}

impl SortKey {
    fn new(max_slots: i64, parts_wanted: i64, id: DeviceId, rng: &mut StdRng) -> Self {
        Self {
            want: max_slots + parts_wanted,
            tiebreak: rng.gen(),
            id,
        }
    }
}

/// Per-tier sorted device lists and sorted child lists.
struct TierLists {
    index: TierIndex,
    /// Tier -> device keys, ascending.
    devs: Vec<Vec<SortKey>>,
    /// Tier -> (child's best key, child tier), ascending.
    children: Vec<Vec<(SortKey, usize)>>,
}

impl TierLists {
    fn build(index: TierIndex, keys: &HashMap<DeviceId, SortKey>) -> Self {
        let mut devs: Vec<Vec<SortKey>> = vec![Vec::new(); index.len()];
        for (&id, &key) in keys {
            if let Some(chain) = index.chain(id) {
                for &tier in chain {
                    devs[tier].push(key);
                }
            }
        }
        for list in devs.iter_mut() {
            list.sort_unstable();
        }

        let mut children: Vec<Vec<(SortKey, usize)>> = vec![Vec::new(); index.len()];
        for (tier, list) in children.iter_mut().enumerate() {
            for &child in index.children(tier) {
                if let Some(&best) = devs[child].last() {
                    list.push((best, child));
                }
            }
            list.sort_unstable();
        }

        Self {
            index,
            devs,
            children,
        }
    }

    /// Chooses the child of `tier` to descend into.
    ///
    /// When more children exist than tiers at this depth already holding a
    /// replica, some child must hold none, so the first empty child found
    /// from the hungry end wins. Otherwise the hungriest child among those
    /// with the fewest replicas wins.
    fn pick_child(
        &self,
        tier: usize,
        other_replicas: &HashMap<usize, u32>,
        tiers_with_replicas: usize,
    ) -> Option<usize> {
        let candidates = &self.children[tier];
        let count = |t: usize| other_replicas.get(&t).copied().unwrap_or(0);

        if candidates.len() > tiers_with_replicas {
            if let Some(&(_, t)) = candidates.iter().rev().find(|(_, t)| count(*t) == 0) {
                return Some(t);
            }
        }

        let min_count = candidates.iter().map(|&(_, t)| count(t)).min()?;
        candidates
            .iter()
            .rev()
            .find(|(_, t)| count(*t) == min_count)
            .map(|&(_, t)| t)
    }

    /// Moves device `id` from `old` to `new` in every list along its chain.
    fn rekey(&mut self, id: DeviceId, old: SortKey, new: SortKey) {
        let Some(chain) = self.index.chain(id).copied() else {
            return;
        };
        for tier in chain.into_iter().rev() {
            let list = &mut self.devs[tier];
            let old_best = list.last().copied();
            if let Ok(pos) = list.binary_search(&old) {
                list.remove(pos);
            }
            let pos = list.binary_search(&new).unwrap_or_else(|p| p);
            list.insert(pos, new);
            let new_best = list.last().copied();

            if old_best == new_best {
                continue;
            }
            let (Some(parent), Some(old_best), Some(new_best)) =
                (self.index.parent(tier), old_best, new_best)
            else {
                continue;
            };
            let siblings = &mut self.children[parent];
            if let Ok(pos) = siblings.binary_search(&(old_best, tier)) {
                siblings.remove(pos);
            }
            let pos = siblings
                .binary_search(&(new_best, tier))
                .unwrap_or_else(|p| p);
            siblings.insert(pos, (new_best, tier));
        }
    }
}

impl RingBuilder {
    /// Assigns each listed `(partition, replicas)` slot to a device, keeping
    /// replicas of a partition as far apart as the device layout allows.
    ///
    /// If a partition asks for more replicas than there are distinct devices,
    /// some replicas share a device.
    pub(crate) fn reassign_parts(
        &mut self,
        reassign: &[(usize, Vec<usize>)],
        rng: &mut StdRng,
    ) -> RingResult<()> {
        if reassign.is_empty() {
            return Ok(());
        }
        let max_slots = self.max_slots();

        let mut keys: HashMap<DeviceId, SortKey> = HashMap::new();
        for dev in self.devs.iter().filter(|d| d.info.weight > 0.0) {
            keys.insert(
                dev.info.id,
                SortKey::new(max_slots, dev.parts_wanted, dev.info.id, rng),
            );
        }
        if keys.is_empty() {
            return Err(RingError::EmptyRing);
        }

        let index = TierIndex::build(
            self.devs
                .iter()
                .filter(|d| d.info.weight > 0.0)
                .map(|d| &d.info),
        );
        let max_depth = index.max_depth();
        let mut lists = TierLists::build(index, &keys);

        for (part, replace) in reassign {
            let part = *part;
            let mut other_replicas: HashMap<usize, u32> = HashMap::new();
            let mut unique_by_depth: [HashSet<usize>; TIER_DEPTH + 1] = Default::default();

            for replica in replicas_for_part(&self.replica2part2dev, part) {
                if replace.contains(&replica) {
                    continue;
                }
                let dev_id = self.replica2part2dev[replica][part];
                let Some(dev) = self.devs.get(dev_id) else {
                    continue;
                };
                for tier in tiers_for_dev(&dev.info) {
                    if let Some(idx) = lists.index.index_of(&tier) {
                        *other_replicas.entry(idx).or_insert(0) += 1;
                        unique_by_depth[tier.depth()].insert(idx);
                    }
                }
            }

            for &replica in replace {
                let mut tier = TierIndex::ROOT;
                for depth in 1..=max_depth {
                    match lists.pick_child(tier, &other_replicas, unique_by_depth[depth].len()) {
                        Some(child) => tier = child,
                        None => break,
                    }
                }
                let Some(&old_key) = lists.devs[tier].last() else {
                    return Err(RingError::EmptyRing);
                };
                let dev_id = old_key.id;
                let dev = self.devs.require_mut(dev_id)?;
                dev.parts_wanted -= 1;
                dev.parts += 1;
                let new_key = SortKey::new(max_slots, dev.parts_wanted, dev_id, rng);
                lists.rekey(dev_id, old_key, new_key);

                if let Some(chain) = lists.index.chain(dev_id) {
                    for &t in chain {
                        *other_replicas.entry(t).or_insert(0) += 1;
                        unique_by_depth[lists.index.depth(t)].insert(t);
                    }
                }
                self.replica2part2dev[replica][part] = dev_id;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::DeviceSpec;
    use rand::SeedableRng;

    fn rng() -> StdRng {
        StdRng::seed_from_u64(7)
    }

    #[test]
    fn test_sort_key_orders_by_want_first() {
        let mut rng = rng();
        let hungry = SortKey::new(768, 10, 0, &mut rng);
        let full = SortKey::new(768, -5, 1, &mut rng);
        let drained = SortKey::new(768, -768, 2, &mut rng);
        assert!(drained < full);
        assert!(full < hungry);
    }

    #[test]
    fn test_rekey_keeps_lists_sorted() {
        let mut builder = RingBuilder::new(4, 1.0, 0).unwrap();
        for zone in 0..3 {
            builder
                .add_dev(DeviceSpec::new(1, zone, "10.0.0.1", 6000 + zone as u16, "sda", 1.0))
                .unwrap();
        }
        let mut rng = rng();
        let keys: HashMap<DeviceId, SortKey> = builder
            .devs
            .iter()
            .map(|d| (d.info.id, SortKey::new(16, d.parts_wanted, d.info.id, &mut rng)))
            .collect();
        let index = TierIndex::build(builder.devs.iter().map(|d| &d.info));
        let mut lists = TierLists::build(index, &keys);

        let old = keys[&1];
        let new = SortKey {
            want: old.want + 100,
            ..old
        };
        lists.rekey(1, old, new);

        for list in &lists.devs {
            assert!(list.windows(2).all(|w| w[0] <= w[1]));
        }
        for list in &lists.children {
            assert!(list.windows(2).all(|w| w[0] <= w[1]));
        }
        let root_children = &lists.children[TierIndex::ROOT];
        assert_eq!(root_children.last().unwrap().0, new);
    }

    #[test]
    fn test_pick_child_prefers_empty_then_hungriest() {
        let mut builder = RingBuilder::new(4, 3.0, 0).unwrap();
        for zone in 0..3 {
            builder
                .add_dev(DeviceSpec::new(1, zone, "10.0.0.1", 6000 + zone as u16, "sda", 1.0))
                .unwrap();
        }
        let mut rng = rng();
        let mut keys = HashMap::new();
        for dev in builder.devs.iter() {
            // device 2 is the hungriest
            let wanted = dev.info.id as i64 * 10;
            keys.insert(dev.info.id, SortKey::new(48, wanted, dev.info.id, &mut rng));
        }
        let index = TierIndex::build(builder.devs.iter().map(|d| &d.info));
        let region = index.chain(0).unwrap()[0];
        let zone_of = |id: DeviceId| index.chain(id).unwrap()[1];
        let (zone0, zone1, zone2) = (zone_of(0), zone_of(1), zone_of(2));
        let lists = TierLists::build(index, &keys);

        let none = HashMap::new();
        assert_eq!(lists.pick_child(region, &none, 0), Some(zone2));

        let taken = HashMap::from([(zone2, 1u32)]);
        let pick = lists.pick_child(region, &taken, 1).unwrap();
        assert_ne!(pick, zone2);

        let all = HashMap::from([(zone0, 1u32), (zone1, 1), (zone2, 2)]);
        assert_eq!(lists.pick_child(region, &all, 3), Some(zone1));
    }
}
