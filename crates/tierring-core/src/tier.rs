//! Failure-domain tiers.
//!
//! Every device sits at the bottom of a four-level chain:
//! region, (region, zone), (region, zone, ip:port), (region, zone, ip:port, id),
//! all hanging off a single root. [`TierIndex`] interns the tiers of a device
//! set into dense indices so the placement code can keep per-tier state in
//! plain vectors.

use std::collections::{BTreeSet, HashMap};

use crate::device::{Device, DeviceId};

/// Number of tier levels below the root.
pub const TIER_DEPTH: usize = 4;

/// A node in the failure-domain hierarchy.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Tier {
    /// The whole cluster.
    Root,
    /// A region.
    Region(u32),
    /// A zone within a region.
    Zone(u32, u32),
    /// A server (`ip:port`) within a zone.
    Server(u32, u32, String),
    /// A single device.
    Device(u32, u32, String, DeviceId),
}

impl Tier {
    /// Distance from the root; the root has depth 0 and devices depth 4.
    pub fn depth(&self) -> usize {
        match self {
            Tier::Root => 0,
            Tier::Region(..) => 1,
            Tier::Zone(..) => 2,
            Tier::Server(..) => 3,
            Tier::Device(..) => 4,
        }
    }

    /// The enclosing tier, or `None` for the root.
    pub fn parent(&self) -> Option<Tier> {
        match self {
            Tier::Root => None,
            Tier::Region(_) => Some(Tier::Root),
            Tier::Zone(r, _) => Some(Tier::Region(*r)),
            Tier::Server(r, z, _) => Some(Tier::Zone(*r, *z)),
            Tier::Device(r, z, s, _) => Some(Tier::Server(*r, *z, s.clone())),
        }
    }
}

/// The tiers containing `dev`, shallowest first (root excluded).
pub fn tiers_for_dev(dev: &Device) -> [Tier; TIER_DEPTH] {
    let server = dev.server_label();
    [
        Tier::Region(dev.region),
        Tier::Zone(dev.region, dev.zone),
        Tier::Server(dev.region, dev.zone, server.clone()),
        Tier::Device(dev.region, dev.zone, server, dev.id),
    ]
}

/// Interned tier hierarchy for a set of devices. Index 0 is always the root.
#[derive(Debug, Clone)]
pub struct TierIndex {
    tiers: Vec<Tier>,
    lookup: HashMap<Tier, usize>,
    parent: Vec<Option<usize>>,
    children: Vec<Vec<usize>>,
    chains: HashMap<DeviceId, [usize; TIER_DEPTH]>,
}

impl TierIndex {
    /// Index of the root tier.
    pub const ROOT: usize = 0;

    /// Builds the hierarchy for `devs`. Children lists are in tier order.
    pub fn build<'a>(devs: impl IntoIterator<Item = &'a Device>) -> Self {
        let mut index = Self {
            tiers: vec![Tier::Root],
            lookup: HashMap::from([(Tier::Root, Self::ROOT)]),
            parent: vec![None],
            children: vec![Vec::new()],
            chains: HashMap::new(),
        };
        let mut edges: BTreeSet<(usize, Tier)> = BTreeSet::new();

        for dev in devs {
            let mut chain = [Self::ROOT; TIER_DEPTH];
            let mut parent = Self::ROOT;
            for (depth, tier) in tiers_for_dev(dev).into_iter().enumerate() {
                let idx = index.intern(tier.clone(), parent);
                edges.insert((parent, tier));
                chain[depth] = idx;
                parent = idx;
            }
            index.chains.insert(dev.id, chain);
        }

        for (parent, tier) in edges {
            let idx = index.lookup[&tier];
            index.children[parent].push(idx);
        }
        index
    }

    fn intern(&mut self, tier: Tier, parent: usize) -> usize {
        if let Some(&idx) = self.lookup.get(&tier) {
            return idx;
        }
        let idx = self.tiers.len();
        self.tiers.push(tier.clone());
        self.lookup.insert(tier, idx);
        self.parent.push(Some(parent));
        self.children.push(Vec::new());
        idx
    }

    /// Number of interned tiers, root included.
    pub fn len(&self) -> usize {
        self.tiers.len()
    }

    /// Returns true if only the root is present.
    pub fn is_empty(&self) -> bool {
        self.tiers.len() == 1
    }

    /// The tier behind an index.
    pub fn tier(&self, idx: usize) -> &Tier {
        &self.tiers[idx]
    }

    /// Looks up the index of a tier.
    pub fn index_of(&self, tier: &Tier) -> Option<usize> {
        self.lookup.get(tier).copied()
    }

    /// Depth of the tier behind an index.
    pub fn depth(&self, idx: usize) -> usize {
        self.tiers[idx].depth()
    }

    /// Parent index, `None` for the root.
    pub fn parent(&self, idx: usize) -> Option<usize> {
        self.parent[idx]
    }

    /// Child indices of a tier.
    pub fn children(&self, idx: usize) -> &[usize] {
        &self.children[idx]
    }

    /// The tier chain (region .. device) of a device in this index.
    pub fn chain(&self, id: DeviceId) -> Option<&[usize; TIER_DEPTH]> {
        self.chains.get(&id)
    }

    /// Deepest tier level present; 0 when the index holds no devices.
    pub fn max_depth(&self) -> usize {
        if self.chains.is_empty() {
            0
        } else {
            TIER_DEPTH
        }
    }

    /// Maximum replicas of any one partition each tier may hold without
    /// elevated failure risk, indexed like the tiers.
    ///
    /// The root holds `replicas`; each child gets the ceiling of its parent's
    /// share divided by the number of siblings.
    pub fn max_replicas_by_tier(&self, replicas: f64) -> Vec<f64> {
        let mut max = vec![0.0; self.tiers.len()];
        max[Self::ROOT] = replicas;
        let mut stack = vec![Self::ROOT];
        while let Some(idx) = stack.pop() {
            let children = &self.children[idx];
            if children.is_empty() {
                continue;
            }
            let share = (max[idx] / children.len() as f64).ceil();
            for &child in children {
                max[child] = share;
                stack.push(child);
            }
        }
        max
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dev(id: DeviceId, region: u32, zone: u32, ip: &str, port: u16) -> Device {
        Device {
            device: format!("sd{}", id),
            id,
            ip: ip.to_string(),
            meta: String::new(),
            port,
            region,
            weight: 1.0,
            zone,
        }
    }

    #[test]
    fn test_tiers_for_dev_chain() {
        let d = dev(7, 2, 3, "10.0.0.1", 6000);
        let tiers = tiers_for_dev(&d);
        assert_eq!(tiers[0], Tier::Region(2));
        assert_eq!(tiers[1], Tier::Zone(2, 3));
        assert_eq!(tiers[2], Tier::Server(2, 3, "10.0.0.1:6000".to_string()));
        assert_eq!(tiers[3], Tier::Device(2, 3, "10.0.0.1:6000".to_string(), 7));
        for t in &tiers[1..] {
            assert_eq!(t.parent().unwrap().depth() + 1, t.depth());
        }
        assert_eq!(Tier::Region(2).parent(), Some(Tier::Root));
        assert_eq!(Tier::Root.parent(), None);
    }

    #[test]
    fn test_tier_tree_adjacency() {
        let devs = vec![
            dev(0, 1, 1, "a", 1),
            dev(1, 1, 1, "a", 1),
            dev(2, 1, 2, "b", 1),
            dev(3, 2, 1, "c", 1),
        ];
        let index = TierIndex::build(&devs);
        // root + 2 regions + 3 zones + 3 servers + 4 devices
        assert_eq!(index.len(), 13);
        assert_eq!(index.children(TierIndex::ROOT).len(), 2);

        let server_a = index.index_of(&Tier::Server(1, 1, "a:1".into())).unwrap();
        assert_eq!(index.children(server_a).len(), 2);

        let chain = index.chain(2).unwrap();
        assert_eq!(index.tier(chain[1]), &Tier::Zone(1, 2));
        assert_eq!(index.parent(chain[0]), Some(TierIndex::ROOT));
        assert_eq!(index.max_depth(), TIER_DEPTH);
    }

    #[test]
    fn test_max_replicas_even_spread() {
        let devs: Vec<Device> = (0..4)
            .map(|i| dev(i, 1, i as u32, "127.0.0.1", 6000 + i))
            .collect();
        let index = TierIndex::build(&devs);
        let max = index.max_replicas_by_tier(3.0);
        assert_eq!(max[TierIndex::ROOT], 3.0);
        assert_eq!(max[index.index_of(&Tier::Region(1)).unwrap()], 3.0);
        for i in 0..4u16 {
            let chain = index.chain(i).unwrap();
            assert_eq!(max[chain[1]], 1.0);
            assert_eq!(max[chain[3]], 1.0);
        }
    }

    #[test]
    fn test_max_replicas_fractional_rounds_up() {
        let devs = vec![dev(0, 1, 1, "a", 1), dev(1, 2, 1, "b", 1)];
        let index = TierIndex::build(&devs);
        let max = index.max_replicas_by_tier(3.25);
        let region1 = index.index_of(&Tier::Region(1)).unwrap();
        assert_eq!(max[region1], 2.0);
        assert_eq!(max[index.chain(0).unwrap()[3]], 2.0);
    }

    #[test]
    fn test_empty_index() {
        let index = TierIndex::build(std::iter::empty());
        assert!(index.is_empty());
        assert_eq!(index.max_depth(), 0);
        assert_eq!(index.max_replicas_by_tier(3.0), vec![3.0]);
    }
}
