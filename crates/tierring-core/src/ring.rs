//! Ring lookup: keys to partitions, partitions to devices, and handoffs.
//!
//! A [`Ring`] holds an immutable [`RingData`] snapshot behind an `Arc`.
//! Reloading builds a complete new snapshot and swaps the `Arc`, so a lookup
//! always sees one consistent table even while a reload is in progress.

use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};

use parking_lot::{Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::config::RingConfig;
use crate::device::{Device, DeviceId};
use crate::error::RingResult;
use crate::hash::{handoff_start, partition_for_digest, PathHasher};
use crate::ring_data::RingData;

/// Largest number of partitions the handoff search visits.
const HANDOFF_SEARCH_SPAN: usize = 65536;

#[derive(Debug)]
struct RingState {
    data: Arc<RingData>,
    mtime: Option<SystemTime>,
}

/// Read-only, periodically refreshed partition ring.
#[derive(Debug)]
pub struct Ring {
    path: Option<PathBuf>,
    hasher: PathHasher,
    reload_interval: Duration,
    state: RwLock<RingState>,
    next_check: Mutex<Instant>,
}

fn modified(path: &Path) -> RingResult<SystemTime> {
    Ok(fs::metadata(path)?.modified()?)
}

impl Ring {
    /// Loads the ring file at `path`, hashing keys with the configured salts.
    pub fn open(path: impl Into<PathBuf>, config: &RingConfig) -> RingResult<Self> {
        config.validate()?;
        let path = path.into();
        let mtime = modified(&path)?;
        let data = RingData::load(&path)?;
        info!(
            path = %path.display(),
            replicas = data.replica_count(),
            partitions = data.partition_count(),
            "loaded ring"
        );
        let reload_interval = config.reload_interval();
        Ok(Self {
            path: Some(path),
            hasher: config.hasher(),
            reload_interval,
            state: RwLock::new(RingState {
                data: Arc::new(data),
                mtime: Some(mtime),
            }),
            next_check: Mutex::new(Instant::now() + reload_interval),
        })
    }

    /// Wraps in-memory ring data. Such a ring never reloads.
    pub fn from_data(data: RingData, hasher: PathHasher) -> Self {
        Self {
            path: None,
            hasher,
            reload_interval: Duration::ZERO,
            state: RwLock::new(RingState {
                data: Arc::new(data),
                mtime: None,
            }),
            next_check: Mutex::new(Instant::now()),
        }
    }

    /// The file this ring reloads from, if any.
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// The hasher used by [`get_nodes`](Self::get_nodes).
    pub fn hasher(&self) -> &PathHasher {
        &self.hasher
    }

    /// Current snapshot, reloading first if the check interval has elapsed.
    pub fn snapshot(&self) -> Arc<RingData> {
        self.maybe_reload();
        Arc::clone(&self.state.read().data)
    }

    fn maybe_reload(&self) {
        if self.path.is_none() {
            return;
        }
        {
            let mut next = self.next_check.lock();
            let now = Instant::now();
            if now < *next {
                return;
            }
            *next = now + self.reload_interval;
        }
        if let Err(e) = self.reload_if_changed() {
            warn!(error = %e, "ring reload failed, keeping previous ring");
        }
    }

    /// Returns true if the ring file's modification time differs from the
    /// one recorded at the last successful load.
    pub fn has_changed(&self) -> RingResult<bool> {
        let Some(path) = &self.path else {
            return Ok(false);
        };
        let mtime = modified(path)?;
        Ok(self.state.read().mtime != Some(mtime))
    }

    /// Reloads the ring file if it changed, swapping in the new snapshot.
    /// Returns true if a new snapshot was installed.
    pub fn reload_if_changed(&self) -> RingResult<bool> {
        let Some(path) = &self.path else {
            return Ok(false);
        };
        if !self.has_changed()? {
            return Ok(false);
        }
        let mtime = modified(path)?;
        let data = RingData::load(path)?;
        info!(
            path = %path.display(),
            replicas = data.replica_count(),
            partitions = data.partition_count(),
            "reloaded ring"
        );
        *self.state.write() = RingState {
            data: Arc::new(data),
            mtime: Some(mtime),
        };
        Ok(true)
    }

    /// Number of replica arrays, the partial one included.
    pub fn replica_count(&self) -> usize {
        self.snapshot().replica_count()
    }

    /// Number of partitions.
    pub fn partition_count(&self) -> usize {
        self.snapshot().partition_count()
    }

    /// Devices indexed by id, holes included.
    pub fn devices(&self) -> Vec<Option<Device>> {
        self.snapshot().devs().to_vec()
    }

    /// Partition owning the path `account[/container[/object]]`.
    pub fn get_partition(&self, account: &str, container: Option<&str>, object: Option<&str>) -> usize {
        let digest = self.hasher.hash_path(account, container, object);
        partition_for_digest(&digest, self.snapshot().part_shift())
    }

    /// Partition and primary devices for a path. A device holding several
    /// replicas of the partition appears once.
    pub fn get_nodes(
        &self,
        account: &str,
        container: Option<&str>,
        object: Option<&str>,
    ) -> (usize, Vec<Device>) {
        let data = self.snapshot();
        let digest = self.hasher.hash_path(account, container, object);
        let part = partition_for_digest(&digest, data.part_shift());
        let nodes = data.part_devices(part).into_iter().cloned().collect();
        (part, nodes)
    }

    /// Primary devices for a partition, deduplicated, in replica order.
    pub fn get_part_nodes(&self, part: usize) -> Vec<Device> {
        self.snapshot()
            .part_devices(part)
            .into_iter()
            .cloned()
            .collect()
    }

    /// Handoff devices for `part`, beyond its primaries.
    pub fn get_more_nodes(&self, part: usize) -> HandoffNodes {
        HandoffNodes::new(self.snapshot(), part)
    }
}

/// Lazily produced handoff devices for one partition.
///
/// Candidates come from walking other partitions' assignments in a fixed,
/// partition-specific order. Three passes are made: the first yields devices
/// in regions not used so far, the second devices in zones not used so far,
/// the third any device not yet yielded. No device id repeats, and the
/// sequence ends once every live device has been used.
#[derive(Debug, Clone)]
pub struct HandoffNodes {
    data: Arc<RingData>,
    used: HashSet<DeviceId>,
    same_regions: HashSet<u32>,
    same_zones: HashSet<(u32, u32)>,
    remaining: usize,
    parts: usize,
    start: usize,
    inc: usize,
    pass: u8,
    step: usize,
    replica: usize,
}

impl HandoffNodes {
    fn new(data: Arc<RingData>, part: usize) -> Self {
        let mut used = HashSet::new();
        let mut same_regions = HashSet::new();
        let mut same_zones = HashSet::new();
        for dev in data.part_devices(part) {
            used.insert(dev.id);
            same_regions.insert(dev.region);
            same_zones.insert((dev.region, dev.zone));
        }
        let live = data.devs().iter().flatten().count();
        let parts = data.partition_count();
        let start = match parts {
            0 => 0,
            n => handoff_start(part, data.part_shift()) % n,
        };
        let inc = (parts / HANDOFF_SEARCH_SPAN).max(1);
        debug!(part, start, inc, primaries = used.len(), "starting handoff search");
        Self {
            remaining: live.saturating_sub(used.len()),
            data,
            used,
            same_regions,
            same_zones,
            parts,
            start,
            inc,
            pass: 0,
            step: 0,
            replica: 0,
        }
    }

    /// Partition visited at `step` of a pass: `start, start + inc, ...` up to
    /// the end of the partition space, then wrapping to the lowest partition
    /// of the same residue class and continuing up to `start`.
    ///
    /// The wrap always restarts at `start % inc`, so every partition in the
    /// residue class is visited exactly once, even when `parts - start` is a
    /// multiple of `inc`.
    fn partition_at_step(&self, step: usize) -> Option<usize> {
        if self.parts == 0 {
            return None;
        }
        let head = (self.parts - self.start).div_ceil(self.inc);
        if step < head {
            return Some(self.start + step * self.inc);
        }
        let wrapped = self.start % self.inc + (step - head) * self.inc;
        (wrapped < self.start).then_some(wrapped)
    }
}

impl Iterator for HandoffNodes {
    type Item = Device;

    fn next(&mut self) -> Option<Device> {
        let table = self.data.replica2part2dev_id();
        loop {
            if self.remaining == 0 || self.pass > 2 {
                return None;
            }
            let Some(part) = self.partition_at_step(self.step) else {
                self.pass += 1;
                self.step = 0;
                self.replica = 0;
                continue;
            };
            if self.replica >= table.len() {
                self.replica = 0;
                self.step += 1;
                continue;
            }
            let replica = self.replica;
            self.replica += 1;

            let Some(&dev_id) = table[replica].get(part) else {
                continue;
            };
            let Some(Some(dev)) = self.data.devs().get(dev_id as usize) else {
                continue;
            };
            if self.used.contains(&dev_id) {
                continue;
            }
            let zone = (dev.region, dev.zone);
            let fresh = match self.pass {
                0 => !self.same_regions.contains(&dev.region),
                1 => !self.same_zones.contains(&zone),
                _ => true,
            };
            if !fresh {
                continue;
            }

            self.used.insert(dev_id);
            self.same_regions.insert(dev.region);
            self.same_zones.insert(zone);
            self.remaining -= 1;
            return Some(dev.clone());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::File;
    use std::time::UNIX_EPOCH;

    fn device(id: DeviceId, region: u32, zone: u32) -> Device {
        Device {
            device: "sdb1".to_string(),
            id,
            ip: format!("10.{}.{}.{}", region, zone, id),
            meta: String::new(),
            port: 6000,
            region,
            weight: 1.0,
            zone,
        }
    }

    fn handoff_data() -> RingData {
        let devs = vec![
            Some(device(0, 1, 1)),
            Some(device(1, 1, 2)),
            Some(device(2, 2, 1)),
            Some(device(3, 2, 2)),
            Some(device(4, 1, 3)),
            Some(device(5, 1, 1)),
            None,
        ];
        RingData::new(vec![vec![0, 2, 4, 5], vec![1, 3, 0, 2]], devs, 30)
    }

    fn config(interval: u64) -> RingConfig {
        RingConfig {
            hash_path_suffix: "endcap".to_string(),
            reload_interval_secs: interval,
            ..RingConfig::default()
        }
    }

    fn touch(path: &Path, secs: u64) {
        File::options()
            .write(true)
            .open(path)
            .unwrap()
            .set_modified(UNIX_EPOCH + Duration::from_secs(secs))
            .unwrap();
    }

    #[test]
    fn test_part_nodes_dedup_in_replica_order() {
        let data = RingData::new(
            vec![vec![1, 0], vec![1, 1], vec![0]],
            vec![Some(device(0, 1, 1)), Some(device(1, 1, 2))],
            31,
        );
        let ring = Ring::from_data(data, PathHasher::default());
        let ids: Vec<DeviceId> = ring.get_part_nodes(0).iter().map(|d| d.id).collect();
        assert_eq!(ids, vec![1, 0]);
        let ids: Vec<DeviceId> = ring.get_part_nodes(1).iter().map(|d| d.id).collect();
        assert_eq!(ids, vec![0, 1]);
        assert_eq!(ring.replica_count(), 3);
        assert_eq!(ring.partition_count(), 2);
    }

    #[test]
    fn test_get_nodes_uses_top_bits() {
        let ring = Ring::from_data(handoff_data(), PathHasher::new("", "endcap"));
        let digest = ring.hasher().hash_path("a", Some("c"), Some("o"));
        let expected = (digest[0] >> 6) as usize;
        let (part, nodes) = ring.get_nodes("a", Some("c"), Some("o"));
        assert_eq!(part, expected);
        assert_eq!(ring.get_partition("a", Some("c"), Some("o")), expected);
        assert_eq!(nodes, ring.get_part_nodes(part));
        assert_eq!(ring.get_nodes("a", Some("c"), Some("o")).0, part);
    }

    #[test]
    fn test_handoff_prefers_new_regions_then_zones() {
        let ring = Ring::from_data(handoff_data(), PathHasher::default());
        let handoffs: Vec<Device> = ring.get_more_nodes(0).collect();
        let ids: Vec<DeviceId> = handoffs.iter().map(|d| d.id).collect();

        assert_eq!(ids.len(), 4);
        assert_eq!(handoffs[0].region, 2);
        let mut middle = ids[..3].to_vec();
        middle.sort_unstable();
        assert_eq!(middle, vec![2, 3, 4]);
        assert_eq!(ids[3], 5);
        assert_eq!(ring.get_more_nodes(0).collect::<Vec<_>>(), handoffs);
    }

    #[test]
    fn test_handoff_can_stop_early() {
        let ring = Ring::from_data(handoff_data(), PathHasher::default());
        let mut more = ring.get_more_nodes(2);
        let first = more.next().unwrap();
        assert!(!ring.get_part_nodes(2).iter().any(|d| d.id == first.id));
        drop(more);
    }

    #[test]
    fn test_handoff_visits_every_partition_once() {
        let mut nodes = HandoffNodes::new(Arc::new(handoff_data()), 1);
        for start in 0..4 {
            nodes.start = start;
            let visited: Vec<usize> = (0..8).map_while(|s| nodes.partition_at_step(s)).collect();
            let mut sorted = visited.clone();
            sorted.sort_unstable();
            assert_eq!(sorted, vec![0, 1, 2, 3], "start {}", start);
            assert_eq!(visited[0], start);
        }

        nodes.parts = 16;
        nodes.inc = 4;
        nodes.start = 6;
        let visited: Vec<usize> = (0..8).map_while(|s| nodes.partition_at_step(s)).collect();
        assert_eq!(visited, vec![6, 10, 14, 2]);

        nodes.start = 4;
        let visited: Vec<usize> = (0..8).map_while(|s| nodes.partition_at_step(s)).collect();
        assert_eq!(visited, vec![4, 8, 12, 0]);

        nodes.start = 0;
        let visited: Vec<usize> = (0..8).map_while(|s| nodes.partition_at_step(s)).collect();
        assert_eq!(visited, vec![0, 4, 8, 12]);
    }

    #[test]
    fn test_open_and_reload() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("object.ring.gz");
        handoff_data().save(&path).unwrap();
        touch(&path, 1_000);

        let ring = Ring::open(&path, &config(3600)).unwrap();
        assert_eq!(ring.replica_count(), 2);
        assert!(!ring.has_changed().unwrap());
        assert!(!ring.reload_if_changed().unwrap());

        let single = RingData::new(vec![vec![3, 3, 3, 3]], handoff_data().devs().to_vec(), 30);
        single.save(&path).unwrap();
        touch(&path, 2_000);

        assert!(ring.has_changed().unwrap());
        // the check interval has not elapsed, so lookups keep the old ring
        assert_eq!(ring.replica_count(), 2);
        assert!(ring.reload_if_changed().unwrap());
        assert_eq!(ring.replica_count(), 1);
        assert!(!ring.has_changed().unwrap());
    }

    #[test]
    fn test_lazy_reload_keeps_old_ring_on_failure() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("object.ring.gz");
        handoff_data().save(&path).unwrap();
        touch(&path, 1_000);
        let ring = Ring::open(&path, &config(0)).unwrap();
        let before = ring.snapshot();

        fs::write(&path, b"garbage").unwrap();
        touch(&path, 2_000);
        assert_eq!(ring.replica_count(), 2);
        assert!(Arc::ptr_eq(&before, &ring.snapshot()));
        assert!(ring.has_changed().unwrap());

        let single = RingData::new(vec![vec![1, 1, 1, 1]], handoff_data().devs().to_vec(), 30);
        single.save(&path).unwrap();
        touch(&path, 3_000);
        assert_eq!(ring.replica_count(), 1);
        assert_eq!(ring.get_part_nodes(0)[0].id, 1);
    }

    #[test]
    fn test_open_requires_hash_salt() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("object.ring.gz");
        handoff_data().save(&path).unwrap();
        assert!(Ring::open(&path, &RingConfig::default()).is_err());
        assert!(Ring::open(dir.path().join("missing.ring.gz"), &config(15)).is_err());
    }
}
