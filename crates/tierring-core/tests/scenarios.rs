//! End-to-end scenarios: build, rebalance, publish and look up rings.

mod common;

use std::collections::HashSet;
use std::fs::File;
use std::time::{Duration, UNIX_EPOCH};

use common::{balanced, dev, parts_of, salted_config, HOUR, T0};
use tierring_core::{Ring, RingBuilder, RingData, RingError};

fn set_mtime(path: &std::path::Path, secs: u64) {
    File::options()
        .write(true)
        .open(path)
        .unwrap()
        .set_modified(UNIX_EPOCH + Duration::from_secs(secs))
        .unwrap();
}

#[test]
fn test_three_equal_devices_publish_and_lookup() {
    let mut builder = balanced(8, 3.0, 1, &[dev(1, 1, 100.0), dev(1, 2, 100.0), dev(1, 3, 100.0)]);
    for id in 0..3 {
        assert_eq!(parts_of(&builder, id), 256);
    }
    assert!(builder.get_balance().unwrap() < 1e-9);

    let dir = tempfile::tempdir().unwrap();
    let config = salted_config(dir.path(), 15);
    let path = config.ring_path("object");
    builder.get_ring().save(&path).unwrap();

    let ring = Ring::open(&path, &config).unwrap();
    assert_eq!(ring.replica_count(), 3);
    assert_eq!(ring.partition_count(), 256);

    for part in 0..256 {
        let zones: HashSet<u32> = ring.get_part_nodes(part).iter().map(|d| d.zone).collect();
        assert_eq!(zones.len(), 3, "partition {}", part);
    }

    let (part, nodes) = ring.get_nodes("AUTH_test", Some("photos"), Some("cat.jpg"));
    assert!(part < 256);
    assert_eq!(nodes.len(), 3);
    assert_eq!(ring.get_nodes("AUTH_test", Some("photos"), Some("cat.jpg")), (part, nodes));
    assert_eq!(ring.get_more_nodes(part).count(), 0);
}

#[test]
fn test_added_device_only_receives_partitions() {
    let mut builder = balanced(8, 3.0, 1, &[dev(1, 1, 100.0), dev(1, 2, 100.0), dev(1, 3, 100.0)]);
    let before = builder.get_ring().clone();

    let new_id = builder.add_dev(dev(1, 4, 100.0)).unwrap();
    builder.pretend_min_part_hours_passed();
    let summary = builder.rebalance_at(Some(7), T0 + HOUR).unwrap();
    assert!(summary.parts_moved > 0);
    assert!(summary.balance < 1.0);
    builder.validate(false).unwrap();

    let after = builder.get_ring();
    for (old, new) in before
        .replica2part2dev_id()
        .iter()
        .zip(after.replica2part2dev_id())
    {
        for (part, (&o, &n)) in old.iter().zip(new.iter()).enumerate() {
            assert!(o == n || n == new_id, "partition {} churned {} -> {}", part, o, n);
        }
    }
}

#[test]
fn test_reader_picks_up_new_ring() {
    let dir = tempfile::tempdir().unwrap();
    let config = salted_config(dir.path(), 0);
    let path = config.ring_path("container");

    let mut builder = balanced(6, 2.0, 1, &[dev(1, 1, 1.0), dev(1, 2, 1.0)]);
    builder.get_ring().save(&path).unwrap();
    set_mtime(&path, 1_000);
    let ring = Ring::open(&path, &config).unwrap();
    assert_eq!(ring.devices().len(), 2);

    builder.add_dev(dev(2, 1, 1.0)).unwrap();
    builder.pretend_min_part_hours_passed();
    builder.rebalance_at(Some(1), T0 + HOUR).unwrap();
    builder.get_ring().save(&path).unwrap();
    set_mtime(&path, 2_000);

    assert_eq!(ring.devices().len(), 3);
    let regions: HashSet<u32> = (0..ring.partition_count())
        .flat_map(|p| ring.get_part_nodes(p))
        .map(|d| d.region)
        .collect();
    assert!(regions.contains(&2));
}

#[test]
fn test_removal_moves_only_the_removed_devices_partitions() {
    let mut builder = balanced(6, 1.0, 24, &[dev(1, 1, 40.0), dev(1, 2, 24.0)]);
    assert_eq!(parts_of(&builder, 0), 40);
    assert_eq!(parts_of(&builder, 1), 24);
    let before = builder.assignments()[0].clone();

    let spare = builder.add_dev(dev(1, 3, 40.0)).unwrap();
    builder.remove_dev(0).unwrap();
    let summary = builder.rebalance_at(Some(3), T0 + 10 * HOUR).unwrap();

    assert_eq!(summary.parts_moved, 40);
    assert!(!builder.devices().contains(0));
    assert_eq!(parts_of(&builder, spare), 40);
    assert_eq!(parts_of(&builder, 1), 24);
    for (part, &old) in before.iter().enumerate() {
        let now = builder.assignments()[0][part];
        if old == 0 {
            assert_eq!(now, spare);
            assert_eq!(builder.hours_since_moved(part), Some(0));
        } else {
            assert_eq!(now, old);
            assert_eq!(builder.hours_since_moved(part), Some(10));
        }
    }
    builder.validate(false).unwrap();
}

#[test]
fn test_fractional_replica_ring_file() {
    let mut builder = balanced(8, 3.0, 1, &[dev(1, 1, 1.0), dev(1, 2, 1.0), dev(1, 3, 1.0)]);
    builder.set_replicas(2.5).unwrap();
    builder.rebalance_at(Some(5), T0 + HOUR).unwrap();
    builder.validate(false).unwrap();

    let dir = tempfile::tempdir().unwrap();
    let config = salted_config(dir.path(), 15);
    let path = config.ring_path("object");
    builder.get_ring().save(&path).unwrap();

    let data = RingData::load(&path).unwrap();
    let lengths: Vec<usize> = data.replica2part2dev_id().iter().map(|p| p.len()).collect();
    assert_eq!(lengths, vec![256, 256, 128]);

    let ring = Ring::open(&path, &config).unwrap();
    assert_eq!(ring.get_part_nodes(10).len(), 3);
    assert_eq!(ring.get_part_nodes(200).len(), 2);
}

#[test]
fn test_builder_file_round_trip_continues_identically() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("object.builder");

    let mut original = balanced(7, 3.0, 1, &[dev(1, 1, 3.0), dev(1, 2, 2.0), dev(2, 1, 2.0), dev(2, 2, 1.0)]);
    original.save(&path).unwrap();
    let mut restored = RingBuilder::load(&path).unwrap();

    for builder in [&mut original, &mut restored] {
        builder.set_dev_weight(3, 3.0).unwrap();
        builder.pretend_min_part_hours_passed();
        builder.rebalance_at(Some(77), T0 + 2 * HOUR).unwrap();
    }
    assert_eq!(original.assignments(), restored.assignments());
    assert_eq!(original.get_ring(), restored.get_ring());
}

#[test]
fn test_identical_rings_produce_identical_files() {
    let dir = tempfile::tempdir().unwrap();
    let build = || balanced(5, 2.0, 1, &[dev(1, 1, 1.0), dev(1, 2, 2.0), dev(1, 3, 1.0)]);
    let a = dir.path().join("a.ring.gz");
    let b = dir.path().join("b.ring.gz");
    build().get_ring().save(&a).unwrap();
    build().get_ring().save(&b).unwrap();
    assert_eq!(std::fs::read(&a).unwrap(), std::fs::read(&b).unwrap());
}

#[test]
fn test_unknown_ring_version_is_rejected() {
    let mut builder = balanced(4, 1.0, 1, &[dev(1, 1, 1.0)]);
    let mut raw = builder.get_ring().to_bytes().unwrap();
    raw[4..6].copy_from_slice(&9u16.to_be_bytes());
    assert!(matches!(
        RingData::from_bytes(&raw),
        Err(RingError::UnknownFormatVersion { version: 9 })
    ));
}
