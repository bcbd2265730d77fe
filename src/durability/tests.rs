#![cfg(test)]

use std::sync::Arc;

use tempfile::tempdir;

use crate::config::{Config, DurabilityConfig};
use crate::error::UmbraError;
use crate::storage::property_value::PropertyValue;
use crate::storage::types::{Gid, View};
use crate::storage::Storage;

fn durable_config(root: &std::path::Path) -> Config {
    Config {
        durability: Some(DurabilityConfig::new(
            root.join("snapshots"),
            root.join("wal"),
        )),
        ..Config::default()
    }
}

fn reopen(config: &Config) -> Arc<Storage> {
    Storage::open(config.clone()).unwrap()
}

mod recovery {
    use super::*;

    #[test]
    fn wal_only_roundtrip() {
        let dir = tempdir().expect("tempdir");
        let config = durable_config(dir.path());

        let (person, name, knows, alice, bob);
        {
            let storage = Storage::open(config.clone()).unwrap();
            person = storage.name_to_label("Person");
            name = storage.name_to_property("name");
            knows = storage.name_to_edge_type("KNOWS");

            let acc = storage.access();
            let a = acc.create_vertex();
            a.add_label(person).unwrap();
            a.set_property(name, PropertyValue::String("alice".into()))
                .unwrap();
            let b = acc.create_vertex();
            b.set_property(name, PropertyValue::String("bob".into()))
                .unwrap();
            acc.create_edge(&a, &b, knows).unwrap();
            alice = a.gid();
            bob = b.gid();
            acc.commit().unwrap();

            let acc = storage.access();
            let b = acc.find_vertex(bob, View::New).unwrap();
            b.set_property(name, PropertyValue::String("robert".into()))
                .unwrap();
            acc.commit().unwrap();
        }

        let storage = reopen(&config);
        let person = storage.name_to_label("Person");
        let name = storage.name_to_property("name");
        let acc = storage.access();
        assert_eq!(acc.vertices(View::New).len(), 2);

        let a = acc.find_vertex(alice, View::New).unwrap();
        assert!(a.has_label(person, View::New).unwrap());
        assert_eq!(
            a.property(name, View::New).unwrap(),
            PropertyValue::String("alice".into())
        );
        let out = a.out_edges(View::New, &[]).unwrap();
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].to_vertex(), bob);

        let b = acc.find_vertex(bob, View::New).unwrap();
        assert_eq!(
            b.property(name, View::New).unwrap(),
            PropertyValue::String("robert".into())
        );

        // Fresh writes must not collide with recovered gids.
        let fresh = acc.create_vertex().gid();
        assert!(fresh > alice && fresh > bob);
    }

    #[test]
    fn snapshot_plus_wal_roundtrip() {
        let dir = tempdir().expect("tempdir");
        let config = durable_config(dir.path());

        let (value, gid);
        {
            let storage = Storage::open(config.clone()).unwrap();
            value = storage.name_to_property("value");

            let acc = storage.access();
            let v = acc.create_vertex();
            v.set_property(value, PropertyValue::Int(1)).unwrap();
            gid = v.gid();
            acc.commit().unwrap();

            storage.create_snapshot().unwrap();

            // Writes after the snapshot land only in the WAL chain.
            let acc = storage.access();
            let v = acc.find_vertex(gid, View::New).unwrap();
            v.set_property(value, PropertyValue::Int(2)).unwrap();
            let extra = acc.create_vertex();
            extra.set_property(value, PropertyValue::Int(3)).unwrap();
            acc.commit().unwrap();
        }

        let storage = reopen(&config);
        let value = storage.name_to_property("value");
        let acc = storage.access();
        assert_eq!(acc.vertices(View::New).len(), 2);
        let v = acc.find_vertex(gid, View::New).unwrap();
        assert_eq!(
            v.property(value, View::New).unwrap(),
            PropertyValue::Int(2)
        );
    }

    #[test]
    fn deletions_survive_recovery() {
        let dir = tempdir().expect("tempdir");
        let config = durable_config(dir.path());

        let kept;
        {
            let storage = Storage::open(config.clone()).unwrap();
            let acc = storage.access();
            let a = acc.create_vertex();
            let b = acc.create_vertex();
            kept = a.gid();
            let doomed = b.gid();
            acc.commit().unwrap();

            let acc = storage.access();
            let b = acc.find_vertex(doomed, View::New).unwrap();
            acc.delete_vertex(&b).unwrap();
            acc.commit().unwrap();
        }

        let storage = reopen(&config);
        let acc = storage.access();
        let visible = acc.vertices(View::New);
        assert_eq!(visible.len(), 1);
        assert_eq!(visible[0].gid(), kept);
    }

    #[test]
    fn index_definitions_are_recovered() {
        let dir = tempdir().expect("tempdir");
        let config = durable_config(dir.path());

        {
            let storage = Storage::open(config.clone()).unwrap();
            storage.create_label_index("Person").unwrap();
            storage
                .create_label_property_index("Person", "age")
                .unwrap();
            let person = storage.name_to_label("Person");
            let age = storage.name_to_property("age");

            let acc = storage.access();
            let v = acc.create_vertex();
            v.add_label(person).unwrap();
            v.set_property(age, PropertyValue::Int(40)).unwrap();
            acc.commit().unwrap();
        }

        let storage = reopen(&config);
        let person = storage.name_to_label("Person");
        let age = storage.name_to_property("age");
        let acc = storage.access();
        assert_eq!(acc.vertices_by_label(person, View::New).len(), 1);
        assert_eq!(
            acc.vertices_by_label_property(person, age, Some(&PropertyValue::Int(40)), View::New)
                .len(),
            1
        );
    }

    #[test]
    fn gap_in_wal_chain_aborts_recovery() {
        let dir = tempdir().expect("tempdir");
        let mut config = durable_config(dir.path());
        if let Some(durability) = config.durability.as_mut() {
            // Finalize a segment after every transaction.
            durability.wal_file_size_kib = 0;
        }

        {
            let storage = Storage::open(config.clone()).unwrap();
            for _ in 0..3 {
                let acc = storage.access();
                acc.create_vertex();
                acc.commit().unwrap();
            }
        }

        let wal_dir = config
            .durability
            .as_ref()
            .unwrap()
            .wal_directory
            .clone();
        let mut segments: Vec<_> = std::fs::read_dir(&wal_dir)
            .unwrap()
            .map(|entry| entry.unwrap().path())
            .collect();
        segments.sort();
        assert_eq!(segments.len(), 3);
        std::fs::remove_file(&segments[1]).unwrap();

        let result = Storage::open(config);
        assert!(matches!(result, Err(UmbraError::Recovery(_))));
    }

    #[test]
    fn missing_earliest_segment_without_snapshot_aborts_recovery() {
        let dir = tempdir().expect("tempdir");
        let mut config = durable_config(dir.path());
        if let Some(durability) = config.durability.as_mut() {
            durability.wal_file_size_kib = 0;
        }

        {
            let storage = Storage::open(config.clone()).unwrap();
            for _ in 0..3 {
                let acc = storage.access();
                acc.create_vertex();
                acc.commit().unwrap();
            }
        }

        // With no snapshot, losing the first segment must not silently drop
        // its transactions.
        let wal_dir = config
            .durability
            .as_ref()
            .unwrap()
            .wal_directory
            .clone();
        let mut segments: Vec<_> = std::fs::read_dir(&wal_dir)
            .unwrap()
            .map(|entry| entry.unwrap().path())
            .collect();
        segments.sort();
        assert_eq!(segments.len(), 3);
        std::fs::remove_file(&segments[0]).unwrap();

        let result = Storage::open(config);
        assert!(matches!(result, Err(UmbraError::Recovery(_))));
    }

    #[test]
    fn epoch_history_records_every_recovered_epoch() {
        let dir = tempdir().expect("tempdir");
        let config = durable_config(dir.path());

        {
            let storage = Storage::open(config.clone()).unwrap();
            let acc = storage.access();
            acc.create_vertex();
            acc.commit().unwrap();
        }
        {
            let storage = Storage::open(config.clone()).unwrap();
            assert_eq!(storage.epoch_history.len(), 1);
            let acc = storage.access();
            acc.create_vertex();
            acc.commit().unwrap();
        }

        // Two past instance lifetimes, each closed at the commit timestamp
        // it reached; the running instance has its own fresh epoch.
        let storage = reopen(&config);
        assert_eq!(storage.epoch_history.len(), 2);
        assert_eq!(storage.epoch_history[0].1, 1);
        assert_eq!(storage.epoch_history[1].1, 2);
        assert_ne!(storage.epoch_history[0].0, storage.epoch_history[1].0);
        assert!(storage
            .epoch_history
            .iter()
            .all(|(epoch, _)| epoch != &storage.epoch_id));
    }

    #[test]
    fn empty_directories_recover_to_empty_storage() {
        let dir = tempdir().expect("tempdir");
        let config = durable_config(dir.path());
        let storage = Storage::open(config).unwrap();
        let acc = storage.access();
        assert!(acc.vertices(View::New).is_empty());
        assert_eq!(storage.last_commit_timestamp(), 0);
    }
}

mod snapshots {
    use super::*;

    #[test]
    fn retention_prunes_old_snapshots() {
        let dir = tempdir().expect("tempdir");
        let mut config = durable_config(dir.path());
        if let Some(durability) = config.durability.as_mut() {
            durability.snapshot_retention_count = 1;
        }
        let storage = Storage::open(config.clone()).unwrap();

        for round in 0..3 {
            let acc = storage.access();
            let v = acc.create_vertex();
            v.set_property(
                storage.name_to_property("round"),
                PropertyValue::Int(round),
            )
            .unwrap();
            acc.commit().unwrap();
            storage.create_snapshot().unwrap();
        }

        let snapshot_dir = &config.durability.as_ref().unwrap().snapshot_directory;
        let snapshots = std::fs::read_dir(snapshot_dir)
            .unwrap()
            .filter(|entry| {
                entry
                    .as_ref()
                    .unwrap()
                    .path()
                    .extension()
                    .map_or(false, |ext| ext == "snapshot")
            })
            .count();
        assert_eq!(snapshots, 1);
    }

    #[test]
    fn snapshot_captures_a_consistent_view() {
        let dir = tempdir().expect("tempdir");
        let config = durable_config(dir.path());
        let storage = Storage::open(config.clone()).unwrap();
        let value = storage.name_to_property("value");

        {
            let acc = storage.access();
            let v = acc.create_vertex();
            v.set_property(value, PropertyValue::Int(1)).unwrap();
            acc.commit().unwrap();
        }

        // An open transaction's uncommitted writes must not leak into the
        // snapshot.
        let writer = storage.access();
        let pending = writer.create_vertex();
        pending.set_property(value, PropertyValue::Int(99)).unwrap();
        let path = storage.create_snapshot().unwrap();
        writer.abort();

        let contents = crate::durability::snapshot::load_snapshot(&path).unwrap();
        assert_eq!(contents.vertices.len(), 1);
        assert_eq!(contents.start_timestamp, 1);
    }

    #[test]
    fn wal_rollover_produces_sequential_segments() {
        let dir = tempdir().expect("tempdir");
        let mut config = durable_config(dir.path());
        if let Some(durability) = config.durability.as_mut() {
            durability.wal_file_size_kib = 0;
        }
        let storage = Storage::open(config.clone()).unwrap();
        for _ in 0..4 {
            let acc = storage.access();
            acc.create_vertex();
            acc.commit().unwrap();
        }

        let wal_dir = &config.durability.as_ref().unwrap().wal_directory;
        let infos =
            crate::durability::get_wal_files(wal_dir, Some(&storage.uuid), None).unwrap();
        assert_eq!(infos.len(), 4);
        let seqs: Vec<u64> = infos.iter().map(|info| info.seq_num).collect();
        assert_eq!(seqs, vec![0, 1, 2, 3]);
        for pair in infos.windows(2) {
            assert!(pair[0].to_timestamp < pair[1].from_timestamp);
        }
    }
}

mod gids {
    use super::*;

    #[test]
    fn gids_are_never_recycled_across_restarts() {
        let dir = tempdir().expect("tempdir");
        let config = durable_config(dir.path());
        let deleted_gid;
        {
            let storage = Storage::open(config.clone()).unwrap();
            let acc = storage.access();
            acc.create_vertex();
            deleted_gid = acc.create_vertex().gid();
            acc.commit().unwrap();

            let acc = storage.access();
            let doomed = acc.find_vertex(deleted_gid, View::New).unwrap();
            acc.delete_vertex(&doomed).unwrap();
            acc.commit().unwrap();
        }
        // Even though the newest gid belonged to a deleted vertex, it must
        // not be handed out again.
        let storage = reopen(&config);
        let acc = storage.access();
        let fresh = acc.create_vertex().gid();
        assert_eq!(fresh, Gid::from_u64(deleted_gid.as_u64() + 1));
    }
}
