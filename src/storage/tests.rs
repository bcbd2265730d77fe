#![cfg(test)]

use std::thread;
use std::time::Duration;

use crate::config::{Config, GcConfig, GcType};
use crate::error::UmbraError;
use crate::storage::types::{EdgeTypeId, LabelId, PropertyId, View};
use crate::storage::property_value::PropertyValue;
use crate::storage::Storage;

fn gc_config(interval: Duration) -> Config {
    Config {
        gc: GcConfig {
            gc_type: GcType::Periodic,
            interval,
        },
        ..Config::default()
    }
}

mod gc_scenarios {
    use super::*;

    // A transaction stays open across GC runs while objects are created,
    // labeled, wired into an edge ring, and detach-deleted; the collector
    // must reclaim dead versions without ever stealing live ones.
    #[test]
    fn sanity_under_periodic_gc() {
        let storage = Storage::open(gc_config(Duration::from_millis(100))).unwrap();
        let mut gids = Vec::new();

        {
            let acc = storage.access();
            for _ in 0..1000 {
                gids.push(acc.create_vertex().gid());
            }

            acc.advance_command();

            for (i, gid) in gids.iter().enumerate() {
                let vertex = acc
                    .find_vertex(*gid, View::Old)
                    .expect("created by an earlier command");
                if i % 5 == 0 {
                    assert!(acc.delete_vertex(&vertex).unwrap());
                }
            }

            // Wait for GC.
            thread::sleep(Duration::from_millis(300));

            for (i, gid) in gids.iter().enumerate() {
                assert!(acc.find_vertex(*gid, View::Old).is_some());
                assert_eq!(acc.find_vertex(*gid, View::New).is_some(), i % 5 != 0);
            }
            assert_eq!(acc.vertices(View::Old).len(), 1000);
            assert_eq!(acc.vertices(View::New).len(), 800);

            acc.commit().unwrap();
        }

        // Verify the survivors and add labels to them.
        {
            let acc = storage.access();
            for (i, gid) in gids.iter().enumerate() {
                let vertex = acc.find_vertex(*gid, View::Old);
                assert_eq!(vertex.is_some(), i % 5 != 0);

                if let Some(vertex) = vertex {
                    let i = i as u32;
                    assert!(vertex.add_label(LabelId(3 * i)).unwrap());
                    assert!(vertex.add_label(LabelId(3 * i + 1)).unwrap());
                    assert!(vertex.add_label(LabelId(3 * i + 2)).unwrap());
                }
            }

            // Wait for GC.
            thread::sleep(Duration::from_millis(300));

            for (i, gid) in gids.iter().enumerate() {
                let vertex = acc.find_vertex(*gid, View::New);
                assert_eq!(vertex.is_some(), i % 5 != 0);

                if let Some(vertex) = vertex {
                    assert!(vertex.labels(View::Old).unwrap().is_empty());
                    let mut labels = vertex.labels(View::New).unwrap();
                    labels.sort();
                    let i = i as u32;
                    assert_eq!(
                        labels,
                        vec![LabelId(3 * i), LabelId(3 * i + 1), LabelId(3 * i + 2)]
                    );
                }
            }

            acc.commit().unwrap();
        }

        // Wire an edge ring over the survivors, then detach-delete.
        {
            let acc = storage.access();
            for i in 0..1000usize {
                let from = acc.find_vertex(gids[i], View::Old);
                let to = acc.find_vertex(gids[(i + 1) % 1000], View::Old);
                assert_eq!(from.is_some(), i % 5 != 0);
                assert_eq!(to.is_some(), (i + 1) % 5 != 0);

                if let (Some(from), Some(to)) = (from, to) {
                    acc.create_edge(&from, &to, EdgeTypeId(i as u32)).unwrap();
                }
            }

            for (i, gid) in gids.iter().enumerate() {
                let vertex = acc.find_vertex(*gid, View::New);
                assert_eq!(vertex.is_some(), i % 5 != 0);
                if let Some(vertex) = vertex {
                    if i % 3 == 0 {
                        assert!(acc.detach_delete_vertex(&vertex).unwrap());
                    }
                }
            }

            // Wait for GC.
            thread::sleep(Duration::from_millis(300));

            for (i, gid) in gids.iter().enumerate() {
                let vertex = acc.find_vertex(*gid, View::New);
                assert_eq!(vertex.is_some(), i % 5 != 0 && i % 3 != 0);
                let Some(vertex) = vertex else { continue };

                let out_edges = vertex.out_edges(View::New, &[]).unwrap();
                if i % 5 != 4 && i % 3 != 2 {
                    assert_eq!(out_edges.len(), 1);
                    assert_eq!(out_edges[0].edge_type(), EdgeTypeId(i as u32));
                } else {
                    assert!(out_edges.is_empty());
                }

                let in_edges = vertex.in_edges(View::New, &[]).unwrap();
                if i % 5 != 1 && i % 3 != 1 {
                    assert_eq!(in_edges.len(), 1);
                    assert_eq!(
                        in_edges[0].edge_type(),
                        EdgeTypeId(((i + 999) % 1000) as u32)
                    );
                } else {
                    assert!(in_edges.is_empty());
                }
            }

            acc.commit().unwrap();
        }
    }

    #[test]
    fn collector_frees_unreachable_deltas_and_tombstones() {
        let storage = Storage::open(Config {
            gc: GcConfig {
                gc_type: GcType::Nothing,
                interval: Duration::from_secs(3600),
            },
            ..Config::default()
        })
        .unwrap();

        let gid = {
            let acc = storage.access();
            let vertex = acc.create_vertex();
            vertex
                .set_property(PropertyId(0), PropertyValue::Int(1))
                .unwrap();
            let gid = vertex.gid();
            acc.commit().unwrap();
            gid
        };
        {
            let acc = storage.access();
            let vertex = acc.find_vertex(gid, View::New).unwrap();
            assert!(acc.delete_vertex(&vertex).unwrap());
            acc.commit().unwrap();
        }

        assert!(storage.deltas.len() > 0);
        storage.collect_garbage();
        // Chains are truncated in pass one; the parked handles are freed and
        // the tombstone swept once no transaction from before the unlink
        // remains.
        storage.collect_garbage();
        assert_eq!(storage.deltas.len(), 0);
        assert!(storage.vertices.read().is_empty());
    }

    #[test]
    fn gc_waits_for_active_readers() {
        let storage = Storage::open(Config {
            gc: GcConfig {
                gc_type: GcType::Nothing,
                interval: Duration::from_secs(3600),
            },
            ..Config::default()
        })
        .unwrap();

        let gid = {
            let acc = storage.access();
            let gid = acc.create_vertex().gid();
            acc.commit().unwrap();
            gid
        };

        let reader = storage.access();
        {
            let writer = storage.access();
            let vertex = writer.find_vertex(gid, View::New).unwrap();
            assert!(writer.delete_vertex(&vertex).unwrap());
            writer.commit().unwrap();
        }

        storage.collect_garbage();
        // The reader's snapshot predates the deletion, so the vertex must
        // still be reachable.
        assert!(reader.find_vertex(gid, View::Old).is_some());
        drop(reader);

        storage.collect_garbage();
        storage.collect_garbage();
        assert!(storage.vertices.read().is_empty());
    }
}

mod transaction_semantics {
    use super::*;

    fn plain_storage() -> std::sync::Arc<Storage> {
        Storage::open(Config {
            gc: GcConfig {
                gc_type: GcType::Nothing,
                interval: Duration::from_secs(3600),
            },
            ..Config::default()
        })
        .unwrap()
    }

    #[test]
    fn snapshot_isolation_across_transactions() {
        let storage = plain_storage();
        let gid = {
            let acc = storage.access();
            let vertex = acc.create_vertex();
            vertex
                .set_property(PropertyId(7), PropertyValue::Int(1))
                .unwrap();
            let gid = vertex.gid();
            acc.commit().unwrap();
            gid
        };

        let reader = storage.access();
        {
            let writer = storage.access();
            let vertex = writer.find_vertex(gid, View::New).unwrap();
            vertex
                .set_property(PropertyId(7), PropertyValue::Int(2))
                .unwrap();
            writer.commit().unwrap();
        }

        // The old reader keeps its snapshot, a fresh one sees the write.
        let vertex = reader.find_vertex(gid, View::Old).unwrap();
        assert_eq!(
            vertex.property(PropertyId(7), View::Old).unwrap(),
            PropertyValue::Int(1)
        );
        drop(reader);

        let fresh = storage.access();
        let vertex = fresh.find_vertex(gid, View::New).unwrap();
        assert_eq!(
            vertex.property(PropertyId(7), View::New).unwrap(),
            PropertyValue::Int(2)
        );
    }

    #[test]
    fn first_writer_wins_on_conflict() {
        let storage = plain_storage();
        let gid = {
            let acc = storage.access();
            let gid = acc.create_vertex().gid();
            acc.commit().unwrap();
            gid
        };

        let first = storage.access();
        let second = storage.access();
        let vertex_first = first.find_vertex(gid, View::New).unwrap();
        let vertex_second = second.find_vertex(gid, View::New).unwrap();

        vertex_first
            .set_property(PropertyId(0), PropertyValue::Int(1))
            .unwrap();
        let conflict = vertex_second.set_property(PropertyId(0), PropertyValue::Int(2));
        assert!(matches!(conflict, Err(UmbraError::Serialization)));
    }

    #[test]
    fn writer_conflicts_with_commit_after_its_snapshot() {
        let storage = plain_storage();
        let gid = {
            let acc = storage.access();
            let gid = acc.create_vertex().gid();
            acc.commit().unwrap();
            gid
        };

        let late_writer = storage.access();
        {
            let early_writer = storage.access();
            let vertex = early_writer.find_vertex(gid, View::New).unwrap();
            vertex.add_label(LabelId(1)).unwrap();
            early_writer.commit().unwrap();
        }

        let vertex = late_writer.find_vertex(gid, View::New).unwrap();
        assert!(matches!(
            vertex.add_label(LabelId(2)),
            Err(UmbraError::Serialization)
        ));
    }

    #[test]
    fn abort_rolls_back_all_changes() {
        let storage = plain_storage();
        let gid = {
            let acc = storage.access();
            let vertex = acc.create_vertex();
            vertex.add_label(LabelId(1)).unwrap();
            vertex
                .set_property(PropertyId(3), PropertyValue::String("kept".into()))
                .unwrap();
            let gid = vertex.gid();
            acc.commit().unwrap();
            gid
        };

        {
            let acc = storage.access();
            let vertex = acc.find_vertex(gid, View::New).unwrap();
            vertex.remove_label(LabelId(1)).unwrap();
            vertex
                .set_property(PropertyId(3), PropertyValue::String("dropped".into()))
                .unwrap();
            let ghost = acc.create_vertex().gid();
            acc.abort();

            let check = storage.access();
            let vertex = check.find_vertex(gid, View::New).unwrap();
            assert!(vertex.has_label(LabelId(1), View::New).unwrap());
            assert_eq!(
                vertex.property(PropertyId(3), View::New).unwrap(),
                PropertyValue::String("kept".into())
            );
            assert!(check.find_vertex(ghost, View::New).is_none());
        }
    }

    #[test]
    fn dropping_an_accessor_aborts() {
        let storage = plain_storage();
        let gid;
        {
            let acc = storage.access();
            gid = acc.create_vertex().gid();
            // No commit.
        }
        let acc = storage.access();
        assert!(acc.find_vertex(gid, View::New).is_none());
    }

    #[test]
    fn set_property_returns_old_value_and_skips_noops() {
        let storage = plain_storage();
        let acc = storage.access();
        let vertex = acc.create_vertex();
        let deltas_before_set = storage.deltas.len();
        assert_eq!(
            vertex
                .set_property(PropertyId(1), PropertyValue::Int(10))
                .unwrap(),
            PropertyValue::Null
        );
        assert_eq!(
            vertex
                .set_property(PropertyId(1), PropertyValue::Int(10))
                .unwrap(),
            PropertyValue::Int(10)
        );
        // The repeated identical write must not have produced a delta.
        assert_eq!(storage.deltas.len(), deltas_before_set + 1);
        assert_eq!(
            vertex
                .set_property(PropertyId(1), PropertyValue::Null)
                .unwrap(),
            PropertyValue::Int(10)
        );
        assert!(vertex
            .property(PropertyId(1), View::New)
            .unwrap()
            .is_null());
    }

    #[test]
    fn delete_vertex_refuses_attached_edges() {
        let storage = plain_storage();
        let acc = storage.access();
        let a = acc.create_vertex();
        let b = acc.create_vertex();
        acc.create_edge(&a, &b, EdgeTypeId(0)).unwrap();
        assert!(matches!(
            acc.delete_vertex(&a),
            Err(UmbraError::VertexHasEdges)
        ));
        assert!(acc.detach_delete_vertex(&a).unwrap());
        assert!(acc.find_vertex(a.gid(), View::New).is_none());
        let b = acc.find_vertex(b.gid(), View::New).unwrap();
        assert!(b.in_edges(View::New, &[]).unwrap().is_empty());
    }

    #[test]
    fn edge_properties_respect_configuration() {
        let storage = plain_storage();
        let acc = storage.access();
        let a = acc.create_vertex();
        let b = acc.create_vertex();
        let edge = acc.create_edge(&a, &b, EdgeTypeId(1)).unwrap();
        assert!(matches!(
            edge.set_property(PropertyId(0), PropertyValue::Int(1)),
            Err(UmbraError::PropertiesDisabled)
        ));
        drop(acc);

        let storage = Storage::open(Config {
            items: crate::config::ItemsConfig {
                properties_on_edges: true,
            },
            ..Config::default()
        })
        .unwrap();
        let acc = storage.access();
        let a = acc.create_vertex();
        let b = acc.create_vertex();
        let edge = acc.create_edge(&a, &b, EdgeTypeId(1)).unwrap();
        edge.set_property(PropertyId(0), PropertyValue::Int(1))
            .unwrap();
        assert_eq!(
            edge.property(PropertyId(0), View::New).unwrap(),
            PropertyValue::Int(1)
        );
    }
}

mod index_scans {
    use super::*;

    #[test]
    fn label_index_respects_snapshots() {
        let storage = Storage::open(Config::default()).unwrap();
        storage.create_label_index("Person").unwrap();
        let label = storage.name_to_label("Person");

        let gid = {
            let acc = storage.access();
            let vertex = acc.create_vertex();
            vertex.add_label(label).unwrap();
            let gid = vertex.gid();
            acc.commit().unwrap();
            gid
        };

        let acc = storage.access();
        let found = acc.vertices_by_label(label, View::New);
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].gid(), gid);

        // An uncommitted label addition is only visible to its own
        // transaction.
        let writer = storage.access();
        let extra = writer.create_vertex();
        extra.add_label(label).unwrap();
        assert_eq!(writer.vertices_by_label(label, View::New).len(), 2);
        assert_eq!(acc.vertices_by_label(label, View::New).len(), 1);
        writer.abort();
        assert_eq!(acc.vertices_by_label(label, View::New).len(), 1);
    }

    #[test]
    fn label_property_index_filters_by_value() {
        let storage = Storage::open(Config::default()).unwrap();
        storage
            .create_label_property_index("Person", "age")
            .unwrap();
        let label = storage.name_to_label("Person");
        let age = storage.name_to_property("age");

        {
            let acc = storage.access();
            for value in [10i64, 20, 20, 30] {
                let vertex = acc.create_vertex();
                vertex.add_label(label).unwrap();
                vertex
                    .set_property(age, PropertyValue::Int(value))
                    .unwrap();
            }
            acc.commit().unwrap();
        }

        let acc = storage.access();
        assert_eq!(
            acc.vertices_by_label_property(label, age, None, View::New)
                .len(),
            4
        );
        assert_eq!(
            acc.vertices_by_label_property(label, age, Some(&PropertyValue::Int(20)), View::New)
                .len(),
            2
        );
        // Numeric unification applies to index lookups too.
        assert_eq!(
            acc.vertices_by_label_property(
                label,
                age,
                Some(&PropertyValue::Double(20.0)),
                View::New
            )
            .len(),
            2
        );
    }

    #[test]
    fn backfill_covers_preexisting_vertices() {
        let storage = Storage::open(Config::default()).unwrap();
        let label = storage.name_to_label("Tagged");
        {
            let acc = storage.access();
            let vertex = acc.create_vertex();
            vertex.add_label(label).unwrap();
            acc.commit().unwrap();
        }
        storage.create_label_index("Tagged").unwrap();
        let acc = storage.access();
        assert_eq!(acc.vertices_by_label(label, View::New).len(), 1);
    }
}
