mod common;

use std::collections::BTreeMap;

use common::*;
use jarstore_core::*;
use serde_json::json;
use speculate2::speculate;

speculate! {
    describe "dirty tracking" {
        before {
            let jar = RecordingJar::new();
        }

        it "registers exactly once when marked changed twice" {
            let obj = attached(&jar, 1);

            obj.mark_changed().expect("mark_changed failed");
            obj.mark_changed().expect("mark_changed failed");

            assert_eq!(jar.register_count(), 1);
            assert_eq!(obj.is_changed(), Some(true));
        }

        it "registers once for a run of attribute writes" {
            let obj = attached(&jar, 1);

            obj.set_attr("title", "first").expect("write failed");
            obj.set_attr("title", "second").expect("write failed");
            obj.set_attr("body", "text").expect("write failed");

            assert_eq!(jar.register_count(), 1);
            assert_eq!(obj.status(), Status::Changed);
            assert_eq!(obj.get_attr("title").unwrap(), Some(json!("second")));
        }

        it "unregisters exactly once when marked unchanged" {
            let obj = attached(&jar, 1);
            obj.set_attr("title", "x").expect("write failed");

            obj.mark_unchanged().expect("mark_unchanged failed");
            obj.mark_unchanged().expect("mark_unchanged failed");

            assert_eq!(jar.register_count(), 1);
            assert_eq!(jar.unregister_count(), 1);
            assert_eq!(obj.is_changed(), Some(false));
        }

        it "does not unregister an object that was never changed" {
            let obj = attached(&jar, 1);

            obj.mark_unchanged().expect("mark_unchanged failed");

            assert_eq!(jar.unregister_count(), 0);
        }

        it "registers again after being marked unchanged" {
            let obj = attached(&jar, 1);
            obj.set_attr("title", "x").unwrap();
            obj.mark_unchanged().unwrap();

            obj.set_attr("title", "y").unwrap();

            assert_eq!(jar.register_count(), 2);
        }

        it "ignores special and volatile names" {
            let obj = attached(&jar, 1);

            obj.set_attr("_p_estimated_size", 10).expect("write failed");
            obj.set_attr("_v_cache", "hot").expect("write failed");
            obj.set_attr("__parent__", "meta").expect("write failed");

            assert_eq!(jar.register_count(), 0);
            assert_eq!(obj.is_changed(), Some(false));
            assert_eq!(obj.get_attr("_v_cache").unwrap(), Some(json!("hot")));
        }

        it "does not register an object without an oid" {
            let obj = item_type().instantiate();
            obj.set_jar(JarHandle::new(&jar));

            obj.set_attr("title", "x").expect("write failed");

            assert_eq!(jar.register_count(), 0);
        }

        it "registers the first write once an oid is assigned" {
            let obj = item_type().instantiate();
            obj.set_jar(JarHandle::new(&jar));

            obj.mark_changed().expect("mark_changed failed");
            assert_eq!(obj.is_changed(), Some(false));
            obj.set_oid(Oid(7));
            obj.set_attr("title", "x").expect("write failed");

            assert_eq!(obj.is_changed(), Some(true));
            assert_eq!(jar.register_count(), 1);
            assert_eq!(*jar.registered.lock().unwrap(), vec![Some(Oid(7))]);
        }

        it "restores the previous value when registration fails" {
            let kind = ResourceType::new("Point").with_slots(["x"]);
            let obj = kind.instantiate();
            obj.set_attr("x", 1).unwrap();
            obj.set_attr("label", "origin").unwrap();
            obj.set_jar(JarHandle::new(&jar));
            obj.set_oid(Oid(1));
            jar.fail_registrations();

            assert!(obj.set_attr("x", 2).is_err());
            assert!(obj.set_attr("label", "moved").is_err());
            assert!(obj.del_attr("label").is_err());

            assert_eq!(obj.get_attr("x").unwrap(), Some(json!(1)));
            assert_eq!(obj.get_attr("label").unwrap(), Some(json!("origin")));
        }

        it "rolls back the write and the flag when registration fails" {
            let obj = attached(&jar, 1);
            obj.set_attr("_v_warm", true).unwrap();
            jar.fail_registrations();

            let result = obj.set_attr("title", "lost");

            assert!(matches!(result, Err(Error::Jar(_))));
            assert_eq!(obj.is_changed(), Some(false));
            assert_eq!(obj.get_attr("title").unwrap(), None);
        }

        it "rolls back mark_changed when registration fails" {
            let obj = attached(&jar, 1);
            jar.fail_registrations();

            assert!(obj.mark_changed().is_err());
            assert_eq!(obj.status(), Status::Saved);
        }

        it "tracks attribute deletion" {
            let obj = item_type().instantiate();
            obj.set_attr("title", "x").unwrap();
            obj.set_jar(JarHandle::new(&jar));
            obj.set_oid(Oid(3));

            let removed = obj.del_attr("title").expect("delete failed");

            assert_eq!(removed, Some(json!("x")));
            assert_eq!(jar.register_count(), 1);
        }
    }

    describe "unattached objects" {
        it "never calls the jar and reports unchanged" {
            let jar = RecordingJar::new();
            let obj = item_type().instantiate();

            for i in 0..5 {
                obj.set_attr("counter", i).expect("write failed");
            }
            obj.mark_changed().expect("mark_changed failed");

            assert_eq!(obj.is_changed(), Some(false));
            assert_eq!(obj.status(), Status::Unsaved);
            assert_eq!(obj.lifecycle(), Lifecycle::Unsaved);
            assert_eq!(jar.register_count(), 0);
            assert_eq!(jar.unregister_count(), 0);
        }

        it "starts with no identity" {
            let obj = item_type().instantiate();

            assert!(obj.jar().is_none());
            assert!(obj.oid().is_none());
            assert!(obj.serial().is_none());
            assert!(obj.name().is_none());
            assert!(obj.parent_ref().is_none());
        }
    }

    describe "ghosts" {
        before {
            let jar = RecordingJar::new();
        }

        it "report unknown change state" {
            let ghost = PersistentObject::ghost(item_type(), Oid(9), JarHandle::new(&jar));

            assert_eq!(ghost.is_changed(), None);
            assert_eq!(ghost.status(), Status::Ghost);
            assert_eq!(ghost.lifecycle(), Lifecycle::Ghost);
        }

        it "refuse tracked reads and writes until activated" {
            let ghost = PersistentObject::ghost(item_type(), Oid(9), JarHandle::new(&jar));

            assert!(matches!(ghost.get_attr("title"), Err(Error::Integrity(_))));
            assert!(matches!(ghost.set_attr("title", "x"), Err(Error::Integrity(_))));
            assert!(ghost.set_attr("_v_hint", 1).is_ok());
            assert_eq!(jar.register_count(), 0);
        }

        it "are not marked changed" {
            let ghost = PersistentObject::ghost(item_type(), Oid(9), JarHandle::new(&jar));

            ghost.mark_changed().unwrap();

            assert_eq!(ghost.is_changed(), None);
            assert_eq!(jar.register_count(), 0);
        }

        it "load their state on activation" {
            let mut attributes = BTreeMap::new();
            attributes.insert("title".to_string(), json!("stored"));
            jar.add_state(Oid(9), ObjectState::with_attributes(attributes));
            let ghost = PersistentObject::ghost(item_type(), Oid(9), JarHandle::new(&jar));

            tokio_test::block_on(ghost.activate()).expect("activation failed");

            assert_eq!(ghost.is_changed(), Some(false));
            assert_eq!(ghost.get_attr("title").unwrap(), Some(json!("stored")));
        }

        it "propagate the jar error when state is missing" {
            let ghost = PersistentObject::ghost(item_type(), Oid(9), JarHandle::new(&jar));

            let result = tokio_test::block_on(ghost.activate());

            assert!(matches!(result, Err(Error::NotFound(_))));
            assert_eq!(ghost.status(), Status::Ghost);
        }

        it "cannot be pinned" {
            let ghost = PersistentObject::ghost(item_type(), Oid(9), JarHandle::new(&jar));

            assert!(matches!(ghost.set_sticky(true), Err(Error::Validation(_))));
        }
    }

    describe "eviction" {
        before {
            let jar = RecordingJar::new();
        }

        it "deactivates an up-to-date object" {
            let obj = attached(&jar, 1);
            obj.set_attr("_v_tmp", 1).unwrap();

            assert!(obj.deactivate());
            assert_eq!(obj.status(), Status::Ghost);
        }

        it "keeps sticky and changed objects resident" {
            let pinned = attached(&jar, 1);
            pinned.set_sticky(true).unwrap();
            let dirty = attached(&jar, 2);
            dirty.set_attr("title", "x").unwrap();

            assert!(!pinned.deactivate());
            assert!(!dirty.deactivate());
            assert_eq!(pinned.status(), Status::Sticky);
            assert_eq!(dirty.status(), Status::Changed);
        }

        it "invalidates a changed object and unregisters it" {
            let obj = attached(&jar, 1);
            obj.set_attr("title", "x").unwrap();

            obj.invalidate().expect("invalidate failed");

            assert_eq!(jar.unregister_count(), 1);
            assert_eq!(obj.status(), Status::Ghost);
        }

        it "detaches back to unsaved" {
            let obj = attached(&jar, 1);
            obj.set_serial(4);
            obj.set_name("child");

            obj.detach();

            assert_eq!(obj.status(), Status::Unsaved);
            assert!(obj.oid().is_none());
            assert!(obj.serial().is_none());
            assert!(obj.name().is_none());
        }
    }

    describe "status" {
        it "prefers sticky over changed" {
            let jar = RecordingJar::new();
            let obj = attached(&jar, 1);
            obj.set_attr("title", "x").unwrap();
            obj.set_sticky(true).unwrap();

            assert_eq!(obj.status(), Status::Sticky);
            assert_eq!(obj.lifecycle(), Lifecycle::Changed);
        }

        it "round-trips through its string form" {
            for status in [Status::Unsaved, Status::Ghost, Status::Sticky, Status::Changed, Status::Saved] {
                assert_eq!(Status::from_str(status.as_str()), Some(status));
            }
        }
    }

    describe "serial" {
        it "rejects non-integer values" {
            let obj = item_type().instantiate();
            obj.set_serial(3);

            assert!(matches!(obj.set_serial_value(&json!("abc")), Err(Error::Validation(_))));
            assert!(matches!(obj.set_serial_value(&json!(1.5)), Err(Error::Validation(_))));
            assert_eq!(obj.serial(), Some(3));
        }

        it "accepts integers unchanged" {
            let obj = item_type().instantiate();

            obj.set_serial_value(&json!(42)).expect("valid serial rejected");

            assert_eq!(obj.serial(), Some(42));
            obj.del_serial();
            assert!(obj.serial().is_none());
        }
    }

    describe "state capture" {
        it "round-trips tracked attributes and drops reserved ones" {
            let obj = item_type().instantiate();
            obj.set_attr("title", "Report").unwrap();
            obj.set_attr("pages", 12).unwrap();
            obj.set_attr("_v_render_cache", "<html>").unwrap();
            obj.set_attr("_p_note", "internal").unwrap();

            let state = obj.get_state().expect("capture failed");
            let fresh = item_type().instantiate();
            fresh.set_state(state.clone()).expect("restore failed");

            let attributes = state.attributes.expect("missing attributes");
            assert_eq!(attributes.len(), 2);
            assert!(!attributes.contains_key("_v_render_cache"));
            assert!(!attributes.contains_key("_p_note"));
            assert_eq!(fresh.get_attr("title").unwrap(), Some(json!("Report")));
            assert_eq!(fresh.get_attr("pages").unwrap(), Some(json!(12)));
            assert_eq!(fresh.get_attr("_v_render_cache").unwrap(), None);
        }

        it "replaces instead of merging on restore" {
            let obj = item_type().instantiate();
            obj.set_attr("stale", true).unwrap();
            let mut attributes = BTreeMap::new();
            attributes.insert("fresh".to_string(), json!(1));

            obj.set_state(ObjectState::with_attributes(attributes)).unwrap();

            assert_eq!(obj.get_attr("stale").unwrap(), None);
            assert_eq!(obj.get_attr("fresh").unwrap(), Some(json!(1)));
        }

        it "does not mark an attached object changed on restore" {
            let jar = RecordingJar::new();
            let obj = attached(&jar, 1);

            obj.set_state(ObjectState::with_attributes(BTreeMap::new())).unwrap();

            assert_eq!(jar.register_count(), 0);
        }

        it "captures slots separately" {
            let kind = ResourceType::new("Point").with_slots(["x", "y", "_v_norm"]);
            let point = kind.instantiate();
            point.set_attr("x", 1).unwrap();
            point.set_attr("_v_norm", 2.5).unwrap();

            let state = point.get_state().unwrap();

            assert_eq!(state.slots.get("x"), Some(&json!(1)));
            assert!(!state.slots.contains_key("y"));
            assert!(!state.slots.contains_key("_v_norm"));
        }

        it "fails to restore attributes into a type without a dict" {
            let kind = ResourceType::new("Packed").with_slots(["a"]).without_dict();
            let obj = kind.instantiate();
            let mut attributes = BTreeMap::new();
            attributes.insert("a".to_string(), json!(1));

            let result = obj.set_state(ObjectState::with_attributes(attributes));

            match result {
                Err(Error::Integrity(msg)) => assert_eq!(msg, "No instance dict"),
                other => panic!("expected integrity error, got {:?}", other),
            }
        }

        it "rebuilds an object from its reduction" {
            let obj = item_type().instantiate_with(vec![json!("seed")]);
            obj.set_attr("title", "copy me").unwrap();

            let reduced = obj.reduce().expect("reduce failed");
            let copy = reduced.clone().rebuild().expect("rebuild failed");

            assert_eq!(reduced.constructor.name(), "Item");
            assert_eq!(reduced.args, vec![json!("seed")]);
            assert!(!copy.ptr_eq(&obj));
            assert_eq!(copy.get_attr("title").unwrap(), Some(json!("copy me")));
        }
    }
}
