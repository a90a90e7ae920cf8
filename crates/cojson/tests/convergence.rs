//! Convergence tests: replicas holding the same transactions materialize
//! the same content regardless of delivery order.

use cojson::perms::{MemberKey, Role};
use cojson::{CreateOptions, LocalNode, RawCoId};
use cojson_testkit::fixtures::{exchange, replicate, replicate_one, TestFixture};
use cojson_testkit::generators::{list_edits, map_edits, ListEdit, MapEdit};
use proptest::prelude::*;
use serde_json::{json, Value};

/// Alice and Bob, both writers of a value created by `create`.
fn two_writers(
    fixture: &TestFixture,
    create: impl FnOnce(&mut LocalNode, RawCoId) -> RawCoId,
) -> (LocalNode, LocalNode, RawCoId) {
    let mut alice = fixture.local_node();
    let mut bob = fixture.local_node();
    let group = alice.create_group().unwrap();
    alice
        .add_member(&group, MemberKey::Everyone, Role::Writer)
        .unwrap();
    let id = create(&mut alice, group);
    replicate_one(&alice, &mut bob, &id);
    fixture.advance(10);
    (alice, bob, id)
}

fn shared_map(fixture: &TestFixture) -> (LocalNode, LocalNode, RawCoId) {
    two_writers(fixture, |node, group| {
        node.create_map(CreateOptions::owned_by(group), Vec::new())
            .unwrap()
    })
}

fn json_of(node: &LocalNode, id: &RawCoId) -> Value {
    node.content(id).unwrap().to_json()
}

#[test]
fn test_later_write_wins() {
    let fixture = TestFixture::new();
    let (mut alice, mut bob, map) = shared_map(&fixture);

    alice.set(&map, "title", json!("first")).unwrap();
    fixture.advance(5);
    bob.set(&map, "title", json!("second")).unwrap();

    exchange(&mut alice, &mut bob);
    assert_eq!(json_of(&alice, &map), json!({"title": "second"}));
    assert_eq!(json_of(&bob, &map), json!({"title": "second"}));
}

#[test]
fn test_same_millisecond_writes_agree() {
    let fixture = TestFixture::new();
    let (mut alice, mut bob, map) = shared_map(&fixture);

    alice.set(&map, "title", json!("alice")).unwrap();
    bob.set(&map, "title", json!("bob")).unwrap();

    exchange(&mut alice, &mut bob);
    let merged = json_of(&alice, &map);
    assert_eq!(merged, json_of(&bob, &map));
    assert!(merged == json!({"title": "alice"}) || merged == json!({"title": "bob"}));
}

#[test]
fn test_delete_then_set() {
    let fixture = TestFixture::new();
    let (mut alice, mut bob, map) = shared_map(&fixture);

    alice.set(&map, "k", json!(1)).unwrap();
    replicate_one(&alice, &mut bob, &map);
    fixture.advance(1);
    bob.delete(&map, "k").unwrap();
    fixture.advance(1);
    alice.set(&map, "other", json!(true)).unwrap();

    exchange(&mut alice, &mut bob);
    assert_eq!(json_of(&alice, &map), json!({"other": true}));
    assert_eq!(json_of(&alice, &map), json_of(&bob, &map));
}

#[test]
fn test_replicating_twice_applies_nothing() {
    let fixture = TestFixture::new();
    let (mut alice, mut bob, map) = shared_map(&fixture);
    alice.set(&map, "k", json!(1)).unwrap();

    assert!(replicate(&alice, &mut bob) > 0);
    assert_eq!(replicate(&alice, &mut bob), 0);
    assert_eq!(json_of(&bob, &map), json!({"k": 1}));
}

#[test]
fn test_concurrent_list_inserts_interleave_deterministically() {
    let fixture = TestFixture::new();
    let (mut alice, mut bob, list) = two_writers(&fixture, |node, group| {
        node.create_list(CreateOptions::owned_by(group), vec![json!("start")])
            .unwrap()
    });

    alice.append(&list, json!("a1")).unwrap();
    alice.append(&list, json!("a2")).unwrap();
    bob.append(&list, json!("b1")).unwrap();

    exchange(&mut alice, &mut bob);
    let merged = json_of(&alice, &list);
    assert_eq!(merged, json_of(&bob, &list));

    let items = merged.as_array().unwrap();
    assert_eq!(items.len(), 4);
    assert_eq!(items[0], json!("start"));
    let a1 = items.iter().position(|v| v == "a1").unwrap();
    let a2 = items.iter().position(|v| v == "a2").unwrap();
    assert!(a1 < a2);
}

#[test]
fn test_concurrent_text_edits_merge() {
    let fixture = TestFixture::new();
    let (mut alice, mut bob, text) = two_writers(&fixture, |node, group| {
        node.create_plain_text(CreateOptions::owned_by(group), "world")
            .unwrap()
    });

    alice.insert_text(&text, 0, "hello ").unwrap();
    bob.insert_text(&text, 5, "!").unwrap();

    exchange(&mut alice, &mut bob);
    assert_eq!(json_of(&alice, &text), json!("hello world!"));
    assert_eq!(json_of(&bob, &text), json!("hello world!"));
}

// ─────────────────────────────────────────────────────────────────────────────
// Property tests
// ─────────────────────────────────────────────────────────────────────────────

fn apply_map_edits(
    fixture: &TestFixture,
    node: &mut LocalNode,
    map: &RawCoId,
    edits: &[(i64, MapEdit)],
) {
    for (advance, edit) in edits {
        fixture.advance(*advance);
        edit.apply(node, map).unwrap();
    }
}

fn apply_list_edits(node: &mut LocalNode, list: &RawCoId, edits: &[ListEdit]) {
    for edit in edits {
        edit.apply(node, list).unwrap();
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(24))]

    #[test]
    fn map_replicas_converge_in_any_delivery_order(
        alice_edits in map_edits(8),
        bob_edits in map_edits(8),
    ) {
        let fixture = TestFixture::new();
        let (mut alice, mut bob, map) = shared_map(&fixture);
        apply_map_edits(&fixture, &mut alice, &map, &alice_edits);
        apply_map_edits(&fixture, &mut bob, &map, &bob_edits);

        let mut carol = fixture.local_node();
        replicate(&alice, &mut carol);
        replicate(&bob, &mut carol);

        let mut dave = fixture.local_node();
        replicate(&bob, &mut dave);
        replicate(&alice, &mut dave);

        exchange(&mut alice, &mut bob);

        let expected = json_of(&alice, &map);
        prop_assert_eq!(&json_of(&bob, &map), &expected);
        prop_assert_eq!(&json_of(&carol, &map), &expected);
        prop_assert_eq!(&json_of(&dave, &map), &expected);
    }

    #[test]
    fn list_replicas_converge_in_any_delivery_order(
        alice_edits in list_edits(6),
        bob_edits in list_edits(6),
    ) {
        let fixture = TestFixture::new();
        let (mut alice, mut bob, list) = two_writers(&fixture, |node, group| {
            node.create_list(CreateOptions::owned_by(group), vec![json!(0), json!(1)])
                .unwrap()
        });
        apply_list_edits(&mut alice, &list, &alice_edits);
        fixture.advance(1);
        apply_list_edits(&mut bob, &list, &bob_edits);

        let mut carol = fixture.local_node();
        replicate(&bob, &mut carol);
        replicate(&alice, &mut carol);

        exchange(&mut alice, &mut bob);

        let expected = json_of(&alice, &list);
        prop_assert_eq!(&json_of(&bob, &list), &expected);
        prop_assert_eq!(&json_of(&carol, &list), &expected);
    }
}
