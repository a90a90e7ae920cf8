//! Permission tests: roles are checked at the `madeAt` of each write,
//! on every replica, whatever order transactions arrive in.

use cojson::perms::{MemberKey, Role};
use cojson::{CreateOptions, LocalNode, RawCoId};
use cojson_testkit::fixtures::{exchange, replicate, replicate_one, TestFixture};
use serde_json::{json, Value};

fn map_json(node: &LocalNode, map: &RawCoId) -> Value {
    node.content(map).unwrap().to_json()
}

/// Alice's group and an empty map it owns, with Bob's account known to Alice.
fn shared_map(fixture: &TestFixture) -> (LocalNode, LocalNode, RawCoId, RawCoId) {
    let mut alice = fixture.local_node();
    let bob = fixture.local_node();
    replicate(&bob, &mut alice);

    let group = alice.create_group().unwrap();
    let map = alice
        .create_map(CreateOptions::owned_by(group), Vec::new())
        .unwrap();
    fixture.advance(10);
    (alice, bob, group, map)
}

#[test]
fn test_revoked_writer_edits_are_ignored_everywhere() {
    let fixture = TestFixture::new();
    let (mut alice, mut bob, group, map) = shared_map(&fixture);
    let bob_member = MemberKey::Actor(bob.actor());

    alice.add_member(&group, bob_member, Role::Writer).unwrap();
    replicate_one(&alice, &mut bob, &map);
    fixture.advance(10);

    bob.set(&map, "x", json!(1)).unwrap();
    replicate_one(&bob, &mut alice, &map);
    assert_eq!(map_json(&alice, &map), json!({"x": 1}));
    fixture.advance(10);

    alice.remove_member(&group, bob_member).unwrap();
    fixture.advance(10);

    // Bob has not heard of the revocation yet.
    bob.set(&map, "x", json!(2)).unwrap();
    assert_eq!(map_json(&bob, &map), json!({"x": 2}));

    exchange(&mut alice, &mut bob);
    assert_eq!(map_json(&alice, &map), json!({"x": 1}));
    assert_eq!(map_json(&bob, &map), json!({"x": 1}));
}

#[test]
fn test_revoked_member_cannot_read_new_writes() {
    let fixture = TestFixture::new();
    let (mut alice, mut bob, group, map) = shared_map(&fixture);
    let bob_member = MemberKey::Actor(bob.actor());

    alice.add_member(&group, bob_member, Role::Reader).unwrap();
    fixture.advance(10);
    alice.set(&map, "before", json!("visible")).unwrap();
    replicate_one(&alice, &mut bob, &map);
    assert_eq!(map_json(&bob, &map), json!({"before": "visible"}));

    fixture.advance(10);
    alice.remove_member(&group, bob_member).unwrap();
    fixture.advance(10);
    alice.set(&map, "after", json!("secret")).unwrap();
    replicate_one(&alice, &mut bob, &map);

    assert_eq!(map_json(&bob, &map), json!({"before": "visible"}));
    assert_eq!(
        map_json(&alice, &map),
        json!({"before": "visible", "after": "secret"})
    );
}

#[test]
fn test_demoting_a_writer_rotates_the_read_key() {
    let fixture = TestFixture::new();
    let (mut alice, mut bob, group, map) = shared_map(&fixture);
    let bob_member = MemberKey::Actor(bob.actor());

    alice.add_member(&group, bob_member, Role::Writer).unwrap();
    let before = alice.group(&group).unwrap().read_key_id();
    fixture.advance(10);

    alice.add_member(&group, bob_member, Role::Reader).unwrap();
    let after = alice.group(&group).unwrap().read_key_id();
    assert!(before.is_some());
    assert_ne!(before, after);

    // Bob still reads under the new key, but may no longer write.
    fixture.advance(10);
    alice.set(&map, "k", json!("rotated")).unwrap();
    replicate_one(&alice, &mut bob, &map);
    assert_eq!(map_json(&bob, &map), json!({"k": "rotated"}));
    assert!(bob.set(&map, "k", json!("mine")).is_err());
}

#[test]
fn test_upgrading_a_reader_keeps_the_read_key() {
    let fixture = TestFixture::new();
    let (mut alice, bob, group, _map) = shared_map(&fixture);
    let bob_member = MemberKey::Actor(bob.actor());

    alice.add_member(&group, bob_member, Role::Reader).unwrap();
    let before = alice.group(&group).unwrap().read_key_id();
    fixture.advance(10);
    alice.add_member(&group, bob_member, Role::Writer).unwrap();

    assert_eq!(alice.group(&group).unwrap().read_key_id(), before);
}

#[test]
fn test_reader_cannot_write() {
    let fixture = TestFixture::new();
    let (mut alice, mut bob, group, map) = shared_map(&fixture);

    alice
        .add_member(&group, MemberKey::Actor(bob.actor()), Role::Reader)
        .unwrap();
    replicate_one(&alice, &mut bob, &map);
    fixture.advance(10);

    assert!(bob.set(&map, "x", json!(1)).is_err());
    assert_eq!(map_json(&bob, &map), json!({}));
}

#[test]
fn test_writer_cannot_change_roles() {
    let fixture = TestFixture::new();
    let (mut alice, mut bob, group, map) = shared_map(&fixture);

    alice
        .add_member(&group, MemberKey::Actor(bob.actor()), Role::Writer)
        .unwrap();
    replicate_one(&alice, &mut bob, &map);
    fixture.advance(10);

    assert!(bob
        .add_member(&group, MemberKey::Everyone, Role::Reader)
        .is_err());
    assert_eq!(
        bob.group(&group).unwrap().explicit_role(&MemberKey::Everyone),
        None
    );
}

#[test]
fn test_everyone_writer_lets_strangers_write() {
    let fixture = TestFixture::new();
    let (mut alice, mut bob, group, map) = shared_map(&fixture);

    alice
        .add_member(&group, MemberKey::Everyone, Role::Writer)
        .unwrap();
    replicate_one(&alice, &mut bob, &map);
    fixture.advance(10);

    bob.set(&map, "from", json!("bob")).unwrap();
    replicate_one(&bob, &mut alice, &map);
    assert_eq!(map_json(&alice, &map), json!({"from": "bob"}));
}

// ─────────────────────────────────────────────────────────────────────────────
// Invites
// ─────────────────────────────────────────────────────────────────────────────

#[test]
fn test_writer_invite_admits_one_member() {
    let fixture = TestFixture::new();
    let mut alice = fixture.local_node();
    let mut carol = fixture.local_node();
    let mut dave = fixture.local_node();

    let group = alice.create_group().unwrap();
    let map = alice
        .create_map(CreateOptions::owned_by(group), Vec::new())
        .unwrap();
    fixture.advance(10);
    let secret = alice.create_invite(&group, Role::Writer).unwrap();
    fixture.advance(10);

    replicate_one(&alice, &mut carol, &map);
    carol.accept_invite(&group, &secret).unwrap();
    assert_eq!(
        carol
            .group(&group)
            .unwrap()
            .explicit_role(&MemberKey::Actor(carol.actor())),
        Some(Role::Writer)
    );
    fixture.advance(10);

    carol.set(&map, "by", json!("carol")).unwrap();
    replicate(&carol, &mut alice);
    assert_eq!(map_json(&alice, &map), json!({"by": "carol"}));

    // The invite is spent once Carol's acceptance is known.
    replicate(&alice, &mut dave);
    fixture.advance(10);
    assert!(dave.accept_invite(&group, &secret).is_err());
}

#[test]
fn test_reader_invite_cannot_write() {
    let fixture = TestFixture::new();
    let mut alice = fixture.local_node();
    let mut carol = fixture.local_node();

    let group = alice.create_group().unwrap();
    let map = alice
        .create_map(CreateOptions::owned_by(group), [("k".to_string(), json!(1))])
        .unwrap();
    fixture.advance(10);
    let secret = alice.create_invite(&group, Role::Reader).unwrap();
    fixture.advance(10);

    replicate_one(&alice, &mut carol, &map);
    carol.accept_invite(&group, &secret).unwrap();
    fixture.advance(10);

    assert_eq!(map_json(&carol, &map), json!({"k": 1}));
    assert!(carol.set(&map, "k", json!(2)).is_err());
}

#[test]
fn test_invites_cannot_grant_invite_roles_directly() {
    let fixture = TestFixture::new();
    let mut alice = fixture.local_node();
    let group = alice.create_group().unwrap();

    assert!(alice
        .add_member(&group, MemberKey::Everyone, Role::WriterInvite)
        .is_err());
}

// ─────────────────────────────────────────────────────────────────────────────
// Write-only members
// ─────────────────────────────────────────────────────────────────────────────

#[test]
fn test_write_only_member_writes_without_reading() {
    let fixture = TestFixture::new();
    let (mut alice, mut bob, group, map) = shared_map(&fixture);

    alice.set(&map, "admin", json!("note")).unwrap();
    alice
        .add_member(&group, MemberKey::Actor(bob.actor()), Role::WriteOnly)
        .unwrap();
    replicate_one(&alice, &mut bob, &map);
    fixture.advance(10);

    bob.set(&map, "drop", json!("box")).unwrap();
    assert_eq!(map_json(&bob, &map), json!({"drop": "box"}));

    replicate_one(&bob, &mut alice, &map);
    assert_eq!(
        map_json(&alice, &map),
        json!({"admin": "note", "drop": "box"})
    );
}

#[test]
fn test_write_only_invite() {
    let fixture = TestFixture::new();
    let mut alice = fixture.local_node();
    let mut carol = fixture.local_node();

    let group = alice.create_group().unwrap();
    let map = alice
        .create_map(CreateOptions::owned_by(group), [("hidden".to_string(), json!(true))])
        .unwrap();
    fixture.advance(10);
    let secret = alice.create_invite(&group, Role::WriteOnly).unwrap();
    fixture.advance(10);

    replicate_one(&alice, &mut carol, &map);
    carol.accept_invite(&group, &secret).unwrap();
    fixture.advance(10);

    carol.set(&map, "sent", json!(1)).unwrap();
    assert_eq!(map_json(&carol, &map), json!({"sent": 1}));

    replicate(&carol, &mut alice);
    assert_eq!(map_json(&alice, &map), json!({"hidden": true, "sent": 1}));
}
