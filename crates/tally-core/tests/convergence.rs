//! Cross-replica convergence tests.
//!
//! Any two documents that have applied the same set of ops — in any order,
//! any number of times — must reach identical logical state.

use std::collections::BTreeMap;

use chrono::NaiveDate;
use tally_core::doc::{Change, Document};
use tally_core::model::entity::{Expense, Person};
use tally_core::model::id::{AccountId, DeviceId, EntityId};
use tally_core::model::money::{Money, SplitMode};
use tally_core::op::{EntityKind, FieldMap, Op};

fn aid() -> AccountId {
    AccountId::new_unchecked("000000000000000000000000000000aa")
}

fn dev(code: &str) -> DeviceId {
    DeviceId::new_unchecked(code)
}

fn eid(n: u8) -> EntityId {
    EntityId::new_unchecked(&format!("{n:032x}"))
}

fn person(n: u8, name: &str) -> Person {
    Person {
        id: eid(n),
        name: name.to_string(),
        claimed_by: None,
        created_at_us: 1,
        extra: BTreeMap::new(),
    }
}

fn expense(n: u8, payer: u8, minor: i64) -> Expense {
    Expense {
        id: eid(n),
        amount: Money::from_minor(minor),
        date: NaiveDate::from_ymd_opt(2026, 8, 1).expect("valid date"),
        payer: eid(payer),
        split: SplitMode::Equal,
        shares: None,
        tag: None,
        notes: None,
        image: None,
        created_at_us: 1,
        extra: BTreeMap::new(),
    }
}

fn insert_person(doc: &mut Document, n: u8, name: &str) -> Op {
    let p = person(n, name);
    doc.commit(
        Change::insert(EntityKind::Person, p.id.clone(), &p).expect("serialize person"),
        1,
    )
}

fn insert_expense(doc: &mut Document, n: u8, payer: u8, minor: i64) -> Op {
    let e = expense(n, payer, minor);
    doc.commit(
        Change::insert(EntityKind::Expense, e.id.clone(), &e).expect("serialize expense"),
        1,
    )
}

fn notes_update(doc: &mut Document, n: u8, notes: &str) -> Op {
    let mut fields = FieldMap::new();
    fields.insert("notes".to_string(), serde_json::Value::String(notes.to_string()));
    doc.commit(
        Change::Update {
            entity: EntityKind::Expense,
            id: eid(n),
            fields,
        },
        2,
    )
}

fn apply_all(device: &str, ops: &[&Op]) -> Document {
    let mut doc = Document::new(aid(), dev(device));
    for op in ops {
        doc.apply(op);
    }
    doc
}

#[test]
fn host_state_replicates_to_joiner() {
    // Device A (host) creates Alice and a 30.00 expense she paid.
    let mut a = Document::new(aid(), dev("A2B3C4"));
    insert_person(&mut a, 1, "Alice");
    insert_expense(&mut a, 10, 1, 3000);

    // Device B joins empty and pulls the full delta.
    let mut b = Document::new(aid(), dev("X2Y3Z4"));
    for op in a.ops_since(b.state_vector()) {
        b.apply(&op);
    }

    assert_eq!(b.people().len(), 1);
    assert_eq!(b.people()[0].name, "Alice");
    assert_eq!(b.expenses().len(), 1);
    assert_eq!(b.expenses()[0].amount, Money::from_minor(3000));
    assert_eq!(a, b);
}

#[test]
fn concurrent_delete_and_edit_resolve_to_deleted() {
    // Shared baseline: expense e1 on both devices.
    let mut a = Document::new(aid(), dev("A2B3C4"));
    insert_person(&mut a, 1, "Alice");
    insert_expense(&mut a, 10, 1, 3000);

    let mut b = Document::new(aid(), dev("X2Y3Z4"));
    for op in a.ops_since(b.state_vector()) {
        b.apply(&op);
    }

    // Disconnected: A deletes e1, B edits its notes.
    let remove = a.commit(
        Change::Remove {
            entity: EntityKind::Expense,
            id: eid(10),
        },
        3,
    );
    let edit = notes_update(&mut b, 10, "brunch actually");

    // Reconnect, both directions.
    a.apply(&edit);
    b.apply(&remove);

    assert!(a.expense(&eid(10)).is_none(), "tombstone wins on A");
    assert!(b.expense(&eid(10)).is_none(), "tombstone wins on B");
    assert_eq!(a, b);
}

#[test]
fn merge_order_across_peers_does_not_matter() {
    // Three devices generate ops independently.
    let mut a = Document::new(aid(), dev("A2B3C4"));
    let mut b = Document::new(aid(), dev("X2Y3Z4"));
    let mut c = Document::new(aid(), dev("Q2R3S4"));

    let op1 = insert_person(&mut a, 1, "Alice");
    let op2 = insert_person(&mut b, 2, "Bob");
    let op3 = insert_expense(&mut c, 10, 1, 999);
    let op4 = notes_update(&mut a, 10, "late edit");
    let op5 = b.commit(
        Change::Remove {
            entity: EntityKind::Person,
            id: eid(2),
        },
        4,
    );

    let ops = [&op1, &op2, &op3, &op4, &op5];

    // A handful of distinct arrival orders, including update-before-insert
    // and remove-before-insert interleavings.
    let orders: [[usize; 5]; 6] = [
        [0, 1, 2, 3, 4],
        [4, 3, 2, 1, 0],
        [3, 2, 0, 4, 1],
        [2, 3, 4, 0, 1],
        [1, 4, 0, 2, 3],
        [3, 4, 1, 0, 2],
    ];

    let reference = apply_all("D2E3F4", &ops);
    for order in orders {
        let picked: Vec<&Op> = order.iter().map(|i| ops[*i]).collect();
        let replica = apply_all("E2F3G4", &picked);
        assert_eq!(replica, reference, "order {order:?} diverged");
    }
}

#[test]
fn partitioned_merge_is_commutative() {
    // Merging {a, b} then {c} equals {c} then {a, b}.
    let mut origin = Document::new(aid(), dev("A2B3C4"));
    let op_a = insert_person(&mut origin, 1, "Alice");
    let op_b = insert_expense(&mut origin, 10, 1, 1500);
    let op_c = notes_update(&mut origin, 10, "taxi");

    let forward = apply_all("X2Y3Z4", &[&op_a, &op_b, &op_c]);
    let backward = apply_all("Y2Z3A4", &[&op_c, &op_a, &op_b]);
    assert_eq!(forward, backward);
}

#[test]
fn replaying_everything_twice_changes_nothing() {
    let mut origin = Document::new(aid(), dev("A2B3C4"));
    insert_person(&mut origin, 1, "Alice");
    insert_expense(&mut origin, 10, 1, 4200);
    origin.commit(
        Change::Remove {
            entity: EntityKind::Expense,
            id: eid(10),
        },
        5,
    );

    let ops = origin.log_ops();
    let mut replica = Document::new(aid(), dev("X2Y3Z4"));
    for op in &ops {
        replica.apply(op);
    }
    let once = replica.log_len();
    for op in &ops {
        replica.apply(op);
    }
    assert_eq!(replica.log_len(), once);
    assert_eq!(replica, origin);
}

#[test]
fn transitive_gossip_converges() {
    // A and C never talk directly; B relays.
    let mut a = Document::new(aid(), dev("A2B3C4"));
    let mut b = Document::new(aid(), dev("X2Y3Z4"));
    let mut c = Document::new(aid(), dev("Q2R3S4"));

    insert_person(&mut a, 1, "Alice");
    insert_person(&mut c, 2, "Carol");

    // A -> B
    for op in a.ops_since(b.state_vector()) {
        b.apply(&op);
    }
    // C -> B
    for op in c.ops_since(b.state_vector()) {
        b.apply(&op);
    }
    // B -> A and B -> C
    for op in b.ops_since(a.state_vector()) {
        a.apply(&op);
    }
    for op in b.ops_since(c.state_vector()) {
        c.apply(&op);
    }

    assert_eq!(a, b);
    assert_eq!(b, c);
}
