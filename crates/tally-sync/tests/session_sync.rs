//! End-to-end session tests over the in-memory transport: pairing, sync,
//! policy, presence decay, asset transfer, and restart recovery.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::NaiveDate;
use tally_core::doc::Change;
use tally_core::error::SyncError;
use tally_core::migrate::{LegacyPerson, LegacyRecords};
use tally_core::model::entity::{Account, AccountMode, Expense, Person};
use tally_core::model::id::{AccountId, DeviceId, EntityId};
use tally_core::model::money::{Money, SplitMode};
use tally_core::op::EntityKind;
use tally_sync::config::SessionConfig;
use tally_sync::session::{Session, SessionParams};
use tally_sync::transport::memory::MemoryHub;
use tally_sync::transport::Signaling;

const HOST: &str = "H2H3H4";
const MEMBER: &str = "M2M3M4";

fn account_id() -> AccountId {
    AccountId::new_unchecked("5afe0000000000000000000000000001")
}

fn shared_account() -> Account {
    Account {
        id: account_id(),
        mode: AccountMode::Shared,
        currency: "EUR".to_string(),
        host_device: Some(DeviceId::new_unchecked(HOST)),
        name: "Trip".to_string(),
    }
}

fn eid(n: u8) -> EntityId {
    EntityId::new_unchecked(&format!("{n:032x}"))
}

fn open_session(
    hub: &Arc<MemoryHub>,
    device: &str,
    name: &str,
    store_path: Option<PathBuf>,
) -> Session {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
    Session::open(SessionParams {
        account: shared_account(),
        device: Some(DeviceId::new_unchecked(device)),
        store_path,
        signaling: Arc::<MemoryHub>::clone(hub) as Arc<dyn Signaling>,
        display_name: name.to_string(),
        display_color: "#3366ff".to_string(),
        config: SessionConfig::fast(),
        wall: None,
    })
    .expect("open session")
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

fn insert_person_change(n: u8, name: &str) -> Change {
    let p = person(n, name);
    Change::insert(EntityKind::Person, p.id.clone(), &p).expect("serialize person")
}

fn insert_expense_change(n: u8, payer: u8, minor: i64) -> Change {
    let e = expense(n, payer, minor);
    Change::insert(EntityKind::Expense, e.id.clone(), &e).expect("serialize expense")
}

/// Poll until `predicate` holds or the deadline passes.
fn wait_until(what: &str, predicate: impl Fn() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while Instant::now() < deadline {
        if predicate() {
            return;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
    panic!("timed out waiting for: {what}");
}

#[test]
fn joiner_pulls_host_state_and_policy_gates_writes() {
    let hub = Arc::new(MemoryHub::new());
    let host = open_session(&hub, HOST, "host phone", None);
    let member = open_session(&hub, MEMBER, "member phone", None);

    // Host (group creator) seeds Alice and a 30.00 expense.
    host.broadcast_local_change(insert_person_change(1, "Alice"))
        .expect("host adds person");
    host.broadcast_local_change(insert_expense_change(10, 1, 3000))
        .expect("host adds expense");

    member.connect_invite(&host.invite()).expect("join via invite");
    wait_until("member receives host state", || {
        member.with_document(|doc| doc.expenses().len() == 1 && doc.people().len() == 1)
    });
    member.with_document(|doc| {
        assert_eq!(doc.people()[0].name, "Alice");
        assert_eq!(doc.expenses()[0].amount, Money::from_minor(3000));
    });

    // Member may not manage participants...
    let err = member
        .broadcast_local_change(insert_person_change(2, "Bob"))
        .expect_err("member add-person must be rejected");
    assert!(matches!(err, SyncError::PolicyViolation(_)));

    // ...but may add expenses, which replicate back to the host.
    member
        .broadcast_local_change(insert_expense_change(11, 1, 450))
        .expect("member adds expense");
    wait_until("host receives member expense", || {
        host.with_document(|doc| doc.expenses().len() == 2)
    });

    member.close();
    host.close();
}

#[test]
fn concurrent_delete_and_edit_converge_to_deleted() {
    let hub = Arc::new(MemoryHub::new());
    let host = open_session(&hub, HOST, "host phone", None);
    let member = open_session(&hub, MEMBER, "member phone", None);

    host.broadcast_local_change(insert_person_change(1, "Alice"))
        .expect("add person");
    host.broadcast_local_change(insert_expense_change(10, 1, 3000))
        .expect("add expense");
    member.connect(host.device()).expect("connect");
    wait_until("baseline synced", || {
        member.with_document(|doc| doc.expenses().len() == 1)
    });

    // Partition.
    member.disconnect(host.device());
    wait_until("links torn down", || host.connected_peers().is_empty());

    // Host deletes the expense; member edits its notes, both offline.
    host.broadcast_local_change(Change::Remove {
        entity: EntityKind::Expense,
        id: eid(10),
    })
    .expect("host deletes expense");
    let mut fields = tally_core::op::FieldMap::new();
    fields.insert(
        "notes".to_string(),
        serde_json::Value::String("brunch actually".to_string()),
    );
    member
        .broadcast_local_change(Change::Update {
            entity: EntityKind::Expense,
            id: eid(10),
            fields,
        })
        .expect("member edits expense");

    // Reconnect; the handshake exchanges both deltas.
    member.connect(host.device()).expect("reconnect");
    wait_until("tombstone wins on both devices", || {
        let on_member = member.with_document(|doc| doc.expense(&eid(10)).is_none());
        let on_host = host.with_document(|doc| doc.expense(&eid(10)).is_none());
        on_member && on_host
    });
    assert!(member.with_document(|doc| doc.is_tombstoned(&eid(10))));
    assert!(host.with_document(|doc| doc.is_tombstoned(&eid(10))));

    member.close();
    host.close();
}

#[test]
fn presence_appears_and_decays_with_the_link() {
    let hub = Arc::new(MemoryHub::new());
    let host = open_session(&hub, HOST, "host phone", None);
    let member = open_session(&hub, MEMBER, "member phone", None);

    member.connect(host.device()).expect("connect");
    wait_until("host sees member presence", || {
        host.current_presence()
            .iter()
            .any(|entry| entry.state.device.as_str() == MEMBER)
    });
    wait_until("member sees host presence", || {
        member
            .current_presence()
            .iter()
            .any(|entry| entry.state.device.as_str() == HOST)
    });

    // Display identity updates propagate.
    member.set_presence("renamed phone", "#ff0000");
    wait_until("host sees renamed member", || {
        host.current_presence()
            .iter()
            .any(|entry| entry.state.name == "renamed phone")
    });

    // Closing the link decays the entry; presence has no history.
    member.disconnect(host.device());
    wait_until("member presence decays on host", || {
        !host
            .current_presence()
            .iter()
            .any(|entry| entry.state.device.as_str() == MEMBER)
    });

    member.close();
    host.close();
}

#[test]
fn image_fetch_is_byte_identical_and_bounded() {
    let hub = Arc::new(MemoryHub::new());
    let host = open_session(&hub, HOST, "host phone", None);
    let member = open_session(&hub, MEMBER, "member phone", None);
    member.connect(host.device()).expect("connect");

    let image_id = eid(42);
    let receipt: Vec<u8> = (0u8..=255).cycle().take(4096).collect();
    host.put_asset(&image_id, &receipt).expect("store receipt");

    let fetched = member.request_asset(&image_id).expect("fetch from peer");
    assert_eq!(fetched, receipt);
    // Second fetch is answered from the local cache.
    let cached = member.request_asset(&image_id).expect("cached");
    assert_eq!(cached, receipt);

    // A missing image resolves to unavailable within the timeout.
    let started = Instant::now();
    let err = member
        .request_asset(&eid(43))
        .expect_err("unknown image unavailable");
    assert!(matches!(err, SyncError::AssetUnavailable { .. }));
    assert!(started.elapsed() < Duration::from_secs(4), "must not hang");

    member.close();
    host.close();
}

#[test]
fn store_restores_state_before_any_peer_connects() {
    let dir = tempfile::tempdir().expect("temp dir");
    let path = dir.path().join("tally.sqlite3");
    let hub = Arc::new(MemoryHub::new());

    let session = open_session(&hub, HOST, "host phone", Some(path.clone()));
    session
        .broadcast_local_change(insert_person_change(1, "Alice"))
        .expect("add person");
    session
        .broadcast_local_change(insert_expense_change(10, 1, 777))
        .expect("add expense");
    session.flush().expect("flush");
    session.close();

    // Fresh process, same store: never empty-by-default.
    let restarted = open_session(&hub, HOST, "host phone", Some(path));
    restarted.with_document(|doc| {
        assert_eq!(doc.people().len(), 1);
        assert_eq!(doc.expenses().len(), 1);
        assert_eq!(doc.expenses()[0].amount, Money::from_minor(777));
    });
    restarted.close();
}

#[test]
fn legacy_migration_runs_once_per_device() {
    let dir = tempfile::tempdir().expect("temp dir");
    let path = dir.path().join("tally.sqlite3");
    let hub = Arc::new(MemoryHub::new());

    let records = LegacyRecords {
        people: vec![LegacyPerson {
            key: "alice".to_string(),
            name: "Alice".to_string(),
        }],
        expenses: vec![],
        payments: vec![],
    };

    let session = open_session(&hub, HOST, "host phone", Some(path.clone()));
    let report = session.migrate_legacy(&records).expect("migrate");
    assert_eq!(report.people, 1);
    assert!(!report.already_complete);

    // Same session, second call: marker short-circuits.
    let again = session.migrate_legacy(&records).expect("migrate again");
    assert!(again.already_complete);
    session.close();

    // New process, same store: marker persisted.
    let restarted = open_session(&hub, HOST, "host phone", Some(path));
    let after_restart = restarted.migrate_legacy(&records).expect("migrate after restart");
    assert!(after_restart.already_complete);
    restarted.with_document(|doc| assert_eq!(doc.people().len(), 1));
    restarted.close();
}

#[test]
fn device_code_collision_regenerates_transparently() {
    let hub = Arc::new(MemoryHub::new());
    let first = open_session(&hub, HOST, "first", None);

    // Second session asks for the same code; it must come up with a
    // different one rather than fail.
    let second = open_session(&hub, HOST, "second", None);
    assert_ne!(second.device(), first.device());

    second.close();
    first.close();
}

#[test]
fn single_mode_accounts_refuse_to_sync() {
    let hub = Arc::new(MemoryHub::new());
    let session = Session::open(SessionParams {
        account: Account {
            id: account_id(),
            mode: AccountMode::Single,
            currency: "EUR".to_string(),
            host_device: None,
            name: "Just me".to_string(),
        },
        device: Some(DeviceId::new_unchecked(HOST)),
        store_path: None,
        signaling: Arc::<MemoryHub>::clone(&hub) as Arc<dyn Signaling>,
        display_name: "solo".to_string(),
        display_color: "#000000".to_string(),
        config: SessionConfig::fast(),
        wall: None,
    })
    .expect("open session");

    let err = session
        .connect(&DeviceId::new_unchecked(MEMBER))
        .expect_err("single mode cannot connect");
    assert!(matches!(err, SyncError::PolicyViolation(_)));

    // But local writes work, including ones that would need host rights in
    // a shared group.
    session
        .broadcast_local_change(insert_person_change(1, "Me"))
        .expect("local write");
    session.close();
}
