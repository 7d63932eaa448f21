/// Events and the administrative service.
/// Run with: cargo test --test admin_tests
use ibase::{
    AdminService, BackupOptions, Connection, ConnectionConfig, DbInfoAction, EventNames,
    FetchFlags, MaintenanceAction, MemoryDriver, ServerInfoAction, ServiceReply, UserSpec,
};
use std::cell::RefCell;
use std::rc::Rc;
use tempfile::TempDir;

#[test]
fn test_event_subscription_double_free() {
    let driver = MemoryDriver::with_database("employee.fdb").into_shared();
    let conn = Connection::open(driver.clone(), ConnectionConfig::default()).unwrap();

    let hits = Rc::new(RefCell::new(0));
    let counter = Rc::clone(&hits);
    let names = EventNames::new(["NEW_ORDER"]).unwrap();
    let mut sub = conn
        .set_event_handler(&names, move |_| {
            *counter.borrow_mut() += 1;
            true
        })
        .unwrap();

    driver.borrow_mut().post_event("employee.fdb", "NEW_ORDER");
    sub.free().unwrap();
    sub.free().unwrap();
    driver.borrow_mut().post_event("employee.fdb", "NEW_ORDER");

    assert_eq!(*hits.borrow(), 1);
}

#[test]
fn test_too_many_event_names() {
    let names: Vec<String> = (0..16).map(|i| format!("EVENT_{}", i)).collect();
    assert!(EventNames::try_from(names).unwrap_err().is_usage());
}

#[test]
fn test_user_management() {
    let driver = MemoryDriver::with_database("employee.fdb").into_shared();
    let service = AdminService::attach(driver.clone(), "localhost", "SYSDBA", "masterkey").unwrap();

    let reply = service
        .add_user(&UserSpec::new("alice", "secret").first_name("Alice"))
        .unwrap();
    assert_eq!(reply, ServiceReply::Done(true));
    assert!(service.add_user(&UserSpec::new("ALICE", "again")).unwrap_err().is_driver());

    assert!(Connection::open_target(driver.clone(), "employee.fdb", "alice", "secret").is_ok());

    service.modify_user(&UserSpec::new("alice", "changed")).unwrap();
    assert!(Connection::open_target(driver.clone(), "employee.fdb", "alice", "secret").is_err());

    let users = service.server_info(ServerInfoAction::Users).unwrap();
    assert_eq!(users.lines(), ["ALICE".to_string(), "SYSDBA".to_string()]);

    service.delete_user("alice").unwrap();
    assert!(service.delete_user("alice").is_err());
}

#[test]
fn test_backup_restore_round_trip() {
    let driver = MemoryDriver::with_database("employee.fdb").into_shared();
    let mut conn = Connection::open(driver.clone(), ConnectionConfig::default()).unwrap();
    conn.query("CREATE TABLE notes (id INTEGER, body BLOB)").unwrap();
    conn.query("INSERT INTO notes VALUES (1, 'first note')").unwrap();
    conn.query("CREATE SEQUENCE GEN_NOTES").unwrap();
    conn.gen_id("GEN_NOTES", 5).unwrap();

    let dir = TempDir::new().unwrap();
    let file = dir.path().join("employee.fbk");
    let file = file.to_str().unwrap();

    let service = AdminService::attach(driver.clone(), "localhost", "SYSDBA", "masterkey").unwrap();
    let reply = service
        .backup("employee.fdb", file, BackupOptions::empty(), true)
        .unwrap();
    assert!(reply.lines().iter().any(|l| l.contains("NOTES")));

    service
        .restore(file, "copy.fdb", BackupOptions::CREATE, false)
        .unwrap();
    assert!(service.restore(file, "copy.fdb", BackupOptions::CREATE, false).is_err());

    let mut copy = Connection::open_target(driver.clone(), "copy.fdb", "SYSDBA", "masterkey").unwrap();
    let mut rs = copy
        .query("SELECT body FROM notes")
        .unwrap()
        .into_result_set()
        .unwrap();
    let row = rs.fetch_assoc(FetchFlags::TEXT_BLOBS).unwrap().unwrap();
    assert_eq!(row["BODY"].as_bytes(), Some(&b"first note"[..]));
    assert_eq!(copy.gen_id("GEN_NOTES", 1).unwrap(), 6);
}

#[test]
fn test_maintenance_and_info() {
    let driver = MemoryDriver::with_database("employee.fdb").into_shared();
    let service = AdminService::attach(driver.clone(), "localhost", "SYSDBA", "masterkey").unwrap();

    service
        .maintain_db("employee.fdb", MaintenanceAction::ReadOnly, 0)
        .unwrap();
    let mut conn = Connection::open(driver.clone(), ConnectionConfig::default()).unwrap();
    assert!(conn.query("CREATE TABLE t (id INTEGER)").unwrap_err().is_driver());

    service
        .maintain_db("employee.fdb", MaintenanceAction::ReadWrite, 0)
        .unwrap();
    conn.query("CREATE TABLE t (id INTEGER)").unwrap();

    let tables = service.db_info("employee.fdb", DbInfoAction::Tables, 0).unwrap();
    assert_eq!(tables.lines(), ["T (0 records)".to_string()]);

    let version = service.server_info(ServerInfoAction::Version).unwrap();
    assert!(version.as_text().unwrap().starts_with("ibase-memory"));
}

#[test]
fn test_detached_service_is_unusable() {
    let driver = MemoryDriver::with_database("employee.fdb").into_shared();
    let mut service = AdminService::attach(driver, "localhost", "SYSDBA", "masterkey").unwrap();

    service.detach().unwrap();
    service.detach().unwrap();
    assert!(!service.is_attached());
    assert!(service.server_info(ServerInfoAction::Version).unwrap_err().is_usage());
}
