//! Service manager calls: user administration, backup/restore, database
//! maintenance and server information.

use super::storage::{BackupImage, Database};
use super::users::ADMIN_USER;
use super::{MemoryDriver, codes};
use crate::core::{
    BackupOptions, DbInfoAction, DriverError, DriverResult, MaintenanceAction, ServerInfoAction,
    ServiceReply, UserSpec,
};
use crate::driver::ServiceHandle;
use chrono::Utc;
use log::{debug, info, warn};
use std::fs;
use std::io::{BufWriter, Write};
use std::path::Path;
use tempfile::NamedTempFile;

impl MemoryDriver {
    pub(super) fn attach_service(&mut self, host: &str, user: &str, password: &str) -> DriverResult<ServiceHandle> {
        self.check_failpoint(super::Failpoint::Service)?;
        if !self.users.authenticate(user, password) {
            return Err(DriverError::new(
                codes::LOGIN,
                "Your user name and password are not defined. Ask your database administrator to set up a login.",
            ));
        }
        if !user.eq_ignore_ascii_case(ADMIN_USER) {
            return Err(DriverError::new(
                codes::NO_PRIV,
                format!("no permission for service manager access by {}", user.to_uppercase()),
            ));
        }

        let handle = ServiceHandle(self.next_handle());
        self.services.insert(handle, host.to_string());
        info!("{} attached to service manager on {}", handle, host);
        Ok(handle)
    }

    pub(super) fn detach_service(&mut self, service: ServiceHandle) -> DriverResult<()> {
        self.services
            .remove(&service)
            .map(|_| ())
            .ok_or_else(|| bad_svc_handle(service))
    }

    pub(super) fn service_user_add(&mut self, service: ServiceHandle, user: &UserSpec) -> DriverResult<ServiceReply> {
        self.check_service(service)?;
        self.users.add(user)?;
        info!("added user {}", user.user_name.to_uppercase());
        Ok(ServiceReply::Done(true))
    }

    pub(super) fn service_user_modify(&mut self, service: ServiceHandle, user: &UserSpec) -> DriverResult<ServiceReply> {
        self.check_service(service)?;
        self.users.modify(user)?;
        info!("modified user {}", user.user_name.to_uppercase());
        Ok(ServiceReply::Done(true))
    }

    pub(super) fn service_user_delete(&mut self, service: ServiceHandle, user_name: &str) -> DriverResult<ServiceReply> {
        self.check_service(service)?;
        self.users.delete(user_name)?;
        info!("deleted user {}", user_name.to_uppercase());
        Ok(ServiceReply::Done(true))
    }

    pub(super) fn service_backup(
        &mut self,
        service: ServiceHandle,
        source_db: &str,
        dest_file: &str,
        options: BackupOptions,
        verbose: bool,
    ) -> DriverResult<ServiceReply> {
        self.check_service(service)?;
        let db = self.databases.get(source_db).ok_or_else(|| open_error(source_db))?;

        let database = if options.contains(BackupOptions::METADATA_ONLY) {
            db.metadata_only()
        } else {
            db.clone()
        };
        let mut log = vec![format!("gbak: readied database {} for backup", source_db)];
        let mut tables: Vec<_> = database.tables.values().collect();
        tables.sort_by(|a, b| a.name.cmp(&b.name));
        for table in tables {
            log.push(format!("gbak: writing table {}", table.name));
            log.push(format!("gbak:    {} records written", table.rows.len()));
        }
        log.push(format!("gbak: writing {} BLOB(s)", database.blobs.len()));

        let image = BackupImage {
            version: BackupImage::VERSION,
            source: source_db.to_string(),
            taken_at: Utc::now(),
            database,
        };
        let bytes = rmp_serde::to_vec(&image)
            .map_err(|e| DriverError::new(codes::IO_ERROR, format!("Failed to serialize backup: {}", e)))?;
        write_atomically(Path::new(dest_file), &bytes)?;

        log.push(format!(
            "gbak: closing file, committing, and finishing. {} bytes written",
            bytes.len()
        ));
        info!("backed up {} to {} ({} bytes)", source_db, dest_file, bytes.len());
        Ok(reply(verbose, log))
    }

    pub(super) fn service_restore(
        &mut self,
        service: ServiceHandle,
        source_file: &str,
        dest_db: &str,
        options: BackupOptions,
        verbose: bool,
    ) -> DriverResult<ServiceReply> {
        self.check_service(service)?;

        let data = fs::read(source_file).map_err(|e| {
            DriverError::new(
                codes::IO_ERROR,
                format!("I/O error during \"open\" operation for file \"{}\"\n{}", source_file, e),
            )
        })?;
        let image: BackupImage = rmp_serde::from_slice(&data)
            .map_err(|e| DriverError::new(codes::IO_ERROR, format!("expected backup file format: {}", e)))?;
        if image.version != BackupImage::VERSION {
            return Err(DriverError::new(
                codes::IO_ERROR,
                format!("unsupported backup version {}", image.version),
            ));
        }

        if self.databases.contains_key(dest_db) {
            if !options.contains(BackupOptions::REPLACE) {
                return Err(DriverError::new(
                    codes::IO_ERROR,
                    format!("database {} already exists. To replace it, use the -REP switch", dest_db),
                ));
            }
            if self.sessions.values().any(|s| s.database == dest_db && !s.idle) {
                return Err(DriverError::new(
                    codes::OBJECT_IN_USE,
                    format!("lock time-out on wait transaction\nobject {} is in use", dest_db),
                ));
            }
            self.sessions.retain(|_, s| s.database != dest_db);
            warn!("replacing database {}", dest_db);
        }

        let mut database: Database = image.database;
        database.online = true;
        database.read_only = false;

        let mut log = vec![format!("gbak: opened file {}", source_file)];
        let mut tables: Vec<_> = database.tables.values().collect();
        tables.sort_by(|a, b| a.name.cmp(&b.name));
        for table in tables {
            log.push(format!("gbak: restoring table {}", table.name));
            log.push(format!("gbak:    {} records restored", table.rows.len()));
        }
        log.push("gbak: finishing, closing, and going home".to_string());

        self.databases.insert(dest_db.to_string(), database);
        info!("restored {} from {} (taken {})", dest_db, source_file, image.taken_at);
        Ok(reply(verbose, log))
    }

    pub(super) fn service_maintain(
        &mut self,
        service: ServiceHandle,
        db: &str,
        action: MaintenanceAction,
        argument: i64,
    ) -> DriverResult<ServiceReply> {
        self.check_service(service)?;
        let database = self.databases.get_mut(db).ok_or_else(|| open_error(db))?;

        match action {
            MaintenanceAction::Sweep => {}
            MaintenanceAction::Shutdown => database.online = false,
            MaintenanceAction::Online => database.online = true,
            MaintenanceAction::SetSweepInterval => {
                if argument < 0 {
                    return Err(DriverError::new(
                        codes::NOT_VALID,
                        format!("invalid sweep interval {}", argument),
                    ));
                }
                database.sweep_interval = argument;
            }
            MaintenanceAction::ReadOnly => database.read_only = true,
            MaintenanceAction::ReadWrite => database.read_only = false,
        }
        debug!("{:?} applied to {}", action, db);
        Ok(ServiceReply::Done(true))
    }

    pub(super) fn service_db_info(
        &mut self,
        service: ServiceHandle,
        db: &str,
        action: DbInfoAction,
        _argument: i64,
    ) -> DriverResult<ServiceReply> {
        self.check_service(service)?;
        let database = self.databases.get(db).ok_or_else(|| open_error(db))?;

        let lines = match action {
            DbInfoAction::Statistics => {
                let attachments = self
                    .sessions
                    .values()
                    .filter(|s| s.database == db && !s.idle)
                    .count();
                vec![
                    format!("Database \"{}\"", db),
                    format!("Created {}", database.created.format("%Y-%m-%d %H:%M:%S")),
                    format!("Attachments {}", attachments),
                    format!("Tables {}", database.tables.len()),
                    format!("Records {}", database.row_count()),
                    format!("Generators {}", database.generators.len()),
                    format!("BLOBs {}", database.blobs.len()),
                    format!("Sweep interval {}", database.sweep_interval),
                    format!("Attributes {}", attributes(database)),
                ]
            }
            DbInfoAction::Tables => {
                let mut tables: Vec<_> = database
                    .tables
                    .values()
                    .map(|t| format!("{} ({} records)", t.name, t.rows.len()))
                    .collect();
                tables.sort();
                tables
            }
        };
        Ok(ServiceReply::Lines(lines))
    }

    pub(super) fn service_server_info(&mut self, service: ServiceHandle, action: ServerInfoAction) -> DriverResult<ServiceReply> {
        self.check_service(service)?;
        Ok(match action {
            ServerInfoAction::Version => {
                ServiceReply::Text(format!("ibase-memory {}", env!("CARGO_PKG_VERSION")))
            }
            ServerInfoAction::Implementation => ServiceReply::Text(format!(
                "ibase in-memory server on {}/{}",
                std::env::consts::OS,
                std::env::consts::ARCH
            )),
            ServerInfoAction::Users => ServiceReply::Lines(self.users.names()),
            ServerInfoAction::Databases => ServiceReply::Lines(self.databases.keys().cloned().collect()),
            ServerInfoAction::Uptime => {
                let uptime = Utc::now() - self.started;
                ServiceReply::Text(format!("{} seconds", uptime.num_seconds()))
            }
        })
    }

    fn check_service(&self, service: ServiceHandle) -> DriverResult<()> {
        if self.services.contains_key(&service) {
            Ok(())
        } else {
            Err(bad_svc_handle(service))
        }
    }
}

fn reply(verbose: bool, log: Vec<String>) -> ServiceReply {
    if verbose {
        ServiceReply::Lines(log)
    } else {
        ServiceReply::Done(true)
    }
}

fn attributes(db: &Database) -> String {
    let mut attrs = Vec::new();
    if db.read_only {
        attrs.push("read only");
    }
    if !db.online {
        attrs.push("shutdown");
    }
    if attrs.is_empty() {
        "normal".to_string()
    } else {
        attrs.join(", ")
    }
}

/// Writes to a temp file in the target directory, then renames it over the target.
fn write_atomically(path: &Path, bytes: &[u8]) -> DriverResult<()> {
    let io = |what: &str, e: std::io::Error| {
        DriverError::new(
            codes::IO_ERROR,
            format!("I/O error during \"{}\" operation for file \"{}\"\n{}", what, path.display(), e),
        )
    };

    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    let mut temp = NamedTempFile::new_in(dir).map_err(|e| io("create", e))?;
    {
        let mut writer = BufWriter::new(temp.as_file_mut());
        writer.write_all(bytes).map_err(|e| io("write", e))?;
        writer.flush().map_err(|e| io("write", e))?;
    }
    temp.persist(path).map_err(|e| io("rename", e.error))?;
    Ok(())
}

fn open_error(db: &str) -> DriverError {
    DriverError::new(
        codes::IO_ERROR,
        format!("I/O error during \"open\" operation for file \"{}\"\nError while trying to open file", db),
    )
}

fn bad_svc_handle(handle: ServiceHandle) -> DriverError {
    DriverError::new(codes::BAD_SVC_HANDLE, format!("invalid service handle {}", handle))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::memory::ADMIN_PASSWORD;
    use crate::driver::{Driver, Resource};
    use crate::connection::ConnectionConfig;
    use tempfile::TempDir;

    fn attached() -> (MemoryDriver, ServiceHandle) {
        let mut driver = MemoryDriver::with_database("employee.fdb");
        let svc = driver.service_attach("localhost", "sysdba", ADMIN_PASSWORD).unwrap();
        (driver, svc)
    }

    #[test]
    fn test_only_admin_may_attach() {
        let (mut driver, svc) = attached();
        driver.add_user(svc, &UserSpec::new("clerk", "pw")).unwrap();

        let err = driver.service_attach("localhost", "clerk", "pw").unwrap_err();
        assert_eq!(err.code, Some(codes::NO_PRIV));
    }

    #[test]
    fn test_backup_restore_metadata_only() {
        let (mut driver, svc) = attached();
        let config = ConnectionConfig::new("employee.fdb").credentials(ADMIN_USER, ADMIN_PASSWORD);
        let session = driver.connect(&config).unwrap();
        driver
            .query(Resource::Session(session), "CREATE TABLE t (id INTEGER)", &[])
            .unwrap();
        driver
            .query(Resource::Session(session), "INSERT INTO t VALUES (1)", &[])
            .unwrap();

        let dir = TempDir::new().unwrap();
        let file = dir.path().join("schema.fbk");
        let file = file.to_str().unwrap();
        driver
            .backup(svc, "employee.fdb", file, BackupOptions::METADATA_ONLY, false)
            .unwrap();
        driver
            .restore(svc, file, "schema.fdb", BackupOptions::CREATE, false)
            .unwrap();

        let restored = &driver.databases["schema.fdb"];
        assert!(restored.tables.contains_key("T"));
        assert_eq!(restored.row_count(), 0);
    }

    #[test]
    fn test_restore_in_use_database_refused() {
        let (mut driver, svc) = attached();
        let dir = TempDir::new().unwrap();
        let file = dir.path().join("e.fbk");
        let file = file.to_str().unwrap();
        driver.backup(svc, "employee.fdb", file, BackupOptions::empty(), false).unwrap();

        let config = ConnectionConfig::new("employee.fdb").credentials(ADMIN_USER, ADMIN_PASSWORD);
        driver.connect(&config).unwrap();

        let err = driver
            .restore(svc, file, "employee.fdb", BackupOptions::REPLACE, false)
            .unwrap_err();
        assert_eq!(err.code, Some(codes::OBJECT_IN_USE));
    }

    #[test]
    fn test_shutdown_blocks_attach() {
        let (mut driver, svc) = attached();
        driver.maintain_db(svc, "employee.fdb", MaintenanceAction::Shutdown, 0).unwrap();

        let config = ConnectionConfig::new("employee.fdb").credentials(ADMIN_USER, ADMIN_PASSWORD);
        assert_eq!(driver.connect(&config).unwrap_err().code, Some(codes::SHUTDOWN));

        driver.maintain_db(svc, "employee.fdb", MaintenanceAction::Online, 0).unwrap();
        assert!(driver.connect(&config).is_ok());
    }

    #[test]
    fn test_db_info_statistics() {
        let (mut driver, svc) = attached();
        driver.maintain_db(svc, "employee.fdb", MaintenanceAction::SetSweepInterval, 500).unwrap();
        driver.maintain_db(svc, "employee.fdb", MaintenanceAction::ReadOnly, 0).unwrap();

        let reply = driver.db_info(svc, "employee.fdb", DbInfoAction::Statistics, 0).unwrap();
        assert!(reply.lines().contains(&"Sweep interval 500".to_string()));
        assert!(reply.lines().contains(&"Attributes read only".to_string()));
        assert!(driver.db_info(svc, "missing.fdb", DbInfoAction::Tables, 0).is_err());
    }

    #[test]
    fn test_detached_service_rejected() {
        let (mut driver, svc) = attached();
        driver.service_detach(svc).unwrap();
        let err = driver.server_info(svc, ServerInfoAction::Version).unwrap_err();
        assert_eq!(err.code, Some(codes::BAD_SVC_HANDLE));
    }
}
