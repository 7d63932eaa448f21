use crate::core::{
    BackupOptions, DbInfoAction, DriverResult, Error, MaintenanceAction, Result, ServerInfoAction,
    ServiceReply, UsageError, UserSpec,
};
use crate::driver::{Driver, ServiceHandle, SharedDriver};
use log::{debug, info, warn};

/// Administrative session with the service manager
///
/// Independent of any [`Connection`](crate::Connection). Every operation
/// passes straight through to the driver and returns its raw reply.
pub struct AdminService {
    driver: SharedDriver,
    handle: Option<ServiceHandle>,
    host: String,
}

impl AdminService {
    pub fn attach(driver: SharedDriver, host: &str, user: &str, password: &str) -> Result<Self> {
        let handle = driver.borrow_mut().service_attach(host, user, password)?;
        info!("attached to service manager on {} as {}", host, user);
        Ok(Self {
            driver,
            handle: Some(handle),
            host: host.to_string(),
        })
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn is_attached(&self) -> bool {
        self.handle.is_some()
    }

    fn call<T>(&self, f: impl FnOnce(&mut dyn Driver, ServiceHandle) -> DriverResult<T>) -> Result<T> {
        let handle = self
            .handle
            .ok_or(Error::Usage(UsageError::ConnectionClosed))?;
        let mut driver = self.driver.borrow_mut();
        f(&mut *driver, handle).map_err(Error::from)
    }

    /// Detach from the service manager. Detaching twice does nothing.
    pub fn detach(&mut self) -> Result<()> {
        let Some(handle) = self.handle else {
            return Ok(());
        };
        self.driver.borrow_mut().service_detach(handle)?;
        self.handle = None;
        debug!("detached {}", handle);
        Ok(())
    }

    pub fn add_user(&self, user: &UserSpec) -> Result<ServiceReply> {
        self.call(|d, svc| d.add_user(svc, user))
    }

    pub fn modify_user(&self, user: &UserSpec) -> Result<ServiceReply> {
        self.call(|d, svc| d.modify_user(svc, user))
    }

    pub fn delete_user(&self, user_name: &str) -> Result<ServiceReply> {
        self.call(|d, svc| d.delete_user(svc, user_name))
    }

    /// Back up `source_db` into `dest_file`
    pub fn backup(
        &self,
        source_db: &str,
        dest_file: &str,
        options: BackupOptions,
        verbose: bool,
    ) -> Result<ServiceReply> {
        info!("backing up {} to {}", source_db, dest_file);
        self.call(|d, svc| d.backup(svc, source_db, dest_file, options, verbose))
    }

    /// Restore `source_file` into `dest_db`
    pub fn restore(
        &self,
        source_file: &str,
        dest_db: &str,
        options: BackupOptions,
        verbose: bool,
    ) -> Result<ServiceReply> {
        info!("restoring {} into {}", source_file, dest_db);
        self.call(|d, svc| d.restore(svc, source_file, dest_db, options, verbose))
    }

    pub fn maintain_db(&self, db: &str, action: MaintenanceAction, argument: i64) -> Result<ServiceReply> {
        self.call(|d, svc| d.maintain_db(svc, db, action, argument))
    }

    pub fn db_info(&self, db: &str, action: DbInfoAction, argument: i64) -> Result<ServiceReply> {
        self.call(|d, svc| d.db_info(svc, db, action, argument))
    }

    pub fn server_info(&self, action: ServerInfoAction) -> Result<ServiceReply> {
        self.call(|d, svc| d.server_info(svc, action))
    }
}

impl Drop for AdminService {
    fn drop(&mut self) {
        if let Err(e) = self.detach() {
            warn!("detaching from service manager on {} failed: {}", self.host, e);
        }
    }
}
