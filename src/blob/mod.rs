use crate::connection::Link;
use crate::core::{BlobId, BlobInfo, Error, Result, UsageError};
use crate::driver::BlobHandle;
use log::{debug, warn};
use std::fmt;
use std::io::Write;
use std::rc::Rc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlobMode {
    Read,
    Write,
}

impl fmt::Display for BlobMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BlobMode::Read => write!(f, "read"),
            BlobMode::Write => write!(f, "write"),
        }
    }
}

/// Streaming handle to a BLOB
///
/// A read blob knows its id from the start. A write blob gets its id when it
/// is closed. After `close` or `cancel` every operation fails with
/// `BlobClosed`. Dropping an open write blob cancels it and dropping an open
/// read blob closes it.
pub struct Blob {
    link: Rc<Link>,
    id: Option<BlobId>,
    mode: BlobMode,
    handle: Option<BlobHandle>,
}

impl Blob {
    pub(crate) fn create(link: Rc<Link>) -> Result<Self> {
        let session = link.session()?;
        let handle = link.call(|d| d.blob_create(session))?;
        debug!("created {} for writing", handle);
        Ok(Self {
            link,
            id: None,
            mode: BlobMode::Write,
            handle: Some(handle),
        })
    }

    pub(crate) fn open(link: Rc<Link>, id: BlobId) -> Result<Self> {
        let session = link.session()?;
        let handle = link.call(|d| d.blob_open(session, id))?;
        debug!("opened {} ({}) for reading", handle, id);
        Ok(Self {
            link,
            id: Some(id),
            mode: BlobMode::Read,
            handle: Some(handle),
        })
    }

    /// The BLOB id; `None` for a write blob that has not been closed yet
    pub fn id(&self) -> Option<BlobId> {
        self.id
    }

    pub fn mode(&self) -> BlobMode {
        self.mode
    }

    pub fn is_closed(&self) -> bool {
        self.handle.is_none()
    }

    /// The open handle, checking closed state, then mode, then the connection.
    fn checked(&self, mode: Option<BlobMode>) -> Result<BlobHandle> {
        let handle = self.handle.ok_or(Error::Usage(UsageError::BlobClosed))?;
        match mode {
            Some(BlobMode::Read) if self.mode != BlobMode::Read => {
                return Err(Error::Usage(UsageError::NotOpenedForReading));
            }
            Some(BlobMode::Write) if self.mode != BlobMode::Write => {
                return Err(Error::Usage(UsageError::NotOpenedForWriting));
            }
            _ => {}
        }
        self.link.session()?;
        Ok(handle)
    }

    /// Append data to a write blob
    pub fn add(&mut self, data: &[u8]) -> Result<()> {
        let handle = self.checked(Some(BlobMode::Write))?;
        self.link.call(|d| d.blob_add(handle, data))
    }

    /// Read up to `len` bytes from a read blob
    ///
    /// A `len` of zero or less reads the whole remaining BLOB.
    pub fn get(&mut self, len: i64) -> Result<Vec<u8>> {
        let handle = self.checked(Some(BlobMode::Read))?;
        let len = match usize::try_from(len) {
            Ok(len) if len > 0 => len,
            _ => self.info()?.length,
        };
        self.link.call(|d| d.blob_get(handle, len))
    }

    /// Close the blob and return its id
    ///
    /// For a write blob this is the id assigned to the newly stored data.
    pub fn close(&mut self) -> Result<BlobId> {
        let handle = self.checked(None)?;
        let id = self.link.call(|d| d.blob_close(handle))?;
        self.handle = None;
        self.id = Some(id);
        debug!("closed {} as {}", handle, id);
        Ok(id)
    }

    /// Discard the blob; a write blob's data is thrown away
    pub fn cancel(&mut self) -> Result<()> {
        let handle = self.checked(None)?;
        self.link.call(|d| d.blob_cancel(handle))?;
        self.handle = None;
        debug!("cancelled {}", handle);
        Ok(())
    }

    /// Length and segment layout of a read blob
    pub fn info(&self) -> Result<BlobInfo> {
        self.checked(Some(BlobMode::Read))?;
        let session = self.link.session()?;
        let id = self.id.ok_or(Error::Usage(UsageError::NotOpenedForReading))?;
        self.link.call(|d| d.blob_info(session, id))
    }

    /// Write the contents of a read blob to standard output
    pub fn echo(&self) -> Result<()> {
        let stdout = std::io::stdout();
        let mut out = stdout.lock();
        self.echo_to(&mut out)
    }

    /// Write the contents of a read blob to `out`
    pub fn echo_to(&self, out: &mut dyn Write) -> Result<()> {
        self.checked(Some(BlobMode::Read))?;
        let session = self.link.session()?;
        let id = self.id.ok_or(Error::Usage(UsageError::NotOpenedForReading))?;
        self.link.call(|d| d.blob_echo(session, id, out))
    }
}

impl Drop for Blob {
    fn drop(&mut self) {
        let Some(handle) = self.handle.take() else {
            return;
        };
        if !self.link.is_open() {
            return;
        }
        let result = match self.mode {
            BlobMode::Write => self.link.call(|d| d.blob_cancel(handle)),
            BlobMode::Read => self.link.call(|d| d.blob_close(handle)).map(|_| ()),
        };
        if let Err(e) = result {
            warn!("releasing {} blob {} failed: {}", self.mode, handle, e);
        }
    }
}

impl fmt::Debug for Blob {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Blob")
            .field("id", &self.id)
            .field("mode", &self.mode)
            .field("handle", &self.handle)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::memory::MemoryDriver;
    use crate::{Connection, ConnectionConfig};
    use std::cell::RefCell;

    fn setup() -> (Rc<RefCell<MemoryDriver>>, Connection) {
        let driver = MemoryDriver::with_database("employee.fdb").into_shared();
        let conn = Connection::open(driver.clone(), ConnectionConfig::default()).unwrap();
        (driver, conn)
    }

    #[test]
    fn test_write_then_read() {
        let (_driver, conn) = setup();

        let mut blob = conn.blob_create().unwrap();
        assert_eq!(blob.mode(), BlobMode::Write);
        assert_eq!(blob.id(), None);
        blob.add(b"hello ").unwrap();
        blob.add(b"world").unwrap();
        let id = blob.close().unwrap();
        assert_eq!(blob.id(), Some(id));
        assert!(blob.is_closed());

        let mut blob = conn.blob_open(id).unwrap();
        assert_eq!(blob.get(0).unwrap(), b"hello world");
        blob.close().unwrap();
    }

    #[test]
    fn test_partial_reads() {
        let (_driver, conn) = setup();
        let mut blob = conn.blob_create().unwrap();
        blob.add(b"hello world").unwrap();
        let id = blob.close().unwrap();

        let mut blob = conn.blob_open(id).unwrap();
        assert_eq!(blob.get(5).unwrap(), b"hello");
        assert_eq!(blob.get(-1).unwrap(), b" world");
        assert!(blob.get(4).unwrap().is_empty());
    }

    #[test]
    fn test_info_and_echo() {
        let (_driver, conn) = setup();
        let mut blob = conn.blob_create().unwrap();
        blob.add(b"abc").unwrap();
        blob.add(b"defg").unwrap();
        let id = blob.close().unwrap();

        let blob = conn.blob_open(id).unwrap();
        let info = blob.info().unwrap();
        assert_eq!(info.length, 7);
        assert_eq!(info.num_segments, 2);
        assert_eq!(info.max_segment, 4);

        let mut out = Vec::new();
        blob.echo_to(&mut out).unwrap();
        assert_eq!(out, b"abcdefg");
    }

    #[test]
    fn test_mode_mismatch() {
        let (_driver, conn) = setup();

        let mut writer = conn.blob_create().unwrap();
        let err = writer.get(1).unwrap_err();
        assert_eq!(err.as_usage(), Some(&UsageError::NotOpenedForReading));
        assert_eq!(err.code(), Some(4));
        assert!(writer.info().is_err());
        writer.add(b"x").unwrap();
        let id = writer.close().unwrap();

        let mut reader = conn.blob_open(id).unwrap();
        let err = reader.add(b"y").unwrap_err();
        assert_eq!(err.as_usage(), Some(&UsageError::NotOpenedForWriting));
        assert_eq!(err.code(), Some(2));
    }

    #[test]
    fn test_operations_after_close_fail() {
        let (_driver, conn) = setup();
        let mut blob = conn.blob_create().unwrap();
        blob.cancel().unwrap();

        // Closed state is reported before the mode mismatch.
        let err = blob.get(1).unwrap_err();
        assert_eq!(err.as_usage(), Some(&UsageError::BlobClosed));
        assert_eq!(err.code(), Some(3));
        assert_eq!(blob.add(b"x").unwrap_err().code(), Some(3));
        assert_eq!(blob.close().unwrap_err().code(), Some(3));
        assert_eq!(blob.cancel().unwrap_err().code(), Some(3));
    }

    #[test]
    fn test_open_unknown_blob_is_driver_error() {
        let (_driver, conn) = setup();
        let err = conn.blob_open(BlobId(999)).unwrap_err();
        assert!(err.is_driver());
    }

    #[test]
    fn test_drop_releases_handles() {
        let (driver, conn) = setup();
        {
            let mut blob = conn.blob_create().unwrap();
            blob.add(b"discarded").unwrap();
        }
        assert_eq!(driver.borrow().open_blob_count(), 0);
        assert_eq!(driver.borrow().stored_blob_count("employee.fdb"), 0);
    }

    #[test]
    fn test_blob_fails_after_connection_close() {
        let (_driver, mut conn) = setup();
        let mut blob = conn.blob_create().unwrap();
        conn.close().unwrap();

        let err = blob.add(b"late").unwrap_err();
        assert_eq!(err.as_usage(), Some(&UsageError::ConnectionClosed));
    }
}
