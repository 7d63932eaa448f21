use crate::connection::Link;
use crate::core::{Error, Result, UsageError};
use crate::driver::EventHandle;
use log::{debug, warn};
use std::rc::Rc;

/// Most event names a single registration can watch.
pub const MAX_EVENTS: usize = 15;

/// Between 1 and [`MAX_EVENTS`] event names
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventNames(Vec<String>);

impl EventNames {
    pub fn new<I, S>(names: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let names: Vec<String> = names.into_iter().map(Into::into).collect();
        if names.is_empty() || names.len() > MAX_EVENTS {
            return Err(Error::Usage(UsageError::EventCount(names.len())));
        }
        Ok(Self(names))
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.0.iter().map(String::as_str)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.0.iter().any(|n| n == name)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl TryFrom<Vec<String>> for EventNames {
    type Error = Error;

    fn try_from(names: Vec<String>) -> Result<Self> {
        Self::new(names)
    }
}

impl TryFrom<&[&str]> for EventNames {
    type Error = Error;

    fn try_from(names: &[&str]) -> Result<Self> {
        Self::new(names.iter().copied())
    }
}

/// A registered event callback
///
/// Freed explicitly with [`EventSubscription::free`] or on drop.
pub struct EventSubscription {
    link: Rc<Link>,
    handle: Option<EventHandle>,
}

impl EventSubscription {
    pub(crate) fn new(link: Rc<Link>, handle: EventHandle) -> Self {
        debug!("registered {}", handle);
        Self {
            link,
            handle: Some(handle),
        }
    }

    pub fn handle(&self) -> Option<EventHandle> {
        self.handle
    }

    pub fn is_closed(&self) -> bool {
        self.handle.is_none()
    }

    /// Unregister the callback. Freeing twice does nothing.
    pub fn free(&mut self) -> Result<()> {
        let Some(handle) = self.handle else {
            return Ok(());
        };
        self.link.session()?;
        self.link.call(|d| d.free_event_handler(handle))?;
        self.handle = None;
        debug!("freed {}", handle);
        Ok(())
    }
}

impl Drop for EventSubscription {
    fn drop(&mut self) {
        if self.handle.is_none() || !self.link.is_open() {
            return;
        }
        if let Err(e) = self.free() {
            warn!("freeing event subscription failed: {}", e);
        }
    }
}

impl std::fmt::Debug for EventSubscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventSubscription")
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

    #[test]
    fn test_event_names_bounds() {
        assert!(EventNames::new(Vec::<String>::new()).is_err());
        assert!(EventNames::new((0..16).map(|i| format!("E{}", i))).is_err());

        let names = EventNames::new((0..15).map(|i| format!("E{}", i))).unwrap();
        assert_eq!(names.len(), 15);
        assert!(names.contains("E14"));

        let err = EventNames::try_from(&[][..]).unwrap_err();
        assert_eq!(err.as_usage(), Some(&UsageError::EventCount(0)));
    }

    #[test]
    fn test_callback_and_free() {
        let driver = MemoryDriver::with_database("employee.fdb").into_shared();
        let conn = Connection::open(driver.clone(), ConnectionConfig::default()).unwrap();

        let seen = Rc::new(RefCell::new(Vec::new()));
        let sink = Rc::clone(&seen);
        let names = EventNames::try_from(&["ORDER_PLACED", "ORDER_SHIPPED"][..]).unwrap();
        let mut sub = conn
            .set_event_handler(&names, move |name| {
                sink.borrow_mut().push(name.to_string());
                true
            })
            .unwrap();

        driver.borrow_mut().post_event("employee.fdb", "ORDER_PLACED");
        driver.borrow_mut().post_event("employee.fdb", "UNRELATED");
        assert_eq!(*seen.borrow(), vec!["ORDER_PLACED".to_string()]);

        sub.free().unwrap();
        assert!(sub.is_closed());
        assert!(sub.free().is_ok());

        driver.borrow_mut().post_event("employee.fdb", "ORDER_SHIPPED");
        assert_eq!(seen.borrow().len(), 1);
    }

    #[test]
    fn test_callback_returning_false_unregisters() {
        let driver = MemoryDriver::with_database("employee.fdb").into_shared();
        let conn = Connection::open(driver.clone(), ConnectionConfig::default()).unwrap();

        let count = Rc::new(RefCell::new(0));
        let counter = Rc::clone(&count);
        let names = EventNames::new(["TICK"]).unwrap();
        let mut sub = conn
            .set_event_handler(&names, move |_| {
                *counter.borrow_mut() += 1;
                false
            })
            .unwrap();

        driver.borrow_mut().post_event("employee.fdb", "TICK");
        driver.borrow_mut().post_event("employee.fdb", "TICK");
        assert_eq!(*count.borrow(), 1);

        // the driver already dropped the registration; freeing still succeeds
        sub.free().unwrap();
        assert!(sub.is_closed());
        sub.free().unwrap();
        assert!(sub.is_closed());
    }

    #[test]
    fn test_wait_event_returns_posted_name() {
        let driver = MemoryDriver::with_database("employee.fdb").into_shared();
        let conn = Connection::open(driver.clone(), ConnectionConfig::default()).unwrap();
        let names = EventNames::new(["A", "B"]).unwrap();

        assert!(conn.wait_event(&names).unwrap_err().is_driver());

        driver.borrow_mut().post_event("employee.fdb", "B");
        assert_eq!(conn.wait_event(&names).unwrap(), "B");
    }
}
