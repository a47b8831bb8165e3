use crate::{Error, Session, SessionAddress};
use parking_lot::{Condvar, Mutex, RwLock};
use std::collections::{HashMap, HashSet};
use zeroize::Zeroize;

/// Durable home of per-device sessions.
///
/// `save` must be atomic: after a crash the stored session is either the
/// previous one or the new one, never a mix. Implementations only store
/// bytes; exclusive access per address is provided by [`SessionLeases`].
/// Backend failures, including unreadable stored bytes, are reported as
/// [`Error::Storage`].
pub trait SessionStore: Send + Sync {
    /// Loads the session for an address.
    fn load(&self, address: &SessionAddress) -> Result<Option<Session>, Error>;

    /// Inserts or replaces the session stored under `session.address()`.
    fn save(&self, session: &Session) -> Result<(), Error>;

    /// Devices of `identity` that currently have a session, in ascending order.
    fn list_devices(&self, identity: &str) -> Result<Vec<u32>, Error>;

    /// Deletes a session. Returns whether one existed.
    fn delete(&self, address: &SessionAddress) -> Result<bool, Error>;
}

/// Session store backed by a map of serialized sessions.
///
/// A save swaps one map slot for a freshly encoded session, so readers see
/// either the old or the new encoding. Replaced and deleted encodings are
/// zeroized.
#[derive(Default)]
pub struct MemorySessionStore {
    sessions: RwLock<HashMap<SessionAddress, Vec<u8>>>,
}

impl MemorySessionStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }
}

impl SessionStore for MemorySessionStore {
    fn load(&self, address: &SessionAddress) -> Result<Option<Session>, Error> {
        self.sessions
            .read()
            .get(address)
            .map(|bytes| {
                Session::deserialize(bytes)
                    .map_err(|err| Error::Storage(format!("Unreadable session for {address}: {err}")))
            })
            .transpose()
    }

    fn save(&self, session: &Session) -> Result<(), Error> {
        let bytes = session.serialize()?;
        if let Some(mut previous) = self.sessions.write().insert(session.address().clone(), bytes) {
            previous.zeroize();
        }
        Ok(())
    }

    fn list_devices(&self, identity: &str) -> Result<Vec<u32>, Error> {
        let mut devices: Vec<u32> = self
            .sessions
            .read()
            .keys()
            .filter(|address| address.identity == identity)
            .map(|address| address.device_id)
            .collect();
        devices.sort_unstable();
        Ok(devices)
    }

    fn delete(&self, address: &SessionAddress) -> Result<bool, Error> {
        match self.sessions.write().remove(address) {
            Some(mut bytes) => {
                bytes.zeroize();
                Ok(true)
            }
            None => Ok(false),
        }
    }
}

/// Exclusive checkout of sessions by address.
///
/// At most one [`SessionLease`] exists per address; sessions at different
/// addresses are leased independently.
#[derive(Default)]
pub struct SessionLeases {
    held: Mutex<HashSet<SessionAddress>>,
    released: Condvar,
}

impl SessionLeases {
    /// Creates an empty lease table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Leases `address`, blocking while another lease on it is alive.
    pub fn acquire(&self, address: &SessionAddress) -> SessionLease<'_> {
        let mut held = self.held.lock();
        while held.contains(address) {
            self.released.wait(&mut held);
        }
        held.insert(address.clone());

        SessionLease {
            leases: self,
            address: address.clone(),
        }
    }

    /// Leases `address` or fails immediately if it is checked out.
    pub fn try_acquire(&self, address: &SessionAddress) -> Result<SessionLease<'_>, Error> {
        let mut held = self.held.lock();
        if !held.insert(address.clone()) {
            return Err(Error::Session(format!("Session {address} is busy")));
        }

        Ok(SessionLease {
            leases: self,
            address: address.clone(),
        })
    }
}

/// Exclusive access to one address. Released on drop.
pub struct SessionLease<'a> {
    leases: &'a SessionLeases,
    address: SessionAddress,
}

impl SessionLease<'_> {
    /// Address this lease covers.
    pub fn address(&self) -> &SessionAddress {
        &self.address
    }
}

impl Drop for SessionLease<'_> {
    fn drop(&mut self) {
        self.leases.held.lock().remove(&self.address);
        self.leases.released.notify_all();
    }
}
