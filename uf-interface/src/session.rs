use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};

use crate::error::{Error, Result};
use crate::rules::RuleSet;

/// One PFCP session. Two 64-bit tags identify it: the peer-chosen `cp_seid`
/// and the locally allocated `up_seid`.
///
/// Only the `active` rule-set version is visible to workers. Publication
/// swaps the `Arc` under a short write lock; a worker that cloned the old
/// handle keeps it valid until the end of its batch, which is the quiescent
/// point of the update protocol.
#[derive(Debug)]
pub struct Session {
    pub session_index: u32,
    pub cp_seid: u64,
    pub up_seid: u64,
    pub cp_address: IpAddr,
    pub up_address: IpAddr,
    pub fib_index: u32,
    active: RwLock<Arc<RuleSet>>,
    pending: Mutex<Option<RuleSet>>,
}

impl Session {
    /// Snapshot of the active rules; cheap, lock held only for the clone.
    pub fn active(&self) -> Arc<RuleSet> {
        self.active.read().clone()
    }

    /// Installs a new active version. The previous version stays alive for
    /// as long as any in-flight batch still holds it.
    pub fn publish(&self, rules: RuleSet) {
        *self.active.write() = Arc::new(rules);
    }

    pub fn set_pending(&self, rules: RuleSet) {
        *self.pending.lock() = Some(rules);
    }

    pub fn take_pending(&self) -> Option<RuleSet> {
        self.pending.lock().take()
    }
}

#[derive(Debug, Default)]
struct SessionTableInner {
    slots: Vec<Option<Arc<Session>>>,
    free: Vec<u32>,
    by_cp_seid: HashMap<u64, u32>,
    by_up_seid: HashMap<u64, u32>,
    next_up_seid: u64,
}

/// Session registry. Mutated only by the control process; workers resolve
/// `session_index` from buffer metadata to a shared handle.
#[derive(Debug, Default)]
pub struct SessionTable {
    inner: RwLock<SessionTableInner>,
}

impl SessionTable {
    pub fn new() -> SessionTable {
        SessionTable::default()
    }

    pub fn create(
        &self,
        cp_seid: u64,
        cp_address: IpAddr,
        up_address: IpAddr,
        fib_index: u32,
    ) -> Result<Arc<Session>> {
        let mut inner = self.inner.write();
        if inner.by_cp_seid.contains_key(&cp_seid) {
            return Err(Error::AlreadyExists);
        }

        inner.next_up_seid += 1;
        let up_seid = inner.next_up_seid;
        let session_index = match inner.free.pop() {
            Some(idx) => idx,
            None => {
                inner.slots.push(None);
                (inner.slots.len() - 1) as u32
            }
        };

        let session = Arc::new(Session {
            session_index,
            cp_seid,
            up_seid,
            cp_address,
            up_address,
            fib_index,
            active: RwLock::new(Arc::new(RuleSet::default())),
            pending: Mutex::new(None),
        });

        inner.slots[session_index as usize] = Some(session.clone());
        inner.by_cp_seid.insert(cp_seid, session_index);
        inner.by_up_seid.insert(up_seid, session_index);
        Ok(session)
    }

    pub fn get(&self, session_index: u32) -> Option<Arc<Session>> {
        self.inner
            .read()
            .slots
            .get(session_index as usize)
            .and_then(|s| s.clone())
    }

    pub fn by_cp_seid(&self, seid: u64) -> Option<Arc<Session>> {
        let inner = self.inner.read();
        let idx = *inner.by_cp_seid.get(&seid)?;
        inner.slots[idx as usize].clone()
    }

    pub fn by_up_seid(&self, seid: u64) -> Option<Arc<Session>> {
        let inner = self.inner.read();
        let idx = *inner.by_up_seid.get(&seid)?;
        inner.slots[idx as usize].clone()
    }

    pub fn remove(&self, up_seid: u64) -> Result<Arc<Session>> {
        let mut inner = self.inner.write();
        let idx = inner.by_up_seid.remove(&up_seid).ok_or(Error::NotFound)?;
        let session = inner.slots[idx as usize].take().ok_or(Error::NotFound)?;
        inner.by_cp_seid.remove(&session.cp_seid);
        inner.free.push(idx);
        Ok(session)
    }

    /// Snapshot of all live sessions; used for registry-wide walks so the
    /// table lock is never held across per-session work.
    pub fn snapshot(&self) -> Vec<Arc<Session>> {
        self.inner
            .read()
            .slots
            .iter()
            .filter_map(|s| s.clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.inner.read().by_up_seid.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
