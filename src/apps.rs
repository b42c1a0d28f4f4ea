//! Application and detection-rule registry.
//!
//! Owned by the control process. Every rule mutation recompiles both of the
//! application's databases; compiled databases live in a pool keyed by
//! handle, and every PDR referencing the application gets its cached
//! handles refreshed by publishing a new rule-set version to the session.
//! Old databases are freed once the last in-flight batch drops its handle.

use std::collections::{BTreeMap, HashMap};
use std::net::IpAddr;
use std::sync::Arc;

use tracing::debug;

use uf_dataplane::AdfDb;
use uf_interface::{AdfHandle, AppId, Error, Result, SessionTable};

/// One application-detection rule, uncompiled.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AdrRule {
    pub id: u32,
    pub host: Option<String>,
    pub path: Option<String>,
    pub src_ip: Option<IpAddr>,
    pub dst_ip: Option<IpAddr>,
}

/// A named application and its compiled database handles.
#[derive(Debug)]
pub struct App {
    pub id: AppId,
    pub name: String,
    pub rules: BTreeMap<u32, AdrRule>,
    pub path_db: Option<u32>,
    pub host_db: Option<u32>,
}

#[derive(Debug)]
pub struct AppRegistry {
    sessions: Arc<SessionTable>,
    apps: Vec<Option<App>>,
    by_name: HashMap<String, AppId>,
    dbs: HashMap<u32, Arc<AdfDb>>,
    next_db_handle: u32,
}

impl AppRegistry {
    pub fn new(sessions: Arc<SessionTable>) -> AppRegistry {
        AppRegistry {
            sessions,
            apps: Vec::new(),
            by_name: HashMap::new(),
            dbs: HashMap::new(),
            next_db_handle: 0,
        }
    }

    pub fn app_add(&mut self, name: &str) -> Result<AppId> {
        if self.by_name.contains_key(name) {
            return Err(Error::AlreadyExists);
        }

        let id = match self.apps.iter().position(|a| a.is_none()) {
            Some(free) => free as AppId,
            None => {
                self.apps.push(None);
                (self.apps.len() - 1) as AppId
            }
        };
        self.apps[id as usize] = Some(App {
            id,
            name: name.to_string(),
            rules: BTreeMap::new(),
            path_db: None,
            host_db: None,
        });
        self.by_name.insert(name.to_string(), id);
        debug!(app = name, id, "application created");
        Ok(id)
    }

    pub fn app_remove(&mut self, name: &str) -> Result<()> {
        let id = self.by_name.remove(name).ok_or(Error::NotFound)?;
        let app = self.apps[id as usize].take().ok_or(Error::NotFound)?;

        if let Some(handle) = app.path_db {
            self.dbs.remove(&handle);
        }
        if let Some(handle) = app.host_db {
            self.dbs.remove(&handle);
        }
        // Cached handles on PDRs bound to this application are cleared;
        // in-flight readers keep the dropped databases alive until their
        // batch ends.
        self.refresh_sessions(id);
        debug!(app = name, "application removed");
        Ok(())
    }

    pub fn rule_add(&mut self, name: &str, rule_id: u32, rule: AdrRule) -> Result<()> {
        let id = *self.by_name.get(name).ok_or(Error::NotFound)?;
        let app = self.apps[id as usize].as_ref().ok_or(Error::NotFound)?;
        if app.rules.contains_key(&rule_id) {
            return Err(Error::AlreadyExists);
        }

        let mut candidate = app.rules.clone();
        candidate.insert(rule_id, AdrRule { id: rule_id, ..rule });
        self.rebuild(id, candidate)
    }

    pub fn rule_remove(&mut self, name: &str, rule_id: u32) -> Result<()> {
        let id = *self.by_name.get(name).ok_or(Error::NotFound)?;
        let app = self.apps[id as usize].as_ref().ok_or(Error::NotFound)?;
        if !app.rules.contains_key(&rule_id) {
            return Err(Error::NotFound);
        }

        let mut candidate = app.rules.clone();
        candidate.remove(&rule_id);
        self.rebuild(id, candidate)
    }

    /// Compiles both databases for the candidate rule set and commits. A
    /// compile failure rejects the whole mutation and leaves the previous
    /// databases installed. An empty pattern collection yields no database
    /// and surfaces as `NotFound` after the (still committed) mutation.
    fn rebuild(&mut self, id: AppId, candidate: BTreeMap<u32, AdrRule>) -> Result<()> {
        let paths: Vec<(AppId, String)> = candidate
            .values()
            .filter_map(|r| r.path.clone().map(|p| (id, p)))
            .collect();
        let hosts: Vec<(AppId, String)> = candidate
            .values()
            .filter_map(|r| r.host.clone().map(|h| (id, h)))
            .collect();

        let path_db = compile(&paths)?;
        let host_db = compile(&hosts)?;
        let empty = path_db.is_none() || host_db.is_none();

        let path_handle = path_db.map(|db| self.pool_insert(db));
        let host_handle = host_db.map(|db| self.pool_insert(db));

        let app = self.apps[id as usize].as_mut().ok_or(Error::NotFound)?;
        if let Some(old) = app.path_db.take() {
            self.dbs.remove(&old);
        }
        if let Some(old) = app.host_db.take() {
            self.dbs.remove(&old);
        }
        app.rules = candidate;
        app.path_db = path_handle;
        app.host_db = host_handle;

        self.refresh_sessions(id);
        debug!(app = id, ?path_handle, ?host_handle, "databases rebuilt");

        if empty {
            return Err(Error::NotFound);
        }
        Ok(())
    }

    fn pool_insert(&mut self, db: Arc<AdfDb>) -> u32 {
        self.next_db_handle += 1;
        let handle = self.next_db_handle;
        self.dbs.insert(handle, db);
        handle
    }

    /// Publishes fresh rule-set versions to every session holding a PDR
    /// bound to `app_id`, carrying the registry's current handles.
    fn refresh_sessions(&self, app_id: AppId) {
        let (path_db, host_db) = self.handles(app_id);
        for session in self.sessions.snapshot() {
            let active = session.active();
            if !active.pdrs.iter().any(|p| p.app_id == Some(app_id)) {
                continue;
            }
            let mut next = (*active).clone();
            for pdr in &mut next.pdrs {
                if pdr.app_id == Some(app_id) {
                    pdr.path_db = path_db.clone();
                    pdr.host_db = host_db.clone();
                }
            }
            session.publish(next);
        }
    }

    /// Current database handles of an application, resolved through the
    /// pool. Missing app or missing database resolve to `None`.
    pub fn handles(&self, app_id: AppId) -> (Option<AdfHandle>, Option<AdfHandle>) {
        let app = match self.apps.get(app_id as usize).and_then(|a| a.as_ref()) {
            Some(a) => a,
            None => return (None, None),
        };
        (self.resolve(app.path_db), self.resolve(app.host_db))
    }

    fn resolve(&self, handle: Option<u32>) -> Option<AdfHandle> {
        let db: AdfHandle = self.dbs.get(&handle?)?.clone();
        Some(db)
    }

    pub fn app_by_name(&self, name: &str) -> Option<&App> {
        let id = *self.by_name.get(name)?;
        self.apps.get(id as usize)?.as_ref()
    }

    pub fn get(&self, app_id: AppId) -> Option<&App> {
        self.apps.get(app_id as usize)?.as_ref()
    }

    pub fn db(&self, handle: u32) -> Option<Arc<AdfDb>> {
        self.dbs.get(&handle).cloned()
    }

    pub fn iter(&self) -> impl Iterator<Item = &App> {
        self.apps.iter().filter_map(|a| a.as_ref())
    }
}

fn compile(patterns: &[(AppId, String)]) -> Result<Option<Arc<AdfDb>>> {
    if patterns.is_empty() {
        return Ok(None);
    }
    Ok(Some(Arc::new(AdfDb::compile(patterns)?)))
}
