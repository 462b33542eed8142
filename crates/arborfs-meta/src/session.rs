//! Client sessions and the migration guard in front of them.
//!
//! A session request for a directory is served by the rank authoritative for
//! it. While a subtree is moving, requests are either queued on the importer
//! (pending boundary) or forwarded to the destination (exporter past its
//! point of no return), so that each session ends up established on exactly
//! one rank.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::namespace::DirPath;
use crate::subtree::SubtreeBoundary;
use crate::types::{ClientId, DirId, MetaError, RankId, Timestamp};

/// Default bound on how many times a request may be forwarded.
pub const DEFAULT_MAX_HOPS: u8 = 8;

/// A client asking to open a session on a directory.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionRequest {
    /// Requesting client
    pub client: ClientId,
    /// Target directory
    pub dir: DirId,
    /// Path the client used
    pub path: DirPath,
    /// Forwards so far
    pub hops: u8,
}

/// An established session.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionRecord {
    /// Owning client
    pub client: ClientId,
    /// Directory the session is bound to
    pub dir: DirId,
    /// Path at establishment
    pub path: DirPath,
    /// When the session was first established
    pub established_at: Timestamp,
}

impl SessionRecord {
    /// Key used to identify the session cluster-wide.
    pub fn key(&self) -> (ClientId, DirId) {
        (self.client, self.dir)
    }

    /// A fresh request that would re-establish this session.
    pub fn to_request(&self) -> SessionRequest {
        SessionRequest {
            client: self.client,
            dir: self.dir,
            path: self.path.clone(),
            hops: 0,
        }
    }
}

/// What a rank does with an incoming session request.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SessionRoute {
    /// Establish locally.
    Serve,
    /// Hold until the pending import rooted at `root` settles.
    Queue {
        /// Pending subtree root
        root: DirId,
    },
    /// Send on to another rank.
    Forward(RankId),
}

/// Decides where a request goes.
///
/// `enclosing` is the local view of the boundary containing the directory;
/// `exporting_to` is set when this rank is exporting that region and has
/// passed its point of no return. A request that would need forwarding
/// after `max_hops` forwards fails with [`MetaError::SessionDropped`].
pub fn route_session(
    local: RankId,
    enclosing: &SubtreeBoundary,
    exporting_to: Option<RankId>,
    req: &SessionRequest,
    max_hops: u8,
) -> Result<SessionRoute, MetaError> {
    if enclosing.is_pending() {
        return Ok(SessionRoute::Queue {
            root: enclosing.root,
        });
    }
    let next = match exporting_to {
        Some(dest) => dest,
        None if enclosing.auth == local => return Ok(SessionRoute::Serve),
        None => enclosing.auth,
    };
    if req.hops >= max_hops {
        return Err(MetaError::SessionDropped {
            client: req.client,
            path: req.path.to_string(),
            hops: req.hops,
        });
    }
    Ok(SessionRoute::Forward(next))
}

/// Per-rank session table plus the migration queue.
#[derive(Default)]
pub struct SessionGuard {
    established: BTreeMap<(ClientId, DirId), SessionRecord>,
    queued: BTreeMap<DirId, Vec<SessionRequest>>,
    held: Vec<SessionRequest>,
    hold: bool,
    dropped: Vec<SessionRequest>,
}

impl SessionGuard {
    /// Creates an empty guard. With `hold` set, released requests are kept
    /// back until [`SessionGuard::set_hold`] turns it off.
    pub fn new(hold: bool) -> Self {
        Self {
            hold,
            ..Self::default()
        }
    }

    /// Establishes a session from a request. Returns false if it already existed.
    pub fn establish(&mut self, req: &SessionRequest) -> bool {
        let key = (req.client, req.dir);
        if self.established.contains_key(&key) {
            return false;
        }
        self.established.insert(
            key,
            SessionRecord {
                client: req.client,
                dir: req.dir,
                path: req.path.clone(),
                established_at: Timestamp::now(),
            },
        );
        true
    }

    /// Installs a migrated session record.
    pub fn install(&mut self, record: SessionRecord) {
        self.established.entry(record.key()).or_insert(record);
    }

    /// True if the session is established here.
    pub fn is_established(&self, client: ClientId, dir: DirId) -> bool {
        self.established.contains_key(&(client, dir))
    }

    /// Established sessions.
    pub fn sessions(&self) -> impl Iterator<Item = &SessionRecord> {
        self.established.values()
    }

    /// Number of established sessions.
    pub fn len(&self) -> usize {
        self.established.len()
    }

    /// True if no session is established.
    pub fn is_empty(&self) -> bool {
        self.established.is_empty()
    }

    /// Copies of the sessions matching `pred`.
    pub fn collect<F: Fn(DirId) -> bool>(&self, pred: F) -> Vec<SessionRecord> {
        self.established
            .values()
            .filter(|s| pred(s.dir))
            .cloned()
            .collect()
    }

    /// Removes and returns the sessions matching `pred`.
    pub fn take<F: Fn(DirId) -> bool>(&mut self, pred: F) -> Vec<SessionRecord> {
        let keys: Vec<_> = self
            .established
            .values()
            .filter(|s| pred(s.dir))
            .map(|s| s.key())
            .collect();
        keys.iter()
            .filter_map(|k| self.established.remove(k))
            .collect()
    }

    /// Queues a request behind the pending import rooted at `root`.
    pub fn queue(&mut self, root: DirId, req: SessionRequest) {
        self.queued.entry(root).or_default().push(req);
    }

    /// Requests waiting on migrations or held back.
    pub fn queued_count(&self) -> usize {
        self.queued.values().map(Vec::len).sum::<usize>() + self.held.len()
    }

    /// Releases the requests queued behind `root` for re-routing. While
    /// holding, they move to the held list instead.
    pub fn release(&mut self, root: DirId) -> Vec<SessionRequest> {
        let released = self.queued.remove(&root).unwrap_or_default();
        if self.hold {
            self.held.extend(released);
            return Vec::new();
        }
        released
    }

    /// Toggles holding; turning it off returns everything held.
    pub fn set_hold(&mut self, hold: bool) -> Vec<SessionRequest> {
        self.hold = hold;
        if hold {
            Vec::new()
        } else {
            std::mem::take(&mut self.held)
        }
    }

    /// True while released requests are being held back.
    pub fn is_holding(&self) -> bool {
        self.hold
    }

    /// Rewrites request and session paths after a rename.
    pub fn rebase(&mut self, from: &DirPath, to: &DirPath) {
        for s in self.established.values_mut() {
            if let Some(path) = s.path.rebase(from, to) {
                s.path = path;
            }
        }
        for req in self.queued.values_mut().flatten().chain(self.held.iter_mut()) {
            if let Some(path) = req.path.rebase(from, to) {
                req.path = path;
            }
        }
    }

    /// Keeps a request this rank could not route.
    pub fn record_drop(&mut self, req: SessionRequest) {
        self.dropped.push(req);
    }

    /// Requests dropped so far.
    pub fn dropped(&self) -> &[SessionRequest] {
        &self.dropped
    }

    /// The last dropped request from `client` for `dir`, if any.
    pub fn dropped_for(&self, client: ClientId, dir: DirId) -> Option<&SessionRequest> {
        self.dropped
            .iter()
            .rev()
            .find(|r| r.client == client && r.dir == dir)
    }

    /// Everything this guard knows about, as fresh requests. Used when the
    /// rank stops and its clients reconnect elsewhere.
    pub fn drain_all(&mut self) -> Vec<SessionRequest> {
        let mut all: Vec<SessionRequest> = self
            .established
            .values()
            .map(SessionRecord::to_request)
            .collect();
        self.established.clear();
        for reqs in std::mem::take(&mut self.queued).into_values() {
            all.extend(reqs.into_iter().map(|mut r| {
                r.hops = 0;
                r
            }));
        }
        all.extend(std::mem::take(&mut self.held).into_iter().map(|mut r| {
            r.hops = 0;
            r
        }));
        all
    }
}
