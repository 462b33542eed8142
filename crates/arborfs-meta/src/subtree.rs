//! Subtree authority map.
//!
//! Every rank keeps a full view of the cluster's subtree boundaries: which
//! directories root a subtree and which rank is authoritative for each. The
//! entries a rank owns are authoritative knowledge; the rest is a view kept
//! current by migration notifications and the resolve round, and may lag.
//!
//! A directory belongs to the region of its nearest boundary at or above it.
//! The root boundary always exists.

use std::collections::{BTreeMap, BTreeSet, VecDeque};

use serde::{Deserialize, Serialize};

use crate::namespace::{DirPath, Namespace};
use crate::types::{DirId, MetaError, OperationId, RankId};

/// Migration marker carried by a boundary.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum BoundaryState {
    /// No migration in progress.
    Stable,
    /// An export of this subtree toward `dest` is in flight.
    Ambiguous {
        /// Prospective new authority
        dest: RankId,
    },
    /// Being imported by this rank; not yet authoritative.
    Pending {
        /// The import operation
        op: OperationId,
    },
}

/// One subtree root and its authority.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubtreeBoundary {
    /// Root directory of the subtree
    pub root: DirId,
    /// Cached path of the root, rewritten on rename
    pub root_path: DirPath,
    /// Authoritative rank
    pub auth: RankId,
    /// Migration marker
    pub state: BoundaryState,
    /// Structural mutation is blocked while set
    pub frozen: bool,
    /// Bumped on every authority change
    pub epoch: u64,
}

impl SubtreeBoundary {
    /// A stable, unfrozen boundary.
    pub fn new(root: DirId, root_path: DirPath, auth: RankId, epoch: u64) -> Self {
        Self {
            root,
            root_path,
            auth,
            state: BoundaryState::Stable,
            frozen: false,
            epoch,
        }
    }

    /// True while the boundary is a not-yet-authoritative import.
    pub fn is_pending(&self) -> bool {
        matches!(self.state, BoundaryState::Pending { .. })
    }

    /// True if `rank` holds authority here.
    pub fn is_owned_by(&self, rank: RankId) -> bool {
        self.auth == rank && !self.is_pending()
    }

    /// The ownership claim this boundary represents.
    pub fn claim(&self) -> BoundaryClaim {
        BoundaryClaim {
            root: self.root,
            root_path: self.root_path.clone(),
            auth: self.auth,
            epoch: self.epoch,
        }
    }

    /// Copy with transient migration markers cleared, or None for pending imports.
    pub fn settled(&self) -> Option<SubtreeBoundary> {
        if self.is_pending() {
            return None;
        }
        let mut settled = self.clone();
        settled.state = BoundaryState::Stable;
        settled.frozen = false;
        Some(settled)
    }
}

/// A rank's statement that it owns a subtree, exchanged during resolve.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BoundaryClaim {
    /// Root directory
    pub root: DirId,
    /// Path of the root at claim time
    pub root_path: DirPath,
    /// Claiming rank
    pub auth: RankId,
    /// Epoch of the claim
    pub epoch: u64,
}

/// The subtree table held by one rank.
pub struct SubtreeMap {
    local: RankId,
    bounds: BTreeMap<DirId, SubtreeBoundary>,
    export_targets: BTreeSet<RankId>,
    max_epoch: u64,
}

impl SubtreeMap {
    /// A fresh map: the root subtree belongs to rank 0.
    pub fn new(local: RankId) -> Self {
        let mut bounds = BTreeMap::new();
        bounds.insert(
            DirId::ROOT,
            SubtreeBoundary::new(DirId::ROOT, DirPath::root(), RankId::ZERO, 0),
        );
        Self {
            local,
            bounds,
            export_targets: BTreeSet::new(),
            max_epoch: 0,
        }
    }

    /// Rebuilds a map from a checkpoint. Migration markers are dropped.
    pub fn from_checkpoint(local: RankId, boundaries: &[SubtreeBoundary]) -> Self {
        let mut map = Self::new(local);
        for b in boundaries.iter().filter_map(|b| b.settled()) {
            map.insert(b);
        }
        map
    }

    /// The rank this map belongs to.
    pub fn local(&self) -> RankId {
        self.local
    }

    /// Boundary rooted at `root`.
    pub fn get(&self, root: DirId) -> Option<&SubtreeBoundary> {
        self.bounds.get(&root)
    }

    /// Mutable boundary rooted at `root`.
    pub fn get_mut(&mut self, root: DirId) -> Option<&mut SubtreeBoundary> {
        self.bounds.get_mut(&root)
    }

    /// True if `root` is a subtree root.
    pub fn contains(&self, root: DirId) -> bool {
        self.bounds.contains_key(&root)
    }

    /// Inserts or replaces a boundary.
    pub fn insert(&mut self, boundary: SubtreeBoundary) -> Option<SubtreeBoundary> {
        self.max_epoch = self.max_epoch.max(boundary.epoch);
        self.bounds.insert(boundary.root, boundary)
    }

    /// Removes a boundary, merging its region into the parent's. The root
    /// boundary cannot be removed.
    pub fn remove(&mut self, root: DirId) -> Option<SubtreeBoundary> {
        if root == DirId::ROOT {
            return None;
        }
        self.bounds.remove(&root)
    }

    /// All boundaries, ordered by root ID.
    pub fn boundaries(&self) -> impl Iterator<Item = &SubtreeBoundary> {
        self.bounds.values()
    }

    /// Number of boundaries, root included.
    pub fn len(&self) -> usize {
        self.bounds.len()
    }

    /// Never true; the root boundary always exists.
    pub fn is_empty(&self) -> bool {
        self.bounds.is_empty()
    }

    /// Epoch to stamp on the next authority change.
    pub fn next_epoch(&self) -> u64 {
        self.max_epoch + 1
    }

    /// Nearest boundary at or above `dir`.
    pub fn enclosing(&self, ns: &Namespace, dir: DirId) -> Result<&SubtreeBoundary, MetaError> {
        let chain = ns.chain_of(dir)?;
        chain
            .iter()
            .rev()
            .find_map(|d| self.bounds.get(d))
            .ok_or_else(|| MetaError::NotFound(format!("no subtree encloses {}", dir)))
    }

    /// Nearest boundary strictly above `root`, None for the namespace root.
    pub fn parent_boundary(
        &self,
        ns: &Namespace,
        root: DirId,
    ) -> Result<Option<&SubtreeBoundary>, MetaError> {
        match ns.parent_of(root)? {
            Some(parent) => Ok(Some(self.enclosing(ns, parent)?)),
            None => Ok(None),
        }
    }

    /// Authority for `dir` according to this view.
    pub fn authority_of(&self, ns: &Namespace, dir: DirId) -> Result<RankId, MetaError> {
        Ok(self.enclosing(ns, dir)?.auth)
    }

    /// True if this rank is authoritative for `dir`.
    pub fn is_authoritative(&self, ns: &Namespace, dir: DirId) -> Result<bool, MetaError> {
        Ok(self.enclosing(ns, dir)?.is_owned_by(self.local))
    }

    /// Directories whose nearest boundary is `root`, root first.
    pub fn region_of(&self, ns: &Namespace, root: DirId) -> Result<Vec<DirId>, MetaError> {
        let mut region = vec![root];
        let mut queue: VecDeque<DirId> = ns.children(root)?.into();
        while let Some(dir) = queue.pop_front() {
            if self.bounds.contains_key(&dir) {
                continue;
            }
            region.push(dir);
            queue.extend(ns.children(dir)?);
        }
        Ok(region)
    }

    /// Boundaries directly nested under `root`'s region.
    pub fn nested_bounds(&self, ns: &Namespace, root: DirId) -> Result<Vec<DirId>, MetaError> {
        let mut nested = Vec::new();
        for b in self.bounds.values() {
            if b.root == root || !ns.contains(b.root) {
                continue;
            }
            if let Some(parent) = self.parent_boundary(ns, b.root)? {
                if parent.root == root {
                    nested.push(b.root);
                }
            }
        }
        Ok(nested)
    }

    /// A frozen boundary at, above or below `dir`, if any.
    pub fn frozen_overlapping(&self, ns: &Namespace, dir: DirId) -> Option<&SubtreeBoundary> {
        self.bounds.values().find(|b| {
            b.frozen
                && (ns.is_ancestor_or_self(b.root, dir) || ns.is_ancestor_or_self(dir, b.root))
        })
    }

    /// A frozen boundary at or above `dir`.
    pub fn frozen_enclosing(&self, ns: &Namespace, dir: DirId) -> Option<&SubtreeBoundary> {
        self.bounds
            .values()
            .find(|b| b.frozen && ns.is_ancestor_or_self(b.root, dir))
    }

    /// Sets or clears the freeze on a boundary.
    pub fn set_frozen(&mut self, root: DirId, frozen: bool) -> Result<(), MetaError> {
        let b = self
            .bounds
            .get_mut(&root)
            .ok_or_else(|| MetaError::NotFound(format!("subtree {}", root)))?;
        b.frozen = frozen;
        Ok(())
    }

    /// Records a new authority for an existing or new boundary.
    pub fn set_auth(
        &mut self,
        root: DirId,
        root_path: DirPath,
        auth: RankId,
        epoch: u64,
    ) -> &mut SubtreeBoundary {
        self.max_epoch = self.max_epoch.max(epoch);
        let b = self
            .bounds
            .entry(root)
            .or_insert_with(|| SubtreeBoundary::new(root, root_path.clone(), auth, epoch));
        b.root_path = root_path;
        b.auth = auth;
        b.epoch = epoch;
        b.state = BoundaryState::Stable;
        b
    }

    /// Rewrites cached paths at or under `from` to live under `to`.
    /// Returns the number of boundaries updated.
    pub fn rebase(&mut self, from: &DirPath, to: &DirPath) -> usize {
        let mut updated = 0;
        for b in self.bounds.values_mut() {
            if let Some(path) = b.root_path.rebase(from, to) {
                b.root_path = path;
                updated += 1;
            }
        }
        updated
    }

    /// Reloads cached paths from the namespace; boundaries on vanished
    /// directories are dropped.
    pub fn refresh_paths(&mut self, ns: &Namespace) {
        self.bounds.retain(|root, b| match ns.path_of(*root) {
            Ok(path) => {
                b.root_path = path;
                true
            }
            Err(_) => *root == DirId::ROOT,
        });
    }

    /// Boundaries this rank is authoritative for.
    pub fn owned(&self) -> Vec<&SubtreeBoundary> {
        self.bounds
            .values()
            .filter(|b| b.is_owned_by(self.local))
            .collect()
    }

    /// Ownership claims for the resolve round.
    pub fn claims(&self) -> Vec<BoundaryClaim> {
        self.owned().into_iter().map(|b| b.claim()).collect()
    }

    /// Non-root boundaries as `(path, auth)`, sorted by path.
    pub fn view(&self) -> Vec<(DirPath, RankId)> {
        let mut view: Vec<_> = self
            .bounds
            .values()
            .filter(|b| b.root != DirId::ROOT)
            .map(|b| (b.root_path.clone(), b.auth))
            .collect();
        view.sort();
        view
    }

    /// Boundaries to persist in a checkpoint.
    pub fn checkpoint(&self) -> Vec<SubtreeBoundary> {
        self.bounds.values().filter_map(|b| b.settled()).collect()
    }

    /// Records that this rank exported to `rank`.
    pub fn add_export_target(&mut self, rank: RankId) {
        self.export_targets.insert(rank);
    }

    /// Every rank exported to since this rank became active.
    pub fn export_targets(&self) -> &BTreeSet<RankId> {
        &self.export_targets
    }
}
