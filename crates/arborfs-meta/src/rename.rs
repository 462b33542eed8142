//! Namespace changes around subtree boundaries.
//!
//! Boundaries and sessions are keyed by directory id, so a rename never
//! changes who is authoritative for what. Only cached paths move. A rename
//! touching a frozen subtree, or a create under one, is refused until the
//! migration settles.

use crate::namespace::{read_namespace, DirPath};
use crate::rank::Rank;
use crate::types::{DirId, MetaError};

impl Rank {
    /// The frozen subtree a rename of `dir` would disturb, if any.
    pub fn rename_blocker(&self, dir: DirId) -> Result<Option<DirPath>, MetaError> {
        let ns = read_namespace(&self.ns)?;
        Ok(self
            .map
            .frozen_overlapping(&ns, dir)
            .map(|b| b.root_path.clone()))
    }

    /// The frozen subtree a new child of `parent` would land in, if any.
    pub fn create_blocker(&self, parent: DirId) -> Result<Option<DirPath>, MetaError> {
        let ns = read_namespace(&self.ns)?;
        Ok(self
            .map
            .frozen_enclosing(&ns, parent)
            .map(|b| b.root_path.clone()))
    }

    /// Rewrites cached paths after `from` was renamed to `to`. Returns the
    /// number of boundaries whose path changed.
    pub fn apply_rename(&mut self, from: &DirPath, to: &DirPath) -> usize {
        let moved = self.map.rebase(from, to);
        for e in self.exports.values_mut() {
            if let Some(path) = e.op.root_path.rebase(from, to) {
                e.op.root_path = path;
            }
            if let Some(payload) = e.payload.as_mut() {
                if let Some(path) = payload.root_path.rebase(from, to) {
                    payload.root_path = path;
                }
            }
        }
        for i in self.imports.values_mut() {
            if let Some(path) = i.op.root_path.rebase(from, to) {
                i.op.root_path = path;
            }
        }
        self.sessions.rebase(from, to);
        tracing::debug!(rank = %self.id, %from, %to, boundaries = moved, "rename applied");
        moved
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::failpoint::NoopInjector;
    use crate::journal::MemoryJournalStore;
    use crate::namespace::Namespace;
    use crate::rank::RankConfig;
    use crate::recovery::RankStart;
    use crate::types::{DaemonGid, RankId};
    use std::sync::Arc;

    fn p(s: &str) -> DirPath {
        DirPath::parse(s).unwrap()
    }

    #[test]
    fn test_rename_keeps_authority_and_moves_paths() {
        let ns = Namespace::shared();
        let bb = {
            let mut ns = ns.write().unwrap();
            ns.mkdir_p(&p("/a/b")).unwrap();
            ns.mkdir_p(&p("/aa/bb")).unwrap()
        };
        let (mut rank, _) = Rank::start(RankStart {
            id: RankId::ZERO,
            gid: DaemonGid::new(1),
            ns: ns.clone(),
            store: Arc::new(MemoryJournalStore::new()),
            injector: Box::new(NoopInjector),
            peers: Vec::new(),
            max_active: 1,
            config: RankConfig::default(),
        })
        .unwrap();
        rank.map.set_auth(bb, p("/aa/bb"), RankId::ZERO, 1);

        assert_eq!(rank.rename_blocker(bb).unwrap(), None);
        ns.write().unwrap().rename(&p("/aa"), &p("/a/b/aa")).unwrap();
        assert_eq!(rank.apply_rename(&p("/aa"), &p("/a/b/aa")), 1);
        assert_eq!(rank.view(), vec![(p("/a/b/aa/bb"), RankId::ZERO)]);
        assert!(rank.is_authoritative(bb).unwrap());
    }

    #[test]
    fn test_frozen_subtree_blocks_rename() {
        let ns = Namespace::shared();
        let dir = ns.write().unwrap().mkdir_p(&p("/x/y")).unwrap();
        let (mut rank, _) = Rank::start(RankStart {
            id: RankId::ZERO,
            gid: DaemonGid::new(1),
            ns: ns.clone(),
            store: Arc::new(MemoryJournalStore::new()),
            injector: Box::new(NoopInjector),
            peers: Vec::new(),
            max_active: 1,
            config: RankConfig::default(),
        })
        .unwrap();
        rank.map.set_auth(dir, p("/x/y"), RankId::ZERO, 1);
        rank.map.set_frozen(dir, true).unwrap();
        let parent = ns.read().unwrap().lookup(&p("/x")).unwrap();
        assert_eq!(rank.rename_blocker(parent).unwrap(), Some(p("/x/y")));
    }
}
