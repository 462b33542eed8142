//! Pin-driven placement.
//!
//! Each rank compares the boundaries it owns against what pin policy wants
//! and acts only on its own subtrees: splitting off directories that should
//! stay here as separate subtrees, merging boundaries that no longer serve a
//! purpose, and exporting subtrees that belong elsewhere. Boundaries under no
//! pin at all are left where they are.

use std::collections::BTreeMap;

use crate::messages::{BoundaryUpdate, RankMessage};
use crate::namespace::{read_namespace, Namespace};
use crate::pin::PinResolver;
use crate::rank::Rank;
use crate::topology::RankState;
use crate::transport::Envelope;
use crate::types::{DirId, MetaError, RankId};

#[derive(Clone, Debug, PartialEq, Eq)]
enum BalanceAction {
    Split(DirId),
    Merge(DirId),
    Export { root: DirId, dest: RankId },
}

impl Rank {
    /// Brings owned subtrees in line with pin policy.
    pub fn rebalance(&mut self) -> Result<Vec<Envelope>, MetaError> {
        if !self.is_active() {
            return Ok(Vec::new());
        }
        let handle = self.ns.clone();
        let actions = {
            let ns = read_namespace(&handle)?;
            if self.state == RankState::Stopping {
                self.plan_shedding(&ns)?
            } else {
                self.plan(&ns)?
            }
        };

        let mut out = Vec::new();
        for action in actions {
            match action {
                BalanceAction::Split(root) => out.extend(self.split_subtree(root)?),
                BalanceAction::Merge(root) => out.extend(self.merge_subtree(root)?),
                BalanceAction::Export { root, dest } => match self.start_export(root, dest) {
                    Ok(msgs) => out.extend(msgs),
                    Err(e) if e.is_kill_point() => return Err(e),
                    Err(e) => {
                        tracing::debug!(rank = %self.id, %root, %dest, error = %e, "export not started");
                        self.failed_attempts
                            .insert((root, dest), self.now + self.config.retry_backoff_ticks);
                    }
                },
            }
        }
        Ok(out)
    }

    fn plan(&self, ns: &Namespace) -> Result<Vec<BalanceAction>, MetaError> {
        let ranks = self.existing_ranks();
        let resolver = PinResolver::new(ns);
        let desired = resolver.desired_boundaries(&ranks)?;

        let mut splits = Vec::new();
        let mut merges = Vec::new();
        let mut exports = Vec::new();
        let mut claimed: Vec<DirId> = Vec::new();

        for (&dir, &target) in &desired {
            let enclosing = self.map.enclosing(ns, dir)?;
            if !enclosing.is_owned_by(self.id) || enclosing.frozen {
                continue;
            }
            if target == self.id {
                if enclosing.root != dir && self.overlapping_operation(ns, dir).is_none() {
                    splits.push(BalanceAction::Split(dir));
                }
                continue;
            }
            if self.export_blocked(ns, dir, target, &claimed) {
                continue;
            }
            claimed.push(dir);
            exports.push(BalanceAction::Export { root: dir, dest: target });
        }

        for b in self.map.owned() {
            if b.root == DirId::ROOT || b.frozen || desired.contains_key(&b.root) {
                continue;
            }
            let Some(parent) = self.map.parent_boundary(ns, b.root)? else {
                continue;
            };
            if parent.is_owned_by(self.id) {
                if self.overlapping_operation(ns, b.root).is_none()
                    && self.map.frozen_overlapping(ns, b.root).is_none()
                {
                    merges.push(BalanceAction::Merge(b.root));
                }
                continue;
            }
            if resolver.resolve_id(b.root)?.is_unpinned() {
                continue;
            }
            let target = nearest_desired(ns, &desired, b.root)?;
            if target == self.id || self.export_blocked(ns, b.root, target, &claimed) {
                continue;
            }
            claimed.push(b.root);
            exports.push(BalanceAction::Export {
                root: b.root,
                dest: target,
            });
        }

        splits.extend(merges);
        splits.extend(exports);
        Ok(splits)
    }

    /// A stopping rank hands every subtree it owns to where policy points,
    /// falling back to the parent subtree's authority and then to rank 0.
    fn plan_shedding(&self, ns: &Namespace) -> Result<Vec<BalanceAction>, MetaError> {
        let desired = PinResolver::new(ns).desired_boundaries(&self.existing_ranks())?;
        let mut actions = Vec::new();
        let mut claimed = Vec::new();
        for b in self.map.owned() {
            if b.frozen {
                continue;
            }
            let mut candidates = vec![nearest_desired(ns, &desired, b.root)?];
            if let Some(parent) = self.map.parent_boundary(ns, b.root)? {
                candidates.push(parent.auth);
            }
            candidates.push(RankId::ZERO);
            let Some(dest) = candidates.into_iter().find(|r| self.can_export_to(*r)) else {
                continue;
            };
            if self.export_blocked(ns, b.root, dest, &claimed) {
                continue;
            }
            claimed.push(b.root);
            actions.push(BalanceAction::Export { root: b.root, dest });
        }
        Ok(actions)
    }

    fn export_blocked(&self, ns: &Namespace, dir: DirId, dest: RankId, claimed: &[DirId]) -> bool {
        !self.can_export_to(dest)
            || self
                .failed_attempts
                .get(&(dir, dest))
                .map_or(false, |until| *until > self.now)
            || self.overlapping_operation(ns, dir).is_some()
            || self.map.frozen_overlapping(ns, dir).is_some()
            || claimed
                .iter()
                .any(|c| ns.is_ancestor_or_self(*c, dir) || ns.is_ancestor_or_self(dir, *c))
    }

    /// Makes `root` a subtree of its own, still owned here.
    fn split_subtree(&mut self, root: DirId) -> Result<Vec<Envelope>, MetaError> {
        let path = {
            let ns = read_namespace(&self.ns)?;
            ns.path_of(root)?
        };
        let epoch = self.map.next_epoch();
        let b = self.map.set_auth(root, path.clone(), self.id, epoch);
        b.frozen = false;
        self.trim_journal()?;
        tracing::info!(rank = %self.id, root = %path, "subtree split");
        Ok(self.announce(BoundaryUpdate {
            root,
            root_path: path,
            auth: self.id,
            epoch,
            removed: false,
        }))
    }

    /// Folds `root` back into its parent subtree.
    fn merge_subtree(&mut self, root: DirId) -> Result<Vec<Envelope>, MetaError> {
        let Some(removed) = self.map.remove(root) else {
            return Ok(Vec::new());
        };
        let epoch = self.map.next_epoch();
        self.trim_journal()?;
        tracing::info!(rank = %self.id, root = %removed.root_path, "subtree merged");
        Ok(self.announce(BoundaryUpdate {
            root,
            root_path: removed.root_path,
            auth: self.id,
            epoch,
            removed: true,
        }))
    }

    fn announce(&self, update: BoundaryUpdate) -> Vec<Envelope> {
        self.live_peers()
            .into_iter()
            .map(|r| self.envelope(r, RankMessage::SubtreeUpdate(update.clone())))
            .collect()
    }
}

/// Rank of the nearest desired boundary at or above `dir`.
fn nearest_desired(
    ns: &Namespace,
    desired: &BTreeMap<DirId, RankId>,
    dir: DirId,
) -> Result<RankId, MetaError> {
    Ok(ns
        .chain_of(dir)?
        .iter()
        .rev()
        .find_map(|d| desired.get(d).copied())
        .unwrap_or(RankId::ZERO))
}
