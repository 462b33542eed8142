//! Shared directory tree.
//!
//! The namespace is the directory metadata every rank reads: names, parent
//! links and the pin attribute of each directory. Directories are addressed
//! by a stable [`DirId`] so that subtree boundaries and migration records
//! survive renames; [`DirPath`] is the human-facing form.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::fmt;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use serde::{Deserialize, Serialize};

use crate::pin::PinMode;
use crate::types::{DirId, MetaError};

/// Namespace handle shared between the ranks of one process.
pub type SharedNamespace = Arc<RwLock<Namespace>>;

/// Takes the shared namespace for reading.
pub fn read_namespace(ns: &SharedNamespace) -> Result<RwLockReadGuard<'_, Namespace>, MetaError> {
    ns.read().map_err(|e| MetaError::LockPoisoned(e.to_string()))
}

/// Takes the shared namespace for writing.
pub fn write_namespace(ns: &SharedNamespace) -> Result<RwLockWriteGuard<'_, Namespace>, MetaError> {
    ns.write().map_err(|e| MetaError::LockPoisoned(e.to_string()))
}

/// A normalized absolute directory path (`/`, `/a`, `/a/b`).
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DirPath(String);

impl DirPath {
    /// The namespace root.
    pub fn root() -> Self {
        DirPath("/".to_string())
    }

    /// Parses and normalizes a path. Relative paths are taken from the root;
    /// `.` components are dropped and `..` is rejected.
    pub fn parse(path: &str) -> Result<Self, MetaError> {
        let mut components = Vec::new();
        for component in path.split('/') {
            match component {
                "" | "." => continue,
                ".." => {
                    return Err(MetaError::InvalidPath {
                        path: path.to_string(),
                        reason: "'..' is not allowed".to_string(),
                    })
                }
                name => components.push(name),
            }
        }
        Ok(Self::from_components(&components))
    }

    fn from_components<S: AsRef<str>>(components: &[S]) -> Self {
        if components.is_empty() {
            return Self::root();
        }
        let mut path = String::new();
        for c in components {
            path.push('/');
            path.push_str(c.as_ref());
        }
        DirPath(path)
    }

    /// Returns the path as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Returns true for `/`.
    pub fn is_root(&self) -> bool {
        self.0 == "/"
    }

    /// Path components from the root down.
    pub fn components(&self) -> Vec<&str> {
        self.0.split('/').filter(|c| !c.is_empty()).collect()
    }

    /// Final component, or None for the root.
    pub fn file_name(&self) -> Option<&str> {
        self.components().last().copied()
    }

    /// Parent path, or None for the root.
    pub fn parent(&self) -> Option<DirPath> {
        if self.is_root() {
            return None;
        }
        let components = self.components();
        Some(Self::from_components(&components[..components.len() - 1]))
    }

    /// Appends one component.
    pub fn join(&self, name: &str) -> DirPath {
        if self.is_root() {
            DirPath(format!("/{}", name))
        } else {
            DirPath(format!("{}/{}", self.0, name))
        }
    }

    /// True if `self` equals `ancestor` or lies below it (component-wise).
    pub fn starts_with(&self, ancestor: &DirPath) -> bool {
        if ancestor.is_root() {
            return true;
        }
        self.0 == ancestor.0
            || (self.0.starts_with(&ancestor.0) && self.0.as_bytes()[ancestor.0.len()] == b'/')
    }

    /// Moves this path from under `from` to under `to`. Returns None when
    /// `self` is not at or below `from`.
    pub fn rebase(&self, from: &DirPath, to: &DirPath) -> Option<DirPath> {
        if !self.starts_with(from) {
            return None;
        }
        let suffix = &self.components()[from.components().len()..];
        let mut rebased = to.clone();
        for c in suffix {
            rebased = rebased.join(c);
        }
        Some(rebased)
    }
}

impl fmt::Display for DirPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Clone, Debug)]
struct DirNode {
    parent: Option<DirId>,
    name: String,
    pin: PinMode,
    children: BTreeMap<String, DirId>,
}

/// The directory tree with per-directory pin attributes.
pub struct Namespace {
    dirs: HashMap<DirId, DirNode>,
    next_id: u64,
}

impl Default for Namespace {
    fn default() -> Self {
        Self::new()
    }
}

impl Namespace {
    /// Creates a namespace containing only the root directory.
    pub fn new() -> Self {
        let mut dirs = HashMap::new();
        dirs.insert(
            DirId::ROOT,
            DirNode {
                parent: None,
                name: String::new(),
                pin: PinMode::Inherit,
                children: BTreeMap::new(),
            },
        );
        Self {
            dirs,
            next_id: DirId::ROOT.as_u64() + 1,
        }
    }

    /// Wraps a fresh namespace for sharing.
    pub fn shared() -> SharedNamespace {
        Arc::new(RwLock::new(Self::new()))
    }

    /// Number of directories, root included.
    pub fn len(&self) -> usize {
        self.dirs.len()
    }

    /// Always false: the root cannot be removed.
    pub fn is_empty(&self) -> bool {
        self.dirs.is_empty()
    }

    /// Returns true if the directory exists.
    pub fn contains(&self, id: DirId) -> bool {
        self.dirs.contains_key(&id)
    }

    /// Resolves a path to its directory ID.
    pub fn lookup(&self, path: &DirPath) -> Result<DirId, MetaError> {
        let mut current = DirId::ROOT;
        for component in path.components() {
            let node = self.node(current)?;
            current = *node
                .children
                .get(component)
                .ok_or_else(|| MetaError::NotFound(path.to_string()))?;
        }
        Ok(current)
    }

    /// Directory IDs from the root down to `path` inclusive.
    pub fn chain(&self, path: &DirPath) -> Result<Vec<DirId>, MetaError> {
        let id = self.lookup(path)?;
        self.chain_of(id)
    }

    /// Directory IDs from the root down to `id` inclusive.
    pub fn chain_of(&self, id: DirId) -> Result<Vec<DirId>, MetaError> {
        let mut chain = Vec::new();
        let mut current = Some(id);
        while let Some(dir) = current {
            chain.push(dir);
            current = self.node(dir)?.parent;
        }
        chain.reverse();
        Ok(chain)
    }

    /// Rebuilds the path of a directory from its parent links.
    pub fn path_of(&self, id: DirId) -> Result<DirPath, MetaError> {
        let chain = self.chain_of(id)?;
        let mut names = Vec::with_capacity(chain.len());
        for dir in chain.iter().skip(1) {
            names.push(self.node(*dir)?.name.clone());
        }
        Ok(DirPath::from_components(&names))
    }

    /// Parent directory, or None for the root.
    pub fn parent_of(&self, id: DirId) -> Result<Option<DirId>, MetaError> {
        Ok(self.node(id)?.parent)
    }

    /// True if `ancestor` is `id` or one of its ancestors.
    pub fn is_ancestor_or_self(&self, ancestor: DirId, id: DirId) -> bool {
        let mut current = Some(id);
        while let Some(dir) = current {
            if dir == ancestor {
                return true;
            }
            current = self.dirs.get(&dir).and_then(|n| n.parent);
        }
        false
    }

    /// Immediate children, sorted by name.
    pub fn children(&self, id: DirId) -> Result<Vec<DirId>, MetaError> {
        Ok(self.node(id)?.children.values().copied().collect())
    }

    /// All descendants of `id` (excluding `id`) in breadth-first order.
    pub fn descendants(&self, id: DirId) -> Result<Vec<DirId>, MetaError> {
        let mut out = Vec::new();
        let mut queue: VecDeque<DirId> = self.children(id)?.into();
        while let Some(dir) = queue.pop_front() {
            out.push(dir);
            queue.extend(self.node(dir)?.children.values().copied());
        }
        Ok(out)
    }

    /// Creates a single directory; the parent must exist.
    pub fn mkdir(&mut self, path: &DirPath) -> Result<DirId, MetaError> {
        let parent_path = path.parent().ok_or_else(|| MetaError::AlreadyExists("/".into()))?;
        let name = path
            .file_name()
            .ok_or_else(|| MetaError::AlreadyExists("/".into()))?
            .to_string();
        let parent = self.lookup(&parent_path)?;
        if self.node(parent)?.children.contains_key(&name) {
            return Err(MetaError::AlreadyExists(path.to_string()));
        }
        Ok(self.insert_child(parent, name))
    }

    /// Creates a directory and any missing ancestors. Existing directories are kept.
    pub fn mkdir_p(&mut self, path: &DirPath) -> Result<DirId, MetaError> {
        let mut current = DirId::ROOT;
        for component in path.components() {
            let existing = self.node(current)?.children.get(component).copied();
            current = match existing {
                Some(id) => id,
                None => self.insert_child(current, component.to_string()),
            };
        }
        Ok(current)
    }

    fn insert_child(&mut self, parent: DirId, name: String) -> DirId {
        let id = DirId::new(self.next_id);
        self.next_id += 1;
        self.dirs.insert(
            id,
            DirNode {
                parent: Some(parent),
                name: name.clone(),
                pin: PinMode::Inherit,
                children: BTreeMap::new(),
            },
        );
        if let Some(p) = self.dirs.get_mut(&parent) {
            p.children.insert(name, id);
        }
        id
    }

    /// Moves a directory (with its whole subtree and pins) to a new path.
    ///
    /// `to` must not exist, its parent must exist, and it may not lie inside `from`.
    pub fn rename(&mut self, from: &DirPath, to: &DirPath) -> Result<DirId, MetaError> {
        if from.is_root() {
            return Err(MetaError::InvalidPath {
                path: from.to_string(),
                reason: "cannot rename the root".to_string(),
            });
        }
        if to.starts_with(from) {
            return Err(MetaError::InvalidPath {
                path: to.to_string(),
                reason: format!("destination lies inside '{}'", from),
            });
        }
        let id = self.lookup(from)?;
        if self.lookup(to).is_ok() {
            return Err(MetaError::AlreadyExists(to.to_string()));
        }
        let new_parent_path = to
            .parent()
            .ok_or_else(|| MetaError::AlreadyExists("/".into()))?;
        let new_parent = self.lookup(&new_parent_path)?;
        let new_name = to
            .file_name()
            .ok_or_else(|| MetaError::AlreadyExists("/".into()))?
            .to_string();

        let (old_parent, old_name) = {
            let node = self.node(id)?;
            (node.parent, node.name.clone())
        };
        if let Some(op) = old_parent.and_then(|p| self.dirs.get_mut(&p)) {
            op.children.remove(&old_name);
        }
        if let Some(np) = self.dirs.get_mut(&new_parent) {
            np.children.insert(new_name.clone(), id);
        }
        if let Some(node) = self.dirs.get_mut(&id) {
            node.parent = Some(new_parent);
            node.name = new_name;
        }
        Ok(id)
    }

    /// Returns the pin attribute stored on a directory.
    pub fn pin(&self, id: DirId) -> Result<PinMode, MetaError> {
        Ok(self.node(id)?.pin)
    }

    /// Replaces the pin attribute stored on a directory.
    pub fn set_pin(&mut self, id: DirId, pin: PinMode) -> Result<(), MetaError> {
        let node = self
            .dirs
            .get_mut(&id)
            .ok_or_else(|| MetaError::NotFound(id.to_string()))?;
        node.pin = pin;
        Ok(())
    }

    /// All directories carrying a non-inherit pin.
    pub fn pinned(&self) -> Vec<(DirId, PinMode)> {
        let mut pinned: Vec<_> = self
            .dirs
            .iter()
            .filter(|(_, n)| !n.pin.is_inherit())
            .map(|(id, n)| (*id, n.pin))
            .collect();
        pinned.sort_by_key(|(id, _)| *id);
        pinned
    }

    fn node(&self, id: DirId) -> Result<&DirNode, MetaError> {
        self.dirs
            .get(&id)
            .ok_or_else(|| MetaError::NotFound(id.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::RankId;

    fn p(s: &str) -> DirPath {
        DirPath::parse(s).unwrap()
    }

    #[test]
    fn test_parse_normalizes() {
        assert_eq!(p("a//b/").as_str(), "/a/b");
        assert_eq!(p("/").as_str(), "/");
        assert_eq!(p("").as_str(), "/");
        assert_eq!(p("/a/./b").as_str(), "/a/b");
        assert!(DirPath::parse("/a/../b").is_err());
    }

    #[test]
    fn test_parent_and_join() {
        assert_eq!(p("/a/b").parent(), Some(p("/a")));
        assert_eq!(p("/a").parent(), Some(DirPath::root()));
        assert_eq!(DirPath::root().parent(), None);
        assert_eq!(DirPath::root().join("x"), p("/x"));
        assert_eq!(p("/x").join("y"), p("/x/y"));
    }

    #[test]
    fn test_starts_with_is_component_wise() {
        assert!(p("/a/b").starts_with(&p("/a")));
        assert!(p("/a").starts_with(&p("/a")));
        assert!(!p("/aa").starts_with(&p("/a")));
        assert!(p("/anything").starts_with(&DirPath::root()));
    }

    #[test]
    fn test_rebase() {
        assert_eq!(
            p("/aa/bb").rebase(&p("/aa"), &p("/a/b/aa")),
            Some(p("/a/b/aa/bb"))
        );
        assert_eq!(p("/aa").rebase(&p("/aa"), &p("/z")), Some(p("/z")));
        assert_eq!(p("/x").rebase(&p("/aa"), &p("/z")), None);
    }

    #[test]
    fn test_mkdir_p_and_lookup() {
        let mut ns = Namespace::new();
        let id = ns.mkdir_p(&p("/1/2/3")).unwrap();
        assert_eq!(ns.lookup(&p("/1/2/3")).unwrap(), id);
        assert_eq!(ns.path_of(id).unwrap(), p("/1/2/3"));
        assert_eq!(ns.len(), 4);
        // idempotent
        assert_eq!(ns.mkdir_p(&p("/1/2/3")).unwrap(), id);
        assert_eq!(ns.len(), 4);
    }

    #[test]
    fn test_mkdir_requires_parent() {
        let mut ns = Namespace::new();
        assert!(matches!(ns.mkdir(&p("/a/b")), Err(MetaError::NotFound(_))));
        ns.mkdir(&p("/a")).unwrap();
        assert!(matches!(ns.mkdir(&p("/a")), Err(MetaError::AlreadyExists(_))));
    }

    #[test]
    fn test_chain_is_root_first() {
        let mut ns = Namespace::new();
        let b = ns.mkdir_p(&p("/a/b")).unwrap();
        let a = ns.lookup(&p("/a")).unwrap();
        assert_eq!(ns.chain_of(b).unwrap(), vec![DirId::ROOT, a, b]);
    }

    #[test]
    fn test_rename_moves_subtree_and_pin() {
        let mut ns = Namespace::new();
        ns.mkdir_p(&p("/a/b")).unwrap();
        let bb = ns.mkdir_p(&p("/aa/bb")).unwrap();
        ns.set_pin(bb, PinMode::Fixed(RankId::new(0))).unwrap();

        let aa = ns.rename(&p("/aa"), &p("/a/b/aa")).unwrap();
        assert_eq!(ns.path_of(aa).unwrap(), p("/a/b/aa"));
        assert_eq!(ns.path_of(bb).unwrap(), p("/a/b/aa/bb"));
        assert_eq!(ns.pin(bb).unwrap(), PinMode::Fixed(RankId::new(0)));
        assert!(ns.lookup(&p("/aa")).is_err());
    }

    #[test]
    fn test_rename_rejects_into_self_and_existing() {
        let mut ns = Namespace::new();
        ns.mkdir_p(&p("/a/b")).unwrap();
        ns.mkdir_p(&p("/c")).unwrap();
        assert!(ns.rename(&p("/a"), &p("/a/b/x")).is_err());
        assert!(matches!(
            ns.rename(&p("/a"), &p("/c")),
            Err(MetaError::AlreadyExists(_))
        ));
        assert!(ns.rename(&DirPath::root(), &p("/z")).is_err());
    }

    #[test]
    fn test_descendants_and_ancestry() {
        let mut ns = Namespace::new();
        let c = ns.mkdir_p(&p("/a/b/c")).unwrap();
        let a = ns.lookup(&p("/a")).unwrap();
        assert_eq!(ns.descendants(a).unwrap().len(), 2);
        assert!(ns.is_ancestor_or_self(a, c));
        assert!(ns.is_ancestor_or_self(c, c));
        assert!(!ns.is_ancestor_or_self(c, a));
    }

    #[test]
    fn test_pinned_lists_only_explicit() {
        let mut ns = Namespace::new();
        let a = ns.mkdir_p(&p("/a")).unwrap();
        ns.mkdir_p(&p("/b")).unwrap();
        ns.set_pin(a, PinMode::Fixed(RankId::new(1))).unwrap();
        assert_eq!(ns.pinned(), vec![(a, PinMode::Fixed(RankId::new(1)))]);
    }
}
