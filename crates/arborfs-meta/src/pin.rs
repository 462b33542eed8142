//! Pin placement directives and their resolution.
//!
//! A pin is an attribute on a directory telling the cluster which rank should
//! hold authority for it. Three attributes exist, matching the administrative
//! interface: the export pin (an integer rank, `-1` to inherit), the random
//! pin (a weight in `[0, 1]`) and the distributed pin (a boolean). Random and
//! distributed pins produce "ephemeral" placements chosen by hashing the
//! directory ID, so the choice is stable across restarts and ranks.

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::namespace::{DirPath, Namespace};
use crate::types::{DirId, MetaError, RankId};

/// Which pin attribute a value is written to or read from.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PinKind {
    /// Integer rank: `-1` inherit, `>= 0` fixed
    Export,
    /// Weight in `[0, 1]`
    Random,
    /// Boolean
    Distributed,
}

impl PinKind {
    /// Extended attribute name used by the administrative interface.
    pub fn attr_name(&self) -> &'static str {
        match self {
            PinKind::Export => "arbor.dir.pin",
            PinKind::Random => "arbor.dir.pin.random",
            PinKind::Distributed => "arbor.dir.pin.distributed",
        }
    }

    /// Parses an attribute name or short kind name.
    pub fn from_name(name: &str) -> Result<Self, MetaError> {
        match name {
            "export" | "arbor.dir.pin" => Ok(PinKind::Export),
            "random" | "arbor.dir.pin.random" => Ok(PinKind::Random),
            "distributed" | "arbor.dir.pin.distributed" => Ok(PinKind::Distributed),
            other => Err(MetaError::InvalidPin {
                kind: other.to_string(),
                value: String::new(),
                reason: "unknown pin attribute".to_string(),
            }),
        }
    }
}

impl fmt::Display for PinKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.attr_name())
    }
}

/// Placement directive stored on a directory.
#[derive(Copy, Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum PinMode {
    /// No preference; follow the parent.
    Inherit,
    /// Pin to a specific rank. Latent while that rank does not exist.
    Fixed(RankId),
    /// Each descendant is pinned with this probability to a hashed rank.
    Random(f64),
    /// Immediate children are spread across ranks by hash.
    Distributed(bool),
}

impl PinMode {
    /// True when the directory carries no directive.
    pub fn is_inherit(&self) -> bool {
        matches!(self, PinMode::Inherit | PinMode::Distributed(false))
    }

    /// The kind of attribute this mode is stored under, or None for inherit.
    pub fn kind(&self) -> Option<PinKind> {
        match self {
            PinMode::Inherit | PinMode::Distributed(false) => None,
            PinMode::Fixed(_) => Some(PinKind::Export),
            PinMode::Random(_) => Some(PinKind::Random),
            PinMode::Distributed(true) => Some(PinKind::Distributed),
        }
    }
}

/// An explicit directive as seen at a path.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DirectoryPin {
    /// Directory carrying the pin
    pub path: DirPath,
    /// Directive
    pub mode: PinMode,
}

/// Parses an administrative pin value for the given attribute.
///
/// Export pins below `-1` clamp to inherit. Ranks at or above `max_ranks`
/// are refused; ranks that merely do not exist yet are accepted.
pub fn parse_pin(kind: PinKind, value: &str, max_ranks: u32) -> Result<PinMode, MetaError> {
    let value = value.trim();
    let invalid = |reason: &str| MetaError::InvalidPin {
        kind: kind.attr_name().to_string(),
        value: value.to_string(),
        reason: reason.to_string(),
    };

    match kind {
        PinKind::Export => {
            let rank: i64 = value.parse().map_err(|_| invalid("expected an integer rank"))?;
            if rank < 0 {
                Ok(PinMode::Inherit)
            } else if rank >= max_ranks as i64 {
                Err(MetaError::NoSuchRank(rank))
            } else {
                Ok(PinMode::Fixed(RankId::new(rank as u32)))
            }
        }
        PinKind::Random => {
            let weight: f64 = value.parse().map_err(|_| invalid("expected a number"))?;
            if !weight.is_finite() || !(0.0..=1.0).contains(&weight) {
                return Err(invalid("weight must be within [0, 1]"));
            }
            if weight == 0.0 {
                Ok(PinMode::Inherit)
            } else {
                Ok(PinMode::Random(weight))
            }
        }
        PinKind::Distributed => match value {
            "1" | "true" => Ok(PinMode::Distributed(true)),
            "0" | "false" => Ok(PinMode::Inherit),
            _ => Err(invalid("expected 0, 1, true or false")),
        },
    }
}

/// Combines a newly written attribute with the directory's current directive.
///
/// Clearing one attribute does not clear a directive stored under another.
pub fn apply_pin(current: PinMode, kind: PinKind, new: PinMode) -> PinMode {
    if new.is_inherit() && current.kind() != Some(kind) {
        current
    } else {
        new
    }
}

/// Encodes a directive as the value of the given attribute.
pub fn format_pin(mode: PinMode, kind: PinKind) -> String {
    match (kind, mode) {
        (PinKind::Export, PinMode::Fixed(r)) => r.to_string(),
        (PinKind::Export, _) => "-1".to_string(),
        (PinKind::Random, PinMode::Random(w)) => w.to_string(),
        (PinKind::Random, _) => "0".to_string(),
        (PinKind::Distributed, PinMode::Distributed(true)) => "1".to_string(),
        (PinKind::Distributed, _) => "0".to_string(),
    }
}

/// Result of resolving a path: the nearest explicit directive, if any.
#[derive(Clone, Debug, PartialEq)]
pub struct EffectivePin {
    /// Directory the directive came from, None when nothing was found
    pub source: Option<DirId>,
    /// Directive in effect (Inherit when nothing was found)
    pub mode: PinMode,
}

impl EffectivePin {
    /// True when no ancestor carries a directive.
    pub fn is_unpinned(&self) -> bool {
        self.source.is_none()
    }

    /// The rank of a fixed directive.
    pub fn fixed_rank(&self) -> Option<RankId> {
        match self.mode {
            PinMode::Fixed(r) => Some(r),
            _ => None,
        }
    }
}

fn dir_hash(id: DirId) -> u64 {
    let digest = blake3::hash(&id.as_u64().to_le_bytes());
    let mut buf = [0u8; 8];
    buf.copy_from_slice(&digest.as_bytes()[..8]);
    u64::from_le_bytes(buf)
}

/// Deterministic rank choice for an ephemerally pinned directory.
pub fn hashed_rank(id: DirId, ranks: &[RankId]) -> Option<RankId> {
    if ranks.is_empty() {
        return None;
    }
    Some(ranks[(dir_hash(id) % ranks.len() as u64) as usize])
}

/// Deterministic value in `[0, 1)` used to sample random pins.
pub fn hash_fraction(id: DirId) -> f64 {
    (dir_hash(id) >> 11) as f64 / (1u64 << 53) as f64
}

/// Walks the namespace to answer placement questions.
pub struct PinResolver<'a> {
    ns: &'a Namespace,
}

impl<'a> PinResolver<'a> {
    /// Creates a resolver over a namespace snapshot.
    pub fn new(ns: &'a Namespace) -> Self {
        Self { ns }
    }

    /// Returns the directive stored directly on `path`.
    pub fn get(&self, path: &DirPath) -> Result<DirectoryPin, MetaError> {
        let id = self.ns.lookup(path)?;
        Ok(DirectoryPin {
            path: path.clone(),
            mode: self.ns.pin(id)?,
        })
    }

    /// Nearest ancestor (inclusive) of `path` carrying a directive.
    pub fn resolve(&self, path: &DirPath) -> Result<EffectivePin, MetaError> {
        let id = self.ns.lookup(path)?;
        self.resolve_id(id)
    }

    /// Nearest ancestor (inclusive) of `id` carrying a directive.
    pub fn resolve_id(&self, id: DirId) -> Result<EffectivePin, MetaError> {
        for dir in self.ns.chain_of(id)?.into_iter().rev() {
            let mode = self.ns.pin(dir)?;
            if !mode.is_inherit() {
                return Ok(EffectivePin {
                    source: Some(dir),
                    mode,
                });
            }
        }
        Ok(EffectivePin {
            source: None,
            mode: PinMode::Inherit,
        })
    }

    /// Every directory that should be a subtree root under current policy,
    /// with the rank it should belong to.
    ///
    /// The root always maps to rank 0 unless pinned elsewhere. Explicit pins
    /// win over ephemeral placements; fixed pins naming ranks outside
    /// `ranks` are latent and produce no entry.
    pub fn desired_boundaries(
        &self,
        ranks: &BTreeSet<RankId>,
    ) -> Result<BTreeMap<DirId, RankId>, MetaError> {
        let rank_list: Vec<RankId> = ranks.iter().copied().collect();
        let mut desired = BTreeMap::new();
        desired.insert(DirId::ROOT, RankId::ZERO);

        let pinned = self.ns.pinned();
        for (dir, mode) in &pinned {
            match mode {
                PinMode::Distributed(true) => {
                    for child in self.ns.children(*dir)? {
                        if !self.ns.pin(child)?.is_inherit() {
                            continue;
                        }
                        if let Some(rank) = hashed_rank(child, &rank_list) {
                            desired.insert(child, rank);
                        }
                    }
                }
                PinMode::Random(weight) => {
                    let mut queue: VecDeque<DirId> = self.ns.children(*dir)?.into();
                    while let Some(d) = queue.pop_front() {
                        if !self.ns.pin(d)?.is_inherit() {
                            continue;
                        }
                        if hash_fraction(d) < *weight {
                            if let Some(rank) = hashed_rank(d, &rank_list) {
                                desired.insert(d, rank);
                            }
                        }
                        queue.extend(self.ns.children(d)?);
                    }
                }
                _ => {}
            }
        }

        for (dir, mode) in &pinned {
            if let PinMode::Fixed(rank) = mode {
                if ranks.contains(rank) {
                    desired.insert(*dir, *rank);
                }
            }
        }

        Ok(desired)
    }

    /// Rank that policy assigns to `path`: the nearest desired boundary at or above it.
    pub fn target_rank(
        &self,
        path: &DirPath,
        ranks: &BTreeSet<RankId>,
    ) -> Result<RankId, MetaError> {
        let desired = self.desired_boundaries(ranks)?;
        let chain = self.ns.chain(path)?;
        Ok(chain
            .iter()
            .rev()
            .find_map(|d| desired.get(d).copied())
            .unwrap_or(RankId::ZERO))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn p(s: &str) -> DirPath {
        DirPath::parse(s).unwrap()
    }

    fn ranks(n: u32) -> BTreeSet<RankId> {
        (0..n).map(RankId::new).collect()
    }

    #[test]
    fn test_parse_export_pin() {
        assert_eq!(parse_pin(PinKind::Export, "-1", 256).unwrap(), PinMode::Inherit);
        assert_eq!(
            parse_pin(PinKind::Export, "-2341", 256).unwrap(),
            PinMode::Inherit
        );
        assert_eq!(
            parse_pin(PinKind::Export, "2", 256).unwrap(),
            PinMode::Fixed(RankId::new(2))
        );
        assert!(matches!(
            parse_pin(PinKind::Export, "abc", 256),
            Err(MetaError::InvalidPin { .. })
        ));
        assert!(matches!(
            parse_pin(PinKind::Export, "1.5", 256),
            Err(MetaError::InvalidPin { .. })
        ));
        assert!(matches!(
            parse_pin(PinKind::Export, "300", 256),
            Err(MetaError::NoSuchRank(300))
        ));
    }

    #[test]
    fn test_parse_random_pin() {
        assert_eq!(
            parse_pin(PinKind::Random, "0.25", 256).unwrap(),
            PinMode::Random(0.25)
        );
        assert_eq!(parse_pin(PinKind::Random, "0", 256).unwrap(), PinMode::Inherit);
        assert!(parse_pin(PinKind::Random, "1.5", 256).is_err());
        assert!(parse_pin(PinKind::Random, "-0.1", 256).is_err());
        assert!(parse_pin(PinKind::Random, "NaN", 256).is_err());
    }

    #[test]
    fn test_parse_distributed_pin() {
        assert_eq!(
            parse_pin(PinKind::Distributed, "1", 256).unwrap(),
            PinMode::Distributed(true)
        );
        assert_eq!(
            parse_pin(PinKind::Distributed, "false", 256).unwrap(),
            PinMode::Inherit
        );
        assert!(parse_pin(PinKind::Distributed, "yes", 256).is_err());
    }

    #[test]
    fn test_format_round_trips_attribute_values() {
        assert_eq!(format_pin(PinMode::Fixed(RankId::new(1)), PinKind::Export), "1");
        assert_eq!(format_pin(PinMode::Inherit, PinKind::Export), "-1");
        assert_eq!(format_pin(PinMode::Random(0.5), PinKind::Random), "0.5");
        assert_eq!(format_pin(PinMode::Random(0.5), PinKind::Export), "-1");
        assert_eq!(
            format_pin(PinMode::Distributed(true), PinKind::Distributed),
            "1"
        );
    }

    #[test]
    fn test_clearing_other_attribute_keeps_directive() {
        let current = PinMode::Random(0.3);
        assert_eq!(
            apply_pin(current, PinKind::Export, PinMode::Inherit),
            PinMode::Random(0.3)
        );
        assert_eq!(
            apply_pin(current, PinKind::Random, PinMode::Inherit),
            PinMode::Inherit
        );
        assert_eq!(
            apply_pin(current, PinKind::Export, PinMode::Fixed(RankId::new(1))),
            PinMode::Fixed(RankId::new(1))
        );
    }

    #[test]
    fn test_resolve_walks_to_nearest_pin() {
        let mut ns = Namespace::new();
        ns.mkdir_p(&p("/1/2/3")).unwrap();
        let d1 = ns.lookup(&p("/1")).unwrap();
        ns.set_pin(d1, PinMode::Fixed(RankId::new(1))).unwrap();

        let resolver = PinResolver::new(&ns);
        let eff = resolver.resolve(&p("/1/2/3")).unwrap();
        assert_eq!(eff.source, Some(d1));
        assert_eq!(eff.fixed_rank(), Some(RankId::new(1)));

        let root = resolver.resolve(&DirPath::root()).unwrap();
        assert!(root.is_unpinned());
    }

    #[test]
    fn test_descendant_fixed_pin_wins() {
        let mut ns = Namespace::new();
        ns.mkdir_p(&p("/1/2/3")).unwrap();
        let d1 = ns.lookup(&p("/1")).unwrap();
        let d2 = ns.lookup(&p("/1/2")).unwrap();
        ns.set_pin(d1, PinMode::Fixed(RankId::new(1))).unwrap();
        ns.set_pin(d2, PinMode::Fixed(RankId::new(0))).unwrap();

        let resolver = PinResolver::new(&ns);
        assert_eq!(
            resolver.resolve(&p("/1/2/3")).unwrap().fixed_rank(),
            Some(RankId::new(0))
        );
        assert_eq!(
            resolver.target_rank(&p("/1/2/3"), &ranks(2)).unwrap(),
            RankId::new(0)
        );
        assert_eq!(
            resolver.target_rank(&p("/1"), &ranks(2)).unwrap(),
            RankId::new(1)
        );
    }

    #[test]
    fn test_latent_pin_produces_no_boundary() {
        let mut ns = Namespace::new();
        let d = ns.mkdir_p(&p("/1/2/3")).unwrap();
        ns.set_pin(d, PinMode::Fixed(RankId::new(2))).unwrap();

        let resolver = PinResolver::new(&ns);
        let desired = resolver.desired_boundaries(&ranks(2)).unwrap();
        assert!(!desired.contains_key(&d));
        assert_eq!(desired.get(&DirId::ROOT), Some(&RankId::ZERO));

        let desired = resolver.desired_boundaries(&ranks(3)).unwrap();
        assert_eq!(desired.get(&d), Some(&RankId::new(2)));
    }

    #[test]
    fn test_distributed_pin_spreads_children() {
        let mut ns = Namespace::new();
        let top = ns.mkdir_p(&p("/home")).unwrap();
        for i in 0..16 {
            ns.mkdir_p(&p(&format!("/home/u{}", i))).unwrap();
        }
        let pinned_child = ns.lookup(&p("/home/u0")).unwrap();
        ns.set_pin(pinned_child, PinMode::Fixed(RankId::new(1))).unwrap();
        ns.set_pin(top, PinMode::Distributed(true)).unwrap();

        let resolver = PinResolver::new(&ns);
        let desired = resolver.desired_boundaries(&ranks(2)).unwrap();
        // 15 ephemeral children, one explicit child, plus the root
        assert_eq!(desired.len(), 17);
        assert_eq!(desired.get(&pinned_child), Some(&RankId::new(1)));
        assert!(!desired.contains_key(&top));
        let used: BTreeSet<RankId> = desired.values().copied().collect();
        assert_eq!(used.len(), 2);
    }

    #[test]
    fn test_random_pin_weight_bounds() {
        let mut ns = Namespace::new();
        let top = ns.mkdir_p(&p("/scratch")).unwrap();
        for i in 0..20 {
            ns.mkdir_p(&p(&format!("/scratch/d{}", i))).unwrap();
        }

        ns.set_pin(top, PinMode::Random(1.0)).unwrap();
        let all = PinResolver::new(&ns).desired_boundaries(&ranks(2)).unwrap();
        assert_eq!(all.len(), 21);

        ns.set_pin(top, PinMode::Random(1e-12)).unwrap();
        let none = PinResolver::new(&ns).desired_boundaries(&ranks(2)).unwrap();
        assert_eq!(none.len(), 1);
    }

    #[test]
    fn test_hashing_is_stable() {
        let ranks = vec![RankId::new(0), RankId::new(1), RankId::new(2)];
        let id = DirId::new(77);
        assert_eq!(hashed_rank(id, &ranks), hashed_rank(id, &ranks));
        assert!(hashed_rank(id, &[]).is_none());
        let f = hash_fraction(id);
        assert!((0.0..1.0).contains(&f));
    }
}
