//! The constraint language shared with the solver: derived type variables, subtype constraints,
//! and the per-function constraint sets that make up a solver [`Program`].
//!
//! The textual form is `lower ⊑ upper`, where each side is a base identifier followed by
//! `.`-separated access-path labels (`in_<i>`, `out`, `load`, `store`, `σ<size>@<offset>`).
//! [`std::fmt::Display`] and [`std::str::FromStr`] round-trip through that form.

use crate::error::{Error, Result};
use crate::lattice::Lattice;
use std::collections::{BTreeMap, BTreeSet};
use std::str::FromStr;

/// The subtyping symbol used between the two sides of a constraint.
pub const SUBTYPE_SYMBOL: char = '⊑';

/// One segment of an access path.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, PartialOrd, Ord)]
pub enum AccessPathLabel {
    /// The i-th argument of a function
    In(usize),
    /// The return value of a function
    Out,
    /// The value was read through the pointer
    Load,
    /// The value was written through the pointer
    Store,
    /// A memory access of `size` bytes at `offset` from the pointer's target
    Deref { size: usize, offset: i64 },
}

impl std::fmt::Display for AccessPathLabel {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            AccessPathLabel::In(i) => write!(f, "in_{}", i),
            AccessPathLabel::Out => write!(f, "out"),
            AccessPathLabel::Load => write!(f, "load"),
            AccessPathLabel::Store => write!(f, "store"),
            AccessPathLabel::Deref { size, offset } => write!(f, "σ{}@{}", size, offset),
        }
    }
}

impl FromStr for AccessPathLabel {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, String> {
        match s {
            "out" => return Ok(AccessPathLabel::Out),
            "load" => return Ok(AccessPathLabel::Load),
            "store" => return Ok(AccessPathLabel::Store),
            _ => {}
        }
        if let Some(idx) = s.strip_prefix("in_") {
            return idx
                .parse()
                .map(AccessPathLabel::In)
                .map_err(|_| format!("bad argument index in label `{}`", s));
        }
        if let Some(deref) = s.strip_prefix('σ') {
            let (size, offset) = deref
                .split_once('@')
                .ok_or_else(|| format!("dereference label `{}` lacks an offset", s))?;
            let size = size
                .parse()
                .map_err(|_| format!("bad dereference size in label `{}`", s))?;
            let offset = offset
                .parse()
                .map_err(|_| format!("bad dereference offset in label `{}`", s))?;
            return Ok(AccessPathLabel::Deref { size, offset });
        }
        Err(format!("unknown access path label `{}`", s))
    }
}

/// A base identifier plus an access path. Immutable: deriving a deeper variable produces a new
/// value.
#[derive(Clone, PartialEq, Eq, Hash, Debug, PartialOrd, Ord)]
pub struct DerivedTypeVariable {
    base: String,
    path: Vec<AccessPathLabel>,
}

impl DerivedTypeVariable {
    /// A variable with an empty access path
    pub fn new(base: impl Into<String>) -> Self {
        Self {
            base: base.into(),
            path: vec![],
        }
    }

    pub fn base(&self) -> &str {
        &self.base
    }

    pub fn path(&self) -> &[AccessPathLabel] {
        &self.path
    }

    /// `true` if the path is empty, i.e., this names a function or lattice atom directly
    pub fn is_base(&self) -> bool {
        self.path.is_empty()
    }

    /// A new variable with `label` appended to the access path
    #[must_use]
    pub fn add_suffix(&self, label: AccessPathLabel) -> Self {
        let mut path = self.path.clone();
        path.push(label);
        Self {
            base: self.base.clone(),
            path,
        }
    }

    /// The variable with the last label dropped, if there is one
    pub fn largest_prefix(&self) -> Option<Self> {
        let (_, prefix) = self.path.split_last()?;
        Some(Self {
            base: self.base.clone(),
            path: prefix.to_vec(),
        })
    }

    /// The last label of the access path
    pub fn tail(&self) -> Option<AccessPathLabel> {
        self.path.last().copied()
    }

    /// `true` if `self` is a strict prefix of `other`
    pub fn is_prefix_of(&self, other: &Self) -> bool {
        self.base == other.base
            && self.path.len() < other.path.len()
            && other.path.starts_with(&self.path)
    }
}

impl std::fmt::Display for DerivedTypeVariable {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{}", self.base)?;
        for label in &self.path {
            write!(f, ".{}", label)?;
        }
        Ok(())
    }
}

impl FromStr for DerivedTypeVariable {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, String> {
        let s = s.trim();
        let mut parts = s.split('.');
        let base = parts.next().unwrap_or_default();
        if base.is_empty() || base.contains(char::is_whitespace) {
            return Err(format!("bad base identifier in `{}`", s));
        }
        let path = parts.map(str::parse).collect::<std::result::Result<_, _>>()?;
        Ok(Self {
            base: base.to_owned(),
            path,
        })
    }
}

/// `lower` is a subtype of `upper`
#[derive(Clone, PartialEq, Eq, Hash, Debug, PartialOrd, Ord)]
pub struct SubtypeConstraint {
    pub lower: DerivedTypeVariable,
    pub upper: DerivedTypeVariable,
}

impl SubtypeConstraint {
    pub fn new(lower: DerivedTypeVariable, upper: DerivedTypeVariable) -> Self {
        Self { lower, upper }
    }
}

impl std::fmt::Display for SubtypeConstraint {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{} {} {}", self.lower, SUBTYPE_SYMBOL, self.upper)
    }
}

impl FromStr for SubtypeConstraint {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let malformed = |reason: String| Error::MalformedConstraint {
            text: s.to_owned(),
            reason,
        };
        let (lower, upper) = s
            .split_once(SUBTYPE_SYMBOL)
            .ok_or_else(|| malformed(format!("missing `{}`", SUBTYPE_SYMBOL)))?;
        if upper.contains(SUBTYPE_SYMBOL) {
            return Err(malformed(format!("more than one `{}`", SUBTYPE_SYMBOL)));
        }
        Ok(Self {
            lower: lower.parse().map_err(malformed)?,
            upper: upper.parse().map_err(malformed)?,
        })
    }
}

/// The subtype constraints of a single function. Duplicates collapse.
#[derive(Clone, PartialEq, Eq, Debug, Default)]
pub struct ConstraintSet {
    subtype: BTreeSet<SubtypeConstraint>,
}

impl ConstraintSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a constraint, returning `false` if it was already present
    pub fn add(&mut self, constraint: SubtypeConstraint) -> bool {
        self.subtype.insert(constraint)
    }

    pub fn contains(&self, constraint: &SubtypeConstraint) -> bool {
        self.subtype.contains(constraint)
    }

    pub fn iter(&self) -> impl Iterator<Item = &SubtypeConstraint> {
        self.subtype.iter()
    }

    pub fn len(&self) -> usize {
        self.subtype.len()
    }

    pub fn is_empty(&self) -> bool {
        self.subtype.is_empty()
    }
}

impl FromIterator<SubtypeConstraint> for ConstraintSet {
    fn from_iter<I: IntoIterator<Item = SubtypeConstraint>>(iter: I) -> Self {
        Self {
            subtype: iter.into_iter().collect(),
        }
    }
}

impl Extend<SubtypeConstraint> for ConstraintSet {
    fn extend<I: IntoIterator<Item = SubtypeConstraint>>(&mut self, iter: I) {
        self.subtype.extend(iter)
    }
}

impl IntoIterator for ConstraintSet {
    type Item = SubtypeConstraint;
    type IntoIter = std::collections::btree_set::IntoIter<SubtypeConstraint>;

    fn into_iter(self) -> Self::IntoIter {
        self.subtype.into_iter()
    }
}

impl<'a> IntoIterator for &'a ConstraintSet {
    type Item = &'a SubtypeConstraint;
    type IntoIter = std::collections::btree_set::Iter<'a, SubtypeConstraint>;

    fn into_iter(self) -> Self::IntoIter {
        self.subtype.iter()
    }
}

impl std::fmt::Display for ConstraintSet {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        for c in &self.subtype {
            writeln!(f, "{}", c)?;
        }
        Ok(())
    }
}

/// Everything the solver is handed: the lattice, per-function constraint sets and the call
/// graph (caller name to callee names).
#[derive(Debug)]
pub struct Program {
    pub lattice: Lattice,
    pub constraints: BTreeMap<String, ConstraintSet>,
    pub callgraph: BTreeMap<String, BTreeSet<String>>,
}

impl Program {
    pub fn new(
        lattice: Lattice,
        constraints: BTreeMap<String, ConstraintSet>,
        callgraph: BTreeMap<String, BTreeSet<String>>,
    ) -> Self {
        Self {
            lattice,
            constraints,
            callgraph,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn c(s: &str) -> SubtypeConstraint {
        s.parse().unwrap()
    }

    #[test]
    fn parses_dereference_paths() {
        let con = c("test4.in_0.load.σ8@0.load.σ4@0 ⊑ int32");
        assert_eq!(con.lower.base(), "test4");
        assert_eq!(
            con.lower.path(),
            &[
                AccessPathLabel::In(0),
                AccessPathLabel::Load,
                AccessPathLabel::Deref { size: 8, offset: 0 },
                AccessPathLabel::Load,
                AccessPathLabel::Deref { size: 4, offset: 0 },
            ]
        );
        assert_eq!(con.upper, DerivedTypeVariable::new("int32"));
    }

    #[test]
    fn constraints_print_back_to_their_source_text() {
        for s in [
            "f.in_0 ⊑ int32",
            "int32 ⊑ test5.out.store.σ8@0.store.σ4@0",
            "y.in_1 ⊑ x.in_0",
            "f.in_0.load.σ4@-8 ⊑ opaque_12",
        ] {
            assert_eq!(c(s).to_string(), s);
        }
    }

    #[test]
    fn malformed_constraints_are_errors() {
        for s in [
            "f.in_0 int32",
            "f.in_x ⊑ int32",
            "f.σ4 ⊑ int32",
            " ⊑ int32",
            "a ⊑ b ⊑ c",
            "f.bogus ⊑ int32",
        ] {
            assert!(
                matches!(
                    s.parse::<SubtypeConstraint>(),
                    Err(Error::MalformedConstraint { .. })
                ),
                "{} should not parse",
                s
            );
        }
    }

    #[test]
    fn suffixes_do_not_mutate_the_prefix() {
        let f = DerivedTypeVariable::new("f");
        let arg = f.add_suffix(AccessPathLabel::In(0));
        let deref = arg
            .add_suffix(AccessPathLabel::Load)
            .add_suffix(AccessPathLabel::Deref { size: 4, offset: 0 });
        assert!(f.is_base());
        assert_eq!(arg.path().len(), 1);
        assert!(arg.is_prefix_of(&deref));
        assert!(!deref.is_prefix_of(&arg));
        assert_eq!(deref.largest_prefix().unwrap().largest_prefix(), Some(arg));
    }

    #[test]
    fn constraint_sets_collapse_duplicates() {
        let mut cs = ConstraintSet::new();
        assert!(cs.add(c("f.in_0 ⊑ int32")));
        assert!(!cs.add(c("f.in_0 ⊑ int32")));
        cs.add(c("int32 ⊑ f.out"));
        assert_eq!(cs.len(), 2);
        assert!(cs.contains(&c("int32 ⊑ f.out")));
    }
}
