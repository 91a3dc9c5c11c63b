//! The lattice of atomic ground types that constraints bottom out in.
//!
//! Atoms are base-only [`DerivedTypeVariable`]s. The fixed part of the lattice is a DAG whose
//! edges point from subtype to supertype, spanning `┴` to `┬`; integers sit both under their
//! signedness family (`int`, `uint`) and under their width family (`num32`, ...), so that the
//! join of `int32` and `uint32` is `num32` rather than the much less informative `number`.
//!
//! Opaque elements are registered on top of the fixed part, each directly between `┴` and `┬`.

use crate::c_types::{CType, CTypeIdx, CTypes};
use crate::ir::NodeId;
use crate::log::*;
use crate::schema::DerivedTypeVariable;
use itertools::Itertools;
use lazy_static::lazy_static;
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::visit::{Dfs, Reversed};
use std::collections::{BTreeMap, BTreeSet};

pub const TOP: &str = "┬";
pub const BOTTOM: &str = "┴";

const INT_WIDTHS: [usize; 5] = [8, 16, 32, 64, 128];
const FLOAT_WIDTHS: [usize; 4] = [32, 64, 80, 128];

/// The fixed part of the lattice, along with the reflexive-transitive closure of its order.
struct BaseLattice {
    graph: DiGraph<String, ()>,
    index: BTreeMap<String, NodeIndex>,
    /// Element to all of its supertypes (including itself)
    upper: BTreeMap<String, BTreeSet<String>>,
    /// Element to all of its subtypes (including itself)
    lower: BTreeMap<String, BTreeSet<String>>,
}

impl BaseLattice {
    fn build() -> Self {
        let mut edges: Vec<(String, String)> = vec![];
        let mut edge = |lo: &str, hi: &str| edges.push((lo.to_owned(), hi.to_owned()));

        for t in ["void", "bool", "code", "str", "number"] {
            edge(t, TOP);
        }
        for t in ["int", "uint", "float"] {
            edge(t, "number");
        }
        for w in INT_WIDTHS {
            let num = format!("num{}", w);
            edge(&num, "number");
            edge(&format!("int{}", w), &num);
            edge(&format!("int{}", w), "int");
            edge(&format!("uint{}", w), &num);
            edge(&format!("uint{}", w), "uint");
        }
        edge("char", "num8");
        edge("char16", "num16");
        edge("char32", "num32");
        for w in FLOAT_WIDTHS {
            edge(&format!("float{}", w), "float");
        }

        let mut graph: DiGraph<String, ()> = DiGraph::new();
        let mut index: BTreeMap<String, NodeIndex> = BTreeMap::new();
        let mut node = |graph: &mut DiGraph<String, ()>, name: &str| {
            *index
                .entry(name.to_owned())
                .or_insert_with(|| graph.add_node(name.to_owned()))
        };
        let bottom = node(&mut graph, BOTTOM);
        for (lo, hi) in &edges {
            let lo = node(&mut graph, lo);
            let hi = node(&mut graph, hi);
            graph.add_edge(lo, hi, ());
        }
        // Everything without a subtype sits right above bottom
        let leaves: Vec<NodeIndex> = graph
            .node_indices()
            .filter(|&n| n != bottom)
            .filter(|&n| {
                graph
                    .neighbors_directed(n, petgraph::Direction::Incoming)
                    .next()
                    .is_none()
            })
            .collect();
        for leaf in leaves {
            graph.add_edge(bottom, leaf, ());
        }

        let mut upper = BTreeMap::new();
        let mut lower = BTreeMap::new();
        for (name, &n) in &index {
            let mut ups = BTreeSet::new();
            let mut dfs = Dfs::new(&graph, n);
            while let Some(m) = dfs.next(&graph) {
                ups.insert(graph[m].clone());
            }
            upper.insert(name.clone(), ups);

            let rev = Reversed(&graph);
            let mut downs = BTreeSet::new();
            let mut dfs = Dfs::new(rev, n);
            while let Some(m) = dfs.next(rev) {
                downs.insert(graph[m].clone());
            }
            lower.insert(name.clone(), downs);
        }

        Self {
            graph,
            index,
            upper,
            lower,
        }
    }

    fn contains(&self, name: &str) -> bool {
        self.index.contains_key(name)
    }
}

lazy_static! {
    static ref BASE: BaseLattice = BaseLattice::build();
}

/// The type lattice handed to the solver.
///
/// Cheap to clone; extending produces a new value and leaves `self` untouched.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Lattice {
    opaque: BTreeSet<DerivedTypeVariable>,
}

impl Lattice {
    /// The fixed lattice, with no opaque elements
    pub fn new() -> Self {
        Self::default()
    }

    pub fn top(&self) -> DerivedTypeVariable {
        DerivedTypeVariable::new(TOP)
    }

    pub fn bottom(&self) -> DerivedTypeVariable {
        DerivedTypeVariable::new(BOTTOM)
    }

    /// A lattice that additionally has each of `opaque` as an element between top and bottom.
    /// Elements that are already present are ignored.
    #[must_use]
    pub fn extend(&self, opaque: impl IntoIterator<Item = DerivedTypeVariable>) -> Self {
        let mut res = self.clone();
        for o in opaque {
            if self.is_base_element(&o) {
                warn!("Not registering lattice element as opaque"; "element" => %o);
                continue;
            }
            res.opaque.insert(o);
        }
        res
    }

    /// Ground types, without sentinels or opaque elements
    pub fn internal_types(&self) -> BTreeSet<DerivedTypeVariable> {
        BASE.index
            .keys()
            .filter(|n| *n != TOP && *n != BOTTOM)
            .map(DerivedTypeVariable::new)
            .collect()
    }

    /// All non-sentinel elements, including opaque ones
    pub fn atomic_types(&self) -> BTreeSet<DerivedTypeVariable> {
        let mut res = self.internal_types();
        res.extend(self.opaque.iter().cloned());
        res
    }

    pub fn opaque_types(&self) -> &BTreeSet<DerivedTypeVariable> {
        &self.opaque
    }

    pub fn is_opaque(&self, t: &DerivedTypeVariable) -> bool {
        self.opaque.contains(t)
    }

    /// `true` if `t` is an element of this lattice (sentinels included)
    pub fn contains(&self, t: &DerivedTypeVariable) -> bool {
        self.is_base_element(t) || self.is_opaque(t)
    }

    fn is_base_element(&self, t: &DerivedTypeVariable) -> bool {
        t.is_base() && BASE.contains(t.base())
    }

    /// Supertypes of `t`, including `t` itself. Anything outside the fixed lattice is treated like
    /// an opaque element.
    fn upper_set(&self, t: &DerivedTypeVariable) -> BTreeSet<DerivedTypeVariable> {
        match BASE.upper.get(t.base()).filter(|_| t.is_base()) {
            Some(ups) => {
                let mut res: BTreeSet<_> = ups.iter().map(DerivedTypeVariable::new).collect();
                if t.base() == BOTTOM {
                    res.extend(self.opaque.iter().cloned());
                }
                res
            }
            None => [t.clone(), self.top()].into_iter().collect(),
        }
    }

    /// Subtypes of `t`, including `t` itself
    fn lower_set(&self, t: &DerivedTypeVariable) -> BTreeSet<DerivedTypeVariable> {
        match BASE.lower.get(t.base()).filter(|_| t.is_base()) {
            Some(downs) => {
                let mut res: BTreeSet<_> = downs.iter().map(DerivedTypeVariable::new).collect();
                if t.base() == TOP {
                    res.extend(self.opaque.iter().cloned());
                }
                res
            }
            None => [t.clone(), self.bottom()].into_iter().collect(),
        }
    }

    /// `true` if `a ⊑ b`
    pub fn is_subtype(&self, a: &DerivedTypeVariable, b: &DerivedTypeVariable) -> bool {
        a == b || *a == self.bottom() || *b == self.top() || self.upper_set(a).contains(b)
    }

    /// Greatest lower bound
    pub fn meet(&self, a: &DerivedTypeVariable, b: &DerivedTypeVariable) -> DerivedTypeVariable {
        if a == b || *b == self.top() {
            return a.clone();
        }
        if *a == self.top() {
            return b.clone();
        }
        if *a == self.bottom() || *b == self.bottom() {
            return self.bottom();
        }
        let common: BTreeSet<_> = self
            .lower_set(a)
            .intersection(&self.lower_set(b))
            .cloned()
            .collect();
        // The greatest element is the only one no other common element lies above
        let maximal = common
            .iter()
            .filter(|c| {
                let ups = self.upper_set(c);
                common.iter().all(|d| d == *c || !ups.contains(d))
            })
            .exactly_one();
        match maximal {
            Ok(m) => m.clone(),
            Err(candidates) => {
                warn!("Ambiguous meet, using bottom";
                      "a" => %a, "b" => %b, "candidates" => ?candidates.collect::<Vec<_>>());
                self.bottom()
            }
        }
    }

    /// Least upper bound
    pub fn join(&self, a: &DerivedTypeVariable, b: &DerivedTypeVariable) -> DerivedTypeVariable {
        if a == b || *b == self.bottom() {
            return a.clone();
        }
        if *a == self.bottom() {
            return b.clone();
        }
        if *a == self.top() || *b == self.top() {
            return self.top();
        }
        let common: BTreeSet<_> = self
            .upper_set(a)
            .intersection(&self.upper_set(b))
            .cloned()
            .collect();
        let minimal = common
            .iter()
            .filter(|c| {
                let downs = self.lower_set(c);
                common.iter().all(|d| d == *c || !downs.contains(d))
            })
            .exactly_one();
        match minimal {
            Ok(m) => m.clone(),
            Err(candidates) => {
                warn!("Ambiguous join, using top";
                      "a" => %a, "b" => %b, "candidates" => ?candidates.collect::<Vec<_>>());
                self.top()
            }
        }
    }
}

/// Maps solved lattice intervals back to concrete types, knowing which lattice elements stand
/// for opaque types in the binary.
#[derive(Clone, Debug, Default)]
pub struct LatticeCTypes {
    opaque: BTreeMap<DerivedTypeVariable, NodeId>,
}

impl LatticeCTypes {
    /// `opaque` maps each opaque lattice element to the type node it was registered for
    pub fn new(opaque: BTreeMap<DerivedTypeVariable, NodeId>) -> Self {
        Self { opaque }
    }

    pub fn opaque_id(&self, t: &DerivedTypeVariable) -> Option<NodeId> {
        self.opaque.get(t).copied()
    }

    /// Concrete type for a value of `byte_size` bytes whose type lies between `lower` and
    /// `upper`. A bound that is an opaque element wins over everything else and produces a
    /// pointer to the opaque type.
    pub fn atom_to_ctype(
        &self,
        types: &mut CTypes,
        lower: &DerivedTypeVariable,
        upper: &DerivedTypeVariable,
        byte_size: usize,
    ) -> CTypeIdx {
        if let Some(id) = self.opaque_id(lower).or_else(|| self.opaque_id(upper)) {
            let target = types.insert(CType::Opaque(id));
            return types.insert(CType::Pointer {
                target: Some(target),
                size: byte_size,
            });
        }

        let atom = if upper.base() == TOP {
            lower
        } else if lower.base() == BOTTOM {
            upper
        } else {
            lower
        };

        let ctype = if atom.is_base() && BASE.contains(atom.base()) {
            Self::ground_ctype(types, atom.base(), byte_size)
        } else {
            None
        };
        match ctype {
            Some(t) => types.insert(t),
            None => {
                let member = types.insert(CType::Char { width: 1 });
                types.insert(CType::Array {
                    member: Some(member),
                    length: byte_size,
                })
            }
        }
    }

    fn ground_ctype(types: &mut CTypes, atom: &str, byte_size: usize) -> Option<CType> {
        let width = |prefix: &str| -> Option<usize> {
            atom.strip_prefix(prefix)?.parse::<usize>().ok().map(|bits| bits / 8)
        };
        Some(match atom {
            "int" | "number" => CType::Int {
                width: byte_size,
                signed: true,
            },
            "uint" => CType::Int {
                width: byte_size,
                signed: false,
            },
            "float" => CType::Float { width: byte_size },
            "char" => CType::Char { width: 1 },
            "char16" => CType::Char { width: 2 },
            "char32" => CType::Char { width: 4 },
            "bool" => CType::Bool,
            "void" => CType::Void,
            "code" => {
                let ret = types.insert(CType::Void);
                CType::Function {
                    ret: Some(ret),
                    params: vec![],
                }
            }
            "str" => {
                let target = types.insert(CType::Char { width: 1 });
                CType::Pointer {
                    target: Some(target),
                    size: byte_size,
                }
            }
            _ => {
                if let Some(width) = width("uint") {
                    CType::Int {
                        width,
                        signed: false,
                    }
                } else if let Some(width) = width("int").or_else(|| width("num")) {
                    CType::Int {
                        width,
                        signed: true,
                    }
                } else if let Some(width) = width("float") {
                    CType::Float { width }
                } else {
                    return None;
                }
            }
        })
    }
}
