//! The interface to the constraint solver, and the sketches it produces.
//!
//! A [`Sketch`] summarizes what the solver learned about one function: a tree of derived type
//! variables rooted at the function, each annotated with the lattice interval its type lies in.

use crate::error::{Error, Result};
use crate::schema::{AccessPathLabel, ConstraintSet, DerivedTypeVariable, Program};
use std::collections::{BTreeMap, VecDeque};

/// A node of a sketch: a variable and the interval `[lower_bound, upper_bound]` of the lattice
/// its type is known to lie in
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct SketchNode {
    pub dtv: DerivedTypeVariable,
    pub lower_bound: DerivedTypeVariable,
    pub upper_bound: DerivedTypeVariable,
}

#[derive(Clone, PartialEq, Eq, Debug)]
pub struct Sketch {
    pub root: DerivedTypeVariable,
    pub nodes: BTreeMap<DerivedTypeVariable, SketchNode>,
}

impl Sketch {
    /// An empty sketch for `root`
    pub fn new(root: DerivedTypeVariable) -> Self {
        Self {
            root,
            nodes: Default::default(),
        }
    }

    pub fn add_node(&mut self, node: SketchNode) {
        self.nodes.insert(node.dtv.clone(), node);
    }

    pub fn lookup(&self, dtv: &DerivedTypeVariable) -> Option<&SketchNode> {
        self.nodes.get(dtv)
    }

    /// Nodes exactly one label below `dtv`, along with that label
    pub fn children<'a, 'b>(
        &'a self,
        dtv: &'b DerivedTypeVariable,
    ) -> impl Iterator<Item = (AccessPathLabel, &'a SketchNode)> + 'b
    where
        'a: 'b,
    {
        self.nodes.values().filter_map(move |n| {
            let label = n.dtv.tail()?;
            (n.dtv.largest_prefix().as_ref() == Some(dtv)).then(|| (label, n))
        })
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Write a `.dot` rendering of the part of the sketch reachable from `root`
    pub fn write_dot<W: std::io::Write>(
        &self,
        root: &DerivedTypeVariable,
        w: &mut W,
    ) -> Result<()> {
        if self.lookup(root).is_none() {
            return Err(Error::SketchRender(root.to_string()));
        }

        let mut nodes: Vec<&SketchNode> = vec![];
        let mut edges: Vec<(usize, usize, String)> = vec![];
        let mut queue: VecDeque<(usize, &DerivedTypeVariable)> = VecDeque::new();
        if let Some(r) = self.lookup(root) {
            nodes.push(r);
            queue.push_back((0, &r.dtv));
        }
        while let Some((i, dtv)) = queue.pop_front() {
            for (label, child) in self.children(dtv) {
                let j = nodes.len();
                nodes.push(child);
                edges.push((i, j, label.to_string()));
                queue.push_back((j, &child.dtv));
            }
        }

        struct Graph<'a> {
            nodes: Vec<&'a SketchNode>,
            edges: Vec<(usize, usize, String)>,
        }
        type Edge = (usize, usize, String);

        impl<'a> dot::Labeller<'a, usize, Edge> for Graph<'a> {
            fn graph_id(&'a self) -> dot::Id<'a> {
                dot::Id::new("Sketch").unwrap()
            }
            fn node_id(&'a self, n: &usize) -> dot::Id<'a> {
                dot::Id::new(format!("n{}", n)).unwrap()
            }
            fn node_label<'b>(&'b self, n: &usize) -> dot::LabelText<'b> {
                let node = self.nodes[*n];
                dot::LabelText::label(format!(
                    "{} [{}, {}]",
                    node.dtv, node.lower_bound, node.upper_bound
                ))
            }
            fn edge_label<'b>(&'b self, e: &Edge) -> dot::LabelText<'b> {
                dot::LabelText::label(e.2.clone())
            }
        }

        impl<'a> dot::GraphWalk<'a, usize, Edge> for Graph<'a> {
            fn nodes(&self) -> dot::Nodes<'a, usize> {
                (0..self.nodes.len()).collect::<Vec<_>>().into()
            }
            fn edges(&'a self) -> dot::Edges<'a, Edge> {
                self.edges.clone().into()
            }
            fn source(&self, e: &Edge) -> usize {
                e.0
            }
            fn target(&self, e: &Edge) -> usize {
                e.1
            }
        }

        dot::render(&Graph { nodes, edges }, w)?;
        Ok(())
    }

    /// A `.dot` rendering of the part of the sketch reachable from `root`
    pub fn to_dot(&self, root: &DerivedTypeVariable) -> Result<String> {
        let mut s: Vec<u8> = vec![];
        self.write_dot(root, &mut s)?;
        String::from_utf8(s).map_err(|e| Error::SketchRender(e.to_string()))
    }
}

/// Everything the solver produces
#[derive(Clone, Debug, Default)]
pub struct SolverOutput {
    /// Constraints derived for each function
    pub derived: BTreeMap<DerivedTypeVariable, ConstraintSet>,
    /// The sketch of each function
    pub sketches: BTreeMap<DerivedTypeVariable, Sketch>,
}

/// A solver for subtype constraint programs
pub trait ConstraintSolver {
    fn solve(&self, program: &Program, verbose: bool) -> Result<SolverOutput>;
}
