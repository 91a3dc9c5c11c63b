//! Generating concrete C-like types from solved sketches.

use crate::c_types::{CType, CTypeIdx, CTypes, Field, InferredTypes};
use crate::error::Result;
use crate::lattice::{Lattice, LatticeCTypes};
use crate::log::*;
use crate::schema::{AccessPathLabel, DerivedTypeVariable};
use crate::solver::{Sketch, SketchNode};
use std::collections::BTreeMap;

/// Turns sketches into concrete types
pub trait TypeGenerator {
    fn generate(
        &self,
        sketches: &BTreeMap<DerivedTypeVariable, Sketch>,
        lattice: &Lattice,
        lattice_ctypes: &LatticeCTypes,
        register_size: usize,
        pointer_size: usize,
    ) -> Result<InferredTypes>;
}

/// A direct reading of sketches as types: functions from `in_<i>`/`out` children, pointers from
/// `load`/`store` dereferences, structures from dereferences at several offsets, and everything
/// else from the lattice interval at the node.
#[derive(Clone, Copy, Debug, Default)]
pub struct SketchTypeGenerator;

struct Generator<'a> {
    sketch: &'a Sketch,
    lattice_ctypes: &'a LatticeCTypes,
    pointer_size: usize,
    types: &'a mut CTypes,
}

impl<'a> Generator<'a> {
    /// Dereferences through `node`, by offset, as (access size, accessed node)
    fn derefs(&self, dtv: &DerivedTypeVariable) -> BTreeMap<i64, (usize, &'a SketchNode)> {
        let sketch = self.sketch;
        let mut res = BTreeMap::new();
        for (label, access) in sketch.children(dtv) {
            if !matches!(label, AccessPathLabel::Load | AccessPathLabel::Store) {
                continue;
            }
            for (label, target) in sketch.children(&access.dtv) {
                if let AccessPathLabel::Deref { size, offset } = label {
                    // Loads sort before stores, so a load wins at a shared offset
                    res.entry(offset).or_insert((size, target));
                }
            }
        }
        res
    }

    fn node_type(&mut self, node: &'a SketchNode, byte_size: usize) -> CTypeIdx {
        let derefs = self.derefs(&node.dtv);
        if derefs.is_empty() {
            return self.lattice_ctypes.atom_to_ctype(
                self.types,
                &node.lower_bound,
                &node.upper_bound,
                byte_size,
            );
        }

        let target = match derefs.iter().next() {
            Some((&0, &(size, pointee))) if derefs.len() == 1 => self.node_type(pointee, size),
            _ => {
                let mut fields = vec![];
                let mut struct_size = 0;
                for (&offset, &(size, field)) in &derefs {
                    if offset < 0 {
                        warn!("Skipping field at negative offset"; "field" => %field.dtv);
                        continue;
                    }
                    let offset = offset as usize;
                    struct_size = struct_size.max(offset + size);
                    fields.push(Field {
                        offset,
                        ctype: Some(self.node_type(field, size)),
                    });
                }
                self.types.insert(CType::Struct {
                    name: None,
                    size: struct_size,
                    fields,
                })
            }
        };
        self.types.insert(CType::Pointer {
            target: Some(target),
            size: self.pointer_size,
        })
    }

    fn function_type(&mut self, function: &DerivedTypeVariable, register_size: usize) -> CTypeIdx {
        let sketch = self.sketch;
        let mut params: BTreeMap<usize, &'a SketchNode> = BTreeMap::new();
        let mut ret = None;
        for (label, child) in sketch.children(function) {
            match label {
                AccessPathLabel::In(i) => {
                    params.insert(i, child);
                }
                AccessPathLabel::Out => ret = Some(child),
                _ => {}
            }
        }
        let ret = ret.map(|r| self.node_type(r, register_size));
        let count = params.keys().next_back().map_or(0, |i| i + 1);
        let params = (0..count)
            .map(|i| params.get(&i).map(|&p| self.node_type(p, register_size)))
            .collect();
        self.types.insert(CType::Function { ret, params })
    }
}

impl TypeGenerator for SketchTypeGenerator {
    fn generate(
        &self,
        sketches: &BTreeMap<DerivedTypeVariable, Sketch>,
        _lattice: &Lattice,
        lattice_ctypes: &LatticeCTypes,
        register_size: usize,
        pointer_size: usize,
    ) -> Result<InferredTypes> {
        let mut res = InferredTypes::default();
        for (dtv, sketch) in sketches {
            if !dtv.is_base() {
                debug!("Skipping sketch of non-function"; "dtv" => %dtv);
                continue;
            }
            let mut gen = Generator {
                sketch,
                lattice_ctypes,
                pointer_size,
                types: &mut res.types,
            };
            let t = gen.function_type(dtv, register_size);
            res.roots.insert(dtv.clone(), t);
        }
        Ok(res)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sketch_of(root: &str, nodes: &[(&str, &str, &str)]) -> BTreeMap<DerivedTypeVariable, Sketch> {
        let root: DerivedTypeVariable = root.parse().unwrap();
        let mut s = Sketch::new(root.clone());
        for (dtv, lower, upper) in nodes {
            s.add_node(SketchNode {
                dtv: dtv.parse().unwrap(),
                lower_bound: lower.parse().unwrap(),
                upper_bound: upper.parse().unwrap(),
            });
        }
        std::iter::once((root, s)).collect()
    }

    fn generate(sketches: &BTreeMap<DerivedTypeVariable, Sketch>) -> InferredTypes {
        SketchTypeGenerator
            .generate(
                sketches,
                &Lattice::new(),
                &LatticeCTypes::default(),
                8,
                8,
            )
            .unwrap()
    }

    #[test]
    fn functions_get_parameters_and_returns() {
        let inferred = generate(&sketch_of(
            "f",
            &[
                ("f", "┴", "┬"),
                ("f.in_0", "┴", "┬"),
                ("f.in_0.load", "┴", "┬"),
                ("f.in_0.load.σ4@0", "┴", "int32"),
                ("f.in_2", "┴", "uint64"),
                ("f.out", "float32", "┬"),
            ],
        ));
        let types = &inferred.types;
        let (_, f) = inferred.function("f").unwrap();
        let (ret, params) = match f {
            CType::Function { ret, params } => (ret, params),
            other => panic!("unexpected {:?}", other),
        };
        assert_eq!(types[ret.unwrap()], CType::Float { width: 4 });
        assert_eq!(params.len(), 3);
        assert_eq!(params[1], None);
        match types[params[0].unwrap()] {
            CType::Pointer {
                target: Some(t),
                size: 8,
            } => assert_eq!(
                types[t],
                CType::Int {
                    width: 4,
                    signed: true
                }
            ),
            ref other => panic!("unexpected {:?}", other),
        }
        assert_eq!(
            types[params[2].unwrap()],
            CType::Int {
                width: 8,
                signed: false
            }
        );
    }

    #[test]
    fn several_offsets_make_a_structure() {
        let inferred = generate(&sketch_of(
            "g",
            &[
                ("g", "┴", "┬"),
                ("g.in_0", "┴", "┬"),
                ("g.in_0.load", "┴", "┬"),
                ("g.in_0.load.σ4@0", "┴", "int32"),
                ("g.in_0.store", "┴", "┬"),
                ("g.in_0.store.σ8@8", "float64", "┬"),
            ],
        ));
        let types = &inferred.types;
        let (_, g) = inferred.function("g").unwrap();
        let param = match g {
            CType::Function { params, .. } => params[0].unwrap(),
            other => panic!("unexpected {:?}", other),
        };
        let target = match types[param] {
            CType::Pointer {
                target: Some(t), ..
            } => t,
            ref other => panic!("unexpected {:?}", other),
        };
        match &types[target] {
            CType::Struct { size, fields, .. } => {
                assert_eq!(*size, 16);
                assert_eq!(fields.len(), 2);
                assert_eq!(fields[1].offset, 8);
                assert_eq!(types[fields[1].ctype.unwrap()], CType::Float { width: 8 });
            }
            other => panic!("unexpected {:?}", other),
        }
    }
}
