//! Writing inferred types back into a module's type and prototype tables.

use crate::c_types::{CType, CTypeIdx, CTypes, InferredTypes};
use crate::callgraph::filter_name;
use crate::error::{Error, Result};
use crate::ir::{Module, NodeId};
use crate::ir_types::{AbstractType, TypeId, TypeTable};
use crate::log::*;
use std::collections::{BTreeMap, BTreeSet};

/// Translates [`CType`] graphs into a module's type table.
///
/// Translation is cached by [`CTypeIdx`], i.e., by node identity: two structurally identical
/// concrete types that are different nodes produce different type nodes, while the same node
/// reached twice (including through a cycle) produces a single type node.
pub struct IrWriter<'a> {
    module: &'a mut Module,
    translate_cache: BTreeMap<CTypeIdx, TypeId>,
}

impl<'a> IrWriter<'a> {
    pub fn new(module: &'a mut Module) -> Self {
        Self {
            module,
            translate_cache: Default::default(),
        }
    }

    /// A new, unshared, unknown type node
    fn unknown_type(&mut self, size: usize) -> TypeId {
        self.module.types.insert(AbstractType::Unknown { size })
    }

    fn add_type(&mut self, idx: CTypeIdx, t: AbstractType) -> TypeId {
        let id = self.module.types.insert(t);
        self.translate_cache.insert(idx, id);
        id
    }

    /// Reserve an id for `idx` before its contents are translated
    fn reserve(&mut self, idx: CTypeIdx) -> TypeId {
        let id = NodeId::fresh();
        self.translate_cache.insert(idx, id);
        id
    }

    fn translate_ctype(&mut self, types: &CTypes, ctype: Option<CTypeIdx>) -> Result<TypeId> {
        let idx = match ctype {
            Some(idx) => idx,
            None => return Ok(self.unknown_type(0)),
        };
        if let Some(&id) = self.translate_cache.get(&idx) {
            return Ok(id);
        }

        let t = types.get(idx).ok_or(Error::DanglingConcreteType(idx))?;
        Ok(match t {
            CType::Void => self.add_type(idx, AbstractType::Void),
            CType::Bool => self.add_type(idx, AbstractType::Bool),
            CType::Char { width } => self.add_type(idx, AbstractType::Char { size: *width }),
            CType::Int { width, signed } => self.add_type(
                idx,
                AbstractType::Int {
                    size: *width,
                    signed: *signed,
                },
            ),
            CType::Float { width } => self.add_type(idx, AbstractType::Float { size: *width }),
            CType::Pointer { target, .. } => {
                if let Some(CType::Opaque(original)) = target.and_then(|t| types.get(t)) {
                    if self.module.types.contains(*original) {
                        // Pointer to an un-decomposed type: the original type node is itself
                        // the pointer
                        self.translate_cache.insert(idx, *original);
                        return Ok(*original);
                    }
                }
                // Added before the pointee is handled, in case of recursive types
                let id = self.add_type(idx, AbstractType::Pointer { pointee: None });
                let pointee = self.translate_ctype(types, *target)?;
                self.module.types.set_pointee(id, pointee);
                id
            }
            CType::Array { member, length } => {
                let id = self.reserve(idx);
                let element = self.translate_ctype(types, *member)?;
                self.module.types.insert_with_id(
                    id,
                    AbstractType::Array {
                        element,
                        count: *length,
                    },
                );
                id
            }
            CType::Struct { size, fields, .. } => {
                let id = self.reserve(idx);
                let size = match fields.last() {
                    Some(last) if last.ctype.is_some() => *size,
                    _ => 0,
                };
                let mut translated = Vec::with_capacity(fields.len());
                for field in fields {
                    translated.push((field.offset, self.translate_ctype(types, field.ctype)?));
                }
                self.module.types.insert_with_id(
                    id,
                    AbstractType::Struct {
                        size,
                        fields: translated,
                    },
                );
                id
            }
            CType::Function { ret, params } => {
                let id = self.reserve(idx);
                let ret = self.translate_ctype(types, *ret)?;
                let mut translated = Vec::with_capacity(params.len());
                for p in params {
                    translated.push(Some(self.translate_ctype(types, *p)?));
                }
                self.module.types.insert_with_id(
                    id,
                    AbstractType::Function {
                        ret: Some(ret),
                        params: translated,
                    },
                );
                id
            }
            CType::Opaque(original) => {
                if self.module.types.contains(*original) {
                    self.translate_cache.insert(idx, *original);
                    *original
                } else {
                    warn!("Opaque type refers to a type outside of the module";
                          "type" => %original, "module" => &self.module.name);
                    self.unknown_type(0)
                }
            }
            t @ CType::Union { .. } => return Err(Error::UnsupportedConcreteType(t.kind())),
        })
    }

    /// Add all inferred function types to the module, replacing its prototype table with one
    /// mapping each function to its inferred type.
    pub fn add_types(&mut self, inferred: &InferredTypes) -> Result<()> {
        let module: &Module = self.module;
        let name2func: BTreeMap<String, NodeId> = module
            .functions
            .iter()
            .map(|f| (filter_name(module, f), f.id))
            .collect();
        let mut prototypes = BTreeMap::new();

        for (dtv, &idx) in &inferred.roots {
            let type_id = self.translate_ctype(&inferred.types, Some(idx))?;
            match name2func.get(&dtv.to_string()) {
                Some(&func) => {
                    prototypes.insert(func, type_id);
                }
                None => {
                    warn!("Failed to find function for inferred type";
                          "dtv" => %dtv, "module" => &self.module.name);
                }
            }
        }

        self.module.prototypes = prototypes;
        Ok(())
    }
}

/// Structural equality of the type `a` in `table_a` and the type `b` in `table_b`, ignoring ids.
/// Cycles are followed once; a pair of nodes seen again is assumed equivalent.
pub fn is_type_equivalent(table_a: &TypeTable, a: TypeId, table_b: &TypeTable, b: TypeId) -> bool {
    fn go(
        ta: &TypeTable,
        a: TypeId,
        tb: &TypeTable,
        b: TypeId,
        visited: &mut BTreeSet<(TypeId, TypeId)>,
    ) -> bool {
        if !visited.insert((a, b)) {
            return true;
        }
        let (x, y) = match (ta.get(a), tb.get(b)) {
            (Some(x), Some(y)) => (x, y),
            _ => return false,
        };
        let opt = |a: Option<TypeId>, b: Option<TypeId>, visited: &mut BTreeSet<_>| match (a, b) {
            (Some(a), Some(b)) => go(ta, a, tb, b, visited),
            (None, None) => true,
            _ => false,
        };
        use AbstractType as T;
        match (x, y) {
            (T::Void, T::Void) | (T::Bool, T::Bool) => true,
            (T::Char { size: s1 }, T::Char { size: s2 })
            | (T::Float { size: s1 }, T::Float { size: s2 })
            | (T::Unknown { size: s1 }, T::Unknown { size: s2 }) => s1 == s2,
            (
                T::Int {
                    size: s1,
                    signed: g1,
                },
                T::Int {
                    size: s2,
                    signed: g2,
                },
            ) => s1 == s2 && g1 == g2,
            (T::Pointer { pointee: p1 }, T::Pointer { pointee: p2 }) => opt(*p1, *p2, visited),
            (
                T::Array {
                    element: e1,
                    count: c1,
                },
                T::Array {
                    element: e2,
                    count: c2,
                },
            ) => c1 == c2 && go(ta, *e1, tb, *e2, visited),
            (
                T::Struct {
                    size: s1,
                    fields: f1,
                },
                T::Struct {
                    size: s2,
                    fields: f2,
                },
            ) => {
                s1 == s2
                    && f1.len() == f2.len()
                    && f1
                        .iter()
                        .zip(f2)
                        .all(|((o1, t1), (o2, t2))| o1 == o2 && go(ta, *t1, tb, *t2, visited))
            }
            (
                T::Function {
                    ret: r1,
                    params: p1,
                },
                T::Function {
                    ret: r2,
                    params: p2,
                },
            ) => {
                p1.len() == p2.len()
                    && opt(*r1, *r2, visited)
                    && p1.iter().zip(p2).all(|(a, b)| opt(*a, *b, visited))
            }
            _ => false,
        }
    }
    go(table_a, a, table_b, b, &mut BTreeSet::new())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::c_types::Field;
    use crate::ir::Isa;
    use crate::schema::DerivedTypeVariable;

    fn module_with(names: &[&str]) -> Module {
        let mut m = Module::new("test", Isa::X64);
        for (i, name) in names.iter().enumerate() {
            let b = m.add_code_block(0x1000 + 0x10 * i as u64, 0x10, vec![]);
            m.add_function(*name, b, []);
        }
        m
    }

    fn prototype_of(m: &Module, name: &str) -> TypeId {
        let f = m.functions.iter().find(|f| f.name() == name).unwrap();
        m.prototypes[&f.id]
    }

    #[test]
    fn scalar_types_round_trip() {
        let mut inferred = InferredTypes::default();
        let i = inferred.types.insert(CType::Int {
            width: 4,
            signed: false,
        });
        let fl = inferred.types.insert(CType::Float { width: 8 });
        let f = inferred.types.insert(CType::Function {
            ret: Some(i),
            params: vec![Some(fl), None],
        });
        inferred.roots.insert(DerivedTypeVariable::new("f"), f);

        let mut m = module_with(&["f"]);
        IrWriter::new(&mut m).add_types(&inferred).unwrap();

        let mut expected = TypeTable::new();
        let ei = expected.insert(AbstractType::Int {
            size: 4,
            signed: false,
        });
        let ef = expected.insert(AbstractType::Float { size: 8 });
        let eu = expected.insert(AbstractType::Unknown { size: 0 });
        let efun = expected.insert(AbstractType::Function {
            ret: Some(ei),
            params: vec![Some(ef), Some(eu)],
        });
        assert!(is_type_equivalent(
            &expected,
            efun,
            &m.types,
            prototype_of(&m, "f")
        ));
        assert!(!is_type_equivalent(&expected, ei, &expected, ef));
    }

    #[test]
    fn single_pointers_round_trip() {
        let mut inferred = InferredTypes::default();
        let c = inferred.types.insert(CType::Char { width: 1 });
        let p = inferred.types.insert(CType::Pointer {
            target: Some(c),
            size: 8,
        });
        let v = inferred.types.insert(CType::Void);
        let f = inferred.types.insert(CType::Function {
            ret: Some(v),
            params: vec![Some(p)],
        });
        inferred.roots.insert(DerivedTypeVariable::new("puts"), f);

        let mut m = module_with(&["puts"]);
        IrWriter::new(&mut m).add_types(&inferred).unwrap();

        let mut expected = TypeTable::new();
        let ec = expected.insert(AbstractType::Char { size: 1 });
        let ep = expected.insert(AbstractType::Pointer { pointee: Some(ec) });
        let ev = expected.insert(AbstractType::Void);
        let efun = expected.insert(AbstractType::Function {
            ret: Some(ev),
            params: vec![Some(ep)],
        });
        assert!(is_type_equivalent(
            &expected,
            efun,
            &m.types,
            prototype_of(&m, "puts")
        ));
    }

    #[test]
    fn self_referential_structures_terminate() {
        // struct node { struct node *next; int32_t value; };
        let mut inferred = InferredTypes::default();
        let p = inferred.types.insert(CType::Pointer {
            target: None,
            size: 8,
        });
        let i = inferred.types.insert(CType::Int {
            width: 4,
            signed: true,
        });
        let s = inferred.types.insert(CType::Struct {
            name: Some("node".into()),
            size: 12,
            fields: vec![
                Field {
                    offset: 0,
                    ctype: Some(p),
                },
                Field {
                    offset: 8,
                    ctype: Some(i),
                },
            ],
        });
        inferred.types.set_pointer_target(p, s);
        let f = inferred.types.insert(CType::Function {
            ret: Some(p),
            params: vec![Some(p)],
        });
        inferred.roots.insert(DerivedTypeVariable::new("walk"), f);

        let mut m = module_with(&["walk"]);
        IrWriter::new(&mut m).add_types(&inferred).unwrap();
        // function, pointer, struct, int
        assert_eq!(m.types.len(), 4);

        let mut expected = TypeTable::new();
        let ep = expected.insert(AbstractType::Pointer { pointee: None });
        let ei = expected.insert(AbstractType::Int {
            size: 4,
            signed: true,
        });
        let es = expected.insert(AbstractType::Struct {
            size: 12,
            fields: vec![(0, ep), (8, ei)],
        });
        expected.set_pointee(ep, es);
        let efun = expected.insert(AbstractType::Function {
            ret: Some(ep),
            params: vec![Some(ep)],
        });
        assert!(is_type_equivalent(
            &expected,
            efun,
            &m.types,
            prototype_of(&m, "walk")
        ));
    }

    #[test]
    fn unterminated_structures_are_zero_sized() {
        let mut inferred = InferredTypes::default();
        let i = inferred.types.insert(CType::Int {
            width: 4,
            signed: true,
        });
        let s = inferred.types.insert(CType::Struct {
            name: None,
            size: 16,
            fields: vec![
                Field {
                    offset: 0,
                    ctype: Some(i),
                },
                Field {
                    offset: 8,
                    ctype: None,
                },
            ],
        });
        let p = inferred.types.insert(CType::Pointer {
            target: Some(s),
            size: 8,
        });
        let f = inferred.types.insert(CType::Function {
            ret: None,
            params: vec![Some(p)],
        });
        inferred.roots.insert(DerivedTypeVariable::new("f"), f);

        let mut m = module_with(&["f"]);
        IrWriter::new(&mut m).add_types(&inferred).unwrap();
        let struct_size = m.types.iter().find_map(|(_, t)| match t {
            AbstractType::Struct { size, .. } => Some(*size),
            _ => None,
        });
        assert_eq!(struct_size, Some(0));
        // The two absent types get distinct placeholders
        let unknowns = m
            .types
            .iter()
            .filter(|(_, t)| matches!(t, AbstractType::Unknown { size: 0 }))
            .count();
        assert_eq!(unknowns, 2);
    }

    #[test]
    fn opaque_pointers_collapse_to_the_original_type() {
        let mut m = module_with(&["f"]);
        let original = m.types.insert(AbstractType::Pointer { pointee: None });

        let mut inferred = InferredTypes::default();
        let o = inferred.types.insert(CType::Opaque(original));
        let p = inferred.types.insert(CType::Pointer {
            target: Some(o),
            size: 8,
        });
        let f = inferred.types.insert(CType::Function {
            ret: Some(p),
            params: vec![],
        });
        inferred.roots.insert(DerivedTypeVariable::new("f"), f);

        IrWriter::new(&mut m).add_types(&inferred).unwrap();
        match m.types.get(prototype_of(&m, "f")) {
            Some(AbstractType::Function { ret, .. }) => assert_eq!(*ret, Some(original)),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn unions_are_rejected() {
        let mut inferred = InferredTypes::default();
        let i = inferred.types.insert(CType::Int {
            width: 4,
            signed: true,
        });
        let u = inferred.types.insert(CType::Union {
            name: None,
            members: vec![Some(i)],
        });
        inferred.roots.insert(DerivedTypeVariable::new("f"), u);

        let mut m = module_with(&["f"]);
        assert!(matches!(
            IrWriter::new(&mut m).add_types(&inferred),
            Err(Error::UnsupportedConcreteType("union"))
        ));
    }

    #[test]
    fn unknown_functions_are_skipped() {
        let mut inferred = InferredTypes::default();
        let v = inferred.types.insert(CType::Void);
        inferred.roots.insert(DerivedTypeVariable::new("elsewhere"), v);

        let mut m = module_with(&["f"]);
        IrWriter::new(&mut m).add_types(&inferred).unwrap();
        assert!(m.prototypes.is_empty());
    }
}
