//! Turning the types already recorded for a module (its prototype table) into subtype
//! constraints, so that known signatures seed inference.

use crate::callgraph::filter_name;
use crate::error::{Error, Result};
use crate::ir::{Module, NodeId};
use crate::ir_types::{AbstractType, TypeId};
use crate::log::*;
use crate::schema::{AccessPathLabel, ConstraintSet, DerivedTypeVariable, SubtypeConstraint};
use std::collections::{BTreeMap, BTreeSet};

/// Which side of the subtype relation a variable is on
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Side {
    /// The variable is bounded from above by its type (function inputs)
    Left,
    /// The variable is bounded from below by its type (function outputs)
    Right,
}

impl Side {
    /// Order `original` and `other` into a subtype constraint
    pub fn order(
        self,
        original: DerivedTypeVariable,
        other: DerivedTypeVariable,
    ) -> SubtypeConstraint {
        match self {
            Side::Left => SubtypeConstraint::new(original, other),
            Side::Right => SubtypeConstraint::new(other, original),
        }
    }

    /// Append the dereference label for this side (`load` or `store`)
    pub fn deref_path(self, deref: &DerivedTypeVariable) -> DerivedTypeVariable {
        match self {
            Side::Left => deref.add_suffix(AccessPathLabel::Load),
            Side::Right => deref.add_suffix(AccessPathLabel::Store),
        }
    }
}

/// Generates constraints from a module's prototype table.
///
/// Types with no contents (pointers to nothing, to empty structures, to `void`) cannot be
/// described by access paths; each is registered as an opaque lattice element named after the
/// pointer type's id. The registrations are available from [`Self::opaque_types`] once loading is
/// done.
///
/// A pointer reached again while its pointee is still being expanded (a linked list's `next`
/// field, say) produces no further constraints.
pub struct GroundTruthReader<'a> {
    module: &'a Module,
    opaque_types: BTreeMap<TypeId, DerivedTypeVariable>,
    /// Pointers whose pointee is currently being expanded
    in_progress: BTreeSet<TypeId>,
}

impl<'a> GroundTruthReader<'a> {
    pub fn new(module: &'a Module) -> Self {
        Self {
            module,
            opaque_types: Default::default(),
            in_progress: Default::default(),
        }
    }

    /// Opaque lattice elements registered so far, to the type they stand for
    pub fn opaque_types(&self) -> BTreeMap<DerivedTypeVariable, NodeId> {
        self.opaque_types
            .iter()
            .map(|(id, dtv)| (dtv.clone(), *id))
            .collect()
    }

    fn find_type_size(&self, type_id: TypeId) -> Result<usize> {
        let (pointer_size, _) = self.module.arch_sizes()?;
        self.module.types.size_of(type_id, pointer_size)
    }

    fn generate_opaque_constraint(
        &mut self,
        origin: DerivedTypeVariable,
        side: Side,
        type_id: TypeId,
        output: &mut ConstraintSet,
    ) {
        let lattice_dtv = self
            .opaque_types
            .entry(type_id)
            .or_insert_with(|| DerivedTypeVariable::new(format!("opaque_{}", type_id)))
            .clone();
        output.add(side.order(origin, lattice_dtv));
    }

    fn generate_ptr_constraint(
        &mut self,
        deref: DerivedTypeVariable,
        side: Side,
        pointer_id: TypeId,
        pointee: Option<TypeId>,
        output: &mut ConstraintSet,
    ) -> Result<()> {
        let pointee_id = match pointee {
            Some(p) => p,
            None => {
                self.generate_opaque_constraint(deref, side, pointer_id, output);
                return Ok(());
            }
        };
        if !self.in_progress.insert(pointer_id) {
            debug!("Not expanding recursive pointer"; "pointer" => %pointer_id, "over" => %deref);
            return Ok(());
        }
        let res = self.generate_pointee_constraint(deref, side, pointer_id, pointee_id, output);
        self.in_progress.remove(&pointer_id);
        res
    }

    fn generate_pointee_constraint(
        &mut self,
        deref: DerivedTypeVariable,
        side: Side,
        pointer_id: TypeId,
        pointee_id: TypeId,
        output: &mut ConstraintSet,
    ) -> Result<()> {
        let module = self.module;
        match module.types.resolve(pointee_id)? {
            AbstractType::Struct { fields, .. } if fields.is_empty() => {
                self.generate_opaque_constraint(deref, side, pointer_id, output);
            }
            AbstractType::Void | AbstractType::Function { .. } => {
                self.generate_opaque_constraint(deref, side, pointer_id, output);
            }
            AbstractType::Struct { fields, .. } => {
                for &(offset, field) in fields {
                    let size = self.find_type_size(field)?;
                    let path = side.deref_path(&deref).add_suffix(AccessPathLabel::Deref {
                        size,
                        offset: offset as i64,
                    });
                    self.generate_constraint(path, side, field, output)?;
                }
            }
            _ => {
                let size = self.find_type_size(pointee_id)?;
                let path = side
                    .deref_path(&deref)
                    .add_suffix(AccessPathLabel::Deref { size, offset: 0 });
                self.generate_constraint(path, side, pointee_id, output)?;
            }
        }
        Ok(())
    }

    fn generate_constraint(
        &mut self,
        over: DerivedTypeVariable,
        side: Side,
        type_id: TypeId,
        output: &mut ConstraintSet,
    ) -> Result<()> {
        let module = self.module;
        let atom = match module.types.resolve(type_id)? {
            AbstractType::Int { size, signed } => {
                format!("{}int{}", if *signed { "" } else { "u" }, size * 8)
            }
            AbstractType::Float { size } => format!("float{}", size * 8),
            AbstractType::Char { size: 1 } => "char".to_owned(),
            AbstractType::Char { size } => format!("char{}", size * 8),
            AbstractType::Void => "void".to_owned(),
            AbstractType::Bool => "bool".to_owned(),
            AbstractType::Unknown { size } => {
                debug!("Skipping unknown type"; "size" => size, "over" => %over);
                return Ok(());
            }
            t @ (AbstractType::Array { .. } | AbstractType::Struct { .. }) => {
                return Err(Error::ByValueAggregate {
                    kind: t.kind(),
                    type_id,
                })
            }
            AbstractType::Pointer { pointee } => {
                let pointee = *pointee;
                return self.generate_ptr_constraint(over, side, type_id, pointee, output);
            }
            t @ AbstractType::Function { .. } => {
                return Err(Error::UnsupportedGroundTruthType {
                    kind: t.kind(),
                    type_id,
                })
            }
        };
        output.add(side.order(over, DerivedTypeVariable::new(atom)));
        Ok(())
    }

    fn generate_func_constraint(
        &mut self,
        func_name: &str,
        ret: Option<TypeId>,
        params: &[Option<TypeId>],
        output: &mut ConstraintSet,
    ) -> Result<()> {
        let func = DerivedTypeVariable::new(func_name);
        for (i, arg) in params.iter().enumerate() {
            if let Some(arg) = *arg {
                let in_dtv = func.add_suffix(AccessPathLabel::In(i));
                self.generate_constraint(in_dtv, Side::Left, arg, output)?;
            }
        }
        if let Some(ret) = ret {
            let out_dtv = func.add_suffix(AccessPathLabel::Out);
            self.generate_constraint(out_dtv, Side::Right, ret, output)?;
        }
        Ok(())
    }

    /// Constraints for the function `function_id`, along with its name. `None` if the function
    /// has no usable prototype or is unknown to the module.
    pub fn load_function(
        &mut self,
        function_id: NodeId,
    ) -> Result<Option<(String, ConstraintSet)>> {
        let module = self.module;
        let prototype = match module.prototypes.get(&function_id) {
            Some(p) => *p,
            None => return Ok(None),
        };
        let function = match module.function(function_id) {
            Some(f) => f,
            None => {
                warn!("Prototype for unknown function"; "function" => %function_id);
                return Ok(None);
            }
        };
        let name = filter_name(module, function);
        let (ret, params) = match module.types.get(prototype) {
            Some(AbstractType::Function { ret, params }) => (*ret, params),
            t => {
                warn!("Ignoring malformed prototype";
                      "function" => &name,
                      "type" => %prototype,
                      "kind" => t.map_or("missing", AbstractType::kind));
                return Ok(None);
            }
        };
        let mut constraints = ConstraintSet::new();
        self.generate_func_constraint(&name, ret, params, &mut constraints)?;
        Ok(Some((name, constraints)))
    }

    /// Constraints for all functions that have a prototype, by function name. Functions whose
    /// prototype refers to missing or unsized types are skipped.
    pub fn load_all(&mut self) -> Result<BTreeMap<String, ConstraintSet>> {
        let mut res = BTreeMap::new();
        let ids: Vec<NodeId> = self.module.prototypes.keys().copied().collect();
        for id in ids {
            match self.load_function(id) {
                Ok(Some((name, cs))) => {
                    res.insert(name, cs);
                }
                Ok(None) => {}
                Err(e @ (Error::DanglingTypeReference(_) | Error::UnsizedType(_))) => {
                    warn!("Ignoring prototype"; "function" => %id, "reason" => %e);
                }
                Err(e) => return Err(e),
            }
        }
        Ok(res)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::Isa;

    /// A quick helper to build up a module's type and prototype tables
    struct TypesBuilder {
        module: Module,
        functions: BTreeMap<String, NodeId>,
    }

    impl TypesBuilder {
        fn new(names: &[&str]) -> Self {
            let mut module = Module::new("test", Isa::X64);
            let mut functions = BTreeMap::new();
            for (i, name) in names.iter().enumerate() {
                let block = module.add_code_block(0x4000 + i as u64, 1, vec![]);
                functions.insert(name.to_string(), module.add_function(*name, block, []));
            }
            Self { module, functions }
        }
        fn add(&mut self, t: AbstractType) -> TypeId {
            self.module.types.insert(t)
        }
        fn void(&mut self) -> TypeId {
            self.add(AbstractType::Void)
        }
        fn integer(&mut self, size: usize, signed: bool) -> TypeId {
            self.add(AbstractType::Int { size, signed })
        }
        fn float(&mut self, size: usize) -> TypeId {
            self.add(AbstractType::Float { size })
        }
        fn pointer(&mut self, pointee: TypeId) -> TypeId {
            self.add(AbstractType::Pointer {
                pointee: Some(pointee),
            })
        }
        fn function(&mut self, args: Vec<TypeId>, ret: Option<TypeId>) -> TypeId {
            let ret = match ret {
                Some(r) => r,
                None => self.void(),
            };
            self.add(AbstractType::Function {
                ret: Some(ret),
                params: args.into_iter().map(Some).collect(),
            })
        }
        fn prototype(&mut self, name: &str, func: TypeId) {
            let f = self.functions[name];
            self.module.prototypes.insert(f, func);
        }
    }

    fn has(sets: &BTreeMap<String, ConstraintSet>, name: &str, constraint: &str) {
        let c: SubtypeConstraint = constraint.parse().unwrap();
        assert!(
            sets[name].contains(&c),
            "{} missing from {}:\n{}",
            constraint,
            name,
            sets[name]
        );
    }

    #[test]
    fn prototypes_become_constraints() {
        let mut b = TypesBuilder::new(&[
            "test1", "test2", "test3", "test4", "test5", "test6", "test7",
        ]);
        let i = b.integer(4, true);
        let f = b.function(vec![i], None);
        b.prototype("test1", f);

        let fl = b.float(4);
        let i = b.integer(4, true);
        let f = b.function(vec![fl], Some(i));
        b.prototype("test2", f);

        let i = b.integer(4, true);
        let p = b.pointer(i);
        let f = b.function(vec![p], None);
        b.prototype("test3", f);

        let i = b.integer(4, true);
        let p = b.pointer(i);
        let pp = b.pointer(p);
        let f = b.function(vec![pp], None);
        b.prototype("test4", f);

        let i = b.integer(4, true);
        let p = b.pointer(i);
        let pp = b.pointer(p);
        let f = b.function(vec![], Some(pp));
        b.prototype("test5", f);

        let i = b.integer(4, true);
        let fl = b.float(4);
        let s = b.add(AbstractType::Struct {
            size: 8,
            fields: vec![(0, i), (4, fl)],
        });
        let p = b.pointer(s);
        let f = b.function(vec![p], None);
        b.prototype("test6", f);

        let u = b.integer(4, false);
        let f = b.function(vec![u], None);
        b.prototype("test7", f);

        let mut reader = GroundTruthReader::new(&b.module);
        let sets = reader.load_all().unwrap();

        has(&sets, "test1", "test1.in_0 ⊑ int32");
        has(&sets, "test1", "void ⊑ test1.out");
        has(&sets, "test2", "test2.in_0 ⊑ float32");
        has(&sets, "test2", "int32 ⊑ test2.out");
        has(&sets, "test3", "test3.in_0.load.σ4@0 ⊑ int32");
        has(&sets, "test4", "test4.in_0.load.σ8@0.load.σ4@0 ⊑ int32");
        has(&sets, "test5", "int32 ⊑ test5.out.store.σ8@0.store.σ4@0");
        has(&sets, "test6", "test6.in_0.load.σ4@0 ⊑ int32");
        has(&sets, "test6", "test6.in_0.load.σ4@4 ⊑ float32");
        has(&sets, "test7", "test7.in_0 ⊑ uint32");
        assert!(reader.opaque_types().is_empty());
    }

    #[test]
    fn contentless_pointees_become_opaque_elements() {
        let mut b = TypesBuilder::new(&["f", "g"]);
        let s = b.add(AbstractType::Struct {
            size: 0,
            fields: vec![],
        });
        let p = b.pointer(s);
        let dangling = b.add(AbstractType::Pointer { pointee: None });
        let f = b.function(vec![p, dangling, p], None);
        b.prototype("f", f);

        let mut reader = GroundTruthReader::new(&b.module);
        let sets = reader.load_all().unwrap();
        let opaque = reader.opaque_types();
        assert_eq!(opaque.len(), 2);
        let p_atom = format!("opaque_{}", p);
        has(&sets, "f", &format!("f.in_0 ⊑ {}", p_atom));
        has(&sets, "f", &format!("f.in_2 ⊑ {}", p_atom));
        has(&sets, "f", &format!("f.in_1 ⊑ opaque_{}", dangling));
        assert_eq!(opaque[&DerivedTypeVariable::new(p_atom)], p);
        assert!(!sets.contains_key("g"));
    }

    #[test]
    fn by_value_aggregates_are_rejected() {
        let mut b = TypesBuilder::new(&["f"]);
        let i = b.integer(1, true);
        let a = b.add(AbstractType::Array {
            element: i,
            count: 4,
        });
        let f = b.function(vec![a], None);
        b.prototype("f", f);

        let mut reader = GroundTruthReader::new(&b.module);
        assert!(matches!(
            reader.load_all(),
            Err(Error::ByValueAggregate { kind: "array", .. })
        ));
    }

    #[test]
    fn unknown_types_are_skipped() {
        let mut b = TypesBuilder::new(&["f"]);
        let u = b.add(AbstractType::Unknown { size: 4 });
        let c = b.add(AbstractType::Char { size: 2 });
        let f = b.function(vec![u, c], None);
        b.prototype("f", f);

        let sets = GroundTruthReader::new(&b.module).load_all().unwrap();
        assert_eq!(sets["f"].len(), 2);
        has(&sets, "f", "f.in_1 ⊑ char16");
    }

    #[test]
    fn recursive_pointees_are_expanded_once() {
        let mut b = TypesBuilder::new(&["test_ll", "test_out"]);
        let i = b.integer(4, true);
        let next = b.add(AbstractType::Pointer { pointee: None });
        let node = b.add(AbstractType::Struct {
            size: 16,
            fields: vec![(0, i), (8, next)],
        });
        b.module.types.set_pointee(next, node);
        let f = b.function(vec![next], None);
        b.prototype("test_ll", f);
        let f = b.function(vec![], Some(next));
        b.prototype("test_out", f);

        let mut reader = GroundTruthReader::new(&b.module);
        let sets = reader.load_all().unwrap();
        has(&sets, "test_ll", "test_ll.in_0.load.σ4@0 ⊑ int32");
        has(&sets, "test_out", "int32 ⊑ test_out.out.store.σ4@0");
        assert_eq!(sets["test_ll"].len(), 2);
        assert!(reader.opaque_types().is_empty());
    }

    #[test]
    fn dangling_and_unsized_types_skip_only_their_function() {
        let mut b = TypesBuilder::new(&["f", "g", "h"]);
        let f = b.add(AbstractType::Function {
            ret: None,
            params: vec![Some(NodeId::fresh())],
        });
        b.prototype("f", f);

        let v = b.void();
        let s = b.add(AbstractType::Struct {
            size: 4,
            fields: vec![(0, v)],
        });
        let p = b.pointer(s);
        let g = b.function(vec![p], None);
        b.prototype("g", g);

        let i = b.integer(4, true);
        let h = b.function(vec![i], None);
        b.prototype("h", h);

        let sets = GroundTruthReader::new(&b.module).load_all().unwrap();
        assert_eq!(sets.len(), 1);
        has(&sets, "h", "h.in_0 ⊑ int32");
    }

    #[test]
    fn malformed_prototypes_give_no_constraints() {
        let mut b = TypesBuilder::new(&["f", "g"]);
        let i = b.integer(4, true);
        b.prototype("f", i);
        b.prototype("g", NodeId::fresh());

        let sets = GroundTruthReader::new(&b.module).load_all().unwrap();
        assert!(sets.is_empty());
    }
}
