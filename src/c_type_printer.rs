//! Printable representation of inferred C-like types: function prototypes, and the definitions of
//! the structures and unions they reach.

use crate::c_types::{CType, CTypeIdx, InferredTypes};
use crate::log::*;
use itertools::Itertools;
use std::collections::{BTreeMap, BTreeSet, VecDeque};

/// A printable C-like type representation for inferred types.
#[derive(Debug)]
pub struct PrintableCTypes<'a> {
    inferred: &'a InferredTypes,
    /// Map of indices to external type names
    external_type_name: BTreeMap<CTypeIdx, String>,
    /// Types whose name is currently being computed
    in_progress: BTreeSet<CTypeIdx>,
    /// Source of freshness, for naming anonymous structures and unions
    type_name_stream: TypeNameStream,
}

impl<'a> PrintableCTypes<'a> {
    pub fn new(inferred: &'a InferredTypes) -> Self {
        let mut ret = Self {
            inferred,
            external_type_name: Default::default(),
            in_progress: Default::default(),
            type_name_stream: TypeNameStream::new(),
        };
        for idx in inferred.roots.values() {
            let _ = ret.external_type_name_at(*idx);
        }
        ret
    }

    /// Get the external type name for an index, if it is reachable from an inferred variable
    pub fn ext_type_name_at(&self, idx: CTypeIdx) -> Option<&str> {
        self.external_type_name.get(&idx).map(String::as_str)
    }

    fn name_or(&self, idx: Option<CTypeIdx>, default: &'static str) -> &str {
        idx.and_then(|i| self.ext_type_name_at(i)).unwrap_or(default)
    }

    fn external_name_or(&mut self, idx: Option<CTypeIdx>, default: &str) -> String {
        match idx {
            Some(i) => self.external_type_name_at(i),
            None => default.to_owned(),
        }
    }

    /// Internal only. Returns the external type name for the type at `idx`, setting it (and
    /// everything it reaches) up if needed.
    fn external_type_name_at(&mut self, idx: CTypeIdx) -> String {
        if let Some(name) = self.external_type_name.get(&idx) {
            return name.clone();
        }
        let inferred: &'a InferredTypes = self.inferred;
        let this = match inferred.types.get(idx) {
            Some(t) => t,
            None => {
                warn!("Dangling concrete type"; "idx" => %idx);
                return "undefined".into();
            }
        };

        if !self.in_progress.insert(idx) {
            // Only pointers can get here, since aggregates insert their name before recursing
            if let CType::Pointer {
                target: Some(target),
                ..
            } = this
            {
                if let Some(name) = self.external_type_name.get(target) {
                    return format!("{}*", name);
                }
            }
            debug!("Infinitely recursing type with nothing else to it. Setting to `void`"; "idx" => %idx);
            return "void".into();
        }

        let name = match this {
            CType::Pointer { target, .. } => format!("{}*", self.external_name_or(*target, "void")),
            CType::Array { member, length } => {
                format!("{}[{}]", self.external_name_or(*member, "undefined"), length)
            }
            CType::Struct { name, fields, .. } => {
                // We insert the name early on to bottom out recursion
                let this_name = name
                    .clone()
                    .unwrap_or_else(|| self.type_name_stream.new_name());
                self.external_type_name.insert(idx, this_name.clone());
                for field in fields {
                    let _ = self.external_name_or(field.ctype, "undefined");
                }
                this_name
            }
            CType::Union { name, members } => {
                let this_name = name
                    .clone()
                    .unwrap_or_else(|| self.type_name_stream.new_name());
                self.external_type_name.insert(idx, this_name.clone());
                for member in members {
                    let _ = self.external_name_or(*member, "undefined");
                }
                this_name
            }
            CType::Function { ret, params } => {
                let _ = self.external_name_or(*ret, "void");
                for param in params {
                    let _ = self.external_name_or(*param, "undefined");
                }
                "code".into()
            }
            t => t.to_printable().unwrap_or_else(|| t.kind().to_owned()),
        };

        self.in_progress.remove(&idx);
        self.external_type_name.insert(idx, name.clone());
        name
    }
}

impl<'a> std::fmt::Display for PrintableCTypes<'a> {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        let types = &self.inferred.types;
        for (var, &idx) in &self.inferred.roots {
            match types.get(idx) {
                Some(CType::Function { ret, params }) => writeln!(
                    f,
                    "{} {}({});",
                    self.name_or(*ret, "void"),
                    var,
                    params
                        .iter()
                        .map(|p| self.name_or(*p, "undefined"))
                        .join(", ")
                )?,
                _ => writeln!(f, "// {} : {}", var, self.name_or(Some(idx), "undefined"))?,
            }
        }

        let mut printed: BTreeSet<CTypeIdx> = Default::default();
        let mut queue: VecDeque<CTypeIdx> = self.inferred.roots.values().copied().collect();
        while let Some(idx) = queue.pop_front() {
            if !printed.insert(idx) {
                // Printed already
                continue;
            }
            match types.get(idx) {
                Some(CType::Pointer {
                    target: Some(t), ..
                })
                | Some(CType::Array {
                    member: Some(t), ..
                }) => queue.push_back(*t),
                Some(CType::Function { ret, params }) => {
                    queue.extend(ret.iter().chain(params.iter().flatten()).copied());
                }
                Some(CType::Struct { fields, .. }) => {
                    writeln!(f)?;
                    writeln!(f, "struct {} {{", self.name_or(Some(idx), "undefined"))?;
                    for field in fields {
                        writeln!(
                            f,
                            "  {} field_{};",
                            self.name_or(field.ctype, "undefined"),
                            field.offset
                        )?;
                        queue.extend(field.ctype);
                    }
                    writeln!(f, "}};")?;
                }
                Some(CType::Union { members, .. }) => {
                    writeln!(f)?;
                    writeln!(f, "union {} {{", self.name_or(Some(idx), "undefined"))?;
                    for (i, member) in members.iter().enumerate() {
                        writeln!(f, "  {} alt_{};", self.name_or(*member, "undefined"), i)?;
                        queue.extend(*member);
                    }
                    writeln!(f, "}};")?;
                }
                _ => {}
            }
        }
        Ok(())
    }
}

/// A source of fresh type names. Names are only guaranteed to be unique within the particular
/// stream (i.e., different streams may produce same names, but the same stream will always produce
/// different names, each time a new one is asked for).
#[derive(Debug)]
struct TypeNameStream {
    prefix: String,
    counter: u64,
}

impl TypeNameStream {
    /// New source
    fn new() -> Self {
        Self {
            prefix: "t".into(),
            counter: 0,
        }
    }

    /// Generate a new type name
    fn new_name(&mut self) -> String {
        self.counter += 1;
        format!("{}{}", self.prefix, self.counter)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::c_types::{CTypes, Field};
    use crate::schema::DerivedTypeVariable;

    fn inferred(types: CTypes, roots: &[(&str, CTypeIdx)]) -> InferredTypes {
        InferredTypes {
            types,
            roots: roots
                .iter()
                .map(|(n, i)| (DerivedTypeVariable::new(*n), *i))
                .collect(),
        }
    }

    #[test]
    fn printable_c_type_for_self_referential_struct() {
        let mut types = CTypes::new();
        let int = types.insert(CType::Int {
            width: 4,
            signed: true,
        });
        let ptr = types.insert(CType::Pointer {
            target: None,
            size: 8,
        });
        let s = types.insert(CType::Struct {
            name: None,
            size: 16,
            fields: vec![
                Field {
                    offset: 0,
                    ctype: Some(int),
                },
                Field {
                    offset: 8,
                    ctype: Some(ptr),
                },
            ],
        });
        types.set_pointer_target(ptr, s);
        let f = types.insert(CType::Function {
            ret: None,
            params: vec![Some(ptr), None],
        });
        let inferred = inferred(types, &[("f", f)]);

        let expected =
            "void f(t1*, undefined);\n\nstruct t1 {\n  int32_t field_0;\n  t1* field_8;\n};\n";
        let pct = PrintableCTypes::new(&inferred);
        eprintln!("\nExpected:\n{}\n", expected);
        eprintln!("\nGot:\n{}\n", pct);
        assert_eq!(pct.to_string(), expected);
        assert_eq!(pct.ext_type_name_at(s), Some("t1"));
    }

    #[test]
    fn printable_c_type_for_pointer_to_itself() {
        let mut types = CTypes::new();
        let ptr = types.insert(CType::Pointer {
            target: None,
            size: 8,
        });
        types.set_pointer_target(ptr, ptr);
        let chars = types.insert(CType::Char { width: 1 });
        let arr = types.insert(CType::Array {
            member: Some(chars),
            length: 4,
        });
        let g = types.insert(CType::Function {
            ret: Some(ptr),
            params: vec![Some(arr)],
        });
        let inferred = inferred(types, &[("g", g)]);

        assert_eq!(
            PrintableCTypes::new(&inferred).to_string(),
            "void* g(char[4]);\n"
        );
    }
}
