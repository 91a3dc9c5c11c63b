//! Representations of C-like types, as produced by type inference and consumed by the
//! [`ir_writer`](crate::ir_writer)

use crate::ir::NodeId;
use crate::schema::DerivedTypeVariable;
use std::collections::BTreeMap;

/// Handle to a [`CType`] within a [`CTypes`] arena. Two handles are the same type node iff they
/// are equal, irrespective of the structure they point to.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, PartialOrd, Ord)]
pub struct CTypeIdx(usize);

impl std::fmt::Display for CTypeIdx {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "t{}", self.0)
    }
}

/// A structure member
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct Field {
    /// Byte offset from the start of the structure
    pub offset: usize,
    /// Member type, or `None` if nothing is known about it
    pub ctype: Option<CTypeIdx>,
}

/// A representation of C-like types.
///
/// References to other types are done through [`CTypeIdx`] handles, thus recursiveness in types is
/// factored out of this particular `enum` and instead handled by the [`CTypes`] arena.
#[derive(Clone, PartialEq, Eq, Debug)]
pub enum CType {
    Void,
    Bool,
    /// A character type of the given byte width
    Char { width: usize },
    /// An integer of the given byte width
    Int { width: usize, signed: bool },
    /// A floating point number of the given byte width
    Float { width: usize },
    /// A pointer to the given type (and also the size of the pointer)
    Pointer {
        target: Option<CTypeIdx>,
        size: usize,
    },
    /// A fixed-size array
    Array {
        member: Option<CTypeIdx>,
        length: usize,
    },
    /// A structure, with fields sorted by offset
    Struct {
        name: Option<String>,
        size: usize,
        fields: Vec<Field>,
    },
    Function {
        ret: Option<CTypeIdx>,
        params: Vec<Option<CTypeIdx>>,
    },
    /// A union of all the given types
    Union {
        name: Option<String>,
        members: Vec<Option<CTypeIdx>>,
    },
    /// Placeholder for a type the analysis kept un-decomposed, referring back to its type node in
    /// the binary IR
    Opaque(NodeId),
}

impl CType {
    /// Short name of the kind of type
    pub fn kind(&self) -> &'static str {
        match self {
            CType::Void => "void",
            CType::Bool => "bool",
            CType::Char { .. } => "char",
            CType::Int { .. } => "int",
            CType::Float { .. } => "float",
            CType::Pointer { .. } => "pointer",
            CType::Array { .. } => "array",
            CType::Struct { .. } => "struct",
            CType::Function { .. } => "function",
            CType::Union { .. } => "union",
            CType::Opaque(_) => "opaque",
        }
    }

    /// Convert scalars to a printable C name. `None` for types that need a name or a declarator.
    pub fn to_printable(&self) -> Option<String> {
        Some(match self {
            CType::Void => "void".into(),
            CType::Bool => "bool".into(),
            CType::Char { width: 1 } => "char".into(),
            CType::Char { width: 4 } => "wchar_t".into(),
            CType::Char { width } => format!("char{}_t", width * 8),
            CType::Int { width, signed } => {
                format!("{}int{}_t", if *signed { "" } else { "u" }, width * 8)
            }
            CType::Float { width: 4 } => "float".into(),
            CType::Float { width: 8 } => "double".into(),
            CType::Float { width: 10 | 16 } => "long double".into(),
            CType::Float { width } => format!("float{}_t", width * 8),
            CType::Opaque(id) => format!("opaque_{}", id),
            CType::Pointer { .. }
            | CType::Array { .. }
            | CType::Struct { .. }
            | CType::Function { .. }
            | CType::Union { .. } => return None,
        })
    }
}

/// An arena of [`CType`]s
#[derive(Clone, Debug, Default)]
pub struct CTypes {
    types: Vec<CType>,
}

impl CTypes {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert `t`, always producing a new node
    pub fn insert(&mut self, t: CType) -> CTypeIdx {
        self.types.push(t);
        CTypeIdx(self.types.len() - 1)
    }

    pub fn get(&self, idx: CTypeIdx) -> Option<&CType> {
        self.types.get(idx.0)
    }

    pub fn get_mut(&mut self, idx: CTypeIdx) -> Option<&mut CType> {
        self.types.get_mut(idx.0)
    }

    /// Backfill the target of the pointer at `ptr`. Does nothing if `ptr` is not a pointer.
    pub fn set_pointer_target(&mut self, ptr: CTypeIdx, target: CTypeIdx) {
        if let Some(CType::Pointer { target: t, .. }) = self.get_mut(ptr) {
            *t = Some(target);
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (CTypeIdx, &CType)> {
        self.types.iter().enumerate().map(|(i, t)| (CTypeIdx(i), t))
    }

    pub fn len(&self) -> usize {
        self.types.len()
    }

    pub fn is_empty(&self) -> bool {
        self.types.is_empty()
    }
}

impl std::ops::Index<CTypeIdx> for CTypes {
    type Output = CType;
    fn index(&self, index: CTypeIdx) -> &Self::Output {
        &self.types[index.0]
    }
}
impl std::ops::IndexMut<CTypeIdx> for CTypes {
    fn index_mut(&mut self, index: CTypeIdx) -> &mut Self::Output {
        &mut self.types[index.0]
    }
}

/// Result of type inference: a type graph plus the type of each inferred variable (usually,
/// functions).
#[derive(Clone, Debug, Default)]
pub struct InferredTypes {
    pub types: CTypes,
    pub roots: BTreeMap<DerivedTypeVariable, CTypeIdx>,
}

impl InferredTypes {
    /// Type of the function called `name`, if one was inferred
    pub fn function(&self, name: &str) -> Option<(CTypeIdx, &CType)> {
        let idx = *self.roots.get(&DerivedTypeVariable::new(name))?;
        Some((idx, &self.types[idx]))
    }
}
