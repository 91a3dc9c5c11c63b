//! The abstract type graph stored in a module's type table.
//!
//! Types refer to each other through [`TypeId`]s, which may form cycles (e.g., a linked list node
//! pointing at itself). Resolving an id goes through the owning [`TypeTable`].

use crate::error::{Error, Result};
use crate::ir::NodeId;
use std::collections::BTreeMap;

pub type TypeId = NodeId;

/// A node of the abstract type graph
#[derive(Clone, PartialEq, Eq, Debug)]
pub enum AbstractType {
    Void,
    Bool,
    Char { size: usize },
    Int { size: usize, signed: bool },
    Float { size: usize },
    /// A type known only by its size
    Unknown { size: usize },
    /// A pointer; `None` while its pointee is still being constructed
    Pointer { pointee: Option<TypeId> },
    Array { element: TypeId, count: usize },
    /// A structure with fields at the given byte offsets
    Struct {
        size: usize,
        fields: Vec<(usize, TypeId)>,
    },
    Function {
        ret: Option<TypeId>,
        params: Vec<Option<TypeId>>,
    },
}

impl AbstractType {
    pub fn kind(&self) -> &'static str {
        match self {
            AbstractType::Void => "void",
            AbstractType::Bool => "bool",
            AbstractType::Char { .. } => "char",
            AbstractType::Int { .. } => "int",
            AbstractType::Float { .. } => "float",
            AbstractType::Unknown { .. } => "unknown",
            AbstractType::Pointer { .. } => "pointer",
            AbstractType::Array { .. } => "array",
            AbstractType::Struct { .. } => "struct",
            AbstractType::Function { .. } => "function",
        }
    }
}

/// A module's type nodes, by id
#[derive(Clone, Debug, Default)]
pub struct TypeTable {
    types: BTreeMap<TypeId, AbstractType>,
}

impl TypeTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert `t` under a fresh id
    pub fn insert(&mut self, t: AbstractType) -> TypeId {
        let id = NodeId::fresh();
        self.types.insert(id, t);
        id
    }

    /// Insert `t` under a previously reserved id
    pub fn insert_with_id(&mut self, id: TypeId, t: AbstractType) {
        self.types.insert(id, t);
    }

    pub fn get(&self, id: TypeId) -> Option<&AbstractType> {
        self.types.get(&id)
    }

    /// Like [`Self::get`], but a missing node is an error
    pub fn resolve(&self, id: TypeId) -> Result<&AbstractType> {
        self.get(id).ok_or(Error::DanglingTypeReference(id))
    }

    pub fn contains(&self, id: TypeId) -> bool {
        self.types.contains_key(&id)
    }

    /// Backfill the pointee of the pointer `id`. Does nothing if `id` is not a pointer.
    pub fn set_pointee(&mut self, id: TypeId, pointee: TypeId) {
        if let Some(AbstractType::Pointer { pointee: p }) = self.types.get_mut(&id) {
            *p = Some(pointee);
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (TypeId, &AbstractType)> {
        self.types.iter().map(|(k, v)| (*k, v))
    }

    pub fn len(&self) -> usize {
        self.types.len()
    }

    pub fn is_empty(&self) -> bool {
        self.types.is_empty()
    }

    /// Size of the type `id` in bytes, given the size of a pointer.
    pub fn size_of(&self, id: TypeId, pointer_size: usize) -> Result<usize> {
        Ok(match self.resolve(id)? {
            AbstractType::Void | AbstractType::Function { .. } => {
                return Err(Error::UnsizedType(id))
            }
            AbstractType::Bool => 1,
            AbstractType::Char { size }
            | AbstractType::Int { size, .. }
            | AbstractType::Float { size }
            | AbstractType::Unknown { size }
            | AbstractType::Struct { size, .. } => *size,
            AbstractType::Pointer { .. } => pointer_size,
            AbstractType::Array { element, count } => self.size_of(*element, pointer_size)? * count,
        })
    }
}
