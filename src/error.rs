//! Errors that abort a type recovery run.
//!
//! Missing data (absent prototypes, absent Datalog relations, functions missing from the symbol
//! table) is not represented here; it is logged and recovered from where it is found.

use crate::c_types::CTypeIdx;
use crate::ir::{Isa, NodeId};
use thiserror::Error;

/// Crate error type.
#[derive(Error, Debug)]
pub enum Error {
    /// An array or structure reached by value, which cannot be described by a flat access path.
    #[error("unable to handle by-value {kind} type {type_id}")]
    ByValueAggregate { kind: &'static str, type_id: NodeId },

    /// A type node the ground-truth reader has no constraint form for.
    #[error("unable to generate constraints for {kind} type {type_id}")]
    UnsupportedGroundTruthType { kind: &'static str, type_id: NodeId },

    /// The module's instruction set has no known pointer/register widths.
    #[error("architecture {0:?} is not supported")]
    UnsupportedArchitecture(Isa),

    /// A concrete type kind outside of what the writer can express in the type table.
    #[error("failed to translate concrete type of kind `{0}`")]
    UnsupportedConcreteType(&'static str),

    /// A size was requested for a type that does not have one.
    #[error("type {0} does not have a size")]
    UnsizedType(NodeId),

    /// A type graph refers to an identifier that is not in the type table.
    #[error("type {0} not found in the type table")]
    DanglingTypeReference(NodeId),

    /// A concrete type graph refers to a handle outside of its arena.
    #[error("concrete type {0} not found")]
    DanglingConcreteType(CTypeIdx),

    /// A subtype constraint string that does not follow the constraint grammar.
    #[error("malformed constraint `{text}`: {reason}")]
    MalformedConstraint { text: String, reason: String },

    /// A Datalog output row with fewer columns than its relation declares.
    #[error("malformed row in relation `{relation}`: {row:?}")]
    MalformedRelationRow { relation: String, row: Vec<String> },

    /// No Datalog engine binary could be located.
    #[error("failed to find `{0}` on PATH")]
    DatalogEngineNotFound(String),

    /// An external process returned non-success.
    #[error("`{tool}` failed with {status}")]
    ExternalTool { tool: String, status: String },

    /// The constraint solver reported a failure.
    #[error("solver failed: {0}")]
    Solver(String),

    /// A sketch could not be rendered as a graph.
    #[error("cannot draw sketch for `{0}`")]
    SketchRender(String),

    /// The log drains could not be built.
    #[error("failed to set up logging: {0}")]
    Logging(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Crate result type.
pub type Result<T> = std::result::Result<T, Error>;
