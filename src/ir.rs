//! The binary intermediate representation that types are recovered for.
//!
//! A disassembled [`Ir`] holds one or more [`Module`]s and the control-flow graph between their
//! blocks. Every block, symbol, function and type node is identified by a [`NodeId`] that is unique
//! within the running process. Instructions are already decoded, so only the register read/write
//! sets that the Datalog rules consume are kept.

use crate::error::{Error, Result};
use crate::ir_types::TypeTable;
use crate::log::*;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicU64, Ordering};

static NODE_COUNT: AtomicU64 = AtomicU64::new(1);

/// Process-wide unique identifier of an IR node.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, PartialOrd, Ord)]
pub struct NodeId(u64);

impl NodeId {
    /// A never-before-seen identifier
    pub fn fresh() -> Self {
        Self(NODE_COUNT.fetch_add(1, Ordering::SeqCst))
    }
}

impl std::fmt::Display for NodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{:08x}", self.0)
    }
}

/// Instruction set architecture of a module
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, PartialOrd, Ord)]
pub enum Isa {
    Undefined,
    IA32,
    PPC32,
    X64,
    ARM,
    ValidButUnsupported,
    PPC64,
    ARM64,
    MIPS32,
    MIPS64,
}

impl Isa {
    /// Pointer and register sizes, in bytes
    pub fn arch_sizes(self) -> Result<(usize, usize)> {
        use Isa::*;
        match self {
            X64 | ARM64 | MIPS64 | PPC64 => Ok((8, 8)),
            PPC32 => Ok((4, 8)),
            ARM | IA32 | MIPS32 => Ok((4, 4)),
            Undefined | ValidButUnsupported => Err(Error::UnsupportedArchitecture(self)),
        }
    }
}

/// A decoded machine instruction, reduced to its register accesses
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct Instruction {
    pub address: u64,
    /// Names of registers read, as the decoder spells them
    pub regs_read: Vec<String>,
    /// Names of registers written, as the decoder spells them
    pub regs_write: Vec<String>,
}

#[derive(Clone, PartialEq, Eq, Debug)]
pub struct CodeBlock {
    pub id: NodeId,
    pub address: u64,
    pub size: u64,
    pub instructions: Vec<Instruction>,
}

impl CodeBlock {
    pub fn contains_address(&self, addr: u64) -> bool {
        self.address <= addr && addr < self.address + self.size
    }
}

/// A stand-in for code outside of the module (e.g., an imported function)
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct ProxyBlock {
    pub id: NodeId,
}

#[derive(Clone, PartialEq, Eq, Debug)]
pub struct Symbol {
    pub id: NodeId,
    pub name: String,
    /// Block (or other node) the symbol refers to
    pub referent: Option<NodeId>,
}

#[derive(Clone, PartialEq, Eq, Debug)]
pub struct Function {
    pub id: NodeId,
    /// Linker-visible names; the first one is the canonical name
    pub names: Vec<String>,
    pub entry_blocks: BTreeSet<NodeId>,
    pub blocks: BTreeSet<NodeId>,
}

impl Function {
    /// Canonical name of the function
    pub fn name(&self) -> &str {
        self.names.first().map(String::as_str).unwrap_or_default()
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, PartialOrd, Ord)]
pub enum EdgeType {
    Branch,
    Call,
    Fallthrough,
    Return,
    Syscall,
    Sysret,
}

impl EdgeType {
    /// Spelling used in Datalog facts
    pub fn fact_name(self) -> &'static str {
        match self {
            EdgeType::Branch => "branch",
            EdgeType::Call => "call",
            EdgeType::Fallthrough => "fallthrough",
            EdgeType::Return => "return",
            EdgeType::Syscall => "syscall",
            EdgeType::Sysret => "sysret",
        }
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct EdgeLabel {
    pub edge_type: EdgeType,
    pub conditional: bool,
    pub direct: bool,
}

/// A control-flow edge between two blocks (code or proxy)
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct Edge {
    pub source: NodeId,
    pub target: NodeId,
    pub label: EdgeLabel,
}

/// A position inside of a block
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, PartialOrd, Ord)]
pub struct Offset {
    pub element_id: NodeId,
    pub displacement: u64,
}

/// Disassembler-provided Datalog relation: `(header, tab-separated rows)`
pub type EmbeddedRelation = (String, String);

#[derive(Debug)]
pub struct Module {
    pub name: String,
    pub isa: Isa,
    pub code_blocks: BTreeMap<NodeId, CodeBlock>,
    pub proxy_blocks: BTreeMap<NodeId, ProxyBlock>,
    pub symbols: Vec<Symbol>,
    pub functions: Vec<Function>,
    /// The type table
    pub types: TypeTable,
    /// Function id to the id of its function type in `types`
    pub prototypes: BTreeMap<NodeId, NodeId>,
    /// Free-form debug comments
    pub comments: BTreeMap<Offset, String>,
    /// Input relations the disassembler left behind
    pub souffle_facts: BTreeMap<String, EmbeddedRelation>,
    /// Output relations the disassembler left behind
    pub souffle_outputs: BTreeMap<String, EmbeddedRelation>,
}

impl Module {
    /// A new, empty module
    pub fn new(name: impl Into<String>, isa: Isa) -> Self {
        Self {
            name: name.into(),
            isa,
            code_blocks: Default::default(),
            proxy_blocks: Default::default(),
            symbols: Default::default(),
            functions: Default::default(),
            types: TypeTable::new(),
            prototypes: Default::default(),
            comments: Default::default(),
            souffle_facts: Default::default(),
            souffle_outputs: Default::default(),
        }
    }

    /// Pointer and register sizes, in bytes, for this module's ISA
    pub fn arch_sizes(&self) -> Result<(usize, usize)> {
        self.isa.arch_sizes()
    }

    pub fn add_code_block(
        &mut self,
        address: u64,
        size: u64,
        instructions: Vec<Instruction>,
    ) -> NodeId {
        let id = NodeId::fresh();
        self.code_blocks.insert(
            id,
            CodeBlock {
                id,
                address,
                size,
                instructions,
            },
        );
        id
    }

    pub fn add_proxy_block(&mut self) -> NodeId {
        let id = NodeId::fresh();
        self.proxy_blocks.insert(id, ProxyBlock { id });
        id
    }

    pub fn add_symbol(&mut self, name: impl Into<String>, referent: Option<NodeId>) -> NodeId {
        let id = NodeId::fresh();
        self.symbols.push(Symbol {
            id,
            name: name.into(),
            referent,
        });
        id
    }

    /// Add a function entered at `entry` and made up of `entry` plus `other_blocks`. A symbol
    /// with the function's name is added for the entry block.
    pub fn add_function(
        &mut self,
        name: impl Into<String>,
        entry: NodeId,
        other_blocks: impl IntoIterator<Item = NodeId>,
    ) -> NodeId {
        let name = name.into();
        let id = NodeId::fresh();
        self.add_symbol(name.clone(), Some(entry));
        let mut blocks: BTreeSet<NodeId> = other_blocks.into_iter().collect();
        blocks.insert(entry);
        self.functions.push(Function {
            id,
            names: vec![name],
            entry_blocks: std::iter::once(entry).collect(),
            blocks,
        });
        id
    }

    pub fn function(&self, id: NodeId) -> Option<&Function> {
        self.functions.iter().find(|f| f.id == id)
    }

    /// Lowest address among the function's entry blocks
    pub fn entry_address(&self, function: &Function) -> Option<u64> {
        function
            .entry_blocks
            .iter()
            .filter_map(|b| self.code_blocks.get(b))
            .map(|b| b.address)
            .min()
    }

    /// All code blocks covering `addr`
    pub fn code_blocks_on(&self, addr: u64) -> impl Iterator<Item = &CodeBlock> {
        self.code_blocks
            .values()
            .filter(move |b| b.contains_address(addr))
    }

    /// Translate an address into an offset within a block covering it. If several blocks cover
    /// the address, the first is used.
    pub fn addr_to_offset(&self, addr: u64) -> Option<Offset> {
        let mut blocks = self.code_blocks_on(addr);
        let block = match blocks.next() {
            Some(b) => b,
            None => {
                debug!("No blocks at address"; "addr" => format!("{:08x}", addr));
                return None;
            }
        };
        if blocks.next().is_some() {
            warn!("Multiple blocks at address"; "addr" => format!("{:08x}", addr));
        }
        Some(Offset {
            element_id: block.id,
            displacement: addr - block.address,
        })
    }

    /// Symbols that refer to `node`
    pub fn references(&self, node: NodeId) -> impl Iterator<Item = &Symbol> {
        self.symbols
            .iter()
            .filter(move |s| s.referent == Some(node))
    }
}

/// A whole disassembled program
#[derive(Debug, Default)]
pub struct Ir {
    pub modules: Vec<Module>,
    pub cfg: Vec<Edge>,
}

impl Ir {
    pub fn new(modules: Vec<Module>) -> Self {
        Self {
            modules,
            cfg: vec![],
        }
    }

    pub fn add_edge(&mut self, source: NodeId, target: NodeId, label: EdgeLabel) {
        self.cfg.push(Edge {
            source,
            target,
            label,
        });
    }

    pub fn code_block(&self, id: NodeId) -> Option<&CodeBlock> {
        self.modules.iter().find_map(|m| m.code_blocks.get(&id))
    }

    pub fn is_proxy_block(&self, id: NodeId) -> bool {
        self.modules.iter().any(|m| m.proxy_blocks.contains_key(&id))
    }

    /// First symbol referring to the proxy block `id`, if any
    pub fn proxy_symbol(&self, id: NodeId) -> Option<&Symbol> {
        self.modules
            .iter()
            .filter(|m| m.proxy_blocks.contains_key(&id))
            .find_map(|m| m.references(id).next())
    }
}
