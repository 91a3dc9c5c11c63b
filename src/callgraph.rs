//! Function naming and the caller/callee relation between functions.

use crate::ir::{EdgeType, Function, Ir, Module, NodeId};
use crate::log::*;
use std::collections::{BTreeMap, BTreeSet};

/// Name under which `function` is known to the Datalog rules, the solver and the type tables.
///
/// Names that contain `@` (versioned symbols) or `.` (compiler-generated clones) are not valid
/// identifiers in the constraint language, so such functions are named after their
/// [entry address](Module::entry_address) instead.
pub fn filter_name(module: &Module, function: &Function) -> String {
    let name = function.name();
    if name.contains('@') || name.contains('.') {
        format!("FUN_{}", module.entry_address(function).unwrap_or_default())
    } else {
        name.to_owned()
    }
}

/// Map of caller name to the names of all functions it directly calls. Every known function has
/// an entry, possibly empty. Calls from or to proxy blocks are not included.
pub fn get_callgraph(ir: &Ir) -> BTreeMap<String, BTreeSet<String>> {
    let mut callgraph: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();
    let mut block_to_func: BTreeMap<NodeId, String> = BTreeMap::new();

    for module in &ir.modules {
        for function in &module.functions {
            let name = filter_name(module, function);
            for block in &function.blocks {
                block_to_func.insert(*block, name.clone());
            }
            callgraph.entry(name).or_default();
        }
    }

    for edge in &ir.cfg {
        if edge.label.edge_type != EdgeType::Call
            || ir.is_proxy_block(edge.source)
            || ir.is_proxy_block(edge.target)
        {
            continue;
        }
        match (
            block_to_func.get(&edge.source),
            block_to_func.get(&edge.target),
        ) {
            (Some(caller), Some(callee)) => {
                callgraph
                    .entry(caller.clone())
                    .or_default()
                    .insert(callee.clone());
            }
            _ => {
                warn!("Call edge outside of any known function";
                      "source" => %edge.source, "target" => %edge.target);
            }
        }
    }

    callgraph
}
