//! Extraction of the Datalog input relations from the binary IR.
//!
//! Each relation is written as `<name>.facts` into the facts directory, one tab-separated row per
//! line, which is the input format the Datalog engine reads.

use crate::error::Result;
use crate::ir::Ir;
use crate::log::*;
use itertools::Itertools;
use std::path::Path;

fn write_relation<R, C>(directory: &Path, name: &str, rows: R) -> Result<()>
where
    R: IntoIterator<Item = C>,
    C: IntoIterator,
    C::Item: std::fmt::Display,
{
    let mut text = String::new();
    let mut count = 0usize;
    for row in rows {
        text.push_str(&row.into_iter().join("\t"));
        text.push('\n');
        count += 1;
    }
    debug!("Writing relation"; "name" => name, "rows" => count);
    std::fs::write(directory.join(format!("{}.facts", name)), text)?;
    Ok(())
}

/// Write the relations the disassembler left embedded in the first module
pub fn extract_souffle_relations(ir: &Ir, directory: &Path) -> Result<()> {
    let module = match ir.modules.first() {
        Some(m) => m,
        None => return Ok(()),
    };
    for (name, (header, text)) in module
        .souffle_facts
        .iter()
        .chain(module.souffle_outputs.iter())
    {
        debug!("Writing embedded relation"; "name" => name, "header" => header);
        std::fs::write(directory.join(format!("{}.facts", name)), text)?;
    }
    Ok(())
}

/// `block_instruction`, `instruction_read_access` and `instruction_write_access`. Register names
/// are uppercased to match the names the disassembler uses.
pub fn extract_instruction_relations(ir: &Ir, directory: &Path) -> Result<()> {
    let mut block_instruction = vec![];
    let mut read_access = vec![];
    let mut write_access = vec![];

    for module in &ir.modules {
        for block in module.code_blocks.values() {
            for insn in &block.instructions {
                block_instruction.push([insn.address.to_string(), block.address.to_string()]);
                read_access.extend(
                    insn.regs_read
                        .iter()
                        .map(|r| [insn.address.to_string(), r.to_uppercase()]),
                );
                write_access.extend(
                    insn.regs_write
                        .iter()
                        .map(|r| [insn.address.to_string(), r.to_uppercase()]),
                );
            }
        }
    }

    write_relation(directory, "block_instruction", block_instruction)?;
    write_relation(directory, "instruction_read_access", read_access)?;
    write_relation(directory, "instruction_write_access", write_access)?;
    Ok(())
}

/// `block(address, size)` for every code block
pub fn extract_block_relations(ir: &Ir, directory: &Path) -> Result<()> {
    let blocks = ir
        .modules
        .iter()
        .flat_map(|m| m.code_blocks.values())
        .map(|b| [b.address, b.size]);
    write_relation(directory, "block", blocks)
}

/// `cfg_edge` between code blocks, `cfg_edge_to_symbol` for edges into proxy blocks with a
/// symbol, and `cfg_edge_to_top` for edges into anonymous proxy blocks
pub fn extract_edge_relations(ir: &Ir, directory: &Path) -> Result<()> {
    let mut edges = vec![];
    let mut symbol_edges = vec![];
    let mut top_edges = vec![];

    for edge in &ir.cfg {
        let source = match ir.code_block(edge.source) {
            Some(b) => b,
            None => continue,
        };
        let conditional = edge.label.conditional.to_string();
        let indirect = (!edge.label.direct).to_string();
        let label_type = edge.label.edge_type.fact_name().to_owned();

        if let Some(target) = ir.code_block(edge.target) {
            edges.push(vec![
                source.address.to_string(),
                target.address.to_string(),
                conditional,
                indirect,
                label_type,
            ]);
        } else if ir.is_proxy_block(edge.target) {
            match ir.proxy_symbol(edge.target) {
                Some(symbol) => symbol_edges.push(vec![
                    source.address.to_string(),
                    symbol.name.clone(),
                    conditional,
                    indirect,
                    label_type,
                ]),
                None => top_edges.push(vec![
                    source.address.to_string(),
                    conditional,
                    indirect,
                    label_type,
                ]),
            }
        }
    }

    write_relation(directory, "cfg_edge", edges)?;
    write_relation(directory, "cfg_edge_to_top", top_edges)?;
    write_relation(directory, "cfg_edge_to_symbol", symbol_edges)?;
    Ok(())
}

/// All relations describing the control flow graph
pub fn extract_cfg_relations(ir: &Ir, directory: &Path) -> Result<()> {
    extract_instruction_relations(ir, directory)?;
    extract_block_relations(ir, directory)?;
    extract_edge_relations(ir, directory)
}

/// `arch.pointer_size`, from the first module
pub fn extract_arch_relations(ir: &Ir, directory: &Path) -> Result<()> {
    let pointer_size = match ir.modules.first() {
        Some(m) => m.arch_sizes()?.0,
        None => return Ok(()),
    };
    std::fs::write(
        directory.join("arch.pointer_size.facts"),
        pointer_size.to_string(),
    )?;
    Ok(())
}

/// Every input relation the Datalog rules need
pub fn extract_all(ir: &Ir, directory: &Path) -> Result<()> {
    extract_souffle_relations(ir, directory)?;
    extract_cfg_relations(ir, directory)?;
    extract_arch_relations(ir, directory)
}
