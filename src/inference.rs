//! Driving a full type recovery run over a binary IR: Datalog fact extraction and evaluation,
//! constraint collection (generated plus prototype-table ground truth), solving, concrete type
//! generation, and writing results back.

use crate::c_type_generator::TypeGenerator;
use crate::c_type_printer::PrintableCTypes;
use crate::c_types::InferredTypes;
use crate::callgraph::get_callgraph;
use crate::datalog::{DatalogEngine, Relations};
use crate::error::{Error, Result};
use crate::facts;
use crate::ground_truth::GroundTruthReader;
use crate::inference_config::CONFIG;
use crate::ir::{Ir, Offset};
use crate::ir_writer::IrWriter;
use crate::lattice::{Lattice, LatticeCTypes};
use crate::log::*;
use crate::schema::{ConstraintSet, Program, SubtypeConstraint};
use crate::solver::{ConstraintSolver, SolverOutput};
use std::collections::btree_map::Entry;
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};

/// Relations requested from the Datalog engine
pub const SUBTYPE_RELS: [&str; 2] = ["subtype_constraint", "comment"];

/// A type recovery run over `ir`, using the Datalog engine `D`, the constraint solver `S` and
/// the concrete type generator `G`.
pub struct TypeInference<'a, D, S, G> {
    ir: &'a mut Ir,
    facts_dir: Option<PathBuf>,
    engine: D,
    solver: S,
    generator: G,
    callgraph: BTreeMap<String, BTreeSet<String>>,
    lattice: Lattice,
    lattice_ctypes: LatticeCTypes,
}

impl<'a, D, S, G> TypeInference<'a, D, S, G>
where
    D: DatalogEngine,
    S: ConstraintSolver,
    G: TypeGenerator,
{
    pub fn new(ir: &'a mut Ir, engine: D, solver: S, generator: G) -> Self {
        let callgraph = get_callgraph(&*ir);
        Self {
            ir,
            facts_dir: None,
            engine,
            solver,
            generator,
            callgraph,
            lattice: Lattice::new(),
            lattice_ctypes: LatticeCTypes::default(),
        }
    }

    /// Keep the extracted facts in `facts_dir` rather than in a temporary directory
    pub fn with_facts_dir(mut self, facts_dir: impl Into<PathBuf>) -> Self {
        self.facts_dir = Some(facts_dir.into());
        self
    }

    pub fn callgraph(&self) -> &BTreeMap<String, BTreeSet<String>> {
        &self.callgraph
    }

    /// The lattice used for the last solve; extended with any opaque types found
    pub fn lattice(&self) -> &Lattice {
        &self.lattice
    }

    pub fn lattice_ctypes(&self) -> &LatticeCTypes {
        &self.lattice_ctypes
    }

    pub fn ir(&self) -> &Ir {
        &*self.ir
    }

    fn run_datalog(&self, facts_dir: &Path, debug_dir: Option<&Path>) -> Result<Relations> {
        facts::extract_all(&*self.ir, facts_dir)?;
        info!("Executing Datalog rules"; "facts" => %facts_dir.display());
        self.engine.execute(facts_dir, &SUBTYPE_RELS, debug_dir)
    }

    /// Parse the `subtype_constraint` relation into per-function constraint sets. If
    /// `add_comments`, the `comment` rows in any of `debug_categories` are attached to the first
    /// module's comment table.
    fn insert_subtypes(
        &mut self,
        relations: &Relations,
        add_comments: bool,
        debug_categories: Option<&[String]>,
    ) -> Result<BTreeMap<String, ConstraintSet>> {
        let mut comments: BTreeMap<Offset, BTreeSet<String>> = BTreeMap::new();
        if let (Some(rows), Some(categories), Some(module)) = (
            relations.get("comment"),
            debug_categories,
            self.ir.modules.first(),
        ) {
            for row in rows {
                let (addr, comment, category) = match row.as_slice() {
                    [addr, comment, category, ..] => (addr, comment, category),
                    _ => {
                        return Err(Error::MalformedRelationRow {
                            relation: "comment".into(),
                            row: row.clone(),
                        })
                    }
                };
                if addr == "0" || !categories.iter().any(|c| c == category) {
                    continue;
                }
                let addr: u64 = addr.parse().map_err(|_| Error::MalformedRelationRow {
                    relation: "comment".into(),
                    row: row.clone(),
                })?;
                if let Some(offset) = module.addr_to_offset(addr) {
                    comments
                        .entry(offset)
                        .or_default()
                        .insert(comment.replace("??", "s"));
                }
            }
        }

        let mut constraint_map: BTreeMap<String, ConstraintSet> = BTreeMap::new();
        for row in relations.get("subtype_constraint").into_iter().flatten() {
            let (func, text) = match row.as_slice() {
                [func, text, _, ..] => (func, text),
                _ => {
                    return Err(Error::MalformedRelationRow {
                        relation: "subtype_constraint".into(),
                        row: row.clone(),
                    })
                }
            };
            let constraint: SubtypeConstraint = text.parse().map_err(|e| {
                error!("Failed to parse constraint"; "function" => func, "constraint" => text);
                e
            })?;
            constraint_map
                .entry(func.clone())
                .or_default()
                .add(constraint);
        }

        if add_comments {
            if let Some(module) = self.ir.modules.first_mut() {
                module.comments = comments
                    .into_iter()
                    .map(|(offset, c)| (offset, c.into_iter().collect::<Vec<_>>().join("\n# ")))
                    .collect();
            }
        }

        Ok(constraint_map)
    }

    /// Merge every module's prototype-table constraints into `constraints`, and extend the
    /// lattice with the opaque types they mention.
    fn load_ground_truth(&mut self, constraints: &mut BTreeMap<String, ConstraintSet>) -> Result<()> {
        if !CONFIG.load_ground_truth_types {
            info!("Not loading ground truth types");
            return Ok(());
        }
        let mut opaque = BTreeMap::new();
        for module in &self.ir.modules {
            let mut reader = GroundTruthReader::new(module);
            for (name, ground_truth) in reader.load_all()? {
                match constraints.entry(name) {
                    Entry::Vacant(e) => {
                        e.insert(ground_truth);
                    }
                    Entry::Occupied(mut e) if CONFIG.ground_truth_overrides_datalog => {
                        warn!("Ignoring generated constraints, type information is already populated";
                              "function" => e.key());
                        e.insert(ground_truth);
                    }
                    Entry::Occupied(mut e) => {
                        debug!("Merging generated constraints with type information";
                               "function" => e.key());
                        e.get_mut().extend(ground_truth);
                    }
                }
            }
            opaque.extend(reader.opaque_types());
        }
        if !opaque.is_empty() {
            debug!("Extending lattice"; "opaque_types" => opaque.len());
        }
        self.lattice = Lattice::new().extend(opaque.keys().cloned());
        self.lattice_ctypes = LatticeCTypes::new(opaque);
        Ok(())
    }

    /// Solve the constraints of the whole program. With a `debug_dir`, Datalog outputs, sketches
    /// and comments in any of `debug_categories` are kept for inspection.
    pub fn solve(
        &mut self,
        debug_dir: Option<&Path>,
        debug_categories: Option<&[String]>,
    ) -> Result<SolverOutput> {
        let relations = match &self.facts_dir {
            Some(dir) => self.run_datalog(dir, debug_dir)?,
            None => {
                let tmpdir = tempfile::tempdir()?;
                self.run_datalog(tmpdir.path(), debug_dir)?
            }
        };

        let mut constraints = self.insert_subtypes(&relations, debug_dir.is_some(), debug_categories)?;
        self.load_ground_truth(&mut constraints)?;

        let program = Program::new(self.lattice.clone(), constraints, self.callgraph.clone());
        info!("Solving constraints"; "functions" => program.constraints.len());
        let output = self.solver.solve(&program, debug_dir.is_some())?;

        if let Some(debug_dir) = debug_dir {
            if CONFIG.log_derived_constraints_in_debug {
                for (dtv, derived) in &output.derived {
                    debug!("Derived constraints";
                           "function" => %dtv,
                           OptionalKV("original", program.constraints.get(dtv.base()).map(|c| c.to_string())),
                           "derived" => %derived);
                }
            }
            if CONFIG.dump_sketch_dot_files {
                for (dtv, sketch) in &output.sketches {
                    if sketch.is_empty() {
                        continue;
                    }
                    let out = debug_dir.join(format!("{}.dot", dtv.base()));
                    let written = sketch
                        .to_dot(dtv)
                        .and_then(|dot| std::fs::write(&out, dot).map_err(Error::from));
                    if let Err(e) = written {
                        warn!("Cannot draw sketch"; "dtv" => %dtv, "error" => %e);
                    }
                }
            }
        }

        Ok(output)
    }

    /// Solve, then generate a concrete type for every function
    pub fn infer(
        &mut self,
        debug_dir: Option<&Path>,
        debug_categories: Option<&[String]>,
    ) -> Result<InferredTypes> {
        let (pointer_size, register_size) = match self.ir.modules.first() {
            Some(module) => module.arch_sizes()?,
            None => {
                warn!("No modules to infer types for");
                return Ok(InferredTypes::default());
            }
        };
        let output = self.solve(debug_dir, debug_categories)?;

        let inferred = self.generator.generate(
            &output.sketches,
            &self.lattice,
            &self.lattice_ctypes,
            register_size,
            pointer_size,
        )?;
        if debug_dir.is_some() && CONFIG.print_user_types_in_debug {
            debug!("Inferred user types"; "types" => %PrintableCTypes::new(&inferred));
        }
        Ok(inferred)
    }

    /// Record `inferred` in the prototype table of every module
    pub fn write_types(&mut self, inferred: &InferredTypes) -> Result<()> {
        for module in self.ir.modules.iter_mut() {
            IrWriter::new(module).add_types(inferred)?;
        }
        Ok(())
    }
}
