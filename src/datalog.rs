//! Running the Datalog rules that generate subtype constraints from the extracted facts.

use crate::error::{Error, Result};
use crate::inference_config::CONFIG;
use crate::log::*;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::Command;

/// Output relations by name, each a list of rows of columns
pub type Relations = BTreeMap<String, Vec<Vec<String>>>;

/// A Datalog engine that can evaluate the constraint generation rules
pub trait DatalogEngine {
    /// Evaluate over the facts in `facts_dir` and return the requested output relations. If
    /// `debug_dir` is given, all outputs are left there.
    fn execute(
        &self,
        facts_dir: &Path,
        output_relations: &[&str],
        debug_dir: Option<&Path>,
    ) -> Result<Relations>;
}

impl<T: DatalogEngine + ?Sized> DatalogEngine for &T {
    fn execute(
        &self,
        facts_dir: &Path,
        output_relations: &[&str],
        debug_dir: Option<&Path>,
    ) -> Result<Relations> {
        (**self).execute(facts_dir, output_relations, debug_dir)
    }
}

/// The Soufflé Datalog engine, run as an external process
#[derive(Clone, Debug)]
pub struct Souffle {
    binary: Option<PathBuf>,
    program: PathBuf,
    compiled: bool,
}

impl Souffle {
    /// Run the Datalog `program` with the `souffle` found on `PATH`
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            binary: None,
            program: program.into(),
            compiled: CONFIG.compile_datalog_program,
        }
    }

    /// Use the given `souffle` binary rather than searching `PATH`
    pub fn with_binary(mut self, binary: impl Into<PathBuf>) -> Self {
        self.binary = Some(binary.into());
        self
    }

    /// Compile the program rather than interpreting it
    pub fn compiled(mut self, compiled: bool) -> Self {
        self.compiled = compiled;
        self
    }

    fn find_souffle(&self) -> Result<PathBuf> {
        if let Some(b) = &self.binary {
            return Ok(b.clone());
        }
        let path = std::env::var_os("PATH").unwrap_or_default();
        std::env::split_paths(&path)
            .map(|dir| dir.join("souffle"))
            .find(|candidate| candidate.is_file())
            .ok_or_else(|| Error::DatalogEngineNotFound("souffle".into()))
    }
}

impl DatalogEngine for Souffle {
    fn execute(
        &self,
        facts_dir: &Path,
        output_relations: &[&str],
        debug_dir: Option<&Path>,
    ) -> Result<Relations> {
        let souffle = self.find_souffle()?;
        let tmpdir = tempfile::tempdir()?;
        let output_dir = debug_dir.unwrap_or_else(|| tmpdir.path());

        let mut command = Command::new(&souffle);
        command
            .arg(format!("--fact-dir={}", facts_dir.display()))
            .arg(format!("--output-dir={}", output_dir.display()))
            .arg("--macro='DEBUG=1'");
        if self.compiled {
            command
                .arg("--compile")
                .arg(format!("--generate={}", output_dir.join("prog.cpp").display()));
        }
        command.arg(&self.program);

        info!("Executing souffle"; "program" => %self.program.display(), "compiled" => self.compiled);
        let status = command.status()?;
        if !status.success() {
            return Err(Error::ExternalTool {
                tool: souffle.display().to_string(),
                status: status.to_string(),
            });
        }

        read_relations(output_dir, output_relations)
    }
}

/// Read the `<relation>.csv` output files from `directory`. A missing file produces an empty
/// relation.
pub fn read_relations(directory: &Path, output_relations: &[&str]) -> Result<Relations> {
    let mut output = Relations::new();
    for rel in output_relations {
        let path = directory.join(format!("{}.csv", rel));
        let rows: Vec<Vec<String>> = if path.exists() {
            std::fs::read_to_string(&path)?
                .lines()
                .map(|line| line.split('\t').map(str::to_owned).collect())
                .collect()
        } else {
            warn!("No data for relation"; "relation" => *rel);
            vec![]
        };
        output.insert((*rel).to_owned(), rows);
    }
    Ok(output)
}
