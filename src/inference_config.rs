//! A global store of flags that can impact inference.
//!
//! WARNING: Currently only supports a single consistent configuration amongst threads (i.e., cannot
//! have different configurations for different inference executions in the same process).

/// The global configuration store. Its fields are expected to be accessed across the program via
/// the global [`CONFIG`](static@CONFIG).
pub struct InferenceConfig {
    /// When both the Datalog rules and the prototype table provide constraints for the same
    /// function, use only the prototype table ones. If `false`, the two sets are unioned.
    pub ground_truth_overrides_datalog: bool,
    /// Read type annotations already present in the prototype table at all.
    pub load_ground_truth_types: bool,
    /// Compile the Datalog program rather than interpreting it.
    pub compile_datalog_program: bool,
    /// Whether to dump per-function sketch `.dot` files into the debug directory.
    pub dump_sketch_dot_files: bool,
    /// Whether to log the C-like rendering of all inferred types in debug mode.
    pub print_user_types_in_debug: bool,
    /// Whether to log every derived constraint in debug mode.
    pub log_derived_constraints_in_debug: bool,
}

impl InferenceConfig {
    /// Internal method: sets up initialization
    #[allow(static_mut_refs)]
    fn from_initialized() -> Self {
        let init = unsafe {
            INTERNAL_CONFIG_INITIALIZER
                .take()
                .expect("Should be initialized only once")
        };
        init.unwrap_or_default()
    }

    /// Initialize with the given command line configuration. Should only be called once, and should
    /// only be called before the first inference run.
    #[allow(static_mut_refs)]
    pub fn initialize(command_line_config: Vec<CommandLineInferenceConfig>) {
        let prev = unsafe { INTERNAL_CONFIG_INITIALIZER.replace(Some(command_line_config.into())) };
        assert!(prev.is_some(), "Performed double initialization");
        lazy_static::initialize(&CONFIG);
    }
}

/// Internal initialization detail.
static mut INTERNAL_CONFIG_INITIALIZER: Option<Option<InferenceConfig>> = Some(None);

lazy_static::lazy_static! {
    /// The global configuration store
    pub static ref CONFIG: InferenceConfig = InferenceConfig::from_initialized();
}

#[derive(clap::ArgEnum, Clone, Debug, PartialEq, Eq)]
/// Inference configuration parameters
pub enum CommandLineInferenceConfig {
    UnionGroundTruthWithDatalog,
    DisableGroundTruthTypes,
    CompileDatalogProgram,
    DisableSketchDotFiles,
    DisableUserTypePrinting,
    DisableDerivedConstraintLogging,
}

impl Default for InferenceConfig {
    fn default() -> Self {
        InferenceConfig {
            ground_truth_overrides_datalog: true,
            load_ground_truth_types: true,
            compile_datalog_program: false,
            dump_sketch_dot_files: true,
            print_user_types_in_debug: true,
            log_derived_constraints_in_debug: true,
        }
    }
}

impl From<Vec<CommandLineInferenceConfig>> for InferenceConfig {
    fn from(v: Vec<CommandLineInferenceConfig>) -> Self {
        use CommandLineInferenceConfig::*;
        let mut r = InferenceConfig::default();
        for v in v {
            match v {
                UnionGroundTruthWithDatalog => {
                    r.ground_truth_overrides_datalog = false;
                }
                DisableGroundTruthTypes => {
                    r.load_ground_truth_types = false;
                }
                CompileDatalogProgram => {
                    r.compile_datalog_program = true;
                }
                DisableSketchDotFiles => {
                    r.dump_sketch_dot_files = false;
                }
                DisableUserTypePrinting => {
                    r.print_user_types_in_debug = false;
                }
                DisableDerivedConstraintLogging => {
                    r.log_derived_constraints_in_debug = false;
                }
            }
        }
        r
    }
}
