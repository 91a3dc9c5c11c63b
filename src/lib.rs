pub mod c_type_generator;
pub mod c_type_printer;
pub mod c_types;
pub mod callgraph;
pub mod datalog;
pub mod error;
pub mod facts;
pub mod ground_truth;
pub mod inference;
pub mod inference_config;
pub mod ir;
pub mod ir_types;
pub mod ir_writer;
pub mod lattice;
pub mod schema;
pub mod solver;

pub use error::{Error, Result};

pub mod log {
    pub use slog_scope::{crit, debug, error, info, trace, warn};

    pub struct OptionalKV<V: slog::Value>(pub &'static str, pub Option<V>);
    impl<V: slog::Value> slog::KV for OptionalKV<V> {
        fn serialize(
            &self,
            record: &slog::Record,
            serializer: &mut dyn slog::Serializer,
        ) -> slog::Result {
            if let Some(v) = &self.1 {
                v.serialize(record, self.0, serializer)
            } else {
                Ok(())
            }
        }
    }

    /// How the root logger should be set up
    #[derive(Clone, Debug, Default)]
    pub struct LogConfig {
        /// Debug level (0-warn, 1-info, 2-debug, 3-trace)
        pub verbosity: usize,
        /// Disable terminal logging, even for high severity alerts
        pub disable_terminal_logging: bool,
        /// Force blocking for terminal logging, rather than dropping messages when too many are
        /// being sent
        pub force_block: bool,
        /// Path to send log (as JSON) to. Error or higher severity alerts still go to stderr.
        pub path: Option<std::path::PathBuf>,
    }

    fn severity(verbosity: usize) -> sloggers::types::Severity {
        match verbosity {
            0 => sloggers::types::Severity::Warning,
            1 => sloggers::types::Severity::Info,
            2 => sloggers::types::Severity::Debug,
            _ => sloggers::types::Severity::Trace,
        }
    }

    pub struct FileAndTermDrain {
        file_drain: Option<slog::Logger>,
        term_drain: slog::Logger,
    }
    impl FileAndTermDrain {
        pub fn new(config: &LogConfig) -> crate::Result<slog::Logger> {
            use sloggers::Build;

            let to_error = |e: sloggers::Error| crate::Error::Logging(e.to_string());
            let debug_level = severity(config.verbosity);

            let term_drain = if config.disable_terminal_logging {
                sloggers::null::NullLoggerBuilder.build().map_err(to_error)?
            } else {
                sloggers::terminal::TerminalLoggerBuilder::new()
                    .destination(sloggers::terminal::Destination::Stderr)
                    .level(if config.path.is_none() {
                        debug_level
                    } else {
                        sloggers::types::Severity::Error
                    })
                    .overflow_strategy(if config.force_block || config.path.is_none() {
                        sloggers::types::OverflowStrategy::Block
                    } else {
                        sloggers::types::OverflowStrategy::DropAndReport
                    })
                    .format(sloggers::types::Format::Compact)
                    .build()
                    .map_err(to_error)?
            };

            let file_drain = match &config.path {
                Some(path) => Some(
                    sloggers::file::FileLoggerBuilder::new(path)
                        .truncate()
                        .level(debug_level)
                        .overflow_strategy(sloggers::types::OverflowStrategy::Block)
                        .format(sloggers::types::Format::Json)
                        .build()
                        .map_err(to_error)?,
                ),
                None => None,
            };

            Ok(slog::Logger::root(
                Self {
                    file_drain,
                    term_drain,
                },
                slog::o!(),
            ))
        }
    }
    impl slog::Drain for FileAndTermDrain {
        type Ok = ();
        type Err = slog::Never;
        fn log(
            &self,
            r: &slog::Record<'_>,
            kv: &slog::OwnedKVList,
        ) -> Result<<Self as slog::Drain>::Ok, <Self as slog::Drain>::Err> {
            if let Some(f) = &self.file_drain {
                <slog::Logger as slog::Drain>::log(f, r, kv)?;
            }
            <slog::Logger as slog::Drain>::log(&self.term_drain, r, kv)?;
            Ok(())
        }
    }

    /// Build the root logger and install it as the global logger, for as long as the returned
    /// guard lives
    pub fn install(config: &LogConfig) -> crate::Result<slog_scope::GlobalLoggerGuard> {
        Ok(slog_scope::set_global_logger(FileAndTermDrain::new(
            config,
        )?))
    }

}
