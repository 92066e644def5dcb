use std::{path::PathBuf, process::ExitCode};

use clap::{Args, CommandFactory, Parser as ClapParser, Subcommand, error::ErrorKind};
use itertools::Itertools;
use log::LevelFilter;

use vasm::{
    CompiledModule, Error, assemble_modules,
    backend::{
        CompileOptions,
        assembler::{assemble, disassemble, parse_assembly},
        object::{Executable, FormatError, ObjectFile, link},
    },
    compile_module,
    frontend::{SourceFile, parser::Parser},
    middle::{
        ir::{builder::build_module, pretty_print::pretty_print_ir},
        optimization::{OptimizationKind, OptimizerFlags, dependency::analyze_dependencies},
    },
    vm::{OsHost, Strategy, VmConfig, VmExit, run_executable},
};

#[derive(Debug, ClapParser)]
#[command(version, about, long_about = None)]
struct Cli {
    /// Log more, repeat for even more. `VASM_LOG` is used otherwise.
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Compile source files into one object
    Compile {
        #[arg(required = true)]
        sources: Vec<PathBuf>,
        #[arg(short, long)]
        output: PathBuf,
        #[command(flatten)]
        optimizer: OptimizerArgs,
        /// Print the optimized IR of every function
        #[arg(long)]
        emit_ir: bool,
        /// Don't emit `_start` for `main`
        #[arg(long)]
        no_entry_stub: bool,
    },
    /// Assemble a text file into an object
    Asm {
        file: PathBuf,
        #[arg(short, long)]
        output: PathBuf,
    },
    /// Link objects into an executable
    Link {
        #[arg(required = true)]
        objects: Vec<PathBuf>,
        #[arg(short, long)]
        output: PathBuf,
        /// Leave out the label and relocation tables
        #[arg(long)]
        raw: bool,
    },
    /// Compile and link in one go
    Build {
        #[arg(required = true)]
        sources: Vec<PathBuf>,
        #[arg(short, long)]
        output: PathBuf,
        #[command(flatten)]
        optimizer: OptimizerArgs,
        #[arg(long)]
        raw: bool,
    },
    /// Run an executable
    Run {
        executable: PathBuf,
        /// Translate the code before running it
        #[arg(long)]
        threaded: bool,
        /// Fault after this many instructions
        #[arg(long)]
        max_steps: Option<u64>,
    },
    /// Print the instructions of an object or executable
    Disasm { file: PathBuf },
    /// List the variables no external effect depends on, per function
    Deps { source: PathBuf },
}

#[derive(Debug, Args)]
struct OptimizerArgs {
    /// Turn off an optimization
    #[arg(long = "disable", value_name = "RULE")]
    disabled: Vec<OptimizationKind>,
    /// Turn on an optimization that is off by default
    #[arg(long = "enable", value_name = "RULE")]
    enabled: Vec<OptimizationKind>,
    /// Turn off every optimization
    #[arg(long)]
    no_opt: bool,
}

impl OptimizerArgs {
    fn flags(&self) -> OptimizerFlags {
        let base = if self.no_opt {
            OptimizerFlags::none()
        } else {
            OptimizerFlags::default()
        };

        let enabled = self.enabled.iter().fold(base, |flags, kind| flags.with(*kind));
        self.disabled
            .iter()
            .fold(enabled, |flags, kind| flags.without(*kind))
    }
}

/// A failure that has already been reported
struct Reported;

fn main() -> ExitCode {
    let cli = Cli::parse();

    let mut logger =
        env_logger::Builder::from_env(env_logger::Env::new().filter_or("VASM_LOG", "warn"));
    match cli.verbose {
        0 => {}
        1 => {
            logger.filter_level(LevelFilter::Debug);
        }
        _ => {
            logger.filter_level(LevelFilter::Trace);
        }
    }
    logger.init();

    match run(cli.command) {
        Ok(code) => code,
        Err(Reported) => ExitCode::FAILURE,
    }
}

fn report(error: Error, source: Option<&SourceFile>) -> Reported {
    eprintln!("{}", error.render(source));
    Reported
}

fn read_sources(paths: Vec<PathBuf>) -> Result<Vec<SourceFile>, Reported> {
    for path in &paths {
        if !path.is_file() {
            Cli::command()
                .error(
                    ErrorKind::InvalidValue,
                    format!("Source file '{}' does not exist!", path.display()),
                )
                .exit()
        }
    }

    paths
        .into_iter()
        .map(|path| SourceFile::from_path(path).map_err(|e| report(e.into(), None)))
        .collect()
}

fn read(path: &PathBuf) -> Result<Vec<u8>, Reported> {
    std::fs::read(path).map_err(|e| report(e.into(), None))
}

fn write(path: &PathBuf, bytes: Result<Vec<u8>, FormatError>) -> Result<(), Reported> {
    let bytes = bytes.map_err(|e| report(e.into(), None))?;
    std::fs::write(path, bytes).map_err(|e| report(e.into(), None))
}

/// Compiles every source, reporting the first error
fn compile_all(
    sources: &[SourceFile],
    options: &CompileOptions,
) -> Result<Vec<CompiledModule>, Reported> {
    sources
        .iter()
        .map(|source| {
            compile_module(source, options).map_err(|errors| match errors.into_iter().next() {
                Some(error) => report(error, Some(source)),
                None => Reported,
            })
        })
        .collect()
}

fn run(command: Command) -> Result<ExitCode, Reported> {
    match command {
        Command::Compile {
            sources,
            output,
            optimizer,
            emit_ir,
            no_entry_stub,
        } => {
            let sources = read_sources(sources)?;
            let options = CompileOptions {
                flags: optimizer.flags(),
                entry_stub: !no_entry_stub,
            };
            let modules = compile_all(&sources, &options)?;

            if emit_ir {
                for function in modules.iter().flat_map(|module| &module.functions) {
                    println!("{}", pretty_print_ir(function));
                }
            }

            let object = assemble_modules(&modules).map_err(|e| report(e, None))?;
            write(&output, object.to_bytes())?;
        }
        Command::Asm { file, output } => {
            let text = String::from_utf8_lossy(&read(&file)?).into_owned();
            let items = parse_assembly(&text).map_err(|e| report(e.into(), None))?;
            let object = assemble(&items).map_err(|e| report(e.into(), None))?;
            write(&output, object.to_bytes())?;
        }
        Command::Link {
            objects,
            output,
            raw,
        } => {
            let objects = objects
                .iter()
                .map(|path| {
                    ObjectFile::from_bytes(&read(path)?).map_err(|e| report(e.into(), None))
                })
                .collect::<Result<Vec<_>, _>>()?;

            let executable = link(&objects, raw).map_err(|e| report(e.into(), None))?;
            write(&output, executable.to_bytes())?;
        }
        Command::Build {
            sources,
            output,
            optimizer,
            raw,
        } => {
            let sources = read_sources(sources)?;
            let options = CompileOptions {
                flags: optimizer.flags(),
                entry_stub: true,
            };
            let objects = compile_all(&sources, &options)?
                .into_iter()
                .map(|module| module.object)
                .collect_vec();

            let executable = link(&objects, raw).map_err(|e| report(e.into(), None))?;
            write(&output, executable.to_bytes())?;
        }
        Command::Run {
            executable,
            threaded,
            max_steps,
        } => {
            let executable =
                Executable::from_bytes(&read(&executable)?).map_err(|e| report(e.into(), None))?;
            let config = VmConfig {
                strategy: if threaded {
                    Strategy::Threaded
                } else {
                    Strategy::Direct
                },
                max_steps,
                ..VmConfig::default()
            };

            let (exit, _) = run_executable(&executable, config, OsHost::new())
                .map_err(|e| report(e.into(), None))?;

            return Ok(match exit {
                VmExit::Exited(code) => ExitCode::from(code as u8),
                // as if killed by SIGKILL
                VmExit::Aborted => ExitCode::from(128 + 9),
            });
        }
        Command::Disasm { file } => {
            let bytes = read(&file)?;
            let (code, labels) = match ObjectFile::from_bytes(&bytes) {
                Ok(object) => (object.code, object.labels),
                Err(_) => {
                    let executable =
                        Executable::from_bytes(&bytes).map_err(|e| report(e.into(), None))?;
                    let labels = executable.labels().to_vec();
                    (executable.code, labels)
                }
            };

            print!("{}", disassemble(&code, &labels));
        }
        Command::Deps { source } => {
            let sources = read_sources(vec![source])?;
            let source = &sources[0];

            let module =
                Parser::parse_module(source).map_err(|e| report(e.into(), Some(source)))?;
            let ir = build_module(&module, source);
            if let Some(error) = ir.errors.into_iter().next() {
                return Err(report(error.into(), Some(source)));
            }

            for function in &ir.functions {
                let dependencies = analyze_dependencies(function);
                println!("{}: {}", function.name, dependencies.nodepends.iter().join(", "));
            }
        }
    }

    Ok(ExitCode::SUCCESS)
}
