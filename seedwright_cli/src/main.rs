use seedwright_core::config::{ModelSource, SeedwrightConfig};
use seedwright_core::emitter::{Dialect, Emitter};
use seedwright_core::registry::variable_stem;
use seedwright_core::sequence::{Sequence, SequenceFormat};
use seedwright_core::{
    CallKind, LibraryDescriptor, Model, ResourceTypeId, SequenceValidator, builtin, feedback,
    generate_batch, scenarios_for,
};

use anyhow::Context;
use clap::{Args, Parser, Subcommand, ValueEnum};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[clap(author, version, about, long_about = None)]
struct Cli {
    /// Configuration file; defaults to ./seedwright.toml when present.
    #[clap(short, long, value_parser, global = true)]
    config_file: Option<PathBuf>,
    #[clap(subcommand)]
    command: Command,
}

#[derive(Args, Debug, Clone, Default)]
struct ModelArgs {
    /// Bundled descriptor name (zlib, sqlite, libpcap, cjson, re2, lcms).
    #[clap(long, conflicts_with = "descriptor")]
    library: Option<String>,
    /// Descriptor TOML file.
    #[clap(long)]
    descriptor: Option<PathBuf>,
}

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
enum FormatArg {
    Json,
    Bincode,
}

impl From<FormatArg> for SequenceFormat {
    fn from(format: FormatArg) -> Self {
        match format {
            FormatArg::Json => SequenceFormat::Json,
            FormatArg::Bincode => SequenceFormat::Bincode,
        }
    }
}

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
enum DialectArg {
    C,
    Cpp,
}

impl From<DialectArg> for Dialect {
    fn from(dialect: DialectArg) -> Self {
        match dialect {
            DialectArg::C => Dialect::C,
            DialectArg::Cpp => Dialect::Cpp,
        }
    }
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Check a sequence file against the lifecycle model.
    Validate {
        #[clap(long)]
        target: String,
        #[clap(flatten)]
        model: ModelArgs,
        #[clap(long, value_enum, default_value = "json")]
        format: FormatArg,
        /// Print the violation as JSON on stdout.
        #[clap(long)]
        json: bool,
        sequence: PathBuf,
    },
    /// Generate a batch of leak-free sequences for one target type.
    Generate {
        #[clap(long)]
        target: String,
        #[clap(flatten)]
        model: ModelArgs,
        #[clap(short = 'n', long)]
        count: Option<usize>,
        #[clap(long)]
        seed: Option<u64>,
        #[clap(long)]
        threads: Option<usize>,
        #[clap(long)]
        operate_budget: Option<usize>,
        #[clap(long, value_enum)]
        format: Option<FormatArg>,
        /// Directory for sequence files; JSON goes to stdout when absent.
        #[clap(long)]
        sequences_dir: Option<PathBuf>,
        /// Directory for emitted source units.
        #[clap(long)]
        out_dir: Option<PathBuf>,
        #[clap(long, value_enum)]
        dialect: Option<DialectArg>,
        /// Keep only sequences that add new call pairs.
        #[clap(long)]
        minimize: bool,
    },
    /// Validate and render one sequence as a source unit.
    Emit {
        #[clap(flatten)]
        model: ModelArgs,
        #[clap(long, value_enum, default_value = "json")]
        format: FormatArg,
        #[clap(long, value_enum)]
        dialect: Option<DialectArg>,
        #[clap(long, default_value_t = 0)]
        ordinal: usize,
        #[clap(short, long)]
        output: Option<PathBuf>,
        sequence: PathBuf,
    },
    /// List the resource types and calls of a descriptor.
    Catalog {
        #[clap(flatten)]
        model: ModelArgs,
    },
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    match try_main(cli) {
        Ok(code) => code,
        Err(err) => {
            eprintln!("error: {err:#}");
            ExitCode::from(2)
        }
    }
}

fn load_config(path: Option<&Path>) -> anyhow::Result<SeedwrightConfig> {
    match path {
        Some(path) => {
            tracing::info!(path = %path.display(), "loading configuration");
            SeedwrightConfig::load_from_file(path)
        }
        None => {
            let default_path = PathBuf::from("seedwright.toml");
            if default_path.exists() {
                tracing::info!("no config file specified, loading ./seedwright.toml");
                SeedwrightConfig::load_from_file(&default_path)
            } else {
                tracing::debug!("no config file found, using built-in defaults");
                Ok(SeedwrightConfig::default())
            }
        }
    }
}

/// Command-line selection wins over the config file; a descriptor path wins
/// over a bundled library name.
fn load_model(args: &ModelArgs, config: &SeedwrightConfig) -> anyhow::Result<Model> {
    let from_config = config.model.clone().unwrap_or(ModelSource {
        library: None,
        descriptor: None,
    });
    let (library, descriptor) = if args.library.is_some() || args.descriptor.is_some() {
        (args.library.clone(), args.descriptor.clone())
    } else {
        (from_config.library, from_config.descriptor)
    };

    let model = match (descriptor, library) {
        (Some(path), _) => LibraryDescriptor::load_from_file(&path)
            .and_then(LibraryDescriptor::into_model)
            .with_context(|| format!("loading descriptor {}", path.display()))?,
        (None, Some(name)) => {
            builtin::load(&name).with_context(|| format!("loading bundled library '{name}'"))?
        }
        (None, None) => anyhow::bail!(
            "no lifecycle model selected; pass --library or --descriptor (bundled: {})",
            builtin::names().collect::<Vec<_>>().join(", ")
        ),
    };
    tracing::info!(
        library = model.library(),
        resource_types = model.registry().len(),
        calls = model.catalog().len(),
        "lifecycle model loaded"
    );
    Ok(model)
}

fn read_sequence(path: &Path, format: SequenceFormat) -> anyhow::Result<Sequence> {
    let bytes = std::fs::read(path).with_context(|| format!("reading {}", path.display()))?;
    Sequence::decode(&bytes, format).with_context(|| format!("decoding {}", path.display()))
}

fn try_main(cli: Cli) -> anyhow::Result<ExitCode> {
    let mut config = load_config(cli.config_file.as_deref())?;

    match cli.command {
        Command::Validate {
            target,
            model,
            format,
            json,
            sequence,
        } => {
            let model = load_model(&model, &config)?;
            let sequence = read_sequence(&sequence, format.into())?;
            validate(&model, &target, &sequence, json)
        }
        Command::Generate {
            target,
            model,
            count,
            seed,
            threads,
            operate_budget,
            format,
            sequences_dir,
            out_dir,
            dialect,
            minimize,
        } => {
            let model = load_model(&model, &config)?;
            let batch = &mut config.batch;
            if let Some(count) = count {
                batch.count = count;
            }
            if let Some(seed) = seed {
                batch.seed = seed;
            }
            if let Some(threads) = threads {
                batch.threads = threads;
            }
            if let Some(operate_budget) = operate_budget {
                batch.operate_budget = operate_budget;
            }
            if let Some(format) = format {
                batch.format = format.into();
            }
            batch.minimize |= minimize;
            if let Some(dialect) = dialect {
                config.emitter.dialect = dialect.into();
            }
            generate(&model, &target, &config, sequences_dir, out_dir)
        }
        Command::Emit {
            model,
            format,
            dialect,
            ordinal,
            output,
            sequence,
        } => {
            let model = load_model(&model, &config)?;
            let mut sequence = read_sequence(&sequence, format.into())?;
            sequence.annotate(&model);
            if let Some(dialect) = dialect {
                config.emitter.dialect = dialect.into();
            }
            let emitter = Emitter::new(config.emitter.clone());
            match emitter.emit_validated(&model, &sequence, ordinal) {
                Ok(text) => {
                    match output {
                        Some(path) => std::fs::write(&path, text)
                            .with_context(|| format!("writing {}", path.display()))?,
                        None => print!("{text}"),
                    }
                    Ok(ExitCode::SUCCESS)
                }
                Err(err) => {
                    eprintln!("{err}");
                    Ok(ExitCode::from(1))
                }
            }
        }
        Command::Catalog { model } => {
            let model = load_model(&model, &config)?;
            print_catalog(&model);
            Ok(ExitCode::SUCCESS)
        }
    }
}

fn validate(model: &Model, target: &str, sequence: &Sequence, json: bool) -> anyhow::Result<ExitCode> {
    let target = ResourceTypeId::new(target);
    model
        .registry()
        .lookup(&target)
        .with_context(|| format!("--target '{target}'"))?;
    if let Some(declared) = &sequence.target {
        anyhow::ensure!(
            *declared == target,
            "sequence declares target '{declared}', but --target is '{target}'"
        );
    }

    match SequenceValidator::new(model).validate(sequence) {
        Ok(()) => {
            if json {
                println!("{}", serde_json::json!({ "ok": true }));
            } else {
                println!("OK");
            }
            Ok(ExitCode::SUCCESS)
        }
        Err(violation) => {
            eprintln!(
                "{} at invocation {}: {}",
                violation.kind, violation.index, violation.message
            );
            if json {
                println!("{}", serde_json::to_string(&violation)?);
            }
            Ok(ExitCode::from(1))
        }
    }
}

fn generate(
    model: &Model,
    target: &str,
    config: &SeedwrightConfig,
    sequences_dir: Option<PathBuf>,
    out_dir: Option<PathBuf>,
) -> anyhow::Result<ExitCode> {
    let batch = &config.batch;
    anyhow::ensure!(
        batch.format == SequenceFormat::Json || sequences_dir.is_some(),
        "bincode output needs --sequences-dir"
    );

    let scenarios = scenarios_for(target, batch.count, batch.operate_budget, batch.seed);
    let results = generate_batch(model, &config.generator, &scenarios, batch.threads);

    let mut sequences = Vec::with_capacity(results.len());
    for (scenario, result) in scenarios.iter().zip(results) {
        match result {
            Ok(sequence) => sequences.push(sequence),
            Err(err) => tracing::warn!(seed = scenario.seed, "scenario failed: {err}"),
        }
    }
    if sequences.is_empty() {
        eprintln!("no sequence could be generated for '{target}'");
        return Ok(ExitCode::from(1));
    }
    if batch.minimize {
        let kept = feedback::minimize(&sequences);
        sequences = kept.into_iter().map(|index| sequences[index].clone()).collect();
    }

    // Everything is rendered before the first write so a failing unit
    // leaves no partial batch behind.
    let stem = variable_stem(&ResourceTypeId::new(target));
    let mut files: Vec<(PathBuf, Vec<u8>)> = Vec::new();
    if let Some(dir) = &sequences_dir {
        let extension = match batch.format {
            SequenceFormat::Json => "json",
            SequenceFormat::Bincode => "bin",
        };
        for (ordinal, sequence) in sequences.iter().enumerate() {
            let path = dir.join(format!("{stem}_{ordinal}.{extension}"));
            files.push((path, sequence.encode(batch.format)?));
        }
    }
    if let Some(dir) = &out_dir {
        let emitter = Emitter::new(config.emitter.clone());
        let extension = match config.emitter.dialect {
            Dialect::C => "c",
            Dialect::Cpp => "cc",
        };
        for (ordinal, sequence) in sequences.iter().enumerate() {
            let text = match emitter.emit_validated(model, sequence, ordinal) {
                Ok(text) => text,
                Err(err) => {
                    eprintln!("sequence {ordinal} cannot be emitted: {err}");
                    return Ok(ExitCode::from(1));
                }
            };
            let path = dir.join(format!(
                "{}_{stem}_{ordinal}.{extension}",
                config.emitter.prefix
            ));
            files.push((path, text.into_bytes()));
        }
    }

    if sequences_dir.is_none() {
        println!("{}", serde_json::to_string_pretty(&sequences)?);
    }
    for dir in sequences_dir.iter().chain(out_dir.iter()) {
        std::fs::create_dir_all(dir).with_context(|| format!("creating {}", dir.display()))?;
    }
    for (path, bytes) in files {
        std::fs::write(&path, bytes).with_context(|| format!("writing {}", path.display()))?;
    }

    tracing::info!(
        generated = sequences.len(),
        requested = batch.count,
        "generation finished"
    );
    Ok(ExitCode::SUCCESS)
}

fn print_catalog(model: &Model) {
    println!("library {}", model.library());
    if !model.includes().is_empty() {
        println!("includes {}", model.includes().join(", "));
    }
    for resource in model.registry().types() {
        println!();
        println!(
            "resource {} ({:?}, {})",
            resource.id, resource.family, resource.host_type
        );
        let states: Vec<String> = resource
            .states
            .iter()
            .map(|state| {
                if resource.is_terminal(*state) {
                    format!("{state}*")
                } else {
                    state.to_string()
                }
            })
            .collect();
        println!("  states {}", states.join(" -> "));
        for transition in &resource.transitions {
            println!(
                "  {} --{}--> {}",
                transition.from, transition.call, transition.to
            );
        }
    }
    println!();
    for spec in model.catalog().calls() {
        let kind = match spec.kind() {
            CallKind::Constructor => "constructor",
            CallKind::DerivedConstructor => "derived constructor",
            CallKind::Destructor => "destructor",
            CallKind::Operation => "operation",
        };
        println!(
            "call {} = {} [{}, {}]",
            spec.id,
            spec.symbol(),
            kind,
            model.phase_of(spec).banner()
        );
    }
}
