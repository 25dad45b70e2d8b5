use std::{collections::HashMap, path::PathBuf};

use clap::{ArgAction, Parser, Subcommand, ValueEnum};
use toggles::{Bucketing, Context, ContextValue, FlagEvaluator};
use tracing::Level;

mod lint;
mod loader;
mod output;

/// Result type for operations
pub type Result<T> = std::result::Result<T, AppError>;

/// Errors that can occur during flag processing
#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[error("{0}")]
    Validation(String),

    #[error("Duplicate flag '{key}' found in {first_file} and {second_file}")]
    DuplicateKey {
        key: String,
        first_file: String,
        second_file: String,
    },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("YAML parse error in {path}: {source}")]
    YamlParse {
        path: String,
        #[source]
        source: serde_yaml::Error,
    },

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Directory walk error: {0}")]
    Walk(#[from] walkdir::Error),

    #[error("Flag source error: {0}")]
    Source(#[from] toggles_validation::ValidationError),

    #[error("{0}")]
    Flags(#[from] toggles::FlagsError),
}

#[derive(Parser, Debug)]
#[command(name = "toggles")]
#[command(version, about, long_about = None)]
struct Cli {
    #[arg(short, long, action = ArgAction::Count, global = true, help = "increase log verbosity")]
    verbose: u8,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Validate YAML flag definitions and write one JSON file per target
    Build {
        #[arg(long, env = "TOGGLES_ROOT", help = "root directory of the flag definitions")]
        root: String,

        #[arg(long, help = "output directory for final json files")]
        out: String,
    },

    /// Validate YAML flag definitions and report suspicious rules
    Check {
        #[arg(long, env = "TOGGLES_ROOT", help = "root directory of the flag definitions")]
        root: String,

        #[arg(long, help = "treat lint warnings as errors")]
        strict: bool,
    },

    /// Evaluate a flag against a context
    Eval {
        #[arg(long, help = "built JSON flag file; defaults to the TOGGLES_DIR chain")]
        file: Option<PathBuf>,

        #[arg(long, help = "flag key")]
        flag: String,

        #[arg(
            long = "context",
            short = 'c',
            value_parser = parse_context_pair,
            help = "context attribute as key=value, repeatable"
        )]
        context: Vec<(String, ContextValue)>,

        #[arg(long, help = "also resolve the variant")]
        variant: bool,

        #[arg(long, help = "print the result as JSON")]
        json: bool,
    },

    /// Print the rollout bucket of a user for a flag
    Bucket {
        #[arg(long, help = "user identifier")]
        user: String,

        #[arg(long, help = "flag key")]
        flag: String,

        #[arg(long, value_enum, default_value_t = BucketingArg::Rolling)]
        bucketing: BucketingArg,
    },
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum BucketingArg {
    Rolling,
    Sha1,
}

impl From<BucketingArg> for Bucketing {
    fn from(arg: BucketingArg) -> Self {
        match arg {
            BucketingArg::Rolling => Bucketing::Rolling,
            BucketingArg::Sha1 => Bucketing::Sha1,
        }
    }
}

/// Flag key to its raw definition
type FlagsMap = HashMap<String, serde_json::Value>;

/// Represents a filepath and its parsed YAML data
#[derive(Debug, PartialEq, Eq)]
struct FileData {
    path: String,
    data: FlagsMap,
}

impl Ord for FileData {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.path.cmp(&other.path)
    }
}

impl PartialOrd for FileData {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

/// Flag files grouped by target name
type TargetMap = HashMap<String, Vec<FileData>>;

/// Parse `key=value`. The value is read as a JSON scalar when it is one
/// (`true`, `42`, `"42"`), otherwise taken as a plain string.
fn parse_context_pair(raw: &str) -> std::result::Result<(String, ContextValue), String> {
    let (key, value) = raw
        .split_once('=')
        .ok_or_else(|| format!("expected key=value, found '{raw}'"))?;
    if key.is_empty() {
        return Err(format!("empty attribute name in '{raw}'"));
    }
    let value = serde_json::from_str::<ContextValue>(value)
        .unwrap_or_else(|_| ContextValue::String(value.to_string()));
    Ok((key.to_string(), value))
}

fn load_evaluator(file: Option<&PathBuf>) -> Result<FlagEvaluator> {
    let evaluator = match file {
        Some(file) => FlagEvaluator::from_file(file)?,
        None => FlagEvaluator::from_env()?,
    };
    Ok(evaluator)
}

fn run(command: Command) -> Result<()> {
    match command {
        Command::Build { root, out } => {
            let grouped = loader::load_and_validate(&root)?;
            loader::ensure_no_duplicate_keys(&grouped)?;
            let generated_at =
                chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Secs, true);
            let json_outputs = output::generate_json(&grouped, &generated_at)?;
            tracing::info!(files = json_outputs.len(), out = %out, "writing flag files");
            output::write_json(PathBuf::from(out), json_outputs)?;
        }
        Command::Check { root, strict } => {
            let grouped = loader::load_and_validate(&root)?;
            loader::ensure_no_duplicate_keys(&grouped)?;
            let warnings = lint::lint_targets(&grouped)?;
            for warning in &warnings {
                println!("{warning}");
            }
            println!(
                "checked {} target(s), {} warning(s)",
                grouped.len(),
                warnings.len()
            );
            if strict && !warnings.is_empty() {
                return Err(AppError::Validation(format!(
                    "{} lint warning(s) in strict mode",
                    warnings.len()
                )));
            }
        }
        Command::Eval {
            file,
            flag,
            context,
            variant,
            json,
        } => {
            let evaluator = load_evaluator(file.as_ref())?;
            let context: Context = context.into_iter().collect();
            let report = output::EvalReport::new(&evaluator, &flag, &context, variant);
            if json {
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                println!("{report}");
            }
        }
        Command::Bucket {
            user,
            flag,
            bucketing,
        } => {
            println!("{}", Bucketing::from(bucketing).bucket(&user, &flag));
        }
    }
    Ok(())
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let level = match cli.verbose {
        0 => Level::WARN,
        1 => Level::INFO,
        2 => Level::DEBUG,
        _ => Level::TRACE,
    };
    tracing_subscriber::fmt()
        .with_max_level(level)
        .with_writer(std::io::stderr)
        .init();

    run(cli.command)
}
