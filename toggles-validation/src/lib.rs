//! Flag file loading and validation for toggles
//!
//! Flag definitions live in JSON files shaped as `{"flags": {"<key>": {...}}}`.
//! Every file is checked against an embedded JSON Schema before its flags are
//! handed to the evaluator. Flags are returned as raw JSON so that this crate
//! stays independent of the evaluator's types.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use serde_json::Value;

/// Embedded schema every flag file must satisfy
const FLAGS_SCHEMA_JSON: &str = include_str!("flags-schema.json");
const FLAGS_FILE_EXTENSION: &str = "json";

/// Environment variable pointing at the flags directory
pub const FLAGS_DIR_ENV: &str = "TOGGLES_DIR";
const SYSTEM_FLAGS_DIR: &str = "/etc/toggles";
const LOCAL_FLAGS_DIR: &str = "toggles";

/// Result type for validation operations
pub type ValidationResult<T> = Result<T, ValidationError>;

/// Flag key to its raw JSON definition, sorted by key
pub type FlagDocuments = BTreeMap<String, Value>;

/// Errors that can occur while loading and validating flag files
#[derive(Debug, thiserror::Error)]
pub enum ValidationError {
    #[error("Schema error in {file}: {message}")]
    SchemaError { file: PathBuf, message: String },

    #[error("Duplicate flag '{key}' found in {first_file} and {second_file}")]
    DuplicateFlag {
        key: String,
        first_file: PathBuf,
        second_file: PathBuf,
    },

    #[error("Failed to read file: {0}")]
    FileRead(#[from] std::io::Error),

    #[error("Failed to parse JSON: {0}")]
    JSONParse(#[from] serde_json::Error),
}

/// Resolve the flags directory: `TOGGLES_DIR` if set, then `/etc/toggles`
/// if it exists, otherwise `toggles/` relative to the working directory.
pub fn resolve_flags_dir() -> PathBuf {
    if let Ok(dir) = std::env::var(FLAGS_DIR_ENV)
        && !dir.is_empty()
    {
        return PathBuf::from(dir);
    }
    let system = Path::new(SYSTEM_FLAGS_DIR);
    if system.is_dir() {
        return system.to_path_buf();
    }
    PathBuf::from(LOCAL_FLAGS_DIR)
}

fn flags_validator() -> &'static jsonschema::Validator {
    static VALIDATOR: OnceLock<jsonschema::Validator> = OnceLock::new();
    VALIDATOR.get_or_init(|| {
        let schema: Value =
            serde_json::from_str(FLAGS_SCHEMA_JSON).expect("Invalid flags-schema JSON");
        jsonschema::validator_for(&schema).expect("Failed to compile flags-schema")
    })
}

/// Validate a parsed flag document against the flags schema
///
/// # Arguments
/// * `document` - the whole file contents, including the `flags` wrapper
/// * `path` - file the document came from, used in error messages
///
/// # Errors
/// Returns `SchemaError` listing every violation
pub fn validate_document(document: &Value, path: &Path) -> ValidationResult<()> {
    let output = flags_validator().evaluate(document);

    if output.flag().valid {
        Ok(())
    } else {
        let errors: Vec<String> = output
            .iter_errors()
            .map(|e| format!("Error: {}", e.error))
            .collect();

        Err(ValidationError::SchemaError {
            file: path.to_path_buf(),
            message: format!("Schema validation failed:\n{}", errors.join("\n")),
        })
    }
}

/// Validate a document and return the flags it defines
pub fn flags_from_document(document: Value, path: &Path) -> ValidationResult<FlagDocuments> {
    validate_document(&document, path)?;

    let Value::Object(mut root) = document else {
        // the schema requires an object root
        return Err(ValidationError::SchemaError {
            file: path.to_path_buf(),
            message: "expected a JSON object".to_string(),
        });
    };
    match root.remove("flags") {
        Some(Value::Object(flags)) => Ok(flags.into_iter().collect()),
        _ => Err(ValidationError::SchemaError {
            file: path.to_path_buf(),
            message: "expected 'flags' to be an object".to_string(),
        }),
    }
}

/// Load and validate a single flag file
pub fn load_flags_file(path: &Path) -> ValidationResult<FlagDocuments> {
    let file = fs::File::open(path)?;
    let document: Value = serde_json::from_reader(file)?;
    flags_from_document(document, path)
}

/// Load every `*.json` flag file in `dir`
///
/// Files are read in name order. A directory that does not exist yields no
/// flags. A key defined in more than one file is rejected.
///
/// # Errors
/// Returns the first I/O, parse, schema or duplicate-key error encountered
pub fn load_flags_dir(dir: &Path) -> ValidationResult<FlagDocuments> {
    if !dir.exists() {
        return Ok(FlagDocuments::new());
    }

    let mut files = Vec::new();
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        if entry.file_type()?.is_file()
            && path.extension().and_then(|e| e.to_str()) == Some(FLAGS_FILE_EXTENSION)
        {
            files.push(path);
        }
    }
    // sort files for determinism
    files.sort();

    let mut flags = FlagDocuments::new();
    let mut origin: BTreeMap<String, PathBuf> = BTreeMap::new();
    for path in files {
        for (key, definition) in load_flags_file(&path)? {
            if let Some(first_file) = origin.get(&key) {
                return Err(ValidationError::DuplicateFlag {
                    key,
                    first_file: first_file.clone(),
                    second_file: path,
                });
            }
            origin.insert(key.clone(), path.clone());
            flags.insert(key, definition);
        }
    }

    Ok(flags)
}
