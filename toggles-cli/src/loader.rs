use std::{
    collections::HashMap,
    fs,
    path::{Component, Path},
};

use walkdir::WalkDir;

use crate::{AppError, FileData, FlagsMap, Result, TargetMap};

/// Target every other target is merged on top of
pub const DEFAULT_TARGET: &str = "default";

/// Reads all YAML files in the root directory, validating and parsing them.
/// Then outputs flags grouped by target.
pub fn load_and_validate(root: &str) -> Result<TargetMap> {
    let mut grouped = TargetMap::new();
    let root_path = Path::new(root);
    for entry in WalkDir::new(root) {
        let dir_entry = entry?;

        // Only process files, skip directories
        if !dir_entry.file_type().is_file() {
            continue;
        }
        let path = dir_entry.path();
        let path_string = path.display().to_string();

        // Check file extension early, before structure validation
        // This allows non-yaml files (like README.md) anywhere in the tree
        match path.extension().and_then(|e| e.to_str()) {
            Some("yml") => {
                return Err(AppError::Validation(format!(
                    "Invalid file {}: expected .yaml, found .yml",
                    path_string
                )));
            }
            Some("yaml") => {}
            _ => continue,
        }

        // path relative to root
        let relative_path = path.strip_prefix(root_path).map_err(|e| {
            AppError::Validation(format!(
                "Failed to get relative path for {}: {} (root: {})",
                path.display(),
                e,
                root_path.display()
            ))
        })?;
        let parts: Vec<&str> = relative_path
            .components()
            .filter_map(|c| match c {
                Component::Normal(s) => s.to_str(),
                // ignore ., .., and other prefixes
                _ => None,
            })
            .collect();

        let [target, _fname]: [&str; 2] = parts.try_into().map_err(|_| {
            AppError::Validation(format!(
                "Invalid directory structure in {}: expected target/file.yaml",
                relative_path.display()
            ))
        })?;

        validate_target_name(target)?;

        let flags = validate_and_parse(&path_string)?;
        grouped.entry(target.to_string()).or_default().push(FileData {
            path: path_string,
            data: flags,
        });
    }

    if !grouped.is_empty() && !grouped.contains_key(DEFAULT_TARGET) {
        return Err(AppError::Validation(format!(
            "Missing required '{}' target",
            DEFAULT_TARGET
        )));
    }

    // sort files for determinism
    for by_file in grouped.values_mut() {
        by_file.sort();
    }

    Ok(grouped)
}

/// Target names end up in file names: lowercase alphanumeric and '-',
/// starting and ending with an alphanumeric character.
pub fn validate_target_name(name: &str) -> Result<()> {
    if let Some(c) = name
        .chars()
        .find(|&c| !matches!(c, 'a'..='z' | '0'..='9' | '-'))
    {
        return Err(AppError::Validation(format!(
            "Invalid target name '{}': invalid character '{}'. Use lowercase alphanumeric or '-'",
            name, c
        )));
    }
    if !name.starts_with(|c: char| c.is_ascii_alphanumeric())
        || !name.ends_with(|c: char| c.is_ascii_alphanumeric())
    {
        return Err(AppError::Validation(format!(
            "Invalid target name '{}': must start and end with alphanumeric character",
            name
        )));
    }
    Ok(())
}

/// Validates and parses a YAML file containing flag definitions.
/// Structure and typing are checked against the flag file schema.
fn validate_and_parse(path: &str) -> Result<FlagsMap> {
    let file = fs::File::open(path)?;

    let data: HashMap<String, serde_yaml::Value> =
        serde_yaml::from_reader(file).map_err(|e| AppError::YamlParse {
            path: path.to_string(),
            source: e,
        })?;

    // should only have one top level key named "flags"
    if data.len() != 1 || !data.contains_key("flags") {
        let mut keys: Vec<&String> = data.keys().collect();
        keys.sort();
        return Err(AppError::Validation(format!(
            "Invalid YAML structure in {}: expected exactly one top level key 'flags', found {:?}",
            path, keys
        )));
    }

    // Convert from serde_yaml::Value to serde_json::Value
    let document = serde_json::to_value(&data)?;
    let flags = toggles_validation::flags_from_document(document, Path::new(path))?;
    Ok(flags.into_iter().collect())
}

/// Checks flags in the same target for duplicate keys
pub fn ensure_no_duplicate_keys(grouped: &TargetMap) -> Result<()> {
    for filedata in grouped.values() {
        let mut key_to_file = HashMap::<&str, &str>::new();
        for FileData { path, data } in filedata {
            for key in data.keys() {
                if let Some(first_file) = key_to_file.get(key.as_str()) {
                    return Err(AppError::DuplicateKey {
                        key: key.to_string(),
                        first_file: first_file.to_string(),
                        second_file: path.to_string(),
                    });
                }
                key_to_file.insert(key, path);
            }
        }
    }
    Ok(())
}
