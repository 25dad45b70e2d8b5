use std::{collections::BTreeMap, fmt, fs, path::PathBuf};

use serde::Serialize;
use toggles::{Context, FlagEvaluator, Reason};

use crate::{AppError, FileData, Result, TargetMap, loader::DEFAULT_TARGET};

fn merge_keys(filedata: &[FileData]) -> BTreeMap<String, serde_json::Value> {
    filedata
        .iter()
        .flat_map(|f| f.data.iter())
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect()
}

/// Merge flags for a single target: the default target first, then the
/// target's own definitions replacing whole flags by key.
pub fn merge_flags_for_target(
    maps: &TargetMap,
    target: &str,
) -> Result<BTreeMap<String, serde_json::Value>> {
    let default_files = maps.get(DEFAULT_TARGET).ok_or_else(|| {
        AppError::Validation(format!("Missing required '{}' target", DEFAULT_TARGET))
    })?;

    let mut merged = merge_keys(default_files);

    if target != DEFAULT_TARGET {
        let target_files = maps
            .get(target)
            .ok_or_else(|| AppError::Validation(format!("Target '{}' not found", target)))?;
        merged.extend(merge_keys(target_files));
    }

    Ok(merged)
}

/// One `toggles-<target>.json` file per target, sorted by target name.
pub fn generate_json(maps: &TargetMap, generated_at: &str) -> Result<Vec<(String, String)>> {
    let mut targets: Vec<&String> = maps.keys().collect();
    targets.sort();

    targets
        .into_iter()
        .map(|target| {
            let flags = merge_flags_for_target(maps, target)?;
            let document = serde_json::json!({
                "flags": flags,
                "generated_at": generated_at,
            });
            Ok((
                format!("toggles-{target}.json"),
                serde_json::to_string(&document)?,
            ))
        })
        .collect()
}

pub fn write_json(out_path: PathBuf, json_outputs: Vec<(String, String)>) -> Result<()> {
    fs::create_dir_all(&out_path)?;
    for (filename, json_text) in json_outputs {
        fs::write(out_path.join(&filename), json_text)?;
    }
    Ok(())
}

/// Result of the `eval` command
#[derive(Debug, Serialize)]
pub struct EvalReport {
    flag: String,
    enabled: bool,
    reason: Reason,
    #[serde(skip_serializing_if = "Option::is_none")]
    variant: Option<Option<String>>,
}

impl EvalReport {
    pub fn new(
        evaluator: &FlagEvaluator,
        flag: &str,
        context: &Context,
        with_variant: bool,
    ) -> Self {
        let detail = evaluator.is_enabled_detail(flag, Some(context));
        Self {
            flag: flag.to_string(),
            enabled: detail.enabled,
            reason: detail.reason,
            variant: with_variant.then(|| evaluator.get_variant(flag, Some(context))),
        }
    }
}

impl fmt::Display for EvalReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = if self.enabled { "enabled" } else { "disabled" };
        write!(f, "{}: {} ({})", self.flag, state, self.reason)?;
        match &self.variant {
            Some(Some(name)) => write!(f, "\nvariant: {name}"),
            Some(None) => write!(f, "\nvariant: none"),
            None => Ok(()),
        }
    }
}
