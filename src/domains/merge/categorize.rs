use std::path::Path;

use log::{debug, warn};
use similar::{ChangeTag, TextDiff};

use crate::domains::git::process::run_git_sync;
use crate::domains::merge::types::{
    FileCategory, FileResolution, PlannedResolution, ResolutionStrategy,
};

/// Classifies a conflicted file by extension and path, in priority order:
/// docs, then test, then schema, then config, with source as the rest.
pub fn categorize_file(path: &str) -> FileCategory {
    let lower = path.to_lowercase();
    let file_name = lower.rsplit('/').next().unwrap_or(&lower);
    let extension = file_name.rsplit_once('.').map(|(_, ext)| ext).unwrap_or("");

    if matches!(extension, "md" | "markdown") || file_name.contains("readme") {
        return FileCategory::Docs;
    }
    if lower.contains("__tests__") || lower.contains("test") || lower.contains("spec") {
        return FileCategory::Test;
    }
    if extension == "sql" || lower.contains("schema") || lower.contains("migration") {
        return FileCategory::Schema;
    }
    if matches!(extension, "json" | "yaml" | "yml" | "toml")
        || file_name.starts_with('.')
        || file_name.contains("config")
    {
        return FileCategory::Config;
    }
    FileCategory::Source
}

pub fn strategy_for(category: FileCategory) -> ResolutionStrategy {
    match category {
        // Additive content: never silently drop either side.
        FileCategory::Docs | FileCategory::Test => ResolutionStrategy::Union,
        // Schemas evolve forward; the incoming branch wins.
        FileCategory::Schema => ResolutionStrategy::Theirs,
        // Config drift needs human review; the local side wins.
        FileCategory::Config => ResolutionStrategy::Ours,
        FileCategory::Source => ResolutionStrategy::Recursive,
    }
}

fn describe(category: FileCategory, strategy: ResolutionStrategy) -> String {
    match strategy {
        ResolutionStrategy::Union => format!("{}: keep both sides", category.as_str()),
        ResolutionStrategy::Theirs => format!("{}: take incoming version", category.as_str()),
        ResolutionStrategy::Ours => format!("{}: keep local version", category.as_str()),
        ResolutionStrategy::Recursive => format!(
            "{}: three-way merge, incoming version on failure",
            category.as_str()
        ),
    }
}

/// Builds the per-file plan for one merge attempt. Consumed immediately and
/// discarded once the merge commits or aborts.
pub fn build_resolution_plan(files: &[String]) -> Vec<PlannedResolution> {
    files
        .iter()
        .map(|file| {
            let category = categorize_file(file);
            let strategy = strategy_for(category);
            PlannedResolution {
                file: file.clone(),
                category,
                strategy,
                description: describe(category, strategy),
            }
        })
        .collect()
}

/// Line-level union of two conflicting revisions: common lines once, lines
/// unique to either side kept in diff order.
pub fn union_merge_lines(ours: &str, theirs: &str) -> String {
    let diff = TextDiff::from_lines(ours, theirs);
    let mut merged = String::new();
    for change in diff.iter_all_changes() {
        match change.tag() {
            ChangeTag::Equal | ChangeTag::Delete | ChangeTag::Insert => {
                merged.push_str(change.value());
                if !change.value().ends_with('\n') {
                    merged.push('\n');
                }
            }
        }
    }
    merged
}

/// Index stages of a conflicted path during an in-progress merge.
const STAGE_BASE: &str = ":1:";
const STAGE_OURS: &str = ":2:";
const STAGE_THEIRS: &str = ":3:";

fn show_stage(dir: &Path, stage: &str, file: &str) -> Option<String> {
    run_git_sync(dir, &["show", &format!("{stage}{file}")]).ok()
}

fn checkout_side(dir: &Path, side: &str, file: &str) -> Result<(), String> {
    run_git_sync(dir, &["checkout", side, "--", file])
        .map(|_| ())
        .map_err(|e| e.to_string())
}

/// Applies one planned resolution inside the repository where the merge is
/// in progress, staging the file on success. Returns a per-file result,
/// never partial and never silent.
pub fn resolve_conflict(dir: &Path, planned: &PlannedResolution) -> FileResolution {
    let mut fallback_applied = false;

    let applied: Result<(), String> = match planned.strategy {
        ResolutionStrategy::Union => {
            // A true union needs all three stages; a file added on both
            // sides has no base, which still unions fine, but a missing
            // conflict side means the index is not in the expected state.
            let ours = show_stage(dir, STAGE_OURS, &planned.file);
            let theirs = show_stage(dir, STAGE_THEIRS, &planned.file);
            let base = show_stage(dir, STAGE_BASE, &planned.file);
            match (ours, theirs) {
                (Some(ours), Some(theirs)) => {
                    if base.is_none() {
                        debug!("{}: no merge-base blob, unioning both sides", planned.file);
                    }
                    let merged = union_merge_lines(&ours, &theirs);
                    std::fs::write(dir.join(&planned.file), merged).map_err(|e| e.to_string())
                }
                _ => {
                    warn!(
                        "{}: conflict stages unavailable, taking incoming version",
                        planned.file
                    );
                    fallback_applied = true;
                    checkout_side(dir, "--theirs", &planned.file)
                        .map_err(|e| format!("union fallback failed: {e}"))
                }
            }
        }
        ResolutionStrategy::Theirs => checkout_side(dir, "--theirs", &planned.file)
            .map_err(|e| format!("could not take incoming version: {e}")),
        ResolutionStrategy::Ours => checkout_side(dir, "--ours", &planned.file)
            .map_err(|e| format!("could not keep local version: {e}")),
        ResolutionStrategy::Recursive => {
            // The three-way driver already failed on this file or it would
            // not be conflicted; an unresolved source file is unacceptable,
            // so take the incoming version and say so.
            fallback_applied = true;
            checkout_side(dir, "--theirs", &planned.file)
                .map_err(|e| format!("recursive fallback failed: {e}"))
        }
    };

    let staged = applied.and_then(|()| {
        run_git_sync(dir, &["add", "--", &planned.file])
            .map(|_| ())
            .map_err(|e| format!("could not stage resolution: {e}"))
    });

    match staged {
        Ok(()) => FileResolution {
            file: planned.file.clone(),
            category: planned.category,
            strategy: planned.strategy,
            success: true,
            fallback_applied,
            error: None,
        },
        Err(error) => FileResolution {
            file: planned.file.clone(),
            category: planned.category,
            strategy: planned.strategy,
            success: false,
            fallback_applied,
            error: Some(error),
        },
    }
}
