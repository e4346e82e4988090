//! Role-scoped context assembly.
//!
//! An agent's context is its role file followed by every file under the
//! project root matching one of its `files_allowed` globs. Nothing is
//! cached: each call reflects the files on disk at that moment.

use std::path::Path;

use anyhow::{Context, Result};
use ignore::WalkBuilder;
use ignore::overrides::OverrideBuilder;
use tracing::{debug, warn};

/// Directories never walked into, whatever the globs say. Other dot paths
/// are walked and can be matched.
const SKIP_DIRS: &[&str] = &[".git", "target", "node_modules", "__pycache__"];

/// Build the context blob for an agent rooted at `root`.
///
/// A missing role file contributes an empty role section. Matched files are
/// listed in path order, each once, as `# File: <relative path>` followed
/// by its content. Files that are not valid UTF-8 are skipped.
pub fn load_context(root: &Path, role_file: &Path, files_allowed: &[String]) -> Result<String> {
    let role = match std::fs::read_to_string(role_file) {
        Ok(role) => role,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            debug!(path = %role_file.display(), "No role file");
            String::new()
        }
        Err(e) => {
            return Err(e).with_context(|| format!("Failed to read role {}", role_file.display()));
        }
    };

    let mut parts = vec![role];
    for rel in matching_files(root, files_allowed)? {
        match std::fs::read_to_string(root.join(&rel)) {
            Ok(content) => parts.push(format!("\n# File: {rel}\n{content}")),
            Err(e) => warn!(file = %rel, error = %e, "Skipping unreadable context file"),
        }
    }
    Ok(parts.join("\n\n"))
}

/// Paths (relative to `root`, `/`-separated, sorted) of files matching any
/// of `patterns`.
pub fn matching_files(root: &Path, patterns: &[String]) -> Result<Vec<String>> {
    if patterns.is_empty() || !root.is_dir() {
        return Ok(Vec::new());
    }

    let mut overrides = OverrideBuilder::new(root);
    for pattern in patterns {
        overrides
            .add(pattern)
            .with_context(|| format!("Invalid files_allowed glob {pattern:?}"))?;
    }
    let overrides = overrides.build().context("Failed to compile files_allowed globs")?;

    let walker = WalkBuilder::new(root)
        .hidden(false)
        .parents(false)
        .ignore(false)
        .git_ignore(false)
        .git_global(false)
        .git_exclude(false)
        .overrides(overrides)
        .filter_entry(|entry| {
            let name = entry.file_name().to_string_lossy();
            !(entry.depth() > 0
                && entry.file_type().is_some_and(|t| t.is_dir())
                && SKIP_DIRS.contains(&&*name))
        })
        .build();

    let mut files = Vec::new();
    for entry in walker {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                warn!(error = %e, "Context walk error");
                continue;
            }
        };
        if !entry.file_type().is_some_and(|t| t.is_file()) {
            continue;
        }
        if let Ok(rel) = entry.path().strip_prefix(root) {
            let rel: Vec<_> = rel
                .components()
                .map(|c| c.as_os_str().to_string_lossy().into_owned())
                .collect();
            files.push(rel.join("/"));
        }
    }
    files.sort();
    files.dedup();
    Ok(files)
}
