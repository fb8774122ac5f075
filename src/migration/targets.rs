//! File targeting for migration steps.
//!
//! Two passes: a leading `// path/to/file.ext` comment in the step's inline
//! example wins; unresolved steps fall back to a repository content scan
//! with a step-typed pattern. `add-import` never matches on its own and
//! inherits the union of its sibling steps' targets.

use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use regex::Regex;

use super::steps::{MigrationStep, ParsedStep};

const SOURCE_EXTENSIONS: &[&str] = &["js", "ts", "jsx", "tsx"];

static EXAMPLE_PATH: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^//\s*([\w@][\w@./-]*\.(?:js|ts|jsx|tsx))\s*$").expect("example path regex")
});

/// Regex a file's contents must match for the step to apply to it.
pub fn content_pattern(step: &MigrationStep) -> Option<Regex> {
    let pattern = match step {
        MigrationStep::UpdateImport { old_path, .. } => {
            format!(r#"from\s+["']{}["']"#, regex::escape(old_path))
        }
        MigrationStep::ReplaceCall { old_name, .. } => {
            format!(r"\b{}\s*\(", regex::escape(old_name))
        }
        MigrationStep::RemoveDeclaration { name } => {
            format!(r"(function|const|let|var|class)\s+{}\b", regex::escape(name))
        }
        MigrationStep::AddImport { .. } => return None,
    };
    Regex::new(&pattern).ok()
}

/// Path named by the leading comment of the step's inline example.
pub fn example_target(example: &str) -> Option<PathBuf> {
    let first_line = example.lines().next()?;
    EXAMPLE_PATH
        .captures(first_line.trim())
        .map(|caps| PathBuf::from(&caps[1]))
}

/// Resolves each step to the repository files it applies to. Returned
/// paths are relative to `repo`, one entry per step in input order.
pub fn resolve_targets(
    repo: &Path,
    steps: &[ParsedStep],
    exclude_dirs: &[String],
) -> Vec<Vec<PathBuf>> {
    let mut resolved: Vec<BTreeSet<PathBuf>> = vec![BTreeSet::new(); steps.len()];

    // Pass 1: explicit example comments.
    for (idx, parsed) in steps.iter().enumerate() {
        if let Some(example) = &parsed.example {
            if let Some(path) = example_target(example) {
                if repo.join(&path).is_file() {
                    resolved[idx].insert(path);
                } else {
                    tracing::warn!(
                        "Example names {} but the file does not exist in the repository",
                        path.display()
                    );
                }
            }
        }
    }

    // Pass 2: content scan for steps still unresolved.
    let unresolved: Vec<(usize, Regex)> = steps
        .iter()
        .enumerate()
        .filter(|(idx, _)| resolved[*idx].is_empty())
        .filter_map(|(idx, parsed)| content_pattern(&parsed.step).map(|re| (idx, re)))
        .collect();

    if !unresolved.is_empty() {
        let mut files = Vec::new();
        collect_source_files(repo, repo, exclude_dirs, &mut files);
        for file in files {
            let Ok(contents) = fs::read_to_string(repo.join(&file)) else {
                continue;
            };
            for (idx, pattern) in &unresolved {
                if pattern.is_match(&contents) {
                    resolved[*idx].insert(file.clone());
                }
            }
        }
    }

    // add-import inherits the union of sibling non-add-import targets.
    let sibling_union: BTreeSet<PathBuf> = steps
        .iter()
        .enumerate()
        .filter(|(_, parsed)| !matches!(parsed.step, MigrationStep::AddImport { .. }))
        .flat_map(|(idx, _)| resolved[idx].iter().cloned())
        .collect();
    for (idx, parsed) in steps.iter().enumerate() {
        if matches!(parsed.step, MigrationStep::AddImport { .. }) && resolved[idx].is_empty() {
            resolved[idx] = sibling_union.clone();
        }
    }

    resolved
        .into_iter()
        .map(|set| set.into_iter().collect())
        .collect()
}

fn collect_source_files(
    root: &Path,
    dir: &Path,
    exclude_dirs: &[String],
    out: &mut Vec<PathBuf>,
) {
    let Ok(entries) = fs::read_dir(dir) else {
        return;
    };
    for entry in entries.flatten() {
        let path = entry.path();
        let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
            continue;
        };
        if path.is_dir() {
            if name.starts_with('.') || exclude_dirs.iter().any(|d| d == name) {
                continue;
            }
            collect_source_files(root, &path, exclude_dirs, out);
        } else if path
            .extension()
            .and_then(|ext| ext.to_str())
            .map(|ext| SOURCE_EXTENSIONS.contains(&ext))
            .unwrap_or(false)
        {
            if let Ok(rel) = path.strip_prefix(root) {
                out.push(rel.to_path_buf());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::migration::steps::parse_steps;

    fn write(repo: &Path, rel: &str, contents: &str) {
        let path = repo.join(rel);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, contents).unwrap();
    }

    #[test]
    fn example_comment_names_the_file() {
        assert_eq!(
            example_target("// src/app.ts\nfoo();"),
            Some(PathBuf::from("src/app.ts"))
        );
        assert_eq!(example_target("foo();"), None);
        assert_eq!(example_target("// not a path"), None);
    }

    #[test]
    fn content_scan_matches_step_typed_patterns() {
        let dir = tempfile::tempdir().unwrap();
        let repo = dir.path();
        write(repo, "src/a.ts", "import { x } from 'utils/legacy';\n");
        write(repo, "src/b.ts", "export const y = fetchData();\n");
        write(repo, "src/c.md", "from 'utils/legacy'\n");
        write(repo, "node_modules/dep/index.js", "fetchData();\n");

        let steps = parse_steps(&[
            "Update import from 'utils/legacy' to 'utils/modern'".to_string(),
            "Replace calls to fetchData with api.fetchData".to_string(),
        ]);
        let targets = resolve_targets(repo, &steps, &["node_modules".to_string()]);

        assert_eq!(targets[0], vec![PathBuf::from("src/a.ts")]);
        assert_eq!(targets[1], vec![PathBuf::from("src/b.ts")]);
    }

    #[test]
    fn example_comment_wins_over_scan() {
        let dir = tempfile::tempdir().unwrap();
        let repo = dir.path();
        write(repo, "src/a.ts", "legacyCall();\n");
        write(repo, "src/b.ts", "legacyCall();\n");

        let steps = parse_steps(&[format!(
            "Replace calls to legacyCall with modernCall\n```ts\n// src/a.ts\nlegacyCall();\n```"
        )]);
        let targets = resolve_targets(repo, &steps, &[]);
        assert_eq!(targets[0], vec![PathBuf::from("src/a.ts")]);
    }

    #[test]
    fn add_import_inherits_sibling_targets() {
        let dir = tempfile::tempdir().unwrap();
        let repo = dir.path();
        write(repo, "src/a.ts", "oldCall();\n");

        let steps = parse_steps(&[
            "Add import { modern } from 'utils/modern'".to_string(),
            "Replace calls to oldCall with modern".to_string(),
        ]);
        let targets = resolve_targets(repo, &steps, &[]);
        assert_eq!(targets[0], vec![PathBuf::from("src/a.ts")]);
        assert_eq!(targets[1], vec![PathBuf::from("src/a.ts")]);
    }

    #[test]
    fn remove_declaration_pattern_matches_forms() {
        let steps = parse_steps(&["Remove function legacyHandler".to_string()]);
        let pattern = content_pattern(&steps[0].step).unwrap();
        assert!(pattern.is_match("function legacyHandler() {}"));
        assert!(pattern.is_match("const legacyHandler = () => {}"));
        assert!(pattern.is_match("class legacyHandler {}"));
        assert!(!pattern.is_match("function legacyHandler2() {}"));
    }
}
