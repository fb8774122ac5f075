//! Migration step parsing.
//!
//! Steps arrive as free-text suggestions. Anything that does not match a
//! known shape is logged and dropped rather than guessed at.

use std::sync::LazyLock;

use regex::Regex;
use serde::Serialize;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "kebab-case", rename_all_fields = "camelCase")]
pub enum MigrationStep {
    UpdateImport {
        old_path: String,
        new_path: String,
    },
    AddImport {
        imported: String,
        source: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        alias: Option<String>,
    },
    ReplaceCall {
        old_name: String,
        new_name: String,
    },
    RemoveDeclaration {
        name: String,
    },
}

/// A parsed step plus the inline code example it came with, if any.
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedStep {
    pub step: MigrationStep,
    pub example: Option<String>,
    pub raw: String,
}

static UPDATE_IMPORT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r#"(?i)(?:update|change|rewrite)\s+import(?:s)?\s+(?:from\s+)?['"]?([\w@./-]+)['"]?\s+to\s+['"]?([\w@./-]+)['"]?"#,
    )
    .expect("update-import regex")
});

static ADD_IMPORT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?i)add\s+import\s+(\*|\{[^}]*\}|[A-Za-z_$][\w$]*)\s+from\s+['"]?([\w@./-]+)['"]?"#)
        .expect("add-import regex")
});

static REPLACE_CALL: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)(?:replace|rename)\s+(?:call(?:s)?\s+(?:to\s+)?)?([A-Za-z_$][\w$]*)(?:\(\))?\s+(?:with|to)\s+([A-Za-z_$][\w$.]*)(?:\(\))?",
    )
    .expect("replace-call regex")
});

static REMOVE_DECLARATION: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)remove\s+(?:the\s+)?(?:unused\s+)?(?:function|class|variable|const|declaration(?:\s+of)?)\s+([A-Za-z_$][\w$]*)",
    )
    .expect("remove-declaration regex")
});

static FENCED_EXAMPLE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?s)```(?:\w+)?\n(.*?)```").expect("fenced example regex")
});

/// Parses a batch of suggestion texts, dropping the unparseable ones with a
/// warning. Returns the steps in input order.
pub fn parse_steps(descriptions: &[String]) -> Vec<ParsedStep> {
    descriptions
        .iter()
        .filter_map(|raw| match parse_step(raw) {
            Some(step) => Some(ParsedStep {
                step,
                example: extract_example(raw),
                raw: raw.clone(),
            }),
            None => {
                tracing::warn!("Unparseable migration step, skipping: {:?}", truncate(raw));
                None
            }
        })
        .collect()
}

pub fn parse_step(text: &str) -> Option<MigrationStep> {
    if let Some(caps) = UPDATE_IMPORT.captures(text) {
        return Some(MigrationStep::UpdateImport {
            old_path: caps[1].to_string(),
            new_path: caps[2].to_string(),
        });
    }
    if let Some(caps) = ADD_IMPORT.captures(text) {
        let imported = caps[1].trim().to_string();
        let source = caps[2].to_string();
        let alias = (imported == "*").then(|| namespace_alias(&source));
        return Some(MigrationStep::AddImport {
            imported,
            source,
            alias,
        });
    }
    if let Some(caps) = REPLACE_CALL.captures(text) {
        return Some(MigrationStep::ReplaceCall {
            old_name: caps[1].to_string(),
            new_name: caps[2].to_string(),
        });
    }
    if let Some(caps) = REMOVE_DECLARATION.captures(text) {
        return Some(MigrationStep::RemoveDeclaration {
            name: caps[1].to_string(),
        });
    }
    None
}

/// Alias for a namespace import: sanitized basename of the source module.
pub fn namespace_alias(source: &str) -> String {
    let base = source
        .rsplit('/')
        .next()
        .unwrap_or(source)
        .trim_end_matches(".js")
        .trim_end_matches(".ts");
    let mut alias: String = base
        .chars()
        .map(|ch| if ch.is_ascii_alphanumeric() || ch == '_' { ch } else { '_' })
        .collect();
    if alias.chars().next().map(|c| c.is_ascii_digit()).unwrap_or(true) {
        alias.insert(0, '_');
    }
    alias
}

fn extract_example(text: &str) -> Option<String> {
    FENCED_EXAMPLE
        .captures(text)
        .map(|caps| caps[1].trim_end().to_string())
}

fn truncate(raw: &str) -> String {
    raw.chars().take(120).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_update_import() {
        let step = parse_step("Update import from 'utils/legacy' to 'utils/modern'").unwrap();
        assert_eq!(
            step,
            MigrationStep::UpdateImport {
                old_path: "utils/legacy".to_string(),
                new_path: "utils/modern".to_string(),
            }
        );
    }

    #[test]
    fn parses_add_import_variants() {
        assert_eq!(
            parse_step("Add import { useMemo, useState } from 'react'").unwrap(),
            MigrationStep::AddImport {
                imported: "{ useMemo, useState }".to_string(),
                source: "react".to_string(),
                alias: None,
            }
        );
        assert_eq!(
            parse_step("Add import lodash from 'lodash'").unwrap(),
            MigrationStep::AddImport {
                imported: "lodash".to_string(),
                source: "lodash".to_string(),
                alias: None,
            }
        );
        assert_eq!(
            parse_step("Add import * from './helpers/date-utils'").unwrap(),
            MigrationStep::AddImport {
                imported: "*".to_string(),
                source: "./helpers/date-utils".to_string(),
                alias: Some("date_utils".to_string()),
            }
        );
    }

    #[test]
    fn parses_replace_call_with_member_target() {
        assert_eq!(
            parse_step("Replace calls to fetchData with api.fetchData").unwrap(),
            MigrationStep::ReplaceCall {
                old_name: "fetchData".to_string(),
                new_name: "api.fetchData".to_string(),
            }
        );
        assert_eq!(
            parse_step("Rename initLegacy() to initModern()").unwrap(),
            MigrationStep::ReplaceCall {
                old_name: "initLegacy".to_string(),
                new_name: "initModern".to_string(),
            }
        );
    }

    #[test]
    fn parses_remove_declaration() {
        assert_eq!(
            parse_step("Remove the unused function legacyHandler").unwrap(),
            MigrationStep::RemoveDeclaration {
                name: "legacyHandler".to_string(),
            }
        );
        assert_eq!(
            parse_step("Remove class OldWidget").unwrap(),
            MigrationStep::RemoveDeclaration {
                name: "OldWidget".to_string(),
            }
        );
    }

    #[test]
    fn unparseable_steps_are_dropped() {
        let steps = parse_steps(&[
            "Update import from 'a' to 'b'".to_string(),
            "Do something vague".to_string(),
            "Remove function gone".to_string(),
        ]);
        assert_eq!(steps.len(), 2);
    }

    #[test]
    fn example_extraction() {
        let text = "Replace calls to foo with bar\n```js\n// src/app.ts\nfoo();\n```";
        let parsed = &parse_steps(&[text.to_string()])[0];
        assert_eq!(
            parsed.example.as_deref(),
            Some("// src/app.ts\nfoo();")
        );
    }

    #[test]
    fn namespace_alias_sanitizes() {
        assert_eq!(namespace_alias("./helpers/date-utils"), "date_utils");
        assert_eq!(namespace_alias("lodash"), "lodash");
        assert_eq!(namespace_alias("./2d-math"), "_2d_math");
    }

    #[test]
    fn step_serialization_contract() {
        let step = MigrationStep::UpdateImport {
            old_path: "a".to_string(),
            new_path: "b".to_string(),
        };
        let value = serde_json::to_value(&step).unwrap();
        assert_eq!(value["kind"], "update-import");
        assert_eq!(value["oldPath"], "a");
        assert_eq!(value["newPath"], "b");
    }
}
