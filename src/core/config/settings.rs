//! Typed runtime settings.
//!
//! Every knob is sourced from the secrets snapshot so configuration flows
//! through the resilience layer. Unknown keys are ignored; malformed values
//! fall back to defaults with a warning.

use std::collections::HashMap;
use std::path::PathBuf;
use std::str::FromStr;

#[derive(Debug, Clone, PartialEq)]
pub struct Settings {
    pub max_concurrent: usize,
    pub queue_max_size: usize,
    pub job_timeout_ms: u64,
    pub retry_delay_ms: u64,
    pub max_retries: u32,
    pub failure_threshold: u32,
    pub success_threshold: u32,
    pub circuit_timeout_ms: u64,
    pub backoff_multiplier: f64,
    pub max_backoff_ms: u64,
    pub cache_path: Option<PathBuf>,
    pub preferred_port: u16,
    pub port_fallback_count: u16,
    pub base_branch: String,
    pub branch_prefix: String,
    pub dry_run: bool,
    pub exclude_dirs: Vec<String>,
    pub github_token: Option<String>,
    pub pipelines: Vec<PipelineSpec>,
}

/// One configured pipeline, parsed from `pipeline.<name>.*` keys.
#[derive(Debug, Clone, PartialEq)]
pub struct PipelineSpec {
    pub name: String,
    pub command: Vec<String>,
    pub cron: Option<String>,
    pub git_workflow: bool,
    pub max_concurrent: Option<usize>,
    pub repository_path: Option<String>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            max_concurrent: 3,
            queue_max_size: 1000,
            job_timeout_ms: 600_000,
            retry_delay_ms: 5000,
            max_retries: 2,
            failure_threshold: 3,
            success_threshold: 2,
            circuit_timeout_ms: 5000,
            backoff_multiplier: 2.0,
            max_backoff_ms: 10_000,
            cache_path: None,
            preferred_port: 8080,
            port_fallback_count: 10,
            base_branch: "main".to_string(),
            branch_prefix: "automated".to_string(),
            dry_run: false,
            exclude_dirs: default_exclude_dirs(),
            github_token: None,
            pipelines: Vec::new(),
        }
    }
}

impl Settings {
    pub fn from_map(values: &HashMap<String, String>) -> Self {
        let mut settings = Settings::default();

        settings.max_concurrent = parse_or(values, "maxConcurrent", settings.max_concurrent);
        settings.queue_max_size = parse_or(values, "queueMaxSize", settings.queue_max_size);
        settings.job_timeout_ms = parse_or(values, "jobTimeoutMs", settings.job_timeout_ms);
        settings.retry_delay_ms = parse_or(values, "retryDelayMs", settings.retry_delay_ms);
        settings.max_retries = parse_or(values, "maxRetries", settings.max_retries);
        settings.failure_threshold =
            parse_or(values, "failureThreshold", settings.failure_threshold);
        settings.success_threshold =
            parse_or(values, "successThreshold", settings.success_threshold);
        settings.circuit_timeout_ms =
            parse_or(values, "circuitTimeoutMs", settings.circuit_timeout_ms);
        settings.backoff_multiplier =
            parse_or(values, "backoffMultiplier", settings.backoff_multiplier);
        settings.max_backoff_ms = parse_or(values, "maxBackoffMs", settings.max_backoff_ms);
        settings.preferred_port = parse_or(values, "preferredPort", settings.preferred_port);
        settings.port_fallback_count =
            parse_or(values, "portFallbackCount", settings.port_fallback_count);
        settings.dry_run = parse_bool_or(values, "dryRun", settings.dry_run);

        if let Some(path) = non_empty(values, "cachePath") {
            settings.cache_path = Some(PathBuf::from(path));
        }
        if let Some(branch) = non_empty(values, "baseBranch") {
            settings.base_branch = branch;
        }
        if let Some(prefix) = non_empty(values, "branchPrefix") {
            settings.branch_prefix = prefix;
        }
        if let Some(dirs) = non_empty(values, "excludeDirs") {
            settings.exclude_dirs = dirs
                .split(',')
                .map(|d| d.trim().to_string())
                .filter(|d| !d.is_empty())
                .collect();
        }
        if let Some(token) = non_empty(values, "githubToken") {
            settings.github_token = Some(token);
        }

        settings.pipelines = parse_pipelines(values);
        settings
    }
}

fn parse_pipelines(values: &HashMap<String, String>) -> Vec<PipelineSpec> {
    let mut names: Vec<String> = values
        .keys()
        .filter_map(|key| {
            let rest = key.strip_prefix("pipeline.")?;
            let (name, _) = rest.split_once('.')?;
            Some(name.to_string())
        })
        .collect();
    names.sort();
    names.dedup();

    names
        .into_iter()
        .filter_map(|name| {
            let command = non_empty(values, &format!("pipeline.{name}.command"))?;
            // Whitespace-split argv; the pipeline executables this spawns do
            // not take quoted arguments.
            let command: Vec<String> =
                command.split_whitespace().map(|s| s.to_string()).collect();
            if command.is_empty() {
                tracing::warn!("Pipeline {} has an empty command, skipping", name);
                return None;
            }
            Some(PipelineSpec {
                command,
                cron: non_empty(values, &format!("pipeline.{name}.cron")),
                git_workflow: parse_bool_or(
                    values,
                    &format!("pipeline.{name}.gitWorkflow"),
                    false,
                ),
                max_concurrent: non_empty(values, &format!("pipeline.{name}.maxConcurrent"))
                    .and_then(|raw| raw.parse().ok()),
                repository_path: non_empty(values, &format!("pipeline.{name}.repositoryPath")),
                name,
            })
        })
        .collect()
}

fn parse_or<T: FromStr + Copy>(values: &HashMap<String, String>, key: &str, default: T) -> T {
    match values.get(key) {
        None => default,
        Some(raw) => match raw.trim().parse() {
            Ok(value) => value,
            Err(_) => {
                tracing::warn!("Invalid value for {}: {:?}, using default", key, raw);
                default
            }
        },
    }
}

fn parse_bool_or(values: &HashMap<String, String>, key: &str, default: bool) -> bool {
    match values.get(key).map(|raw| raw.trim().to_lowercase()) {
        None => default,
        Some(raw) => match raw.as_str() {
            "true" | "1" | "yes" | "on" => true,
            "false" | "0" | "no" | "off" => false,
            _ => {
                tracing::warn!("Invalid boolean for {}: {:?}, using default", key, raw);
                default
            }
        },
    }
}

fn non_empty(values: &HashMap<String, String>, key: &str) -> Option<String> {
    values
        .get(key)
        .map(|raw| raw.trim().to_string())
        .filter(|raw| !raw.is_empty())
}

fn default_exclude_dirs() -> Vec<String> {
    ["node_modules", ".git", "dist", "build", "coverage"]
        .iter()
        .map(|d| d.to_string())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn map(entries: &[(&str, &str)]) -> HashMap<String, String> {
        entries
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn defaults_match_documented_values() {
        let settings = Settings::default();
        assert_eq!(settings.max_concurrent, 3);
        assert_eq!(settings.queue_max_size, 1000);
        assert_eq!(settings.job_timeout_ms, 600_000);
        assert_eq!(settings.retry_delay_ms, 5000);
        assert_eq!(settings.max_retries, 2);
        assert_eq!(settings.failure_threshold, 3);
        assert_eq!(settings.success_threshold, 2);
        assert_eq!(settings.circuit_timeout_ms, 5000);
        assert_eq!(settings.max_backoff_ms, 10_000);
        assert_eq!(settings.preferred_port, 8080);
        assert_eq!(settings.port_fallback_count, 10);
        assert_eq!(settings.base_branch, "main");
        assert_eq!(settings.branch_prefix, "automated");
        assert!(!settings.dry_run);
    }

    #[test]
    fn overrides_are_applied() {
        let settings = Settings::from_map(&map(&[
            ("maxConcurrent", "1"),
            ("preferredPort", "9000"),
            ("dryRun", "true"),
            ("baseBranch", "develop"),
            ("excludeDirs", "vendor, target"),
        ]));
        assert_eq!(settings.max_concurrent, 1);
        assert_eq!(settings.preferred_port, 9000);
        assert!(settings.dry_run);
        assert_eq!(settings.base_branch, "develop");
        assert_eq!(settings.exclude_dirs, vec!["vendor", "target"]);
    }

    #[test]
    fn malformed_values_fall_back_to_defaults() {
        let settings = Settings::from_map(&map(&[
            ("maxConcurrent", "many"),
            ("dryRun", "maybe"),
        ]));
        assert_eq!(settings.max_concurrent, 3);
        assert!(!settings.dry_run);
    }

    #[test]
    fn pipeline_specs_are_collected() {
        let settings = Settings::from_map(&map(&[
            ("pipeline.repomix.command", "repomix --pack ."),
            ("pipeline.repomix.cron", "0 0 3 * * *"),
            ("pipeline.repomix.gitWorkflow", "true"),
            ("pipeline.repomix.repositoryPath", "/srv/repos/app"),
            ("pipeline.git-activity.command", "git-activity-report"),
            ("pipeline.broken.cron", "0 0 4 * * *"),
        ]));

        assert_eq!(settings.pipelines.len(), 2);
        let repomix = settings
            .pipelines
            .iter()
            .find(|p| p.name == "repomix")
            .unwrap();
        assert_eq!(repomix.command, vec!["repomix", "--pack", "."]);
        assert_eq!(repomix.cron.as_deref(), Some("0 0 3 * * *"));
        assert!(repomix.git_workflow);
        assert_eq!(repomix.repository_path.as_deref(), Some("/srv/repos/app"));

        // A pipeline without a command is not registered.
        assert!(!settings.pipelines.iter().any(|p| p.name == "broken"));
    }
}
