// src/config/validate.rs

use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::time::Duration;

use petgraph::algo::toposort;
use petgraph::graphmap::DiGraphMap;

use crate::config::model::{ConfigFile, RawConfigFile, RawSchedulerSection, SchedulerSection};
use crate::errors::{Result, SchedulerError};
use crate::scheduler::BackoffPolicy;

impl TryFrom<RawConfigFile> for ConfigFile {
    type Error = SchedulerError;

    fn try_from(raw: RawConfigFile) -> std::result::Result<Self, Self::Error> {
        let scheduler = validate_scheduler(&raw.scheduler)?;
        validate_names(&raw)?;
        validate_tokens(&raw)?;
        validate_jobs(&raw)?;
        validate_paths(&raw)?;
        let job_order = job_order(&raw)?;
        Ok(ConfigFile::new_unchecked(
            scheduler,
            raw.token,
            raw.data,
            raw.job,
            job_order,
        ))
    }
}

fn config_error(message: String) -> SchedulerError {
    SchedulerError::ConfigError(message)
}

fn validate_scheduler(raw: &RawSchedulerSection) -> Result<SchedulerSection> {
    let duration = |field: &str, value: &str| {
        parse_duration(value)
            .map_err(|e| config_error(format!("[scheduler].{} = '{}': {}", field, value, e)))
    };
    let poll_interval = duration("poll_interval", &raw.poll_interval)?;
    let base = duration("backoff_base", &raw.backoff_base)?;
    let max = duration("backoff_max", &raw.backoff_max)?;

    if poll_interval.is_zero() {
        return Err(config_error("[scheduler].poll_interval must be > 0".to_string()));
    }
    if base > max {
        return Err(config_error(format!(
            "[scheduler].backoff_base ({:?}) is larger than backoff_max ({:?})",
            base, max
        )));
    }

    Ok(SchedulerSection {
        workdir: raw.workdir.clone(),
        store: raw.store.clone(),
        poll_interval,
        backoff: BackoffPolicy { base, max },
    })
}

/// Names are shared by all sections so references are unambiguous.
fn validate_names(cfg: &RawConfigFile) -> Result<()> {
    let mut seen: HashMap<&str, &str> = HashMap::new();
    let sections = [
        ("token", cfg.token.keys().collect::<Vec<_>>()),
        ("data", cfg.data.keys().collect()),
        ("job", cfg.job.keys().collect()),
    ];
    for (section, names) in sections {
        for name in names {
            if let Some(other) = seen.insert(name.as_str(), section) {
                return Err(config_error(format!(
                    "name '{}' is used by both [{}.{}] and [{}.{}]",
                    name, other, name, section, name
                )));
            }
        }
    }
    Ok(())
}

fn validate_tokens(cfg: &RawConfigFile) -> Result<()> {
    for (name, token) in &cfg.token {
        if token.limit == 0 {
            return Err(config_error(format!(
                "token '{}' must have limit >= 1 (got 0)",
                name
            )));
        }
    }
    Ok(())
}

fn validate_jobs(cfg: &RawConfigFile) -> Result<()> {
    for (name, job) in &cfg.job {
        if job.command.is_empty() || job.command[0].trim().is_empty() {
            return Err(config_error(format!("job '{}' has an empty command", name)));
        }

        for (field, refs) in [("after", &job.after), ("exclusive", &job.exclusive)] {
            for dep in refs {
                if dep == name {
                    return Err(config_error(format!(
                        "job '{}' cannot depend on itself in `{}`",
                        name, field
                    )));
                }
                if !cfg.job.contains_key(dep) && !cfg.data.contains_key(dep) {
                    return Err(config_error(format!(
                        "job '{}' has unknown dependency '{}' in `{}`",
                        name, dep, field
                    )));
                }
            }
        }
        if let Some(dep) = job.after.iter().find(|dep| job.exclusive.contains(*dep)) {
            return Err(config_error(format!(
                "job '{}' lists '{}' in both `after` and `exclusive`",
                name, dep
            )));
        }

        for (token, count) in &job.tokens {
            if !cfg.token.contains_key(token) {
                return Err(config_error(format!(
                    "job '{}' uses unknown token '{}'",
                    name, token
                )));
            }
            if *count == 0 {
                return Err(config_error(format!(
                    "job '{}' must take at least one '{}' token",
                    name, token
                )));
            }
        }
    }
    Ok(())
}

fn validate_paths(cfg: &RawConfigFile) -> Result<()> {
    let mut seen: BTreeMap<&Path, &str> = BTreeMap::new();
    let paths = cfg
        .data
        .iter()
        .map(|(name, d)| (name, d.path.as_path()))
        .chain(cfg.job.iter().map(|(name, j)| (name, j.path.as_path())));
    for (name, path) in paths {
        if path.as_os_str().is_empty() {
            return Err(config_error(format!("'{}' has an empty path", name)));
        }
        if let Some(other) = seen.insert(path, name.as_str()) {
            return Err(config_error(format!(
                "'{}' and '{}' share the path {:?}",
                other, name, path
            )));
        }
    }
    Ok(())
}

/// Jobs in an order where each comes after the jobs it requires.
///
/// Edge direction: requirement -> job.
fn job_order(cfg: &RawConfigFile) -> Result<Vec<String>> {
    let mut graph: DiGraphMap<&str, ()> = DiGraphMap::new();
    for name in cfg.job.keys() {
        graph.add_node(name.as_str());
    }
    for (name, job) in &cfg.job {
        for dep in job.after.iter().chain(&job.exclusive) {
            if cfg.job.contains_key(dep) {
                graph.add_edge(dep.as_str(), name.as_str(), ());
            }
        }
    }

    match toposort(&graph, None) {
        Ok(order) => Ok(order.into_iter().map(str::to_string).collect()),
        Err(cycle) => Err(config_error(format!(
            "cycle detected in job graph involving job '{}'",
            cycle.node_id()
        ))),
    }
}

/// Parse `"250ms"`, `"5s"`, `"2m"` or `"1h"`.
pub fn parse_duration(s: &str) -> std::result::Result<Duration, String> {
    let s = s.trim();
    if s.is_empty() {
        return Err("empty duration string".to_string());
    }

    let idx = s
        .chars()
        .position(|c| !c.is_ascii_digit())
        .ok_or_else(|| "duration missing unit suffix".to_string())?;

    let (num_part, unit_part) = s.split_at(idx);
    let value: u64 = num_part
        .parse()
        .map_err(|e| format!("invalid duration number '{}': {}", num_part, e))?;

    match unit_part.trim().to_lowercase().as_str() {
        "ms" => Ok(Duration::from_millis(value)),
        "s" => Ok(Duration::from_secs(value)),
        "m" => Ok(Duration::from_secs(value * 60)),
        "h" => Ok(Duration::from_secs(value * 60 * 60)),
        unit => Err(format!(
            "unsupported duration unit '{}'; expected ms, s, m, or h",
            unit
        )),
    }
}
