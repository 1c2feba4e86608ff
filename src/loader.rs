//! Unit loading.
//!
//! Units come from three places, in this order:
//! - `*.toml` files in the unit directory, each holding `[[unit]]` tables
//! - the command given on the minit command line, named `arg-main`
//! - the `MINIT_MAIN` family of environment variables, named `env-main`
//! - `MINIT_UNIT_<INFIX>_*` environment variables, one unit per infix
//!
//! Loaded units are validated, filtered through `MINIT_ENABLE` and
//! `MINIT_DISABLE`, and expanded into replicas.

use crate::env;
use crate::error::{Error, Result};
use crate::unit::{Unit, UnitKind, DEFAULT_GROUP};
use regex::Regex;
use serde::Deserialize;
use std::collections::{BTreeSet, HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use tracing::{debug, info};

/// Name reserved for the supervisor's own log files.
pub const NAME_MINIT: &str = "minit";

const ENV_PREFIX_UNIT: &str = "MINIT_UNIT_";

const FILTER_PREFIX_GROUP: &str = "@";
const FILTER_PREFIX_KIND: &str = "&";

/// Where to load units from.
#[derive(Debug, Clone, Default)]
pub struct LoadOptions {
    /// Directory of unit files
    pub dir: Option<PathBuf>,
    /// Command line of the `arg-main` unit
    pub args: Vec<String>,
    /// Run the `arg-main` unit once instead of as a daemon
    pub once: bool,
    /// Environment for the `MINIT_MAIN` unit and cron expansion
    pub env: HashMap<String, String>,
    /// Comma separated allow list
    pub enable: String,
    /// Comma separated deny list
    pub disable: String,
}

#[derive(Debug, Deserialize)]
struct UnitFile {
    #[serde(default)]
    unit: Vec<Unit>,
}

/// Load, validate, filter and expand units.
///
/// Returns the units to run and the units skipped by the filter.
pub fn load(opts: &LoadOptions) -> Result<(Vec<Unit>, Vec<Unit>)> {
    let mut units = Vec::new();

    if let Some(ref dir) = opts.dir {
        units.extend(load_dir(dir)?);
    }
    if let Some(unit) = load_args(&opts.args, opts.once) {
        units.push(unit);
    }
    if let Some(unit) = load_env(&opts.env)? {
        units.push(unit);
    }
    units.extend(load_env_units(&opts.env)?);

    let filter = Filter::new(&opts.enable, &opts.disable);
    let mut names: HashSet<String> = HashSet::from([NAME_MINIT.to_string()]);
    let mut output = Vec::new();
    let mut skipped = Vec::new();

    for mut unit in units {
        if !name_pattern().is_match(&unit.name) {
            return Err(Error::InvalidUnit(format!("invalid unit name: {}", unit.name)));
        }
        if !names.insert(unit.name.clone()) {
            return Err(Error::InvalidUnit(format!("duplicated unit name: {}", unit.name)));
        }
        if unit.group.is_empty() {
            unit.group = DEFAULT_GROUP.to_string();
        }

        if !filter.matches(&unit) {
            debug!(unit = %unit.name, "unit filtered out");
            skipped.push(unit);
            continue;
        }

        if !unit.cron.is_empty() {
            unit.cron = env::expand(&unit.cron, |key| opts.env.get(key).cloned());
        }

        output.extend(replicas(unit));
    }

    Ok((output, skipped))
}

fn name_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"^[A-Za-z][A-Za-z0-9_-]*[A-Za-z0-9]$").expect("static regex")
    })
}

/// Expand `count` into independent units named `name-1` to `name-N`.
fn replicas(unit: Unit) -> Vec<Unit> {
    let count = unit.count.max(1);
    (1..=count)
        .map(|id| {
            let mut sub = unit.clone();
            if count > 1 {
                sub.name = format!("{}-{}", unit.name, id);
            }
            sub.count = 1;
            sub.env.insert("MINIT_UNIT_NAME".to_string(), sub.name.clone());
            sub.env.insert("MINIT_UNIT_SUB_ID".to_string(), id.to_string());
            sub
        })
        .collect()
}

/// Load every `*.toml` unit file in `dir`, in file name order.
pub fn load_dir(dir: &Path) -> Result<Vec<Unit>> {
    if !dir.exists() {
        return Ok(Vec::new());
    }

    let mut files = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        let path = entry?.path();
        if path.is_file() && path.extension().and_then(|s| s.to_str()) == Some("toml") {
            files.push(path);
        }
    }
    files.sort();

    let mut units = Vec::new();
    for file in files {
        let loaded = load_file(&file)?;
        info!(file = %file.display(), count = loaded.len(), "Loaded unit file");
        units.extend(loaded);
    }
    Ok(units)
}

/// Load the `[[unit]]` tables of a single file.
pub fn load_file(path: &Path) -> Result<Vec<Unit>> {
    let content = std::fs::read_to_string(path).map_err(|e| {
        Error::Config(format!("failed to read unit file {}: {}", path.display(), e))
    })?;
    let file: UnitFile = toml::from_str(&content).map_err(|e| {
        Error::Config(format!("failed to parse unit file {}: {}", path.display(), e))
    })?;
    Ok(file.unit)
}

/// Unit for a command given on the command line.
pub fn load_args(args: &[String], once: bool) -> Option<Unit> {
    if args.is_empty() {
        return None;
    }
    let kind = if once { UnitKind::Once } else { UnitKind::Daemon };
    let mut unit = Unit::new(kind, "arg-main");
    unit.command = args.to_vec();
    Some(unit)
}

/// Unit described by `MINIT_MAIN` and its companion variables.
pub fn load_env(env: &HashMap<String, String>) -> Result<Option<Unit>> {
    let var = |key: &str| env.get(key).map(|v| v.trim()).unwrap_or_default();

    let command = var("MINIT_MAIN");
    if command.is_empty() {
        return Ok(None);
    }

    let kind = match var("MINIT_MAIN_KIND") {
        "" if parse_bool(var("MINIT_MAIN_ONCE")) == Some(true) => UnitKind::Once,
        "" => UnitKind::Daemon,
        kind => match kind.parse()? {
            UnitKind::Render => {
                return Err(Error::Config(format!("unsupported $MINIT_MAIN_KIND: {}", kind)))
            }
            kind => kind,
        },
    };

    let name = match var("MINIT_MAIN_NAME") {
        "" => "env-main",
        name => name,
    };

    let mut unit = Unit::new(kind, name);
    unit.group = var("MINIT_MAIN_GROUP").to_string();
    unit.command = shell_words::split(command)
        .map_err(|e| Error::Config(format!("invalid $MINIT_MAIN: {}", e)))?;

    let dir = var("MINIT_MAIN_DIR");
    if !dir.is_empty() {
        unit.dir = Some(PathBuf::from(dir));
    }
    let charset = var("MINIT_MAIN_CHARSET");
    if !charset.is_empty() {
        unit.charset = Some(charset.to_string());
    }

    match kind {
        UnitKind::Cron => {
            unit.cron = var("MINIT_MAIN_CRON").to_string();
            if unit.cron.is_empty() {
                return Err(Error::Config(
                    "missing $MINIT_MAIN_CRON while $MINIT_MAIN_KIND is 'cron'".to_string(),
                ));
            }
            unit.immediate = parse_bool(var("MINIT_MAIN_IMMEDIATE")).unwrap_or(false);
        }
        UnitKind::Once => {
            if parse_bool(var("MINIT_MAIN_BLOCKING")) == Some(false) {
                unit.blocking = Some(false);
            }
        }
        _ => {}
    }

    Ok(Some(unit))
}

/// Units described by `MINIT_UNIT_<INFIX>_*` variables, in infix order.
///
/// Any `MINIT_UNIT_<INFIX>_COMMAND` declares a unit, as does
/// `MINIT_UNIT_<INFIX>_FILES` together with `MINIT_UNIT_<INFIX>_KIND=render`.
pub fn load_env_units(env: &HashMap<String, String>) -> Result<Vec<Unit>> {
    env_infixes(env)
        .iter()
        .map(|infix| load_env_unit(env, infix))
        .collect()
}

fn env_infixes(env: &HashMap<String, String>) -> BTreeSet<String> {
    let mut infixes = BTreeSet::new();
    for key in env.keys() {
        let Some(rest) = key.strip_prefix(ENV_PREFIX_UNIT) else {
            continue;
        };
        if let Some(infix) = rest.strip_suffix("_COMMAND") {
            if !infix.is_empty() {
                infixes.insert(infix.to_string());
            }
        } else if let Some(infix) = rest.strip_suffix("_FILES") {
            let kind = env.get(&format!("{}{}_KIND", ENV_PREFIX_UNIT, infix));
            if !infix.is_empty() && kind.map(|k| k.trim()) == Some(UnitKind::Render.as_str()) {
                infixes.insert(infix.to_string());
            }
        }
    }
    infixes
}

fn load_env_unit(env: &HashMap<String, String>, infix: &str) -> Result<Unit> {
    let key = |suffix: &str| format!("{}{}_{}", ENV_PREFIX_UNIT, infix, suffix);
    let var = |suffix: &str| {
        env.get(&key(suffix))
            .map(|v| v.trim().to_string())
            .unwrap_or_default()
    };
    let missing = |suffix: &str| Error::Config(format!("missing ${}", key(suffix)));

    let kind = match var("KIND").as_str() {
        "" => UnitKind::Daemon,
        kind => kind.parse()?,
    };
    let name = match var("NAME") {
        name if name.is_empty() => format!("env-{}", infix.to_lowercase()),
        name => name,
    };

    let mut unit = Unit::new(kind, &name);
    unit.group = var("GROUP");
    unit.count = var("COUNT").parse().unwrap_or(0);
    unit.critical = parse_bool(&var("CRITICAL")).unwrap_or(false);
    unit.success_codes = var("SUCCESS_CODES")
        .split(',')
        .filter_map(|code| code.trim().parse().ok())
        .collect();

    if kind == UnitKind::Render {
        unit.raw = parse_bool(&var("RAW")).unwrap_or(false);
        unit.files = split_list(&var("FILES"));
        if unit.files.is_empty() {
            return Err(missing("FILES"));
        }
        return Ok(unit);
    }

    unit.command = shell_words::split(&var("COMMAND"))
        .map_err(|e| Error::Config(format!("invalid ${}: {}", key("COMMAND"), e)))?;
    if unit.command.is_empty() {
        return Err(missing("COMMAND"));
    }

    let dir = var("DIR");
    if !dir.is_empty() {
        unit.dir = Some(PathBuf::from(dir));
    }
    let shell = var("SHELL");
    if !shell.is_empty() {
        unit.shell = Some(shell);
    }
    let charset = var("CHARSET");
    if !charset.is_empty() {
        unit.charset = Some(charset);
    }
    for item in split_list(&var("ENV")) {
        if let Some((k, v)) = item.split_once('=') {
            unit.env.insert(k.to_string(), v.to_string());
        }
    }

    match kind {
        UnitKind::Cron => {
            unit.cron = var("CRON");
            if unit.cron.is_empty() {
                return Err(missing("CRON"));
            }
            unit.immediate = parse_bool(&var("IMMEDIATE")).unwrap_or(false);
        }
        UnitKind::Once => {
            if parse_bool(&var("BLOCKING")) == Some(false) {
                unit.blocking = Some(false);
            }
        }
        _ => {}
    }

    Ok(unit)
}

/// Non-empty trimmed items of a `;` separated list.
fn split_list(s: &str) -> Vec<String> {
    s.split(';')
        .map(str::trim)
        .filter(|item| !item.is_empty())
        .map(str::to_string)
        .collect()
}

/// Boolean in the usual environment spellings, `1`, `t`, `true`, `0`, `f`, `false`.
pub fn parse_bool(s: &str) -> Option<bool> {
    match s {
        "1" | "t" | "T" | "true" | "TRUE" | "True" => Some(true),
        "0" | "f" | "F" | "false" | "FALSE" | "False" => Some(false),
        _ => None,
    }
}

/// Set of unit names, `@group` and `&kind` entries.
#[derive(Debug, Default)]
struct FilterSet(HashSet<String>);

impl FilterSet {
    fn parse(s: &str) -> Self {
        Self(
            s.split(',')
                .map(str::trim)
                .filter(|item| {
                    !item.is_empty() && *item != FILTER_PREFIX_GROUP && *item != FILTER_PREFIX_KIND
                })
                .map(str::to_string)
                .collect(),
        )
    }

    fn is_blank(&self) -> bool {
        self.0.is_empty()
    }

    fn matches(&self, unit: &Unit) -> bool {
        self.0.contains(&unit.name)
            || self.0.contains(&format!("{}{}", FILTER_PREFIX_GROUP, unit.group))
            || self.0.contains(&format!("{}{}", FILTER_PREFIX_KIND, unit.kind))
    }
}

/// Allow and deny lists applied to loaded units.
#[derive(Debug, Default)]
pub struct Filter {
    pass: FilterSet,
    deny: FilterSet,
}

impl Filter {
    pub fn new(pass: &str, deny: &str) -> Self {
        Self {
            pass: FilterSet::parse(pass),
            deny: FilterSet::parse(deny),
        }
    }

    pub fn matches(&self, unit: &Unit) -> bool {
        if !self.pass.is_blank() && !self.pass.matches(unit) {
            return false;
        }
        if !self.deny.is_blank() && self.deny.matches(unit) {
            return false;
        }
        true
    }
}
