//! Environment variable construction for units.

use crate::error::Result;
use crate::template;
use regex::{Captures, Regex};
use std::collections::HashMap;
use std::sync::OnceLock;

/// Prefix of variables whose value is rendered as a template.
pub const ENV_PREFIX_RENDER: &str = "MINIT_ENV_";

/// Snapshot of the current process environment.
pub fn environ() -> HashMap<String, String> {
    std::env::vars_os()
        .filter_map(|(k, v)| Some((k.into_string().ok()?, v.into_string().ok()?)))
        .collect()
}

/// Overlay `src` onto `dst`, a key with a trailing `-` removes that key instead.
pub fn merge(dst: &mut HashMap<String, String>, src: &HashMap<String, String>) {
    for (key, val) in src {
        if let Some(key) = key.strip_suffix('-') {
            dst.remove(key);
        } else {
            dst.insert(key.clone(), val.clone());
        }
    }
}

/// Build the effective environment from `sys` and `extra`.
///
/// `MINIT_ENV_<K>` entries are rendered against the merged environment and
/// re-bound to `<K>`.
pub fn construct(
    sys: &HashMap<String, String>,
    extra: &HashMap<String, String>,
) -> Result<HashMap<String, String>> {
    let mut envs = sys.clone();
    merge(&mut envs, extra);

    let mut keys: Vec<String> = envs
        .keys()
        .filter(|k| k.starts_with(ENV_PREFIX_RENDER))
        .cloned()
        .collect();
    keys.sort();

    for key in keys {
        let Some(val) = envs.remove(&key) else {
            continue;
        };
        let rendered = template::render(&val, &envs)?;
        let effective = key[ENV_PREFIX_RENDER.len()..].to_string();
        envs.insert(effective, String::from_utf8_lossy(&rendered).into_owned());
    }

    Ok(envs)
}

/// Replace `$VAR` and `${VAR}` in `s` using `lookup`, unknown names expand to "".
pub fn expand<F>(s: &str, lookup: F) -> String
where
    F: Fn(&str) -> Option<String>,
{
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    let pattern = PATTERN.get_or_init(|| {
        Regex::new(r"\$(?:\{([^}]*)\}|([A-Za-z0-9_]+))").expect("static regex")
    });

    pattern
        .replace_all(s, |caps: &Captures| {
            let name = caps
                .get(1)
                .or_else(|| caps.get(2))
                .map(|m| m.as_str())
                .unwrap_or_default();
            lookup(name).unwrap_or_default()
        })
        .into_owned()
}
