//! Text templates used for config rendering and `MINIT_ENV_` values.
//!
//! Templates see the merged environment as `Env`, so `{{ Env.HOME }}` expands
//! to the value of `$HOME`. Undefined values render as empty strings.

use crate::error::{Error, Result};
use minijinja::{context, Environment, ErrorKind, UndefinedBehavior};
use std::collections::HashMap;

/// Render `text` against `{Env: env}`.
pub fn render(text: &str, env: &HashMap<String, String>) -> Result<Vec<u8>> {
    let engine = engine();
    let out = engine
        .render_str(text, context! { Env => env })
        .map_err(|e| Error::Template(e.to_string()))?;
    Ok(out.into_bytes())
}

fn engine() -> Environment<'static> {
    let mut engine = Environment::new();
    engine.set_keep_trailing_newline(true);
    engine.set_undefined_behavior(UndefinedBehavior::Chainable);
    engine.add_function("hostname", hostname);
    engine.add_function("hostname_sequence_id", hostname_sequence_id);
    engine.add_function("k8s_statefulset_id", hostname_sequence_id);
    engine
}

fn hostname() -> std::result::Result<String, minijinja::Error> {
    if let Ok(name) = std::env::var("HOSTNAME") {
        if !name.is_empty() {
            return Ok(name);
        }
    }
    nix::unistd::gethostname()
        .map_err(|e| minijinja::Error::new(ErrorKind::InvalidOperation, e.to_string()))?
        .into_string()
        .map_err(|_| minijinja::Error::new(ErrorKind::InvalidOperation, "non-utf8 hostname"))
}

/// Trailing numeric segment of a stateful-set style hostname, "web-2" is 2.
fn hostname_sequence_id() -> std::result::Result<i64, minijinja::Error> {
    sequence_id(&hostname()?)
}

fn sequence_id(hostname: &str) -> std::result::Result<i64, minijinja::Error> {
    let (_, id) = hostname.rsplit_once('-').ok_or_else(|| {
        minijinja::Error::new(ErrorKind::InvalidOperation, "invalid stateful-set hostname")
    })?;
    id.parse()
        .map_err(|_| minijinja::Error::new(ErrorKind::InvalidOperation, "invalid stateful-set hostname"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn env(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_render_env() {
        let out = render("{{ Env.Foo | upper }}-{{ Env.Bar }}", &env(&[("Foo", "foo"), ("Bar", "bar")])).unwrap();
        assert_eq!(out, b"FOO-bar");
    }

    #[test]
    fn test_render_missing_key() {
        let out = render("[{{ Env.Missing }}]", &env(&[])).unwrap();
        assert_eq!(out, b"[]");
    }

    #[test]
    fn test_render_keeps_trailing_newline() {
        let out = render("a\n\n", &env(&[])).unwrap();
        assert_eq!(out, b"a\n\n");
    }

    #[test]
    fn test_render_syntax_error() {
        assert!(render("{{ Env.Foo ", &env(&[])).is_err());
    }

    #[test]
    fn test_sequence_id() {
        assert_eq!(sequence_id("web-2").unwrap(), 2);
        assert_eq!(sequence_id("my-app-web-13").unwrap(), 13);
        assert!(sequence_id("web").is_err());
        assert!(sequence_id("web-x").is_err());
    }
}
