//! Config file rendering.
//!
//! Each entry of a render unit's `files` is one of:
//! - `pattern`, every matching file is rendered in place
//! - `src:dst`, a file rendered to another file, or a directory to another
//!   directory (same as `src:*:dst`)
//! - `src_dir:pattern:dst_dir`, files matching `pattern` under `src_dir` are
//!   rendered to the same relative path under `dst_dir`

use super::RunnerOptions;
use crate::env;
use crate::error::{Error, Result};
use crate::template;
use std::collections::{BTreeSet, HashMap};
use std::fs::{self, DirBuilder, OpenOptions};
use std::io::Write;
use std::os::unix::fs::{DirBuilderExt, OpenOptionsExt, PermissionsExt};
use std::path::{Path, PathBuf};
use tokio_util::sync::CancellationToken;

type Task = (PathBuf, PathBuf);

/// Renders template files against the unit's environment.
pub struct RenderAction {
    opts: RunnerOptions,
}

impl RenderAction {
    pub fn new(opts: RunnerOptions) -> Self {
        Self { opts }
    }

    pub async fn run(&self, _cancel: CancellationToken) -> Result<()> {
        self.opts.print("controller started");
        let result = self.render_all();
        self.opts.print("controller exited");
        result
    }

    fn render_all(&self) -> Result<()> {
        let env = match env::construct(&env::environ(), &self.opts.unit.env) {
            Ok(env) => env,
            Err(e) => {
                return self
                    .opts
                    .escalate("failed constructing environment variables", Err(e))
            }
        };

        let mut tasks = BTreeSet::new();
        for pattern in &self.opts.unit.files {
            let result = add_tasks(&mut tasks, pattern);
            self.opts.escalate("failed parsing file pattern", result)?;
        }

        for (src, dst) in &tasks {
            let result = render_file(src, dst, &env, self.opts.unit.raw);
            if result.is_ok() {
                self.opts
                    .printf(format_args!("done rendering: {}", dst.display()));
            }
            self.opts.escalate("failed rendering", result)?;
        }
        Ok(())
    }
}

fn add_tasks(tasks: &mut BTreeSet<Task>, pattern: &str) -> Result<()> {
    let segments: Vec<&str> = pattern.split(':').map(str::trim).collect();
    match segments.as_slice() {
        [single] => add_glob(tasks, single),
        [src, dst] => add_pair(tasks, src, dst),
        [src_dir, matcher, dst_dir] => add_tree(tasks, src_dir, matcher, dst_dir),
        _ => Err(Error::InvalidPattern(pattern.to_string())),
    }
}

fn glob_paths(pattern: &str) -> Result<Vec<PathBuf>> {
    let mut paths = Vec::new();
    for entry in glob::glob(pattern)? {
        paths.push(entry.map_err(|e| Error::Io(e.into()))?);
    }
    Ok(paths)
}

fn add_glob(tasks: &mut BTreeSet<Task>, pattern: &str) -> Result<()> {
    if pattern.is_empty() {
        return Err(Error::InvalidPattern(pattern.to_string()));
    }
    for path in glob_paths(pattern)? {
        tasks.insert((path.clone(), path));
    }
    Ok(())
}

fn add_pair(tasks: &mut BTreeSet<Task>, src: &str, dst: &str) -> Result<()> {
    if src.is_empty() || dst.is_empty() {
        return Err(Error::InvalidPattern(format!("{}:{}", src, dst)));
    }

    let src_is_dir = fs::metadata(src)?.is_dir();
    let dst_is_dir = match fs::metadata(dst) {
        Ok(meta) => Some(meta.is_dir()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
        Err(e) => return Err(e.into()),
    };

    match (src_is_dir, dst_is_dir) {
        (true, None | Some(true)) => add_tree(tasks, src, "*", dst),
        (false, None | Some(false)) => {
            tasks.insert((PathBuf::from(src), PathBuf::from(dst)));
            Ok(())
        }
        _ => Err(Error::InvalidPattern(format!(
            "{}:{}: source and destination must be both file or directory",
            src, dst
        ))),
    }
}

fn add_tree(tasks: &mut BTreeSet<Task>, src_dir: &str, matcher: &str, dst_dir: &str) -> Result<()> {
    if src_dir.is_empty() || matcher.is_empty() || dst_dir.is_empty() {
        return Err(Error::InvalidPattern(format!(
            "{}:{}:{}",
            src_dir, matcher, dst_dir
        )));
    }

    let src_dir = Path::new(src_dir);
    let pattern = src_dir.join(matcher);
    for path in glob_paths(&pattern.to_string_lossy())? {
        let rel = relative_to(&path, src_dir)?;
        tasks.insert((path, Path::new(dst_dir).join(rel)));
    }
    Ok(())
}

fn relative_to(path: &Path, base: &Path) -> Result<PathBuf> {
    if let Ok(rel) = path.strip_prefix(base) {
        return Ok(rel.to_path_buf());
    }
    let path = fs::canonicalize(path)?;
    let base = fs::canonicalize(base)?;
    path.strip_prefix(&base)
        .map(Path::to_path_buf)
        .map_err(|_| Error::InvalidPattern(format!("{} is outside {}", path.display(), base.display())))
}

fn render_file(src: &Path, dst: &Path, env: &HashMap<String, String>, raw: bool) -> Result<()> {
    let failed = |reason: String| Error::Render {
        path: src.to_path_buf(),
        reason,
    };

    let text = fs::read_to_string(src).map_err(|e| failed(format!("failed reading: {}", e)))?;
    let mut content = template::render(&text, env).map_err(|e| failed(e.to_string()))?;
    if !raw {
        content = sanitize_lines(&content);
    }

    if src == dst {
        return fs::write(dst, &content).map_err(|e| failed(format!("failed writing: {}", e)));
    }

    let mode = fs::metadata(src)
        .map_err(|e| failed(format!("failed stating: {}", e)))?
        .permissions()
        .mode()
        & 0o7777;

    if let Some(parent) = dst.parent().filter(|p| !p.as_os_str().is_empty()) {
        let src_parent = src
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));
        let dir_mode = fs::metadata(src_parent)
            .map_err(|e| failed(format!("failed stating {}: {}", src_parent.display(), e)))?
            .permissions()
            .mode()
            & 0o7777;
        DirBuilder::new()
            .recursive(true)
            .mode(dir_mode)
            .create(parent)
            .map_err(|e| failed(format!("failed mkdir {}: {}", parent.display(), e)))?;
    }

    let mut file = OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(mode)
        .open(dst)
        .map_err(|e| failed(format!("failed writing {}: {}", dst.display(), e)))?;
    file.write_all(&content)
        .map_err(|e| failed(format!("failed writing {}: {}", dst.display(), e)))
}

/// Trim trailing whitespace on every line and drop empty lines.
pub fn sanitize_lines(content: &[u8]) -> Vec<u8> {
    String::from_utf8_lossy(content)
        .split('\n')
        .map(str::trim_end)
        .filter(|line| !line.is_empty())
        .collect::<Vec<_>>()
        .join("\n")
        .into_bytes()
}
