//! Process execution for units.
//!
//! The [`Manager`] spawns one child per [`ExecutionRequest`], pumps its output
//! into the unit's [`Logger`] and keeps every live child in a registry so a
//! signal can be broadcast to all of them on shutdown.

use crate::env;
use crate::error::{Error, Result};
use crate::log::{BoxReader, Logger, Output};
use encoding_rs::Encoding;
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, Command};
use tracing::{debug, warn};

const DECODE_PIPE_CAPACITY: usize = 64 * 1024;

/// How long output pumps may keep draining once the child has been reaped.
/// A grandchild holding the pipes open keeps its pump running detached.
const OUTPUT_DRAIN_TIMEOUT: Duration = Duration::from_millis(500);

/// Parameters of a single process launch.
#[derive(Debug, Clone, Default)]
pub struct ExecutionRequest {
    /// Label used in log lines, usually `kind/name`
    pub name: String,
    /// Working directory
    pub dir: Option<PathBuf>,
    /// Shell used to run `command` lines fed through stdin
    pub shell: Option<String>,
    /// Environment overlay
    pub env: HashMap<String, String>,
    /// Argv template, `$VAR` and `${VAR}` are expanded
    pub command: Vec<String>,
    /// Charset of the child's output
    pub charset: Option<String>,
    /// Exit codes treated as success, empty means `[0]`
    pub success_codes: Vec<i32>,
}

/// Spawns unit processes and tracks the live ones.
#[derive(Default)]
pub struct Manager {
    pids: Mutex<HashSet<u32>>,
}

/// Registry entry removed when dropped.
struct Registration<'a> {
    manager: &'a Manager,
    pid: u32,
}

impl Drop for Registration<'_> {
    fn drop(&mut self) {
        self.manager.pids().remove(&self.pid);
        debug!(pid = self.pid, "unregistered child");
    }
}

impl Manager {
    pub fn new() -> Self {
        Self::default()
    }

    fn pids(&self) -> MutexGuard<'_, HashSet<u32>> {
        self.pids.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// PIDs of the children currently running.
    pub fn live_pids(&self) -> Vec<u32> {
        self.pids().iter().copied().collect()
    }

    /// Send `sig` to every registered child.
    ///
    /// Delivery failures are ignored, the child may have exited meanwhile.
    pub fn signal(&self, sig: Signal) {
        let pids = self.pids();
        for &pid in pids.iter() {
            match kill(Pid::from_raw(pid as i32), sig) {
                Ok(()) => debug!(pid = pid, signal = ?sig, "sent signal to child"),
                Err(e) => debug!(pid = pid, signal = ?sig, error = %e, "failed to signal child"),
            }
        }
    }

    /// Spawn the command and register its pid in one critical section, so a
    /// concurrent [`Manager::signal`] never misses a started child.
    fn spawn(&self, cmd: &mut Command, name: &str) -> Result<(Child, Registration<'_>)> {
        let mut pids = self.pids();
        let child = cmd
            .spawn()
            .map_err(|e| Error::SpawnFailed(format!("{}: {}", name, e)))?;
        let pid = child
            .id()
            .ok_or_else(|| Error::SpawnFailed(format!("{}: child has no pid", name)))?;
        pids.insert(pid);
        debug!(pid = pid, unit = %name, "registered child");
        Ok((child, Registration { manager: self, pid }))
    }

    /// Run the request to completion.
    ///
    /// Returns an error when the process could not be started or exited with
    /// a code outside `success_codes`.
    pub async fn execute(&self, req: &ExecutionRequest, logger: &Logger) -> Result<()> {
        if let Some(ref dir) = req.dir {
            check_dir(dir)?;
        }

        let env = env::construct(&env::environ(), &req.env)?;
        let argv = build_argv(req, &env)?;

        let mut cmd = Command::new(&argv[0]);
        cmd.args(&argv[1..])
            .env_clear()
            .envs(&env)
            .process_group(0)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        if let Some(ref dir) = req.dir {
            cmd.current_dir(dir);
        }
        let script = req.shell.as_ref().map(|_| req.command.join("\n"));
        cmd.stdin(if script.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        });

        let encoding = match req.charset.as_deref().map(str::trim) {
            Some(charset) if !charset.is_empty() => {
                let encoding = lookup_charset(charset);
                if encoding.is_none() {
                    warn!(unit = %req.name, charset = charset, "unknown charset");
                    logger.errorf(format_args!("{}: unknown charset: {}", req.name, charset));
                }
                encoding
            }
            _ => None,
        };

        let (mut child, registration) = self.spawn(&mut cmd, &req.name)?;

        logger.printf(format_args!("{}: process started", req.name));

        if let (Some(script), Some(mut stdin)) = (script, child.stdin.take()) {
            tokio::spawn(async move {
                let _ = stdin.write_all(script.as_bytes()).await;
            });
        }

        let out = tokio::spawn(pump(child.stdout.take(), encoding, logger.out()));
        let err = tokio::spawn(pump(child.stderr.take(), encoding, logger.err()));

        let status = child.wait().await;
        drop(registration);

        let drained = tokio::time::timeout(OUTPUT_DRAIN_TIMEOUT, async {
            let _ = tokio::join!(out, err);
        })
        .await;
        if drained.is_err() {
            debug!(unit = %req.name, "output still open after exit, pumping in background");
        }

        let status = status?;
        let code = status.code().unwrap_or(-1);

        if !status.success() {
            logger.errorf(format_args!(
                "{}: process exited with error: {}",
                req.name, status
            ));
        }

        if accepts(&req.success_codes, code) {
            logger.printf(format_args!(
                "{}: exit code {} is in success_codes",
                req.name, code
            ));
            return Ok(());
        }

        let err = Error::ExitCode(code);
        logger.errorf(format_args!("{}: process exited with error: {}", req.name, err));
        Err(err)
    }
}

/// Fail unless `dir` exists and is a directory.
pub fn check_dir(dir: &Path) -> Result<()> {
    let meta = std::fs::metadata(dir).map_err(|e| Error::InvalidDir {
        path: dir.to_path_buf(),
        reason: e.to_string(),
    })?;
    if !meta.is_dir() {
        return Err(Error::InvalidDir {
            path: dir.to_path_buf(),
            reason: "not a directory".to_string(),
        });
    }
    Ok(())
}

/// Tokenize a shell string like `/bin/bash -e`.
pub fn split_shell(shell: &str) -> Result<Vec<String>> {
    shell_words::split(shell).map_err(|e| Error::InvalidShell(format!("{}: {}", shell, e)))
}

fn build_argv(req: &ExecutionRequest, env: &HashMap<String, String>) -> Result<Vec<String>> {
    let argv = match req.shell {
        Some(ref shell) => split_shell(shell)?,
        None => req
            .command
            .iter()
            .map(|arg| env::expand(arg, |key| env.get(key).cloned()))
            .collect(),
    };
    if argv.is_empty() || argv[0].is_empty() {
        return Err(Error::EmptyCommand);
    }
    Ok(argv)
}

fn accepts(success_codes: &[i32], code: i32) -> bool {
    if success_codes.is_empty() {
        return code == 0;
    }
    success_codes.contains(&code)
}

/// Decoder for a charset name such as `gbk` or `gb18030`.
pub fn lookup_charset(charset: &str) -> Option<&'static Encoding> {
    Encoding::for_label(charset.trim().to_ascii_lowercase().as_bytes())
}

async fn pump<R>(reader: Option<R>, encoding: Option<&'static Encoding>, output: Arc<dyn Output>)
where
    R: AsyncRead + Send + Unpin + 'static,
{
    let Some(reader) = reader else {
        return;
    };
    let reader: BoxReader = match encoding {
        Some(encoding) => decode(reader, encoding),
        None => Box::new(reader),
    };
    if let Err(e) = output.read_from(reader).await {
        debug!(error = %e, "failed to pump child output");
    }
}

/// Re-encode `reader` from `encoding` to UTF-8 on a background task.
fn decode<R>(mut reader: R, encoding: &'static Encoding) -> BoxReader
where
    R: AsyncRead + Send + Unpin + 'static,
{
    let (mut tx, rx) = tokio::io::duplex(DECODE_PIPE_CAPACITY);
    tokio::spawn(async move {
        let mut decoder = encoding.new_decoder();
        let mut buf = vec![0u8; 4096];
        let mut text = String::new();
        loop {
            let n = match reader.read(&mut buf).await {
                Ok(n) => n,
                Err(e) => {
                    debug!(error = %e, "failed to read child output");
                    0
                }
            };
            let last = n == 0;
            text.clear();
            text.reserve(decoder.max_utf8_buffer_length(n).unwrap_or(n * 4 + 16));
            let _ = decoder.decode_to_string(&buf[..n], &mut text, last);
            if tx.write_all(text.as_bytes()).await.is_err() || last {
                break;
            }
        }
    });
    Box::new(rx)
}
