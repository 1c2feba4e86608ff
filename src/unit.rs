//! Unit definitions.
//!
//! A unit is the declarative description of one piece of work: a render pass,
//! a one-shot command, a restarting daemon or a scheduled command.

use crate::error::{Error, Result};
use crate::exec::ExecutionRequest;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::str::FromStr;

/// Group assigned to units that declare none.
pub const DEFAULT_GROUP: &str = "default";

/// Kind of unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UnitKind {
    /// Render config templates, runs once before anything else
    Render,
    /// Run a command once
    Once,
    /// Run a command and restart it whenever it exits
    Daemon,
    /// Run a command on a schedule
    Cron,
}

impl UnitKind {
    /// Priority order, lower runs first.
    pub fn order(&self) -> u32 {
        match self {
            UnitKind::Render => 10,
            UnitKind::Once => 20,
            UnitKind::Daemon => 30,
            UnitKind::Cron => 40,
        }
    }

    /// Whether units of this kind live for the supervisor's lifetime.
    pub fn is_long(&self) -> bool {
        matches!(self, UnitKind::Daemon | UnitKind::Cron)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            UnitKind::Render => "render",
            UnitKind::Once => "once",
            UnitKind::Daemon => "daemon",
            UnitKind::Cron => "cron",
        }
    }
}

impl std::fmt::Display for UnitKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for UnitKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "render" => Ok(UnitKind::Render),
            "once" => Ok(UnitKind::Once),
            "daemon" => Ok(UnitKind::Daemon),
            "cron" => Ok(UnitKind::Cron),
            _ => Err(Error::UnknownKind(s.to_string())),
        }
    }
}

/// A validated unit record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Unit {
    /// Kind of unit
    pub kind: UnitKind,
    /// Unique name
    pub name: String,
    /// Group label, used for filtering
    #[serde(default)]
    pub group: String,
    /// Replica count, expanded by the loader
    #[serde(default)]
    pub count: u32,
    /// Escalate failures to a supervisor shutdown
    #[serde(default)]
    pub critical: bool,

    /// Working directory
    #[serde(default)]
    pub dir: Option<PathBuf>,
    /// Shell used to run `command` lines from stdin
    #[serde(default)]
    pub shell: Option<String>,
    /// Environment overrides, a key ending in `-` removes the variable
    #[serde(default)]
    pub env: HashMap<String, String>,
    /// Command argv, or script lines when `shell` is set
    #[serde(default)]
    pub command: Vec<String>,
    /// Charset of the command output
    #[serde(default)]
    pub charset: Option<String>,
    /// Exit codes treated as success, empty means `[0]`
    #[serde(default)]
    pub success_codes: Vec<i32>,

    /// Keep rendered output untouched
    #[serde(default)]
    pub raw: bool,
    /// File patterns to render
    #[serde(default)]
    pub files: Vec<String>,

    /// Cron expression
    #[serde(default)]
    pub cron: String,
    /// Run once when the runner starts
    #[serde(default)]
    pub immediate: bool,

    /// Set to false to run a once unit in background
    #[serde(default)]
    pub blocking: Option<bool>,
}

impl Unit {
    /// Create an empty unit of the given kind.
    pub fn new(kind: UnitKind, name: impl Into<String>) -> Self {
        Self {
            kind,
            name: name.into(),
            group: String::new(),
            count: 0,
            critical: false,
            dir: None,
            shell: None,
            env: HashMap::new(),
            command: Vec::new(),
            charset: None,
            success_codes: Vec::new(),
            raw: false,
            files: Vec::new(),
            cron: String::new(),
            immediate: false,
            blocking: None,
        }
    }

    /// Label used in log lines, `kind/name`.
    pub fn label(&self) -> String {
        format!("{}/{}", self.kind, self.name)
    }

    pub fn require_command(&self) -> Result<()> {
        if self.command.is_empty() {
            return Err(Error::MissingField("command"));
        }
        Ok(())
    }

    pub fn require_files(&self) -> Result<()> {
        if self.files.is_empty() {
            return Err(Error::MissingField("files"));
        }
        Ok(())
    }

    pub fn require_cron(&self) -> Result<()> {
        if self.cron.trim().is_empty() {
            return Err(Error::MissingField("cron"));
        }
        Ok(())
    }

    /// Build the request used to launch this unit's command.
    pub fn execution_request(&self) -> ExecutionRequest {
        ExecutionRequest {
            name: self.label(),
            dir: self.dir.clone(),
            shell: self.shell.clone(),
            env: self.env.clone(),
            command: self.command.clone(),
            charset: self.charset.clone(),
            success_codes: self.success_codes.clone(),
        }
    }
}
