//! Tests for unit loading

use minit::loader::{load, LoadOptions};
use minit::{Error, UnitKind};
use std::collections::HashMap;
use std::fs;
use tempfile::TempDir;

const UNITS: &str = r#"
[[unit]]
kind = "render"
name = "config"
files = ["/etc/app/*.conf"]

[[unit]]
kind = "daemon"
name = "worker"
group = "back"
count = 2
command = ["worker", "--id", "${MINIT_UNIT_SUB_ID}"]
success_codes = [0, 2]

[[unit]]
kind = "cron"
name = "cleanup"
group = "back"
cron = "*/${CLEANUP_MINUTES} * * * *"
immediate = true
command = ["cleanup"]
"#;

/// Write a unit file into a fresh directory
fn create_unit_dir(content: &str) -> TempDir {
    let temp_dir = TempDir::new().expect("Failed to create temp dir");
    fs::write(temp_dir.path().join("app.toml"), content).expect("Failed to write unit file");
    temp_dir
}

fn options(temp_dir: &TempDir) -> LoadOptions {
    LoadOptions {
        dir: Some(temp_dir.path().to_path_buf()),
        env: HashMap::from([("CLEANUP_MINUTES".to_string(), "10".to_string())]),
        ..Default::default()
    }
}

#[test]
fn test_load_expands_replicas_and_cron() {
    let temp_dir = create_unit_dir(UNITS);
    let (units, skipped) = load(&options(&temp_dir)).unwrap();

    assert!(skipped.is_empty());
    let names: Vec<&str> = units.iter().map(|u| u.name.as_str()).collect();
    assert_eq!(names, vec!["config", "worker-1", "worker-2", "cleanup"]);

    let worker = &units[2];
    assert_eq!(worker.kind, UnitKind::Daemon);
    assert_eq!(worker.success_codes, vec![0, 2]);
    assert_eq!(worker.env["MINIT_UNIT_NAME"], "worker-2");
    assert_eq!(worker.env["MINIT_UNIT_SUB_ID"], "2");

    assert_eq!(units[3].cron, "*/10 * * * *");
    assert!(units[3].immediate);
}

#[test]
fn test_load_filters() {
    let temp_dir = create_unit_dir(UNITS);

    let mut opts = options(&temp_dir);
    opts.enable = "@back".to_string();
    opts.disable = "&cron".to_string();
    let (units, skipped) = load(&opts).unwrap();

    let names: Vec<&str> = units.iter().map(|u| u.name.as_str()).collect();
    let skipped: Vec<&str> = skipped.iter().map(|u| u.name.as_str()).collect();
    assert_eq!(names, vec!["worker-1", "worker-2"]);
    assert_eq!(skipped, vec!["config", "cleanup"]);
}

#[test]
fn test_load_merges_all_sources() {
    let temp_dir = create_unit_dir(UNITS);

    let mut opts = options(&temp_dir);
    opts.args = vec!["nginx".to_string(), "-g".to_string(), "daemon off;".to_string()];
    opts.env.insert("MINIT_MAIN".to_string(), "migrate --all".to_string());
    opts.env.insert("MINIT_MAIN_ONCE".to_string(), "true".to_string());
    let (units, _) = load(&opts).unwrap();

    let arg = units.iter().find(|u| u.name == "arg-main").unwrap();
    assert_eq!(arg.kind, UnitKind::Daemon);
    assert_eq!(arg.command, vec!["nginx", "-g", "daemon off;"]);

    let env = units.iter().find(|u| u.name == "env-main").unwrap();
    assert_eq!(env.kind, UnitKind::Once);
    assert_eq!(env.command, vec!["migrate", "--all"]);
}

#[test]
fn test_load_rejects_duplicates_across_files() {
    let temp_dir = create_unit_dir(UNITS);
    fs::write(
        temp_dir.path().join("more.toml"),
        "[[unit]]\nkind = \"once\"\nname = \"config\"\ncommand = [\"true\"]\n",
    )
    .unwrap();

    let result = load(&options(&temp_dir));
    assert!(matches!(result, Err(Error::InvalidUnit(msg)) if msg.contains("config")));
}

#[test]
fn test_load_missing_dir() {
    let (units, skipped) = load(&LoadOptions {
        dir: Some("/nonexistent/minit.d".into()),
        ..Default::default()
    })
    .unwrap();
    assert!(units.is_empty());
    assert!(skipped.is_empty());
}
