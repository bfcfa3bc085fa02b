use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use serde_yaml_ng::Value;

use crate::error::{SupervisorError, SupervisorResult};
use crate::system;

pub(crate) const DEFAULT_NAME: &str = "jobvisor";
pub(crate) const DEFAULT_LOG: &str = "/dev/null";
pub(crate) const DEFAULT_WORKER_REQUEST_NUM: usize = 1000;

/// Key naming the profile to use when a file holds several.
const PROFILE_KEY: &str = "use";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ListenerConfig {
    /// Prefix of the process titles and the name written to the status file.
    pub name: String,
    pub daemonize: bool,
    /// Log at debug level instead of warnings only.
    pub debug: bool,
    /// Where stdout, stderr and logs go once daemonized.
    #[serde(alias = "logPath")]
    pub log: PathBuf,
    /// Account workers switch to after fork.
    pub user: Option<String>,
    pub group: Option<String>,
    #[serde(alias = "workerNum")]
    pub worker_num: usize,
    /// Jobs a worker handles before it exits and is replaced.
    #[serde(alias = "workerRequestNum")]
    pub worker_request_num: usize,
    pub status: Option<PathBuf>,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            name: DEFAULT_NAME.to_string(),
            daemonize: false,
            debug: true,
            log: PathBuf::from(DEFAULT_LOG),
            user: None,
            group: None,
            worker_num: system::default_worker_num(),
            worker_request_num: DEFAULT_WORKER_REQUEST_NUM,
            status: None,
        }
    }
}

/// Load a listener config from a YAML file.
///
/// Relative paths in the config are resolved against the config file's parent directory.
pub fn load(path: &Path) -> SupervisorResult<ListenerConfig> {
    let content = std::fs::read_to_string(path)
        .map_err(|e| SupervisorError::Config(format!("read {}: {e}", path.display())))?;
    let mut config = parse(&content)
        .map_err(|e| SupervisorError::Config(format!("parse {}: {e}", path.display())))?;
    if let Some(config_dir) = path.parent() {
        config.resolve_relative_paths(config_dir);
    }
    Ok(config)
}

/// Parse a YAML document. When it has a top-level `use: <profile>` entry, the
/// mapping under `<profile>` is the configuration; otherwise the whole document is.
pub fn parse(content: &str) -> Result<ListenerConfig, String> {
    let doc: Value = serde_yaml_ng::from_str(content).map_err(|e| e.to_string())?;
    let selected = match doc.get(PROFILE_KEY) {
        Some(Value::String(profile)) => doc
            .get(profile.as_str())
            .cloned()
            .ok_or_else(|| format!("profile {profile:?} not found"))?,
        Some(other) => return Err(format!("{PROFILE_KEY} must name a profile, got {other:?}")),
        None => doc,
    };
    if selected.is_null() {
        return Ok(ListenerConfig::default());
    }
    serde_yaml_ng::from_value(selected).map_err(|e| e.to_string())
}

impl ListenerConfig {
    /// Reject values the listener cannot run with.
    pub fn validate(&self) -> SupervisorResult<()> {
        if self.name.trim().is_empty() {
            return Err(SupervisorError::Config("name must not be empty".into()));
        }
        if self.worker_num == 0 {
            return Err(SupervisorError::Config("worker_num must be at least 1".into()));
        }
        if self.worker_request_num == 0 {
            return Err(SupervisorError::Config(
                "worker_request_num must be at least 1".into(),
            ));
        }
        Ok(())
    }

    /// Resolve relative paths against `config_dir` (the directory containing the YAML file).
    fn resolve_relative_paths(&mut self, config_dir: &Path) {
        let resolve = |p: &mut PathBuf| {
            if p.is_relative() {
                *p = config_dir.join(&*p);
            }
        };
        resolve(&mut self.log);
        if let Some(status) = &mut self.status {
            resolve(status);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_document_gives_defaults() {
        let config = parse("").unwrap();
        assert_eq!(config, ListenerConfig::default());
        assert_eq!(config.name, "jobvisor");
        assert!(config.debug);
        assert!(!config.daemonize);
        assert_eq!(config.worker_request_num, 1000);
        assert_eq!(config.worker_num, system::default_worker_num());
    }

    #[test]
    fn accepts_camel_case_keys() {
        let config = parse(
            "name: mailer\nworkerNum: 3\nworkerRequestNum: 50\nlogPath: /var/log/mailer.log\n",
        )
        .unwrap();
        assert_eq!(config.name, "mailer");
        assert_eq!(config.worker_num, 3);
        assert_eq!(config.worker_request_num, 50);
        assert_eq!(config.log, PathBuf::from("/var/log/mailer.log"));
    }

    #[test]
    fn selects_profile() {
        let yaml = r"
use: production
development:
  worker_num: 1
  debug: true
production:
  worker_num: 8
  debug: false
  user: nobody
";
        let config = parse(yaml).unwrap();
        assert_eq!(config.worker_num, 8);
        assert!(!config.debug);
        assert_eq!(config.user.as_deref(), Some("nobody"));
    }

    #[test]
    fn missing_profile_is_an_error() {
        let err = parse("use: staging\nproduction:\n  worker_num: 2\n").unwrap_err();
        assert!(err.contains("staging"), "{err}");
    }

    #[test]
    fn rejects_wrong_types() {
        assert!(parse("worker_num: many\n").is_err());
        assert!(parse("use: [a, b]\n").is_err());
    }

    #[test]
    fn load_resolves_relative_paths() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("jobvisor.yaml");
        std::fs::write(&path, "log: logs/jobvisor.log\nstatus: /run/jobvisor.json\n").unwrap();

        let config = load(&path).unwrap();
        assert_eq!(config.log, dir.path().join("logs/jobvisor.log"));
        assert_eq!(config.status, Some(PathBuf::from("/run/jobvisor.json")));
    }

    #[test]
    fn load_missing_file_is_config_error() {
        let err = load(Path::new("/nonexistent/jobvisor.yaml")).unwrap_err();
        assert!(matches!(err, SupervisorError::Config(_)));
    }

    #[test]
    fn validate_rejects_zero_counts_and_empty_name() {
        let ok = ListenerConfig::default();
        assert!(ok.validate().is_ok());

        for bad in [
            ListenerConfig {
                worker_num: 0,
                ..ListenerConfig::default()
            },
            ListenerConfig {
                worker_request_num: 0,
                ..ListenerConfig::default()
            },
            ListenerConfig {
                name: "  ".into(),
                ..ListenerConfig::default()
            },
        ] {
            assert!(matches!(bad.validate(), Err(SupervisorError::Config(_))));
        }
    }
}
