use crate::services::framer::DEFAULT_MAX_LINE_BYTES;
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const ENV_WORKER_EXECUTABLE: &str = "APPDECK_WORKER_EXECUTABLE";
pub const ENV_WORKER_SCRIPT: &str = "APPDECK_WORKER_SCRIPT";
pub const ENV_WORKER_DIR: &str = "APPDECK_WORKER_DIR";

const BACKEND_DIR: &str = "backend";
const WORKER_SCRIPT: &str = "api.py";

/// Everything the supervisor needs to launch the worker.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub executable: PathBuf,
    pub args: Vec<OsString>,
    pub working_dir: Option<PathBuf>,
    /// Longest stdout line accepted before it is dropped
    pub max_line_bytes: usize,
    /// How long `terminate` waits after SIGTERM before killing outright
    pub terminate_grace: Duration,
}

impl WorkerConfig {
    pub fn new(executable: impl Into<PathBuf>) -> Self {
        Self {
            executable: executable.into(),
            args: Vec::new(),
            working_dir: None,
            max_line_bytes: DEFAULT_MAX_LINE_BYTES,
            terminate_grace: Duration::from_millis(500),
        }
    }

    pub fn arg(mut self, arg: impl Into<OsString>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    pub fn max_line_bytes(mut self, limit: usize) -> Self {
        self.max_line_bytes = limit;
        self
    }

    pub fn terminate_grace(mut self, grace: Duration) -> Self {
        self.terminate_grace = grace;
        self
    }

    /// Apply environment-style overrides on top of a resolved layout.
    pub fn with_overrides(mut self, overrides: WorkerOverrides) -> Self {
        if let Some(executable) = overrides.executable {
            self.executable = executable;
        }
        if let Some(script) = overrides.script {
            self.args = vec![script.into_os_string()];
        }
        if let Some(dir) = overrides.working_dir {
            self.working_dir = Some(dir);
        }
        self
    }
}

/// Where the Python backend lives. The two layouts are mutually exclusive:
/// a source checkout during development, the bundle's resource directory
/// once packaged.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkerLayout {
    Development { project_root: PathBuf },
    Packaged { resource_dir: PathBuf },
}

impl WorkerLayout {
    fn backend_dir(&self) -> PathBuf {
        match self {
            WorkerLayout::Development { project_root } => project_root.join(BACKEND_DIR),
            WorkerLayout::Packaged { resource_dir } => resource_dir.join(BACKEND_DIR),
        }
    }

    pub fn executable(&self) -> PathBuf {
        venv_python(&self.backend_dir())
    }

    pub fn script(&self) -> PathBuf {
        self.backend_dir().join(WORKER_SCRIPT)
    }

    pub fn worker_config(&self) -> WorkerConfig {
        let backend = self.backend_dir();
        WorkerConfig::new(self.executable())
            .arg(self.script())
            .working_dir(backend)
    }
}

#[cfg(windows)]
fn venv_python(backend: &Path) -> PathBuf {
    backend.join("venv").join("Scripts").join("python.exe")
}

#[cfg(not(windows))]
fn venv_python(backend: &Path) -> PathBuf {
    backend.join("venv").join("bin").join("python")
}

/// Optional replacements for the resolved paths.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WorkerOverrides {
    pub executable: Option<PathBuf>,
    pub script: Option<PathBuf>,
    pub working_dir: Option<PathBuf>,
}

impl WorkerOverrides {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var_os(key))
    }

    /// Empty values count as unset.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<OsString>) -> Self {
        let path = |key: &str| lookup(key).filter(|v| !v.is_empty()).map(PathBuf::from);
        Self {
            executable: path(ENV_WORKER_EXECUTABLE),
            script: path(ENV_WORKER_SCRIPT),
            working_dir: path(ENV_WORKER_DIR),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn development_layout_points_into_checkout() {
        let layout = WorkerLayout::Development {
            project_root: PathBuf::from("/src/appdeck"),
        };
        let config = layout.worker_config();

        assert!(config.executable.starts_with("/src/appdeck/backend/venv"));
        assert_eq!(config.args, vec![OsString::from("/src/appdeck/backend/api.py")]);
        assert_eq!(config.working_dir, Some(PathBuf::from("/src/appdeck/backend")));
    }

    #[test]
    fn packaged_layout_points_into_resources() {
        let layout = WorkerLayout::Packaged {
            resource_dir: PathBuf::from("/opt/appdeck/resources"),
        };
        assert_eq!(
            layout.script(),
            PathBuf::from("/opt/appdeck/resources/backend/api.py")
        );
        assert!(layout
            .executable()
            .starts_with("/opt/appdeck/resources/backend/venv"));
    }

    #[cfg(not(windows))]
    #[test]
    fn unix_venv_interpreter() {
        let layout = WorkerLayout::Development {
            project_root: PathBuf::from("/p"),
        };
        assert_eq!(layout.executable(), PathBuf::from("/p/backend/venv/bin/python"));
    }

    #[test]
    fn overrides_replace_only_what_is_set() {
        let env: HashMap<&str, &str> = HashMap::from([
            (ENV_WORKER_EXECUTABLE, "/usr/bin/python3"),
            (ENV_WORKER_SCRIPT, ""),
        ]);
        let overrides = WorkerOverrides::from_lookup(|key| env.get(key).map(OsString::from));
        assert_eq!(overrides.executable, Some(PathBuf::from("/usr/bin/python3")));
        assert_eq!(overrides.script, None);
        assert_eq!(overrides.working_dir, None);

        let config = WorkerLayout::Development {
            project_root: PathBuf::from("/p"),
        }
        .worker_config()
        .with_overrides(overrides);
        assert_eq!(config.executable, PathBuf::from("/usr/bin/python3"));
        assert_eq!(config.args, vec![OsString::from("/p/backend/api.py")]);
    }

    #[test]
    fn script_override_replaces_arguments() {
        let config = WorkerConfig::new("python")
            .arg("old.py")
            .arg("--flag")
            .with_overrides(WorkerOverrides {
                script: Some(PathBuf::from("new.py")),
                ..Default::default()
            });
        assert_eq!(config.args, vec![OsString::from("new.py")]);
    }
}
