//! Session configuration.
//!
//! Values are layered: built-in defaults, then an optional TOML file
//! (`~/.config/sbx/config.toml` unless a path is given), then `SBX_*`
//! environment variables with `__` separating nested keys, e.g.
//! `SBX_CLUSTER__NAMESPACE=sandboxes`.

use std::collections::BTreeMap;
use std::env;
use std::path::{Path, PathBuf};
use std::time::Duration;

use config::{Config, Environment, File, FileFormat};
use serde::{Deserialize, Serialize};

use crate::backend::validate::{
    is_within_roots, normalize_remote_path, validate_container_path, validate_env_var_key, validate_image_name,
    validate_namespace,
};
use crate::backend::{BackendVariant, RuntimeType};
use crate::error::{SessionError, SessionResult};
use crate::install::LibraryRequirement;
use crate::language::Language;

pub const APP_NAME: &str = "sbx";

const ENV_PREFIX: &str = "SBX";

/// CPU and memory caps applied to the environment.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResourceLimits {
    /// Fractional CPUs, e.g. `1.5`.
    pub cpus: Option<f64>,
    /// Memory with an optional binary unit suffix: `512m`, `2g`, `1Gi`.
    pub memory: Option<String>,
}

impl ResourceLimits {
    /// Memory limit in bytes.
    pub fn memory_bytes(&self) -> Result<Option<u64>, String> {
        self.memory.as_deref().map(parse_memory).transpose()
    }
}

/// Parse a memory quantity. Units are powers of 1024, as container engines
/// interpret them.
pub fn parse_memory(value: &str) -> Result<u64, String> {
    let trimmed = value.trim();
    let split = trimmed
        .find(|c: char| !(c.is_ascii_digit() || c == '.'))
        .unwrap_or(trimmed.len());
    let (number, unit) = trimmed.split_at(split);
    let number: f64 = number
        .parse()
        .map_err(|_| format!("invalid memory quantity '{}'", value))?;

    let multiplier: u64 = match unit.trim().to_ascii_lowercase().as_str() {
        "" | "b" => 1,
        "k" | "kb" | "ki" | "kib" => 1 << 10,
        "m" | "mb" | "mi" | "mib" => 1 << 20,
        "g" | "gb" | "gi" | "gib" => 1 << 30,
        "t" | "tb" | "ti" | "tib" => 1 << 40,
        other => return Err(format!("unknown memory unit '{}' in '{}'", other, value)),
    };

    let bytes = (number * multiplier as f64).round();
    if bytes < 1.0 {
        return Err(format!("memory limit '{}' must be positive", value));
    }
    Ok(bytes as u64)
}

/// Cluster driver settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClusterConfig {
    pub namespace: String,
    /// kubeconfig context, current context when unset.
    pub context: Option<String>,
    /// Path to the kubectl binary.
    pub kubectl: String,
    /// How long to wait for a pod to become ready.
    pub ready_timeout_secs: u64,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            namespace: "default".to_string(),
            context: None,
            kubectl: "kubectl".to_string(),
            ready_timeout_secs: 120,
        }
    }
}

/// Everything needed to open a session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    #[serde(alias = "runtime", alias = "lang")]
    pub language: Language,
    /// Image override; the language's default image when unset.
    #[serde(alias = "base_image")]
    pub image: Option<String>,
    #[serde(alias = "backend_variant")]
    pub backend: BackendVariant,
    /// Container engine; auto-detected when unset.
    pub engine: Option<RuntimeType>,
    /// Custom engine binary path, requires `engine`.
    pub engine_binary: Option<String>,
    pub libraries: Vec<LibraryRequirement>,
    /// Report each lifecycle step at info level.
    pub verbose: bool,
    pub resource_limits: Option<ResourceLimits>,
    /// Working directory inside the environment.
    pub workdir: String,
    /// Remote roots that copies into the environment may write below.
    pub allowed_remote_roots: Vec<String>,
    /// Timeout applied to executions that do not set their own.
    pub default_timeout_secs: Option<u64>,
    pub install_timeout_secs: u64,
    /// Extra environment for the sandbox and every execution.
    pub env: BTreeMap<String, String>,
    pub cluster: ClusterConfig,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            language: Language::default(),
            image: None,
            backend: BackendVariant::default(),
            engine: None,
            engine_binary: None,
            libraries: Vec::new(),
            verbose: false,
            resource_limits: None,
            workdir: "/sandbox".to_string(),
            allowed_remote_roots: vec!["/sandbox".to_string(), "/tmp".to_string()],
            default_timeout_secs: None,
            install_timeout_secs: 600,
            env: BTreeMap::new(),
            cluster: ClusterConfig::default(),
        }
    }
}

impl SessionConfig {
    pub fn new(language: Language) -> Self {
        Self {
            language,
            ..Self::default()
        }
    }

    pub fn with_image(mut self, image: impl Into<String>) -> Self {
        self.image = Some(image.into());
        self
    }

    pub fn with_backend(mut self, backend: BackendVariant) -> Self {
        self.backend = backend;
        self
    }

    pub fn with_engine(mut self, engine: RuntimeType) -> Self {
        self.engine = Some(engine);
        self
    }

    /// Parse and append library requirements.
    pub fn with_libraries<I, S>(mut self, libraries: I) -> SessionResult<Self>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        for lib in libraries {
            let req = lib
                .as_ref()
                .parse::<LibraryRequirement>()
                .map_err(SessionError::InvalidConfig)?;
            self.libraries.push(req);
        }
        Ok(self)
    }

    pub fn with_verbose(mut self, verbose: bool) -> Self {
        self.verbose = verbose;
        self
    }

    pub fn with_resource_limits(mut self, limits: ResourceLimits) -> Self {
        self.resource_limits = Some(limits);
        self
    }

    pub fn with_workdir(mut self, workdir: impl Into<String>) -> Self {
        self.workdir = workdir.into();
        self
    }

    pub fn with_default_timeout(mut self, timeout: Duration) -> Self {
        self.default_timeout_secs = Some(timeout.as_secs().max(1));
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    /// Image that will actually be provisioned.
    pub fn effective_image(&self) -> String {
        self.image
            .clone()
            .unwrap_or_else(|| self.language.default_image().to_string())
    }

    pub fn default_timeout(&self) -> Option<Duration> {
        self.default_timeout_secs.map(Duration::from_secs)
    }

    pub fn install_timeout(&self) -> Duration {
        Duration::from_secs(self.install_timeout_secs)
    }

    /// Check the configuration before anything touches a runtime.
    pub fn validate(&self) -> SessionResult<()> {
        let invalid = |e: crate::backend::BackendError| SessionError::InvalidConfig(e.to_string());

        validate_image_name(&self.effective_image()).map_err(invalid)?;
        validate_container_path(&self.workdir).map_err(invalid)?;
        let workdir = normalize_remote_path(&self.workdir, "/").map_err(invalid)?;
        if workdir == "/" {
            return Err(SessionError::InvalidConfig(
                "workdir cannot be '/'".to_string(),
            ));
        }
        for root in &self.allowed_remote_roots {
            validate_container_path(root).map_err(invalid)?;
        }
        // Source files for `run` are staged below the workdir.
        if !is_within_roots(&workdir, &self.allowed_remote_roots) {
            return Err(SessionError::InvalidConfig(format!(
                "workdir '{}' is outside the permitted roots ({})",
                workdir,
                self.allowed_remote_roots.join(", ")
            )));
        }
        for key in self.env.keys() {
            validate_env_var_key(key).map_err(invalid)?;
        }

        if let Some(ref limits) = self.resource_limits {
            if let Some(cpus) = limits.cpus
                && !(cpus > 0.0 && cpus.is_finite())
            {
                return Err(SessionError::InvalidConfig(format!(
                    "cpus must be positive, got {}",
                    cpus
                )));
            }
            limits.memory_bytes().map_err(SessionError::InvalidConfig)?;
        }

        if self.install_timeout_secs == 0 {
            return Err(SessionError::InvalidConfig(
                "install_timeout_secs must be at least 1".to_string(),
            ));
        }
        if self.default_timeout_secs == Some(0) {
            return Err(SessionError::InvalidConfig(
                "default_timeout_secs must be at least 1".to_string(),
            ));
        }

        if !self.libraries.is_empty() && self.language.package_manager().is_none() {
            return Err(SessionError::InvalidConfig(format!(
                "{} does not support library installation",
                self.language
            )));
        }

        if self.backend == BackendVariant::ClusterOrchestrated {
            validate_namespace(&self.cluster.namespace).map_err(invalid)?;
        }

        Ok(())
    }

    /// Load layered configuration from `path` (or the default location) and
    /// the process environment.
    pub fn load(path: Option<&Path>) -> SessionResult<Self> {
        Self::load_with_env(path, None)
    }

    /// Like [`SessionConfig::load`], reading `SBX_*` variables from `vars`
    /// instead of the process environment when given.
    pub fn load_with_env(
        path: Option<&Path>,
        vars: Option<config::Map<String, String>>,
    ) -> SessionResult<Self> {
        let (file, required) = match path {
            Some(p) => (expand_path(p)?, true),
            None => match default_config_path() {
                Some(p) => (p, false),
                None => (PathBuf::new(), false),
            },
        };

        let mut builder = Config::builder();
        if !file.as_os_str().is_empty() {
            builder = builder.add_source(
                File::from(file.as_path())
                    .format(FileFormat::Toml)
                    .required(required),
            );
        }
        let built = builder
            .add_source(
                Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true)
                    .list_separator(",")
                    .with_list_parse_key("libraries")
                    .with_list_parse_key("allowed_remote_roots")
                    .source(vars),
            )
            .build()
            .map_err(|e| SessionError::InvalidConfig(e.to_string()))?;

        let mut config: SessionConfig = built
            .try_deserialize()
            .map_err(|e| SessionError::InvalidConfig(e.to_string()))?;

        if let Some(ref binary) = config.engine_binary {
            config.engine_binary = Some(shellexpand::tilde(binary).to_string());
        }
        config.cluster.kubectl = shellexpand::tilde(&config.cluster.kubectl).to_string();

        Ok(config)
    }

    /// Render as TOML, e.g. for `sbx config init`.
    pub fn to_toml(&self) -> SessionResult<String> {
        toml::to_string_pretty(self).map_err(|e| SessionError::InvalidConfig(e.to_string()))
    }
}

fn expand_path(path: &Path) -> SessionResult<PathBuf> {
    match path.to_str() {
        Some(text) => shellexpand::full(text)
            .map(|expanded| PathBuf::from(expanded.to_string()))
            .map_err(|e| SessionError::InvalidConfig(format!("expanding path: {}", e))),
        None => Ok(path.to_path_buf()),
    }
}

/// `$XDG_CONFIG_HOME/sbx/config.toml`, falling back to the platform config
/// directory.
pub fn default_config_path() -> Option<PathBuf> {
    if let Some(dir) = env::var_os("XDG_CONFIG_HOME").filter(|v| !v.is_empty()) {
        return Some(PathBuf::from(dir).join(APP_NAME).join("config.toml"));
    }
    dirs::config_dir()
        .or_else(|| dirs::home_dir().map(|home| home.join(".config")))
        .map(|dir| dir.join(APP_NAME).join("config.toml"))
}
