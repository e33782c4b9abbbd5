//! Dependency installation.
//!
//! Runs once per session right after the environment is created: prepares the
//! language environment (e.g. a Python venv), pins the interpreter every later
//! execution uses, then installs all declared libraries in one batched
//! package-manager invocation.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use log::warn;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::backend::process::shell_escape;
use crate::backend::{BackendHandle, ExecCommand, SandboxBackend};
use crate::error::{SessionError, SessionResult};
use crate::language::Language;

static REQUIREMENT_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"^(@?[A-Za-z0-9][A-Za-z0-9._\-/\[\],]*)\s*(==|>=|<=|~=|!=|>|<|@|=)?\s*(\S+)?$",
    )
    .expect("requirement pattern is valid")
});

/// A library to install, e.g. `pandas`, `numpy>=1.26` or `lodash@4`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct LibraryRequirement {
    name: String,
    constraint: Option<(String, String)>,
}

impl LibraryRequirement {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            constraint: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Operator and version, e.g. `(">=", "2.0")`.
    pub fn constraint(&self) -> Option<(&str, &str)> {
        self.constraint
            .as_ref()
            .map(|(op, version)| (op.as_str(), version.as_str()))
    }

    /// Argument understood by `language`'s package manager.
    pub fn format_for(&self, language: Language) -> String {
        let Some((op, version)) = self.constraint() else {
            return self.name.clone();
        };
        match language {
            Language::Python => {
                let op = if op == "@" || op == "=" { "==" } else { op };
                format!("{}{}{}", self.name, op, version)
            }
            Language::JavaScript | Language::Go => format!("{}@{}", self.name, version),
            Language::Ruby => format!("{}:{}{}", self.name, ruby_operator(op), version),
            Language::Cpp => format!("{}={}", self.name, version),
            Language::R | Language::Java => self.name.clone(),
        }
    }
}

fn ruby_operator(op: &str) -> &str {
    match op {
        "==" | "=" | "@" => "",
        "~=" => "~>",
        other => other,
    }
}

impl FromStr for LibraryRequirement {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        let caps = REQUIREMENT_RE
            .captures(trimmed)
            .ok_or_else(|| format!("invalid library requirement: '{}'", s))?;
        let name = caps[1].to_string();
        let constraint = match (caps.get(2), caps.get(3)) {
            (Some(op), Some(version)) => {
                Some((op.as_str().to_string(), version.as_str().to_string()))
            }
            (None, None) => None,
            _ => return Err(format!("invalid version constraint in '{}'", s)),
        };
        Ok(Self { name, constraint })
    }
}

impl TryFrom<String> for LibraryRequirement {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<LibraryRequirement> for String {
    fn from(value: LibraryRequirement) -> Self {
        value.to_string()
    }
}

impl fmt::Display for LibraryRequirement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.constraint() {
            Some((op, version)) => write!(f, "{}{}{}", self.name, op, version),
            None => write!(f, "{}", self.name),
        }
    }
}

/// Collapse duplicates, keeping the first occurrence of each library name.
pub fn dedupe(requirements: &[LibraryRequirement]) -> Vec<LibraryRequirement> {
    let mut kept: Vec<LibraryRequirement> = Vec::with_capacity(requirements.len());
    for req in requirements {
        match kept.iter().find(|k| k.name == req.name) {
            Some(existing) if existing != req => warn!(
                "conflicting requirements '{}' and '{}'; keeping the first",
                existing, req
            ),
            Some(_) => {}
            None => kept.push(req.clone()),
        }
    }
    kept
}

/// Runtime paths pinned during provisioning.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RuntimeEnvironment {
    /// Directory prepended to `PATH` for every execution (venv, node_modules).
    pub bin_dir: Option<String>,
    /// Absolute path of the language's interpreter or compiler.
    pub interpreter: String,
}

impl RuntimeEnvironment {
    /// Environment variables handed to every execution.
    pub(crate) fn exec_env(&self) -> Vec<(String, String)> {
        self.bin_dir
            .iter()
            .map(|dir| ("SBX_PATH_PREFIX".to_string(), dir.clone()))
            .collect()
    }
}

/// Resolves `$2` on `PATH`, with `$1` (if non-empty) searched first.
const RESOLVE_SCRIPT: &str = r#"[ -n "$1" ] && PATH="$1:$PATH"; command -v "$2""#;

/// Prepares the language environment and installs libraries.
#[derive(Debug, Clone)]
pub struct Installer {
    language: Language,
    workdir: String,
    timeout: Duration,
}

impl Installer {
    pub fn new(language: Language, workdir: impl Into<String>, timeout: Duration) -> Self {
        Self {
            language,
            workdir: workdir.into(),
            timeout,
        }
    }

    /// Set up the language environment and pin its interpreter.
    pub async fn prepare(
        &self,
        backend: &dyn SandboxBackend,
        handle: &BackendHandle,
    ) -> SessionResult<RuntimeEnvironment> {
        let setup = ExecCommand::script(self.language.setup_script(), &[&self.workdir])
            .workdir(self.workdir.clone())
            .timeout(Some(self.timeout));
        let result = backend
            .exec(handle, &setup)
            .await
            .map_err(|e| SessionError::execution("prepare runtime", backend.variant(), e))?;
        if !result.success() {
            return Err(self.failure(result.exit_code, &result.stdout, &result.stderr));
        }
        let bin_dir = result
            .stdout
            .lines()
            .last()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(str::to_string);

        let name = self.language.interpreter_name();
        let resolve = ExecCommand::script(RESOLVE_SCRIPT, &[bin_dir.as_deref().unwrap_or(""), name])
            .timeout(Some(self.timeout));
        let resolved = backend
            .exec(handle, &resolve)
            .await
            .map_err(|e| SessionError::execution("resolve interpreter", backend.variant(), e))?;
        let interpreter = resolved.stdout.trim().to_string();
        if !resolved.success() || !interpreter.starts_with('/') {
            return Err(SessionError::Install {
                language: self.language.to_string(),
                exit_code: resolved.exit_code,
                output: format!("'{}' not found in the image", name),
            });
        }

        Ok(RuntimeEnvironment {
            bin_dir,
            interpreter,
        })
    }

    /// Install `requirements` in one package-manager invocation.
    ///
    /// Any failure fails the whole install.
    pub async fn install(
        &self,
        backend: &dyn SandboxBackend,
        handle: &BackendHandle,
        runtime: &RuntimeEnvironment,
        requirements: &[LibraryRequirement],
    ) -> SessionResult<usize> {
        let requirements = dedupe(requirements);
        if requirements.is_empty() {
            return Ok(0);
        }

        let Some(command) = self.install_command(runtime, &requirements) else {
            return Err(SessionError::Install {
                language: self.language.to_string(),
                exit_code: -1,
                output: format!("{} has no supported package manager", self.language),
            });
        };

        let command = command
            .workdir(self.workdir.clone())
            .timeout(Some(self.timeout));
        let result = backend
            .exec(handle, &command)
            .await
            .map_err(|e| SessionError::execution("install", backend.variant(), e))?;

        if result.timed_out {
            return Err(SessionError::Install {
                language: self.language.to_string(),
                exit_code: result.exit_code,
                output: format!("timed out after {:?}", self.timeout),
            });
        }
        if !result.success() {
            return Err(self.failure(result.exit_code, &result.stdout, &result.stderr));
        }

        Ok(requirements.len())
    }

    /// Build the batched install command, `None` for languages without a
    /// package manager.
    pub(crate) fn install_command(
        &self,
        runtime: &RuntimeEnvironment,
        requirements: &[LibraryRequirement],
    ) -> Option<ExecCommand> {
        let packages: Vec<String> = requirements
            .iter()
            .map(|r| r.format_for(self.language))
            .collect();

        let argv = match self.language {
            Language::Python => {
                let mut argv = vec![
                    runtime.interpreter.clone(),
                    "-m".to_string(),
                    "pip".to_string(),
                    "install".to_string(),
                    "--no-cache-dir".to_string(),
                    "--disable-pip-version-check".to_string(),
                ];
                argv.extend(packages);
                argv
            }
            Language::JavaScript => {
                let mut argv = vec![
                    "npm".to_string(),
                    "install".to_string(),
                    "--no-audit".to_string(),
                    "--no-fund".to_string(),
                ];
                argv.extend(packages);
                argv
            }
            Language::Go => {
                let mut argv = vec![runtime.interpreter.clone(), "get".to_string()];
                argv.extend(packages);
                argv
            }
            Language::Ruby => {
                let mut argv = vec![
                    "gem".to_string(),
                    "install".to_string(),
                    "--no-document".to_string(),
                ];
                argv.extend(packages);
                argv
            }
            Language::R => {
                // install.packages only warns on failure; verify afterwards.
                let names = packages
                    .iter()
                    .map(|p| format!("\"{}\"", p.replace('"', "")))
                    .collect::<Vec<_>>()
                    .join(", ");
                let expr = format!(
                    "pkgs <- c({names}); install.packages(pkgs, repos = \"https://cloud.r-project.org\"); \
                     ok <- sapply(pkgs, requireNamespace, quietly = TRUE); if (!all(ok)) quit(status = 1)"
                );
                vec!["Rscript".to_string(), "-e".to_string(), expr]
            }
            Language::Cpp => {
                let script = format!(
                    "apt-get update -qq && DEBIAN_FRONTEND=noninteractive apt-get install -y -qq {}",
                    packages
                        .iter()
                        .map(|p| shell_escape(p))
                        .collect::<Vec<_>>()
                        .join(" ")
                );
                vec!["sh".to_string(), "-c".to_string(), script]
            }
            Language::Java => return None,
        };

        Some(ExecCommand::new(argv))
    }

    fn failure(&self, exit_code: i32, stdout: &str, stderr: &str) -> SessionError {
        let mut output = stderr.trim().to_string();
        if output.is_empty() {
            output = stdout.trim().to_string();
        }
        SessionError::Install {
            language: self.language.to_string(),
            exit_code,
            output,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn req(s: &str) -> LibraryRequirement {
        s.parse().unwrap()
    }

    #[test]
    fn test_parse_requirements() {
        let plain = req("pandas");
        assert_eq!(plain.name(), "pandas");
        assert_eq!(plain.constraint(), None);

        let pinned = req("numpy >= 1.26");
        assert_eq!(pinned.name(), "numpy");
        assert_eq!(pinned.constraint(), Some((">=", "1.26")));

        let scoped = req("@types/node@22");
        assert_eq!(scoped.name(), "@types/node");
        assert_eq!(scoped.constraint(), Some(("@", "22")));

        let extras = req("uvicorn[standard]==0.30.1");
        assert_eq!(extras.name(), "uvicorn[standard]");

        assert!("".parse::<LibraryRequirement>().is_err());
        assert!("pandas >=".parse::<LibraryRequirement>().is_err());
        assert!("; rm -rf /".parse::<LibraryRequirement>().is_err());
    }

    #[test]
    fn test_format_per_package_manager() {
        let r = req("requests==2.32.0");
        assert_eq!(r.format_for(Language::Python), "requests==2.32.0");
        assert_eq!(r.format_for(Language::JavaScript), "requests@2.32.0");
        assert_eq!(r.format_for(Language::Ruby), "requests:2.32.0");
        assert_eq!(r.format_for(Language::Cpp), "requests=2.32.0");
        assert_eq!(r.format_for(Language::R), "requests");

        assert_eq!(req("lodash@4").format_for(Language::Python), "lodash==4");
        assert_eq!(req("rails~=7.1").format_for(Language::Ruby), "rails:~>7.1");
    }

    #[test]
    fn test_serde_as_string() {
        let parsed: Vec<LibraryRequirement> =
            serde_json::from_str(r#"["pandas", "numpy>=1.26"]"#).unwrap();
        assert_eq!(parsed[1].constraint(), Some((">=", "1.26")));
        assert_eq!(
            serde_json::to_string(&parsed).unwrap(),
            r#"["pandas","numpy>=1.26"]"#
        );
    }

    #[test]
    fn test_dedupe_keeps_first() {
        let reqs = vec![
            req("pandas"),
            req("numpy"),
            req("pandas"),
            req("numpy==1.0"),
        ];
        let kept = dedupe(&reqs);
        assert_eq!(kept, vec![req("pandas"), req("numpy")]);
    }

    #[test]
    fn test_install_command_is_batched() {
        let runtime = RuntimeEnvironment {
            bin_dir: Some("/sandbox/.sandbox-venv/bin".to_string()),
            interpreter: "/sandbox/.sandbox-venv/bin/python".to_string(),
        };
        let installer = Installer::new(Language::Python, "/sandbox", Duration::from_secs(60));
        let command = installer
            .install_command(&runtime, &[req("pandas"), req("numpy>=1.26")])
            .unwrap();
        assert_eq!(
            command.argv,
            vec![
                "/sandbox/.sandbox-venv/bin/python",
                "-m",
                "pip",
                "install",
                "--no-cache-dir",
                "--disable-pip-version-check",
                "pandas",
                "numpy>=1.26"
            ]
        );

        let java = Installer::new(Language::Java, "/sandbox", Duration::from_secs(60));
        assert!(java.install_command(&runtime, &[req("guava")]).is_none());
    }

    #[test]
    fn test_cpp_install_quotes_packages() {
        let runtime = RuntimeEnvironment {
            bin_dir: None,
            interpreter: "/usr/local/bin/g++".to_string(),
        };
        let installer = Installer::new(Language::Cpp, "/sandbox", Duration::from_secs(60));
        let command = installer
            .install_command(&runtime, &[req("libboost-dev"), req("libfmt-dev=9.1")])
            .unwrap();
        assert!(command.argv[2].ends_with("apt-get install -y -qq libboost-dev 'libfmt-dev=9.1'"));
    }

    #[test]
    fn test_exec_env_carries_bin_dir() {
        let runtime = RuntimeEnvironment {
            bin_dir: Some("/sandbox/node_modules/.bin".to_string()),
            interpreter: "/usr/local/bin/node".to_string(),
        };
        assert_eq!(
            runtime.exec_env(),
            vec![(
                "SBX_PATH_PREFIX".to_string(),
                "/sandbox/node_modules/.bin".to_string()
            )]
        );
    }
}
