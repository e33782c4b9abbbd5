//! Language runtimes supported inside a sandbox.
//!
//! Each language knows its default image, the file extension used by
//! [`crate::SandboxSession::run`], how its runtime environment is prepared and
//! which package manager installs its libraries.

use serde::{Deserialize, Serialize};

/// Language runtime of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Language {
    #[default]
    Python,
    #[serde(alias = "js", alias = "node")]
    JavaScript,
    Go,
    Ruby,
    R,
    #[serde(alias = "c++")]
    Cpp,
    Java,
}

impl Language {
    pub const ALL: [Language; 7] = [
        Language::Python,
        Language::JavaScript,
        Language::Go,
        Language::Ruby,
        Language::R,
        Language::Cpp,
        Language::Java,
    ];

    /// Image used when the configuration does not name one.
    pub fn default_image(&self) -> &'static str {
        match self {
            Language::Python => "python:3.11-slim",
            Language::JavaScript => "node:22-slim",
            Language::Go => "golang:1.23",
            Language::Ruby => "ruby:3.3-slim",
            Language::R => "r-base:4.4.1",
            Language::Cpp => "gcc:14",
            Language::Java => "eclipse-temurin:21-jdk",
        }
    }

    pub fn extension(&self) -> &'static str {
        match self {
            Language::Python => "py",
            Language::JavaScript => "js",
            Language::Go => "go",
            Language::Ruby => "rb",
            Language::R => "R",
            Language::Cpp => "cpp",
            Language::Java => "java",
        }
    }

    /// Package manager used for library installs, `None` when the language
    /// has no supported one.
    pub fn package_manager(&self) -> Option<&'static str> {
        match self {
            Language::Python => Some("pip"),
            Language::JavaScript => Some("npm"),
            Language::Go => Some("go"),
            Language::Ruby => Some("gem"),
            Language::R => Some("R"),
            Language::Cpp => Some("apt-get"),
            Language::Java => None,
        }
    }

    /// Executable resolved once at provisioning and reused for every run.
    pub(crate) fn interpreter_name(&self) -> &'static str {
        match self {
            Language::Python => "python",
            Language::JavaScript => "node",
            Language::Go => "go",
            Language::Ruby => "ruby",
            Language::R => "Rscript",
            Language::Cpp => "g++",
            Language::Java => "java",
        }
    }

    /// Shell script preparing the language environment below `workdir`.
    ///
    /// Runs once during provisioning. `$1` is the workdir; the script prints
    /// the runtime's bin directory (possibly empty) on its last line.
    pub(crate) fn setup_script(&self) -> &'static str {
        match self {
            Language::Python => {
                r#"set -e
venv="$1/.sandbox-venv"
if [ ! -x "$venv/bin/python" ]; then
  py=$(command -v python3 || command -v python)
  "$py" -m venv "$venv" >&2
fi
echo "$venv/bin""#
            }
            Language::JavaScript => {
                r#"set -e
cd "$1"
[ -f package.json ] || echo '{"name":"sandbox","private":true}' > package.json
echo "$1/node_modules/.bin""#
            }
            Language::Go => {
                r#"set -e
cd "$1"
[ -f go.mod ] || go mod init sandbox >&2
echo "$(go env GOPATH)/bin""#
            }
            Language::Ruby | Language::R | Language::Cpp | Language::Java => {
                r#"echo """#
            }
        }
    }

    /// Command line that runs the source file `file` with `interpreter`.
    pub(crate) fn run_argv(&self, interpreter: &str, file: &str) -> Vec<String> {
        let owned = |parts: &[&str]| parts.iter().map(|s| s.to_string()).collect::<Vec<_>>();
        match self {
            Language::Python => owned(&[interpreter, "-u", file]),
            Language::JavaScript | Language::Ruby => owned(&[interpreter, file]),
            Language::Go => owned(&[interpreter, "run", file]),
            Language::R => owned(&[interpreter, file]),
            Language::Cpp => {
                let binary = file.trim_end_matches(".cpp");
                vec![
                    "sh".to_string(),
                    "-c".to_string(),
                    r#""$0" -O2 -std=c++17 -o "$1" "$2" && exec "$1""#.to_string(),
                    interpreter.to_string(),
                    binary.to_string(),
                    file.to_string(),
                ]
            }
            // Single-file source launch (JEP 330).
            Language::Java => owned(&[interpreter, file]),
        }
    }
}

impl std::fmt::Display for Language {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Language::Python => "python",
            Language::JavaScript => "javascript",
            Language::Go => "go",
            Language::Ruby => "ruby",
            Language::R => "r",
            Language::Cpp => "cpp",
            Language::Java => "java",
        };
        write!(f, "{}", name)
    }
}

impl std::str::FromStr for Language {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "python" | "python3" | "py" => Ok(Language::Python),
            "javascript" | "js" | "node" => Ok(Language::JavaScript),
            "go" | "golang" => Ok(Language::Go),
            "ruby" | "rb" => Ok(Language::Ruby),
            "r" => Ok(Language::R),
            "cpp" | "c++" => Ok(Language::Cpp),
            "java" => Ok(Language::Java),
            _ => Err(format!("unsupported language: {}", s)),
        }
    }
}
