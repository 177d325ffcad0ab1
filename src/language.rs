//! Language tags accepted from clients and where each one runs.

use std::fmt;
use std::path::Path;

use crate::config::Config;
use crate::error::ExecError;

/// Languages executed in a local child process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Language {
    Python,
    JavaScript,
}

/// Languages delegated to the remote execution service.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoteLanguage {
    C,
    Cpp,
    Java,
    Go,
    TypeScript,
    R,
}

/// Where a submission will be executed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Target {
    Local(Language),
    Remote(RemoteLanguage),
}

/// Program and arguments for one child process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandLine {
    pub program: String,
    pub args: Vec<String>,
}

impl Target {
    /// Resolve a client-supplied tag. Matching ignores case and surrounding whitespace.
    pub fn resolve(tag: &str) -> Result<Self, ExecError> {
        let normalized = tag.trim().to_ascii_lowercase();
        let target = match normalized.as_str() {
            "python" => Self::Local(Language::Python),
            "javascript" => Self::Local(Language::JavaScript),
            "c" => Self::Remote(RemoteLanguage::C),
            "cpp" => Self::Remote(RemoteLanguage::Cpp),
            "java" => Self::Remote(RemoteLanguage::Java),
            "go" => Self::Remote(RemoteLanguage::Go),
            "typescript" => Self::Remote(RemoteLanguage::TypeScript),
            "r" => Self::Remote(RemoteLanguage::R),
            _ => return Err(ExecError::handshake(format!("Unsupported language: {tag}"))),
        };
        Ok(target)
    }
}

impl Language {
    /// File suffix for the materialized source, including the dot.
    pub fn suffix(self) -> &'static str {
        match self {
            Self::Python => ".py",
            Self::JavaScript => ".js",
        }
    }

    /// Interpreter invocation for a script on disk.
    pub fn command(self, config: &Config, script: &Path) -> CommandLine {
        let script = script.display().to_string();
        match self {
            // -u keeps stdout unbuffered so output streams as it is printed
            Self::Python => CommandLine {
                program: config.python_bin.clone(),
                args: vec!["-u".to_string(), script],
            },
            Self::JavaScript => CommandLine {
                program: config.node_bin.clone(),
                args: vec![script],
            },
        }
    }
}

impl RemoteLanguage {
    /// Name the remote service knows this language by.
    pub fn runtime_name(self) -> &'static str {
        match self {
            Self::C => "c",
            Self::Cpp => "c++",
            Self::Java => "java",
            Self::Go => "go",
            Self::TypeScript => "typescript",
            Self::R => "r",
        }
    }

    pub fn file_name(self) -> &'static str {
        match self {
            Self::C => "main.c",
            Self::Cpp => "main.cpp",
            Self::Java => "Main.java",
            Self::Go => "main.go",
            Self::TypeScript => "main.ts",
            Self::R => "main.r",
        }
    }
}

impl fmt::Display for Language {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Python => "python",
            Self::JavaScript => "javascript",
        })
    }
}

impl fmt::Display for RemoteLanguage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.runtime_name())
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Local(lang) => lang.fmt(f),
            Self::Remote(lang) => write!(f, "{lang} (remote)"),
        }
    }
}
