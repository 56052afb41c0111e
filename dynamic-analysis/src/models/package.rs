use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

/// Default image for dynamic analysis sandboxes
pub const DEFAULT_SANDBOX_IMAGE: &str = "docker.io/pakaremon/dynamic-analysis";

/// Package ecosystems the worker knows how to drive
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum Ecosystem {
    #[serde(rename = "npm")]
    Npm,
    #[serde(rename = "pypi")]
    PyPI,
    #[serde(rename = "rubygems")]
    RubyGems,
    #[serde(rename = "maven")]
    Maven,
    #[serde(rename = "crates.io")]
    CratesIo,
    #[serde(rename = "packagist")]
    Packagist,
}

impl Ecosystem {
    pub const ALL: [Ecosystem; 6] = [
        Ecosystem::Npm,
        Ecosystem::PyPI,
        Ecosystem::RubyGems,
        Ecosystem::Maven,
        Ecosystem::CratesIo,
        Ecosystem::Packagist,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Ecosystem::Npm => "npm",
            Ecosystem::PyPI => "pypi",
            Ecosystem::RubyGems => "rubygems",
            Ecosystem::Maven => "maven",
            Ecosystem::CratesIo => "crates.io",
            Ecosystem::Packagist => "packagist",
        }
    }

    /// Script inside the default sandbox image that drives a single phase
    pub fn analysis_script(&self) -> &'static str {
        match self {
            Ecosystem::Npm => "/usr/local/bin/analyze-node.js",
            Ecosystem::PyPI => "/usr/local/bin/analyze-python.py",
            Ecosystem::RubyGems => "/usr/local/bin/analyze-ruby.rb",
            Ecosystem::Maven => "/usr/local/bin/analyze-java.sh",
            Ecosystem::CratesIo => "/usr/local/bin/analyze-rust.py",
            Ecosystem::Packagist => "/usr/local/bin/analyze-php.php",
        }
    }
}

impl fmt::Display for Ecosystem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Ecosystem {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "npm" => Ok(Ecosystem::Npm),
            "pypi" => Ok(Ecosystem::PyPI),
            "rubygems" | "gem" => Ok(Ecosystem::RubyGems),
            "maven" => Ok(Ecosystem::Maven),
            "crates.io" | "cargo" => Ok(Ecosystem::CratesIo),
            "packagist" | "composer" => Ok(Ecosystem::Packagist),
            other => Err(format!("unsupported package ecosystem '{}'", other)),
        }
    }
}

/// A resolved package ready for analysis
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Package {
    pub ecosystem: Ecosystem,
    pub name: String,
    pub version: String,
    /// Locally supplied archive, copied into the sandbox at the same path
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub local_path: Option<PathBuf>,
}

impl Package {
    pub fn new(ecosystem: Ecosystem, name: impl Into<String>, version: impl Into<String>) -> Self {
        let version = version.into();
        Self {
            ecosystem,
            name: name.into(),
            version: if version.trim().is_empty() { "latest".to_string() } else { version },
            local_path: None,
        }
    }

    pub fn with_local_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.local_path = Some(path.into());
        self
    }

    /// Path-safe form of the name (scoped npm names contain '/')
    pub fn storage_name(&self) -> String {
        path_segment(&self.name)
    }

    /// Path-safe form of the version
    pub fn storage_version(&self) -> String {
        path_segment(&self.version)
    }
}

/// A single path component: separators are flattened and `.`/`..` escaped
fn path_segment(raw: &str) -> String {
    let flat = raw.replace(['/', '\\'], "_");
    if flat.chars().all(|c| c == '.') {
        "_".repeat(flat.len().max(1))
    } else {
        flat
    }
}

impl fmt::Display for Package {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}@{}", self.ecosystem, self.name, self.version)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ecosystem_parsing_accepts_aliases() {
        assert_eq!("NPM".parse::<Ecosystem>().unwrap(), Ecosystem::Npm);
        assert_eq!("cargo".parse::<Ecosystem>().unwrap(), Ecosystem::CratesIo);
        assert_eq!("gem".parse::<Ecosystem>().unwrap(), Ecosystem::RubyGems);
        assert!("hackage".parse::<Ecosystem>().is_err());
    }

    #[test]
    fn test_ecosystem_round_trips_through_display() {
        for eco in Ecosystem::ALL {
            assert_eq!(eco.to_string().parse::<Ecosystem>().unwrap(), eco);
        }
    }

    #[test]
    fn test_empty_version_means_latest() {
        let pkg = Package::new(Ecosystem::PyPI, "requests", " ");
        assert_eq!(pkg.version, "latest");
        assert_eq!(pkg.to_string(), "pypi/requests@latest");
    }

    #[test]
    fn test_storage_name_flattens_scopes() {
        let pkg = Package::new(Ecosystem::Npm, "@babel/core", "7.0.0");
        assert_eq!(pkg.storage_name(), "@babel_core");
    }

    #[test]
    fn test_storage_segments_cannot_traverse() {
        let pkg = Package::new(Ecosystem::Npm, "..", "../../etc");
        assert_eq!(pkg.storage_name(), "__");
        assert_eq!(pkg.storage_version(), ".._.._etc");

        let pkg = Package::new(Ecosystem::PyPI, ".", "..\\..");
        assert_eq!(pkg.storage_name(), "_");
        assert_eq!(pkg.storage_version(), ".._..");
    }
}
