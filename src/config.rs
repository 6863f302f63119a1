// Purpose: Resolve environment variables and build flags into one Config value.
// Inputs/Outputs: Reads GOPATH/GOROOT/GOPROXY and flag settings; exposes derived cache paths.
// Invariants: All process-wide settings flow through here; no component reads env on its own.
// Gotchas: harden_git_env mutates the process environment and must run before worker threads start.

use std::path::PathBuf;

use anyhow::Context;
use directories::BaseDirs;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum GetMode {
    #[default]
    Normal,
    Vendor,
    Local,
}

impl GetMode {
    pub fn parse(s: &str) -> anyhow::Result<Self> {
        match s {
            "" => Ok(GetMode::Normal),
            "vendor" => Ok(GetMode::Vendor),
            "local" => Ok(GetMode::Local),
            other => anyhow::bail!("invalid -getmode={other}"),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            GetMode::Normal => "",
            GetMode::Vendor => "vendor",
            GetMode::Local => "local",
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum UpgradeMode {
    #[default]
    Off,
    /// -u: lift every module to its latest allowed version.
    Latest,
    /// -u=patch: lift within the current MAJOR.MINOR line only.
    Patch,
}

#[derive(Clone, Debug)]
pub struct Config {
    pub gopath: PathBuf,
    pub goroot: Option<PathBuf>,
    pub goproxy: Option<String>,
    pub getmode: GetMode,
    pub upgrade: UpgradeMode,
    pub insecure: bool,
    pub tags: Vec<String>,
    pub modules_only: bool,
    /// Worker count for fetch-heavy phases.
    pub workers: usize,
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        let gopath = match std::env::var_os("GOPATH") {
            Some(p) if !p.is_empty() => PathBuf::from(p),
            _ => BaseDirs::new()
                .map(|b| b.home_dir().join("go"))
                .context("cannot determine home directory for default GOPATH")?,
        };
        let goroot = std::env::var_os("GOROOT")
            .filter(|p| !p.is_empty())
            .map(PathBuf::from);
        let goproxy = std::env::var("GOPROXY")
            .ok()
            .map(|s| s.trim_end_matches('/').to_string())
            .filter(|s| !s.is_empty());
        Ok(Config {
            gopath,
            goroot,
            goproxy,
            getmode: GetMode::Normal,
            upgrade: UpgradeMode::Off,
            insecure: false,
            tags: Vec::new(),
            modules_only: false,
            workers: 10,
        })
    }

    /// Root of the module cache: extracted trees live at
    /// `src/mod/<path>@<version>` and downloads under
    /// `src/mod/cache/download`.
    pub fn src_mod(&self) -> PathBuf {
        self.gopath.join("src").join("mod")
    }

    pub fn download_dir(&self) -> PathBuf {
        self.src_mod().join("cache").join("download")
    }
}

/// Keep subprocess version control quiet and connection-pool free:
/// no terminal password prompts, no ssh control-master children holding
/// pipes open. Explicit user settings are left alone.
pub fn harden_git_env() {
    // Safety: called once from the CLI entry point before any worker
    // threads exist.
    unsafe {
        if std::env::var_os("GIT_TERMINAL_PROMPT").is_none() {
            std::env::set_var("GIT_TERMINAL_PROMPT", "0");
        }
        if std::env::var_os("GIT_SSH").is_none() && std::env::var_os("GIT_SSH_COMMAND").is_none() {
            std::env::set_var("GIT_SSH_COMMAND", "ssh -o ControlMaster=no");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn getmode_parsing() {
        assert_eq!(GetMode::parse("").unwrap(), GetMode::Normal);
        assert_eq!(GetMode::parse("vendor").unwrap(), GetMode::Vendor);
        assert_eq!(GetMode::parse("local").unwrap(), GetMode::Local);
        assert!(GetMode::parse("weird").is_err());
    }

    #[test]
    fn cache_layout_is_under_gopath() {
        let cfg = Config {
            gopath: PathBuf::from("/gp"),
            goroot: None,
            goproxy: None,
            getmode: GetMode::Normal,
            upgrade: UpgradeMode::Off,
            insecure: false,
            tags: Vec::new(),
            modules_only: false,
            workers: 10,
        };
        assert_eq!(cfg.src_mod(), PathBuf::from("/gp/src/mod"));
        assert_eq!(
            cfg.download_dir(),
            PathBuf::from("/gp/src/mod/cache/download")
        );
    }
}
