// Purpose: Command-line dispatcher for the vmod binary.
// Inputs/Outputs: Process arguments in; exit code out, diagnostics on stderr.
// Invariants: Every command ends by flushing manifest and ledger through Engine::finish.
// Gotchas: Flags are accepted anywhere on the line; the first bare word is the command.

use std::fs;

use anyhow::{Context, bail};

use crate::config::{self, Config, GetMode, UpgradeMode};
use crate::load::{self, Engine};
use crate::mvs;
use crate::vendor;

pub fn run_cli<I>(args: I) -> i32
where
    I: IntoIterator<Item = String>,
{
    match dispatch(args) {
        Ok(()) => 0,
        Err(err) => {
            eprintln!("vmod: {err:#}");
            1
        }
    }
}

fn dispatch<I>(args: I) -> anyhow::Result<()>
where
    I: IntoIterator<Item = String>,
{
    let mut cfg = Config::from_env()?;
    let mut cmd: Option<String> = None;
    let mut rest: Vec<String> = Vec::new();

    for arg in args {
        if let Some(flag) = arg.strip_prefix('-') {
            let flag = flag.strip_prefix('-').unwrap_or(flag);
            match flag {
                "u" => cfg.upgrade = UpgradeMode::Latest,
                "u=patch" => cfg.upgrade = UpgradeMode::Patch,
                "m" => cfg.modules_only = true,
                "insecure" => cfg.insecure = true,
                _ if flag.starts_with("getmode=") => {
                    cfg.getmode = GetMode::parse(&flag["getmode=".len()..])?;
                }
                _ if flag.starts_with("tags=") => {
                    cfg.tags = flag["tags=".len()..]
                        .split(',')
                        .filter(|t| !t.is_empty())
                        .map(str::to_string)
                        .collect();
                }
                "h" | "help" => {
                    print_usage();
                    return Ok(());
                }
                other => bail!("unknown flag -{other}"),
            }
            continue;
        }
        if cmd.is_none() {
            cmd = Some(arg);
        } else {
            rest.push(arg);
        }
    }

    let Some(cmd) = cmd else {
        print_usage();
        bail!("no command given");
    };

    match cmd.as_str() {
        "init" => cmd_init(cfg, rest.first().cloned()),
        "get" => cmd_get(cfg, &rest),
        "list" => cmd_list(cfg, &rest),
        "download" => cmd_download(cfg),
        "vendor" => cmd_vendor(cfg),
        "graph" => cmd_graph(cfg),
        other => {
            print_usage();
            bail!("unknown command {other:?}");
        }
    }
}

fn print_usage() {
    eprintln!("usage: vmod [flags] <command> [arguments]");
    eprintln!();
    eprintln!("commands:");
    eprintln!("  init [module]    create go.mod (converting legacy configs when present)");
    eprintln!("  get [pkg@vers]   raise or lower module requirements (-u, -u=patch)");
    eprintln!("  list             list packages, or modules with -m (-u shows upgrades)");
    eprintln!("  download         fill the module cache for the build list");
    eprintln!("  vendor           copy the build into ./vendor");
    eprintln!("  graph            print direct and transitive requirements");
    eprintln!();
    eprintln!("flags: -getmode=vendor|local, -insecure, -tags=a,b, -u, -u=patch, -m");
}

fn cmd_init(cfg: Config, module_opt: Option<String>) -> anyhow::Result<()> {
    let cwd = std::env::current_dir()?;
    if let Some((root, file)) = load::find_module_root(&cwd)
        && file == "go.mod"
    {
        bail!("go.mod already exists at {}", root.join("go.mod").display());
    }

    let mut engine = match load::find_module_root(&cwd) {
        // A recognized legacy config anchors the root; the engine
        // converts it in memory and finish() persists the result.
        Some((root, _legacy)) if module_opt.is_none() => Engine::at(cfg, &root)?,
        _ => {
            let path = match module_opt {
                Some(p) => p,
                None => load::find_module_path(&cwd)?,
            };
            let mut f = crate::modfile::ModFile::new();
            f.add_module(&path);
            fs::write(cwd.join("go.mod"), f.format()).context("writing go.mod")?;
            Engine::at(cfg, &cwd)?
        }
    };
    // Seed a checksum file for fresh projects.
    engine.fetcher().ledger().enable();
    engine.finish()?;
    eprintln!("vmod: initialized go.mod in {}", engine.mod_root().display());
    Ok(())
}

fn cmd_get(cfg: Config, args: &[String]) -> anyhow::Result<()> {
    config::harden_git_env();
    if cfg.upgrade == UpgradeMode::Off && args.is_empty() {
        bail!("get: need arguments or -u");
    }
    let mut specs: Vec<(String, String)> = Vec::new();
    for arg in args {
        let (path, vers) = match arg.find('@') {
            Some(i) => (&arg[..i], &arg[i + 1..]),
            None => (arg.as_str(), "latest"),
        };
        if path.is_empty() || vers.contains('@') {
            bail!("get: invalid module version syntax: {arg}");
        }
        let vers = if vers == "none" { mvs::NONE } else { vers };
        specs.push((path.to_string(), vers.to_string()));
    }

    let mut engine = Engine::new(cfg)?;
    if specs.is_empty() {
        // Bare -u: lift everything, nothing named to raise or pin.
        engine.import_paths(&[".".to_string()], false)?;
        return engine.finish();
    }
    engine.get(&specs)?;
    engine.finish()
}

fn cmd_list(cfg: Config, args: &[String]) -> anyhow::Result<()> {
    let modules_only = cfg.modules_only;
    let with_upgrades = cfg.upgrade != UpgradeMode::Off;
    // Upgrade probing is a listing annotation here, not a selection
    // change.
    let mut engine = Engine::new(Config {
        upgrade: UpgradeMode::Off,
        ..cfg
    })?;
    if modules_only {
        for line in engine.list_modules(with_upgrades)? {
            println!("{line}");
        }
    } else {
        let pkgs = if args.is_empty() {
            vec!["all".to_string()]
        } else {
            args.to_vec()
        };
        let loaded = engine.import_paths(&pkgs, false)?;
        for pkg in &loaded.pkgs {
            println!("{pkg}");
        }
    }
    engine.finish()
}

fn cmd_download(cfg: Config) -> anyhow::Result<()> {
    let mut engine = Engine::new(cfg)?;
    engine.download_all()?;
    engine.finish()?;
    eprintln!("vmod: download OK");
    Ok(())
}

fn cmd_vendor(cfg: Config) -> anyhow::Result<()> {
    if cfg.getmode == GetMode::Vendor {
        bail!("vendor: cannot rebuild vendor directory with -getmode=vendor");
    }
    let mut engine = Engine::new(cfg)?;
    let loaded = engine.import_paths(&["ALL".to_string()], true)?.clone();
    let n = vendor::run(&engine, &loaded)?;
    engine.finish()?;
    if n > 0 {
        eprintln!("vmod: vendored {n} packages");
    }
    Ok(())
}

fn cmd_graph(cfg: Config) -> anyhow::Result<()> {
    let mut engine = Engine::new(cfg)?;
    for line in engine.graph_lines()? {
        eprintln!("{line}");
    }
    engine.finish()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run(args: &[&str]) -> i32 {
        run_cli(args.iter().map(|s| s.to_string()))
    }

    #[test]
    fn unknown_command_fails() {
        assert_eq!(run(&["frobnicate"]), 1);
    }

    #[test]
    fn unknown_flag_fails() {
        assert_eq!(run(&["-zap", "list"]), 1);
    }

    #[test]
    fn get_argument_validation() {
        assert_eq!(run(&["get"]), 1);
        assert_eq!(run(&["get", "example.com/x@v1.0.0@v1.0.1"]), 1);
        assert_eq!(run(&["-u", "get", "example.com/x@v1.0.0@v1.0.1"]), 1);
    }
}
