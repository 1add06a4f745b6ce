// src/main.rs

use anyhow::Result;
use clap::{ArgAction, CommandFactory, Parser, Subcommand};
use clap_complete::Shell;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::time::Duration;
use syrvisctl::paths;
use syrvisctl::release::{
    self, GitHubReleases, LocalArchive, ReleaseProvider, WheelInstaller, github, wheel,
};
use syrvisctl::service::{NoopController, ScriptController};
use syrvisctl::store::{ActivationReport, StoreOptions, VersionStore};
use tracing::{debug, info};

/// Exit status when `verify` finds inconsistencies
const EXIT_INCONSISTENT: u8 = 24;

#[derive(Parser)]
#[command(name = "syrvisctl")]
#[command(author, version, about = "SyrvisCore service version manager", long_about = None)]
struct Cli {
    /// Install root (default: discovered under /volume1../volume9)
    #[arg(long, global = true, env = "SYRVIS_HOME", value_name = "PATH")]
    home: Option<PathBuf>,

    /// Increase log verbosity (-v info, -vv debug)
    #[arg(short, long, global = true, action = ArgAction::Count)]
    verbose: u8,

    /// Seconds to wait for another syrvisctl process to finish
    #[arg(long, global = true, default_value_t = 30, value_name = "SECS")]
    lock_timeout: u64,

    /// Seconds allowed for each service stop/start
    #[arg(long, global = true, default_value_t = 120, value_name = "SECS")]
    service_timeout: u64,

    /// GitHub repository publishing service releases
    #[arg(long, global = true, env = "SYRVISCTL_GITHUB_REPO", default_value = github::DEFAULT_REPO, value_name = "OWNER/NAME")]
    repo: String,

    /// Python interpreter used to build each version's virtualenv
    #[arg(long, global = true, env = "SYRVISCTL_PYTHON", default_value = wheel::DEFAULT_PYTHON, value_name = "PATH")]
    python: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Install a service version (latest release when omitted)
    Install {
        /// Version to install, e.g. 0.2.0
        version: Option<String>,
        /// Install from a local service wheel or syrviscore-<version>.tar.gz bundle
        #[arg(long, value_name = "FILE")]
        from: Option<PathBuf>,
        /// Activate the version after installing it
        #[arg(long)]
        activate: bool,
        /// Do not stop or start services
        #[arg(long)]
        no_restart: bool,
    },
    /// Remove an installed version that is not active
    Uninstall {
        version: String,
    },
    /// List installed versions
    List,
    /// Switch the active version
    Activate {
        version: String,
        /// Do not stop or start services
        #[arg(long)]
        no_restart: bool,
    },
    /// Return to the previously active version
    Rollback {
        /// Do not stop or start services
        #[arg(long)]
        no_restart: bool,
    },
    /// Remove old versions, keeping the active one and the most recent
    Cleanup {
        /// Number of most recently installed versions to keep
        #[arg(long, default_value_t = 2)]
        keep: usize,
        /// Show what would be removed without removing anything
        #[arg(long)]
        dry_run: bool,
    },
    /// Check that the manifest, `current` and version directories agree
    Verify,
    /// Re-point `current` at the active version and drop stale entries
    Repair,
    /// Show installation details
    Info,
    /// Show activation history
    History {
        /// Show only the most recent N records
        #[arg(long, value_name = "N")]
        limit: Option<usize>,
    },
    /// Check GitHub for a newer service release
    Check,
    /// Generate shell completion scripts
    Completions {
        shell: Shell,
    },
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    match run(&cli) {
        Ok(code) => code,
        Err(err) => {
            eprintln!("Error: {}", err);
            if cli.verbose > 0 {
                for cause in err.chain().skip(1) {
                    eprintln!("  caused by: {}", cause);
                }
            }
            let code = err
                .downcast_ref::<syrvisctl::Error>()
                .map(syrvisctl::Error::exit_code)
                .unwrap_or(1);
            ExitCode::from(code)
        }
    }
}

fn init_tracing(verbose: u8) {
    let default = match verbose {
        0 => "warn",
        1 => "info",
        _ => "debug",
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default)),
        )
        .with_writer(std::io::stderr)
        .init();
}

fn run(cli: &Cli) -> Result<ExitCode> {
    match &cli.command {
        Commands::Install {
            version,
            from,
            activate,
            no_restart,
        } => {
            let home = match paths::discover_home(cli.home.as_deref()) {
                Ok(home) => home,
                Err(syrvisctl::Error::HomeNotFound(_)) => {
                    let home = paths::default_install_path();
                    info!("No existing installation found, installing to {}", home.display());
                    home
                }
                Err(e) => return Err(e.into()),
            };

            let installer = WheelInstaller::new(&cli.python);
            let provider: Box<dyn ReleaseProvider> = match from {
                Some(path) => Box::new(LocalArchive::new(path).with_installer(installer)),
                None => Box::new(GitHubReleases::new(cli.repo.as_str())?.with_installer(installer)),
            };
            let version = match version {
                Some(raw) => release::parse_version(raw)?,
                None => {
                    println!("Resolving latest release...");
                    provider.latest()?
                }
            };

            println!("Installing SyrvisCore {} into {}", version, home.display());
            let store = open_store(cli, &home, *no_restart);
            let report = store.install(&version, provider.as_ref(), *activate)?;

            println!("Installed version {}", report.version);
            println!("  Source: {}", report.source);
            println!("  SHA-256: {}", report.sha256);
            if let Some(backup) = &report.backup {
                println!("  Backup: {}", backup.display());
            }
            for warning in &report.warnings {
                eprintln!("Warning: {}", warning);
            }
            match &report.activation {
                Some(activation) => print_activation(activation),
                None => println!("Activate it with: syrvisctl activate {}", report.version),
            }
            Ok(ExitCode::SUCCESS)
        }
        Commands::Uninstall { version } => {
            let store = open_store(cli, &existing_home(cli)?, true);
            let version = release::parse_version(version)?.to_string();
            store.uninstall(&version)?;
            println!("Uninstalled version {}", version);
            Ok(ExitCode::SUCCESS)
        }
        Commands::List => {
            let store = open_store(cli, &existing_home(cli)?, true);
            let listing = store.list()?;

            if let Some(reason) = &listing.degraded {
                eprintln!("Warning: manifest is inconsistent ({}); run 'syrvisctl verify'", reason);
            }
            if listing.versions.is_empty() {
                println!("No versions installed.");
            } else {
                println!("Installed versions:");
                for info in &listing.versions {
                    let marker = if listing.active.as_deref() == Some(info.version.as_str()) {
                        "*"
                    } else {
                        " "
                    };
                    print!(
                        "  {} {} ({}) installed {}",
                        marker,
                        info.version,
                        info.status,
                        info.installed_at.format("%Y-%m-%d %H:%M:%S")
                    );
                    if let Some(activated) = info.activated_at {
                        print!(", activated {}", activated.format("%Y-%m-%d %H:%M:%S"));
                    }
                    println!();
                }
                println!("\nTotal: {} version(s)", listing.versions.len());
            }
            Ok(ExitCode::SUCCESS)
        }
        Commands::Activate {
            version,
            no_restart,
        } => {
            let home = existing_home(cli)?;
            let store = open_store(cli, &home, *no_restart);
            let version = release::parse_version(version)?.to_string();
            let report = store.activate(&version)?;
            print_activation(&report);
            Ok(ExitCode::SUCCESS)
        }
        Commands::Rollback { no_restart } => {
            let home = existing_home(cli)?;
            let store = open_store(cli, &home, *no_restart);
            let report = store.rollback()?;
            print_activation(&report);
            Ok(ExitCode::SUCCESS)
        }
        Commands::Cleanup { keep, dry_run } => {
            let store = open_store(cli, &existing_home(cli)?, true);
            let report = store.cleanup(*keep, *dry_run)?;

            if report.removed.is_empty() {
                println!("Nothing to clean up.");
            } else if report.dry_run {
                println!("Would remove:");
                for version in &report.removed {
                    println!("  - {}", version);
                }
            } else {
                for version in &report.removed {
                    println!("Removed version {}", version);
                }
            }
            println!("Keeping: {}", report.kept.join(", "));
            Ok(ExitCode::SUCCESS)
        }
        Commands::Verify => {
            let store = open_store(cli, &existing_home(cli)?, true);
            let problems = store.verify()?;
            if problems.is_empty() {
                println!("Installation is consistent.");
                return Ok(ExitCode::SUCCESS);
            }

            println!("Found {} problem(s):", problems.len());
            for problem in &problems {
                println!("  - {}", problem);
            }
            println!("\nRun 'syrvisctl repair' to fix what can be fixed automatically.");
            Ok(ExitCode::from(EXIT_INCONSISTENT))
        }
        Commands::Repair => {
            let store = open_store(cli, &existing_home(cli)?, true);
            let actions = store.repair()?;
            if actions.is_empty() {
                println!("Nothing to repair.");
            } else {
                for action in &actions {
                    println!("  - {}", action);
                }
            }

            let remaining = store.verify()?;
            if !remaining.is_empty() {
                println!("\nStill inconsistent:");
                for problem in &remaining {
                    println!("  - {}", problem);
                }
                return Ok(ExitCode::from(EXIT_INCONSISTENT));
            }
            Ok(ExitCode::SUCCESS)
        }
        Commands::Info => {
            let home = existing_home(cli)?;
            let info = open_store(cli, &home, true).info()?;

            println!("syrvisctl v{}", env!("CARGO_PKG_VERSION"));
            println!("  Install root: {}", info.root.display());
            if !info.initialized {
                println!("  Manifest: not found");
                return Ok(ExitCode::SUCCESS);
            }
            println!("  Active version: {}", info.active.as_deref().unwrap_or("none"));
            println!("  Installed versions: {}", info.installed);
            println!("  Setup complete: {}", if info.setup_complete { "yes" } else { "no" });
            if let Some(schema) = info.schema_version {
                println!("  Manifest schema: {}", schema);
            }
            if let Some(created) = info.created_at {
                println!("  Created: {}", created.format("%Y-%m-%d %H:%M:%S"));
            }
            Ok(ExitCode::SUCCESS)
        }
        Commands::History { limit } => {
            let store = open_store(cli, &existing_home(cli)?, true);
            let history = store.history()?;
            let skip = limit.map_or(0, |n| history.len().saturating_sub(n));

            if history.is_empty() {
                println!("No activation history.");
            } else {
                println!("Activation history:");
                for record in &history[skip..] {
                    println!(
                        "  {} {:<8} {} -> {}",
                        record.timestamp.format("%Y-%m-%d %H:%M:%S"),
                        record.kind,
                        record.from.as_deref().unwrap_or("none"),
                        record.to
                    );
                }
                println!("\nTotal: {} record(s)", history.len());
            }
            Ok(ExitCode::SUCCESS)
        }
        Commands::Check => {
            let client = GitHubReleases::new(cli.repo.as_str())?;
            let latest = client.latest_release()?;
            let latest_version = latest.version()?;

            let active = paths::discover_home(cli.home.as_deref())
                .ok()
                .map(|home| open_store(cli, &home, true))
                .map(|store| store.info())
                .transpose()?
                .and_then(|info| info.active);
            debug!("Latest release {}, active {:?}", latest_version, active);

            println!("Latest release: {}", latest_version);
            match active {
                Some(active) if release::parse_version(&active).is_ok_and(|v| v >= latest_version) => {
                    println!("Version {} is up to date.", active);
                }
                Some(active) => {
                    println!("Update available: {} -> {}", active, latest_version);
                    println!("Run: syrvisctl install {} --activate", latest_version);
                }
                None => {
                    println!("No active version. Run: syrvisctl install {}", latest_version);
                }
            }
            Ok(ExitCode::SUCCESS)
        }
        Commands::Completions { shell } => {
            clap_complete::generate(
                *shell,
                &mut Cli::command(),
                "syrvisctl",
                &mut std::io::stdout(),
            );
            Ok(ExitCode::SUCCESS)
        }
    }
}

fn existing_home(cli: &Cli) -> Result<PathBuf> {
    Ok(paths::discover_home(cli.home.as_deref())?)
}

fn open_store(cli: &Cli, home: &Path, no_restart: bool) -> VersionStore {
    let options = StoreOptions {
        lock_timeout: Duration::from_secs(cli.lock_timeout),
    };
    let store = VersionStore::new(home, options);
    if no_restart {
        store.with_controller(NoopController)
    } else {
        store.with_controller(ScriptController::new(
            home,
            Duration::from_secs(cli.service_timeout),
        ))
    }
}

fn print_activation(report: &ActivationReport) {
    if report.already_active {
        println!("Version {} is already active.", report.to);
        return;
    }
    match &report.from {
        Some(from) => println!("Activated version {} (was {}, {})", report.to, from, report.kind),
        None => println!("Activated version {} ({})", report.to, report.kind),
    }
    for warning in &report.warnings {
        eprintln!("Warning: {}", warning);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_global_options_after_subcommand() {
        let cli = Cli::try_parse_from([
            "syrvisctl",
            "cleanup",
            "--keep",
            "3",
            "--home",
            "/srv/syrvis",
            "--lock-timeout",
            "5",
            "-vv",
        ])
        .unwrap();

        assert_eq!(cli.home.as_deref(), Some(Path::new("/srv/syrvis")));
        assert_eq!(cli.lock_timeout, 5);
        assert_eq!(cli.verbose, 2);
        assert!(matches!(cli.command, Commands::Cleanup { keep: 3, dry_run: false }));
    }

    #[test]
    fn test_install_flags() {
        let cli = Cli::try_parse_from([
            "syrvisctl",
            "install",
            "0.2.0",
            "--from",
            "/tmp/syrviscore-0.2.0.tar.gz",
            "--activate",
        ])
        .unwrap();

        match cli.command {
            Commands::Install {
                version,
                from,
                activate,
                no_restart,
            } => {
                assert_eq!(version.as_deref(), Some("0.2.0"));
                assert_eq!(from, Some(PathBuf::from("/tmp/syrviscore-0.2.0.tar.gz")));
                assert!(activate);
                assert!(!no_restart);
            }
            _ => panic!("expected install"),
        }
    }

    #[test]
    fn test_default_timeouts() {
        let cli = Cli::try_parse_from(["syrvisctl", "list"]).unwrap();
        assert_eq!(cli.lock_timeout, 30);
        assert_eq!(cli.service_timeout, 120);
        assert_eq!(cli.python, PathBuf::from("python3"));
    }
}
