// build.rs

use clap::{Arg, ArgAction, Command};
use clap_mangen::Man;
use std::env;
use std::fs;
use std::path::PathBuf;

fn no_restart() -> Arg {
    Arg::new("no_restart")
        .long("no-restart")
        .action(ArgAction::SetTrue)
        .help("Do not stop or start services")
}

fn build_cli() -> Command {
    Command::new("syrvisctl")
        .version(env!("CARGO_PKG_VERSION"))
        .author("SyrvisCore Contributors")
        .about("SyrvisCore service version manager")
        .subcommand_required(true)
        .arg(
            Arg::new("home")
                .long("home")
                .value_name("PATH")
                .global(true)
                .env("SYRVIS_HOME")
                .help("Install root (default: discovered under /volume1../volume9)"),
        )
        .arg(
            Arg::new("verbose")
                .short('v')
                .long("verbose")
                .global(true)
                .action(ArgAction::Count)
                .help("Increase log verbosity (-v info, -vv debug)"),
        )
        .arg(
            Arg::new("lock_timeout")
                .long("lock-timeout")
                .value_name("SECS")
                .global(true)
                .default_value("30")
                .help("Seconds to wait for another syrvisctl process to finish"),
        )
        .arg(
            Arg::new("service_timeout")
                .long("service-timeout")
                .value_name("SECS")
                .global(true)
                .default_value("120")
                .help("Seconds allowed for each service stop/start"),
        )
        .arg(
            Arg::new("repo")
                .long("repo")
                .value_name("OWNER/NAME")
                .global(true)
                .env("SYRVISCTL_GITHUB_REPO")
                .default_value("kevinteg/SyrvisCore")
                .help("GitHub repository publishing service releases"),
        )
        .arg(
            Arg::new("python")
                .long("python")
                .value_name("PATH")
                .global(true)
                .env("SYRVISCTL_PYTHON")
                .default_value("python3")
                .help("Python interpreter used to build each version's virtualenv"),
        )
        .subcommand(
            Command::new("install")
                .about("Install a service version (latest release when omitted)")
                .arg(Arg::new("version").help("Version to install, e.g. 0.2.0"))
                .arg(
                    Arg::new("from")
                        .long("from")
                        .value_name("FILE")
                        .help("Install from a local service wheel or syrviscore-<version>.tar.gz bundle"),
                )
                .arg(
                    Arg::new("activate")
                        .long("activate")
                        .action(ArgAction::SetTrue)
                        .help("Activate the version after installing it"),
                )
                .arg(no_restart()),
        )
        .subcommand(
            Command::new("uninstall")
                .about("Remove an installed version that is not active")
                .arg(Arg::new("version").required(true)),
        )
        .subcommand(Command::new("list").about("List installed versions"))
        .subcommand(
            Command::new("activate")
                .about("Switch the active version")
                .arg(Arg::new("version").required(true))
                .arg(no_restart()),
        )
        .subcommand(
            Command::new("rollback")
                .about("Return to the previously active version")
                .arg(no_restart()),
        )
        .subcommand(
            Command::new("cleanup")
                .about("Remove old versions, keeping the active one and the most recent")
                .arg(
                    Arg::new("keep")
                        .long("keep")
                        .default_value("2")
                        .help("Number of most recently installed versions to keep"),
                )
                .arg(
                    Arg::new("dry_run")
                        .long("dry-run")
                        .action(ArgAction::SetTrue)
                        .help("Show what would be removed without removing anything"),
                ),
        )
        .subcommand(
            Command::new("verify")
                .about("Check that the manifest, `current` and version directories agree"),
        )
        .subcommand(
            Command::new("repair")
                .about("Re-point `current` at the active version and drop stale entries"),
        )
        .subcommand(Command::new("info").about("Show installation details"))
        .subcommand(
            Command::new("history")
                .about("Show activation history")
                .arg(
                    Arg::new("limit")
                        .long("limit")
                        .value_name("N")
                        .help("Show only the most recent N records"),
                ),
        )
        .subcommand(Command::new("check").about("Check GitHub for a newer service release"))
        .subcommand(
            Command::new("completions")
                .about("Generate shell completion scripts")
                .arg(
                    Arg::new("shell")
                        .required(true)
                        .value_parser(["bash", "elvish", "fish", "powershell", "zsh"])
                        .help("Shell type"),
                ),
        )
}

fn main() {
    println!("cargo:rerun-if-changed=build.rs");

    // Create man directory
    let out_dir = PathBuf::from(env::var("CARGO_MANIFEST_DIR").unwrap());
    let man_dir = out_dir.join("man");
    fs::create_dir_all(&man_dir).expect("Failed to create man directory");

    let cmd = build_cli();
    let man = Man::new(cmd);
    let mut buffer = Vec::new();
    man.render(&mut buffer)
        .expect("Failed to render man page");

    let man_path = man_dir.join("syrvisctl.1");
    fs::write(&man_path, buffer).expect("Failed to write man page");
}
