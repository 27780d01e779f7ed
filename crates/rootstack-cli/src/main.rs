use std::io::{self, BufRead, Write};
use std::path::Path;

use anyhow::Result;
use clap::{ArgAction, Parser, Subcommand};
use tracing_subscriber::filter::LevelFilter;

use rootstack_depot::{Depot, DepotError, InstallOptions, UninstallOptions};

#[derive(Parser, Debug)]
#[command(name = "rootstack")]
#[command(about = "Install archives as overlays on a filesystem prefix and uninstall them deterministically", long_about = None)]
struct Cli {
    /// Operate on roots under DIR (must be absolute)
    #[arg(short = 'p', long = "prefix", value_name = "DIR", default_value = "/")]
    prefix: String,

    /// Verbose output; stack for extra verbosity
    #[arg(short = 'v', action = ArgAction::Count)]
    verbose: u8,

    /// Analyze and record under a rolled-back transaction; touch nothing
    #[arg(short = 'n', long = "dry-run")]
    dry_run: bool,

    /// Continue past non-fatal per-file errors
    #[arg(short = 'f', long = "force")]
    force: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Install an archive as a new overlay
    Install {
        /// Local path, http(s) URL, or user@host:path
        source: String,
    },
    /// Remove an overlay, restoring what preceded it
    Uninstall {
        /// UUID, serial, name, or newest/oldest/superseded/all
        archive: String,
    },
    /// List installed overlays, newest first
    List {
        /// Restrict to matching archives
        archive: Option<String>,
    },
    /// List the file records of an overlay
    Files {
        archive: String,
    },
    /// Compare an overlay's records against the live tree
    Verify {
        archive: String,
    },
}

fn main() {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let code = match run(cli) {
        Ok(code) => code,
        Err(err) => {
            eprintln!("Error: {err:#}");
            err.downcast_ref::<DepotError>()
                .map(DepotError::exit_code)
                .unwrap_or(1)
        }
    };
    std::process::exit(code);
}

fn run(cli: Cli) -> Result<i32> {
    rootstack_depot::validate_prefix(&cli.prefix)?;
    let mut depot = Depot::open(Path::new(&cli.prefix), true)?;

    let mutating = matches!(cli.command, Commands::Install { .. } | Commands::Uninstall { .. });
    resolve_inconsistent_state(&mut depot, mutating, cli.force)?;

    let stdout = io::stdout();
    match cli.command {
        Commands::Install { source } => {
            let outcome = match depot.install(
                &source,
                InstallOptions {
                    dry_run: cli.dry_run,
                    force: cli.force,
                },
            ) {
                Ok(outcome) => outcome,
                Err(err) => {
                    eprintln!("Install failed. Rolling back installation.");
                    match depot.recover(UninstallOptions { force: cli.force }) {
                        Ok(()) => eprintln!("Rollback successful."),
                        Err(recover_err) => eprintln!(
                            "Unable to roll back installation; depot needs recovery: {recover_err:#}"
                        ),
                    }
                    return Err(err);
                }
            };
            if cli.dry_run {
                eprintln!("Dry run: no changes were made.");
            } else {
                println!("{}", outcome.archive.uuid);
            }
            Ok(if outcome.errors > 0 { 1 } else { 0 })
        }
        Commands::Uninstall { archive } => {
            let mut errors = 0;
            if cli.dry_run {
                // uninstall has no catalog-only preview; resolving the
                // reference is the whole dry run
                let archives = depot.resolve_archives(&archive)?;
                for archive in archives {
                    eprintln!("would uninstall {} ({})", archive.uuid, archive.name);
                }
                return Ok(0);
            }
            for archive in depot.resolve_archives(&archive)? {
                let outcome = depot.uninstall(&archive, UninstallOptions { force: cli.force })?;
                errors += outcome.errors;
                println!("{}", archive.uuid);
            }
            Ok(if errors > 0 { 1 } else { 0 })
        }
        Commands::List { archive } => {
            let mut out = stdout.lock();
            match archive {
                Some(reference) => {
                    let archives = depot.resolve_archives(&reference)?;
                    depot.list_archives(&archives, &mut out)?;
                }
                None => depot.list(cli.verbose > 1, &mut out)?,
            }
            Ok(0)
        }
        Commands::Files { archive } => {
            let mut out = stdout.lock();
            for archive in depot.resolve_archives(&archive)? {
                depot.files(&archive, cli.verbose > 1, &mut out)?;
            }
            Ok(0)
        }
        Commands::Verify { archive } => {
            let mut out = stdout.lock();
            for archive in depot.resolve_archives(&archive)? {
                depot.verify(&archive, &mut out)?;
            }
            Ok(0)
        }
    }
}

/// Surface interrupted installs. For mutating verbs the operator is offered
/// an uninstall; declining refuses the mutation.
fn resolve_inconsistent_state(depot: &mut Depot, mutating: bool, force: bool) -> Result<()> {
    let inactive = depot.inactive_archives()?;
    if inactive.is_empty() {
        return Ok(());
    }

    eprintln!(
        "The following archive{} in an inconsistent state and must be uninstalled before proceeding:",
        if inactive.len() > 1 { "s are" } else { " is" }
    );
    for archive in &inactive {
        eprintln!("  {:<6} {}  {}", archive.serial, archive.uuid, archive.name);
    }

    if !mutating {
        return Ok(());
    }

    eprint!(
        "Would you like to uninstall {} now? [y/n] ",
        if inactive.len() > 1 { "them" } else { "it" }
    );
    io::stderr().flush().ok();
    let mut answer = String::new();
    io::stdin().lock().read_line(&mut answer).ok();
    if answer.trim().eq_ignore_ascii_case("y") {
        depot.recover(UninstallOptions { force })?;
        return Ok(());
    }

    Err(DepotError::InconsistentState {
        serials: inactive.iter().map(|archive| archive.serial).collect(),
    }
    .into())
}

fn init_tracing(verbose: u8) {
    let level = match verbose {
        0 => LevelFilter::WARN,
        1 => LevelFilter::INFO,
        2 => LevelFilter::DEBUG,
        _ => LevelFilter::TRACE,
    };
    tracing_subscriber::fmt()
        .with_max_level(level)
        .with_target(false)
        .with_writer(io::stderr)
        .init();
}
