//! CLI command definitions and handlers.

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use color_eyre::eyre::{Result, eyre};
use graphdock_common::{HarnessError, HarnessSettings, Version};

use crate::database::HttpGraphConnector;
use crate::filesystem::{ContainerOwnershipHelper, ResourceManager, TeardownReport};
use crate::runtime::{ContainerRuntime, DockerRuntime};
use crate::scenario::{self, BackupOptions, ScenarioContext, StorageKind};

/// graphdock - verification harness for containerized graph databases
#[derive(Parser)]
#[command(name = "graphdock")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Settings file (TOML)
    #[arg(long, global = true, env = "GRAPHDOCK_CONFIG")]
    pub config: Option<PathBuf>,

    /// Root directory for test folders and teardown archives
    #[arg(long, global = true)]
    pub output_root: Option<PathBuf>,

    /// Enable debug logging
    #[arg(long, global = true)]
    pub debug: bool,

    /// The subcommand to execute.
    #[command(subcommand)]
    pub command: Commands,
}

/// Harness commands.
#[derive(Subcommand)]
pub enum Commands {
    /// Upgrade an older server's store to the image under test
    Upgrade {
        /// Source version (default: every supported source)
        #[arg(long)]
        from: Option<Version>,

        /// Keep server state in named volumes instead of host folders
        #[arg(long)]
        named_volumes: bool,
    },

    /// Back up a live server, restore it and check the restored data
    BackupRestore {
        /// Run server and agents as the invoking user
        #[arg(long)]
        non_root: bool,

        /// Server password (default: authentication disabled)
        #[arg(long)]
        password: Option<String>,
    },

    /// Check that the server refuses a data folder it cannot write
    UnwritableMount,

    /// Compare two versions
    Compare {
        /// First version
        a: Version,

        /// Second version
        b: Version,
    },
}

impl Cli {
    /// Execute the CLI command.
    pub async fn execute(self) -> Result<()> {
        if let Commands::Compare { a, b } = &self.command {
            print!("{}", compare(a, b));
            return Ok(());
        }

        let mut settings = HarnessSettings::load(self.config.as_deref())?;
        if let Some(root) = self.output_root {
            settings = settings.with_output_root(root);
        }
        tracing::info!(image = %settings.image, version = %settings.version, "Testing image");

        let runtime: Arc<dyn ContainerRuntime> = Arc::new(DockerRuntime::connect()?);
        let helper = ContainerOwnershipHelper::new(Arc::clone(&runtime)).with_image(&settings.helper_image);
        let resources = ResourceManager::new(&settings.output_root, Arc::new(helper))?;
        let connector = HttpGraphConnector::new(settings.version.clone());
        let ctx = ScenarioContext {
            runtime: runtime.as_ref(),
            connector: &connector,
            resources: &resources,
            settings: &settings,
        };

        let outcome = resources.scoped(run_command(ctx, self.command)).await;
        outcome.map_err(|e| eyre!("Scenario failed: {}", describe(&e)))
    }
}

async fn run_command(ctx: ScenarioContext<'_>, command: Commands) -> Result<(), HarnessError> {
    match command {
        Commands::Upgrade {
            from,
            named_volumes,
        } => {
            let storage = if named_volumes {
                StorageKind::NamedVolumes
            } else {
                StorageKind::FileMounts
            };
            let target = &ctx.settings.version;
            let sources = match from {
                Some(from) => vec![from],
                None => scenario::upgradable_versions(target)
                    .iter()
                    .filter(|from| {
                        scenario::check_upgrade_supported(from, target, std::env::consts::ARCH).is_ok()
                    })
                    .cloned()
                    .collect(),
            };
            for from in &sources {
                let report = scenario::run_upgrade(ctx, from, storage).await?;
                print!("{report}");
                print_teardown(&ctx.resources.teardown().await);
            }
            Ok(())
        }

        Commands::BackupRestore {
            non_root,
            password,
        } => {
            let options = BackupOptions {
                as_current_user: non_root,
                password,
            };
            let report = scenario::run_backup_restore(ctx, &options).await?;
            print!("{report}");
            Ok(())
        }

        Commands::UnwritableMount => {
            let outcome = scenario::probe_unwritable_mount(ctx).await?;
            print!("{}", outcome.report);
            if let Some(line) = outcome.error_output.lines().last() {
                println!("server refused the mount: {line}");
            }
            Ok(())
        }

        Commands::Compare { a, b } => {
            print!("{}", compare(&a, &b));
            Ok(())
        }
    }
}

fn compare(a: &Version, b: &Version) -> String {
    let relation = if a.is_newer_than(b) {
        "is newer than"
    } else if a.is_older_than(b) {
        "is older than"
    } else {
        "is equal to"
    };
    format!(
        "{a} {relation} {b}\n{a} is on branch {}\n{b} is on branch {}\n",
        a.branch(),
        b.branch()
    )
}

fn print_teardown(report: &TeardownReport) {
    for archive in &report.archives {
        println!("archived {}", archive.display());
    }
    for failure in &report.failures {
        println!("teardown {} failed for {}: {}", failure.stage, failure.path.display(), failure.reason);
    }
}

// Launch failures carry container output; append its tail so it reaches the terminal.
fn describe(err: &HarnessError) -> String {
    match err.container_logs() {
        Some(logs) if !logs.is_empty() => {
            let tail: Vec<&str> = logs.lines().rev().take(20).collect();
            let tail: Vec<&str> = tail.into_iter().rev().collect();
            format!("{err}\n--- container output ---\n{}", tail.join("\n"))
        }
        _ => err.to_string(),
    }
}
