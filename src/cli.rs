//! The presentation-only CLI shell of spec §6. Command parsing, plain-text
//! rendering, and exit-code mapping live here; the Branch Orchestrator
//! (`orchestrator::Engine`) knows nothing about any of it, per spec §1.

use clap::{Parser, Subcommand};

use crate::config::Config;
use crate::container::docker::DockerContainerDriver;
use crate::error::{EngineError, Result};
use crate::model::{Branch, Project, Snapshot};
use crate::orchestrator::project::CreateProjectRequest;
use crate::orchestrator::{Engine, EngineConfig};
use crate::state::Store;

#[derive(Parser)]
#[command(name = "pgforge")]
#[command(about = "A control plane for copy-on-write PostgreSQL branches")]
#[command(version = "0.1.0")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Manage projects (primary databases)
    #[command(subcommand)]
    Project(ProjectCommands),
    /// Manage branches (copy-on-write clones of a project)
    #[command(subcommand)]
    Branch(BranchCommands),
    /// Manage snapshots (point-in-time references backing branches)
    #[command(subcommand)]
    Snapshot(SnapshotCommands),
    /// Show catalog initialization, pool health, and all projects/branches
    Status,
}

#[derive(Subcommand)]
pub enum ProjectCommands {
    /// Create a new project and its primary branch
    Create {
        name: String,
        /// Container image reference; mutually exclusive with --version
        #[arg(long)]
        image: Option<String>,
        /// Postgres version, resolved to "postgres:<version>-alpine"
        #[arg(long)]
        version: Option<String>,
        /// ZFS pool to use; required when zero or multiple pools are importable
        #[arg(long)]
        pool: Option<String>,
    },
    /// Show one project and its branches
    Get { name: String },
    /// List all projects
    List,
    /// Delete a project (only once every non-primary branch is gone)
    Delete { name: String },
}

#[derive(Subcommand)]
pub enum BranchCommands {
    /// Create a lightweight child branch from a snapshot of the parent
    Create {
        /// Parent branch, "<project>/<branch>"
        parent: String,
        /// Leaf name of the new branch
        leaf: String,
    },
    /// Show one branch
    Get {
        /// "<project>/<branch>"
        qualified: String,
    },
    /// List branches, optionally scoped to one project
    List {
        #[arg(long)]
        project: Option<String>,
    },
    /// Delete a branch and its clone dataset
    Delete {
        /// "<project>/<branch>"
        qualified: String,
    },
    /// Restore a branch to its origin snapshot, discarding all divergence
    Reset {
        /// "<project>/<branch>"
        qualified: String,
    },
}

#[derive(Subcommand)]
pub enum SnapshotCommands {
    /// Take a snapshot of a branch's current dataset contents
    Create {
        /// "<project>/<branch>"
        qualified: String,
        #[arg(long)]
        label: Option<String>,
    },
    /// Delete a snapshot (fails if a branch clone still depends on it)
    Delete { id: String },
}

/// Runs one command to completion and returns the process exit code of
/// spec §6 (0 success, 1 user error, 2 operational error).
pub async fn run(command: Commands) -> i32 {
    match dispatch(command).await {
        Ok(()) => 0,
        Err(err) => {
            eprintln!("Error: {err}");
            if let Some(suggestion) = suggestion_for(&err) {
                eprintln!("  {suggestion}");
            }
            err.exit_code()
        }
    }
}

async fn dispatch(command: Commands) -> Result<()> {
    let config = Config::load().map_err(EngineError::DriverError)?;
    let engine = build_engine(&config)?;

    match command {
        Commands::Project(cmd) => project_command(&engine, cmd).await,
        Commands::Branch(cmd) => branch_command(&engine, cmd).await,
        Commands::Snapshot(cmd) => snapshot_command(&engine, cmd).await,
        Commands::Status => status_command(&engine).await,
    }
}

fn build_engine(config: &Config) -> Result<Engine> {
    let store = Store::new(config.data_root())?;
    let containers = Box::new(DockerContainerDriver::connect()?);
    let engine_config = EngineConfig {
        default_image: config.default_image.clone(),
        port_range_start: config.port_range_start,
        pg_user: config.postgres_user.clone(),
        pg_password: config.postgres_password.clone(),
        pg_db: config.postgres_db.clone(),
        data_root: config.data_root(),
        pool: config.pool.clone(),
        dataset_base: config.zfs_dataset_base.clone(),
        ..EngineConfig::default()
    };
    Ok(Engine::new(store, containers, engine_config))
}

async fn project_command(engine: &Engine, cmd: ProjectCommands) -> Result<()> {
    match cmd {
        ProjectCommands::Create {
            name,
            image,
            version,
            pool,
        } => {
            let project = engine
                .project_create(CreateProjectRequest {
                    name,
                    image,
                    version,
                    pool,
                })
                .await?;
            print_project(&project);
        }
        ProjectCommands::Get { name } => {
            print_project(&engine.project_get(&name).await?);
        }
        ProjectCommands::List => {
            let projects = engine.project_list().await?;
            if projects.is_empty() {
                println!("no projects");
            }
            for project in &projects {
                print_project(project);
            }
        }
        ProjectCommands::Delete { name } => {
            engine.project_delete(&name).await?;
            println!("project '{name}' deleted");
        }
    }
    Ok(())
}

async fn branch_command(engine: &Engine, cmd: BranchCommands) -> Result<()> {
    match cmd {
        BranchCommands::Create { parent, leaf } => {
            let branch = engine.branch_create(&parent, &leaf).await?;
            print_branch(&branch);
        }
        BranchCommands::Get { qualified } => {
            print_branch(&engine.branch_get(&qualified).await?);
        }
        BranchCommands::List { project } => {
            let branches = engine.branch_list(project.as_deref()).await?;
            if branches.is_empty() {
                println!("no branches");
            }
            for branch in &branches {
                print_branch(branch);
            }
        }
        BranchCommands::Delete { qualified } => {
            engine.branch_delete(&qualified).await?;
            println!("branch '{qualified}' deleted");
        }
        BranchCommands::Reset { qualified } => {
            let branch = engine.branch_reset(&qualified).await?;
            println!("branch '{qualified}' reset to snapshot '{}'", branch.snapshot_name.as_deref().unwrap_or("?"));
            print_branch(&branch);
        }
    }
    Ok(())
}

async fn snapshot_command(engine: &Engine, cmd: SnapshotCommands) -> Result<()> {
    match cmd {
        SnapshotCommands::Create { qualified, label } => {
            let snapshot = engine.snapshot_create(&qualified, label.as_deref()).await?;
            print_snapshot(&snapshot);
        }
        SnapshotCommands::Delete { id } => {
            engine.snapshot_delete(&id).await?;
            println!("snapshot '{id}' deleted");
        }
    }
    Ok(())
}

async fn status_command(engine: &Engine) -> Result<()> {
    let report = engine.status().await?;
    if !report.initialized {
        println!("catalog: uninitialized (run 'pgforge project create' to get started)");
        return Ok(());
    }

    match &report.pool {
        Some(pool) => println!(
            "pool '{}': {} ({} used / {} total)",
            pool.name, pool.health, pool.allocated_bytes, pool.size_bytes
        ),
        None => println!("pool: unavailable"),
    }

    if report.projects.is_empty() {
        println!("no projects");
    }
    for project in &report.projects {
        print_project(project);
    }
    Ok(())
}

fn print_project(project: &Project) {
    println!("project '{}' ({})  image={}", project.name, project.id, project.image);
    for branch in &project.branches {
        print_branch(branch);
    }
}

fn print_branch(branch: &Branch) {
    let role = if branch.is_primary { "primary" } else { "child" };
    println!(
        "  branch '{}' [{role}] status={} port={} container={} dataset={} size={}B",
        branch.name,
        branch.status.as_str(),
        branch.port,
        branch.container_name,
        branch.zfs_dataset,
        branch.size_bytes
    );
}

fn print_snapshot(snapshot: &Snapshot) {
    println!(
        "snapshot '{}' ({}) of '{}'{}",
        snapshot.zfs_snapshot,
        snapshot.id,
        snapshot.branch_name,
        snapshot
            .label
            .as_deref()
            .map(|l| format!(" label={l}"))
            .unwrap_or_default()
    );
}

/// Kind-specific suggestions for the user (spec §7: "NotFound on a project
/// suggests `project list`"). The engine itself emits no user-facing
/// strings; this mapping is the CLI shell's job alone.
fn suggestion_for(err: &EngineError) -> Option<&'static str> {
    match err {
        EngineError::NotFound(_) => {
            Some("run 'pgforge project list' or 'pgforge branch list' to see what exists")
        }
        EngineError::AlreadyExists(_) => {
            Some("a previous attempt may have partially completed; check 'pgforge status'")
        }
        EngineError::StorageBusy(_) => {
            Some("delete the dependent branches or snapshots first")
        }
        _ => None,
    }
}
