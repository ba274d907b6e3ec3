use anyhow::Result;
use benchpilot::config::Config;
use benchpilot::model::now_millis;
use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(
    name = "benchpilot",
    about = "Benchmark orchestration engine for event-driven test runs",
    version,
    long_about = None
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the daemon (API server + run lifecycle monitor)
    Serve {
        /// Bind address
        #[arg(long, default_value = "0.0.0.0:8080")]
        bind: String,

        /// Path to the SQLite record store
        #[arg(long, default_value = "data/benchpilot.db")]
        db: String,

        /// Optional TOML config file; flags override it
        #[arg(long)]
        config: Option<PathBuf>,
    },

    /// Manage test definitions
    Test {
        #[command(subcommand)]
        action: TestAction,
    },

    /// Manage test runs
    Run {
        #[command(subcommand)]
        action: RunAction,
    },
}

#[derive(Subcommand)]
enum TestAction {
    /// List all tests
    List {
        #[arg(long, default_value = "data/benchpilot.db")]
        db: String,
    },

    /// Create a new test
    Create {
        /// Test name
        #[arg(long)]
        name: String,

        /// Description
        #[arg(long)]
        description: Option<String>,

        #[arg(long, default_value = "data/benchpilot.db")]
        db: String,
    },

    /// Delete a test and all of its runs
    Delete {
        /// Test name
        #[arg(long)]
        name: String,

        #[arg(long, default_value = "data/benchpilot.db")]
        db: String,
    },
}

#[derive(Subcommand)]
enum RunAction {
    /// List runs of a test
    List {
        /// Test name
        #[arg(long)]
        test: String,

        #[arg(long, default_value = "data/benchpilot.db")]
        db: String,
    },

    /// Create a run under a test
    Create {
        #[arg(long)]
        test: String,

        /// Run name
        #[arg(long)]
        name: String,

        #[arg(long)]
        description: Option<String>,

        #[arg(long, default_value = "data/benchpilot.db")]
        db: String,
    },

    /// Schedule a run ("now" or epoch milliseconds)
    Schedule {
        #[arg(long)]
        test: String,

        #[arg(long)]
        run: String,

        /// Scheduled time: "now" or epoch millis
        #[arg(long, default_value = "now")]
        at: String,

        /// Expected run version (optimistic lock)
        #[arg(long, default_value = "0")]
        version: i64,

        #[arg(long, default_value = "data/benchpilot.db")]
        db: String,
    },

    /// Stop a started run
    Terminate {
        #[arg(long)]
        test: String,

        #[arg(long)]
        run: String,

        #[arg(long, default_value = "data/benchpilot.db")]
        db: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Serve { bind, db, config } => {
            let mut cfg = Config::load(config.as_deref())?;
            cfg.bind = bind;
            cfg.db_path = db;
            tracing::info!(bind = %cfg.bind, "Starting benchpilot daemon");
            benchpilot::serve(cfg).await?;
        }
        Commands::Test { action } => match action {
            TestAction::List { db } => {
                let dao = open_dao(&db)?;
                let tests = dao.list_tests(0, i64::MAX)?;
                if tests.is_empty() {
                    println!("No tests found.");
                } else {
                    println!("{:<20} | {:<8} | Description", "Name", "Version");
                    println!("{:-<20}-|-{:-<8}-|-{:-<40}", "", "", "");
                    for t in tests {
                        println!(
                            "{:<20} | {:<8} | {}",
                            t.name,
                            t.version,
                            t.description.unwrap_or_default()
                        );
                    }
                }
            }
            TestAction::Create { name, description, db } => {
                let dao = open_dao(&db)?;
                dao.create_test(&name, description.as_deref(), None, None)?;
                println!("Test '{}' created.", name);
            }
            TestAction::Delete { name, db } => {
                let dao = open_dao(&db)?;
                dao.delete_test(&name)?;
                println!("Test '{}' deleted.", name);
            }
        },
        Commands::Run { action } => match action {
            RunAction::List { test, db } => {
                let dao = open_dao(&db)?;
                let runs = dao.list_runs(&test, 0, i64::MAX, None)?;
                if runs.is_empty() {
                    println!("No runs found for test '{}'.", test);
                } else {
                    println!(
                        "{:<12} | {:<14} | {:<9} | Success / Total",
                        "Name", "State", "Progress"
                    );
                    println!("{:-<12}-|-{:-<14}-|-{:-<9}-|-{:-<16}", "", "", "", "");
                    for r in runs {
                        println!(
                            "{:<12} | {:<14} | {:<9.2} | {} / {}",
                            r.name,
                            r.state().to_string(),
                            r.progress,
                            r.results_success,
                            r.results_total
                        );
                    }
                }
            }
            RunAction::Create { test, name, description, db } => {
                let dao = open_dao(&db)?;
                dao.create_run(&test, &name, description.as_deref(), None, None)?;
                println!("Run '{}.{}' created.", test, name);
            }
            RunAction::Schedule { test, run, at, version, db } => {
                let dao = open_dao(&db)?;
                let scheduled = if at == "now" {
                    now_millis()
                } else {
                    at.parse::<i64>()
                        .map_err(|_| anyhow::anyhow!("--at must be 'now' or epoch millis"))?
                };
                let rec = dao.schedule_run(&test, &run, scheduled, version)?;
                println!(
                    "Run '{}.{}' scheduled for {} (version {}).",
                    test, run, scheduled, rec.version
                );
            }
            RunAction::Terminate { test, run, db } => {
                let dao = open_dao(&db)?;
                let rec = dao.get_run(&test, &run)?;
                if !dao.mark_stopped(rec.id, now_millis())? {
                    anyhow::bail!(
                        "run '{}.{}' is {} and cannot be terminated",
                        test,
                        run,
                        rec.state()
                    );
                }
                println!("Run '{}.{}' terminated.", test, run);
            }
        },
    }

    Ok(())
}

fn open_dao(db: &str) -> Result<benchpilot::storage::Dao> {
    let pool = benchpilot::storage::open_pool(db)?;
    Ok(benchpilot::storage::Dao::new(pool))
}
