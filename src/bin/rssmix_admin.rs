use anyhow::Result;
use clap::{Parser, Subcommand};
use serde_json::{json, to_string_pretty};
use std::path::PathBuf;

use rssmix::catalog::{self, Changeset, NewCompilation};
use rssmix::config;
use rssmix::context::AppContext;
use rssmix::db;

#[derive(Debug, Parser)]
#[command(author, version, about = "Manage compilations in the rssmix database")]
struct Args {
    /// Path to YAML config file
    #[arg(long, default_value = "config.yaml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Create a compilation from one or more feed URLs
    Create {
        #[arg(long)]
        name: String,
        /// Feed URL; repeat for several
        #[arg(long = "url")]
        urls: Vec<String>,
        #[arg(long)]
        password: Option<String>,
        /// Comma-separated title patterns to keep
        #[arg(long)]
        include: Option<String>,
        /// Comma-separated title patterns to drop
        #[arg(long)]
        exclude: Option<String>,
    },
    /// Print a compilation as JSON
    Show { id: String },
    /// Add or remove feeds, rename, change password or filters
    Update {
        id: String,
        /// Current password, if the compilation has one
        #[arg(long)]
        password: Option<String>,
        #[arg(long = "add")]
        add: Vec<String>,
        #[arg(long = "delete")]
        delete: Vec<String>,
        #[arg(long)]
        name: Option<String>,
        #[arg(long)]
        new_password: Option<String>,
        #[arg(long)]
        include: Option<String>,
        #[arg(long)]
        exclude: Option<String>,
    },
    /// Delete a compilation
    Delete {
        id: String,
        #[arg(long)]
        password: Option<String>,
    },
    /// Remove feeds no compilation references
    Cleanup,
    /// Print an example config file
    ExampleConfig,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_target(false)
        .compact()
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();
    if let Command::ExampleConfig = args.command {
        print!("{}", config::example());
        return Ok(());
    }

    let cfg = config::load(Some(&args.config))?;
    cfg.ensure_dirs()?;
    let pool = db::init_pool(&cfg.database_url()).await?;
    db::run_migrations(&pool).await?;
    let ctx = AppContext::new(pool, cfg);

    let output = match args.command {
        Command::Create {
            name,
            urls,
            password,
            include,
            exclude,
        } => {
            let created = catalog::create_compilation(
                &ctx,
                &NewCompilation {
                    name,
                    urls,
                    password,
                    filter_include: include,
                    filter_exclude: exclude,
                },
            )
            .await?;
            serde_json::to_value(created)?
        }
        Command::Show { id } => {
            let view = catalog::get_compilation(&ctx.pool, &id).await?;
            serde_json::to_value(view)?
        }
        Command::Update {
            id,
            password,
            add,
            delete,
            name,
            new_password,
            include,
            exclude,
        } => {
            let changes = Changeset {
                add,
                delete,
                password: new_password,
                name,
                filter_include: include,
                filter_exclude: exclude,
            };
            catalog::update_compilation(&ctx, &id, password.as_deref(), &changes).await?;
            json!({ "id": id, "updated": true })
        }
        Command::Delete { id, password } => {
            catalog::delete_compilation(&ctx.pool, &id, password.as_deref()).await?;
            json!({ "id": id, "deleted": true })
        }
        Command::Cleanup => {
            let deleted = catalog::cleanup_orphan_sources(&ctx.pool).await?;
            json!({ "deletions": deleted })
        }
        Command::ExampleConfig => unreachable!("handled before opening the database"),
    };

    println!("{}", to_string_pretty(&output)?);
    Ok(())
}
