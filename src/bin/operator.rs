//! Schema Operator CLI
//!
//! Runs the Schema and SchemaVersion control loops against a schema registry.
//! Objects live in a local state file so one-shot commands can apply,
//! delete and inspect them between runs.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Context;
use clap::{Parser, Subcommand, ValueEnum};
use schema_registry_operator::manifest::{self, ApplyOutcome};
use schema_registry_operator::resource::LabelSelector;
use schema_registry_operator::store::StoreSnapshot;
use schema_registry_operator::{
    HttpRegistryClient, InMemoryStore, Manager, ObjectKey, OperatorConfig, ResourceStore, Schema,
    SchemaRegistry, SchemaVersion,
};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

const SETTLE_POLL: Duration = Duration::from_millis(200);
const SETTLE_QUIET_POLLS: u32 = 3;

#[derive(Parser)]
#[command(name = "schema-operator")]
#[command(about = "Reconcile Schema resources against a schema registry")]
struct Cli {
    /// Configuration file layered over the default locations
    #[arg(short, long, global = true)]
    config: Option<String>,

    /// Object state file
    #[arg(short, long, global = true, default_value = ".schema-operator/state.json")]
    state: PathBuf,

    /// Seconds to wait for one-shot commands to settle
    #[arg(long, global = true, default_value_t = 30)]
    settle_timeout: u64,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Load manifests and reconcile until interrupted
    Run {
        /// Manifest files or directories
        paths: Vec<PathBuf>,
    },

    /// Apply manifests and reconcile until the store settles
    Apply {
        /// Manifest files or directories
        #[arg(required = true)]
        paths: Vec<PathBuf>,
    },

    /// Delete an object and reconcile until the store settles
    Delete {
        name: String,

        #[arg(short, long, value_enum, default_value_t = ObjectKind::Schema)]
        kind: ObjectKind,

        #[arg(short, long, default_value = "default")]
        namespace: String,
    },

    /// Show Schemas and their versions
    Get {
        #[arg(short, long, default_value = "default")]
        namespace: String,
    },

    /// Write the effective configuration to a file
    InitConfig {
        #[arg(default_value = "operator.toml")]
        output: String,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum ObjectKind {
    Schema,
    Registry,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let config = match OperatorConfig::load_from(cli.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Error: {}", e);
            std::process::exit(1);
        }
    };

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.logging.filter));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    if let Err(e) = run(cli, config).await {
        eprintln!("Error: {:#}", e);
        std::process::exit(1);
    }
}

async fn run(cli: Cli, config: OperatorConfig) -> anyhow::Result<()> {
    let store = Arc::new(load_state(&cli.state)?);

    match cli.command {
        Commands::Run { paths } => {
            apply_paths(store.as_ref(), &paths).await?;
            let manager = Arc::new(operator(&store, &config)?);
            let token = CancellationToken::new();

            let runner = {
                let manager = Arc::clone(&manager);
                let token = token.clone();
                tokio::spawn(async move { manager.run(token).await })
            };

            println!("🚀 Reconciling, press Ctrl-C to stop");
            tokio::signal::ctrl_c().await.context("waiting for Ctrl-C")?;
            info!("shutdown requested");
            token.cancel();
            runner.await.context("controller task failed")?;
            save_state(&cli.state, &store)?;
        }

        Commands::Apply { paths } => {
            let namespaces = apply_paths(store.as_ref(), &paths).await?;
            settle(&store, &config, Duration::from_secs(cli.settle_timeout)).await?;
            save_state(&cli.state, &store)?;
            for namespace in &namespaces {
                print_schemas(store.as_ref(), namespace).await?;
            }
        }

        Commands::Delete { name, kind, namespace } => {
            let key = ObjectKey::new(&namespace, &name);
            match kind {
                ObjectKind::Schema => store.delete::<Schema>(&key).await?,
                ObjectKind::Registry => store.delete::<SchemaRegistry>(&key).await?,
            }
            println!("🗑️  Deletion requested for {}", key);
            settle(&store, &config, Duration::from_secs(cli.settle_timeout)).await?;
            save_state(&cli.state, &store)?;
            print_schemas(store.as_ref(), &namespace).await?;
        }

        Commands::Get { namespace } => {
            print_schemas(store.as_ref(), &namespace).await?;
        }

        Commands::InitConfig { output } => {
            config.save(&output).with_context(|| format!("writing {}", output))?;
            println!("✅ Configuration written to {}", output);
        }
    }

    Ok(())
}

fn operator(store: &Arc<InMemoryStore>, config: &OperatorConfig) -> anyhow::Result<Manager<InMemoryStore>> {
    let registry = HttpRegistryClient::new(config.registry.request_timeout()).context("creating registry client")?;
    Ok(Manager::new(Arc::clone(store), Arc::new(registry), config.clone()))
}

/// Returns the namespaces the manifests touched
async fn apply_paths(store: &InMemoryStore, paths: &[PathBuf]) -> anyhow::Result<BTreeSet<String>> {
    let mut namespaces = BTreeSet::new();
    for manifest in manifest::load_paths(paths)? {
        let outcome = manifest::apply_manifest(store, &manifest).await?;
        let verb = match outcome {
            ApplyOutcome::Created => "created",
            ApplyOutcome::Configured => "configured",
            ApplyOutcome::Unchanged => "unchanged",
        };
        println!("📄 {} {} {}", manifest.kind(), manifest.key(), verb);
        namespaces.insert(manifest.key().namespace);
    }
    Ok(namespaces)
}

/// Run the controllers until nothing is queued and the store stops changing
async fn settle(store: &Arc<InMemoryStore>, config: &OperatorConfig, timeout: Duration) -> anyhow::Result<()> {
    let manager = Arc::new(operator(store, config)?);
    let token = CancellationToken::new();
    let runner = {
        let manager = Arc::clone(&manager);
        let token = token.clone();
        tokio::spawn(async move { manager.run(token).await })
    };

    let started = Instant::now();
    let mut revision = store.revision();
    let mut quiet = 0;
    while quiet < SETTLE_QUIET_POLLS {
        if started.elapsed() > timeout {
            warn!(?timeout, "store did not settle, saving current state");
            break;
        }
        tokio::time::sleep(SETTLE_POLL).await;

        let current = store.revision();
        if current == revision && manager.is_idle() {
            quiet += 1;
        } else {
            quiet = 0;
            revision = current;
        }
    }

    token.cancel();
    runner.await.context("controller task failed")?;
    Ok(())
}

fn load_state(path: &Path) -> anyhow::Result<InMemoryStore> {
    if !path.exists() {
        return Ok(InMemoryStore::new());
    }
    let content = std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    let snapshot: StoreSnapshot =
        serde_json::from_str(&content).with_context(|| format!("parsing {}", path.display()))?;
    Ok(InMemoryStore::from_snapshot(snapshot)?)
}

fn save_state(path: &Path, store: &InMemoryStore) -> anyhow::Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    let content = serde_json::to_string_pretty(&store.snapshot())?;
    std::fs::write(path, content).with_context(|| format!("writing {}", path.display()))?;
    Ok(())
}

async fn print_schemas(store: &InMemoryStore, namespace: &str) -> anyhow::Result<()> {
    let everything = LabelSelector::everything();
    let schemas = store.list::<Schema>(namespace, &everything).await?;
    let mut versions = store.list::<SchemaVersion>(namespace, &everything).await?;
    versions.sort_by(|a, b| (&a.spec.subject, a.spec.version).cmp(&(&b.spec.subject, b.spec.version)));

    if schemas.is_empty() {
        println!("No Schemas in namespace {}", namespace);
        return Ok(());
    }

    for schema in &schemas {
        let icon = if schema.status.ready { "✅" } else { "❌" };
        let subject = schema.effective_subject();
        println!(
            "{} {} ({}) latest v{}: {}",
            icon, schema.metadata.name, subject, schema.status.latest_version, schema.status.message
        );
        if !schema.status.registry_error.is_empty() {
            println!("   registry: {}", schema.status.registry_error);
        }
        if schema.metadata.is_deleting() {
            println!("   ⏳ deletion pending");
        }
        for version in versions.iter().filter(|v| v.spec.subject == subject) {
            let marker = if version.status.active { "●" } else { "○" };
            println!("   {} {} (id {})", marker, version.metadata.name, version.spec.registry_schema_id);
        }
    }
    Ok(())
}
