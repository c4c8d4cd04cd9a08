// Main entry point for the rhombus CLI
// Inspects session configs and schema documents, prints the DDL a keyspace
// needs, plans migrations, and runs index queries against a scratch cluster
// loaded from a JSON data file.

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use rhombus::query::generator;
use rhombus::{
    ConnectionManager, Criteria, KeyspaceDefinition, MemoryCluster, MigrationPlan, ResultTable,
    SessionConfig, SortOrder, Value,
};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::info;

/// Rhombus - schema-driven object mapping over a partitioned column store
#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Verbose logging (debug level)
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Log every statement the executor runs
    #[arg(short = 'c', long, global = true)]
    log_cql: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Validate a session config and print the effective settings
    CheckConfig {
        #[arg(long)]
        cassconfig: PathBuf,
    },
    /// Print the statements that create a keyspace and its tables
    Ddl { keyspace: PathBuf },
    /// Print what migrating from one definition to another would run
    MigratePlan {
        current: PathBuf,
        next: PathBuf,
        /// Skip non-additive differences instead of failing
        #[arg(long)]
        force: bool,
    },
    /// Load objects into a scratch cluster and list them through an index
    Query {
        #[arg(long)]
        cassconfig: PathBuf,
        keyspace: PathBuf,
        /// JSON object mapping type names to arrays of objects
        data: PathBuf,
        object_type: String,
        /// Index key as field=value, repeated for composite indexes
        #[arg(long = "key", required = true)]
        keys: Vec<String>,
        #[arg(long)]
        limit: Option<usize>,
        /// Oldest key first
        #[arg(long)]
        ascending: bool,
    },
}

fn main() -> Result<()> {
    let args = Args::parse();
    let level = if args.verbose {
        tracing::Level::DEBUG
    } else {
        tracing::Level::INFO
    };
    tracing_subscriber::fmt()
        .with_max_level(level)
        .with_writer(std::io::stderr)
        .init();

    match args.command {
        Command::CheckConfig { cassconfig } => check_config(&cassconfig, args.log_cql),
        Command::Ddl { keyspace } => print_ddl(&keyspace),
        Command::MigratePlan {
            current,
            next,
            force,
        } => migrate_plan(&current, &next, force),
        Command::Query {
            cassconfig,
            keyspace,
            data,
            object_type,
            keys,
            limit,
            ascending,
        } => {
            let mut config = load_config(&cassconfig)?;
            config.log_cql |= args.log_cql;
            let mut criteria = Criteria::new().ordering(if ascending {
                SortOrder::Asc
            } else {
                SortOrder::Desc
            });
            if let Some(limit) = limit {
                criteria = criteria.limit(limit);
            }
            run_query(config, &keyspace, &data, &object_type, &keys, criteria)
        }
    }
}

fn load_config(path: &Path) -> Result<SessionConfig> {
    SessionConfig::from_file(path).with_context(|| format!("loading {}", path.display()))
}

fn load_keyspace(path: &Path) -> Result<KeyspaceDefinition> {
    KeyspaceDefinition::from_file(path).with_context(|| format!("loading {}", path.display()))
}

fn check_config(path: &Path, log_cql: bool) -> Result<()> {
    let mut config = load_config(path)?;
    config.log_cql |= log_cql;
    println!("{}", serde_json::to_string_pretty(&config)?);
    println!("in-flight capacity: {}", config.in_flight_capacity());
    Ok(())
}

fn print_ddl(path: &Path) -> Result<()> {
    let keyspace = load_keyspace(path)?;
    println!("{};", generator::create_keyspace(&keyspace));
    for statement in generator::keyspace_tables(&keyspace) {
        println!("{statement};");
    }
    Ok(())
}

fn migrate_plan(current: &Path, next: &Path, force: bool) -> Result<()> {
    let plan = MigrationPlan::diff(&load_keyspace(current)?, &load_keyspace(next)?, force)?;
    if plan.is_empty() {
        println!("No changes");
    }
    for statement in plan.statements() {
        println!("{statement};");
    }
    for skipped in plan.ignored() {
        println!("-- ignored: {skipped}");
    }
    Ok(())
}

/// Objects per type from a `{"type": [{...}, ...]}` document
fn load_objects(
    keyspace: &KeyspaceDefinition,
    path: &Path,
) -> Result<BTreeMap<String, Vec<rhombus::Object>>> {
    let text =
        std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    let document: BTreeMap<String, Vec<serde_json::Map<String, serde_json::Value>>> =
        serde_json::from_str(&text)?;
    let mut objects = BTreeMap::new();
    for (object_type, items) in document {
        let def = keyspace.require(&object_type)?;
        let parsed = items
            .iter()
            .map(|item| def.object_from_json(item))
            .collect::<rhombus::Result<Vec<_>>>()?;
        objects.insert(object_type, parsed);
    }
    Ok(objects)
}

fn run_query(
    config: SessionConfig,
    keyspace_path: &Path,
    data: &Path,
    object_type: &str,
    keys: &[String],
    mut criteria: Criteria,
) -> Result<()> {
    let keyspace = load_keyspace(keyspace_path)?;
    let objects = load_objects(&keyspace, data)?;

    let def = keyspace.require(object_type)?;
    for pair in keys {
        let Some((name, text)) = pair.split_once('=') else {
            bail!("--key expects field=value, got `{pair}`");
        };
        let Some(field) = def.field(name) else {
            bail!("`{object_type}` has no field `{name}`");
        };
        let Some(value) = Value::parse(text, &field.data_type) else {
            bail!("`{text}` is not a {} value", field.data_type);
        };
        criteria = criteria.key(name, value);
    }

    let cluster = MemoryCluster::from_config(&config)?;
    let manager = ConnectionManager::new(config, Arc::new(cluster))?;
    let mapper = manager.build_keyspace(keyspace, false)?;
    for (name, batch) in &objects {
        for object in batch {
            mapper.insert(name, object)?;
        }
    }
    info!(types = objects.len(), "data loaded");

    let rows = mapper.list(object_type, &criteria)?;
    let rows = rows
        .into_iter()
        .map(|row| row.into_iter().filter(|(_, v)| !matches!(v, Value::Null)).collect())
        .collect();
    println!("{}", ResultTable::from_rows(rows).format());
    manager.teardown();
    Ok(())
}
