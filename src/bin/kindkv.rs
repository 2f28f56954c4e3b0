//! kindkv Command-Line Tool
//!
//! Runs datastore operations against a snapshot file. The snapshot is
//! loaded on start and written back after every mutating command.

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tracing_subscriber::{fmt, EnvFilter};

use kindkv::codec::Direction;
use kindkv::store::MemoryStore;
use kindkv::{
    Config, Datastore, Entity, IndexDefinition, IndexProperty, Key, Operator, PathElement, PropertyValue,
    Query,
};

/// kindkv CLI
#[derive(Parser, Debug)]
#[command(name = "kindkv")]
#[command(about = "Datastore-style entities, indexes and queries over a snapshot file")]
#[command(version)]
struct Args {
    /// Snapshot file holding every table
    #[arg(short, long, default_value = "./kindkv.snapshot")]
    data: PathBuf,

    /// Application id
    #[arg(short, long, default_value = "demo")]
    app: String,

    /// Namespace inside the application
    #[arg(short, long, default_value = "")]
    namespace: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Write an entity; omit --id and --name to allocate an id
    Put {
        #[command(flatten)]
        key: KeyArgs,

        /// Property as name=value, repeatable
        #[arg(short, long = "prop")]
        props: Vec<String>,
    },

    /// Read an entity
    Get {
        #[command(flatten)]
        key: KeyArgs,
    },

    /// Delete an entity
    Delete {
        #[command(flatten)]
        key: KeyArgs,
    },

    /// Query a kind
    Query {
        kind: String,

        /// Filter such as age>=25, repeatable
        #[arg(short, long = "filter")]
        filters: Vec<String>,

        /// Sort property, prefix with - for descending, repeatable
        #[arg(short, long = "order", allow_hyphen_values = true)]
        orders: Vec<String>,

        #[arg(short, long)]
        limit: Option<usize>,

        #[arg(long)]
        keys_only: bool,
    },

    /// Reserve a block of ids
    Allocate {
        #[arg(long, conflicts_with = "max")]
        size: Option<u64>,

        #[arg(long)]
        max: Option<i64>,
    },

    /// Manage composite indexes
    Indexes {
        #[command(subcommand)]
        command: IndexCommands,
    },
}

#[derive(Subcommand, Debug)]
enum IndexCommands {
    /// List composite indexes
    List,

    /// Create an index and wait for it to build
    Create {
        kind: String,

        /// Index property, prefix with - for descending, repeatable
        #[arg(short, long = "prop", allow_hyphen_values = true)]
        props: Vec<String>,

        /// Index ancestor paths too
        #[arg(long)]
        ancestor: bool,
    },

    /// Delete an index and its rows
    Delete { id: u64 },
}

#[derive(clap::Args, Debug)]
struct KeyArgs {
    kind: String,

    #[arg(long, conflicts_with = "name")]
    id: Option<i64>,

    #[arg(long)]
    name: Option<String>,

    /// Ancestor element as Kind:id or Kind:name, outermost first, repeatable
    #[arg(long = "parent")]
    parents: Vec<String>,
}

fn main() {
    // Initialize tracing/logging
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn,kindkv=info"));

    fmt().with_env_filter(filter).with_target(true).init();

    let args = Args::parse();
    tracing::debug!("kindkv v{}", kindkv::VERSION);

    if let Err(e) = run(args) {
        eprintln!("error ({:?}): {}", e.code(), e.public_detail());
        std::process::exit(1);
    }
}

fn run(args: Args) -> kindkv::Result<()> {
    let Args {
        data,
        app,
        namespace,
        command,
    } = args;

    // Step 1: Load the snapshot
    let store = Arc::new(if data.exists() {
        MemoryStore::open(&data)?
    } else {
        MemoryStore::new()
    });
    let datastore = Datastore::recover(Config::default(), store.clone())?;

    // Step 2: Run the command
    let scope = (app.as_str(), namespace.as_str());
    let app = app.as_str();
    let mutated = match command {
        Commands::Put { key, props } => {
            let mut entity = Entity::new(build_key(scope, &key, true)?);
            for prop in &props {
                let (name, value) = prop.split_once('=').ok_or_else(|| bad(format!("expected name=value, got {}", prop)))?;
                entity.add(name, parse_value(value));
            }
            let keys = datastore.put(vec![entity], None)?;
            for key in keys {
                println!("{}", key);
            }
            true
        }
        Commands::Get { key } => {
            let key = build_key(scope, &key, false)?;
            match datastore.get(&[key], None)?.into_iter().flatten().next() {
                Some(entity) => print_entity(&entity),
                None => println!("(not found)"),
            }
            false
        }
        Commands::Delete { key } => {
            datastore.delete(&[build_key(scope, &key, false)?], None)?;
            true
        }
        Commands::Query {
            kind,
            filters,
            orders,
            limit,
            keys_only,
        } => {
            let mut query = Query::new(app, kind).namespace(scope.1);
            for filter in &filters {
                let (property, op, value) = parse_filter(filter)?;
                query = query.filter(property, op, value);
            }
            for order in &orders {
                let (property, direction) = parse_direction(order);
                query = query.order(property, direction);
            }
            if let Some(limit) = limit {
                query = query.limit(limit);
            }
            if keys_only {
                query = query.keys_only();
            }

            let result = datastore.run_query(&query)?;
            for entity in &result.entities {
                print_entity(entity);
            }
            println!(
                "-- {} result(s) via {:?}{}",
                result.entities.len(),
                result.strategy,
                if result.more_results { ", more available" } else { "" }
            );
            false
        }
        Commands::Allocate { size, max } => {
            let (start, end) = datastore.allocate_ids(app, size, max)?;
            println!("{}..={}", start, end);
            false
        }
        Commands::Indexes { command } => match command {
            IndexCommands::List => {
                for index in datastore.list_composite_indexes(app)? {
                    let properties: Vec<String> = index
                        .definition
                        .properties
                        .iter()
                        .map(|p| match p.direction {
                            Direction::Ascending => p.name.clone(),
                            Direction::Descending => format!("-{}", p.name),
                        })
                        .collect();
                    println!(
                        "{} {}({}){} {:?}",
                        index.id,
                        index.definition.kind,
                        properties.join(", "),
                        if index.definition.ancestor { " ancestor" } else { "" },
                        index.state
                    );
                }
                false
            }
            IndexCommands::Create { kind, props, ancestor } => {
                let properties = props
                    .iter()
                    .map(|p| match parse_direction(p) {
                        (name, Direction::Ascending) => IndexProperty::asc(name),
                        (name, Direction::Descending) => IndexProperty::desc(name),
                    })
                    .collect();
                let id = datastore.create_composite_index(app, IndexDefinition::new(kind, ancestor, properties))?;
                datastore.wait_for_index(app, id)?;
                println!("{}", id);
                true
            }
            IndexCommands::Delete { id } => {
                datastore.delete_composite_index(app, id)?;
                datastore.wait_for_index(app, id)?;
                true
            }
        },
    };

    // Step 3: Persist
    if mutated {
        store.save(&data)?;
    }
    Ok(())
}

// =============================================================================
// Helpers
// =============================================================================

fn bad(detail: String) -> kindkv::DatastoreError {
    kindkv::DatastoreError::BadRequest(detail)
}

fn build_key(scope: (&str, &str), key: &KeyArgs, allow_incomplete: bool) -> kindkv::Result<Key> {
    let mut path = Vec::with_capacity(key.parents.len() + 1);
    for parent in &key.parents {
        let (kind, id) = parent
            .split_once(':')
            .ok_or_else(|| bad(format!("expected Kind:id, got {}", parent)))?;
        path.push(match id.parse::<i64>() {
            Ok(id) => PathElement::with_id(kind, id),
            Err(_) => PathElement::with_name(kind, id),
        });
    }
    path.push(match (key.id, &key.name) {
        (Some(id), _) => PathElement::with_id(key.kind.as_str(), id),
        (None, Some(name)) => PathElement::with_name(key.kind.as_str(), name.as_str()),
        (None, None) if allow_incomplete => PathElement::incomplete(key.kind.as_str()),
        (None, None) => return Err(bad("an --id or --name is required".to_string())),
    });
    Ok(Key::new(scope.0, scope.1, path))
}

/// Integers, doubles, booleans and null; anything else is a string
fn parse_value(raw: &str) -> PropertyValue {
    if let Ok(value) = raw.parse::<i64>() {
        return PropertyValue::Integer(value);
    }
    if let Ok(value) = raw.parse::<f64>() {
        return PropertyValue::Double(value);
    }
    match raw {
        "true" => PropertyValue::Boolean(true),
        "false" => PropertyValue::Boolean(false),
        "null" => PropertyValue::Null,
        other => PropertyValue::String(other.to_string()),
    }
}

fn parse_filter(raw: &str) -> kindkv::Result<(String, Operator, PropertyValue)> {
    let position = raw
        .find(&['<', '>', '='][..])
        .ok_or_else(|| bad(format!("no operator in filter {}", raw)))?;
    let (property, rest) = raw.split_at(position);
    let (op, value) = if let Some(value) = rest.strip_prefix(">=") {
        (Operator::GreaterThanOrEqual, value)
    } else if let Some(value) = rest.strip_prefix("<=") {
        (Operator::LessThanOrEqual, value)
    } else if let Some(value) = rest.strip_prefix('>') {
        (Operator::GreaterThan, value)
    } else if let Some(value) = rest.strip_prefix('<') {
        (Operator::LessThan, value)
    } else {
        (Operator::Equal, rest.trim_start_matches('='))
    };
    Ok((property.trim().to_string(), op, parse_value(value.trim())))
}

fn parse_direction(raw: &str) -> (&str, Direction) {
    match raw.strip_prefix('-') {
        Some(name) => (name, Direction::Descending),
        None => (raw, Direction::Ascending),
    }
}

fn print_entity(entity: &Entity) {
    let properties: Vec<String> = entity
        .properties
        .iter()
        .map(|p| format!("{}={:?}", p.name, p.value))
        .collect();
    println!("{} {{{}}}", entity.key, properties.join(", "));
}
