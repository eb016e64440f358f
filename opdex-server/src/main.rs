use clap::{Parser, Subcommand};
use opdex::{CollectionService, OpdexError, RecordMutation, ServiceConfig};
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

#[derive(Parser)]
#[command(name = "opdex", about = "Operation log and indexing status for vector collections")]
struct Cli {
    #[command(subcommand)]
    command: Command,

    #[arg(long, global = true, env = "OPDEX_DATA_DIR", default_value = "./data")]
    data_dir: String,
}

#[derive(Subcommand)]
enum Command {
    /// Create an empty collection and print it
    Create { name: String },
    /// Soft delete a collection and remove its data
    Delete { name: String },
    /// List active collections
    List,
    /// Append add operations, one per record
    Add {
        collection: String,
        #[command(flatten)]
        records: RecordArgs,
    },
    /// Append upsert operations, one per record
    Upsert {
        collection: String,
        #[command(flatten)]
        records: RecordArgs,
    },
    /// Append delete operations for the given record ids
    Remove {
        collection: String,
        #[arg(required = true)]
        ids: Vec<String>,
    },
    /// Print the indexing status of a collection
    Status { collection: String },
    /// Print the collection version
    Version { collection: String },
    /// Print indexer health, including skipped entries
    Health { collection: String },
    /// Wait until every logged op is indexed, then print the status
    Drain {
        collection: String,
        #[arg(long, default_value_t = 30)]
        timeout_secs: u64,
    },
}

#[derive(clap::Args)]
struct RecordArgs {
    /// Comma-separated ids of records without a payload
    #[arg(long, value_delimiter = ',', conflicts_with = "records")]
    ids: Vec<String>,
    /// JSON array of objects, each with a string "id"; other fields form the payload
    #[arg(long)]
    records: Option<String>,
}

impl RecordArgs {
    fn into_mutations(self) -> Result<Vec<RecordMutation>, OpdexError> {
        match self.records {
            Some(raw) => parse_records(&raw),
            None => Ok(self.ids.into_iter().map(RecordMutation::id_only).collect()),
        }
    }
}

fn parse_records(raw: &str) -> Result<Vec<RecordMutation>, OpdexError> {
    let value: serde_json::Value = serde_json::from_str(raw)?;
    let items = value
        .as_array()
        .ok_or_else(|| OpdexError::InvalidMutation("--records must be a JSON array".to_string()))?;
    items
        .iter()
        .map(|item| {
            let mut fields = item.as_object().cloned().ok_or_else(|| {
                OpdexError::InvalidMutation("each record must be a JSON object".to_string())
            })?;
            let id = match fields.remove("id") {
                Some(serde_json::Value::String(id)) => id,
                _ => {
                    return Err(OpdexError::InvalidMutation(
                        "each record needs a string \"id\"".to_string(),
                    ))
                }
            };
            let payload = if fields.is_empty() {
                serde_json::Value::Null
            } else {
                serde_json::Value::Object(fields)
            };
            Ok(RecordMutation { id, payload })
        })
        .collect()
}

fn print_json<T: serde::Serialize>(value: &T) -> Result<(), OpdexError> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

async fn run(service: &Arc<CollectionService>, command: Command) -> Result<(), OpdexError> {
    match command {
        Command::Create { name } => print_json(&service.create_collection(&name)?),
        Command::Delete { name } => {
            service.delete_collection(&name)?;
            println!("deleted {}", name);
            Ok(())
        }
        Command::List => print_json(&service.list_collections()),
        Command::Add {
            collection,
            records,
        } => {
            let id = service.get_collection(&collection)?.id;
            let seq = service.add_records(&id, records.into_mutations()?)?;
            print_json(&serde_json::json!({ "last_seq": seq }))
        }
        Command::Upsert {
            collection,
            records,
        } => {
            let id = service.get_collection(&collection)?.id;
            let seq = service.upsert_records(&id, records.into_mutations()?)?;
            print_json(&serde_json::json!({ "last_seq": seq }))
        }
        Command::Remove { collection, ids } => {
            let id = service.get_collection(&collection)?.id;
            let seq = service.delete_records(&id, ids)?;
            print_json(&serde_json::json!({ "last_seq": seq }))
        }
        Command::Status { collection } => {
            let id = service.get_collection(&collection)?.id;
            print_json(&service.get_indexing_status(&id)?)
        }
        Command::Version { collection } => {
            let id = service.get_collection(&collection)?.id;
            println!("{}", service.get_version(&id)?);
            Ok(())
        }
        Command::Health { collection } => {
            let id = service.get_collection(&collection)?.id;
            print_json(&service.get_collection_health(&id)?)
        }
        Command::Drain {
            collection,
            timeout_secs,
        } => {
            let id = service.get_collection(&collection)?.id;
            let status = service
                .wait_for_indexing(&id, Duration::from_secs(timeout_secs))
                .await?;
            print_json(&status)
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
        ))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let service = CollectionService::open(ServiceConfig::load(&cli.data_dir))?;
    let outcome = run(&service, cli.command).await;
    // Pending ops are indexed and deletes finish before the process exits.
    service.graceful_shutdown().await;

    if let Err(e) = outcome {
        eprintln!("ERROR: {}", e);
        std::process::exit(1);
    }
    Ok(())
}
