//! nimbus: command-line access to a Parse-compatible backend.
//!
//! Subcommands:
//! - `find` / `count` / `dump`: query a class
//! - `get` / `save` / `delete`: single records
//! - `run`: call a cloud function
//! - `push`: send a push notification
//! - `track`: record an analytics event
//! - `config`: print the remote config

use std::collections::BTreeMap;

use clap::{Args, Parser, Subcommand};
use miette::{IntoDiagnostic, Result};
use nimbus_client::{
    Client, ClientConfig, EachOptions, PushData, Query, Record, RequestOptions,
};
use serde_json::Value;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "nimbus")]
#[command(about = "Command-line client for Parse-compatible backends", long_about = None)]
struct Cli {
    #[command(flatten)]
    connection: Connection,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Args)]
struct Connection {
    /// Application id
    #[arg(long, env = "NIMBUS_APP_ID")]
    app_id: String,

    /// Client (JavaScript) key
    #[arg(long, env = "NIMBUS_CLIENT_KEY")]
    client_key: Option<String>,

    /// Master key, required for --master and push
    #[arg(long, env = "NIMBUS_MASTER_KEY", hide_env_values = true)]
    master_key: Option<String>,

    /// Server URL
    #[arg(long, env = "NIMBUS_SERVER_URL", default_value = nimbus_client::DEFAULT_SERVER_URL)]
    server_url: String,

    /// Request timeout in seconds
    #[arg(long)]
    timeout: Option<u64>,

    /// Send the master key with every request
    #[arg(long)]
    master: bool,

    /// Session token to act as
    #[arg(long, env = "NIMBUS_SESSION_TOKEN", hide_env_values = true)]
    session_token: Option<String>,
}

/// Constraints shared by the query subcommands.
#[derive(Args)]
struct Filter {
    /// Field equals value (key=value, value parsed as JSON when possible)
    #[arg(long = "eq", value_parser = parse_pair)]
    equal: Vec<(String, Value)>,

    /// Field does not equal value
    #[arg(long = "ne", value_parser = parse_pair)]
    not_equal: Vec<(String, Value)>,

    /// Field greater than value
    #[arg(long = "gt", value_parser = parse_pair)]
    greater: Vec<(String, Value)>,

    /// Field less than value
    #[arg(long = "lt", value_parser = parse_pair)]
    less: Vec<(String, Value)>,

    /// Field exists
    #[arg(long)]
    exists: Vec<String>,

    /// String field starts with prefix (key=prefix)
    #[arg(long = "prefix", value_parser = parse_text_pair)]
    starts_with: Vec<(String, String)>,
}

#[derive(Subcommand)]
enum Commands {
    /// Print records matching a query
    Find {
        class: String,

        #[command(flatten)]
        filter: Filter,

        /// Sort ascending by field; prefix with '-' for descending
        #[arg(long, allow_hyphen_values = true)]
        order: Vec<String>,

        #[arg(long)]
        limit: Option<usize>,

        #[arg(long)]
        skip: Option<usize>,

        /// Only return these fields
        #[arg(long)]
        keys: Vec<String>,

        /// Inline pointer fields
        #[arg(long)]
        include: Vec<String>,
    },

    /// Count records matching a query
    Count {
        class: String,

        #[command(flatten)]
        filter: Filter,
    },

    /// Stream every matching record as one JSON line each
    Dump {
        class: String,

        #[command(flatten)]
        filter: Filter,

        /// Records per request (server default when unset)
        #[arg(long)]
        batch_size: Option<usize>,
    },

    /// Print one record
    Get { class: String, id: String },

    /// Create or update a record
    Save {
        class: String,

        /// Update this record instead of creating one
        #[arg(long)]
        id: Option<String>,

        /// Field to set (key=value)
        #[arg(long = "set", value_parser = parse_pair, required = true)]
        fields: Vec<(String, Value)>,
    },

    /// Delete a record
    Delete { class: String, id: String },

    /// Call a cloud function
    Run {
        name: String,

        /// JSON parameters
        #[arg(long, default_value = "{}")]
        params: String,
    },

    /// Send a push notification
    Push {
        message: String,

        /// Target channel (repeatable)
        #[arg(long = "channel")]
        channels: Vec<String>,
    },

    /// Record an analytics event
    Track {
        name: String,

        /// Dimension (key=value)
        #[arg(long = "dim", value_parser = parse_text_pair)]
        dimensions: Vec<(String, String)>,
    },

    /// Print the remote config
    Config,
}

/// Parse `key=value`, reading the value as JSON and falling back to a string.
fn parse_pair(s: &str) -> Result<(String, Value), String> {
    let (key, raw) = parse_text_pair(s)?;
    let value = serde_json::from_str(&raw).unwrap_or(Value::String(raw));
    Ok((key, value))
}

fn parse_text_pair(s: &str) -> Result<(String, String), String> {
    match s.split_once('=') {
        Some((key, value)) if !key.is_empty() => Ok((key.to_string(), value.to_string())),
        _ => Err(format!("expected key=value, got '{}'", s)),
    }
}

fn build_query(class: &str, filter: Filter) -> Query {
    let mut query = Query::new(class);
    for (key, value) in filter.equal {
        query.equal_to(&key, value);
    }
    for (key, value) in filter.not_equal {
        query.not_equal_to(&key, value);
    }
    for (key, value) in filter.greater {
        query.greater_than(&key, value);
    }
    for (key, value) in filter.less {
        query.less_than(&key, value);
    }
    for key in filter.exists {
        query.exists(&key);
    }
    for (key, prefix) in filter.starts_with {
        query.starts_with(&key, &prefix);
    }
    query
}

fn print_json(value: &Value) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value).into_diagnostic()?);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "nimbus=info".to_string()),
        ))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();
    let connection = cli.connection;

    let mut builder = ClientConfig::builder(connection.app_id).server_url(connection.server_url);
    if let Some(key) = connection.client_key {
        builder = builder.client_key(key);
    }
    if let Some(key) = connection.master_key {
        builder = builder.master_key(key);
    }
    if let Some(secs) = connection.timeout {
        builder = builder.timeout(std::time::Duration::from_secs(secs));
    }
    let client = Client::new(builder.build()).map_err(|e| miette::miette!("{}", e))?;

    let options = RequestOptions {
        use_master_key: connection.master,
        session_token: connection.session_token,
        ..RequestOptions::default()
    };

    run(cli.command, &client, options)
        .await
        .map_err(|e| miette::miette!("[{}] {}", e.code(), e.message()))
}

async fn run(
    command: Commands,
    client: &Client,
    options: RequestOptions,
) -> std::result::Result<(), CliError> {
    match command {
        Commands::Find {
            class,
            filter,
            order,
            limit,
            skip,
            keys,
            include,
        } => {
            let mut query = build_query(&class, filter);
            for key in &order {
                match key.strip_prefix('-') {
                    Some(field) => query.descending(field),
                    None => query.ascending(key),
                };
            }
            if let Some(limit) = limit {
                query.limit(limit);
            }
            if let Some(skip) = skip {
                query.skip(skip);
            }
            if !keys.is_empty() {
                query.select(keys);
            }
            for key in &include {
                query.include(key);
            }

            let records = query.find(client, options).await?;
            let json: Vec<Value> = records.iter().map(Record::to_json).collect();
            print_json(&Value::Array(json))?;
        }

        Commands::Count { class, filter } => {
            let count = build_query(&class, filter).count(client, options).await?;
            println!("{}", count);
        }

        Commands::Dump {
            class,
            filter,
            batch_size,
        } => {
            let each = EachOptions {
                batch_size,
                request: options,
            };
            build_query(&class, filter)
                .each(client, each, |record| println!("{}", record.to_json()))
                .await?;
        }

        Commands::Get { class, id } => {
            let record = Query::new(class.as_str()).get(&id, client, options).await?;
            print_json(&record.to_json())?;
        }

        Commands::Save { class, id, fields } => {
            let mut record = match id {
                Some(id) => Record::with_id(class.as_str(), id),
                None => Record::new(class.as_str()),
            };
            for (key, value) in fields {
                record.set(key, value);
            }
            let saved = client.save(record, options).await?;
            info!(class = %class, id = ?saved.id(), "saved");
            print_json(&saved.to_json())?;
        }

        Commands::Delete { class, id } => {
            client
                .destroy(Record::with_id(class.as_str(), id.as_str()), options)
                .await?;
            info!(class = %class, id = %id, "deleted");
        }

        Commands::Run { name, params } => {
            let params: Value = serde_json::from_str(&params)?;
            let result = client.run(&name, params, options).await?;
            print_json(&result)?;
        }

        Commands::Push { message, channels } => {
            client
                .send_push(PushData::alert(&message).to_channels(channels), options)
                .await?;
            info!("push sent");
        }

        Commands::Track { name, dimensions } => {
            let dimensions: BTreeMap<String, String> = dimensions.into_iter().collect();
            client.track(&name, dimensions, options).await?;
        }

        Commands::Config => {
            let config = client.fetch_config(options).await?;
            print_json(&Value::Object(config.params().clone()))?;
        }
    }
    Ok(())
}

/// Failure of a subcommand: either a client error or local output trouble.
#[derive(Debug)]
enum CliError {
    Client(nimbus_client::NimbusError),
    Output(miette::Report),
}

impl CliError {
    fn code(&self) -> i32 {
        match self {
            CliError::Client(e) => e.code().as_i32(),
            CliError::Output(_) => -1,
        }
    }

    fn message(&self) -> String {
        match self {
            CliError::Client(e) => e.message(),
            CliError::Output(report) => report.to_string(),
        }
    }
}

impl From<nimbus_client::NimbusError> for CliError {
    fn from(e: nimbus_client::NimbusError) -> Self {
        CliError::Client(e)
    }
}

impl From<serde_json::Error> for CliError {
    fn from(e: serde_json::Error) -> Self {
        CliError::Client(e.into())
    }
}

impl From<miette::Report> for CliError {
    fn from(report: miette::Report) -> Self {
        CliError::Output(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_pair() {
        assert_eq!(
            parse_pair("score=1000").unwrap(),
            ("score".to_string(), Value::from(1000))
        );
        assert_eq!(
            parse_pair("name=Sean Plott").unwrap(),
            ("name".to_string(), Value::from("Sean Plott"))
        );
        assert!(parse_pair("novalue").is_err());
        assert!(parse_pair("=x").is_err());
    }

    #[test]
    fn test_build_query() {
        let cli = Cli::parse_from([
            "nimbus",
            "--app-id",
            "app",
            "count",
            "GameScore",
            "--gt",
            "score=1000",
            "--eq",
            "cheat=false",
        ]);
        let Commands::Count { class, filter } = cli.command else {
            panic!("expected count");
        };
        let query = build_query(&class, filter);
        assert_eq!(
            query.where_clause(),
            serde_json::json!({"cheat": false, "score": {"$gt": 1000}})
        );
    }
}
