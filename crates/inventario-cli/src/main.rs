use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use inventario_store::config::ENV_DB_PATH;
use inventario_store::{
    AppError, BackupTrigger, MigrationReport, MovementKind, NewMovement, StoreConfig, StoreError,
    StoreGateway, Value,
};
use serde_json::json;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, Parser)]
#[command(name = "inventario")]
#[command(about = "Inventario store CLI")]
struct Cli {
    /// Database file (defaults to the platform data directory)
    #[arg(long, env = ENV_DB_PATH)]
    db: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Create or upgrade the store and report the migration result
    Init,
    /// Schema objects, integrity and connection phase
    Status,
    /// Run a statement and print every row
    Query(StatementArgs),
    /// Run a write statement
    Exec(StatementArgs),
    /// Run a statement and print the first row (or null)
    GetOne(StatementArgs),
    /// Current stock and last unit cost of a product
    Stock { product_id: i64 },
    Inventory(InventoryArgs),
    /// Append a stock movement
    Movement(MovementArgs),
    /// Ledger rows of a product, newest first
    Movements {
        product_id: i64,
        #[arg(long, default_value_t = 50)]
        limit: usize,
    },
    Backup(BackupArgs),
    Restore(RestoreArgs),
    /// Backup/restore audit trail, newest first
    History {
        #[arg(long, default_value_t = 20)]
        limit: usize,
    },
    Config {
        #[command(subcommand)]
        command: ConfigCommand,
    },
}

#[derive(Debug, Args)]
struct StatementArgs {
    sql: String,
    /// Positional parameters; JSON scalars (`3`, `2.5`, `null`, `"x"`) or plain text
    #[arg(allow_hyphen_values = true)]
    params: Vec<String>,
}

#[derive(Debug, Args)]
struct InventoryArgs {
    /// Only active products at or below their reorder threshold
    #[arg(long, default_value_t = false)]
    low_stock: bool,
}

#[derive(Debug, Args)]
struct MovementArgs {
    #[arg(long)]
    product: i64,
    /// entrada, salida or ajuste
    #[arg(long)]
    kind: String,
    /// Positive for entrada/salida, signed non-zero delta for ajuste
    #[arg(long, allow_hyphen_values = true)]
    quantity: f64,
    #[arg(long)]
    unit_cost: Option<f64>,
    #[arg(long)]
    note: Option<String>,
    #[arg(long)]
    reference: Option<String>,
}

#[derive(Debug, Args)]
struct BackupArgs {
    /// Destination file; its directory must exist
    #[arg(long, required_unless_present = "auto", conflicts_with = "auto")]
    out: Option<PathBuf>,
    /// Run an automatic backup only if one is due
    #[arg(long, default_value_t = false)]
    auto: bool,
}

#[derive(Debug, Args)]
struct RestoreArgs {
    #[arg(long = "in")]
    input: PathBuf,
    /// Confirm replacing the live store
    #[arg(long, default_value_t = false)]
    yes: bool,
}

#[derive(Debug, Subcommand)]
enum ConfigCommand {
    Get { key: String },
    Set { key: String, value: String },
    List,
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "warn".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}

fn store_config(db: Option<PathBuf>) -> StoreConfig {
    let config = StoreConfig::from_env();
    match db {
        Some(path) => {
            let backup_dir = std::env::var_os(inventario_store::config::ENV_BACKUP_DIR)
                .filter(|dir| !dir.is_empty())
                .map(PathBuf::from);
            let config = StoreConfig::new(path).with_busy_timeout(config.busy_timeout);
            match backup_dir {
                Some(dir) => config.with_backup_dir(dir),
                None => config,
            }
        }
        None => config,
    }
}

/// Statement parameter from the command line
fn parse_param(raw: &str) -> Value {
    serde_json::from_str::<Value>(raw).unwrap_or_else(|_| Value::Text(raw.to_string()))
}

fn emit_json(value: &serde_json::Value) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn to_app_error(err: anyhow::Error) -> AppError {
    match err.downcast::<StoreError>() {
        Ok(store) => AppError::from(store),
        Err(err) => match err.downcast::<AppError>() {
            Ok(app) => app,
            Err(other) => AppError::internal(format!("{other:#}")),
        },
    }
}

async fn run(command: Command, gateway: &StoreGateway) -> Result<serde_json::Value> {
    // A store that no longer opens can still be replaced from a backup
    let migrations = match (gateway.open().await, &command) {
        (Err(e), Command::Restore(_)) => {
            tracing::warn!("Live store did not open, restoring anyway: {}", e);
            MigrationReport::default()
        }
        (opened, _) => opened?,
    };

    let value = match command {
        Command::Init => json!({
            "db_path": gateway.db_path(),
            "migrations": migrations,
        }),
        Command::Status => json!({
            "db_path": gateway.db_path(),
            "phase": gateway.phase(),
            "migrations": migrations,
            "integrity": gateway.check_integrity().await?,
            "schema_objects": gateway.schema_objects().await?,
        }),
        Command::Query(args) => {
            let params = args.params.iter().map(|p| parse_param(p)).collect();
            json!({ "rows": gateway.query(args.sql, params).await? })
        }
        Command::Exec(args) => {
            let params = args.params.iter().map(|p| parse_param(p)).collect();
            serde_json::to_value(gateway.execute(args.sql, params).await?)?
        }
        Command::GetOne(args) => {
            let params = args.params.iter().map(|p| parse_param(p)).collect();
            json!({ "row": gateway.query_one(args.sql, params).await? })
        }
        Command::Stock { product_id } => {
            let level = gateway.current_stock(product_id).await?;
            let cost = gateway.last_unit_cost(product_id).await?;
            json!({
                "stock": level,
                "costo_unitario_ultimo": cost,
            })
        }
        Command::Inventory(args) => {
            let items = if args.low_stock {
                gateway.low_stock().await?
            } else {
                gateway.inventory().await?
            };
            json!({ "items": items })
        }
        Command::Movement(args) => {
            let kind: MovementKind = args.kind.parse()?;
            let mut movement = NewMovement::new(args.product, kind, args.quantity);
            movement.unit_cost = args.unit_cost;
            movement.observations = args.note;
            movement.reference = args.reference;
            let id = gateway.record_movement(movement).await?;
            json!({
                "movement_id": id,
                "stock": gateway.current_stock(args.product).await?,
            })
        }
        Command::Movements { product_id, limit } => {
            json!({ "movements": gateway.movements(product_id, limit).await? })
        }
        Command::Backup(args) => {
            let outcome = match args.out {
                Some(out) => Some(gateway.backup(out, BackupTrigger::Manual).await?),
                None => gateway.backup_if_due(chrono::Utc::now()).await?,
            };
            json!({
                "performed": outcome.is_some(),
                "outcome": outcome,
            })
        }
        Command::Restore(args) => {
            if !args.yes {
                return Err(AppError::invalid_input(
                    "restore replaces the live store; pass --yes to confirm",
                )
                .into());
            }
            let outcome = gateway.restore(&args.input).await?;
            json!({
                "outcome": outcome,
                "restart_required": true,
            })
        }
        Command::History { limit } => {
            json!({ "records": gateway.backup_history(limit).await? })
        }
        Command::Config { command } => match command {
            ConfigCommand::Get { key } => {
                let value = gateway.get_setting(&key).await?;
                json!({ "clave": key, "valor": value })
            }
            ConfigCommand::Set { key, value } => {
                gateway.set_setting(&key, Some(&value)).await?;
                json!({ "clave": key, "valor": value })
            }
            ConfigCommand::List => json!({ "entries": gateway.list_settings().await? }),
        },
    };

    Ok(value)
}

#[tokio::main]
async fn main() -> ExitCode {
    init_tracing();
    let cli = Cli::parse();

    let config = store_config(cli.db);
    tracing::debug!("Using store at {}", config.db_path.display());
    let gateway = StoreGateway::spawn(config);

    let result = run(cli.command, &gateway)
        .await
        .and_then(|value| emit_json(&value).context("failed to write output"));

    if let Err(e) = gateway.shutdown().await {
        tracing::warn!("Store shutdown reported: {}", e);
    }

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            let app = to_app_error(err);
            tracing::debug!("Command failed: {:?}", app);
            match serde_json::to_string(&app) {
                Ok(json) => eprintln!("{json}"),
                Err(_) => eprintln!("{app}"),
            }
            ExitCode::FAILURE
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn params_accept_json_scalars_and_text() {
        assert_eq!(parse_param("3"), Value::Integer(3));
        assert_eq!(parse_param("2.5"), Value::Real(2.5));
        assert_eq!(parse_param("null"), Value::Null);
        assert_eq!(parse_param("\"007\""), Value::Text("007".into()));
        assert_eq!(parse_param("ACE-01"), Value::Text("ACE-01".into()));
    }

    #[test]
    fn store_errors_keep_their_code() {
        let app = to_app_error(StoreError::NotInitialized.into());
        assert_eq!(app.code, "DB_NOT_INITIALIZED");

        let app = to_app_error(AppError::invalid_input("falta --yes").into());
        assert_eq!(app.code, "VALIDATION_INVALID_INPUT");
    }

    #[test]
    fn cli_definition_is_valid() {
        use clap::CommandFactory;
        Cli::command().debug_assert();
    }
}
