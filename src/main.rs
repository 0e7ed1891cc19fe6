use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand, ValueEnum};
use rust_decimal::Decimal;
use serde::Serialize;
use tracing_subscriber::EnvFilter;

use payledger::api::{self, AutoAllocateRequest, ManualAllocateRequest, ValidateConsistencyRequest};
use payledger::money::parse_amount;
use payledger::reconciliation::RunMode;
use payledger::{AppError, Ledger, LedgerConfig, Result};

#[derive(Copy, Clone, Debug, ValueEnum)]
enum Mode {
    Dry,
    Enforce,
}

impl From<Mode> for RunMode {
    fn from(mode: Mode) -> Self {
        match mode {
            Mode::Dry => RunMode::Dry,
            Mode::Enforce => RunMode::Enforce,
        }
    }
}

#[derive(Parser, Debug)]
#[command(name = "payledger", version, about = "Payment allocation ledger")]
struct Cli {
    /// JSON config file; defaults apply when omitted
    #[arg(short = 'c', long = "config")]
    config: Option<PathBuf>,

    /// Database path, overrides the config file
    #[arg(long = "db")]
    db: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Create the database and run migrations
    Init,
    AddRepresentative {
        name: String,
    },
    AddInvoice {
        #[arg(long)]
        representative: i64,
        #[arg(long)]
        number: String,
        #[arg(long, value_parser = parse_decimal)]
        amount: Decimal,
        /// Issue date, YYYY-MM-DD
        #[arg(long)]
        date: String,
    },
    AddPayment {
        #[arg(long)]
        representative: i64,
        #[arg(long, value_parser = parse_decimal)]
        amount: Decimal,
        #[arg(long)]
        date: String,
        #[arg(long)]
        description: Option<String>,
    },
    /// Allocate part of a payment to one invoice
    Allocate {
        #[arg(long)]
        payment: i64,
        #[arg(long)]
        invoice: i64,
        #[arg(long, value_parser = parse_decimal)]
        amount: Decimal,
        #[arg(long, default_value = "cli")]
        by: String,
        #[arg(long)]
        reason: Option<String>,
    },
    /// Settle a payment across open invoices, oldest first
    AutoAllocate {
        #[arg(long)]
        payment: i64,
        #[arg(long, default_value = "cli")]
        by: String,
        #[arg(long)]
        reason: Option<String>,
    },
    /// Dry drift check, never writes
    ValidateConsistency {
        #[arg(long)]
        representative: Option<i64>,
    },
    /// Run a reconciliation pass and wait for it
    Reconcile {
        #[arg(long, value_enum, default_value_t = Mode::Dry)]
        mode: Mode,
        #[arg(long)]
        representative: Option<i64>,
    },
    GuardSnapshot,
    GuardAlerts,
}

fn parse_decimal(raw: &str) -> std::result::Result<Decimal, String> {
    parse_amount(raw).map_err(String::from)
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

async fn dispatch(ledger: &Ledger, command: Command) -> Result<bool> {
    match command {
        Command::Init => {
            print_json(&serde_json::json!({ "database": ledger.db().path().display().to_string() }))?;
        }
        Command::AddRepresentative { name } => {
            let id = ledger.create_representative(&name).await?;
            print_json(&ledger.representative(id).await?)?;
        }
        Command::AddInvoice {
            representative,
            number,
            amount,
            date,
        } => {
            let id = ledger.issue_invoice(representative, &number, amount, &date).await?;
            print_json(&ledger.invoice(id).await?)?;
        }
        Command::AddPayment {
            representative,
            amount,
            date,
            description,
        } => {
            let id = ledger
                .record_payment(representative, amount, &date, description.as_deref())
                .await?;
            print_json(&serde_json::json!({ "payment_id": id }))?;
        }
        Command::Allocate {
            payment,
            invoice,
            amount,
            by,
            reason,
        } => {
            let response = api::manual_allocate(
                ledger,
                ManualAllocateRequest {
                    payment_id: payment,
                    invoice_id: invoice,
                    amount,
                    performed_by: by,
                    reason,
                },
            )
            .await;
            print_json(&response)?;
            return Ok(response.success);
        }
        Command::AutoAllocate {
            payment,
            by,
            reason,
        } => {
            let response = api::auto_allocate(
                ledger,
                AutoAllocateRequest {
                    payment_id: payment,
                    performed_by: by,
                    reason,
                },
            )
            .await;
            print_json(&response)?;
            return Ok(response.success);
        }
        Command::ValidateConsistency { representative } => {
            let response = api::validate_consistency(
                ledger,
                ValidateConsistencyRequest {
                    focus_representative_id: representative,
                },
            )
            .await;
            print_json(&response)?;
            return Ok(response.success);
        }
        Command::Reconcile {
            mode,
            representative,
        } => {
            let engine = ledger.reconciliation();
            let run = engine.start_run(mode.into(), representative).await?;
            let run = engine.wait(run.id).await?;
            let actions = engine.run_actions(run.id).await?;
            print_json(&serde_json::json!({ "run": run, "actions": actions }))?;
        }
        Command::GuardSnapshot => print_json(&api::guard_snapshot(ledger).await)?,
        Command::GuardAlerts => print_json(&api::guard_alerts(ledger).await)?,
    }
    Ok(true)
}

fn load_config(cli: &Cli) -> Result<LedgerConfig> {
    let config = match &cli.config {
        Some(path) => LedgerConfig::from_file(path)?,
        None => LedgerConfig::default(),
    };
    let mut config = config.with_env_overrides()?;
    if let Some(db) = &cli.db {
        config.database_path = db.clone();
    }
    Ok(config)
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("payledger=info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let ledger = match load_config(&cli).and_then(Ledger::open) {
        Ok(ledger) => ledger,
        Err(err) => {
            eprintln!("error: {err}");
            return ExitCode::FAILURE;
        }
    };

    let outcome = dispatch(&ledger, cli.command).await;
    ledger.shutdown().await;

    match outcome {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::FAILURE,
        Err(err) => {
            let code = match &err {
                AppError::Rejected(_) | AppError::Validation(_) | AppError::NotFound { .. } => 2,
                _ => 1,
            };
            eprintln!("error: {err}");
            ExitCode::from(code)
        }
    }
}
