use std::sync::Arc;

use anyhow::{Context, Result};
use arfind_api::{
    auth::{AuthConfig, AuthService},
    config::{self, AppConfig},
    db::{self, DbPool},
    events::{self, outbox, EventSender},
    handlers::AppServices,
    services::{
        devices::{CreateDeviceRequest, DeviceService},
        payments::MercadoPagoClient,
        storage::LocalObjectStore,
    },
};
use clap::{ArgAction, Args, Parser, Subcommand};
use serde::Serialize;
use tokio::sync::mpsc;
use uuid::Uuid;

#[derive(Parser)]
#[command(name = "arfind", about = "Operational commands for the ARFind backend", version)]
struct Cli {
    #[arg(
        long,
        global = true,
        action = ArgAction::SetTrue,
        help = "Render command output as pretty JSON when available"
    )]
    json: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Apply pending schema migrations
    Migrate,
    /// Mint a bearer token signed with the configured secret
    IssueToken(IssueTokenArgs),
    /// Run one outbox delivery pass and report the result
    DrainOutbox,
    /// Register an unassigned device in stock
    SeedDevice(SeedDeviceArgs),
}

#[derive(Args)]
struct IssueTokenArgs {
    #[arg(long, help = "Subject (user id) of the token")]
    sub: String,
    #[arg(long, help = "Email claim")]
    email: Option<String>,
    #[arg(long, action = ArgAction::SetTrue, help = "Grant the admin claim")]
    admin: bool,
}

#[derive(Args)]
struct SeedDeviceArgs {
    #[arg(long, value_parser = clap::value_parser!(Uuid), help = "Product the device belongs to")]
    product: Uuid,
    #[arg(long, help = "SIM phone number of the tracker")]
    phone: String,
    #[arg(long, help = "Optional display name")]
    nickname: Option<String>,
}

struct CliContext {
    config: AppConfig,
    db: Arc<DbPool>,
    event_sender: EventSender,
}

impl CliContext {
    async fn initialize() -> Result<Self> {
        let config = config::load_config().context("failed to load application config")?;
        config::init_tracing(config.log_level(), config.log_json);

        let db_pool = db::establish_connection_from_app_config(&config)
            .await
            .context("failed to connect to database")?;

        let (event_tx, event_rx) = mpsc::channel(config.event_channel_capacity);
        tokio::spawn(events::process_events(event_rx));

        Ok(Self {
            config,
            db: Arc::new(db_pool),
            event_sender: EventSender::new(event_tx),
        })
    }

    fn services(&self) -> Result<AppServices> {
        let gateway = MercadoPagoClient::from_config(&self.config)
            .context("failed to build payment client")?;
        Ok(AppServices::new(
            self.db.clone(),
            self.event_sender.clone(),
            &self.config,
            Arc::new(gateway),
            Arc::new(LocalObjectStore::new(self.config.storage_dir.clone())),
        ))
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let context = CliContext::initialize().await?;

    match cli.command {
        Commands::Migrate => {
            db::run_migrations(&context.db)
                .await
                .context("migration failed")?;
            println!("Migrations applied");
        }
        Commands::IssueToken(args) => {
            let auth = AuthService::new(AuthConfig::from(&context.config), context.db.clone());
            let token = auth
                .issue_token(&args.sub, args.email.as_deref(), args.admin)
                .context("failed to sign token")?;
            if cli.json {
                print_json(&serde_json::json!({ "token": token }))?;
            } else {
                println!("{}", token);
            }
        }
        Commands::DrainOutbox => {
            let services = context.services()?;
            let report = outbox::drain_once(&context.db, services.outbox_dispatcher().as_ref())
                .await
                .context("outbox drain failed")?;
            if cli.json {
                print_json(&serde_json::json!({
                    "delivered": report.delivered,
                    "retried": report.retried,
                    "failed": report.failed,
                }))?;
            } else {
                println!(
                    "Outbox pass: {} delivered, {} retried, {} failed",
                    report.delivered, report.retried, report.failed
                );
            }
        }
        Commands::SeedDevice(args) => {
            let devices = DeviceService::new(context.db.clone(), context.event_sender.clone());
            let device = devices
                .create_device(CreateDeviceRequest {
                    phone_number: args.phone,
                    product_id: args.product,
                    nickname: args.nickname,
                })
                .await
                .context("failed to create device")?;
            if cli.json {
                print_json(&device)?;
            } else {
                println!(
                    "- Device {} • product {} • invite code {}",
                    device.id, device.product_id, device.invite_code
                );
            }
        }
    }

    Ok(())
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
