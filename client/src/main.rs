use anyhow::{Context, Result, anyhow};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

use client::app::TicketingApp;
use client::config::{read_config, read_config_from_toml};
use client::error::ClientError;
use client::orchestrator::PendingTransaction;
use client::units::{format_ether, parse_ether};
use client::validation::TicketInput;
use ticket_api::{Address, Role};

#[derive(Parser, Debug)]
#[command(name = "client")]
struct Cli {
    /// Path to config.toml; defaults to ./config/config.toml
    #[arg(long, global = true)]
    config_file: Option<PathBuf>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Ask the wallet for an account
    Connect,
    /// List events on sale
    Events {
        #[arg(long)]
        search: Option<String>,
        /// Include paused events
        #[arg(long)]
        all: bool,
    },
    /// List the connected account's tickets
    Tickets {
        #[arg(long, default_value_t = 0)]
        page: u64,
        #[arg(long)]
        valid_only: bool,
    },
    /// Buy tickets for an event
    Buy {
        event: u64,
        #[arg(long, default_value_t = 1)]
        quantity: u64,
    },
    Transfer {
        ticket: u64,
        to: String,
    },
    Refund {
        ticket: u64,
    },
    /// Validate a ticket at the door
    Validate {
        /// Ticket id, typed or decoded from a scanned code
        ticket: String,
        #[arg(long)]
        scanned: bool,
    },
    /// Create an event; price in ether
    CreateEvent {
        name: String,
        price: String,
    },
    /// Pause or resume sales for an event
    ToggleEvent {
        event: u64,
    },
    /// Issue a ticket to an account; value in ether
    Mint {
        to: String,
        event: u64,
        #[arg(long, default_value = "0")]
        value: String,
    },
    GrantRole {
        role: Role,
        account: String,
    },
    RevokeRole {
        role: Role,
        account: String,
    },
    /// Withdraw collected funds
    Withdraw,
    /// Show what an account is allowed to do
    Roles {
        #[arg(long)]
        account: Option<String>,
    },
}

fn user_error(e: ClientError) -> anyhow::Error {
    anyhow!(e.user_message())
}

fn print_transaction(tx: &PendingTransaction) {
    println!(
        "{}: {:?} ({})",
        tx.action.description(),
        tx.state,
        tx.hash.as_ref().map(|h| h.0.as_str()).unwrap_or("no hash")
    );
    if let Some(e) = &tx.refresh_error {
        warn!("Confirmed, but refreshing local data failed: {}", e);
    }
}

/// Restores an authorized session, prompting only when there is none.
async fn ensure_connected(app: &TicketingApp) -> Result<()> {
    if app.restore().await.map_err(user_error)?.is_none() {
        debug!("No authorized account, requesting one");
        app.connect().await.map_err(user_error)?;
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = match &cli.config_file {
        Some(path) => read_config(path)?,
        None => read_config_from_toml()?,
    };

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.logging.level))
        .context("invalid log level")?;
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let app: Arc<TicketingApp> = TicketingApp::from_config(&config)?;
    let _listener = app.spawn_notification_listener();

    match cli.command {
        Commands::Connect => {
            let snapshot = app.connect().await.map_err(user_error)?;
            if let (Some(address), Some(network)) = (snapshot.address, snapshot.network) {
                println!("Connected as {} on network {}", address, network);
            }
        }
        Commands::Events { search, all } => {
            let load = app.load_events().await;
            if let Some(e) = &load.error {
                warn!("Event list may be incomplete: {}", e);
            }
            let events = match (&search, all) {
                (Some(term), _) => app.catalog.search(term),
                (None, true) => app.catalog.all(),
                (None, false) => app.catalog.active(),
            };
            for event in events {
                println!(
                    "#{:<4} {:<40} {:>12} ETH {}",
                    event.id,
                    event.name,
                    format_ether(event.ticket_price),
                    if event.is_active { "" } else { "(paused)" }
                );
            }
        }
        Commands::Tickets { page, valid_only } => {
            ensure_connected(&app).await?;
            let current = app.my_tickets(page).await.map_err(user_error)?;
            let tickets = if valid_only {
                current.valid_tickets()
            } else {
                current.tickets.clone()
            };
            for ticket in &tickets {
                println!(
                    "Ticket #{:<6} event #{:<4} {:<10} paid {} ETH",
                    ticket.id,
                    ticket.event_id,
                    ticket.state.label(),
                    format_ether(ticket.purchase_price)
                );
            }
            info!(
                "Page {} ({} tickets){}",
                current.page,
                tickets.len(),
                if current.has_next() { ", more available" } else { "" }
            );
        }
        Commands::Buy { event, quantity } => {
            ensure_connected(&app).await?;
            let tx = app.buy_tickets(event, quantity).await.map_err(user_error)?;
            print_transaction(&tx);
        }
        Commands::Transfer { ticket, to } => {
            ensure_connected(&app).await?;
            let tx = app.transfer_ticket(ticket, &to).await.map_err(user_error)?;
            print_transaction(&tx);
        }
        Commands::Refund { ticket } => {
            ensure_connected(&app).await?;
            let tx = app.refund_ticket(ticket).await.map_err(user_error)?;
            print_transaction(&tx);
        }
        Commands::Validate { ticket, scanned } => {
            ensure_connected(&app).await?;
            let input = if scanned {
                TicketInput::Scanned(ticket)
            } else {
                TicketInput::Manual(ticket)
            };
            let outcome = app.validate(input).await;
            println!("{}", outcome.message());
            if !outcome.is_admitted() {
                std::process::exit(2);
            }
        }
        Commands::CreateEvent { name, price } => {
            ensure_connected(&app).await?;
            let price = parse_ether(&price).map_err(user_error)?;
            let tx = app.create_event(&name, price).await.map_err(user_error)?;
            print_transaction(&tx);
        }
        Commands::ToggleEvent { event } => {
            ensure_connected(&app).await?;
            let tx = app.toggle_event(event).await.map_err(user_error)?;
            print_transaction(&tx);
        }
        Commands::Mint { to, event, value } => {
            ensure_connected(&app).await?;
            let value = parse_ether(&value).map_err(user_error)?;
            let tx = app.admin_mint(&to, event, value).await.map_err(user_error)?;
            print_transaction(&tx);
        }
        Commands::GrantRole { role, account } => {
            ensure_connected(&app).await?;
            let tx = app.grant_role(role, &account).await.map_err(user_error)?;
            print_transaction(&tx);
        }
        Commands::RevokeRole { role, account } => {
            ensure_connected(&app).await?;
            let tx = app.revoke_role(role, &account).await.map_err(user_error)?;
            print_transaction(&tx);
        }
        Commands::Withdraw => {
            ensure_connected(&app).await?;
            let tx = app.withdraw_funds().await.map_err(user_error)?;
            print_transaction(&tx);
        }
        Commands::Roles { account } => {
            let account = match account {
                Some(a) => Some(Address::parse(&a)?),
                None => {
                    ensure_connected(&app).await?;
                    None
                }
            };
            let capabilities = app
                .capabilities(account.as_ref())
                .await
                .map_err(user_error)?;
            if capabilities.is_empty() {
                println!("No roles");
            }
            for capability in capabilities {
                println!("can {}", capability);
            }
        }
    }
    Ok(())
}
