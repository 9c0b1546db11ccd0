//! Sealbus CLI
//!
//! Thin wrapper around sealbus-core functions for command-line usage.
//!
//! ## Usage
//!
//! ```bash
//! # Run an in-process ledger with its event bus
//! sealbus ledger serve --bind 127.0.0.1:5555
//!
//! # Show this node's identity
//! sealbus identity show
//!
//! # Create a group and export its key
//! sealbus group create team
//! sealbus group export team
//!
//! # Hand the key to a peer over an authenticated handshake
//! sealbus share team --bind 0.0.0.0:7000 --peer-key <hex>
//! sealbus join team --connect host:7000 --peer-key <hex>
//!
//! # Messaging
//! sealbus listen team
//! sealbus send team "hello"
//! ```

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use sealbus_core::handshake::{request_group_key, serve_group_key};
use sealbus_core::{
    BusLedger, BusServer, GroupCallback, IdentityPublicKey, Ledger, MemoryLedger, Node,
    NodeConfig, SecretStore, SumContractProcessor,
};
use tokio::net::TcpListener;
use tracing::info;

const CONFIG_FILE: &str = "config.json";
const STORE_FILE: &str = "store.redb";
const PASSPHRASE_ENV: &str = "SEALBUS_PASSPHRASE";

/// Sealbus - encrypted group messaging over a ledger
#[derive(Parser)]
#[command(name = "sealbus")]
#[command(version = "0.1.0")]
#[command(about = "Sealbus - encrypted group messaging over a ledger")]
struct Cli {
    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Data directory (default: ~/.sealbus)
    #[arg(short, long, global = true)]
    data_dir: Option<PathBuf>,

    /// Client ID (default: the one saved in the data directory)
    #[arg(long, global = true)]
    node_id: Option<String>,

    /// Store passphrase (default: $SEALBUS_PASSPHRASE)
    #[arg(long, global = true)]
    passphrase: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Identity management
    Identity {
        #[command(subcommand)]
        action: IdentityAction,
    },

    /// Group key management
    Group {
        #[command(subcommand)]
        action: GroupAction,
    },

    /// Known peer keys
    Peer {
        #[command(subcommand)]
        action: PeerAction,
    },

    /// In-process ledger
    Ledger {
        #[command(subcommand)]
        action: LedgerAction,
    },

    /// Send a text message to a group
    Send {
        group: String,
        message: String,
        /// Ledger event bus endpoint
        #[arg(long)]
        ledger: Option<String>,
    },

    /// Print messages of one or more groups until Ctrl+C
    Listen {
        #[arg(required = true)]
        groups: Vec<String>,
        /// Ledger event bus endpoint
        #[arg(long)]
        ledger: Option<String>,
        /// Process "sum" contracts addressed to this node
        #[arg(long)]
        sum: bool,
    },

    /// Hand a group key to one applicant
    Share {
        group: String,
        /// Address to accept the applicant on
        #[arg(long, default_value = "0.0.0.0:7000")]
        bind: String,
        /// Applicant's identity public key (hex) or a saved peer alias
        #[arg(long)]
        peer_key: String,
    },

    /// Obtain a group key from a member
    Join {
        group: String,
        /// Member address
        #[arg(long)]
        connect: String,
        /// Member's identity public key (hex) or a saved peer alias
        #[arg(long)]
        peer_key: String,
    },
}

#[derive(Subcommand)]
enum IdentityAction {
    /// Show client ID and identity public key
    Show,
    /// Generate new identity (WARNING: replaces existing)
    Regenerate {
        /// Confirm regeneration (required)
        #[arg(long)]
        force: bool,
    },
}

#[derive(Subcommand)]
enum GroupAction {
    /// Create a group with a fresh key
    Create { name: String },
    /// Import a group key (base64)
    Add { name: String, key: String },
    /// Forget a group key
    Remove { name: String },
    /// List groups
    List,
    /// Print a group key (base64)
    Export { name: String },
}

#[derive(Subcommand)]
enum PeerAction {
    /// Save a peer's public key under an alias
    Add { alias: String, public_key: String },
    /// List saved peers
    List,
    /// Forget a peer
    Remove { alias: String },
}

#[derive(Subcommand)]
enum LedgerAction {
    /// Serve an in-memory ledger and its event bus until Ctrl+C
    Serve {
        #[arg(long, default_value = "127.0.0.1:5555")]
        bind: String,
    },
}

fn setup_logging(verbosity: u8) {
    let filter = match verbosity {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(filter)),
        )
        .with_writer(std::io::stderr)
        .init();
}

/// Get the default data directory (~/.sealbus)
fn default_data_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".sealbus")
}

/// Load the saved config, creating it on first use.
fn load_config(data_dir: &Path, node_id: Option<String>) -> Result<NodeConfig> {
    let path = data_dir.join(CONFIG_FILE);
    let mut config = if path.exists() {
        NodeConfig::load(&path).with_context(|| format!("Reading {}", path.display()))?
    } else {
        let config = NodeConfig {
            store_path: data_dir.join(STORE_FILE),
            ..NodeConfig::default()
        };
        config
            .save(&path)
            .with_context(|| format!("Writing {}", path.display()))?;
        config
    };
    if let Some(node_id) = node_id {
        config.node_id = node_id;
    }
    Ok(config)
}

fn resolve_passphrase(flag: Option<String>) -> Result<String> {
    flag.or_else(|| std::env::var(PASSPHRASE_ENV).ok())
        .ok_or_else(|| anyhow::anyhow!("No passphrase: use --passphrase or ${}", PASSPHRASE_ENV))
}

/// Resolve a peer key given as hex or as a saved alias.
fn parse_peer_key(store: &SecretStore, value: &str) -> Result<IdentityPublicKey> {
    let hex = match store.get_keypair(value) {
        Some(peer) => peer.public_key,
        None => value.to_string(),
    };
    IdentityPublicKey::from_hex(&hex)
        .map_err(|e| anyhow::anyhow!("Invalid peer key '{}': {}", value, e))
}

fn open_store(config: &NodeConfig, passphrase: Option<String>) -> Result<SecretStore> {
    let passphrase = resolve_passphrase(passphrase)?;
    SecretStore::open_or_create(&config.store_path, &passphrase)
        .with_context(|| format!("Opening {}", config.store_path.display()))
}

async fn start_node(
    config: NodeConfig,
    passphrase: Option<String>,
    ledger: Option<String>,
) -> Result<Node> {
    let passphrase = resolve_passphrase(passphrase)?;
    let config = match ledger {
        Some(endpoint) => config.with_ledger_endpoint(endpoint),
        None => config,
    };
    let client: Arc<dyn Ledger> = Arc::new(
        BusLedger::connect(&config.ledger_endpoint)
            .await
            .context("Connecting to ledger")?,
    );
    Ok(Node::start(config, &passphrase, client).await?)
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    setup_logging(cli.verbose);

    let data_dir = cli.data_dir.unwrap_or_else(default_data_dir);
    let config = load_config(&data_dir, cli.node_id)?;

    let passphrase_flag = cli.passphrase;

    match cli.command {
        Commands::Ledger {
            action: LedgerAction::Serve { bind },
        } => serve_ledger(&bind, &config).await?,

        Commands::Identity { action } => {
            let store = open_store(&config, passphrase_flag)?;
            match action {
                IdentityAction::Show => {
                    println!("Identity:");
                    println!("  Client ID: {}", config.node_id);
                    println!("  Public key: {}", store.get_identity_public_key());
                }
                IdentityAction::Regenerate { force } => {
                    if !force {
                        anyhow::bail!(
                            "Regenerating the identity is irreversible; peers holding the old key \
                             can no longer authenticate you. Re-run with --force."
                        );
                    }
                    let public_key = store.regenerate_identity()?;
                    println!("New identity generated.");
                    println!("  Public key: {}", public_key);
                }
            }
        }

        Commands::Group { action } => {
            let store = open_store(&config, passphrase_flag)?;
            match action {
                GroupAction::Create { name } => {
                    store.create_group(&name)?;
                    println!("Created group: {}", name);
                }
                GroupAction::Add { name, key } => {
                    store.add_group(&name, &key)?;
                    println!("Added group: {}", name);
                }
                GroupAction::Remove { name } => {
                    if store.remove_group(&name)? {
                        println!("Removed group: {}", name);
                    } else {
                        anyhow::bail!("Unknown group: {}", name);
                    }
                }
                GroupAction::List => {
                    let groups = store.group_names();
                    if groups.is_empty() {
                        println!("No groups.");
                    }
                    for group in groups {
                        println!("{}", group);
                    }
                }
                GroupAction::Export { name } => match store.get_key_for_group(&name) {
                    Some(key) => println!("{}", key),
                    None => anyhow::bail!("Unknown group: {}", name),
                },
            }
        }

        Commands::Peer { action } => {
            let store = open_store(&config, passphrase_flag)?;
            match action {
                PeerAction::Add { alias, public_key } => {
                    IdentityPublicKey::from_hex(&public_key)
                        .map_err(|e| anyhow::anyhow!("Invalid public key: {}", e))?;
                    store.add_keypair(&alias, None, &public_key)?;
                    println!("Saved peer: {}", alias);
                }
                PeerAction::List => {
                    let peers = store.keypairs();
                    if peers.is_empty() {
                        println!("No peers.");
                    }
                    for peer in peers {
                        println!("{}  {}", peer.alias, peer.public_key);
                    }
                }
                PeerAction::Remove { alias } => {
                    if store.remove_keypair(&alias)? {
                        println!("Removed peer: {}", alias);
                    } else {
                        anyhow::bail!("Unknown peer: {}", alias);
                    }
                }
            }
        }

        Commands::Send {
            group,
            message,
            ledger,
        } => {
            let node = start_node(config, passphrase_flag, ledger).await?;
            let sent = node.send_text(&group, &message).await;
            node.close().await;
            if !sent {
                anyhow::bail!("Message to '{}' was not accepted", group);
            }
            println!("Sent.");
        }

        Commands::Listen {
            groups,
            ledger,
            sum,
        } => {
            let node = start_node(config, passphrase_flag, ledger).await?;
            if sum {
                node.add_contract_processor(Arc::new(SumContractProcessor));
            }

            let printer: Arc<dyn GroupCallback> =
                Arc::new(|group: &str, message: &str, sender: &str| {
                    println!("[{}] {}: {}", group, sender, message);
                });
            for group in &groups {
                if !node.store().has_key_for_group(group) {
                    eprintln!("Warning: no key for '{}', its messages will be dropped", group);
                }
                node.add_callback_to_group(group, printer.clone());
                node.subscribe_to_group(group)?;
            }

            println!("Listening on {}. Press Ctrl+C to stop.", groups.join(", "));
            tokio::signal::ctrl_c().await?;
            println!();
            println!("Received shutdown signal...");
            node.close().await;
        }

        Commands::Share {
            group,
            bind,
            peer_key,
        } => {
            let store = open_store(&config, passphrase_flag)?;
            let peer = parse_peer_key(&store, &peer_key)?;
            let listener = TcpListener::bind(&bind)
                .await
                .with_context(|| format!("Binding {}", bind))?;
            println!(
                "Waiting for applicant on {} ...",
                listener.local_addr()?
            );
            serve_group_key(
                &listener,
                &store,
                &group,
                &config.node_id,
                &peer,
                config.handshake_timeout(),
            )
            .await?;
            println!("Shared key for group: {}", group);
        }

        Commands::Join {
            group,
            connect,
            peer_key,
        } => {
            let store = open_store(&config, passphrase_flag)?;
            let peer = parse_peer_key(&store, &peer_key)?;
            request_group_key(
                connect.as_str(),
                &store,
                &group,
                &config.node_id,
                &peer,
                config.handshake_timeout(),
            )
            .await?;
            println!("Joined group: {}", group);
        }
    }

    Ok(())
}

async fn serve_ledger(bind: &str, config: &NodeConfig) -> Result<()> {
    let ledger = Arc::new(MemoryLedger::new(config.namespace_prefix.clone()));
    let server = BusServer::bind(bind, ledger)
        .await
        .with_context(|| format!("Binding {}", bind))?;
    let handle = server.spawn()?;
    info!(addr = %handle.local_addr(), "Ledger serving");
    println!("Ledger listening on {}", handle.local_addr());
    println!("Press Ctrl+C to stop.");

    tokio::signal::ctrl_c().await?;
    println!();
    println!("Received shutdown signal...");
    handle.shutdown().await;
    Ok(())
}
