//! SPV Wallet CLI Application
//!
//! A command-line interface for running the SPV node and inspecting
//! addresses and keys.

use clap::{Parser, Subcommand};
use spv_wallet_kit::cli::{self, Payment};
use spv_wallet_kit::network::{Network, NodeConfig};
use spv_wallet_kit::transactions::DEFAULT_FEE_RATE;
use spv_wallet_kit::wallet::DEFAULT_GAP_LIMIT;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Parser)]
#[command(name = "spv-wallet")]
#[command(author = "Darshan")]
#[command(version = "0.1.0")]
#[command(about = "An SPV Bitcoin wallet kernel in Rust", long_about = None)]
struct Cli {
    /// Network to operate on
    #[arg(short, long, value_enum, default_value = "testnet")]
    network: Network,

    /// Data directory for the wallet store and keys
    #[arg(short, long, default_value = ".wallet_data")]
    data_dir: PathBuf,

    /// Unused keys kept ahead on each key chain
    #[arg(long, default_value_t = DEFAULT_GAP_LIMIT)]
    gap_limit: u32,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// SPV node operations
    Node {
        #[command(subcommand)]
        action: NodeCommands,
    },

    /// Address utilities
    Address {
        #[command(subcommand)]
        action: AddressCommands,
    },

    /// Key utilities
    Keys {
        #[command(subcommand)]
        action: KeyCommands,
    },

    /// Wallet information
    Wallet {
        #[command(subcommand)]
        action: WalletCommands,
    },
}

#[derive(Subcommand)]
enum NodeCommands {
    /// Connect to the network and sync the wallet
    Start {
        /// Peers to use instead of the DNS seeds (comma-separated)
        #[arg(long)]
        peers: Option<String>,

        /// Number of peer connections to keep
        #[arg(long, default_value = "3")]
        peer_count: usize,

        /// Fee rate in satoshis per byte
        #[arg(long, default_value_t = DEFAULT_FEE_RATE)]
        fee_rate: u64,

        /// Connection timeout in seconds
        #[arg(long, default_value = "10")]
        timeout: u64,

        /// Keep the wallet in memory only
        #[arg(long)]
        in_memory: bool,

        /// Address to pay once connected
        #[arg(long, requires = "amount")]
        pay: Option<String>,

        /// Amount to pay in satoshis
        #[arg(long, requires = "pay")]
        amount: Option<u64>,
    },
}

#[derive(Subcommand)]
enum AddressCommands {
    /// Decode an address
    Decode {
        /// Address to decode
        address: String,
    },

    /// Print the output script paying to an address
    Script {
        /// Destination address
        address: String,
    },
}

#[derive(Subcommand)]
enum KeyCommands {
    /// Generate a new key pair
    New,
}

#[derive(Subcommand)]
enum WalletCommands {
    /// Show the next receive address
    Address,

    /// Show the stored balance
    Balance,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logger
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Node { action } => match action {
            NodeCommands::Start {
                peers,
                peer_count,
                fee_rate,
                timeout,
                in_memory,
                pay,
                amount,
            } => {
                let bootstrap_peers: Vec<String> = peers
                    .map(|p| p.split(',').map(|s| s.trim().to_string()).collect())
                    .unwrap_or_default();

                let config = NodeConfig {
                    network: cli.network,
                    peer_count,
                    bootstrap_peers,
                    data_dir: if in_memory { None } else { Some(cli.data_dir) },
                    fee_rate,
                    gap_limit: cli.gap_limit,
                    connect_timeout: Duration::from_secs(timeout),
                };
                let payment = match (pay, amount) {
                    (Some(address), Some(value)) => Some(Payment { address, value }),
                    _ => None,
                };

                let rt = tokio::runtime::Runtime::new()?;
                rt.block_on(cli::cmd_node_start(config, payment))?;
            }
        },

        Commands::Address { action } => match action {
            AddressCommands::Decode { address } => {
                cli::cmd_address_decode(&address, cli.network)?;
            }
            AddressCommands::Script { address } => {
                cli::cmd_address_script(&address, cli.network)?;
            }
        },

        Commands::Keys { action } => match action {
            KeyCommands::New => {
                cli::cmd_keys_new(cli.network)?;
            }
        },

        Commands::Wallet { action } => match action {
            WalletCommands::Address => {
                cli::cmd_wallet_address(&cli.data_dir, cli.network, cli.gap_limit)?;
            }
            WalletCommands::Balance => {
                cli::cmd_wallet_balance(&cli.data_dir)?;
            }
        },
    }

    Ok(())
}
