//! CLI commands for the wallet
//!
//! Implements all command handlers for the CLI interface.

use std::path::Path;
use std::sync::Arc;

use crate::core::{Address, AddressType, ScriptBuilder};
use crate::crypto::KeyPair;
use crate::network::{Network, NodeConfig, SpvNode};
use crate::storage::TransactionStore;
use crate::wallet::KeyChain;

/// Result type for CLI operations
pub type CliResult<T> = Result<T, Box<dyn std::error::Error>>;

/// A payment to make once the node is up
#[derive(Debug, Clone)]
pub struct Payment {
    pub address: String,
    pub value: u64,
}

/// Run the node until ctrl-c, optionally sending one payment. The
/// payment is held by the peer group until a peer is ready.
pub async fn cmd_node_start(config: NodeConfig, payment: Option<Payment>) -> CliResult<()> {
    println!("🌐 Starting SPV node on {}...", config.network);
    let node = Arc::new(SpvNode::new(config)?);

    println!("📬 Receive address: {}", node.receive_address()?);
    println!("💰 Balance: {} sat", node.balance());

    if let Some(payment) = payment {
        let fee = node.fee(&payment.address, payment.value)?;
        let tx = node.send(&payment.address, payment.value)?;
        println!(
            "💸 Paying {} sat to {} (fee {} sat)",
            payment.value, payment.address, fee
        );
        println!("   Transaction: {}", tx.hash_hex());
    }

    node.run().await?;
    Ok(())
}

/// Show what an address string decodes to
pub fn cmd_address_decode(address: &str, network: Network) -> CliResult<()> {
    let decoded = Address::parse(address, network)?;

    println!("📍 Address: {}", decoded);
    println!("   Network: {}", decoded.network);
    println!("   Type: {:?} ({:?})", decoded.kind, decoded.script_type());
    match (&decoded.kind, &decoded.program) {
        (AddressType::Witness, Some(program)) => {
            println!("   Witness program: {}", hex::encode(program));
        }
        _ => println!("   Hash: {}", hex::encode(&decoded.hash)),
    }
    Ok(())
}

/// Print the output script paying to an address
pub fn cmd_address_script(address: &str, network: Network) -> CliResult<()> {
    let decoded = Address::parse(address, network)?;
    let script = ScriptBuilder::new().locking_script(&decoded)?;
    println!("{}", hex::encode(script));
    Ok(())
}

/// Generate a standalone key pair
pub fn cmd_keys_new(network: Network) -> CliResult<()> {
    let key_pair = KeyPair::generate();
    let address = Address::new(AddressType::P2PKH, key_pair.public_key_hash(), network);

    println!("🔑 New key pair");
    println!("   Private key: {}", key_pair.private_key_hex());
    println!("   Public key: {}", hex::encode(key_pair.public_key_bytes()));
    println!("   Address: {}", address);
    Ok(())
}

/// Show the next unused receive address of the wallet in `data_dir`
pub fn cmd_wallet_address(data_dir: &Path, network: Network, gap_limit: u32) -> CliResult<()> {
    let keys = KeyChain::open(data_dir, gap_limit)?;
    let key = keys.receive_public_key()?;
    println!("📬 {}", key.address(network));
    Ok(())
}

/// Show the stored balance of the wallet in `data_dir`
pub fn cmd_wallet_balance(data_dir: &Path) -> CliResult<()> {
    let store = TransactionStore::open(data_dir)?;
    let unspent = store.unspent_outputs();

    println!("💰 Balance: {} sat", store.balance());
    println!("   Unspent outputs: {}", unspent.len());
    println!("   Transactions: {}", store.transaction_count());
    println!("   Headers: {}", store.last_block_height());
    Ok(())
}
