// CLI commands

use crate::config::{ChainConfig, DEFAULT_SUBSIDY, DEFAULT_TARGET_BITS, NodeConfig};
use crate::core::Transaction;
use crate::error::{Error, Result};
use crate::network::Node;
use crate::storage::{Blockchain, UtxoSet};
use crate::wallet::{Wallets, decode_address, new_utxo_transaction, validate_address};
use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "tinyledger")]
#[command(about = "Minimal proof-of-work ledger with UTXO index and peer sync", long_about = None)]
pub struct Cli {
    /// Node id; also the port the node listens on
    #[arg(long, env = "NODE_ID", default_value = "3000", global = true)]
    pub node_id: String,

    /// Directory holding per-node chain stores and wallets
    #[arg(long, default_value = "./data", global = true)]
    pub data_dir: PathBuf,

    /// Leading zero bits required of block hashes
    #[arg(long, env = "TARGET_BITS", default_value_t = DEFAULT_TARGET_BITS, global = true)]
    pub target_bits: u32,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Create a blockchain and send the genesis reward to ADDRESS
    CreateBlockchain {
        #[arg(long)]
        address: String,
    },

    /// Generate a new key pair and save it to the wallet file
    CreateWallet,

    /// List the addresses in the wallet file
    ListAddresses,

    /// Get the balance of ADDRESS
    GetBalance {
        #[arg(long)]
        address: String,
    },

    /// Send AMOUNT from FROM to TO, mining a block with the transaction
    Send {
        #[arg(long)]
        from: String,
        #[arg(long)]
        to: String,
        #[arg(long)]
        amount: u64,
    },

    /// Print all blocks from tip to genesis
    PrintChain,

    /// Print the height of the tip
    BestHeight,

    /// Rebuild the UTXO index from the chain
    ReindexUtxo,

    /// Start a node that syncs blocks with its peers
    StartNode,
}

/// CLI handler
pub struct CliHandler {
    node_dir: PathBuf,
    node_id: String,
    chain_config: ChainConfig,
}

impl CliHandler {
    pub fn new(cli: &Cli) -> Result<Self> {
        let chain_config = ChainConfig::new(cli.target_bits, DEFAULT_SUBSIDY)?;
        Ok(Self {
            node_dir: cli.data_dir.join(&cli.node_id),
            node_id: cli.node_id.clone(),
            chain_config,
        })
    }

    fn chain_path(&self) -> PathBuf {
        self.node_dir.join("chain")
    }

    fn wallet_path(&self) -> PathBuf {
        self.node_dir.join("wallet.json")
    }

    /// Open the store, which may hold no chain yet
    fn open_store(&self) -> Result<Blockchain> {
        Blockchain::open_path(self.chain_path(), self.chain_config)
    }

    /// Open a store that must already hold a chain
    fn open_chain(&self) -> Result<Blockchain> {
        let chain = self.open_store()?;
        if chain.tip()?.is_none() {
            return Err(Error::NoChain);
        }
        Ok(chain)
    }

    /// Handle CLI command
    pub fn handle(&self, command: Commands) -> Result<()> {
        match command {
            Commands::CreateBlockchain { address } => self.create_blockchain(&address),
            Commands::CreateWallet => self.create_wallet(),
            Commands::ListAddresses => self.list_addresses(),
            Commands::GetBalance { address } => self.get_balance(&address),
            Commands::Send { from, to, amount } => self.send(&from, &to, amount),
            Commands::PrintChain => self.print_chain(),
            Commands::BestHeight => self.best_height(),
            Commands::ReindexUtxo => self.reindex_utxo(),
            Commands::StartNode => self.start_node(),
        }
    }

    fn create_blockchain(&self, address: &str) -> Result<()> {
        if !validate_address(address) {
            return Err(Error::InvalidAddress(address.to_string()));
        }
        std::fs::create_dir_all(&self.node_dir)?;
        let db = sled::open(self.chain_path())?;
        let chain = Blockchain::create(db, address, self.chain_config)?;

        println!("Created blockchain, tip {}", chain.tip()?.unwrap_or_default());
        Ok(())
    }

    fn create_wallet(&self) -> Result<()> {
        let mut wallets = Wallets::load(self.wallet_path())?;
        let address = wallets.create_wallet();
        wallets.save(self.wallet_path())?;

        println!("New address: {}", address);
        Ok(())
    }

    fn list_addresses(&self) -> Result<()> {
        let wallets = Wallets::load(self.wallet_path())?;
        for address in wallets.addresses() {
            println!("{}", address);
        }
        Ok(())
    }

    fn get_balance(&self, address: &str) -> Result<()> {
        let pubkey_hash = decode_address(address)?;
        let chain = self.open_chain()?;
        let balance = UtxoSet::new(&chain)?.balance(&pubkey_hash)?;

        println!("Balance of '{}': {}", address, balance);
        Ok(())
    }

    fn send(&self, from: &str, to: &str, amount: u64) -> Result<()> {
        if !validate_address(from) {
            return Err(Error::InvalidAddress(from.to_string()));
        }
        if !validate_address(to) {
            return Err(Error::InvalidAddress(to.to_string()));
        }

        let chain = self.open_chain()?;
        let utxo_set = UtxoSet::new(&chain)?;
        let wallets = Wallets::load(self.wallet_path())?;
        let wallet = wallets.get_wallet(from)?;

        let tx = new_utxo_transaction(wallet, to, amount, &utxo_set, &chain)?;
        let reward = Transaction::new_coinbase(from, "", self.chain_config.subsidy)?;
        let block = chain.append(vec![reward, tx])?;
        utxo_set.update(&block)?;

        println!("Success! Block {} at height {}", block.hash, block.height);
        Ok(())
    }

    fn print_chain(&self) -> Result<()> {
        let chain = self.open_chain()?;
        for block in chain.iter()? {
            println!("{}\n", block?);
        }
        Ok(())
    }

    fn best_height(&self) -> Result<()> {
        match self.open_store()?.best_height()? {
            Some(height) => println!("{}", height),
            None => println!("No blocks in chain"),
        }
        Ok(())
    }

    fn reindex_utxo(&self) -> Result<()> {
        let chain = self.open_chain()?;
        let count = UtxoSet::new(&chain)?.reindex()?;

        println!("Done! There are {} transactions in the UTXO set.", count);
        Ok(())
    }

    fn start_node(&self) -> Result<()> {
        std::fs::create_dir_all(&self.node_dir)?;
        let chain = self.open_store()?;
        let config = NodeConfig::for_node_id(&self.node_id);

        println!("Starting node {}", config.listen_addr);
        let node = Node::new(config, chain);
        let runtime = tokio::runtime::Runtime::new()?;
        runtime.block_on(node.start())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn handler(dir: &std::path::Path) -> CliHandler {
        let cli = Cli::try_parse_from([
            "tinyledger",
            "--node-id",
            "3100",
            "--target-bits",
            "8",
            "--data-dir",
            dir.to_str().unwrap(),
            "best-height",
        ])
        .unwrap();
        CliHandler::new(&cli).unwrap()
    }

    #[test]
    fn test_parse_send() {
        let cli = Cli::try_parse_from([
            "tinyledger", "send", "--from", "a", "--to", "b", "--amount", "30",
        ])
        .unwrap();
        assert!(matches!(
            cli.command,
            Commands::Send { ref from, ref to, amount: 30 } if from == "a" && to == "b"
        ));
        assert_eq!(cli.data_dir, PathBuf::from("./data"));
    }

    #[test]
    fn test_invalid_target_bits_rejected() {
        let cli = Cli::try_parse_from(["tinyledger", "--target-bits", "0", "best-height"]).unwrap();
        assert!(matches!(CliHandler::new(&cli), Err(Error::Config(_))));
    }

    #[test]
    fn test_wallet_chain_and_send() {
        let dir = std::env::temp_dir().join(format!("tinyledger-cli-{}", rand::random::<u64>()));
        let handler = handler(&dir);

        handler.handle(Commands::CreateWallet).unwrap();
        handler.handle(Commands::CreateWallet).unwrap();
        let wallets = Wallets::load(handler.wallet_path()).unwrap();
        let addresses: Vec<String> = wallets.addresses().iter().map(|a| a.to_string()).collect();
        let (alice, bob) = (&addresses[0], &addresses[1]);

        assert!(matches!(
            handler.handle(Commands::GetBalance { address: alice.clone() }),
            Err(Error::NoChain)
        ));

        handler
            .handle(Commands::CreateBlockchain { address: alice.clone() })
            .unwrap();
        handler
            .handle(Commands::Send {
                from: alice.clone(),
                to: bob.clone(),
                amount: 30,
            })
            .unwrap();

        let chain = handler.open_chain().unwrap();
        let utxo = UtxoSet::new(&chain).unwrap();
        assert_eq!(chain.best_height().unwrap(), Some(1));
        // 70 change plus the block reward
        assert_eq!(utxo.balance(&decode_address(alice).unwrap()).unwrap(), 170);
        assert_eq!(utxo.balance(&decode_address(bob).unwrap()).unwrap(), 30);

        assert!(matches!(
            handler.handle(Commands::Send {
                from: bob.clone(),
                to: alice.clone(),
                amount: 31,
            }),
            Err(Error::InsufficientFunds { available: 30, required: 31 })
        ));

        drop(utxo);
        drop(chain);
        std::fs::remove_dir_all(dir).unwrap();
    }
}
