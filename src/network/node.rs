// Network node - block synchronization between peers

use crate::config::NodeConfig;
use crate::core::Hash256;
use crate::error::{Error, Result};
use crate::network::peer::{PeerRegistry, read_message, send_message};
use crate::network::{
    BlockMessage, GetBlocksMessage, GetDataMessage, InvMessage, InvType, Message, VersionMessage,
};
use crate::storage::{Blockchain, UtxoSet};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Mutex;

/// Pause after a failed accept, e.g. when out of file descriptors
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// Network node. Cloning shares the chain, the peer registry and the sync queue.
#[derive(Clone)]
pub struct Node {
    config: Arc<NodeConfig>,
    chain: Blockchain,
    /// Known peers
    peers: Arc<PeerRegistry>,
    /// Block hashes still to fetch in the current sync session
    in_transit: Arc<Mutex<VecDeque<Hash256>>>,
}

impl Node {
    pub fn new(config: NodeConfig, chain: Blockchain) -> Self {
        let peers = PeerRegistry::new(config.bootstrap.iter().cloned());
        Self {
            config: Arc::new(config),
            chain,
            peers: Arc::new(peers),
            in_transit: Arc::new(Mutex::new(VecDeque::new())),
        }
    }

    pub fn address(&self) -> &str {
        &self.config.listen_addr
    }

    pub fn chain(&self) -> &Blockchain {
        &self.chain
    }

    pub async fn known_peers(&self) -> Vec<String> {
        self.peers.list().await
    }

    pub async fn blocks_in_transit(&self) -> usize {
        self.in_transit.lock().await.len()
    }

    /// Bind the configured address, announce to the bootstrap node and serve
    pub async fn start(self) -> Result<()> {
        let listener = TcpListener::bind(&self.config.listen_addr).await?;
        log::info!("Node listening on {}", self.config.listen_addr);

        if let Err(e) = self.announce().await {
            log::warn!("Bootstrap announcement failed: {}", e);
        }
        self.run(listener).await
    }

    /// Send our height to the bootstrap node unless we are it
    pub async fn announce(&self) -> Result<()> {
        if self.config.is_bootstrap() {
            return Ok(());
        }
        match self.config.bootstrap.first() {
            Some(bootstrap) => self.send_version(bootstrap).await,
            None => Ok(()),
        }
    }

    /// Accept connections forever, one task per connection
    pub async fn run(self, listener: TcpListener) -> Result<()> {
        loop {
            let (stream, addr) = match listener.accept().await {
                Ok(conn) => conn,
                Err(e) => {
                    log::error!("Accept failed: {}", e);
                    tokio::time::sleep(ACCEPT_BACKOFF).await;
                    continue;
                }
            };
            log::debug!("New connection from {}", addr);

            let node = self.clone();
            tokio::spawn(async move {
                if let Err(e) = node.handle_connection(stream).await {
                    if e.is_recoverable() {
                        log::warn!("Request from {} failed: {}", addr, e);
                    } else {
                        log::error!("Request from {} failed: {}", addr, e);
                    }
                }
            });
        }
    }

    async fn handle_connection(&self, stream: TcpStream) -> Result<()> {
        let message = read_message(
            stream,
            self.config.max_message_size,
            self.config.io_timeout,
        )
        .await?;
        log::info!("Received {} command from {}", message.message_type(), message.addr_from());

        match message {
            Message::Version(m) => self.handle_version(m).await,
            Message::GetBlocks(m) => self.handle_getblocks(m).await,
            Message::Inv(m) => self.handle_inv(m).await,
            Message::GetData(m) => self.handle_getdata(m).await,
            Message::BlockData(m) => self.handle_block(m).await,
        }
    }

    async fn handle_version(&self, m: VersionMessage) -> Result<()> {
        self.peers.add(&m.addr_from).await;

        let local = self.chain.best_height()?;
        if local < m.best_height {
            let low = local.map_or(0, |h| h + 1);
            let high = m.best_height.unwrap_or_default();
            log::info!("Behind {} (local {:?}, remote {}), requesting {}..={}",
                m.addr_from, local, high, low, high);
            self.send_getblocks(&m.addr_from, low, high).await
        } else if local > m.best_height {
            self.send_version(&m.addr_from).await
        } else {
            Ok(())
        }
    }

    async fn handle_getblocks(&self, m: GetBlocksMessage) -> Result<()> {
        let hashes = self.chain.block_hashes_in_range(m.low, m.high)?;
        self.send_inv(&m.addr_from, InvType::Block, hashes).await
    }

    async fn handle_inv(&self, m: InvMessage) -> Result<()> {
        log::info!("Received inventory with {} {} items", m.items.len(), m.kind.as_str());

        if m.kind != InvType::Block {
            return Ok(());
        }

        let next = {
            let mut queue = self.in_transit.lock().await;
            *queue = m.items.into_iter().collect();
            queue.pop_front()
        };

        match next {
            Some(hash) => self.send_getdata(&m.addr_from, InvType::Block, hash).await,
            None => Ok(()),
        }
    }

    async fn handle_getdata(&self, m: GetDataMessage) -> Result<()> {
        match m.kind {
            InvType::Block => {
                let block = self.chain.get_block(&m.id)?;
                let reply = Message::BlockData(BlockMessage::new(self.address(), &block));
                self.send(&m.addr_from, &reply).await
            }
            InvType::Tx => Err(Error::Protocol(format!(
                "Transaction relay is not supported (requested {})",
                m.id
            ))),
        }
    }

    async fn handle_block(&self, m: BlockMessage) -> Result<()> {
        if let Err(e) = m.decode_block().and_then(|block| self.chain.add_external_block(&block)) {
            let abandoned = {
                let mut queue = self.in_transit.lock().await;
                let len = queue.len();
                queue.clear();
                len
            };
            log::warn!(
                "Abandoning sync with {}, {} blocks left unfetched",
                m.addr_from,
                abandoned
            );
            return Err(e);
        }

        let next = self.in_transit.lock().await.pop_front();
        match next {
            Some(hash) => self.send_getdata(&m.addr_from, InvType::Block, hash).await,
            None => self.reindex().await,
        }
    }

    /// Rebuild the UTXO index on the blocking pool
    async fn reindex(&self) -> Result<()> {
        let chain = self.chain.clone();
        let indexed = tokio::task::spawn_blocking(move || UtxoSet::new(&chain)?.reindex())
            .await
            .map_err(|e| Error::Protocol(format!("Reindex task failed: {}", e)))??;
        log::info!("Sync finished, {} transactions with unspent outputs", indexed);
        Ok(())
    }

    async fn send_version(&self, addr: &str) -> Result<()> {
        let best_height = self.chain.best_height()?;
        let message = Message::Version(VersionMessage::new(best_height, self.address()));
        self.send(addr, &message).await
    }

    async fn send_getblocks(&self, addr: &str, low: u32, high: u32) -> Result<()> {
        let message = Message::GetBlocks(GetBlocksMessage {
            addr_from: self.address().to_string(),
            low,
            high,
        });
        self.send(addr, &message).await
    }

    async fn send_inv(&self, addr: &str, kind: InvType, items: Vec<Hash256>) -> Result<()> {
        let message = Message::Inv(InvMessage {
            addr_from: self.address().to_string(),
            kind,
            items,
        });
        self.send(addr, &message).await
    }

    async fn send_getdata(&self, addr: &str, kind: InvType, id: Hash256) -> Result<()> {
        let message = Message::GetData(GetDataMessage {
            addr_from: self.address().to_string(),
            kind,
            id,
        });
        self.send(addr, &message).await
    }

    /// Send to a peer, dropping it from the registry if it cannot be reached
    async fn send(&self, addr: &str, message: &Message) -> Result<()> {
        let result = send_message(addr, message, self.config.io_timeout).await;
        if let Err(Error::PeerUnreachable { reason, .. }) = &result {
            log::warn!("Peer {} unreachable ({}), removing it", addr, reason);
            self.peers.remove(addr).await;
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ChainConfig;
    use crate::core::Transaction;
    use crate::wallet::KeyPair;

    fn temp_chain() -> Blockchain {
        let db = sled::Config::new().temporary(true).open().unwrap();
        Blockchain::open(db, ChainConfig::new(8, 100).unwrap()).unwrap()
    }

    async fn spawn_node(chain: Blockchain, bootstrap: Option<&str>) -> Node {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();

        let mut config = NodeConfig::new(addr.clone());
        config.bootstrap = vec![bootstrap.unwrap_or(addr.as_str()).to_string()];
        config.io_timeout = Duration::from_secs(5);

        let node = Node::new(config, chain);
        tokio::spawn(node.clone().run(listener));
        node
    }

    async fn wait_for<F: Fn() -> bool>(check: F) -> bool {
        for _ in 0..200 {
            if check() {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        false
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_empty_node_syncs_from_bootstrap() {
        let owner = KeyPair::generate();
        let db = sled::Config::new().temporary(true).open().unwrap();
        let source = Blockchain::create(db, &owner.address, ChainConfig::new(8, 100).unwrap()).unwrap();
        for _ in 0..2 {
            let reward = Transaction::new_coinbase(&owner.address, "", 100).unwrap();
            source.append(vec![reward]).unwrap();
        }
        let bootstrap = spawn_node(source.clone(), None).await;

        let follower = spawn_node(temp_chain(), Some(bootstrap.address())).await;
        follower.announce().await.unwrap();

        let chain = follower.chain().clone();
        let utxo = UtxoSet::new(&chain).unwrap();
        let synced = wait_for(|| {
            chain.best_height().unwrap() == Some(2)
                && utxo.balance(&owner.pubkey_hash()).unwrap() == 300
        })
        .await;
        assert!(synced, "follower did not catch up");

        assert_eq!(chain.block_hashes().unwrap(), source.block_hashes().unwrap());
        assert_eq!(follower.blocks_in_transit().await, 0);
        assert!(bootstrap.known_peers().await.contains(&follower.address().to_string()));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_lagging_node_fetches_only_missing_blocks() {
        let owner = KeyPair::generate();
        let db = sled::Config::new().temporary(true).open().unwrap();
        let source = Blockchain::create(db, &owner.address, ChainConfig::new(8, 100).unwrap()).unwrap();

        // The follower starts with the source's genesis
        let follower_chain = temp_chain();
        let genesis = source.get_block(&source.tip().unwrap().unwrap()).unwrap();
        follower_chain.add_external_block(&genesis).unwrap();

        let reward = Transaction::new_coinbase(&owner.address, "", 100).unwrap();
        let tip = source.append(vec![reward]).unwrap();

        let bootstrap = spawn_node(source, None).await;
        let follower = spawn_node(follower_chain.clone(), Some(bootstrap.address())).await;
        follower.announce().await.unwrap();

        let synced = wait_for(|| follower_chain.tip().unwrap() == Some(tip.hash)).await;
        assert!(synced);
    }

    #[tokio::test]
    async fn test_unreachable_peer_is_removed() {
        let dead = {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            listener.local_addr().unwrap().to_string()
        };
        let mut config = NodeConfig::new("127.0.0.1:1");
        config.bootstrap = vec![dead.clone()];
        let node = Node::new(config, temp_chain());

        assert!(node.known_peers().await.contains(&dead));
        assert!(matches!(node.announce().await, Err(Error::PeerUnreachable { .. })));
        assert!(!node.known_peers().await.contains(&dead));
    }

    #[tokio::test]
    async fn test_bad_block_abandons_sync() {
        let node = Node::new(NodeConfig::new("127.0.0.1:1"), temp_chain());
        node.in_transit
            .lock()
            .await
            .extend([Hash256::new([1; 32]), Hash256::new([2; 32])]);

        let garbage = BlockMessage {
            addr_from: "127.0.0.1:2".to_string(),
            block: vec![1, 2, 3],
        };
        assert!(node.handle_block(garbage).await.is_err());
        assert_eq!(node.blocks_in_transit().await, 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_versions_all_registered() {
        let node = spawn_node(temp_chain(), None).await;
        let target = node.address().to_string();

        // Empty chains on both sides, so the node never replies
        let senders: Vec<String> = (0..16).map(|i| format!("127.0.0.1:{}", 40000 + i)).collect();
        let tasks: Vec<_> = senders
            .iter()
            .map(|from| {
                let target = target.clone();
                let message = Message::Version(VersionMessage::new(None, from.clone()));
                tokio::spawn(async move {
                    send_message(&target, &message, Duration::from_secs(5)).await
                })
            })
            .collect();
        for task in tasks {
            task.await.unwrap().unwrap();
        }

        let mut registered = false;
        for _ in 0..200 {
            let peers = node.known_peers().await;
            if senders.iter().all(|s| peers.contains(s)) {
                // Bootstrap (itself) plus every sender, each exactly once
                assert_eq!(peers.len(), senders.len() + 1);
                registered = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        assert!(registered, "not every sender was registered");
    }

    #[tokio::test]
    async fn test_node_survives_malformed_request() {
        let node = spawn_node(temp_chain(), None).await;

        let mut stream = TcpStream::connect(node.address()).await.unwrap();
        tokio::io::AsyncWriteExt::write_all(&mut stream, b"nonsense").await.unwrap();
        drop(stream);

        let message = Message::Version(VersionMessage::new(None, "127.0.0.1:2"));
        send_message(node.address(), &message, Duration::from_secs(5)).await.unwrap();
        let registered = {
            let mut found = false;
            for _ in 0..100 {
                if node.known_peers().await.contains(&"127.0.0.1:2".to_string()) {
                    found = true;
                    break;
                }
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
            found
        };
        assert!(registered);
    }

    #[tokio::test]
    async fn test_equal_heights_do_not_reply() {
        let node = Node::new(NodeConfig::new("127.0.0.1:1"), temp_chain());
        // Both chains empty: nothing to send, so no connection is attempted
        let version = VersionMessage::new(None, "127.0.0.1:2");
        node.handle_version(version).await.unwrap();
        assert!(node.known_peers().await.contains(&"127.0.0.1:2".to_string()));
    }
}
