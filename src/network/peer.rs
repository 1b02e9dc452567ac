// Peer registry and one-shot message transport

use crate::error::{Error, Result};
use crate::network::Message;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::RwLock;
use tokio::time::timeout;

/// Addresses of known peers.
/// Each operation takes the lock for its own duration only.
#[derive(Debug, Default)]
pub struct PeerRegistry {
    peers: RwLock<Vec<String>>,
}

impl PeerRegistry {
    pub fn new(initial: impl IntoIterator<Item = String>) -> Self {
        let mut peers = Vec::new();
        for addr in initial {
            if !peers.contains(&addr) {
                peers.push(addr);
            }
        }
        Self {
            peers: RwLock::new(peers),
        }
    }

    /// Register `addr`; returns `false` if it was already known
    pub async fn add(&self, addr: &str) -> bool {
        let mut peers = self.peers.write().await;
        if peers.iter().any(|p| p == addr) {
            return false;
        }
        peers.push(addr.to_string());
        log::info!("Registered peer {} ({} known)", addr, peers.len());
        true
    }

    pub async fn remove(&self, addr: &str) -> bool {
        let mut peers = self.peers.write().await;
        let before = peers.len();
        peers.retain(|p| p != addr);
        before != peers.len()
    }

    pub async fn contains(&self, addr: &str) -> bool {
        self.peers.read().await.iter().any(|p| p == addr)
    }

    pub async fn list(&self) -> Vec<String> {
        self.peers.read().await.clone()
    }

    pub async fn len(&self) -> usize {
        self.peers.read().await.len()
    }
}

/// Connect to `addr`, write one message and close the write side
pub async fn send_message(addr: &str, message: &Message, io_timeout: Duration) -> Result<()> {
    let peer_error = |reason: String| Error::PeerUnreachable {
        addr: addr.to_string(),
        reason,
    };

    let mut stream = timeout(io_timeout, TcpStream::connect(addr))
        .await
        .map_err(|_| peer_error("connect timed out".to_string()))?
        .map_err(|e| peer_error(e.to_string()))?;

    let data = message.serialize();
    timeout(io_timeout, async {
        stream.write_all(&data).await?;
        stream.shutdown().await?;
        Ok::<_, std::io::Error>(())
    })
    .await
    .map_err(|_| peer_error("write timed out".to_string()))?
    .map_err(|e| peer_error(e.to_string()))?;

    log::debug!("Sent {} ({} bytes) to {}", message.message_type(), data.len(), addr);
    Ok(())
}

/// Read one whole message until the sender closes its side
pub async fn read_message<R>(reader: R, max_size: usize, io_timeout: Duration) -> Result<Message>
where
    R: AsyncRead + Unpin,
{
    let mut data = Vec::new();
    let mut limited = reader.take(max_size as u64 + 1);

    timeout(io_timeout, limited.read_to_end(&mut data))
        .await
        .map_err(|_| Error::Protocol("Timed out reading request".to_string()))??;

    if data.len() > max_size {
        return Err(Error::Protocol(format!(
            "Request exceeds {} bytes",
            max_size
        )));
    }

    Message::deserialize(&data)
}
