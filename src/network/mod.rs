// P2P block synchronization

mod message;
mod node;
mod peer;

pub use message::{
    BlockMessage, COMMAND_LENGTH, GetBlocksMessage, GetDataMessage, InvMessage, InvType, Message,
    MessageType, PROTOCOL_VERSION, VersionMessage, bytes_to_command, command_to_bytes,
};
pub use node::Node;
pub use peer::{PeerRegistry, read_message, send_message};
