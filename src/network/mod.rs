pub mod cipher;
pub mod codec;
pub mod dns;
pub mod memory;
pub mod tcp;
pub mod transport;

pub use cipher::FrameCipher;
pub use codec::{MessageCodec, NetworkMessage};
pub use dns::DnsCache;
pub use memory::{MemoryNetwork, MemoryTransport};
pub use tcp::{TcpSettings, TcpTransport};
pub use transport::{InboundMessage, Transport};
