//! I/O utilities

pub mod buffer_pool;

pub use buffer_pool::{
    PacketBuffer, PacketBufferPool, PacketPoolStats, DEFAULT_POOL_CAPACITY, PACKET_BUFFER_SIZE,
};
