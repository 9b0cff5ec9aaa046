pub mod codec;
pub mod decode;
pub mod decompress;
pub mod encode;
pub mod head;

pub use codec::{ChunkResult, TransferCoding};
