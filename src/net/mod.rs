//! Network transport for Cairn.

mod pipe;

pub use pipe::PeerPipe;

/// Upper bound on a single framed record. Larger frames indicate a corrupt
/// stream or a hostile peer and drop the connection.
pub const MAX_FRAME_SIZE: usize = 1024 * 1024;
