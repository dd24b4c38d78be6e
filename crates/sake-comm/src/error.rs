//! Error types for collective communication.

use thiserror::Error;

/// Errors raised by a [`Communicator`](crate::Communicator) backend.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum CommError {
    /// Socket or stream failure, with the peer it concerned.
    #[error("IO error talking to {peer}: {source}")]
    Io {
        peer: String,
        #[source]
        source: std::io::Error,
    },

    /// A peer answered the rendezvous with an unexpected rank.
    #[error("Handshake failed: expected rank {expected}, got {actual}")]
    Handshake { expected: usize, actual: usize },

    /// Malformed frame on the wire.
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// The other end of a ring link went away.
    #[error("Peer disconnected: {0}")]
    Disconnected(String),

    /// Rank outside `0..world_size`, or an empty peer list.
    #[error("Invalid rank {rank} for world size {world_size}")]
    InvalidRank { rank: usize, world_size: usize },

    /// Rendezvous did not complete in time.
    #[error("Timed out after {secs}s waiting for {context}")]
    Timeout { secs: u64, context: String },
}

pub type CommResult<T> = std::result::Result<T, CommError>;

/// Attach a peer label to IO failures.
pub(crate) trait IoPeerExt<T> {
    fn with_peer(self, peer: impl std::fmt::Display) -> CommResult<T>;
}

impl<T> IoPeerExt<T> for std::io::Result<T> {
    fn with_peer(self, peer: impl std::fmt::Display) -> CommResult<T> {
        self.map_err(|source| CommError::Io {
            peer: peer.to_string(),
            source,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_io_error_carries_peer() {
        let result: std::io::Result<()> = Err(std::io::Error::new(
            std::io::ErrorKind::ConnectionRefused,
            "refused",
        ));
        match result.with_peer("127.0.0.1:29500") {
            Err(CommError::Io { peer, .. }) => assert_eq!(peer, "127.0.0.1:29500"),
            other => panic!("Expected Io error, got {:?}", other),
        }
    }

    #[test]
    fn test_error_messages() {
        let err = CommError::Handshake {
            expected: 1,
            actual: 3,
        };
        assert_eq!(err.to_string(), "Handshake failed: expected rank 1, got 3");

        let err = CommError::InvalidRank {
            rank: 4,
            world_size: 2,
        };
        assert!(err.to_string().contains("world size 2"));
    }
}
