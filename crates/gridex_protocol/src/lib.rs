//! Wire protocol for Coordinator <-> Worker communication.
//!
//! # Frame format
//!
//! Every message is one frame on a TCP stream:
//!
//! ```text
//! [LEN:10][BODY:LEN]
//! ```
//!
//! - LEN: exactly 10 ASCII decimal digits, zero-padded, giving the body
//!   length in bytes (e.g. `0000000042`)
//! - BODY: LEN bytes of a single JSON object with a `type` discriminator
//!
//! The codec is symmetric; coordinator and worker both use it. Bodies are
//! bounded by a configured maximum to protect the receiving side; an
//! over-size frame terminates the session.

pub mod codec;
pub mod config;
pub mod defaults;
pub mod error;
pub mod types;

pub use codec::{FrameReader, FrameWriter, LENGTH_HEADER_BYTES};
pub use config::{CoordinatorConfig, SettlePolicy, WorkerConfig};
pub use error::CodecError;

// Re-export types for convenience
pub use types::{
    ArtifactFile,
    CoordinatorMessage,
    DemandError,
    JobDemands,
    JobId,
    JobOutcome,
    JobStatus,
    Role,
    WorkerId,
    WorkerMessage,
    WorkerSpecs,
    WorkerStatus,
};
