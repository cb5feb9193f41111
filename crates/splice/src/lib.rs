//! Bidirectional framed message transport for a cluster control plane:
//! tree-structured transactions multiplexed over one byte-stream socket,
//! driven by CREATE/DELETE/REPLY/ABORT header flags, with link failures
//! cascading through nested sub-transactions as synthesized DELETEs.

pub mod crypto;
mod error;
mod iocom;
mod ioq;
mod msg;
mod relay;
mod state;
pub mod wire;

pub use error::IoqError;
pub use iocom::{Iocom, IocomBuilder, IocomFlags, IocomHandle, IocomHandler, IocomStats};
pub use ioq::{IOQ_BUF_SIZE, IoqBuf, MAX_IOVEC};
pub use msg::Msg;
pub use state::{ROOT_ID, StateId};
pub use tracing;
