use std::time::Duration;

pub mod directory;
pub mod error;
pub mod lock;
pub mod log;
pub mod message;
pub mod peer;
pub mod peer_list;
pub mod poisson;
pub mod server;
pub mod stub;

pub use error::{Error, Result};
pub use lock::{DistributedLock, LockState, LockStatus};
pub use message::{Address, PeerId};
pub use peer::{Peer, PeerConfig};
pub use peer_list::PeerList;
pub use stub::Stub;

pub const RATE: f64 = 1.;

/// How long the name server waits for a `check()` answer before dropping a peer.
pub const CHECK_TIMEOUT: Duration = Duration::from_secs(5);

pub const DEFAULT_TYPE: &str = "token-mutex";
pub const DEFAULT_NAME_SERVER: &str = "127.0.0.1:40000";
