pub mod classifier;
pub mod config;
pub mod controller;
pub mod error;
pub mod filters;
pub mod fuzzy;
pub mod logging;
pub mod mempool;
pub mod message;
pub mod protocol;
pub mod resolver;
pub mod savepoint;
pub mod session;
pub mod statfile;
pub mod stats;
pub mod supervisor;
pub mod task;
pub mod worker;

pub use config::Config;
pub use error::{AuthError, ClassifierError, DecodeError, ProtocolError, StatfileError, TaskError};
pub use filters::{Filter, FilterRegistry, ScanContext};
pub use mempool::MemPool;
pub use session::AsyncSession;
pub use statfile::{Statfile, StatfilePool};
