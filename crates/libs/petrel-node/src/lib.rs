//! The bundle node core: a single-writer daemon serialized over an event
//! queue, surrounded by I/O actors (one per convergence-layer adapter, one
//! per API session, one timer actor). All bundle, link, and registration
//! state transitions funnel through the daemon loop; actors only produce
//! events and touch lock-protected queues.

pub mod cla;
pub mod config;
pub mod contacts;
pub mod custody;
pub mod daemon;
pub mod error;
pub mod event;
pub mod fragment;
pub mod reg;
pub mod router;
pub mod storage;

pub use config::NodeConfig;
pub use contacts::{ContactManager, Link, LinkParams, LinkRef, LinkState};
pub use daemon::{BundleDaemon, DaemonHandle, DaemonStats};
pub use error::NodeError;
pub use event::{BundleEvent, ContactDownReason, EventSource};
pub use reg::{FailureAction, Registration, RegistrationTable};
pub use router::{Router, RouterAction, StaticRouter};
