//! Core render-farm dispatch model: the entity model, the dispatch tree,
//! the render-node lifecycle, the fair-share scheduler, the assignment
//! transport, the ingress queue, and the tick loop that ties them
//! together. No I/O surface of its own beyond outbound assignment
//! delivery -- `dispatch-db` implements [`persistence::Persistence`]
//! against Postgres, `dispatch-cli` hosts the HTTP surface and wires
//! everything together at startup.

pub mod config;
pub mod error;
pub mod ingress;
pub mod loop_driver;
pub mod model;
pub mod persistence;
pub mod rn_lifecycle;
pub mod scheduler;
pub mod transport;
pub mod tree;

pub use config::DispatchConfig;
pub use error::{DispatchError, TransportError};
pub use loop_driver::DispatchLoop;
pub use persistence::{Persistence, PersistedState};
pub use tree::DispatchTree;
