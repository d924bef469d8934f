//! Read-optimized streaming layout for remote delivery
//!
//! Node headers are packed into group files so a client fetches a subtree
//! neighbourhood in one request; a master file carries the index header and
//! the catalog of groups; each node's points live in their own file. The
//! same layout is served from a directory, a plain HTTP endpoint or a cloud
//! blob container.

mod catalog;
mod config;
mod group;
mod store;
mod transport;

pub use catalog::Catalog;
pub use config::{Auth, GroupingConfig, StreamingConfig, TransportConfig};
pub use group::NodeGroup;
pub use store::StreamingGroupStore;
#[cfg(feature = "http")]
pub use transport::HttpTransport;
pub use transport::{connect, group_key, points_key, FileTransport, Transport, MASTER_KEY};
