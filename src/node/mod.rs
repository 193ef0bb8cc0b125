//! Node data source: the capability contract the control loop consumes,
//! plus the lnd-manage REST implementation.

mod client;
mod snapshot;

pub use client::{LndManageClient, NodeClient};
pub use snapshot::{ChannelSnapshot, FeeUpdate};
