//! The node model: statistics per resource, per context and per origin.

mod cluster;
mod default;
mod entrance;
mod registry;
mod resource;
mod statistic;

pub use cluster::ClusterNode;
pub use default::DefaultNode;
pub use entrance::EntranceNode;
pub use registry::DEFAULT_CONTEXT_NAME;
pub use registry::NodeRegistry;
pub use registry::TOTAL_INBOUND_NAME;
pub use resource::EntryType;
pub use resource::ResourceType;
pub use resource::ResourceWrapper;
pub use statistic::StatConfig;
pub use statistic::StatisticNode;
