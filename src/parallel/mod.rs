//! Parallel orchestration over pools of proxies

pub mod aggregator;
pub mod discovery;
pub mod execution;
pub mod operation;
mod request;
pub mod work;

pub use aggregator::{DiscoveryDataAggregator, RunDataAggregator};
pub use discovery::ParallelProxyDiscoveryManager;
pub use execution::ParallelProxyExecutionManager;
pub use operation::{ParallelOperationManager, ProxyFactory};
pub use work::{WorkItem, WorkQueue};
