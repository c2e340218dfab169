//! Controller-side proxies
//!
//! One proxy drives one test host through a discovery or execution request
//! and translates protocol messages into caller events.

pub mod discovery;
pub mod execution;
pub mod in_process;
pub mod proxy;

pub use discovery::{ProxyDiscoveryManager, TestHostProxyDiscoveryManager};
pub use execution::{ProxyExecutionManager, TestHostProxyExecutionManager};
pub use in_process::{ExecutionEngine, InProcessProxyExecutionManager};
pub use proxy::{ProxyLifecycle, ProxyOperationManager, ProxyState, TransportFactory, WorkerChannel};
