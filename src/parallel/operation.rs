//! Generic pool of proxies
//!
//! Keeps exactly `parallel_level` proxies created by an injected factory and
//! broadcasts actions (initialize, abort, cancel, close) across them. The
//! proxy list is only mutated under the pool lock, by resizing and by
//! replacement of unusable proxies.

use futures::future::join_all;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::client::ProxyLifecycle;
use crate::error::{OrchestratorError, Result};

pub type ProxyFactory<T> = Arc<dyn Fn() -> Arc<T> + Send + Sync>;

pub struct ParallelOperationManager<T: ?Sized + ProxyLifecycle + 'static> {
    factory: ProxyFactory<T>,
    shared_hosts: bool,
    managers: Mutex<Vec<Arc<T>>>,
}

fn same_proxy<T: ?Sized>(a: &Arc<T>, b: &Arc<T>) -> bool {
    Arc::as_ptr(a) as *const () == Arc::as_ptr(b) as *const ()
}

impl<T: ?Sized + ProxyLifecycle + 'static> ParallelOperationManager<T> {
    /// Create the pool and its first `parallel_level` proxies (at least one)
    pub fn new(factory: ProxyFactory<T>, parallel_level: usize, shared_hosts: bool) -> Self {
        let level = parallel_level.max(1);
        let managers = (0..level).map(|_| factory()).collect();
        debug!("Created pool of {} proxies (shared: {})", level, shared_hosts);
        Self {
            factory,
            shared_hosts,
            managers: Mutex::new(managers),
        }
    }

    pub fn shared_hosts(&self) -> bool {
        self.shared_hosts
    }

    pub async fn parallel_level(&self) -> usize {
        self.managers.lock().await.len()
    }

    /// Snapshot of the live proxies
    pub async fn managers(&self) -> Vec<Arc<T>> {
        self.managers.lock().await.clone()
    }

    pub async fn contains(&self, manager: &Arc<T>) -> bool {
        self.managers
            .lock()
            .await
            .iter()
            .any(|m| same_proxy(m, manager))
    }

    /// Grow through the factory or shrink by closing the removed proxies
    pub async fn update_parallel_level(&self, new_level: usize) {
        let new_level = new_level.max(1);
        let removed = {
            let mut managers = self.managers.lock().await;
            let current = managers.len();
            if new_level > current {
                managers.extend((current..new_level).map(|_| (self.factory)()));
                Vec::new()
            } else {
                managers.split_off(new_level)
            }
        };

        if !removed.is_empty() {
            info!("Shrinking pool by {} proxies", removed.len());
        }
        for manager in removed {
            manager.close().await;
        }
    }

    /// Run `action` on every proxy, collecting all errors after every action ran
    pub async fn do_action_on_all_managers<F, Fut>(&self, action: F, run_in_parallel: bool) -> Result<()>
    where
        F: Fn(Arc<T>) -> Fut + Clone + Send + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        let managers = self.managers().await;
        let mut errors = Vec::new();

        if run_in_parallel {
            let handles: Vec<_> = managers
                .into_iter()
                .map(|manager| tokio::spawn(action.clone()(manager)))
                .collect();
            for joined in join_all(handles).await {
                match joined {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => errors.push(e),
                    Err(e) => errors.push(OrchestratorError::InvalidState(format!(
                        "Proxy action panicked: {e}"
                    ))),
                }
            }
        } else {
            for manager in managers {
                if let Err(e) = action(manager).await {
                    errors.push(e);
                }
            }
        }

        OrchestratorError::from_errors(errors)
    }

    /// Run `action` against one designated proxy
    pub async fn do_action_on_concurrent_manager<F, Fut>(&self, manager: Arc<T>, action: F) -> Result<()>
    where
        F: FnOnce(Arc<T>) -> Fut,
        Fut: Future<Output = Result<()>>,
    {
        action(manager).await
    }

    /// Swap `old` for a fresh proxy; `None` if `old` is no longer pooled
    pub async fn replace_manager(&self, old: &Arc<T>) -> Option<Arc<T>> {
        let replacement = {
            let mut managers = self.managers.lock().await;
            let slot = managers.iter().position(|m| same_proxy(m, old))?;
            let replacement = (self.factory)();
            managers[slot] = Arc::clone(&replacement);
            replacement
        };
        old.close().await;
        Some(replacement)
    }

    /// Close every proxy and empty the pool
    pub async fn dispose(&self) {
        let managers = std::mem::take(&mut *self.managers.lock().await);
        for manager in managers {
            manager.close().await;
        }
    }
}
