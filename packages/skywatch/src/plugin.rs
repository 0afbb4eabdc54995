use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use skywatch_sync::SyncContext;
use tokio::task::JoinHandle;
use tracing::{info, warn};

/// A feature loaded into the host. Plugins only see the shared context.
#[async_trait]
pub trait Plugin: Send + Sync {
    fn name(&self) -> &str;

    async fn start(&self, ctx: Arc<SyncContext>) -> Result<PluginHandle>;
}

/// What a running plugin holds on to: its background tasks, aborted on
/// shutdown. Feeds run as supervised subscriptions, so a plugin counts as
/// running even while the backend is unreachable.
#[derive(Default)]
pub struct PluginHandle {
    tasks: Vec<JoinHandle<()>>,
}

impl PluginHandle {
    pub fn with_task(mut self, task: JoinHandle<()>) -> Self {
        self.tasks.push(task);
        self
    }

    pub fn task_count(&self) -> usize {
        self.tasks.len()
    }

    pub fn shutdown(self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

/// Statically registered plugins, started in registration order.
#[derive(Default)]
pub struct PluginRegistry {
    plugins: Vec<Arc<dyn Plugin>>,
}

impl PluginRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, plugin: Arc<dyn Plugin>) {
        if self.plugins.iter().any(|p| p.name() == plugin.name()) {
            warn!(plugin = plugin.name(), "plugin already registered, ignoring");
            return;
        }
        self.plugins.push(plugin);
    }

    pub fn names(&self) -> Vec<String> {
        self.plugins.iter().map(|p| p.name().to_string()).collect()
    }

    pub fn len(&self) -> usize {
        self.plugins.len()
    }

    pub fn is_empty(&self) -> bool {
        self.plugins.is_empty()
    }

    /// Start every plugin once. A plugin that fails to start is logged and
    /// skipped; the others keep running.
    pub async fn start_all(&self, ctx: Arc<SyncContext>) -> Vec<(String, PluginHandle)> {
        let mut running = Vec::with_capacity(self.plugins.len());
        for plugin in &self.plugins {
            match plugin.start(ctx.clone()).await {
                Ok(handle) => {
                    info!(plugin = plugin.name(), tasks = handle.task_count(), "plugin started");
                    running.push((plugin.name().to_string(), handle));
                }
                Err(e) => warn!(plugin = plugin.name(), error = %e, "plugin failed to start"),
            }
        }
        running
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::test_context;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Counting {
        name: &'static str,
        fail: bool,
        starts: AtomicUsize,
    }

    impl Counting {
        fn new(name: &'static str, fail: bool) -> Arc<Self> {
            Arc::new(Self {
                name,
                fail,
                starts: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl Plugin for Counting {
        fn name(&self) -> &str {
            self.name
        }

        async fn start(&self, _ctx: Arc<SyncContext>) -> Result<PluginHandle> {
            self.starts.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                anyhow::bail!("{} refused to start", self.name);
            }
            Ok(PluginHandle::default().with_task(tokio::spawn(async {})))
        }
    }

    #[test]
    fn duplicate_names_are_ignored() {
        let mut registry = PluginRegistry::new();
        registry.register(Counting::new("aircraft", false));
        registry.register(Counting::new("aircraft", false));
        assert_eq!(registry.names(), vec!["aircraft".to_string()]);
    }

    #[tokio::test]
    async fn start_all_skips_failures() {
        let ok = Counting::new("aircraft", false);
        let broken = Counting::new("vessels", true);
        let mut registry = PluginRegistry::new();
        registry.register(broken.clone());
        registry.register(ok.clone());

        let running = registry.start_all(test_context()).await;

        assert_eq!(running.len(), 1);
        assert_eq!(running[0].0, "aircraft");
        assert_eq!(running[0].1.task_count(), 1);
        assert_eq!(ok.starts.load(Ordering::SeqCst), 1);
        assert_eq!(broken.starts.load(Ordering::SeqCst), 1);
        for (_, handle) in running {
            handle.shutdown();
        }
    }
}
