mod feed;

use std::sync::Arc;

pub use feed::FeedPlugin;

use crate::config::PluginsFileConfig;
use crate::plugin::PluginRegistry;

/// Plugins compiled into the host, filtered by `[plugins]`.
pub fn builtin(config: &PluginsFileConfig) -> PluginRegistry {
    let mut registry = PluginRegistry::new();
    if config.aircraft {
        registry.register(Arc::new(FeedPlugin::new("aircraft", &config.follow)));
    }
    if config.vessels {
        registry.register(Arc::new(FeedPlugin::new("vessels", &config.follow)));
    }
    registry
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::test_context;

    #[test]
    fn test_builtin_respects_toggles() {
        let all = builtin(&PluginsFileConfig::default());
        assert_eq!(all.names(), vec!["aircraft", "vessels"]);

        let vessels_only = builtin(&PluginsFileConfig {
            aircraft: false,
            ..Default::default()
        });
        assert_eq!(vessels_only.names(), vec!["vessels"]);

        let none = builtin(&PluginsFileConfig {
            aircraft: false,
            vessels: false,
            follow: Vec::new(),
        });
        assert!(none.is_empty());
    }

    #[tokio::test]
    async fn test_feeds_start_without_a_backend() {
        let registry = builtin(&PluginsFileConfig::default());
        let running = registry.start_all(test_context()).await;

        let names: Vec<&str> = running.iter().map(|(name, _)| name.as_str()).collect();
        assert_eq!(names, vec!["aircraft", "vessels"]);
        for (_, handle) in running {
            assert_eq!(handle.task_count(), 4);
            handle.shutdown();
        }
    }
}
