use std::sync::Arc;

use arc_swap::ArcSwap;
use tracing::debug;

use crate::filter::MessageFilter;

/// The set of filters offered every message, shared between workers.
///
/// Readers take a snapshot without locking; changes replace the whole list, so a message
/// already being offered keeps seeing the list it started with.
#[derive(Clone)]
pub struct FilterRegistry {
    filters: Arc<ArcSwap<Vec<Arc<dyn MessageFilter>>>>,
}

impl Default for FilterRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for FilterRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FilterRegistry").field("filters", &self.names()).finish()
    }
}

impl FilterRegistry {
    pub fn new() -> Self {
        Self { filters: Arc::new(ArcSwap::from_pointee(Vec::new())) }
    }

    /// Adds a filter after every filter registered so far.
    pub fn register<F: MessageFilter + 'static>(&self, filter: F) {
        let filter: Arc<dyn MessageFilter> = Arc::new(filter);
        debug!(name = filter.name(), "register filter");
        self.filters.rcu(|current| {
            let mut next = Vec::clone(current);
            next.push(Arc::clone(&filter));
            next
        });
    }

    /// Removes every filter named `name`, returns true if one was found.
    pub fn remove(&self, name: &str) -> bool {
        let previous = self.filters.rcu(|current| current.iter().filter(|filter| filter.name() != name).cloned().collect::<Vec<_>>());
        let removed = previous.iter().any(|filter| filter.name() == name);
        if removed {
            debug!(name, "remove filter");
        }
        removed
    }

    pub fn snapshot(&self) -> Arc<Vec<Arc<dyn MessageFilter>>> {
        self.filters.load_full()
    }

    pub fn len(&self) -> usize {
        self.filters.load().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn names(&self) -> Vec<String> {
        self.filters.load().iter().map(|filter| filter.name().to_string()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filter::FnFilter;

    #[test]
    fn register_in_order_and_remove() {
        let registry = FilterRegistry::new();
        registry.register(FnFilter::new("first", ".*", "text/.*", |_| Ok(())).unwrap());
        registry.register(FnFilter::new("second", ".*", ".*", |_| Ok(())).unwrap());
        assert_eq!(registry.names(), vec!["first", "second"]);

        let snapshot = registry.snapshot();
        assert!(registry.remove("first"));
        assert!(!registry.remove("first"));
        assert_eq!(registry.names(), vec!["second"]);
        // a snapshot taken before the change is not affected
        assert_eq!(snapshot.len(), 2);
    }
}
