use parking_lot::RwLock;
use rand::seq::SliceRandom;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use url::Url;

/// The collector endpoints a client rotates through.
///
/// The list is immutable once installed and replaced wholesale. The error
/// counter only grows between installs; `list[count % len]` is the endpoint
/// currently in use.
#[derive(Debug, Default)]
pub struct EndpointRegistry {
    endpoints: RwLock<Arc<Vec<Url>>>,
    error_count: AtomicUsize,
}

impl EndpointRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Shuffles and installs `urls`, resetting the error counter.
    pub fn set_endpoints(&self, mut urls: Vec<Url>) {
        urls.shuffle(&mut rand::rng());
        self.install(urls);
    }

    /// Installs `urls` in the given order.
    pub fn set_endpoints_ordered(&self, urls: Vec<Url>) {
        self.install(urls);
    }

    fn install(&self, urls: Vec<Url>) {
        let mut endpoints = self.endpoints.write();
        *endpoints = Arc::new(urls);
        self.error_count.store(0, Ordering::Release);
    }

    pub fn endpoints(&self) -> Arc<Vec<Url>> {
        self.endpoints.read().clone()
    }

    pub fn len(&self) -> usize {
        self.endpoints.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn error_count(&self) -> usize {
        self.error_count.load(Ordering::Acquire)
    }

    pub fn current_endpoint(&self) -> Option<Url> {
        let endpoints = self.endpoints();
        if endpoints.is_empty() {
            return None;
        }
        let index = self.error_count() % endpoints.len();
        Some(endpoints[index].clone())
    }

    /// A copy of the list rotated so that the current endpoint comes first.
    pub fn prioritized_list(&self) -> Vec<Url> {
        let endpoints = self.endpoints();
        let mut list = endpoints.as_ref().clone();
        if !list.is_empty() {
            let shift = self.error_count() % list.len();
            // Left, not right: the head must be the endpoint `current_endpoint`
            // returns, with the failed ones moved to the back.
            list.rotate_left(shift);
        }
        list
    }

    /// Moves on to the next endpoint if nobody else already did.
    ///
    /// Returns the new count, or `None` when the counter no longer equals
    /// `expected` because another caller advanced it first.
    pub fn increment_error_count(&self, expected: usize) -> Option<usize> {
        let next = expected.wrapping_add(1);
        self.error_count
            .compare_exchange(expected, next, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| next)
    }

    /// Unconditional rotation, used by the streaming dispatcher.
    pub fn on_connection_error(&self) -> usize {
        let count = self.error_count.fetch_add(1, Ordering::AcqRel) + 1;
        if let Some(next) = self.current_endpoint() {
            tracing::debug!("Switching to next collector endpoint: {}", next);
        }
        count
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn urls(names: &[&str]) -> Vec<Url> {
        names
            .iter()
            .map(|name| Url::parse(&format!("http://{name}:8200/")).unwrap())
            .collect()
    }

    #[test]
    fn test_empty_registry_has_no_endpoint() {
        let registry = EndpointRegistry::new();
        assert!(registry.current_endpoint().is_none());
        assert!(registry.prioritized_list().is_empty());
    }

    #[test]
    fn test_set_endpoints_is_a_permutation() {
        let registry = EndpointRegistry::new();
        let input = urls(&["a", "b", "c", "d"]);
        registry.set_endpoints(input.clone());

        let mut installed = registry.endpoints().as_ref().clone();
        let mut expected = input;
        installed.sort();
        expected.sort();
        assert_eq!(installed, expected);
    }

    #[test]
    fn test_prioritized_list_starts_with_current() {
        let registry = EndpointRegistry::new();
        registry.set_endpoints_ordered(urls(&["a", "b", "c"]));
        registry.on_connection_error();

        assert_eq!(registry.current_endpoint(), Some(urls(&["b"])[0].clone()));
        assert_eq!(registry.prioritized_list(), urls(&["b", "c", "a"]));
    }

    #[test]
    fn test_prioritized_list_head_tracks_current_across_wraparound() {
        let registry = EndpointRegistry::new();
        registry.set_endpoints_ordered(urls(&["a", "b", "c", "d"]));

        for _ in 0..9 {
            let list = registry.prioritized_list();
            assert_eq!(list.first(), registry.current_endpoint().as_ref());
            assert_eq!(list.len(), 4);
            registry.on_connection_error();
        }
        // Nine failures over four endpoints: "b" is current, "a" is tried last.
        assert_eq!(registry.prioritized_list(), urls(&["b", "c", "d", "a"]));
    }

    #[test]
    fn test_increment_error_count_sentinel() {
        let registry = EndpointRegistry::new();
        registry.set_endpoints_ordered(urls(&["a", "b"]));

        assert_eq!(registry.increment_error_count(0), Some(1));
        // A stale expectation does not count twice.
        assert_eq!(registry.increment_error_count(0), None);
        assert_eq!(registry.error_count(), 1);
    }

    #[test]
    fn test_reinstall_resets_counter() {
        let registry = EndpointRegistry::new();
        registry.set_endpoints_ordered(urls(&["a", "b"]));
        registry.on_connection_error();
        registry.set_endpoints_ordered(urls(&["c", "d"]));

        assert_eq!(registry.error_count(), 0);
        assert_eq!(registry.current_endpoint(), Some(urls(&["c"])[0].clone()));
    }

    #[test]
    fn test_rotation_is_fair() {
        let registry = EndpointRegistry::new();
        registry.set_endpoints_ordered(urls(&["a", "b", "c"]));

        let mut seen: HashMap<Url, usize> = HashMap::new();
        for _ in 0..9 {
            let current = registry.current_endpoint().unwrap();
            *seen.entry(current).or_default() += 1;
            registry.on_connection_error();
        }
        assert_eq!(seen.len(), 3);
        assert!(seen.values().all(|&count| count == 3));
    }
}
