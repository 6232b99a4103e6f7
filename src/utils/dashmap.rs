use dashmap::DashMap;
use std::hash::Hash;

/// Creates a DashMap sized off the worker count instead of CPU detection,
/// which is unreliable inside containers.
pub fn new_dashmap<K, V>(workers: usize) -> DashMap<K, V>
where
    K: Eq + Hash,
{
    DashMap::with_shard_amount(optimal_shard_count(workers))
}

/// Power-of-two shard count: at least 4, at most workers * 4.
fn optimal_shard_count(workers: usize) -> usize {
    (workers * 4).max(4).next_power_of_two()
}
