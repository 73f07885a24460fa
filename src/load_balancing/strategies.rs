//! Selection policy implementations.
//!
//! Cursors and counters use atomics keyed per service in a `DashMap`; nothing
//! here takes a lock around the selection itself.

use async_trait::async_trait;
use dashmap::DashMap;
use rand::Rng;
use std::sync::atomic::{AtomicUsize, Ordering};

use crate::core::types::ServiceInstance;
use crate::load_balancing::LoadBalancer;

/// Round-robin with a per-service atomic cursor
///
/// `fetch_add` hands every caller a distinct tick; taking it modulo the
/// current snapshot length keeps the cursor safe when the list shrank since
/// the previous call.
pub struct RoundRobinBalancer {
    cursors: DashMap<String, AtomicUsize>,
}

impl RoundRobinBalancer {
    pub fn new() -> Self {
        Self {
            cursors: DashMap::new(),
        }
    }
}

impl Default for RoundRobinBalancer {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl LoadBalancer for RoundRobinBalancer {
    async fn select(&self, service: &str, instances: &[ServiceInstance]) -> Option<usize> {
        if instances.is_empty() {
            return None;
        }

        let cursor = self
            .cursors
            .entry(service.to_string())
            .or_insert_with(|| AtomicUsize::new(0));
        Some(cursor.fetch_add(1, Ordering::Relaxed) % instances.len())
    }

    fn policy_name(&self) -> &'static str {
        "round_robin"
    }
}

/// Uniform random pick
pub struct RandomBalancer;

impl RandomBalancer {
    pub fn new() -> Self {
        Self
    }
}

impl Default for RandomBalancer {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl LoadBalancer for RandomBalancer {
    async fn select(&self, _service: &str, instances: &[ServiceInstance]) -> Option<usize> {
        if instances.is_empty() {
            return None;
        }
        Some(rand::thread_rng().gen_range(0..instances.len()))
    }

    fn policy_name(&self) -> &'static str {
        "random"
    }
}

/// Weighted random pick proportional to the `weight` metadata field
pub struct WeightedBalancer;

impl WeightedBalancer {
    pub fn new() -> Self {
        Self
    }
}

impl Default for WeightedBalancer {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl LoadBalancer for WeightedBalancer {
    async fn select(&self, _service: &str, instances: &[ServiceInstance]) -> Option<usize> {
        if instances.is_empty() {
            return None;
        }

        // Weights default to 1, so the total is always positive. Summed in
        // u64 so a pool of near-u32::MAX weights cannot overflow.
        let total_weight: u64 = instances
            .iter()
            .map(|i| u64::from(i.weight().max(1)))
            .sum();
        let mut remaining = rand::thread_rng().gen_range(0..total_weight);

        for (index, instance) in instances.iter().enumerate() {
            let weight = u64::from(instance.weight().max(1));
            if remaining < weight {
                return Some(index);
            }
            remaining -= weight;
        }

        // Unreachable with the invariant above, but stay total.
        Some(instances.len() - 1)
    }

    fn policy_name(&self) -> &'static str {
        "weighted"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn instances(n: usize) -> Vec<ServiceInstance> {
        (0..n)
            .map(|i| {
                ServiceInstance::new("license", "127.0.0.1", 8000 + i as u16)
                    .with_id(format!("i-{}", i))
            })
            .collect()
    }

    #[tokio::test]
    async fn test_round_robin_visits_each_once_per_cycle() {
        let balancer = RoundRobinBalancer::new();

        for k in 1..=5 {
            let pool = instances(k);
            let mut seen = vec![0usize; k];
            for _ in 0..k {
                let index = balancer.select("svc", &pool).await.unwrap();
                seen[index] += 1;
            }
            assert!(
                seen.iter().all(|&count| count == 1),
                "k={}: expected each instance exactly once, got {:?}",
                k,
                seen
            );
        }
    }

    #[tokio::test]
    async fn test_round_robin_cursors_are_per_service() {
        let balancer = RoundRobinBalancer::new();
        let pool = instances(3);

        let a = balancer.select("a", &pool).await.unwrap();
        let b = balancer.select("b", &pool).await.unwrap();

        // A fresh service starts at the head regardless of other services.
        assert_eq!(a, 0);
        assert_eq!(b, 0);
    }

    #[tokio::test]
    async fn test_round_robin_wraps_when_list_shrinks() {
        let balancer = RoundRobinBalancer::new();
        let big = instances(5);

        for _ in 0..4 {
            balancer.select("svc", &big).await.unwrap();
        }

        // Cursor is at 4; a shrunken list must still yield a valid index.
        let small = instances(2);
        let index = balancer.select("svc", &small).await.unwrap();
        assert!(index < small.len());
    }

    #[tokio::test]
    async fn test_random_stays_in_bounds() {
        let balancer = RandomBalancer::new();
        let pool = instances(3);

        for _ in 0..100 {
            let index = balancer.select("svc", &pool).await.unwrap();
            assert!(index < pool.len());
        }
    }

    #[tokio::test]
    async fn test_empty_pool_yields_none() {
        assert!(RoundRobinBalancer::new().select("svc", &[]).await.is_none());
        assert!(RandomBalancer::new().select("svc", &[]).await.is_none());
        assert!(WeightedBalancer::new().select("svc", &[]).await.is_none());
    }

    #[tokio::test]
    async fn test_weighted_prefers_heavier_instances() {
        let balancer = WeightedBalancer::new();
        let pool = vec![
            ServiceInstance::new("license", "127.0.0.1", 8000)
                .with_id("light")
                .with_metadata("weight", "1"),
            ServiceInstance::new("license", "127.0.0.1", 8001)
                .with_id("heavy")
                .with_metadata("weight", "9"),
        ];

        let mut counts: HashMap<usize, usize> = HashMap::new();
        for _ in 0..1000 {
            let index = balancer.select("svc", &pool).await.unwrap();
            *counts.entry(index).or_default() += 1;
        }

        let heavy = counts.get(&1).copied().unwrap_or(0);
        // With a 9:1 ratio the heavy instance should dominate clearly.
        assert!(heavy > 700, "heavy instance picked only {} times", heavy);
    }

    #[tokio::test]
    async fn test_weighted_survives_extreme_weights() {
        let balancer = WeightedBalancer::new();
        let max = u32::MAX.to_string();
        let pool = vec![
            ServiceInstance::new("license", "127.0.0.1", 8000)
                .with_id("a")
                .with_metadata("weight", max.as_str()),
            ServiceInstance::new("license", "127.0.0.1", 8001)
                .with_id("b")
                .with_metadata("weight", max.as_str()),
        ];

        // The weight total exceeds u32::MAX; selection must not panic and
        // must stay in bounds.
        for _ in 0..100 {
            let index = balancer.select("svc", &pool).await.unwrap();
            assert!(index < pool.len());
        }
    }
}
