//! Slave selection for the read/write-split router.
//!
//! Candidates are filtered to the session's locked rank tier and the
//! configured replication-lag bound, then one is picked by the service's
//! selection criterion.

use std::collections::HashMap;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use rand::Rng;

use crate::config::SlaveSelectionCriteria;
use crate::server::Server;

/// Per-router connection counts, for LEAST_ROUTER_CONNECTIONS
pub type RouterConnections = HashMap<String, usize>;

/// Pick a slave among `candidates`.
///
/// `locked_rank` is the rank tier the session committed to at first
/// selection; servers in other tiers are invisible to it. `max_rlag` < 0
/// means unlimited.
pub fn select_slave(
    candidates: &[Arc<Server>],
    criteria: SlaveSelectionCriteria,
    max_rlag: i64,
    locked_rank: Option<i32>,
    router_connections: &RouterConnections,
) -> Option<Arc<Server>> {
    let eligible: Vec<&Arc<Server>> = candidates
        .iter()
        .filter(|s| s.is_slave() && s.is_usable())
        .filter(|s| max_rlag < 0 || (s.replication_lag() >= 0 && s.replication_lag() <= max_rlag))
        .collect();

    if eligible.is_empty() {
        return None;
    }

    // Lock to a rank tier: the session's existing one, or the best
    // available
    let rank = locked_rank.unwrap_or_else(|| {
        eligible
            .iter()
            .map(|s| s.rank())
            .min()
            .unwrap_or(crate::server::RANK_PRIMARY)
    });
    let tier: Vec<&Arc<Server>> = eligible.into_iter().filter(|s| s.rank() == rank).collect();
    if tier.is_empty() {
        return None;
    }

    match criteria {
        SlaveSelectionCriteria::LeastGlobalConnections => tier
            .into_iter()
            .min_by_key(|s| s.stats.connections.load(Ordering::Relaxed))
            .cloned(),
        SlaveSelectionCriteria::LeastRouterConnections => tier
            .into_iter()
            .min_by_key(|s| router_connections.get(&s.name).copied().unwrap_or(0))
            .cloned(),
        SlaveSelectionCriteria::LeastBehindMaster => tier
            .into_iter()
            .min_by_key(|s| s.replication_lag().max(0))
            .cloned(),
        SlaveSelectionCriteria::LeastCurrentOperations => tier
            .into_iter()
            .min_by_key(|s| s.stats.current_ops.load(Ordering::Relaxed))
            .cloned(),
        SlaveSelectionCriteria::Adaptive => {
            let avgs: Vec<f64> = tier.iter().map(|s| s.response_time.average_us()).collect();
            let weights = adaptive_weights(&avgs);
            let roll: f64 = rand::thread_rng().gen();
            let mut acc = 0.0;
            for (i, w) in weights.iter().enumerate() {
                acc += w;
                if roll < acc {
                    return Some(tier[i].clone());
                }
            }
            tier.last().map(|s| (*s).clone())
        }
    }
}

/// Adaptive roulette weights: inverse cubed average response times,
/// renormalised so every slave keeps at least 1/197 of the wheel.
pub fn adaptive_weights(average_response_us: &[f64]) -> Vec<f64> {
    const MIN_SHARE: f64 = 1.0 / 197.0;

    if average_response_us.is_empty() {
        return vec![];
    }

    // A server with no samples yet competes as if it were fast
    let raw: Vec<f64> = average_response_us
        .iter()
        .map(|&avg| {
            let avg = if avg <= 0.0 { 1.0 } else { avg };
            1.0 / (avg * avg * avg)
        })
        .collect();

    let total: f64 = raw.iter().sum();
    let mut weights: Vec<f64> = raw.iter().map(|w| w / total).collect();

    // Clamp up to the floor, then renormalise
    for w in weights.iter_mut() {
        if *w < MIN_SHARE {
            *w = MIN_SHARE;
        }
    }
    let total: f64 = weights.iter().sum();
    for w in weights.iter_mut() {
        *w /= total;
    }
    weights
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::{Endpoint, ServerStatus};

    fn slave(name: &str, rank: i32, rlag: i64) -> Arc<Server> {
        let s = Server::new(name, Endpoint::tcp("10.0.0.1", 3306));
        s.set_status(ServerStatus::RUNNING | ServerStatus::SLAVE);
        s.set_rank(rank);
        s.set_replication_lag(rlag);
        s
    }

    #[test]
    fn test_least_current_operations() {
        let a = slave("a", 1, 0);
        let b = slave("b", 1, 0);
        a.op_started();
        a.op_started();
        b.op_started();

        let picked = select_slave(
            &[a.clone(), b.clone()],
            SlaveSelectionCriteria::LeastCurrentOperations,
            -1,
            None,
            &HashMap::new(),
        )
        .unwrap();
        assert_eq!(picked.name, "b");
    }

    #[test]
    fn test_least_global_connections() {
        let a = slave("a", 1, 0);
        let b = slave("b", 1, 0);
        a.connection_opened();

        let picked = select_slave(
            &[a, b],
            SlaveSelectionCriteria::LeastGlobalConnections,
            -1,
            None,
            &HashMap::new(),
        )
        .unwrap();
        assert_eq!(picked.name, "b");
    }

    #[test]
    fn test_least_router_connections() {
        let a = slave("a", 1, 0);
        let b = slave("b", 1, 0);
        let conns = HashMap::from([("a".to_string(), 3), ("b".to_string(), 1)]);

        let picked = select_slave(
            &[a, b],
            SlaveSelectionCriteria::LeastRouterConnections,
            -1,
            None,
            &conns,
        )
        .unwrap();
        assert_eq!(picked.name, "b");
    }

    #[test]
    fn test_lag_bound_filters() {
        let a = slave("a", 1, 100);
        let b = slave("b", 1, 2);

        let picked = select_slave(
            &[a.clone(), b],
            SlaveSelectionCriteria::LeastBehindMaster,
            10,
            None,
            &HashMap::new(),
        )
        .unwrap();
        assert_eq!(picked.name, "b");

        // Nothing qualifies when every slave lags too far
        assert!(select_slave(
            &[a],
            SlaveSelectionCriteria::LeastBehindMaster,
            10,
            None,
            &HashMap::new(),
        )
        .is_none());
    }

    #[test]
    fn test_unknown_lag_excluded_when_bounded() {
        let a = slave("a", 1, -1);
        assert!(select_slave(
            &[a.clone()],
            SlaveSelectionCriteria::LeastBehindMaster,
            10,
            None,
            &HashMap::new(),
        )
        .is_none());
        // Unlimited bound accepts unknown lag
        assert!(select_slave(
            &[a],
            SlaveSelectionCriteria::LeastBehindMaster,
            -1,
            None,
            &HashMap::new(),
        )
        .is_some());
    }

    #[test]
    fn test_rank_locking() {
        let a = slave("a", 1, 0);
        let b = slave("b", 2, 0);

        // Unlocked session picks the best tier
        let picked = select_slave(
            &[a.clone(), b.clone()],
            SlaveSelectionCriteria::LeastCurrentOperations,
            -1,
            None,
            &HashMap::new(),
        )
        .unwrap();
        assert_eq!(picked.rank(), 1);

        // A session locked to tier 2 never sees tier 1
        let picked = select_slave(
            &[a, b],
            SlaveSelectionCriteria::LeastCurrentOperations,
            -1,
            Some(2),
            &HashMap::new(),
        )
        .unwrap();
        assert_eq!(picked.name, "b");
    }

    #[test]
    fn test_masters_are_not_slaves() {
        let m = Server::new("m", Endpoint::tcp("10.0.0.1", 3306));
        m.set_status(ServerStatus::RUNNING | ServerStatus::MASTER);
        assert!(select_slave(
            &[m],
            SlaveSelectionCriteria::LeastCurrentOperations,
            -1,
            None,
            &HashMap::new(),
        )
        .is_none());
    }

    #[test]
    fn test_adaptive_weights_sum_to_one() {
        let weights = adaptive_weights(&[100.0, 200.0, 400.0]);
        let sum: f64 = weights.iter().sum();
        assert!((sum - 1.0).abs() < 1e-9);
        // Faster server gets the bigger share
        assert!(weights[0] > weights[1]);
        assert!(weights[1] > weights[2]);
    }

    #[test]
    fn test_adaptive_weights_floor() {
        // A very slow server still holds at least 1/197 of the wheel
        let weights = adaptive_weights(&[1.0, 100000.0]);
        assert!(weights[1] >= 1.0 / 197.0 - 1e-9);
    }

    #[test]
    fn test_adaptive_selection_returns_member() {
        let a = slave("a", 1, 0);
        let b = slave("b", 1, 0);
        a.response_time.observe(100.0);
        b.response_time.observe(1000.0);
        for _ in 0..20 {
            let picked = select_slave(
                &[a.clone(), b.clone()],
                SlaveSelectionCriteria::Adaptive,
                -1,
                None,
                &HashMap::new(),
            )
            .unwrap();
            assert!(picked.name == "a" || picked.name == "b");
        }
    }
}
