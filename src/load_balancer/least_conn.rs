//! Least Connections load balancing strategy.

use crate::load_balancer::{peer::Peer, round_robin::pick_smooth, LoadBalancer, PeerSet, Tried};

/// Least connections selector.
/// Selects the peer with the fewest live connections relative to its weight.
/// Ties are broken with smooth weighted round-robin.
#[derive(Debug, Default)]
pub struct LeastConnections;

impl LeastConnections {
    pub fn new() -> Self {
        Self
    }
}

/// `a` carries fewer connections per unit of weight than `b`.
fn lighter(a: &Peer, b: &Peer) -> bool {
    (a.conns() as i64) * b.weight < (b.conns() as i64) * a.weight
}

fn same_load(a: &Peer, b: &Peer) -> bool {
    (a.conns() as i64) * b.weight == (b.conns() as i64) * a.weight
}

impl LoadBalancer for LeastConnections {
    fn pick(&self, set: &PeerSet, peers: &[Peer], tried: &Tried, now_ms: u64) -> Option<usize> {
        let candidate = |index: usize, peer: &Peer| {
            !tried.contains(set.peer_id(index)) && peer.is_available(now_ms)
        };

        let mut best: Option<usize> = None;
        let mut ties = 0usize;
        for (index, peer) in peers.iter().enumerate() {
            if !candidate(index, peer) {
                continue;
            }
            match best {
                Some(b) if lighter(peer, &peers[b]) => {
                    best = Some(index);
                    ties = 0;
                }
                Some(b) if same_load(peer, &peers[b]) => ties += 1,
                Some(_) => {}
                None => best = Some(index),
            }
        }

        let best = best?;
        if ties == 0 {
            return Some(best);
        }

        let target = &peers[best];
        pick_smooth(peers, |index, peer| candidate(index, peer) && same_load(peer, target))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{BalanceMethod, ServerConfig};
    use std::net::SocketAddr;
    use std::sync::atomic::Ordering;
    use std::sync::Arc;
    use tokio::time::Instant;

    fn least_conn_set(weights: &[u32]) -> Arc<PeerSet> {
        let peers = weights
            .iter()
            .enumerate()
            .map(|(i, w)| {
                let addr: SocketAddr = format!("127.0.0.1:{}", 9100 + i).parse().unwrap();
                Peer::new(addr.to_string(), addr, &ServerConfig::new(addr.to_string()).weight(*w))
            })
            .collect();
        Arc::new(PeerSet::new("web", peers, false, BalanceMethod::LeastConn))
    }

    #[test]
    fn test_least_conn() {
        let set = least_conn_set(&[1, 1]);
        let now = Instant::now();

        // artificially increase connections on the first peer
        set.read()[0].conns.fetch_add(1, Ordering::Relaxed);

        let s1 = set.select(&Tried::new(), now).unwrap();
        assert_eq!(s1.id().index, 1);

        // second peer now has 2, first has 1
        set.read()[1].conns.fetch_add(1, Ordering::Relaxed);
        let s2 = set.select(&Tried::new(), now).unwrap();
        assert_eq!(s2.id().index, 0);
    }

    #[test]
    fn weight_scales_connection_count() {
        let set = least_conn_set(&[1, 4]);
        let now = Instant::now();
        set.read()[0].conns.fetch_add(1, Ordering::Relaxed);
        set.read()[1].conns.fetch_add(3, Ordering::Relaxed);

        // 3/4 < 1/1
        assert_eq!(set.select(&Tried::new(), now).unwrap().id().index, 1);
    }

    #[test]
    fn ties_follow_weights() {
        let set = least_conn_set(&[2, 1]);
        let now = Instant::now();

        let picks: Vec<usize> = (0..3)
            .map(|_| set.select(&Tried::new(), now).unwrap().id().index)
            .collect();
        assert_eq!(picks, vec![0, 1, 0]);
    }
}
