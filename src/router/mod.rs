//! Routers.
//!
//! A router session is created per client session and decides which
//! backend(s) each statement reaches. Replies are streamed to the client
//! through the `ClientWriter` the session provides; routers never buffer
//! whole result sets.

mod rw_split;
mod schema;
mod select;

pub use rw_split::RwSplitSession;
pub use schema::SchemaRouterSession;
pub use select::{adaptive_weights, select_slave, RouterConnections};

use crate::error::ProxyError;
use crate::filter::Capabilities;
use crate::protocol::Packet;

/// Where a statement should go
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RouteTarget {
    Master,
    Slave,
    NamedServer(String),
    All,
    /// Any slave within the lag bound
    RlagMax(i64),
    LastUsed,
}

/// Routing hint embedded in a statement comment:
/// `-- bifrost route to master|slave|server <name>` or the `/* ... */` form.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RoutingHint {
    ToMaster,
    ToSlave,
    ToServer(String),
    MaxLag(i64),
}

impl RoutingHint {
    pub fn parse(sql: &str) -> Option<Self> {
        let lower = sql.to_ascii_lowercase();
        let idx = lower.find("bifrost")?;
        // Hints live in comments only
        let before = &lower[..idx];
        if !(before.contains("--") || before.contains("/*") || before.contains('#')) {
            return None;
        }
        let rest = lower[idx + "bifrost".len()..].trim_start();

        if let Some(after) = rest.strip_prefix("route to ") {
            let mut words = after.split_whitespace();
            match words.next()? {
                "master" => return Some(RoutingHint::ToMaster),
                "slave" => return Some(RoutingHint::ToSlave),
                "server" => {
                    let name = words.next()?;
                    let name = name.trim_end_matches("*/").trim();
                    if name.is_empty() {
                        return None;
                    }
                    return Some(RoutingHint::ToServer(name.to_string()));
                }
                _ => return None,
            }
        }

        if let Some(after) = rest.strip_prefix("max_slave_replication_lag=") {
            let value: String = after.chars().take_while(|c| c.is_ascii_digit()).collect();
            return value.parse().ok().map(RoutingHint::MaxLag);
        }

        None
    }
}

/// Sink for reply packets on their way to the client
#[async_trait::async_trait]
pub trait ClientWriter: Send {
    async fn send(&mut self, packet: Packet) -> Result<(), ProxyError>;
}

/// Per-session router instance
#[async_trait::async_trait]
pub trait RouterSession: Send + Sync {
    /// Route one client packet and stream the reply to `client`.
    async fn route_query(
        &mut self,
        packet: Packet,
        client: &mut dyn ClientWriter,
    ) -> Result<(), ProxyError>;

    /// Release all backend connections
    fn close(&mut self);
}

/// Capability set a router module contributes to its service
pub fn capabilities_for(router: &str) -> Capabilities {
    match router {
        "readwritesplit" => {
            Capabilities::CONTIGUOUS_INPUT
                | Capabilities::TRANSACTION_TRACKING
                | Capabilities::REQUEST_TRACKING
        }
        "schemarouter" => {
            Capabilities::CONTIGUOUS_INPUT
                | Capabilities::PACKET_OUTPUT
                | Capabilities::RUNTIME_CONFIG
        }
        _ => Capabilities::empty(),
    }
}

/// Outstanding-request bookkeeping.
///
/// The counter equals the number of backend-bound requests whose replies
/// have not completed; the query queue may only drain at zero.
#[derive(Debug, Default)]
pub struct ResponseTracker {
    expected: usize,
    queue: std::collections::VecDeque<Packet>,
}

impl ResponseTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn request_sent(&mut self) {
        self.expected += 1;
    }

    pub fn reply_complete(&mut self) {
        debug_assert!(self.expected > 0, "reply without outstanding request");
        self.expected = self.expected.saturating_sub(1);
    }

    /// The backend died; its reply will never arrive
    pub fn request_aborted(&mut self) {
        self.expected = self.expected.saturating_sub(1);
    }

    pub fn expected_responses(&self) -> usize {
        self.expected
    }

    /// Queue a client packet that arrived while replies are outstanding
    pub fn enqueue(&mut self, packet: Packet) {
        self.queue.push_back(packet);
    }

    /// Pop the next queued packet; only legal when nothing is outstanding
    pub fn drain_next(&mut self) -> Option<Packet> {
        if self.expected == 0 {
            self.queue.pop_front()
        } else {
            None
        }
    }

    pub fn has_queued(&self) -> bool {
        !self.queue.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hint_route_to_master() {
        assert_eq!(
            RoutingHint::parse("SELECT 1 -- bifrost route to master"),
            Some(RoutingHint::ToMaster)
        );
        assert_eq!(
            RoutingHint::parse("/* bifrost route to slave */ SELECT 1"),
            Some(RoutingHint::ToSlave)
        );
    }

    #[test]
    fn test_hint_named_server() {
        assert_eq!(
            RoutingHint::parse("SELECT 1 /* bifrost route to server db2 */"),
            Some(RoutingHint::ToServer("db2".to_string()))
        );
    }

    #[test]
    fn test_hint_max_lag() {
        assert_eq!(
            RoutingHint::parse("SELECT 1 -- bifrost max_slave_replication_lag=30"),
            Some(RoutingHint::MaxLag(30))
        );
    }

    #[test]
    fn test_no_hint() {
        assert_eq!(RoutingHint::parse("SELECT 1"), None);
        // The word outside a comment is not a hint
        assert_eq!(RoutingHint::parse("SELECT 'bifrost route to master'"), None);
    }

    #[test]
    fn test_response_tracker_counts() {
        let mut tracker = ResponseTracker::new();
        assert_eq!(tracker.expected_responses(), 0);

        tracker.request_sent();
        tracker.request_sent();
        assert_eq!(tracker.expected_responses(), 2);

        tracker.reply_complete();
        assert_eq!(tracker.expected_responses(), 1);
        tracker.reply_complete();
        assert_eq!(tracker.expected_responses(), 0);
    }

    #[test]
    fn test_response_tracker_queue_gated_on_zero() {
        let mut tracker = ResponseTracker::new();
        tracker.request_sent();
        tracker.enqueue(Packet::query("SELECT 1"));

        // Outstanding reply blocks the queue
        assert!(tracker.drain_next().is_none());
        assert!(tracker.has_queued());

        tracker.reply_complete();
        assert!(tracker.drain_next().is_some());
        assert!(!tracker.has_queued());
    }

    #[test]
    fn test_response_tracker_interleaving_invariant() {
        // Across arbitrary interleavings the counter equals outstanding
        // requests
        let mut tracker = ResponseTracker::new();
        let mut outstanding = 0usize;
        let ops = [1, 1, -1, 1, -1, -1, 1, 1, -1, -1];
        for op in ops {
            if op > 0 {
                tracker.request_sent();
                outstanding += 1;
            } else {
                tracker.reply_complete();
                outstanding -= 1;
            }
            assert_eq!(tracker.expected_responses(), outstanding);
        }
    }
}
