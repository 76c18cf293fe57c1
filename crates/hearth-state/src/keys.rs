// Store key layout. Every node reads and writes the same keys; nothing here
// is namespaced per node.

/// Count of currently-open client connections across the cluster.
pub const CONCURRENT_CONNECTIONS: &str = "global:concurrent_connections";

/// Accumulated connection-seconds across all participants and all history.
pub const TOTAL_CONNECTION_SECONDS: &str = "global:total_connection_seconds";

/// Highest concurrent count ever observed.
pub const PEAK_CONNECTIONS: &str = "global:peak_connections";

/// Set of milestone identifiers that have fired.
pub const UNLOCKED_MILESTONES: &str = "global:unlocked_milestones";

/// Sorted set of `"<second>:<value>"` members scored by unix second.
pub const PEAK_HISTORY: &str = "global:peak_history";

/// Pub/sub channel carrying lobby broadcast frames between nodes.
pub const LOBBY_CHANNEL: &str = "global:lobby";
