use crate::connection::Connection;
use std::collections::VecDeque;

/// FIFO of live connections to one upstream authority. Closed connections
/// are evicted on the way through; callers dial a fresh one when every
/// survivor is at its peer's MAX_CONCURRENT_STREAMS.
#[derive(Debug, Default)]
pub(crate) struct Pool {
    connections: VecDeque<Connection>,
}

impl Pool {
    /// Oldest open connection with a free stream slot, if any.
    pub fn acquire(&mut self) -> Option<Connection> {
        self.connections
            .retain(|connection| !connection.is_closed());
        self.connections
            .iter()
            .find(|connection| connection.has_capacity())
            .cloned()
    }

    pub fn insert(&mut self, connection: Connection) {
        self.connections.push_back(connection);
    }
}
