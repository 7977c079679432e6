//! WebSocket connection management for Hearth Server

use crate::error::{AppError, Result};
use dashmap::DashMap;
use hearth_core::signaling::{Delivery, Frame};
use tokio::sync::mpsc;

/// Represents an active WebSocket connection
#[derive(Clone)]
pub struct Connection {
    pub connection_id: String,
    pub sender: mpsc::UnboundedSender<Frame>,
}

/// Manages all authenticated WebSocket connections
pub struct ConnectionManager {
    /// Map of user_id -> Vec<Connection> (one per open client)
    connections: DashMap<String, Vec<Connection>>,
    /// Map of connection_id -> user_id for quick lookup
    connection_to_user: DashMap<String, String>,
    max_per_user: usize,
}

impl ConnectionManager {
    pub fn new(max_per_user: usize) -> Self {
        Self {
            connections: DashMap::new(),
            connection_to_user: DashMap::new(),
            max_per_user,
        }
    }

    /// Register a new connection
    pub fn register(
        &self,
        user_id: &str,
        connection_id: &str,
        sender: mpsc::UnboundedSender<Frame>,
    ) -> Result<()> {
        {
            let mut entry = self.connections.entry(user_id.to_string()).or_default();
            if entry.len() >= self.max_per_user {
                return Err(AppError::TooManyConnections(user_id.to_string()));
            }
            entry.push(Connection {
                connection_id: connection_id.to_string(),
                sender,
            });
        }

        self.connection_to_user
            .insert(connection_id.to_string(), user_id.to_string());

        tracing::info!("Connection registered: user={}, connection={}", user_id, connection_id);
        Ok(())
    }

    /// Unregister a connection
    pub fn unregister(&self, connection_id: &str) {
        if let Some((_, user_id)) = self.connection_to_user.remove(connection_id) {
            if let Some(mut connections) = self.connections.get_mut(&user_id) {
                connections.retain(|c| c.connection_id != connection_id);

                if connections.is_empty() {
                    drop(connections);
                    self.connections.remove_if(&user_id, |_, c| c.is_empty());
                }
            }

            tracing::info!("Connection unregistered: user={}, connection={}", user_id, connection_id);
        }
    }

    pub fn is_user_online(&self, user_id: &str) -> bool {
        self.connections.get(user_id).map(|c| !c.is_empty()).unwrap_or(false)
    }

    pub fn connection_count(&self, user_id: &str) -> usize {
        self.connections.get(user_id).map(|c| c.len()).unwrap_or(0)
    }

    pub fn online_user_count(&self) -> usize {
        self.connections.len()
    }

    /// Send a frame to every connection of a user. Returns how many
    /// connections accepted it.
    pub fn send_to_user(&self, user_id: &str, frame: &Frame) -> usize {
        let Some(connections) = self.connections.get(user_id) else {
            return 0;
        };
        connections
            .iter()
            .filter(|conn| match conn.sender.send(frame.clone()) {
                Ok(()) => true,
                Err(e) => {
                    tracing::warn!("Failed to send to connection {}: {}", conn.connection_id, e);
                    false
                }
            })
            .count()
    }

    /// Send a batch produced by the relay router.
    pub fn deliver(&self, deliveries: Vec<Delivery>) -> usize {
        deliveries
            .iter()
            .map(|d| self.send_to_user(&d.recipient, &d.frame))
            .sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hearth_core::signaling::ControlFrame;

    #[test]
    fn test_connection_management() {
        let manager = ConnectionManager::new(2);
        let (tx, _rx) = mpsc::unbounded_channel();

        manager.register("user1", "conn1", tx.clone()).unwrap();
        assert!(manager.is_user_online("user1"));
        assert!(!manager.is_user_online("user2"));

        let (tx2, _rx2) = mpsc::unbounded_channel();
        manager.register("user1", "conn2", tx2).unwrap();
        assert_eq!(manager.connection_count("user1"), 2);

        manager.unregister("conn1");
        assert!(manager.is_user_online("user1"));
        assert_eq!(manager.connection_count("user1"), 1);

        manager.unregister("conn2");
        assert!(!manager.is_user_online("user1"));
        assert_eq!(manager.online_user_count(), 0);
    }

    #[test]
    fn test_connection_limit() {
        let manager = ConnectionManager::new(1);
        let (tx, _rx) = mpsc::unbounded_channel();
        manager.register("user1", "conn1", tx.clone()).unwrap();

        assert!(matches!(
            manager.register("user1", "conn2", tx),
            Err(AppError::TooManyConnections(_))
        ));
        assert_eq!(manager.connection_count("user1"), 1);
    }

    #[test]
    fn test_send_reaches_every_connection() {
        let manager = ConnectionManager::new(3);
        let (tx1, mut rx1) = mpsc::unbounded_channel();
        let (tx2, mut rx2) = mpsc::unbounded_channel();
        manager.register("user1", "conn1", tx1).unwrap();
        manager.register("user1", "conn2", tx2).unwrap();

        let frame = Frame::Control(ControlFrame::Pong);
        assert_eq!(manager.send_to_user("user1", &frame), 2);
        assert_eq!(manager.send_to_user("nobody", &frame), 0);
        assert_eq!(rx1.try_recv().unwrap(), frame);
        assert_eq!(rx2.try_recv().unwrap(), frame);
    }
}
