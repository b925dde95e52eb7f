//! Connected clients and their session bindings.

use std::collections::BTreeMap;
use tokio::sync::mpsc;
use tracing::debug;

use crate::protocol::{ServerMessage, SessionId};

pub type ClientId = u64;

/// Outbound queue of one WebSocket connection. Unbounded so the relay loop
/// never waits on a slow browser.
pub type ClientSender = mpsc::UnboundedSender<ServerMessage>;

#[derive(Debug)]
struct Client {
    tx: ClientSender,
    active_session: Option<SessionId>,
}

/// Routing table for connected clients. Each client is bound to at most one
/// session at a time.
#[derive(Debug, Default)]
pub struct ClientRegistry {
    clients: BTreeMap<ClientId, Client>,
}

impl ClientRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, id: ClientId, tx: ClientSender, active_session: Option<SessionId>) {
        self.clients.insert(id, Client { tx, active_session });
    }

    pub fn remove(&mut self, id: ClientId) -> bool {
        self.clients.remove(&id).is_some()
    }

    pub fn contains(&self, id: ClientId) -> bool {
        self.clients.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.clients.len()
    }

    pub fn ids(&self) -> impl Iterator<Item = ClientId> + '_ {
        self.clients.keys().copied()
    }

    pub fn bind(&mut self, id: ClientId, session: SessionId) {
        if let Some(client) = self.clients.get_mut(&id) {
            client.active_session = Some(session);
        }
    }

    pub fn active_session(&self, id: ClientId) -> Option<SessionId> {
        self.clients.get(&id).and_then(|c| c.active_session)
    }

    /// Clients currently viewing `session`.
    pub fn bound_to(&self, session: SessionId) -> impl Iterator<Item = ClientId> + '_ {
        self.clients
            .iter()
            .filter(move |(_, c)| c.active_session == Some(session))
            .map(|(id, _)| *id)
    }

    pub fn send_to(&self, id: ClientId, msg: impl Into<ServerMessage>) {
        if let Some(client) = self.clients.get(&id) {
            deliver(id, client, msg.into());
        }
    }

    pub fn send_to_session(&self, session: SessionId, msg: impl Into<ServerMessage>) {
        self.send_to_session_except(session, None, msg);
    }

    /// Deliver to every client bound to `session` other than `except`.
    pub fn send_to_session_except(
        &self,
        session: SessionId,
        except: Option<ClientId>,
        msg: impl Into<ServerMessage>,
    ) {
        let msg = msg.into();
        for id in self.bound_to(session).filter(|id| Some(*id) != except) {
            self.send_to(id, msg.clone());
        }
    }

    pub fn broadcast(&self, msg: impl Into<ServerMessage>) {
        let msg = msg.into();
        for (id, client) in &self.clients {
            deliver(*id, client, msg.clone());
        }
    }
}

fn deliver(id: ClientId, client: &Client, msg: ServerMessage) {
    // A closed queue means the socket is going away; its disconnect event
    // will remove the client.
    if client.tx.send(msg).is_err() {
        debug!("Client {} queue closed, dropping message", id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{RelayMessage, SessionEvent};
    use tokio::sync::mpsc::UnboundedReceiver;

    fn client(reg: &mut ClientRegistry, id: ClientId, session: Option<SessionId>) -> UnboundedReceiver<ServerMessage> {
        let (tx, rx) = mpsc::unbounded_channel();
        reg.insert(id, tx, session);
        rx
    }

    fn drain(rx: &mut UnboundedReceiver<ServerMessage>) -> Vec<ServerMessage> {
        let mut out = Vec::new();
        while let Ok(msg) = rx.try_recv() {
            out.push(msg);
        }
        out
    }

    fn delta() -> SessionEvent {
        SessionEvent::Delta { text: "x".into() }
    }

    #[test]
    fn test_session_delivery_respects_binding() {
        let mut reg = ClientRegistry::new();
        let mut a = client(&mut reg, 1, Some(10));
        let mut b = client(&mut reg, 2, Some(20));
        let mut c = client(&mut reg, 3, Some(10));

        reg.send_to_session(10, delta());
        assert_eq!(drain(&mut a).len(), 1);
        assert!(drain(&mut b).is_empty());
        assert_eq!(drain(&mut c).len(), 1);

        reg.send_to_session_except(10, Some(1), delta());
        assert!(drain(&mut a).is_empty());
        assert_eq!(drain(&mut c).len(), 1);
    }

    #[test]
    fn test_bind_moves_client() {
        let mut reg = ClientRegistry::new();
        let mut a = client(&mut reg, 1, None);
        assert_eq!(reg.active_session(1), None);

        reg.bind(1, 7);
        assert_eq!(reg.active_session(1), Some(7));
        assert_eq!(reg.bound_to(7).collect::<Vec<_>>(), vec![1]);

        reg.send_to_session(7, delta());
        assert_eq!(drain(&mut a), vec![ServerMessage::Event(delta())]);
    }

    #[test]
    fn test_broadcast_and_remove() {
        let mut reg = ClientRegistry::new();
        let mut a = client(&mut reg, 1, Some(1));
        let mut b = client(&mut reg, 2, None);

        let msg = RelayMessage::SessionSwitched { id: 1 };
        reg.broadcast(msg.clone());
        assert_eq!(drain(&mut a), vec![ServerMessage::Relay(msg.clone())]);
        assert_eq!(drain(&mut b), vec![ServerMessage::Relay(msg)]);

        assert!(reg.remove(2));
        assert!(!reg.remove(2));
        assert!(!reg.contains(2));
        assert_eq!(reg.len(), 1);
    }

    #[test]
    fn test_closed_receiver_is_tolerated() {
        let mut reg = ClientRegistry::new();
        let rx = client(&mut reg, 1, Some(1));
        drop(rx);
        reg.broadcast(delta());
        reg.send_to(1, delta());
        reg.send_to(99, delta());
        assert_eq!(reg.ids().count(), 1);
    }
}
