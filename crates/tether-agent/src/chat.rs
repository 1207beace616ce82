//! Chat-room endpoint: every text message is relayed to every member.

use async_trait::async_trait;
use bytes::Bytes;
use tether_server::{
    ConnectionError, ConnectionId, RequestMeta, WebSocketCallback, WebSocketController,
};
use tracing::{debug, info, warn};

/// Relays each text message to all members as `received <id> : <msg>`.
pub struct ChatRoom {
    members: WebSocketController,
}

impl ChatRoom {
    /// Build a room over the endpoint's controller.
    pub fn new(members: WebSocketController) -> Self {
        Self { members }
    }
}

/// Line relayed to the room for a message from `id`.
pub fn relay_line(id: &ConnectionId, text: &str) -> String {
    format!("received {id} : {text}")
}

#[async_trait]
impl WebSocketCallback for ChatRoom {
    async fn on_admit(&self, id: &ConnectionId, request: &RequestMeta) -> bool {
        info!(
            conn_id = %id,
            peer = ?request.peer_addr,
            name = request.form_value("name").unwrap_or("anonymous"),
            "member joined"
        );
        true
    }

    async fn on_text(&self, id: &ConnectionId, data: Bytes) {
        let text = String::from_utf8_lossy(&data);
        let report = self.members.broadcast_text(relay_line(id, &text)).await;
        debug!(
            conn_id = %id,
            delivered = report.delivered.len(),
            failed = report.failed.len(),
            "message relayed"
        );
    }

    async fn on_binary(&self, id: &ConnectionId, data: Bytes) {
        debug!(conn_id = %id, bytes = data.len(), "binary message ignored");
    }

    async fn on_disconnect(&self, id: &ConnectionId) {
        info!(conn_id = %id, remaining = self.members.connection_count(), "member left");
    }

    async fn on_error(&self, id: &ConnectionId, error: &ConnectionError) {
        warn!(conn_id = %id, error = %error, "member connection failed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tether_server::testing::{MemoryPeer, memory_transport};
    use tether_server::{Admission, Frame, WebSocketConfig, WebSocketManager};

    async fn join(room: &WebSocketManager) -> (ConnectionId, MemoryPeer) {
        let (transport, peer) = memory_transport();
        match room.admit(transport, RequestMeta::default()).await {
            Admission::Admitted(id) => (id, peer),
            Admission::Rejected(_) => panic!("member rejected"),
        }
    }

    #[test]
    fn relay_line_format() {
        assert_eq!(relay_line(&ConnectionId::from("abc"), "hi"), "received abc : hi");
    }

    #[tokio::test]
    async fn text_is_relayed_to_every_member() {
        let room = WebSocketManager::new_cyclic(WebSocketConfig::default(), ChatRoom::new);
        let (alice, mut alice_peer) = join(&room).await;
        let (_bob, mut bob_peer) = join(&room).await;

        assert!(alice_peer.send(Frame::Text("hello".into())));

        let expected = Frame::Text(relay_line(&alice, "hello"));
        assert_eq!(alice_peer.next_data().await, Some(expected.clone()));
        assert_eq!(bob_peer.next_data().await, Some(expected));
    }

    #[tokio::test]
    async fn binary_is_not_relayed() {
        let room = WebSocketManager::new_cyclic(WebSocketConfig::default(), ChatRoom::new);
        let (_alice, alice_peer) = join(&room).await;
        let (_bob, mut bob_peer) = join(&room).await;

        assert!(alice_peer.send(Frame::Binary(Bytes::from_static(b"\x00"))));
        assert!(alice_peer.send(Frame::Text("after".into())));

        match bob_peer.next_data().await {
            Some(Frame::Text(text)) => assert!(text.ends_with(": after")),
            other => panic!("unexpected frame {other:?}"),
        }
    }

    #[tokio::test]
    async fn departed_member_stops_receiving() {
        let room = WebSocketManager::new_cyclic(WebSocketConfig::default(), ChatRoom::new);
        let (alice, mut alice_peer) = join(&room).await;
        let (bob, _bob_peer) = join(&room).await;

        room.close(&bob).await.unwrap();
        assert_eq!(room.connection_count(), 1);

        assert!(alice_peer.send(Frame::Text("still here?".into())));
        assert_eq!(
            alice_peer.next_data().await,
            Some(Frame::Text(relay_line(&alice, "still here?")))
        );
    }
}
