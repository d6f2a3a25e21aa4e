//! WebRTC signaling relay
//!
//! Pure forwarding of offer/answer/ICE frames addressed by target user id.
//! The server never terminates media and never inspects SDP; a frame whose
//! target is not in the sender's room is dropped silently, since the peer
//! may simply have left. Join/leave announcements originate here as well.

use serde_json::Value;
use std::sync::Arc;
use tracing::debug;

use crate::metrics::Metrics;
use crate::rooms::ConnectionManager;
use crate::server::protocol::ServerMessage;
use crate::types::{RoomId, UserId};

/// The three relayed frame kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalKind {
    Offer,
    Answer,
    IceCandidate,
}

/// Stateless forwarder bound to the room mesh
pub struct SignalingRelay {
    manager: Arc<ConnectionManager>,
    metrics: Arc<Metrics>,
}

impl SignalingRelay {
    pub fn new(manager: Arc<ConnectionManager>, metrics: Arc<Metrics>) -> Self {
        Self { manager, metrics }
    }

    /// Forward one signaling frame from `sender` to `target` if the target
    /// is a current member of the same room. Returns whether it was
    /// delivered to the target's queue.
    pub fn relay(
        &self,
        room_id: &RoomId,
        sender: UserId,
        target: UserId,
        kind: SignalKind,
        payload: Value,
    ) -> bool {
        if target == sender || !self.manager.is_member(room_id, target) {
            Metrics::incr(&self.metrics.signaling_dropped);
            debug!(
                "Dropping {:?} from {} to absent peer {} in room {}",
                kind, sender, target, room_id
            );
            return false;
        }

        let message = match kind {
            SignalKind::Offer => ServerMessage::WebrtcOffer {
                from_user_id: sender,
                offer: payload,
            },
            SignalKind::Answer => ServerMessage::WebrtcAnswer {
                from_user_id: sender,
                answer: payload,
            },
            SignalKind::IceCandidate => ServerMessage::IceCandidate {
                from_user_id: sender,
                candidate: payload,
            },
        };

        let delivered = self.manager.send(target, message);
        if delivered {
            Metrics::incr(&self.metrics.signaling_relayed);
        } else {
            Metrics::incr(&self.metrics.signaling_dropped);
        }
        delivered
    }

    /// Announce a join: the joiner gets a welcome with the current roster,
    /// existing members get the delta. Skipped entirely for replacements.
    pub async fn announce_join(&self, room_id: &RoomId, user_id: UserId, user_name: &str) {
        let participants = self.manager.get_participants_info(room_id).await;
        let message = ServerMessage::ParticipantJoined {
            user_id,
            user_name: user_name.to_string(),
            participants,
        };
        self.manager.send(user_id, message.clone());
        self.manager.broadcast_to_room(room_id, &message, Some(user_id));
    }

    /// Announce a leave to the remaining members
    pub async fn announce_leave(&self, room_id: &RoomId, user_id: UserId) {
        let participants = self.manager.get_participants_info(room_id).await;
        let message = ServerMessage::ParticipantLeft {
            user_id,
            participants,
        };
        self.manager.broadcast_to_room(room_id, &message, Some(user_id));
    }
}
