//! Guest admission
//!
//! Host side keeps the outstanding requests in arrival order, one per
//! requester. Guest side tracks where its own request stands.

use indexmap::IndexMap;
use serde::Serialize;
use tracing::debug;

use crate::error::{Error, Result};
use crate::protocol::GuestRequest;
use crate::types::SocketId;

/// Where the local guest's admission request stands
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "camelCase")]
pub enum AdmissionState {
    #[default]
    Idle,
    Requested,
    Approved {
        token: String,
    },
    Denied {
        reason: Option<String>,
    },
}

/// Host-visible list of outstanding guest requests
#[derive(Debug, Default)]
pub struct GuestAdmission {
    pending: IndexMap<SocketId, GuestRequest>,
}

impl GuestAdmission {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a request. A request from the same requester replaces the
    /// previous one and moves to the back; the replaced one is returned.
    pub fn submit(&mut self, request: GuestRequest) -> Option<GuestRequest> {
        let superseded = self.pending.shift_remove(&request.requester_socket_id);
        if superseded.is_some() {
            debug!(requester = %request.requester_socket_id, "Guest request superseded");
        }
        self.pending
            .insert(request.requester_socket_id.clone(), request);
        superseded
    }

    /// Resolve a request, removing it from the pending list
    pub fn take(&mut self, requester: &SocketId) -> Result<GuestRequest> {
        self.pending
            .shift_remove(requester)
            .ok_or_else(|| Error::UnknownGuestRequest(requester.clone()))
    }

    #[must_use]
    pub fn pending(&self) -> Vec<GuestRequest> {
        self.pending.values().cloned().collect()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.pending.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    pub fn clear(&mut self) {
        self.pending.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::RoomId;
    use chrono::Utc;

    fn request(requester: &str, token: &str) -> GuestRequest {
        GuestRequest {
            requester_socket_id: SocketId::from(requester),
            display_name: format!("guest {requester}"),
            room_id: RoomId::from("studio"),
            token: token.to_string(),
            requested_at: Utc::now(),
        }
    }

    #[test]
    fn test_second_request_supersedes_first() {
        let mut admission = GuestAdmission::new();
        assert!(admission.submit(request("g1", "a")).is_none());
        admission.submit(request("g2", "b"));

        let superseded = admission.submit(request("g1", "c")).unwrap();
        assert_eq!(superseded.token, "a");

        let pending = admission.pending();
        assert_eq!(pending.len(), 2);
        assert_eq!(pending[0].requester_socket_id.as_str(), "g2");
        assert_eq!(pending[1].token, "c");
    }

    #[test]
    fn test_take_removes_entry() {
        let mut admission = GuestAdmission::new();
        admission.submit(request("g1", "a"));

        let g1 = SocketId::from("g1");
        assert_eq!(admission.take(&g1).unwrap().token, "a");
        assert!(admission.is_empty());
        assert!(matches!(admission.take(&g1), Err(Error::UnknownGuestRequest(id)) if id == g1));
    }

    #[test]
    fn test_clear_drops_pending() {
        let mut admission = GuestAdmission::new();
        admission.submit(request("g1", "a"));
        admission.clear();
        assert_eq!(admission.len(), 0);
    }

    #[test]
    fn test_admission_state_serializes_tagged() {
        let json = serde_json::to_value(AdmissionState::Approved {
            token: "t".to_string(),
        })
        .unwrap();
        assert_eq!(json["state"], "approved");
        assert_eq!(json["token"], "t");
    }
}
