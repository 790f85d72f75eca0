//! Studio session configuration

use serde::{Deserialize, Serialize};

use crate::protocol::Role;
use crate::types::{RoomId, UserId};

/// Studio session configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Room (channel) to join
    pub room_id: RoomId,
    /// Name shown to other participants
    pub display_name: String,
    /// Host or guest
    pub role: Role,
    /// Application identity, absent for anonymous guests
    pub user_id: Option<UserId>,
    /// Join automatically once the host approves an admission request
    pub auto_join_on_approval: bool,
    /// Capacity of the notice broadcast channel
    pub notice_capacity: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            room_id: RoomId::from("studio"),
            display_name: "Guest".to_string(),
            role: Role::Guest,
            user_id: None,
            auto_join_on_approval: true,
            notice_capacity: 64,
        }
    }
}

impl SessionConfig {
    pub fn host(room_id: impl Into<RoomId>, display_name: impl Into<String>) -> Self {
        Self {
            room_id: room_id.into(),
            display_name: display_name.into(),
            role: Role::Host,
            ..Default::default()
        }
    }

    pub fn guest(room_id: impl Into<RoomId>, display_name: impl Into<String>) -> Self {
        Self {
            room_id: room_id.into(),
            display_name: display_name.into(),
            role: Role::Guest,
            ..Default::default()
        }
    }

    #[must_use]
    pub fn with_user_id(mut self, user_id: impl Into<UserId>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }
}
