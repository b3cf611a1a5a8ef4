// ================
// common/src/lib.rs
// ================
//! Common types and structures
//! used for communication between `OkeanChat` clients and the signaling server.
//! This module defines the WebSocket protocol messages and supporting types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Stable user identity as issued by the identity collaborator
pub type UserId = String;

/// One live transport-level session
pub type ConnectionId = Uuid;

/// Generated identifier of a one-to-one call session
pub type CallId = Uuid;

/// Broadcast scope name, e.g. `channel:general` or `room:standup`
pub type GroupName = String;

/// Fixed user record carried by every event that names a user
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Hash)]
pub struct UserSummary {
    pub id: UserId,
    pub display_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub avatar_ref: Option<String>,
}

impl UserSummary {
    pub fn new(id: impl Into<UserId>, display_name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            display_name: display_name.into(),
            avatar_ref: None,
        }
    }

    #[must_use]
    pub fn with_avatar(mut self, avatar_ref: impl Into<String>) -> Self {
        self.avatar_ref = Some(avatar_ref.into());
        self
    }
}

/// Media kind of a one-to-one call
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum CallKind {
    Audio,
    Video,
}

/// Why a call session reached its terminal state
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum CallEndReason {
    /// One party hung up an established or connecting call
    HungUp,
    /// The caller withdrew the call before it was answered
    Cancelled,
    /// The callee declined the call
    Rejected,
    /// Nobody answered within the ring window
    Timeout,
    /// A party lost its last connection
    Disconnected,
}

impl CallEndReason {
    pub fn as_str(self) -> &'static str {
        match self {
            CallEndReason::HungUp => "hung_up",
            CallEndReason::Cancelled => "cancelled",
            CallEndReason::Rejected => "rejected",
            CallEndReason::Timeout => "timeout",
            CallEndReason::Disconnected => "disconnected",
        }
    }
}

/// A channel message after it has been persisted
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ChatMessage {
    pub id: Uuid,
    pub group: GroupName,
    pub sender: UserSummary,
    pub content: String,
    pub created_at: DateTime<Utc>,
}

/// A direct message between two friends after it has been persisted
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct PrivateMessage {
    pub id: Uuid,
    pub sender: UserSummary,
    pub receiver_id: UserId,
    pub content: String,
    pub created_at: DateTime<Utc>,
    pub is_read: bool,
}

/// A participant of a multi-party call room
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct RoomParticipant {
    pub user: UserSummary,
    pub connection_id: ConnectionId,
    pub joined_at: DateTime<Utc>,
    pub audio_enabled: bool,
    pub video_enabled: bool,
}

/// Messages sent from client to server
#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(tag = "msgType")]
pub enum ClientMessage {
    /// Join a channel group
    JoinGroup { group: GroupName },
    /// Leave a channel group; leaving a group never joined is a no-op
    LeaveGroup { group: GroupName },
    /// Post a message to every connection joined to the group
    SendToGroup { group: GroupName, content: String },
    StartTyping { group: GroupName },
    StopTyping { group: GroupName },
    /// Send a direct message to a friend
    /// # Fields
    /// * `target_user_id` - Receiving user
    /// * `content` - Message body
    SendPrivateMessage {
        target_user_id: UserId,
        content: String,
    },
    /// Mark every direct message from `from_user_id` as read
    MarkMessagesRead { from_user_id: UserId },
    /// Ring another user
    /// # Fields
    /// * `target_user_id` - Callee
    /// * `kind` - Audio or video
    InitiateCall { target_user_id: UserId, kind: CallKind },
    AcceptCall { call_id: CallId },
    RejectCall { call_id: CallId },
    /// Withdraw an unanswered call
    CancelCall { call_id: CallId },
    EndCall { call_id: CallId },
    /// End whatever call is live with `target_user_id`
    HangUp { target_user_id: UserId },
    /// Relay an opaque SDP offer
    /// # Fields
    /// * `target_user_id` - Receiving peer
    /// * `payload` - Opaque signaling payload, never inspected
    /// * `room_id` - Set when signaling inside a multi-party room
    /// * `from_user_id` - Optional claimed sender, must match the connection
    SendOffer {
        target_user_id: UserId,
        payload: String,
        #[serde(default)]
        room_id: Option<String>,
        #[serde(default)]
        from_user_id: Option<UserId>,
    },
    SendAnswer {
        target_user_id: UserId,
        payload: String,
        #[serde(default)]
        room_id: Option<String>,
        #[serde(default)]
        from_user_id: Option<UserId>,
    },
    SendIceCandidate {
        target_user_id: UserId,
        payload: String,
        #[serde(default)]
        room_id: Option<String>,
        #[serde(default)]
        from_user_id: Option<UserId>,
    },
    /// Enter a multi-party call room, leaving any previous room
    JoinRoom {
        room_id: String,
        #[serde(default)]
        from_user_id: Option<UserId>,
    },
    LeaveRoom { room_id: String },
    GetRoomUsers { room_id: String },
    SetMediaState {
        room_id: String,
        audio_enabled: bool,
        video_enabled: bool,
    },
    GetOnlineUsers,
}

impl ClientMessage {
    /// Name of the variant as it appears in `msgType`
    pub fn msg_type(&self) -> &'static str {
        match self {
            ClientMessage::JoinGroup { .. } => "JoinGroup",
            ClientMessage::LeaveGroup { .. } => "LeaveGroup",
            ClientMessage::SendToGroup { .. } => "SendToGroup",
            ClientMessage::StartTyping { .. } => "StartTyping",
            ClientMessage::StopTyping { .. } => "StopTyping",
            ClientMessage::SendPrivateMessage { .. } => "SendPrivateMessage",
            ClientMessage::MarkMessagesRead { .. } => "MarkMessagesRead",
            ClientMessage::InitiateCall { .. } => "InitiateCall",
            ClientMessage::AcceptCall { .. } => "AcceptCall",
            ClientMessage::RejectCall { .. } => "RejectCall",
            ClientMessage::CancelCall { .. } => "CancelCall",
            ClientMessage::EndCall { .. } => "EndCall",
            ClientMessage::HangUp { .. } => "HangUp",
            ClientMessage::SendOffer { .. } => "SendOffer",
            ClientMessage::SendAnswer { .. } => "SendAnswer",
            ClientMessage::SendIceCandidate { .. } => "SendIceCandidate",
            ClientMessage::JoinRoom { .. } => "JoinRoom",
            ClientMessage::LeaveRoom { .. } => "LeaveRoom",
            ClientMessage::GetRoomUsers { .. } => "GetRoomUsers",
            ClientMessage::SetMediaState { .. } => "SetMediaState",
            ClientMessage::GetOnlineUsers => "GetOnlineUsers",
        }
    }

    /// Commands whose failures are reported as `CallError` so the client
    /// can reset its call UI
    pub fn is_call_command(&self) -> bool {
        Self::is_call_msg_type(self.msg_type())
    }

    /// Same as [`ClientMessage::is_call_command`], keyed by the raw
    /// `msgType` tag so frames that fail to decode can be classified too
    pub fn is_call_msg_type(msg_type: &str) -> bool {
        matches!(
            msg_type,
            "InitiateCall"
                | "AcceptCall"
                | "RejectCall"
                | "CancelCall"
                | "EndCall"
                | "HangUp"
                | "SendOffer"
                | "SendAnswer"
                | "SendIceCandidate"
        )
    }
}

/// Messages sent from server to client
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(tag = "msgType")]
pub enum ServerMessage {
    /// First frame on every accepted connection
    Connected {
        connection_id: ConnectionId,
        user: UserSummary,
    },
    UserJoined { group: GroupName, user: UserSummary },
    UserLeft { group: GroupName, user: UserSummary },
    UserCameOnline { user: UserSummary },
    UserWentOffline { user_id: UserId },
    ReceiveMessage { group: GroupName, message: ChatMessage },
    /// Acknowledgment to the sending connection of a group message
    MessageSent { message: ChatMessage },
    ReceivePrivateMessage { message: PrivateMessage },
    UnreadMessageCount { count: u64 },
    UserTyping { group: GroupName, user: UserSummary },
    UserStoppedTyping { group: GroupName, user: UserSummary },
    IncomingCall {
        call_id: CallId,
        caller: UserSummary,
        kind: CallKind,
    },
    CallInitiated {
        call_id: CallId,
        callee: UserSummary,
        kind: CallKind,
    },
    CallAccepted { call_id: CallId, by: UserSummary },
    CallRejected { call_id: CallId, by: UserSummary },
    CallEnded {
        call_id: CallId,
        reason: CallEndReason,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        by: Option<UserSummary>,
    },
    /// Rejection of a call command; always carries a reason so the client
    /// can reset local call state
    CallError { code: String, reason: String },
    ReceiveOffer {
        from: UserSummary,
        payload: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        call_id: Option<CallId>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        room_id: Option<String>,
    },
    ReceiveAnswer {
        from: UserSummary,
        payload: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        call_id: Option<CallId>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        room_id: Option<String>,
    },
    ReceiveIceCandidate {
        from: UserSummary,
        payload: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        call_id: Option<CallId>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        room_id: Option<String>,
    },
    OnlineUsers { users: Vec<UserSummary> },
    /// Sent to a room joiner with everybody already inside
    JoinedRoom {
        room_id: String,
        participants: Vec<RoomParticipant>,
    },
    RoomUsers {
        room_id: String,
        participants: Vec<RoomParticipant>,
    },
    MediaStateChanged {
        room_id: String,
        user_id: UserId,
        audio_enabled: bool,
        video_enabled: bool,
    },
    /// Error response for a rejected command
    Error { code: String, message: String },
    /// Error response for frames that are not a valid `ClientMessage`
    MalformedMessage { err_msg: String },
}
