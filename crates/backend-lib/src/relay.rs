// ============================
// crates/backend-lib/src/relay.rs
// ============================
//! Signaling relay.
//!
//! Every inbound command goes through [`SignalingRelay::handle`]: the sending
//! connection is checked against the identity it registered with, targets
//! are resolved through the registry, group membership, the call table or a
//! room, and the event is queued on each target's outbound queue. Payloads
//! are forwarded verbatim and never inspected.
//!
//! Connection lifecycle lives here as well. [`SignalingRelay::connect`]
//! registers a connection and announces the user if it is their first;
//! [`SignalingRelay::disconnect`] drops memberships, ends the user's call on
//! their last disconnect and announces them offline, all before it returns.
use chrono::Utc;
use metrics::counter;
use okean_common::{
    CallEndReason, CallId, CallKind, ChatMessage, ClientMessage, ConnectionId, GroupName,
    PrivateMessage, ServerMessage, UserSummary,
};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::calls::{CallManager, CallSession};
use crate::config::{PresenceScope, Settings};
use crate::directory::{IdentityResolver, RelationshipStore};
use crate::error::AppError;
use crate::groups::GroupMembership;
use crate::outbox::{ConnectionSink, Outbox};
use crate::presence::PresenceNotifier;
use crate::registry::{ConnectionRegistry, PresenceEdge};
use crate::rooms::{RoomDeparture, RoomManager};
use crate::storage::MessageStore;
use crate::typing::TypingTracker;
use crate::validation::{self, room_group};

/// Behavior switches of the relay
#[derive(Debug, Clone)]
pub struct RelayOptions {
    pub ring_timeout: Duration,
    pub require_friendship: bool,
    pub presence_scope: PresenceScope,
}

impl Default for RelayOptions {
    fn default() -> Self {
        Self::from(&Settings::default())
    }
}

impl From<&Settings> for RelayOptions {
    fn from(settings: &Settings) -> Self {
        Self {
            ring_timeout: settings.ring_timeout(),
            require_friendship: settings.call.require_friendship,
            presence_scope: settings.presence.scope,
        }
    }
}

/// Identity of one registered connection
#[derive(Debug, Clone)]
pub struct ConnectionContext {
    pub connection_id: ConnectionId,
    pub user: UserSummary,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SignalKind {
    Offer,
    Answer,
    IceCandidate,
}

impl SignalKind {
    fn as_str(self) -> &'static str {
        match self {
            SignalKind::Offer => "offer",
            SignalKind::Answer => "answer",
            SignalKind::IceCandidate => "ice_candidate",
        }
    }

    fn event(
        self,
        from: UserSummary,
        payload: String,
        call_id: Option<CallId>,
        room_id: Option<String>,
    ) -> ServerMessage {
        match self {
            SignalKind::Offer => ServerMessage::ReceiveOffer {
                from,
                payload,
                call_id,
                room_id,
            },
            SignalKind::Answer => ServerMessage::ReceiveAnswer {
                from,
                payload,
                call_id,
                room_id,
            },
            SignalKind::IceCandidate => ServerMessage::ReceiveIceCandidate {
                from,
                payload,
                call_id,
                room_id,
            },
        }
    }
}

struct Signal {
    kind: SignalKind,
    target_user_id: String,
    payload: String,
    room_id: Option<String>,
    from_user_id: Option<String>,
}

pub struct SignalingRelay {
    registry: Arc<ConnectionRegistry>,
    groups: Arc<GroupMembership>,
    outbox: Arc<Outbox>,
    calls: Arc<CallManager>,
    rooms: RoomManager,
    typing: TypingTracker,
    presence: PresenceNotifier,
    identity: Arc<dyn IdentityResolver>,
    relationships: Arc<dyn RelationshipStore>,
    messages: Arc<dyn MessageStore>,
    options: RelayOptions,
}

impl SignalingRelay {
    pub fn new(
        identity: Arc<dyn IdentityResolver>,
        relationships: Arc<dyn RelationshipStore>,
        messages: Arc<dyn MessageStore>,
        options: RelayOptions,
    ) -> Self {
        let registry = Arc::new(ConnectionRegistry::new());
        let groups = Arc::new(GroupMembership::new());
        let outbox = Arc::new(Outbox::new());
        let presence = PresenceNotifier::new(
            registry.clone(),
            groups.clone(),
            outbox.clone(),
            relationships.clone(),
            options.presence_scope,
        );

        Self {
            registry,
            groups,
            outbox,
            calls: Arc::new(CallManager::new()),
            rooms: RoomManager::new(),
            typing: TypingTracker::new(),
            presence,
            identity,
            relationships,
            messages,
            options,
        }
    }

    pub fn registry(&self) -> &ConnectionRegistry {
        &self.registry
    }

    pub fn groups(&self) -> &GroupMembership {
        &self.groups
    }

    pub fn calls(&self) -> &CallManager {
        &self.calls
    }

    pub fn rooms(&self) -> &RoomManager {
        &self.rooms
    }

    /// Live connections with a registered outbound queue
    pub fn connection_count(&self) -> usize {
        self.outbox.connection_count()
    }

    /// Queue an event for a single connection, e.g. a command error
    pub fn send_to_connection(&self, connection_id: ConnectionId, event: ServerMessage) -> bool {
        self.outbox.send_to(connection_id, event)
    }

    /// Register a new connection for an authenticated user.
    ///
    /// The connection gets `Connected` first, then joins `initial_groups`.
    /// If this is the user's first connection they are announced online to
    /// those groups and their interested parties. Finally the connection is
    /// told its unread private message count.
    pub async fn connect(
        &self,
        user: UserSummary,
        sink: ConnectionSink,
        initial_groups: &[GroupName],
    ) -> Result<ConnectionContext, AppError> {
        for group in initial_groups {
            validation::validate_channel_group(group)?;
        }

        let ctx = ConnectionContext {
            connection_id: Uuid::new_v4(),
            user,
        };
        self.outbox.register(ctx.connection_id, sink);
        self.outbox.send_to(
            ctx.connection_id,
            ServerMessage::Connected {
                connection_id: ctx.connection_id,
                user: ctx.user.clone(),
            },
        );

        for group in initial_groups {
            self.join_group(&ctx, group);
        }

        let turn = self.presence.lock_user(&ctx.user.id).await;
        let edge = self.registry.add_connection(&ctx.user.id, ctx.connection_id);
        if edge == PresenceEdge::CameOnline {
            let groups = self.groups.groups_of(ctx.connection_id);
            self.presence.announce_online(&ctx.user, &groups).await;
        }
        drop(turn);

        match self.messages.unread_count(&ctx.user.id).await {
            Ok(count) => {
                self.outbox
                    .send_to(ctx.connection_id, ServerMessage::UnreadMessageCount { count });
            },
            Err(err) => warn!(user_id = %ctx.user.id, error = %err, "could not load unread count"),
        }

        info!(
            user_id = %ctx.user.id,
            connection_id = %ctx.connection_id,
            first = edge == PresenceEdge::CameOnline,
            "connection registered"
        );
        Ok(ctx)
    }

    /// Tear down a connection. Everything is settled before this returns.
    ///
    /// The registry removal, the forced call end and the offline
    /// announcement happen under the user's presence lock, so a connect of
    /// the same user racing with this one is announced after it.
    pub async fn disconnect(&self, ctx: &ConnectionContext) {
        let connection_id = ctx.connection_id;

        for group in self.typing.clear(connection_id) {
            self.broadcast_to_group(
                &group,
                Some(connection_id),
                ServerMessage::UserStoppedTyping {
                    group: group.clone(),
                    user: ctx.user.clone(),
                },
            );
        }

        let mut left_groups = HashSet::new();
        if let Some(departure) = self.rooms.leave_connection(&ctx.user.id, connection_id) {
            left_groups.insert(room_group(&departure.room_id));
            self.depart_room(&departure);
        }

        let groups = self.groups.leave_all(connection_id);
        for group in &groups {
            self.broadcast_to_group(
                group,
                None,
                ServerMessage::UserLeft {
                    group: group.clone(),
                    user: ctx.user.clone(),
                },
            );
        }
        left_groups.extend(groups);

        let turn = self.presence.lock_user(&ctx.user.id).await;
        let edge = self.registry.remove_connection(&ctx.user.id, connection_id);
        if edge == PresenceEdge::WentOffline {
            if let Some(session) = self.calls.force_end_for(&ctx.user.id) {
                let other = session.other_party(&ctx.user.id).clone();
                info!(call_id = %session.call_id, user_id = %ctx.user.id, "call ended by disconnect");
                self.send_to_user(
                    &other.id,
                    None,
                    &ServerMessage::CallEnded {
                        call_id: session.call_id,
                        reason: CallEndReason::Disconnected,
                        by: Some(ctx.user.clone()),
                    },
                );
            }
            self.presence.announce_offline(&ctx.user, &left_groups).await;
        }
        drop(turn);
        if edge == PresenceEdge::WentOffline {
            self.presence.forget_user(&ctx.user.id);
        }

        self.outbox.unregister(connection_id);
        info!(
            user_id = %ctx.user.id,
            connection_id = %connection_id,
            last = edge == PresenceEdge::WentOffline,
            "connection closed"
        );
    }

    /// Execute one command on behalf of a connection
    pub async fn handle(&self, ctx: &ConnectionContext, message: ClientMessage) -> Result<(), AppError> {
        if !self.registry.owns(&ctx.user.id, ctx.connection_id) {
            return Err(AppError::Unauthorized(
                "connection is not registered".to_string(),
            ));
        }
        debug!(connection_id = %ctx.connection_id, msg_type = message.msg_type(), "command");

        match message {
            ClientMessage::JoinGroup { group } => {
                validation::validate_channel_group(&group)?;
                self.join_group(ctx, &group);
                Ok(())
            },
            ClientMessage::LeaveGroup { group } => {
                self.leave_group(ctx, &group);
                Ok(())
            },
            ClientMessage::SendToGroup { group, content } => {
                self.send_to_group(ctx, &group, &content).await
            },
            ClientMessage::StartTyping { group } => self.start_typing(ctx, &group),
            ClientMessage::StopTyping { group } => {
                self.stop_typing(ctx, &group);
                Ok(())
            },
            ClientMessage::SendPrivateMessage {
                target_user_id,
                content,
            } => self.send_private_message(ctx, &target_user_id, &content).await,
            ClientMessage::MarkMessagesRead { from_user_id } => {
                let count = self.messages.mark_read(&ctx.user.id, &from_user_id).await?;
                self.outbox
                    .send_to(ctx.connection_id, ServerMessage::UnreadMessageCount { count });
                Ok(())
            },
            ClientMessage::InitiateCall {
                target_user_id,
                kind,
            } => self.initiate_call(ctx, &target_user_id, kind).await,
            ClientMessage::AcceptCall { call_id } => self.accept_call(ctx, call_id),
            ClientMessage::RejectCall { call_id } => self.reject_call(ctx, call_id),
            ClientMessage::CancelCall { call_id } => {
                let session = self.calls.cancel(&ctx.user.id, call_id)?;
                self.announce_call_end(ctx, &session);
                Ok(())
            },
            ClientMessage::EndCall { call_id } => {
                let session = self.calls.end_call(&ctx.user.id, call_id)?;
                self.announce_call_end(ctx, &session);
                Ok(())
            },
            ClientMessage::HangUp { target_user_id } => {
                let session = self.calls.end_between(&ctx.user.id, &target_user_id)?;
                self.announce_call_end(ctx, &session);
                Ok(())
            },
            ClientMessage::SendOffer {
                target_user_id,
                payload,
                room_id,
                from_user_id,
            } => self.relay_signal(
                ctx,
                Signal {
                    kind: SignalKind::Offer,
                    target_user_id,
                    payload,
                    room_id,
                    from_user_id,
                },
            ),
            ClientMessage::SendAnswer {
                target_user_id,
                payload,
                room_id,
                from_user_id,
            } => self.relay_signal(
                ctx,
                Signal {
                    kind: SignalKind::Answer,
                    target_user_id,
                    payload,
                    room_id,
                    from_user_id,
                },
            ),
            ClientMessage::SendIceCandidate {
                target_user_id,
                payload,
                room_id,
                from_user_id,
            } => self.relay_signal(
                ctx,
                Signal {
                    kind: SignalKind::IceCandidate,
                    target_user_id,
                    payload,
                    room_id,
                    from_user_id,
                },
            ),
            ClientMessage::JoinRoom {
                room_id,
                from_user_id,
            } => {
                check_claim(ctx, from_user_id.as_deref())?;
                validation::validate_room_id(&room_id)?;
                self.join_room(ctx, &room_id);
                Ok(())
            },
            ClientMessage::LeaveRoom { room_id } => {
                if let Some(departure) = self.rooms.leave(&ctx.user.id, &room_id) {
                    self.depart_room(&departure);
                }
                Ok(())
            },
            ClientMessage::GetRoomUsers { room_id } => {
                let participants = self.rooms.participants(&room_id);
                self.outbox.send_to(
                    ctx.connection_id,
                    ServerMessage::RoomUsers {
                        room_id,
                        participants,
                    },
                );
                Ok(())
            },
            ClientMessage::SetMediaState {
                room_id,
                audio_enabled,
                video_enabled,
            } => {
                self.rooms
                    .set_media(&ctx.user.id, &room_id, audio_enabled, video_enabled)?;
                self.broadcast_to_group(
                    &room_group(&room_id),
                    Some(ctx.connection_id),
                    ServerMessage::MediaStateChanged {
                        room_id: room_id.clone(),
                        user_id: ctx.user.id.clone(),
                        audio_enabled,
                        video_enabled,
                    },
                );
                Ok(())
            },
            ClientMessage::GetOnlineUsers => self.list_online_users(ctx).await,
        }
    }

    // ---- groups ----

    fn join_group(&self, ctx: &ConnectionContext, group: &str) {
        if self.groups.join(ctx.connection_id, group) {
            debug!(connection_id = %ctx.connection_id, group, "joined group");
            self.broadcast_to_group(
                group,
                Some(ctx.connection_id),
                ServerMessage::UserJoined {
                    group: group.to_string(),
                    user: ctx.user.clone(),
                },
            );
        }
    }

    fn leave_group(&self, ctx: &ConnectionContext, group: &str) {
        self.stop_typing(ctx, group);
        if self.groups.leave(ctx.connection_id, group) {
            debug!(connection_id = %ctx.connection_id, group, "left group");
            self.broadcast_to_group(
                group,
                None,
                ServerMessage::UserLeft {
                    group: group.to_string(),
                    user: ctx.user.clone(),
                },
            );
        }
    }

    async fn send_to_group(&self, ctx: &ConnectionContext, group: &str, content: &str) -> Result<(), AppError> {
        let members = self.groups.members_of(group);
        if members.is_empty() {
            return Err(AppError::NotFound(format!("group {group}")));
        }
        if !members.contains(&ctx.connection_id) {
            return Err(AppError::Unauthorized(format!("not a member of {group}")));
        }

        let message = ChatMessage {
            id: Uuid::new_v4(),
            group: group.to_string(),
            sender: ctx.user.clone(),
            content: validation::validate_content(content)?.to_string(),
            created_at: Utc::now(),
        };
        self.messages.append_group_message(&message).await?;

        // Fan out to whoever is a member now, not before the write
        let delivered = self.broadcast_to_group(
            group,
            Some(ctx.connection_id),
            ServerMessage::ReceiveMessage {
                group: group.to_string(),
                message: message.clone(),
            },
        );
        self.outbox
            .send_to(ctx.connection_id, ServerMessage::MessageSent { message });

        counter!(crate::metrics::MESSAGES_RELAYED, "scope" => "group").increment(1);
        debug!(group, delivered, "group message relayed");
        Ok(())
    }

    fn start_typing(&self, ctx: &ConnectionContext, group: &str) -> Result<(), AppError> {
        if !self.groups.is_member(ctx.connection_id, group) {
            return Err(AppError::Unauthorized(format!("not a member of {group}")));
        }
        if self.typing.start(ctx.connection_id, group) {
            self.broadcast_to_group(
                group,
                Some(ctx.connection_id),
                ServerMessage::UserTyping {
                    group: group.to_string(),
                    user: ctx.user.clone(),
                },
            );
        }
        Ok(())
    }

    fn stop_typing(&self, ctx: &ConnectionContext, group: &str) {
        if self.typing.stop(ctx.connection_id, group) {
            self.broadcast_to_group(
                group,
                Some(ctx.connection_id),
                ServerMessage::UserStoppedTyping {
                    group: group.to_string(),
                    user: ctx.user.clone(),
                },
            );
        }
    }

    // ---- private messages ----

    async fn send_private_message(
        &self,
        ctx: &ConnectionContext,
        target_user_id: &str,
        content: &str,
    ) -> Result<(), AppError> {
        if target_user_id == ctx.user.id {
            return Err(AppError::InvalidArgument(
                "Cannot message yourself".to_string(),
            ));
        }
        if !self.relationships.are_friends(&ctx.user.id, target_user_id).await? {
            return Err(AppError::Unauthorized(
                "You can only message friends".to_string(),
            ));
        }

        let message = PrivateMessage {
            id: Uuid::new_v4(),
            sender: ctx.user.clone(),
            receiver_id: target_user_id.to_string(),
            content: validation::validate_content(content)?.to_string(),
            created_at: Utc::now(),
            is_read: false,
        };
        self.messages.append_private_message(&message).await?;

        let event = ServerMessage::ReceivePrivateMessage { message };
        self.send_to_user(target_user_id, None, &event);
        self.send_to_user(&ctx.user.id, Some(ctx.connection_id), &event);
        counter!(crate::metrics::MESSAGES_RELAYED, "scope" => "private").increment(1);
        Ok(())
    }

    // ---- one-to-one calls ----

    async fn initiate_call(&self, ctx: &ConnectionContext, target_user_id: &str, kind: CallKind) -> Result<(), AppError> {
        if target_user_id == ctx.user.id {
            return Err(AppError::InvalidArgument("Cannot call yourself".to_string()));
        }
        let callee = self
            .identity
            .profile(target_user_id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("user {target_user_id}")))?;
        if self.options.require_friendship
            && !self.relationships.are_friends(&ctx.user.id, target_user_id).await?
        {
            return Err(AppError::Unauthorized(
                "You can only call friends".to_string(),
            ));
        }

        // The caller may have disconnected during the lookups above
        let session = self.calls.initiate(
            &ctx.user,
            ctx.connection_id,
            &callee,
            kind,
            || self.registry.owns(&ctx.user.id, ctx.connection_id),
            || self.registry.is_online(target_user_id),
        )?;
        self.arm_ring_timer(session.call_id);

        self.outbox.send_to(
            ctx.connection_id,
            ServerMessage::CallInitiated {
                call_id: session.call_id,
                callee: callee.clone(),
                kind,
            },
        );
        self.send_to_user(
            &callee.id,
            None,
            &ServerMessage::IncomingCall {
                call_id: session.call_id,
                caller: ctx.user.clone(),
                kind,
            },
        );

        info!(call_id = %session.call_id, caller = %ctx.user.id, callee = %callee.id, "call initiated");
        Ok(())
    }

    /// End the call automatically when nobody answers in time
    fn arm_ring_timer(&self, call_id: CallId) {
        let calls = self.calls.clone();
        let outbox = self.outbox.clone();
        let registry = self.registry.clone();
        let timeout = self.options.ring_timeout;

        let timer = tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            if let Some(session) = calls.expire(call_id) {
                info!(call_id = %call_id, "call timed out");
                let event = ServerMessage::CallEnded {
                    call_id,
                    reason: CallEndReason::Timeout,
                    by: None,
                };
                for user_id in [&session.caller.id, &session.callee.id] {
                    let connections = registry.connections_of(user_id);
                    outbox.send_to_many(connections.iter(), None, &event);
                }
            }
        });
        self.calls.attach_ring_timer(call_id, timer.abort_handle());
    }

    fn accept_call(&self, ctx: &ConnectionContext, call_id: CallId) -> Result<(), AppError> {
        let session = self.calls.accept(&ctx.user.id, call_id, ctx.connection_id)?;

        // Every device of both parties learns the call was picked up
        let event = ServerMessage::CallAccepted {
            call_id,
            by: ctx.user.clone(),
        };
        self.send_to_user(&session.caller.id, None, &event);
        self.send_to_user(&session.callee.id, None, &event);

        info!(call_id = %call_id, "call accepted");
        Ok(())
    }

    fn reject_call(&self, ctx: &ConnectionContext, call_id: CallId) -> Result<(), AppError> {
        let session = self.calls.reject(&ctx.user.id, call_id)?;

        let event = ServerMessage::CallRejected {
            call_id,
            by: ctx.user.clone(),
        };
        self.send_to_user(&session.caller.id, None, &event);
        self.send_to_user(&session.callee.id, Some(ctx.connection_id), &event);

        info!(call_id = %call_id, "call rejected");
        Ok(())
    }

    /// Tell both parties (bar the invoking connection) that a call ended
    fn announce_call_end(&self, ctx: &ConnectionContext, session: &CallSession) {
        let event = ServerMessage::CallEnded {
            call_id: session.call_id,
            reason: session.end_reason.unwrap_or(CallEndReason::HungUp),
            by: Some(ctx.user.clone()),
        };
        let other = session.other_party(&ctx.user.id);
        self.send_to_user(&other.id, None, &event);
        self.send_to_user(&ctx.user.id, Some(ctx.connection_id), &event);
        info!(call_id = %session.call_id, by = %ctx.user.id, "call ended");
    }

    // ---- signaling ----

    fn relay_signal(&self, ctx: &ConnectionContext, signal: Signal) -> Result<(), AppError> {
        let is_ice = signal.kind == SignalKind::IceCandidate;

        if let Err(err) = check_claim(ctx, signal.from_user_id.as_deref()) {
            if is_ice {
                debug!(connection_id = %ctx.connection_id, "dropping ICE candidate with mismatched sender");
                return Ok(());
            }
            return Err(err);
        }

        let (targets, call_id) = match &signal.room_id {
            Some(room_id) => match self.rooms.peer_in_room(room_id, &ctx.user.id, &signal.target_user_id) {
                Some(peer) => (vec![peer.connection_id], None),
                None if is_ice => {
                    debug!(room_id = %room_id, "dropping ICE candidate outside a shared room");
                    return Ok(());
                },
                None => {
                    return Err(AppError::NotFound(format!(
                        "participant {} in room {room_id}",
                        signal.target_user_id
                    )))
                },
            },
            None => match self.calls.authorize_signal(&ctx.user.id, &signal.target_user_id) {
                Ok(session) => {
                    if signal.kind == SignalKind::Answer && self.calls.mark_connected(session.call_id) {
                        info!(call_id = %session.call_id, "call connected");
                    }
                    let targets = match session.connection_of(&signal.target_user_id) {
                        Some(bound) if self.registry.owns(&signal.target_user_id, bound) => vec![bound],
                        _ => self
                            .registry
                            .connections_of(&signal.target_user_id)
                            .into_iter()
                            .collect(),
                    };
                    (targets, Some(session.call_id))
                },
                Err(AppError::CallNotFound) if is_ice => {
                    debug!(connection_id = %ctx.connection_id, "dropping ICE candidate without a call");
                    return Ok(());
                },
                Err(err) => return Err(err),
            },
        };

        let event = signal
            .kind
            .event(ctx.user.clone(), signal.payload, call_id, signal.room_id);
        self.outbox.send_to_many(targets.iter(), None, &event);
        counter!(crate::metrics::SIGNALS_RELAYED, "kind" => signal.kind.as_str()).increment(1);
        Ok(())
    }

    // ---- rooms ----

    fn join_room(&self, ctx: &ConnectionContext, room_id: &str) {
        let join = self.rooms.join(&ctx.user, ctx.connection_id, room_id);
        let group = room_group(room_id);

        if let Some(previous) = &join.previous {
            self.depart_room(previous);
        }
        if let Some(stale) = join.replaced_connection {
            self.groups.leave(stale, &group);
        }

        self.groups.join(ctx.connection_id, &group);
        if join.replaced_connection.is_none() {
            self.broadcast_to_group(
                &group,
                Some(ctx.connection_id),
                ServerMessage::UserJoined {
                    group: group.clone(),
                    user: ctx.user.clone(),
                },
            );
        }

        self.outbox.send_to(
            ctx.connection_id,
            ServerMessage::JoinedRoom {
                room_id: room_id.to_string(),
                participants: join.others,
            },
        );
        info!(room_id, user_id = %ctx.user.id, "joined room");
    }

    /// Drop a departed participant's connection from the room group and
    /// tell the rest of the room
    fn depart_room(&self, departure: &RoomDeparture) {
        let group = room_group(&departure.room_id);
        let connection_id = departure.participant.connection_id;

        if self.typing.stop(connection_id, &group) {
            self.broadcast_to_group(
                &group,
                Some(connection_id),
                ServerMessage::UserStoppedTyping {
                    group: group.clone(),
                    user: departure.participant.user.clone(),
                },
            );
        }
        if self.groups.leave(connection_id, &group) {
            self.broadcast_to_group(
                &group,
                None,
                ServerMessage::UserLeft {
                    group: group.clone(),
                    user: departure.participant.user.clone(),
                },
            );
        }
        info!(room_id = %departure.room_id, user_id = %departure.participant.user.id, "left room");
    }

    // ---- queries ----

    async fn list_online_users(&self, ctx: &ConnectionContext) -> Result<(), AppError> {
        let mut ids: Vec<_> = self
            .registry
            .all_online_user_ids()
            .into_iter()
            .filter(|id| *id != ctx.user.id)
            .collect();
        ids.sort();

        let mut users = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(user) = self.identity.profile(&id).await? {
                users.push(user);
            }
        }
        self.outbox
            .send_to(ctx.connection_id, ServerMessage::OnlineUsers { users });
        Ok(())
    }

    // ---- delivery helpers ----

    fn broadcast_to_group(&self, group: &str, except: Option<ConnectionId>, event: ServerMessage) -> usize {
        let members = self.groups.members_of(group);
        self.outbox.send_to_many(members.iter(), except, &event)
    }

    fn send_to_user(&self, user_id: &str, except: Option<ConnectionId>, event: &ServerMessage) -> usize {
        let connections = self.registry.connections_of(user_id);
        self.outbox.send_to_many(connections.iter(), except, event)
    }
}

/// A client may name itself in a command; it must be the connection's user
fn check_claim(ctx: &ConnectionContext, claimed: Option<&str>) -> Result<(), AppError> {
    match claimed {
        Some(claimed) if claimed != ctx.user.id => Err(AppError::Unauthorized(
            "claimed identity does not match connection".to_string(),
        )),
        _ => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::directory::StaticDirectory;
    use crate::storage::FlatFileStorage;
    use tempfile::TempDir;
    use tokio::sync::mpsc;

    struct Harness {
        relay: SignalingRelay,
        _dir: TempDir,
    }

    fn harness() -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let directory = Arc::new(StaticDirectory::new());
        for id in ["ana", "ben"] {
            directory.add_user(&format!("{id}-token"), UserSummary::new(id, id));
        }
        directory.add_friendship("ana", "ben");
        let storage = Arc::new(FlatFileStorage::new(dir.path()).unwrap());
        let relay = SignalingRelay::new(directory.clone(), directory, storage, RelayOptions::default());
        Harness { relay, _dir: dir }
    }

    async fn connect(relay: &SignalingRelay, id: &str) -> (ConnectionContext, mpsc::Receiver<ServerMessage>) {
        let (tx, mut rx) = mpsc::channel(32);
        let ctx = relay.connect(UserSummary::new(id, id), tx, &[]).await.unwrap();
        // Connected + UnreadMessageCount
        assert!(matches!(rx.recv().await, Some(ServerMessage::Connected { .. })));
        assert!(matches!(rx.recv().await, Some(ServerMessage::UnreadMessageCount { count: 0 })));
        (ctx, rx)
    }

    #[tokio::test]
    async fn test_unregistered_connection_is_rejected() {
        let h = harness();
        let ctx = ConnectionContext {
            connection_id: Uuid::new_v4(),
            user: UserSummary::new("ana", "ana"),
        };
        let result = h.relay.handle(&ctx, ClientMessage::GetOnlineUsers).await;
        assert!(matches!(result, Err(AppError::Unauthorized(_))));
    }

    #[tokio::test]
    async fn test_connect_rejects_room_groups() {
        let h = harness();
        let (tx, _rx) = mpsc::channel(4);
        let result = h
            .relay
            .connect(UserSummary::new("ana", "ana"), tx, &["room:x".to_string()])
            .await;
        assert!(matches!(result, Err(AppError::InvalidArgument(_))));
        assert!(!h.relay.registry().is_online("ana"));
    }

    #[tokio::test]
    async fn test_claimed_identity_must_match() {
        let h = harness();
        let (ana, _ana_rx) = connect(&h.relay, "ana").await;

        let offer = ClientMessage::SendOffer {
            target_user_id: "ben".to_string(),
            payload: "sdp".to_string(),
            room_id: None,
            from_user_id: Some("ben".to_string()),
        };
        assert!(matches!(h.relay.handle(&ana, offer).await, Err(AppError::Unauthorized(_))));

        // ICE with a forged sender is dropped quietly
        let ice = ClientMessage::SendIceCandidate {
            target_user_id: "ben".to_string(),
            payload: "candidate".to_string(),
            room_id: None,
            from_user_id: Some("ben".to_string()),
        };
        assert!(h.relay.handle(&ana, ice).await.is_ok());
    }

    #[tokio::test]
    async fn test_typing_requires_membership_and_clears_on_leave() {
        let h = harness();
        let (ana, _ana_rx) = connect(&h.relay, "ana").await;
        let (ben, mut ben_rx) = connect(&h.relay, "ben").await;

        let start = ClientMessage::StartTyping {
            group: "channel:general".to_string(),
        };
        assert!(matches!(
            h.relay.handle(&ana, start.clone()).await,
            Err(AppError::Unauthorized(_))
        ));

        for ctx in [&ben, &ana] {
            h.relay
                .handle(ctx, ClientMessage::JoinGroup { group: "channel:general".to_string() })
                .await
                .unwrap();
        }
        assert!(matches!(ben_rx.recv().await, Some(ServerMessage::UserJoined { .. })));

        h.relay.handle(&ana, start).await.unwrap();
        assert!(matches!(ben_rx.recv().await, Some(ServerMessage::UserTyping { .. })));

        h.relay
            .handle(&ana, ClientMessage::LeaveGroup { group: "channel:general".to_string() })
            .await
            .unwrap();
        assert!(matches!(ben_rx.recv().await, Some(ServerMessage::UserStoppedTyping { .. })));
        assert!(matches!(ben_rx.recv().await, Some(ServerMessage::UserLeft { .. })));
    }
}
