// ==============
// crates/backend-lib/src/metrics.rs

//! Central place for metric keys
pub const WS_CONNECTION: &str = "ws.connection";
pub const WS_ACTIVE: &str = "ws.active";
pub const USERS_ONLINE: &str = "presence.users_online";
pub const CALLS_STARTED: &str = "call.started";
pub const CALLS_ENDED: &str = "call.ended";
pub const CALLS_ACTIVE: &str = "call.active";
pub const ROOMS_ACTIVE: &str = "room.active";
pub const MESSAGES_RELAYED: &str = "relay.messages";
pub const SIGNALS_RELAYED: &str = "relay.signals";
pub const DELIVERY_DROPPED: &str = "relay.delivery_dropped";
pub const COMMANDS_REJECTED: &str = "ws.commands_rejected";
