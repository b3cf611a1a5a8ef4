// crates/common/tests/protocol.rs
use okean_common::{CallEndReason, CallKind, ClientMessage, ServerMessage, UserSummary};
use serde_json::json;
use uuid::Uuid;

#[test]
fn test_client_message_uses_msg_type_tag() {
    let raw = json!({
        "msgType": "InitiateCall",
        "target_user_id": "bob",
        "kind": "video"
    });

    let msg: ClientMessage = serde_json::from_value(raw).unwrap();
    match msg {
        ClientMessage::InitiateCall { target_user_id, kind } => {
            assert_eq!(target_user_id, "bob");
            assert_eq!(kind, CallKind::Video);
        },
        other => panic!("Wrong variant: {other:?}"),
    }
}

#[test]
fn test_signaling_optional_fields_default_to_none() {
    let raw = json!({
        "msgType": "SendIceCandidate",
        "target_user_id": "bob",
        "payload": "{\"candidate\":\"a=1\"}"
    });

    let msg: ClientMessage = serde_json::from_value(raw).unwrap();
    let ClientMessage::SendIceCandidate { room_id, from_user_id, payload, .. } = msg else {
        panic!("Expected SendIceCandidate")
    };
    assert!(room_id.is_none());
    assert!(from_user_id.is_none());
    // Payload is carried verbatim
    assert_eq!(payload, "{\"candidate\":\"a=1\"}");
}

#[test]
fn test_unit_variant_parses() {
    let msg: ClientMessage = serde_json::from_str(r#"{"msgType":"GetOnlineUsers"}"#).unwrap();
    assert!(matches!(msg, ClientMessage::GetOnlineUsers));
    assert_eq!(msg.msg_type(), "GetOnlineUsers");
    assert!(!msg.is_call_command());
}

#[test]
fn test_call_commands_are_classified_by_tag() {
    let msg = ClientMessage::SendIceCandidate {
        target_user_id: "ben".to_string(),
        payload: "candidate".to_string(),
        room_id: None,
        from_user_id: None,
    };
    assert!(msg.is_call_command());
    assert!(ClientMessage::is_call_msg_type("InitiateCall"));
    assert!(ClientMessage::is_call_msg_type("HangUp"));
    assert!(!ClientMessage::is_call_msg_type("JoinRoom"));
    assert!(!ClientMessage::is_call_msg_type("initiatecall"));
}

#[test]
fn test_unknown_msg_type_is_rejected() {
    let result = serde_json::from_str::<ClientMessage>(r#"{"msgType":"Teleport"}"#);
    assert!(result.is_err());
}

#[test]
fn test_call_ended_wire_format() {
    let call_id = Uuid::new_v4();
    let msg = ServerMessage::CallEnded {
        call_id,
        reason: CallEndReason::Timeout,
        by: None,
    };

    let value = serde_json::to_value(&msg).unwrap();
    assert_eq!(value["msgType"], "CallEnded");
    assert_eq!(value["reason"], "timeout");
    assert_eq!(value["call_id"], call_id.to_string());
    // `by` is omitted entirely when unknown
    assert!(value.get("by").is_none());
}

#[test]
fn test_user_summary_omits_missing_avatar() {
    let plain = serde_json::to_value(UserSummary::new("u1", "Ana")).unwrap();
    assert!(plain.get("avatar_ref").is_none());

    let with_avatar = serde_json::to_value(UserSummary::new("u1", "Ana").with_avatar("a.png")).unwrap();
    assert_eq!(with_avatar["avatar_ref"], "a.png");
}
