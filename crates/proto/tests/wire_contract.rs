use proto::event::{AUTHENTICATION, RELAY};
use proto::{
    AuthRequest, ClusterPacket, CredentialRecord, Frame, INTERNAL_MARKER, RelayEnvelope,
    SessionToken, TokenKind,
};
use serde_json::{Value, json};

#[test]
fn client_frames_decode_with_defaults() {
    let frame = Frame::decode(r#"{"type":"event","event":"authentication","data":{"id":"t"}}"#)
        .expect("event frame");
    assert_eq!(frame, Frame::event(AUTHENTICATION, json!({"id": "t"})));

    let bare = Frame::decode(r#"{"type":"event","nsp":"/chat","event":"typing"}"#)
        .expect("event without data");
    assert_eq!(bare, Frame::namespaced("/chat", "typing", Value::Null));

    let connect = Frame::decode(r#"{"type":"connect","nsp":"/chat"}"#).expect("connect frame");
    assert_eq!(
        connect,
        Frame::Connect {
            nsp: "/chat".to_string()
        }
    );
}

#[test]
fn server_frames_encode_with_type_tag() {
    let text = Frame::namespaced("/chat", "msg", json!([1, 2]))
        .encode()
        .expect("encode");
    let value: Value = serde_json::from_str(&text).expect("json");
    assert_eq!(
        value,
        json!({"type": "event", "nsp": "/chat", "event": "msg", "data": [1, 2]})
    );
}

#[test]
fn relay_envelope_payload_contract() {
    let frame = Frame::decode(
        &json!({"type": "event", "event": RELAY, "data": {"event": "news", "data": {"n": 1}}})
            .to_string(),
    )
    .expect("relay frame");
    let Frame::Event { event, data, .. } = frame else {
        panic!("expected event frame");
    };
    assert_eq!(event, RELAY);
    let envelope: RelayEnvelope = serde_json::from_value(data).expect("envelope");
    assert_eq!(envelope.event, "news");
    assert_eq!(envelope.data, json!({"n": 1}));
}

#[test]
fn credential_handshake_produces_merged_session_token() {
    let payload = json!({"id": 17, "user": {"name": "x"}, "device": "ios"});
    let AuthRequest::Credential { id, fields } =
        AuthRequest::decode(&payload, INTERNAL_MARKER).expect("credential request")
    else {
        panic!("expected credential request");
    };
    assert_eq!(id, "17");

    let record = CredentialRecord::from_value(json!({"id": "17", "userId": 99, "device": "web"}))
        .expect("record");
    let token = SessionToken::from_credential(fields, record);
    assert_eq!(token.kind, TokenKind::Credential);
    assert_eq!(token.user_id().as_deref(), Some("99"));
    assert_eq!(token.fields.get("device"), Some(&json!("web")));
    assert!(!token.fields.contains_key("user"));
}

#[test]
fn cluster_packet_json_contract() {
    let packet = ClusterPacket {
        origin: "instance-a".to_string(),
        nsp: "/".to_string(),
        room: Some("flint".to_string()),
        event: "sync".to_string(),
        data: json!({"v": 1}),
    };
    let value = serde_json::to_value(&packet).expect("serialize");
    assert_eq!(
        value,
        json!({"origin": "instance-a", "nsp": "/", "room": "flint", "event": "sync", "data": {"v": 1}})
    );
    let back: ClusterPacket = serde_json::from_value(value).expect("deserialize");
    assert_eq!(back, packet);
}
