//! JSON message envelope carried over every channel.
//!
//! Every frame is a JSON object with a `type` discriminator. Known kinds are
//! decoded into their own variant; the body is kept as the whole object since
//! its fields belong to the application, not to the transport.

use serde_json::{json, Map, Value};

#[derive(Debug, Clone, PartialEq)]
pub enum Envelope {
  Ping,
  Pong,
  AttendanceUpdate(Value),
  DocumentShared(Value),
  SessionReportReady(Value),
  AttendanceWarning(Value),
  /// Any other `type`; still delivered to the application
  Unknown { kind: String, body: Value },
}

#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
  #[error("invalid JSON: {0}")]
  Json(#[from] serde_json::Error),
  #[error("message is not a JSON object")]
  NotAnObject,
  #[error("message has no string `type` field")]
  MissingType,
}

impl Envelope {
  /// Decode a text frame.
  pub fn decode(text: &str) -> Result<Self, DecodeError> {
    let value: Value = serde_json::from_str(text)?;
    let kind = match &value {
      Value::Object(map) => match map.get("type") {
        Some(Value::String(kind)) => kind.clone(),
        _ => return Err(DecodeError::MissingType),
      },
      _ => return Err(DecodeError::NotAnObject),
    };

    Ok(match kind.as_str() {
      "ping" => Self::Ping,
      "pong" => Self::Pong,
      "attendance_update" => Self::AttendanceUpdate(value),
      "document_shared" => Self::DocumentShared(value),
      "session_report_ready" => Self::SessionReportReady(value),
      "attendance_warning" => Self::AttendanceWarning(value),
      _ => Self::Unknown { kind, body: value },
    })
  }

  /// Build an envelope of arbitrary kind from a JSON object body.
  ///
  /// The `type` field of `body` is overwritten with `kind`.
  pub fn custom(kind: impl Into<String>, body: Value) -> Self {
    let kind = kind.into();
    let mut map = match body {
      Value::Object(map) => map,
      Value::Null => Map::new(),
      other => {
        let mut map = Map::new();
        map.insert("data".to_string(), other);
        map
      }
    };
    map.insert("type".to_string(), Value::String(kind.clone()));
    Self::Unknown {
      kind,
      body: Value::Object(map),
    }
  }

  pub fn kind(&self) -> &str {
    match self {
      Self::Ping => "ping",
      Self::Pong => "pong",
      Self::AttendanceUpdate(_) => "attendance_update",
      Self::DocumentShared(_) => "document_shared",
      Self::SessionReportReady(_) => "session_report_ready",
      Self::AttendanceWarning(_) => "attendance_warning",
      Self::Unknown { kind, .. } => kind,
    }
  }

  /// The full JSON object for this envelope.
  pub fn to_value(&self) -> Value {
    match self {
      Self::Ping => json!({ "type": "ping" }),
      Self::Pong => json!({ "type": "pong" }),
      Self::AttendanceUpdate(body)
      | Self::DocumentShared(body)
      | Self::SessionReportReady(body)
      | Self::AttendanceWarning(body)
      | Self::Unknown { body, .. } => body.clone(),
    }
  }

  pub fn encode(&self) -> Result<String, serde_json::Error> {
    serde_json::to_string(&self.to_value())
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_decode_known_kinds() {
    let msg = r#"{"type":"document_shared","document_id":"d1","title":"Week 3"}"#;
    match Envelope::decode(msg).unwrap() {
      Envelope::DocumentShared(body) => assert_eq!(body["title"], "Week 3"),
      other => panic!("unexpected {:?}", other),
    }

    assert_eq!(Envelope::decode(r#"{"type":"pong"}"#).unwrap(), Envelope::Pong);
    assert_eq!(Envelope::decode(r#"{"type":"ping","ts":1}"#).unwrap(), Envelope::Ping);
  }

  #[test]
  fn test_unknown_kind_is_kept() {
    let env = Envelope::decode(r#"{"type":"class_cancelled","class_id":"c9"}"#).unwrap();
    assert_eq!(env.kind(), "class_cancelled");
    assert_eq!(env.to_value()["class_id"], "c9");
  }

  #[test]
  fn test_malformed_frames() {
    assert!(matches!(
      Envelope::decode("not json"),
      Err(DecodeError::Json(_))
    ));
    assert!(matches!(
      Envelope::decode("[1,2]"),
      Err(DecodeError::NotAnObject)
    ));
    assert!(matches!(
      Envelope::decode(r#"{"kind":"x"}"#),
      Err(DecodeError::MissingType)
    ));
  }

  #[test]
  fn test_custom_sets_type() {
    let env = Envelope::custom("join_document", json!({ "document_id": "d1", "type": "x" }));
    let text = env.encode().unwrap();
    let decoded = Envelope::decode(&text).unwrap();
    assert_eq!(decoded.kind(), "join_document");
    assert_eq!(decoded.to_value()["document_id"], "d1");
  }
}
