use color_eyre::{eyre::eyre, Result};
use futures::future::BoxFuture;
use reqwest::{Client, Method};
use serde_json::Value;
use url::Url;

use super::action::{ActionKind, Operation, QueuedAction};
use super::replay::ActionDispatcher;
use crate::error::ReplayError;

/// Replays actions against the REST API.
#[derive(Clone)]
pub struct HttpDispatcher {
  client: Client,
  base_url: Url,
  token: Option<String>,
}

impl HttpDispatcher {
  pub fn new(client: Client, base_url: &str, token: Option<String>) -> Result<Self> {
    let base_url =
      Url::parse(base_url).map_err(|e| eyre!("Invalid base URL '{}': {}", base_url, e))?;
    if base_url.cannot_be_a_base() {
      return Err(eyre!("Base URL '{}' cannot take a path", base_url));
    }
    Ok(Self {
      client,
      base_url,
      token,
    })
  }

  /// Base URL with `segments` appended, each percent-encoded as a single segment.
  pub fn endpoint(&self, segments: &[String]) -> Url {
    let mut url = self.base_url.clone();
    // new() rejects cannot-be-a-base URLs
    if let Ok(mut path) = url.path_segments_mut() {
      path.pop_if_empty().extend(segments);
    }
    url
  }
}

/// `.` and `..` would be dropped or resolved instead of encoded.
fn segment(value: String, field: &'static str) -> Result<String, ReplayError> {
  if value == "." || value == ".." {
    return Err(ReplayError::InvalidField(field));
  }
  Ok(value)
}

fn path_id(payload: &Value, field: &'static str) -> Result<String, ReplayError> {
  match payload.get(field) {
    Some(Value::String(s)) if !s.is_empty() => segment(s.clone(), field),
    Some(Value::Number(n)) => Ok(n.to_string()),
    _ => Err(ReplayError::MissingField(field)),
  }
}

/// Method and path segments for an action, with ids taken from its payload.
pub fn route(action: &QueuedAction) -> Result<(Method, Vec<String>), ReplayError> {
  let collection = match &action.kind {
    ActionKind::Highlight => "highlights".to_string(),
    ActionKind::Note => "notes".to_string(),
    ActionKind::ViewRecord => {
      return match action.operation {
        Operation::Create | Operation::Update => {
          let document = path_id(&action.payload, "document_id")?;
          Ok((
            Method::POST,
            vec!["documents".to_string(), document, "view".to_string()],
          ))
        }
        Operation::Delete => Err(ReplayError::Unsupported {
          kind: action.kind.to_string(),
          operation: action.operation.to_string(),
        }),
      };
    }
    ActionKind::Custom(kind) => segment(kind.clone(), "kind")?,
  };

  Ok(match action.operation {
    Operation::Create => (Method::POST, vec![collection]),
    Operation::Update => (
      Method::PUT,
      vec![collection, path_id(&action.payload, "id")?],
    ),
    Operation::Delete => (
      Method::DELETE,
      vec![collection, path_id(&action.payload, "id")?],
    ),
  })
}

impl ActionDispatcher for HttpDispatcher {
  fn dispatch<'a>(&'a self, action: &'a QueuedAction) -> BoxFuture<'a, Result<(), ReplayError>> {
    Box::pin(async move {
      let (method, segments) = route(action)?;
      let url = self.endpoint(&segments);

      let mut request = self
        .client
        .request(method.clone(), url.clone())
        .header("Idempotency-Key", &action.id);
      if let Some(token) = &self.token {
        request = request.bearer_auth(token);
      }
      if method != Method::DELETE {
        request = request.json(&action.payload);
      }

      let response = request
        .send()
        .await
        .map_err(|e| ReplayError::Network(e.to_string()))?;

      let status = response.status();
      tracing::debug!(id = %action.id, %method, %url, %status, "action dispatched");
      if status.is_success() {
        Ok(())
      } else {
        Err(ReplayError::Rejected {
          status: status.as_u16(),
        })
      }
    })
  }
}
