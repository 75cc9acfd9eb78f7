//! Socket seam between the connection state machine and the wire.

use futures::future::{self, BoxFuture};
use futures::{Sink, SinkExt, Stream, StreamExt};
use std::pin::Pin;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::header::AUTHORIZATION;
use tokio_tungstenite::tungstenite::Message;

use crate::error::TransportError;

pub type FrameSink = Pin<Box<dyn Sink<String, Error = TransportError> + Send>>;
pub type FrameStream = Pin<Box<dyn Stream<Item = Result<String, TransportError>> + Send>>;

/// An open text-frame socket, split into its write and read halves.
pub struct Socket {
  pub sink: FrameSink,
  pub stream: FrameStream,
}

/// Opens sockets to an endpoint URL.
pub trait Connector: Send + Sync + 'static {
  fn connect(&self, url: &str) -> BoxFuture<'static, Result<Socket, TransportError>>;
}

/// WebSocket connector backed by tokio-tungstenite.
#[derive(Debug, Clone, Default)]
pub struct WsConnector {
  token: Option<String>,
}

impl WsConnector {
  pub fn new(token: Option<String>) -> Self {
    Self { token }
  }
}

impl Connector for WsConnector {
  fn connect(&self, url: &str) -> BoxFuture<'static, Result<Socket, TransportError>> {
    let url = url.to_string();
    let token = self.token.clone();

    Box::pin(async move {
      let mut request = url
        .as_str()
        .into_client_request()
        .map_err(|e| TransportError::Connect(format!("invalid URL {}: {}", url, e)))?;

      if let Some(token) = token {
        let value = format!("Bearer {}", token)
          .parse()
          .map_err(|e| TransportError::Connect(format!("invalid token header: {}", e)))?;
        request.headers_mut().insert(AUTHORIZATION, value);
      }

      let (ws, _) = tokio_tungstenite::connect_async(request)
        .await
        .map_err(|e| TransportError::Connect(e.to_string()))?;

      let (write, read) = ws.split();

      let sink = write
        .with(|text: String| future::ready(Ok::<_, tokio_tungstenite::tungstenite::Error>(Message::text(text))))
        .sink_map_err(|e| TransportError::Io(e.to_string()));

      // Control frames are answered by tungstenite; only text reaches the state machine.
      let stream = read.filter_map(|frame| {
        future::ready(match frame {
          Ok(Message::Text(text)) => Some(Ok(text.as_str().to_owned())),
          Ok(Message::Close(_)) => Some(Err(TransportError::ClosedByPeer)),
          Ok(_) => None,
          Err(e) => Some(Err(TransportError::Io(e.to_string()))),
        })
      });

      Ok(Socket {
        sink: Box::pin(sink),
        stream: Box::pin(stream),
      })
    })
  }
}
