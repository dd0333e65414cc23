use std::pin::Pin;

use anyhow::{Context, Result};
use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::{future, Sink, SinkExt, StreamExt};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info};

/// Outbound half of a session: serialized JSON frames
pub type FrameSink = Pin<Box<dyn Sink<String, Error = anyhow::Error> + Send>>;

/// Inbound half of a session: raw JSON frames
pub type FrameStream = BoxStream<'static, Result<String>>;

/// An open duplex session
pub struct Duplex {
    pub sink: FrameSink,
    pub stream: FrameStream,
}

/// Opens duplex sessions to the remote agent
#[async_trait]
pub trait Connector: Send + Sync {
    async fn open(&self) -> Result<Duplex>;

    /// Endpoint description for logging
    fn name(&self) -> &str;
}

/// WebSocket connector for the realtime endpoint
pub struct WebSocketConnector {
    url: String,
    api_key: String,
}

impl WebSocketConnector {
    pub fn new(url: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            api_key: api_key.into(),
        }
    }
}

#[async_trait]
impl Connector for WebSocketConnector {
    async fn open(&self) -> Result<Duplex> {
        info!("Connecting to realtime endpoint at {}", self.url);

        let mut request = self
            .url
            .as_str()
            .into_client_request()
            .context("Invalid realtime URL")?;

        let headers = request.headers_mut();
        headers.insert(
            "Authorization",
            HeaderValue::from_str(&format!("Bearer {}", self.api_key))
                .context("API key is not a valid header value")?,
        );
        headers.insert("OpenAI-Beta", HeaderValue::from_static("realtime=v1"));

        let (socket, response) = tokio_tungstenite::connect_async(request)
            .await
            .context("Failed to connect to realtime endpoint")?;

        info!("Realtime socket open (HTTP {})", response.status());

        let (write, read) = socket.split();

        let sink = write
            .sink_map_err(anyhow::Error::from)
            .with(|text: String| future::ok::<_, anyhow::Error>(Message::Text(text)));

        let stream = read.filter_map(|message| {
            future::ready(match message {
                Ok(Message::Text(text)) => Some(Ok(text)),
                Ok(Message::Close(frame)) => {
                    info!("Realtime socket closed by remote: {:?}", frame);
                    None
                }
                Ok(other) => {
                    debug!("Ignoring non-text frame ({} bytes)", other.len());
                    None
                }
                Err(e) => Some(Err(anyhow::Error::from(e))),
            })
        });

        Ok(Duplex {
            sink: Box::pin(sink),
            stream: stream.boxed(),
        })
    }

    fn name(&self) -> &str {
        &self.url
    }
}
