use async_trait::async_trait;
use axum::extract::ws::{CloseFrame, Message, WebSocket};
use futures_util::stream::SplitSink;
use futures_util::stream::SplitStream;
use futures_util::{SinkExt, StreamExt};
use gateway_core::connection::{SocketReader, SocketWriter};

pub struct AxumSocketReader {
    inner: SplitStream<WebSocket>,
}

impl AxumSocketReader {
    pub fn new(inner: SplitStream<WebSocket>) -> Self {
        Self { inner }
    }
}

#[async_trait]
impl SocketReader for AxumSocketReader {
    async fn recv(&mut self) -> Option<Result<Vec<u8>, String>> {
        loop {
            return match self.inner.next().await? {
                Ok(Message::Text(text)) => Some(Ok(text.into_bytes())),
                Ok(Message::Binary(bytes)) => Some(Ok(bytes)),
                Ok(Message::Ping(_)) | Ok(Message::Pong(_)) => continue,
                Ok(Message::Close(_)) => None,
                Err(err) => Some(Err(err.to_string())),
            };
        }
    }
}

pub struct AxumSocketWriter {
    inner: SplitSink<WebSocket, Message>,
}

impl AxumSocketWriter {
    pub fn new(inner: SplitSink<WebSocket, Message>) -> Self {
        Self { inner }
    }
}

#[async_trait]
impl SocketWriter for AxumSocketWriter {
    async fn send_text(&mut self, payload: String) -> Result<(), String> {
        self.inner.send(Message::Text(payload)).await.map_err(|e| e.to_string())
    }

    async fn close(&mut self, code: u16, reason: String) {
        let frame = CloseFrame { code, reason: reason.into() };
        let _ = self.inner.send(Message::Close(Some(frame))).await;
        let _ = self.inner.close().await;
    }
}
