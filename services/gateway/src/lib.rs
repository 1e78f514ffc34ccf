pub mod auth;
pub mod repos;
pub mod ws;

use axum::{
    extract::ws::WebSocketUpgrade,
    extract::State,
    response::IntoResponse,
    routing::get,
    Router,
};
use futures_util::StreamExt;
use gateway_core::Hub;

pub fn build_router(hub: Hub) -> Router {
    Router::new()
        .route("/ws/v1/gateway", get(gateway_ws_handler))
        .route("/healthz", get(health::healthz))
        .route("/readyz", get(health::readyz))
        .fallback(fallback_404)
        .with_state(hub)
}

async fn gateway_ws_handler(ws: WebSocketUpgrade, State(hub): State<Hub>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| async move {
        let (sink, stream) = socket.split();
        let reader = self::ws::AxumSocketReader::new(stream);
        let writer = self::ws::AxumSocketWriter::new(sink);
        hub.serve_websocket(reader, writer).await;
    })
}

async fn fallback_404() -> impl IntoResponse {
    (axum::http::StatusCode::NOT_FOUND, "not found")
}

mod health {
    use axum::response::IntoResponse;
    pub async fn healthz() -> impl IntoResponse {
        "ok"
    }
    pub async fn readyz() -> impl IntoResponse {
        "ok"
    }
}
