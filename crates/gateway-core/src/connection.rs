use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use gateway_protocol::{CloseCode, Frame, MAX_FRAME_BYTES};
use tokio::sync::{mpsc, Mutex, Notify};
use tokio::time::timeout;
use tracing::{debug, warn};

use crate::error::{GatewayError, Result};

const SEND_QUEUE_CAPACITY: usize = 256;
const IDENTIFY_TIMEOUT: Duration = Duration::from_secs(30);
const WRITE_DEADLINE: Duration = Duration::from_secs(10);
const PRESENCE_REFRESH_TIMEOUT: Duration = Duration::from_secs(2);

/// Transport-agnostic read half of a WebSocket. The HTTP-facing service
/// crate adapts the receiving half of `axum::extract::ws::WebSocket` to
/// this; tests use an in-memory fake over `tokio::sync::mpsc` channels.
#[async_trait]
pub trait SocketReader: Send {
    async fn recv(&mut self) -> Option<std::result::Result<Vec<u8>, String>>;
}

/// Transport-agnostic write half of a WebSocket.
#[async_trait]
pub trait SocketWriter: Send {
    async fn send_text(&mut self, payload: String) -> std::result::Result<(), String>;
    async fn close(&mut self, code: u16, reason: String);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    Connected,
    Identified,
    Disconnecting,
    Displaced,
}

/// Fixed-window rate limiter: at most `count` frames per `window`. Touched
/// only by the reader task, so no lock is needed (§5).
pub struct RateLimiter {
    count: u32,
    window: Duration,
    window_start: tokio::time::Instant,
    seen: u32,
}

impl RateLimiter {
    pub fn new(count: u32, window: Duration) -> Self {
        Self { count, window, window_start: tokio::time::Instant::now(), seen: 0 }
    }

    /// Returns `false` once the window's budget is exhausted.
    pub fn allow(&mut self) -> bool {
        let now = tokio::time::Instant::now();
        if now.duration_since(self.window_start) >= self.window {
            self.window_start = now;
            self.seen = 0;
        }
        self.seen += 1;
        self.seen <= self.count
    }
}

/// Shared identity/sequencing state for one connection, installed at
/// Identify/Resume time and read by the Hub's dispatch path.
pub struct ConnectionState {
    pub user_id: Mutex<Option<String>>,
    pub session_id: Mutex<Option<String>>,
    pub state: Mutex<ConnState>,
    sequence: AtomicU64,
    sender: mpsc::Sender<OutboundItem>,
    pub done: Arc<Notify>,
    done_closed: std::sync::atomic::AtomicBool,
}

pub enum OutboundItem {
    Frame(Frame),
    Close(u16, String),
}

impl ConnectionState {
    pub fn new() -> (Arc<Self>, mpsc::Receiver<OutboundItem>) {
        let (tx, rx) = mpsc::channel(SEND_QUEUE_CAPACITY);
        let state = Arc::new(Self {
            user_id: Mutex::new(None),
            session_id: Mutex::new(None),
            state: Mutex::new(ConnState::Connected),
            sequence: AtomicU64::new(0),
            sender: tx,
            done: Arc::new(Notify::new()),
            done_closed: std::sync::atomic::AtomicBool::new(false),
        });
        (state, rx)
    }

    pub fn next_seq(&self) -> u64 {
        self.sequence.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub fn set_seq(&self, value: u64) {
        self.sequence.store(value, Ordering::SeqCst);
    }

    pub async fn current_user_id(&self) -> Option<String> {
        self.user_id.lock().await.clone()
    }

    pub async fn is_identified(&self) -> bool {
        *self.state.lock().await == ConnState::Identified
    }

    /// Non-blocking enqueue per §4.H/§5: a full queue or an already-closed
    /// `done` means the client is too slow or gone, and the frame is
    /// dropped rather than blocking the caller (which may hold the Hub's
    /// registry lock).
    pub fn enqueue(&self, frame: Frame) {
        if self.done_closed.load(Ordering::SeqCst) {
            return;
        }
        if self.sender.try_send(OutboundItem::Frame(frame)).is_err() {
            warn!("send queue full or closed, dropping frame and closing connection");
            self.close_send();
        }
    }

    /// Idempotent single-shot close signal. Safe to call concurrently from
    /// displacement and the reader's own error path.
    pub fn close_send(&self) {
        if !self.done_closed.swap(true, Ordering::SeqCst) {
            // notify_one (not notify_waiters): stores a permit if nobody is
            // waiting yet, so a close that races the writer's first poll is
            // never lost.
            self.done.notify_one();
        }
    }

    pub fn is_closed(&self) -> bool {
        self.done_closed.load(Ordering::SeqCst)
    }

    fn queue_close(&self, code: u16, reason: String) {
        let _ = self.sender.try_send(OutboundItem::Close(code, reason));
    }

    /// Queues a close control frame (for graceful flush by the writer) and
    /// signals `done`. Used by the Hub on shutdown (§4.I).
    pub fn enqueue_close_signal(&self, code: CloseCode) {
        self.queue_close(code.code(), code.reason().to_string());
        self.close_send();
    }
}

/// Runs the writer loop for one connection: drains `rx` until `done`
/// fires, applying a write deadline per frame, then performs a final
/// non-blocking drain so a last InvalidSession/Reconnect isn't lost.
pub async fn writer_loop(
    conn: Arc<ConnectionState>,
    mut rx: mpsc::Receiver<OutboundItem>,
    mut socket: impl SocketWriter,
) {
    loop {
        if conn.is_closed() {
            break;
        }
        let notified = conn.done.notified();
        tokio::select! {
            biased;
            _ = notified => break,
            item = rx.recv() => {
                match item {
                    Some(item) => write_item(&mut socket, item).await,
                    None => break,
                }
            }
        }
    }
    while let Ok(item) = rx.try_recv() {
        write_item(&mut socket, item).await;
    }
}

async fn write_item(socket: &mut impl SocketWriter, item: OutboundItem) {
    let text = match item {
        OutboundItem::Frame(frame) => match frame.encode() {
            Ok(text) => text,
            Err(err) => {
                warn!(error = %err, "failed to encode outbound frame, dropping");
                return;
            }
        },
        OutboundItem::Close(code, reason) => {
            socket.close(code, reason).await;
            return;
        }
    };
    match timeout(WRITE_DEADLINE, socket.send_text(text)).await {
        Ok(Ok(())) => {}
        Ok(Err(err)) => warn!(error = %err, "write error, terminating writer"),
        Err(_) => warn!("write deadline exceeded, terminating writer"),
    }
}

/// Callbacks the reader loop needs from the Hub; kept as a trait so
/// `connection.rs` stays free of `hub.rs`'s registry type.
#[async_trait]
pub trait ReaderCallbacks: Send + Sync {
    async fn on_identify(&self, conn: &Arc<ConnectionState>, token: String) -> Result<()>;
    async fn on_resume(&self, conn: &Arc<ConnectionState>, token: String, session_id: String, seq: u64) -> Result<()>;
    async fn on_presence_update(&self, conn: &Arc<ConnectionState>, status: String) -> Result<()>;
    async fn refresh_presence(&self, user_id: &str);
    async fn on_disconnect(&self, conn: &Arc<ConnectionState>);
}

pub struct ReaderConfig {
    pub heartbeat_interval: Duration,
    pub rate_limit_count: u32,
    pub rate_limit_window: Duration,
}

/// Drives the reader half of a connection to completion. Runs on the
/// calling task per §4.H ("reader on the calling task").
pub async fn reader_loop(
    conn: Arc<ConnectionState>,
    mut socket: impl SocketReader,
    callbacks: Arc<dyn ReaderCallbacks>,
    config: ReaderConfig,
) {
    conn.enqueue(Frame::hello(config.heartbeat_interval.as_millis() as u64));

    let identify_deadline = tokio::time::sleep(IDENTIFY_TIMEOUT);
    tokio::pin!(identify_deadline);
    let mut read_deadline = config.heartbeat_interval.mul_f64(1.5);
    let mut limiter = RateLimiter::new(config.rate_limit_count, config.rate_limit_window);
    let mut missed_heartbeats: u32 = 0;

    loop {
        if conn.is_closed() {
            break;
        }
        let still_unidentified = !conn.is_identified().await;
        tokio::select! {
            biased;
            _ = &mut identify_deadline, if still_unidentified => {
                conn.queue_close(CloseCode::NotAuthenticated.code(), CloseCode::NotAuthenticated.reason().to_string());
                conn.close_send();
                break;
            }
            message = timeout(read_deadline, socket.recv()) => {
                let message = match message {
                    Ok(Some(Ok(bytes))) => bytes,
                    Ok(Some(Err(err))) => {
                        debug!(error = %err, "socket read error");
                        break;
                    }
                    Ok(None) => break,
                    Err(_) => {
                        missed_heartbeats += 1;
                        if missed_heartbeats >= 2 {
                            conn.queue_close(CloseCode::SessionTimedOut.code(), CloseCode::SessionTimedOut.reason().to_string());
                            conn.close_send();
                            break;
                        }
                        continue;
                    }
                };

                if message.len() > MAX_FRAME_BYTES {
                    conn.queue_close(CloseCode::DecodeError.code(), CloseCode::DecodeError.reason().to_string());
                    conn.close_send();
                    break;
                }

                if !limiter.allow() {
                    conn.queue_close(CloseCode::RateLimited.code(), CloseCode::RateLimited.reason().to_string());
                    conn.close_send();
                    break;
                }

                let frame = match Frame::decode(&message) {
                    Ok(frame) => frame,
                    Err(_) => {
                        conn.queue_close(CloseCode::DecodeError.code(), CloseCode::DecodeError.reason().to_string());
                        conn.close_send();
                        break;
                    }
                };

                if handle_frame(&conn, frame, &callbacks, &mut read_deadline, config.heartbeat_interval, &mut missed_heartbeats).await.is_break() {
                    break;
                }
            }
        }
    }

    callbacks.on_disconnect(&conn).await;
}

enum Flow {
    Continue,
    Break,
}

impl Flow {
    fn is_break(&self) -> bool {
        matches!(self, Flow::Break)
    }
}

async fn handle_frame(
    conn: &Arc<ConnectionState>,
    frame: Frame,
    callbacks: &Arc<dyn ReaderCallbacks>,
    read_deadline: &mut Duration,
    heartbeat_interval: Duration,
    missed_heartbeats: &mut u32,
) -> Flow {
    use gateway_protocol::Opcode;

    match frame.op {
        Opcode::Heartbeat => {
            conn.enqueue(Frame::heartbeat_ack());
            *read_deadline = heartbeat_interval.mul_f64(1.5);
            *missed_heartbeats = 0;
            if let Some(user_id) = conn.current_user_id().await {
                let _ = timeout(PRESENCE_REFRESH_TIMEOUT, callbacks.refresh_presence(&user_id)).await;
            }
            Flow::Continue
        }
        Opcode::Identify => {
            if conn.is_identified().await {
                conn.queue_close(CloseCode::AlreadyAuthenticated.code(), CloseCode::AlreadyAuthenticated.reason().to_string());
                conn.close_send();
                return Flow::Break;
            }
            let token = field_str(&frame, "token");
            match callbacks.on_identify(conn, token).await {
                Ok(()) => Flow::Continue,
                Err(err) => {
                    close_for_error(conn, &err);
                    Flow::Break
                }
            }
        }
        Opcode::Resume => {
            let token = field_str(&frame, "token");
            let session_id = field_str(&frame, "session_id");
            let seq = frame.d.as_ref().and_then(|d| d.get("seq")).and_then(|v| v.as_u64()).unwrap_or(0);
            match callbacks.on_resume(conn, token, session_id, seq).await {
                Ok(()) => Flow::Continue,
                Err(GatewayError::ResumeImpossible(_)) => {
                    conn.enqueue(Frame::invalid_session(false));
                    Flow::Continue
                }
                Err(err) => {
                    close_for_error(conn, &err);
                    Flow::Break
                }
            }
        }
        Opcode::PresenceUpdate => {
            if !conn.is_identified().await {
                conn.queue_close(CloseCode::NotAuthenticated.code(), CloseCode::NotAuthenticated.reason().to_string());
                conn.close_send();
                return Flow::Break;
            }
            let status = field_str(&frame, "status");
            match callbacks.on_presence_update(conn, status).await {
                Ok(()) => Flow::Continue,
                Err(err) => {
                    close_for_error(conn, &err);
                    Flow::Break
                }
            }
        }
        _ => {
            conn.queue_close(CloseCode::UnknownOpcode.code(), CloseCode::UnknownOpcode.reason().to_string());
            conn.close_send();
            Flow::Break
        }
    }
}

fn field_str(frame: &Frame, key: &str) -> String {
    frame
        .d
        .as_ref()
        .and_then(|d| d.get(key))
        .and_then(|v| v.as_str())
        .unwrap_or_default()
        .to_string()
}

fn close_for_error(conn: &Arc<ConnectionState>, err: &GatewayError) {
    if let Some(code) = err.close_code() {
        conn.queue_close(code.code(), code.reason().to_string());
    }
    conn.close_send();
}
