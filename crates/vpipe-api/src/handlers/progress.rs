//! Live progress streams.
//!
//! Both transports forward each status message for one job verbatim as JSON and
//! end after the terminal message, or when the server shuts down. Closing the
//! connection unsubscribes.

use std::convert::Infallible;

use axum::extract::ws::{close_code, CloseFrame, Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, State};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::IntoResponse;
use futures_util::stream::{self, Stream};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::watch;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info, warn};
use vpipe_models::JobId;

use crate::auth::AuthUser;
use crate::metrics;
use crate::state::AppState;

/// Decrements the active stream gauge when the stream goes away.
struct ActiveStream(&'static str);

impl ActiveStream {
    fn open(transport: &'static str) -> Self {
        metrics::progress_stream_opened(transport);
        Self(transport)
    }
}

impl Drop for ActiveStream {
    fn drop(&mut self) {
        metrics::progress_stream_closed(self.0);
    }
}

/// Resolves once the server starts shutting down.
async fn shutting_down(mut shutdown: watch::Receiver<bool>) {
    let flipped = shutdown.wait_for(|stopping| *stopping).await.map(|_| ());
    if flipped.is_err() {
        // Sender gone without a shutdown; nothing will ever flip it.
        std::future::pending::<()>().await;
    }
}

/// GET /ws/progress/:job_id
pub async fn ws_progress(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    Path(job_id): Path<String>,
    user: AuthUser,
) -> impl IntoResponse {
    info!(job_id = %job_id, uid = %user.uid, "Progress WebSocket opened");
    ws.on_upgrade(move |socket| stream_over_socket(socket, state, JobId::from(job_id)))
}

async fn stream_over_socket(socket: WebSocket, state: AppState, job_id: JobId) {
    let _active = ActiveStream::open("ws");
    let mut subscription = state.relay.subscribe(job_id.clone()).await;
    let (mut sender, mut receiver) = socket.split();

    let mut heartbeat = interval(state.config.ws_heartbeat);
    heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
    heartbeat.tick().await;

    let stopping = shutting_down(state.shutdown_receiver());
    tokio::pin!(stopping);

    loop {
        tokio::select! {
            update = subscription.recv() => {
                let Some(update) = update else {
                    // Disconnected by the registry for falling behind.
                    warn!(job_id = %job_id, "Progress stream dropped by relay");
                    let _ = sender.send(Message::Close(None)).await;
                    break;
                };
                let text = match serde_json::to_string(&update) {
                    Ok(text) => text,
                    Err(e) => {
                        warn!(job_id = %job_id, "Failed to encode status: {}", e);
                        continue;
                    }
                };
                if sender.send(Message::Text(text)).await.is_err() {
                    break;
                }
                metrics::record_progress_frame("ws");
                if update.is_terminal() {
                    let _ = sender.send(Message::Close(None)).await;
                    break;
                }
            }
            incoming = receiver.next() => {
                match incoming {
                    Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                    // Pongs are answered by the library; client text is ignored.
                    Some(Ok(_)) => {}
                }
            }
            _ = heartbeat.tick() => {
                if sender.send(Message::Ping(Vec::new())).await.is_err() {
                    break;
                }
            }
            _ = &mut stopping => {
                debug!(job_id = %job_id, "Closing progress WebSocket for shutdown");
                let frame = CloseFrame {
                    code: close_code::AWAY,
                    reason: "server shutting down".into(),
                };
                let _ = sender.send(Message::Close(Some(frame))).await;
                break;
            }
        }
    }

    state.relay.unsubscribe(subscription);
    debug!(job_id = %job_id, "Progress WebSocket closed");
}

/// GET /sse/:job_id
pub async fn sse_progress(
    State(state): State<AppState>,
    Path(job_id): Path<String>,
    user: AuthUser,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    info!(job_id = %job_id, uid = %user.uid, "Progress event stream opened");
    let subscription = state.relay.subscribe(JobId::from(job_id)).await;
    let active = ActiveStream::open("sse");

    let events = stream::unfold((subscription, active), |(mut subscription, active)| async move {
        let update = subscription.recv().await?;
        let event = Event::default()
            .event("status")
            .json_data(&update)
            .unwrap_or_else(|_| Event::default().comment("unencodable status"));
        metrics::record_progress_frame("sse");
        Some((Ok(event), (subscription, active)))
    })
    .take_until(shutting_down(state.shutdown_receiver()));

    Sse::new(events).keep_alive(KeepAlive::default())
}
