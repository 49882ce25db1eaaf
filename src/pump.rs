//! Per-connection reader/writer pair.
use std::{fmt::Display, sync::Arc, time::Duration};

use axum::extract::ws::{Message, WebSocket};
use futures_util::{Sink, SinkExt, Stream, StreamExt};
use tokio::{
    sync::{mpsc, oneshot},
    time::{self, Instant, MissedTickBehavior},
};
use tracing::{debug, info, warn};

use crate::{
    protocol::{Intent, Outbound},
    room::{MemberId, Room},
    state::PendingSession,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Heartbeat {
    /// Ping interval. Must be shorter than `pong_wait`.
    pub ping_period: Duration,
    /// How long the reader waits for a pong before giving up.
    pub pong_wait: Duration,
    /// Deadline for a single frame write.
    pub write_wait: Duration,
}

impl Default for Heartbeat {
    fn default() -> Self {
        Self {
            ping_period: Duration::from_secs(54),
            pong_wait: Duration::from_secs(60),
            write_wait: Duration::from_secs(10),
        }
    }
}

pub async fn serve(socket: WebSocket, session: PendingSession, hb: Heartbeat) {
    let (sink, stream) = socket.split();
    run(sink, stream, session, hb).await
}

/// Attaches the member, then drives both pumps until the connection is gone.
pub async fn run<K, S, E>(sink: K, stream: S, session: PendingSession, hb: Heartbeat)
where
    K: Sink<Message> + Unpin + Send + 'static,
    K::Error: Display + Send,
    S: Stream<Item = Result<Message, E>> + Unpin + Send + 'static,
    E: Display + Send + 'static,
{
    let PendingSession { room, member, username, outbound, shutdown, .. } = session;
    if let Err(e) = room.attach(member).await {
        warn!(room = %room.name(), user = %username, error = %e, "attach rejected");
        return;
    }
    info!(room = %room.name(), user = %username, "member attached");

    let mut writer = tokio::spawn(write_pump(sink, outbound, shutdown, room.clone(), member, hb));
    let mut reader = tokio::spawn(read_pump(stream, room.clone(), member, hb.pong_wait));

    tokio::select! {
        _ = &mut writer => reader.abort(),
        _ = &mut reader => {
            // reader already detached; give the writer time to send Close
            if time::timeout(hb.write_wait, &mut writer).await.is_err() {
                writer.abort();
            }
        }
    }
}

async fn read_pump<S, E>(mut stream: S, room: Arc<Room>, member: MemberId, pong_wait: Duration)
where
    S: Stream<Item = Result<Message, E>> + Unpin,
    E: Display,
{
    let mut deadline = Instant::now() + pong_wait;
    loop {
        let frame = match time::timeout_at(deadline, stream.next()).await {
            Err(_) => {
                debug!(room = %room.name(), %member, "no pong before deadline");
                break;
            }
            Ok(None) => break,
            Ok(Some(Err(e))) => {
                debug!(room = %room.name(), %member, error = %e, "read failed");
                break;
            }
            Ok(Some(Ok(frame))) => frame,
        };
        match frame {
            Message::Text(text) => dispatch(&room, member, text.as_bytes()).await,
            Message::Binary(bytes) => dispatch(&room, member, &bytes).await,
            Message::Pong(_) => deadline = Instant::now() + pong_wait,
            Message::Ping(_) => {} // answered by the socket
            Message::Close(_) => break,
        }
    }
    room.detach(member).await;
}

async fn dispatch(room: &Room, member: MemberId, raw: &[u8]) {
    match Intent::decode(raw) {
        Ok(intent) => room.submit(member, intent).await,
        Err(e) => warn!(room = %room.name(), %member, error = %e, "dropping malformed intent"),
    }
}

async fn write_pump<K>(
    mut sink: K,
    mut outbound: mpsc::Receiver<Outbound>,
    mut shutdown: oneshot::Receiver<()>,
    room: Arc<Room>,
    member: MemberId,
    hb: Heartbeat,
) where
    K: Sink<Message> + Unpin,
    K::Error: Display,
{
    let mut ticker = time::interval_at(Instant::now() + hb.ping_period, hb.ping_period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        let frame = tokio::select! {
            biased;
            _ = &mut shutdown => break,
            next = outbound.recv() => match next {
                Some(payload) => Message::Text(payload.to_string()),
                None => break,
            },
            _ = ticker.tick() => Message::Ping(Vec::new()),
        };
        let sent = tokio::select! {
            biased;
            _ = &mut shutdown => break,
            sent = time::timeout(hb.write_wait, sink.send(frame)) => sent,
        };
        match sent {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                debug!(room = %room.name(), %member, error = %e, "write failed");
                room.detach(member).await;
                return;
            }
            Err(_) => {
                debug!(room = %room.name(), %member, "write timed out");
                room.detach(member).await;
                return;
            }
        }
    }
    // the room dropped us: close without draining what is left
    let _ = time::timeout(hb.write_wait, sink.send(Message::Close(None))).await;
}
