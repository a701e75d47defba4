//! Shared helpers for the integration suites: compressed timers, event
//! stream matchers, and raw-channel plumbing for protocol-level tests.
#![allow(dead_code)]

use std::time::Duration;

use tokio::sync::mpsc;

use peerns_protocol::namespace::{EngineEvent, NsEvent, Timings};
use peerns_protocol::session::SessionEvent;
use peerns_protocol::wire::Frame;
use peerns_protocol::NodeEvent;
use peerns_signal::{Channel, ChannelEvent, SignalError, Signaling};

pub const WAIT: Duration = Duration::from_secs(10);

/// Protocol timers compressed ~1000x so scenarios finish in milliseconds.
pub fn fast_timings() -> Timings {
    Timings {
        ping: Duration::from_millis(200),
        peer_ttl: Duration::from_millis(600),
        join_timeout: Duration::from_millis(80),
        join_retry: Duration::from_millis(40),
        slot_probe: Duration::from_millis(50),
        slot_window: Duration::from_millis(150),
        monitor: Duration::from_millis(150),
        migrate_linger: Duration::from_millis(30),
        failover_jitter_max: Duration::from_millis(40),
        migrate_jitter_max: Duration::from_millis(30),
        slot_retry_min: Duration::from_millis(30),
        slot_retry_max: Duration::from_millis(60),
        max_level: 5,
        max_join_attempts: 3,
    }
}

/// Drain engine events until the predicate picks one out.
pub async fn expect_ns<R>(
    rx: &mut mpsc::Receiver<EngineEvent>,
    what: &str,
    mut pick: impl FnMut(&str, &NsEvent) -> Option<R>,
) -> R {
    let fut = async {
        loop {
            match rx.recv().await {
                Some(EngineEvent::Ns { namespace, event }) => {
                    if let Some(r) = pick(&namespace, &event) {
                        return r;
                    }
                }
                Some(_) => continue,
                None => panic!("engine event stream ended while waiting for {what}"),
            }
        }
    };
    tokio::time::timeout(WAIT, fut)
        .await
        .unwrap_or_else(|_| panic!("timed out waiting for {what}"))
}

pub async fn expect_session<R>(
    rx: &mut mpsc::Receiver<SessionEvent>,
    what: &str,
    mut pick: impl FnMut(&SessionEvent) -> Option<R>,
) -> R {
    let fut = async {
        loop {
            match rx.recv().await {
                Some(event) => {
                    if let Some(r) = pick(&event) {
                        return r;
                    }
                }
                None => panic!("session event stream ended while waiting for {what}"),
            }
        }
    };
    tokio::time::timeout(WAIT, fut)
        .await
        .unwrap_or_else(|_| panic!("timed out waiting for {what}"))
}

pub async fn expect_node<R>(
    rx: &mut mpsc::Receiver<NodeEvent>,
    what: &str,
    mut pick: impl FnMut(&NodeEvent) -> Option<R>,
) -> R {
    let fut = async {
        loop {
            match rx.recv().await {
                Some(event) => {
                    if let Some(r) = pick(&event) {
                        return r;
                    }
                }
                None => panic!("node event stream ended while waiting for {what}"),
            }
        }
    };
    tokio::time::timeout(WAIT, fut)
        .await
        .unwrap_or_else(|_| panic!("timed out waiting for {what}"))
}

/// Connect with retries: the target may still be claiming its endpoint.
pub async fn connect_retry(client: &dyn Signaling, endpoint: &str) -> Channel {
    let deadline = tokio::time::Instant::now() + WAIT;
    loop {
        match client.connect(endpoint).await {
            Ok(channel) => return channel,
            Err(SignalError::Unreachable(_)) if tokio::time::Instant::now() < deadline => {
                tokio::time::sleep(Duration::from_millis(25)).await;
            }
            Err(e) => panic!("connect to {endpoint} failed: {e}"),
        }
    }
}

/// Next protocol frame on a raw channel, skipping nothing.
pub async fn next_frame(channel: &mut Channel) -> Frame {
    let fut = async {
        loop {
            match channel.recv().await {
                Some(ChannelEvent::Frame(value)) => {
                    return Frame::parse(&value).expect("peer sent a malformed frame")
                }
                Some(ChannelEvent::Closed) | None => panic!("channel closed while reading"),
            }
        }
    };
    tokio::time::timeout(WAIT, fut)
        .await
        .expect("timed out waiting for a frame")
}
