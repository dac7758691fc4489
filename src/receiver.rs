//! The receiver worker: parks on the donated response, decodes it, and drives delivery.

use std::sync::Arc;

use bytes::BytesMut;
use hyper::body::HttpBody;

use crate::connection::{Connection, SlotState};
use crate::error::Error;
use crate::message::TempFileContext;
use crate::wire;

/// Runs the receiver loop to completion. Exits only when the connection closes; errors from a
/// single donation cycle are fatal and close the connection rather than being retried, per spec
/// (no automatic reconnect).
pub(crate) async fn run(conn: Arc<Connection>) {
    loop {
        let response_future = match claim_slot(&conn).await {
            Ok(fut) => fut,
            Err(_) => return, // closed
        };

        let response = match tokio::time::timeout(conn.config.read_timeout, response_future).await
        {
            Ok(Ok(response)) => response,
            Ok(Err(err)) => {
                conn.fail(Error::new_connect(err)).await;
                return;
            }
            Err(_) => {
                conn.fail(Error::new_timeout()).await;
                return;
            }
        };

        if !response.status().is_success() {
            let status = response.status();
            clear_slot(&conn).await;
            conn.fail(Error::new_status(status)).await;
            return;
        }

        let body = match read_body_capped(response.into_body(), conn.config.max_response_body_bytes).await
        {
            Ok(body) => body,
            Err(err) => {
                conn.fail(err).await;
                return;
            }
        };

        let temp_files = TempFileContext::new();
        let envelopes = match wire::parse_response_body(&body, &conn.decoders, &temp_files) {
            Ok(envelopes) => envelopes,
            Err(err) => {
                conn.fail(err).await;
                return;
            }
        };

        let arrivals = envelopes
            .into_iter()
            .map(|envelope| (envelope.seq, envelope.message))
            .collect();

        let delivered = match conn.reorder_and_drain(arrivals) {
            Ok(delivered) => delivered,
            Err(err) => {
                conn.fail(err).await;
                return;
            }
        };

        clear_slot(&conn).await;
        conn.deliver(&delivered);
        // `temp_files` is dropped here, once delivery has run: any scratch files a decoder
        // allocated for this cycle are released along with it.
    }
}

/// Waits until the slot holds a response (claiming it, but leaving it marked occupied so the
/// sender's park condition is unaffected), kicking the sender with an empty send if the slot is
/// currently empty. This is the sole mechanism that bootstraps the first donation cycle.
async fn claim_slot(
    conn: &Arc<Connection>,
) -> crate::error::Result<crate::connection::PendingResponse> {
    loop {
        let claimed = conn
            .monitor
            .wait_until(|state| {
                let queue_is_none = state.queue.is_none();
                if matches!(state.slot, SlotState::Full(_)) {
                    let prev = std::mem::replace(&mut state.slot, SlotState::Claimed);
                    match prev {
                        SlotState::Full(fut) => Some(Some(fut)),
                        _ => unreachable!(),
                    }
                } else if matches!(state.slot, SlotState::Empty) && queue_is_none {
                    Some(None)
                } else {
                    None
                }
            })
            .await?;

        match claimed {
            Some(fut) => return Ok(fut),
            None => {
                conn.send_messages_impl(Vec::new()).await;
                // Loop back and wait again; the kick above spawned a sender that will
                // eventually donate a response.
            }
        }
    }
}

async fn clear_slot(conn: &Arc<Connection>) {
    let mut guard = conn.monitor.lock().await;
    debug_assert!(matches!(guard.slot, SlotState::Claimed));
    guard.slot = SlotState::Empty;
    drop(guard);
    conn.monitor.wake_all();
}

async fn read_body_capped(
    mut body: hyper::Body,
    max: usize,
) -> crate::error::Result<Vec<u8>> {
    let mut buf = BytesMut::new();
    while let Some(chunk) = body.data().await {
        let chunk = chunk.map_err(Error::new_io)?;
        if buf.len() + chunk.len() > max {
            return Err(Error::new_protocol(crate::error::Protocol::Malformed));
        }
        buf.extend_from_slice(&chunk);
    }
    Ok(buf.to_vec())
}
