//! The sender worker: drains the outbound queue, opens one HTTP/1 connection per donation
//! cycle, and hands the unawaited response future off to the receiver.

use std::collections::VecDeque;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use hyper::client::conn::http1;
use hyper::{Request, Uri};
use tokio::net::TcpStream;

use crate::connection::{Connection, PendingResponse, SlotState};
use crate::error::{Error, Result};
use crate::message::Message;
use crate::wire::{self, OutboundEnvelope};

/// Runs the sender loop to completion. Per spec §4.2, the loop exits only when it observes the
/// outbound queue empty *and* a receive channel currently parked (full or claimed). Otherwise it
/// drains whatever is queued — possibly nothing, in which case the POST it sends is an empty
/// "kicker" — and sends regardless. If the receiver clears the slot again before the sender's
/// next iteration observes it full, this can repeat, issuing more than one empty kicker back to
/// back; that is an intentional carry-over from the source rather than a bug (see DESIGN.md).
pub(crate) async fn run(conn: Arc<Connection>) {
    loop {
        let batch = match conn
            .monitor
            .wait_until(|state| drain_or_exit(state))
            .await
        {
            Ok(Some(batch)) => batch,
            Ok(None) => {
                tracing::trace!(id = %conn.id, "sender exiting: queue empty, channel parked");
                return;
            }
            Err(_) => return, // connection closed
        };

        let envelopes = assign_sequences(&conn, &batch);
        let body = wire::encode_request_body(conn.id.as_str(), &envelopes);

        let response_future = match open_and_send(&conn, body).await {
            Ok(fut) => fut,
            Err(err) => {
                conn.fail(err).await;
                return;
            }
        };

        if donate(&conn, response_future).await.is_err() {
            return; // connection closed while waiting to donate
        }
    }
}

fn drain_or_exit(
    state: &mut crate::connection::MonitorState,
) -> Option<Option<VecDeque<Arc<dyn Message>>>> {
    let queue = state.queue.as_mut()?;
    if queue.is_empty() && !state.slot.is_empty() {
        state.queue = None;
        return Some(None);
    }
    // Not exiting: drain (possibly empty, e.g. the bootstrapping kicker) and send regardless.
    Some(Some(std::mem::take(queue)))
}

fn assign_sequences(conn: &Connection, batch: &VecDeque<Arc<dyn Message>>) -> Vec<OutboundEnvelope> {
    batch
        .iter()
        .map(|message| {
            let seq = conn.out_seq.fetch_add(1, Ordering::SeqCst);
            OutboundEnvelope {
                seq,
                message_type: message.message_type(),
                payload: message.encode(),
            }
        })
        .collect()
}

async fn open_and_send(conn: &Connection, body: String) -> Result<PendingResponse> {
    let uri = conn.address.uri();
    let authority = uri
        .authority()
        .ok_or_else(|| Error::new_connect(ConnectErr("endpoint URI has no authority")))?
        .clone();
    if uri.scheme_str() != Some("http") {
        return Err(Error::new_connect(ConnectErr(
            "only the plain-http scheme is supported by this connector",
        )));
    }
    let host = authority.host().to_string();
    let port = authority.port_u16().unwrap_or(80);

    let stream = tokio::time::timeout(
        conn.config.connect_timeout,
        TcpStream::connect((host.as_str(), port)),
    )
    .await
    .map_err(|_| Error::new_timeout())?
    .map_err(Error::new_connect)?;

    let (mut sender, connection) = tokio::time::timeout(
        conn.config.connect_timeout,
        http1::handshake(stream),
    )
    .await
    .map_err(|_| Error::new_timeout())?
    .map_err(Error::new_connect)?;

    conn.exec.execute(async move {
        if let Err(err) = connection.await {
            tracing::debug!(error = %err, "driven HTTP/1 connection ended");
        }
    });

    let path = uri.path_and_query().map(|pq| pq.as_str()).unwrap_or("/");
    let request = Request::builder()
        .method("POST")
        .uri(path.parse::<Uri>().map_err(|e| Error::new_connect(e))?)
        .header("Host", authority.as_str())
        .header("Content-Type", "application/x-www-form-urlencoded")
        .header("Content-Length", body.len().to_string())
        .body(hyper::Body::from(body))
        .map_err(Error::new_connect)?;

    // `send_request` returns a future WITHOUT awaiting the response: the request write itself
    // happens as the spawned `connection` future above drives the socket. This unawaited future
    // is exactly the "donated receive channel" the receiver later parks on.
    let response_future = sender.send_request(request);
    Ok(Box::pin(async move { response_future.await }))
}

async fn donate(conn: &Arc<Connection>, response_future: PendingResponse) -> Result<()> {
    let mut to_install = Some(response_future);
    conn.monitor
        .wait_until(|state| {
            if state.slot.is_empty() {
                state.slot = SlotState::Full(to_install.take().expect("installed once"));
                Some(())
            } else {
                None
            }
        })
        .await?;
    conn.monitor.wake_all();
    Ok(())
}

#[derive(Debug)]
struct ConnectErr(&'static str);

impl std::fmt::Display for ConnectErr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.0)
    }
}

impl std::error::Error for ConnectErr {}
