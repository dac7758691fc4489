//! End-to-end scenarios against the in-process loopback server in `support`.

#[macro_use]
extern crate matches;

mod support;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use messaging_http::{Address, ConnectionId, Context, Decoder, Error, Message, TempFileContext};
use support::{MockServer, ScriptedResponse};

#[derive(Debug)]
struct Text(String);

impl Message for Text {
    fn message_type(&self) -> char {
        's'
    }
    fn encode(&self) -> String {
        self.0.clone()
    }
}

struct TextDecoder;
impl Decoder for TextDecoder {
    fn decode(
        &self,
        payload: &str,
        _temp_files: &TempFileContext,
    ) -> messaging_http::Result<Arc<dyn Message>> {
        Ok(Arc::new(Text(payload.to_string())))
    }
}

fn context() -> Context {
    Context::builder().decoder('s', Arc::new(TextDecoder)).build()
}

struct FailingDecoder;
impl Decoder for FailingDecoder {
    fn decode(
        &self,
        payload: &str,
        _temp_files: &TempFileContext,
    ) -> messaging_http::Result<Arc<dyn Message>> {
        Err(Error::decode(format!("not a valid payload: {payload:?}")))
    }
}

#[derive(Default, Clone)]
struct Recorder {
    messages: Arc<Mutex<Vec<String>>>,
    errors: Arc<Mutex<Vec<String>>>,
}

impl Recorder {
    fn on_messages(&self) -> impl Fn(&[Arc<dyn Message>]) + Send + Sync + 'static {
        let messages = self.messages.clone();
        move |batch: &[Arc<dyn Message>]| {
            let mut guard = messages.lock().unwrap();
            for m in batch {
                guard.push(m.encode());
            }
        }
    }

    fn on_error(&self) -> impl Fn(&Error) + Send + Sync + 'static {
        let errors = self.errors.clone();
        move |err: &Error| errors.lock().unwrap().push(err.to_string())
    }

    fn messages(&self) -> Vec<String> {
        self.messages.lock().unwrap().clone()
    }

    fn errors(&self) -> Vec<String> {
        self.errors.lock().unwrap().clone()
    }
}

async fn settle() {
    tokio::time::sleep(Duration::from_millis(150)).await;
}

#[tokio::test]
async fn cold_start_sends_empty_kicker_and_delivers_nothing() {
    let server = MockServer::start(vec![]).await;
    let ctx = context();
    let address = Address::new(server.url().parse().unwrap());
    let connection = ctx.register(ConnectionId::new("conn-1"), address);
    let recorder = Recorder::default();

    let started = Arc::new(AtomicUsize::new(0));
    let started2 = started.clone();
    connection
        .start(recorder.on_messages(), move || {
            started2.fetch_add(1, Ordering::SeqCst);
        }, recorder.on_error())
        .unwrap();

    settle().await;

    assert_eq!(started.load(Ordering::SeqCst), 1);
    assert!(recorder.messages().is_empty());
    assert!(recorder.errors().is_empty());

    let requests = server.requests();
    assert!(!requests.is_empty());
    assert_eq!(requests[0], "action=messages&id=conn-1&l=0");

    assert_matches!(ctx.get(&ConnectionId::new("conn-1")), Some(_));
    connection.close().await;
    assert_matches!(ctx.get(&ConnectionId::new("missing")), None);
}

#[tokio::test]
async fn single_send_is_delivered_and_advances_sequence() {
    let server = MockServer::start(vec![ScriptedResponse::ok(
        r#"<messages><message seq="1" type="s">ok</message></messages>"#,
    )])
    .await;
    let ctx = context();
    let address = Address::new(server.url().parse().unwrap());
    let connection = ctx.register(ConnectionId::new("conn-2"), address);

    // Enqueue before starting so the send's own queue creation races no kicker.
    connection.send(vec![Arc::new(Text("hi".to_string()))]).await;

    let recorder = Recorder::default();
    connection
        .start(recorder.on_messages(), || {}, recorder.on_error())
        .unwrap();

    settle().await;

    let requests = server.requests();
    assert_eq!(requests[0], "action=messages&id=conn-2&l=1&s0=1&t0=s&m0=hi");
    assert_eq!(recorder.messages(), vec!["ok".to_string()]);

    connection.close().await;
}

#[tokio::test]
async fn out_of_order_inbound_is_reordered_before_delivery() {
    let server = MockServer::start(vec![
        ScriptedResponse::ok(r#"<messages><message seq="2" type="s">B</message></messages>"#),
        ScriptedResponse::ok(r#"<messages><message seq="1" type="s">A</message></messages>"#),
    ])
    .await;
    let ctx = context();
    let address = Address::new(server.url().parse().unwrap());
    let connection = ctx.register(ConnectionId::new("conn-3"), address);
    let recorder = Recorder::default();
    connection
        .start(recorder.on_messages(), || {}, recorder.on_error())
        .unwrap();

    // After the first (seq 2) response, nothing should be deliverable yet.
    tokio::time::sleep(Duration::from_millis(80)).await;
    assert!(recorder.messages().is_empty());

    // After the second (seq 1) response arrives, both should drain out in order.
    settle().await;
    assert_eq!(recorder.messages(), vec!["A".to_string(), "B".to_string()]);
    assert!(recorder.errors().is_empty());

    connection.close().await;
}

#[tokio::test]
async fn duplicate_inbound_sequence_is_fatal() {
    let server = MockServer::start(vec![
        ScriptedResponse::ok(r#"<messages><message seq="1" type="s">A</message></messages>"#),
        ScriptedResponse::ok(r#"<messages><message seq="1" type="s">A-again</message></messages>"#),
    ])
    .await;
    let ctx = context();
    let address = Address::new(server.url().parse().unwrap());
    let connection = ctx.register(ConnectionId::new("conn-4"), address);
    let recorder = Recorder::default();
    connection
        .start(recorder.on_messages(), || {}, recorder.on_error())
        .unwrap();

    settle().await;

    assert_eq!(recorder.messages(), vec!["A".to_string()]);
    assert_eq!(recorder.errors().len(), 1);
    assert!(connection.is_closed());
}

#[tokio::test]
async fn decoder_failure_is_fatal() {
    let server = MockServer::start(vec![ScriptedResponse::ok(
        r#"<messages><message seq="1" type="f">garbage</message></messages>"#,
    )])
    .await;
    let ctx = Context::builder().decoder('f', Arc::new(FailingDecoder)).build();
    let address = Address::new(server.url().parse().unwrap());
    let connection = ctx.register(ConnectionId::new("conn-7"), address);
    let recorder = Recorder::default();
    connection
        .start(recorder.on_messages(), || {}, recorder.on_error())
        .unwrap();

    settle().await;

    assert!(recorder.messages().is_empty());
    let errors = recorder.errors();
    assert_eq!(errors.len(), 1);
    assert!(errors[0].contains("message decoder failed"));
    assert!(connection.is_closed());
}

#[tokio::test]
async fn non_success_status_closes_connection_and_reports_error() {
    let server = MockServer::start(vec![ScriptedResponse::status(503)]).await;
    let ctx = context();
    let address = Address::new(server.url().parse().unwrap());
    let connection = ctx.register(ConnectionId::new("conn-5"), address);
    let recorder = Recorder::default();
    connection
        .start(recorder.on_messages(), || {}, recorder.on_error())
        .unwrap();

    settle().await;

    assert!(connection.is_closed());
    let errors = recorder.errors();
    assert_eq!(errors.len(), 1);
    assert!(errors[0].contains("503"));

    let requests_before = server.requests().len();
    connection.send(vec![Arc::new(Text("dropped".to_string()))]).await;
    settle().await;
    assert_eq!(server.requests().len(), requests_before);
}

#[tokio::test]
async fn concurrent_sends_assign_contiguous_nonoverlapping_sequences() {
    let server = MockServer::start(vec![]).await;
    let ctx = context();
    let address = Address::new(server.url().parse().unwrap());
    let connection = ctx.register(ConnectionId::new("conn-6"), address);

    let a = connection.clone();
    let b = connection.clone();
    tokio::join!(
        a.send(vec![Arc::new(Text("first".to_string()))]),
        b.send(vec![Arc::new(Text("second".to_string()))]),
    );

    let recorder = Recorder::default();
    connection
        .start(recorder.on_messages(), || {}, recorder.on_error())
        .unwrap();

    settle().await;

    // Whether the two sends landed in one POST or two, every assigned sequence number from 1..N
    // must appear exactly once across all requests this connection made.
    let mut seqs: Vec<u64> = Vec::new();
    for body in server.requests() {
        for pair in body.split('&') {
            if let Some(rest) = pair.strip_prefix('s') {
                if let Some((index, value)) = rest.split_once('=') {
                    if index.parse::<u32>().is_ok() {
                        seqs.push(value.parse().unwrap());
                    }
                }
            }
        }
    }
    seqs.sort_unstable();
    assert_eq!(seqs, vec![1, 2]);

    connection.close().await;
}
