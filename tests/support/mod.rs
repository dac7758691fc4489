//! An in-process HTTP/1 loopback server used to exercise `Connection` against a scripted
//! sequence of responses, without any real network boundary.

use std::collections::VecDeque;
use std::convert::Infallible;
use std::sync::{Arc, Mutex};

use hyper::service::{make_service_fn, service_fn};
use hyper::{Body, Request, Response, Server};

/// One canned response the mock server hands back for one incoming POST, in script order.
#[derive(Clone)]
pub struct ScriptedResponse {
    pub status: u16,
    pub body: &'static str,
}

impl ScriptedResponse {
    pub fn ok(body: &'static str) -> ScriptedResponse {
        ScriptedResponse { status: 200, body }
    }

    pub fn status(status: u16) -> ScriptedResponse {
        ScriptedResponse { status, body: "" }
    }
}

/// A running mock server plus the recorded request bodies it has seen so far.
pub struct MockServer {
    addr: std::net::SocketAddr,
    requests: Arc<Mutex<Vec<String>>>,
    _handle: tokio::task::JoinHandle<()>,
}

impl MockServer {
    /// Starts the server with a fixed script of responses. Requests beyond the script's length
    /// get an empty `<messages/>` 200, so tests don't need to script every bootstrapping kicker.
    pub async fn start(script: Vec<ScriptedResponse>) -> MockServer {
        let requests = Arc::new(Mutex::new(Vec::new()));
        let script = Arc::new(Mutex::new(VecDeque::from(script)));

        let listener = tokio::net::TcpListener::bind(("127.0.0.1", 0))
            .await
            .expect("bind loopback listener");
        let addr = listener.local_addr().expect("local addr");

        let requests_for_server = requests.clone();
        let make_svc = make_service_fn(move |_conn| {
            let requests = requests_for_server.clone();
            let script = script.clone();
            async move {
                Ok::<_, Infallible>(service_fn(move |req: Request<Body>| {
                    let requests = requests.clone();
                    let script = script.clone();
                    async move {
                        let bytes = hyper::body::to_bytes(req.into_body())
                            .await
                            .unwrap_or_default();
                        requests
                            .lock()
                            .unwrap()
                            .push(String::from_utf8_lossy(&bytes).into_owned());

                        let next = script.lock().unwrap().pop_front();
                        let response = match next {
                            Some(scripted) => Response::builder()
                                .status(scripted.status)
                                .body(Body::from(scripted.body))
                                .unwrap(),
                            None => Response::builder()
                                .status(200)
                                .body(Body::from("<messages/>"))
                                .unwrap(),
                        };
                        Ok::<_, Infallible>(response)
                    }
                }))
            }
        });

        let server = Server::from_tcp(listener.into_std().expect("into std listener"))
            .expect("server from tcp")
            .serve(make_svc);
        let handle = tokio::spawn(async move {
            if let Err(err) = server.await {
                eprintln!("mock server error: {err}");
            }
        });

        MockServer {
            addr,
            requests,
            _handle: handle,
        }
    }

    /// The `http://127.0.0.1:<port>/messaging` URL this server is listening on.
    pub fn url(&self) -> String {
        format!("http://{}/messaging", self.addr)
    }

    /// All request bodies received so far, in arrival order.
    pub fn requests(&self) -> Vec<String> {
        self.requests.lock().unwrap().clone()
    }
}
