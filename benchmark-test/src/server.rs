//! Exposes an in-process mock of the processing functions for use in tests.
//!
//! Every function is served under its stage name, e.g. `/image-scale` or `/video-merge`. Unless
//! configured otherwise, a function answers with [`DEFAULT_RESPONSE`].
//!
//! ```
//! use benchmark_test::server::FunctionServer;
//!
//! #[tokio::main]
//! async fn main() {
//!    let server = FunctionServer::builder()
//!        .respond("image-recognition", "not-json")
//!        .start();
//!    let url = server.url("/image-recognition");
//!    // use the URL in tests...
//! }
//! ```

use std::collections::HashMap;
use std::net::{SocketAddr, TcpListener};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::Router;
use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::routing;
use serde_json::Value;

/// A response carrying every duration field any of the functions reports.
pub const DEFAULT_RESPONSE: &str = r#"{
    "force_remote": false,
    "predictions": ["tabby cat"],
    "short_result": true,
    "code_duration": 0.5,
    "download_duration": 0.1,
    "scale_duration": 0.2,
    "inference_duration": 0.2,
    "split_duration": 0.2,
    "transcode_duration": 0.2,
    "merge_duration": 0.2,
    "upload_duration": 0.1
}"#;

/// A request received by the [`FunctionServer`].
#[derive(Clone, Debug)]
pub struct RecordedRequest {
    /// Name of the function, which is the request path without the leading slash.
    pub name: String,
    /// The JSON request body, or `Value::Null` if it was not valid JSON.
    pub body: Value,
}

#[derive(Debug, Default)]
struct ServerState {
    responses: HashMap<String, String>,
    delays: HashMap<String, Duration>,
    requests: Mutex<Vec<RecordedRequest>>,
}

/// Configures the responses of a [`FunctionServer`].
#[derive(Debug, Default)]
pub struct FunctionServerBuilder {
    state: ServerState,
}

impl FunctionServerBuilder {
    /// Answers requests to function `name` with the raw `body`.
    pub fn respond(mut self, name: &str, body: &str) -> Self {
        self.state.responses.insert(name.to_owned(), body.to_owned());
        self
    }

    /// Delays the answer of function `name` by `delay`.
    pub fn delay(mut self, name: &str, delay: Duration) -> Self {
        self.state.delays.insert(name.to_owned(), delay);
        self
    }

    /// Binds to a random port on localhost and starts serving.
    pub fn start(self) -> FunctionServer {
        let state = Arc::new(self.state);

        let router = Router::new()
            .route("/{name}", routing::post(handle))
            .with_state(state.clone());

        let addr = SocketAddr::from(([127, 0, 0, 1], 0));
        let listener = TcpListener::bind(addr).unwrap();
        listener.set_nonblocking(true).unwrap();
        let socket = listener.local_addr().unwrap();

        let handle = tokio::spawn(async move {
            let listener = tokio::net::TcpListener::from_std(listener).unwrap();
            axum::serve(listener, router).await.unwrap();
        });

        FunctionServer {
            handle,
            socket,
            state,
        }
    }
}

async fn handle(
    State(state): State<Arc<ServerState>>,
    Path(name): Path<String>,
    body: Bytes,
) -> String {
    let body = serde_json::from_slice(&body).unwrap_or(Value::Null);
    state.requests.lock().unwrap().push(RecordedRequest {
        name: name.clone(),
        body,
    });

    if let Some(delay) = state.delays.get(&name) {
        tokio::time::sleep(*delay).await;
    }

    state
        .responses
        .get(&name)
        .map(String::as_str)
        .unwrap_or(DEFAULT_RESPONSE)
        .to_owned()
}

/// An in-process mock of the processing functions.
///
/// The server listens on a random available port on localhost and stops when dropped.
#[derive(Debug)]
pub struct FunctionServer {
    handle: tokio::task::JoinHandle<()>,
    socket: SocketAddr,
    state: Arc<ServerState>,
}

impl FunctionServer {
    /// Creates a builder for configuring the server's responses.
    pub fn builder() -> FunctionServerBuilder {
        FunctionServerBuilder::default()
    }

    /// Starts a server answering every function with [`DEFAULT_RESPONSE`].
    pub fn new() -> Self {
        Self::builder().start()
    }

    /// Returns a full URL pointing to the given path.
    ///
    /// This URL uses `localhost` as hostname.
    pub fn url(&self, path: &str) -> String {
        let path = path.trim_start_matches('/');
        format!("http://localhost:{}/{}", self.socket.port(), path)
    }

    /// All requests received so far, in arrival order.
    pub fn requests(&self) -> Vec<RecordedRequest> {
        self.state.requests.lock().unwrap().clone()
    }
}

impl Default for FunctionServer {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for FunctionServer {
    fn drop(&mut self) {
        self.handle.abort();
    }
}
