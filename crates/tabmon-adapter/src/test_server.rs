//! Scripted HTTP endpoint for driving the SOAP and CIM-XML adapters.

use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::routing::post;
use axum::Router;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// One request as the server saw it.
#[derive(Debug, Clone)]
pub(crate) struct Received {
    pub cim_method: Option<String>,
    pub body: String,
}

/// A scripted answer.
pub(crate) struct Reply {
    status: StatusCode,
    body: String,
    delay: Duration,
}

impl Reply {
    pub fn ok(body: impl Into<String>) -> Self {
        Self::status(StatusCode::OK, body)
    }

    pub fn status(status: StatusCode, body: impl Into<String>) -> Self {
        Self {
            status,
            body: body.into(),
            delay: Duration::ZERO,
        }
    }

    pub fn delayed(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }
}

pub(crate) struct Script {
    replies: Mutex<VecDeque<Reply>>,
    received: Mutex<Vec<Received>>,
}

impl Script {
    pub fn received(&self) -> Vec<Received> {
        self.received.lock().unwrap().clone()
    }

    /// Waits until `count` requests arrived; background requests are
    /// not awaited by the code under test.
    pub async fn wait_for(&self, count: usize) -> Vec<Received> {
        for _ in 0..200 {
            let received = self.received();
            if received.len() >= count {
                return received;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("expected {count} requests, got {:?}", self.received());
    }
}

/// Serves `replies` in order on `path` and returns the bound port. A
/// request past the end of the script gets an empty 500.
pub(crate) async fn serve(path: &str, replies: Vec<Reply>) -> (u16, Arc<Script>) {
    let script = Arc::new(Script {
        replies: Mutex::new(replies.into()),
        received: Mutex::new(Vec::new()),
    });
    let app = Router::new()
        .route(path, post(reply))
        .with_state(Arc::clone(&script));

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    (port, script)
}

async fn reply(
    State(script): State<Arc<Script>>,
    headers: HeaderMap,
    body: String,
) -> (StatusCode, String) {
    script.received.lock().unwrap().push(Received {
        cim_method: headers
            .get("CIMMethod")
            .and_then(|v| v.to_str().ok())
            .map(str::to_string),
        body,
    });
    let next = script.replies.lock().unwrap().pop_front();
    let Some(reply) = next else {
        return (StatusCode::INTERNAL_SERVER_ERROR, String::new());
    };
    tokio::time::sleep(reply.delay).await;
    (reply.status, reply.body)
}
