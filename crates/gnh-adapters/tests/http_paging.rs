use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use gnh_adapters::{
    AdapterError, GeoNodeClient, HttpSettings, PageFetchError, PageFetcher, RetryPolicy,
    UpstreamSource,
};
use gnh_core::ResourceKind;
use serde_json::json;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::sync::Mutex;

#[derive(Clone)]
struct Reply {
    status: u16,
    headers: Vec<(&'static str, String)>,
    body: String,
}

impl Reply {
    fn json(body: serde_json::Value) -> Self {
        Self {
            status: 200,
            headers: Vec::new(),
            body: body.to_string(),
        }
    }

    fn status(status: u16) -> Self {
        Self {
            status,
            headers: Vec::new(),
            body: String::new(),
        }
    }

    fn header(mut self, name: &'static str, value: &str) -> Self {
        self.headers.push((name, value.to_string()));
        self
    }
}

/// Serves scripted replies per request path; the last reply for a path repeats.
#[derive(Default)]
struct Script {
    replies: Mutex<HashMap<String, VecDeque<Reply>>>,
    hits: Mutex<HashMap<String, usize>>,
}

impl Script {
    async fn on(&self, path: &str, replies: Vec<Reply>) {
        self.replies.lock().await.insert(path.to_string(), replies.into());
    }

    async fn hits(&self, path: &str) -> usize {
        self.hits.lock().await.get(path).copied().unwrap_or(0)
    }

    async fn next_reply(&self, path: &str) -> Reply {
        *self.hits.lock().await.entry(path.to_string()).or_default() += 1;
        let mut replies = self.replies.lock().await;
        match replies.get_mut(path) {
            Some(queue) if queue.len() > 1 => queue.pop_front().expect("non-empty"),
            Some(queue) => queue.front().cloned().unwrap_or_else(|| Reply::status(404)),
            None => Reply::status(404),
        }
    }
}

async fn serve(script: Arc<Script>) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("addr");
    tokio::spawn(async move {
        loop {
            let Ok((mut socket, _)) = listener.accept().await else {
                return;
            };
            let script = Arc::clone(&script);
            tokio::spawn(async move {
                let mut request = Vec::new();
                let mut buf = [0u8; 1024];
                while !request.windows(4).any(|w| w == b"\r\n\r\n") {
                    match socket.read(&mut buf).await {
                        Ok(0) | Err(_) => return,
                        Ok(n) => request.extend_from_slice(&buf[..n]),
                    }
                }
                let head = String::from_utf8_lossy(&request);
                let path = head.split_whitespace().nth(1).unwrap_or("/").to_string();
                let reply = script.next_reply(&path).await;

                let mut response = format!(
                    "HTTP/1.1 {} Scripted\r\ncontent-type: application/json\r\ncontent-length: {}\r\nconnection: close\r\n",
                    reply.status,
                    reply.body.len()
                );
                for (name, value) in &reply.headers {
                    response.push_str(&format!("{name}: {value}\r\n"));
                }
                response.push_str("\r\n");
                response.push_str(&reply.body);
                let _ = socket.write_all(response.as_bytes()).await;
                let _ = socket.shutdown().await;
            });
        }
    });
    format!("http://{addr}")
}

fn client(base_url: &str, attempts: u32) -> GeoNodeClient {
    let fetcher = PageFetcher::new(HttpSettings {
        timeout: Duration::from_secs(5),
        retry: RetryPolicy {
            attempts,
            initial: Duration::from_millis(5),
            ceiling: Duration::from_millis(20),
        },
        ..HttpSettings::default()
    })
    .expect("client");
    GeoNodeClient::new("local", base_url, Arc::new(fetcher))
}

#[tokio::test]
async fn listings_follow_pages_and_ride_out_throttling() {
    let script = Arc::new(Script::default());
    let base = serve(Arc::clone(&script)).await;
    script
        .on(
            "/api/v2/datasets/",
            vec![
                Reply::status(503).header("retry-after", "0"),
                Reply::status(429),
                Reply::json(json!({
                    "links": {"next": format!("{base}/api/v2/datasets/?page=2")},
                    "datasets": [{"uuid": "a", "pk": 1}]
                })),
            ],
        )
        .await;
    script
        .on(
            "/api/v2/datasets/?page=2",
            vec![Reply::json(json!({"links": {"next": null}, "datasets": [{"uuid": "b"}]}))],
        )
        .await;

    let records = client(&base, 4).fetch_all(ResourceKind::Layer).await.expect("listing");
    let guids: Vec<_> = records.iter().map(|r| r.guid.as_str()).collect();
    assert_eq!(guids, vec!["a", "b"]);
    assert_eq!(script.hits("/api/v2/datasets/").await, 3);
    assert_eq!(script.hits("/api/v2/datasets/?page=2").await, 1);
}

#[tokio::test]
async fn client_errors_fail_the_listing_without_retrying() {
    let script = Arc::new(Script::default());
    let base = serve(Arc::clone(&script)).await;
    script.on("/api/v2/maps/", vec![Reply::status(404)]).await;

    let err = client(&base, 4).fetch_all(ResourceKind::Map).await.unwrap_err();
    assert!(matches!(
        err,
        AdapterError::Fetch {
            kind: ResourceKind::Map,
            source: PageFetchError::Status { status: 404 },
            ..
        }
    ));
    assert_eq!(script.hits("/api/v2/maps/").await, 1);
}

#[tokio::test]
async fn retries_stop_after_the_configured_attempts() {
    let script = Arc::new(Script::default());
    let base = serve(Arc::clone(&script)).await;
    script.on("/api/v2/documents/", vec![Reply::status(503)]).await;

    let err = client(&base, 2).fetch_all(ResourceKind::Doc).await.unwrap_err();
    assert!(matches!(
        err,
        AdapterError::Fetch { source: PageFetchError::Status { status: 503 }, .. }
    ));
    assert_eq!(script.hits("/api/v2/documents/").await, 2);
}

#[tokio::test]
async fn html_error_pages_are_not_json() {
    let script = Arc::new(Script::default());
    let base = serve(Arc::clone(&script)).await;
    script
        .on(
            "/api/v2/documents/",
            vec![Reply {
                status: 200,
                headers: Vec::new(),
                body: "<html>maintenance</html>".into(),
            }],
        )
        .await;

    let err = client(&base, 3).fetch_all(ResourceKind::Doc).await.unwrap_err();
    assert!(matches!(err, AdapterError::Fetch { source: PageFetchError::Body(_), .. }));
    assert_eq!(script.hits("/api/v2/documents/").await, 1);
}
