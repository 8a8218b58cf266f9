//! In-process upstream used by the unit tests.

use std::{io, net::SocketAddr};

use axum::{
    Router,
    body::Body,
    http::{HeaderMap, StatusCode, header::CONTENT_TYPE},
    response::IntoResponse,
    routing::get,
};
use bytes::Bytes;
use futures_util::{StreamExt, stream};
use tokio::net::TcpListener;

pub fn mp4_bytes(len: usize) -> Vec<u8> {
    let mut bytes = vec![0x00, 0x00, 0x00, 0x18];
    bytes.extend_from_slice(b"ftypmp42\x00\x00\x00\x00mp42isom");
    let mut counter: u8 = 0;
    while bytes.len() < len {
        bytes.push(counter);
        counter = counter.wrapping_add(31);
    }
    bytes
}

pub fn webm_bytes() -> Vec<u8> {
    let mut bytes = vec![0x1A, 0x45, 0xDF, 0xA3, 0x9F, 0x42, 0x86, 0x81, 0x01];
    bytes.resize(8 * 1024, 0xEC);
    bytes
}

pub struct UpstreamServer {
    addr: SocketAddr,
}

impl UpstreamServer {
    pub async fn start() -> Self {
        let app = Router::new()
            .route(
                "/video.mp4",
                get(|| async { ([(CONTENT_TYPE, "video/mp4")], mp4_bytes(256 * 1024)) }),
            )
            .route("/forbidden", get(|| async { StatusCode::FORBIDDEN }))
            .route(
                "/html",
                get(|| async {
                    (
                        [(CONTENT_TYPE, "text/html")],
                        "<!DOCTYPE html><html><body>Sign in</body></html>",
                    )
                }),
            )
            .route(
                "/playlist",
                get(|| async { "#EXTM3U\n#EXT-X-VERSION:3\n#EXTINF:4.0,\nseg0.ts\n" }),
            )
            .route(
                "/webm",
                get(|| async { ([(CONTENT_TYPE, "video/mp4")], webm_bytes()) }),
            )
            .route("/needs-referer", get(needs_referer))
            .route("/stall-early", get(|| async { stalling(mp4_bytes(100)) }))
            .route("/stall-late", get(|| async { stalling(mp4_bytes(8 * 1024)) }));

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        Self { addr }
    }

    pub fn url(&self, path: &str) -> String {
        format!("http://{}{path}", self.addr)
    }
}

/// Sends `first` and then never another byte, keeping the connection open.
fn stalling(first: Vec<u8>) -> impl IntoResponse {
    let body = stream::iter([Ok::<_, io::Error>(Bytes::from(first))]).chain(stream::pending());
    ([(CONTENT_TYPE, "video/mp4")], Body::from_stream(body))
}

async fn needs_referer(headers: HeaderMap) -> impl IntoResponse {
    let allowed = headers
        .get("referer")
        .is_some_and(|value| value == "https://site.example/");
    if allowed {
        ([(CONTENT_TYPE, "video/mp4")], mp4_bytes(16 * 1024)).into_response()
    } else {
        StatusCode::FORBIDDEN.into_response()
    }
}
