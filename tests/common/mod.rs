#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU16, AtomicUsize, Ordering};
use std::sync::Arc;

use http::{Request, Response, StatusCode};
use http_body_util::BodyExt;
use tower::Service;
use trafficgate::http::{empty_body, full_body, Body, BoxError, ClientAddr, HttpService};

/// Upstream whose status can be changed between requests, counting calls.
#[derive(Clone)]
pub struct Upstream {
    status: Arc<AtomicU16>,
    calls: Arc<AtomicUsize>,
}

impl Upstream {
    pub fn new() -> Self {
        Self {
            status: Arc::new(AtomicU16::new(200)),
            calls: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn respond_with(&self, status: u16) {
        self.status.store(status, Ordering::SeqCst);
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn service(&self) -> HttpService {
        let upstream = self.clone();
        HttpService::new(tower::service_fn(move |_req: Request<Body>| {
            upstream.calls.fetch_add(1, Ordering::SeqCst);
            let status = StatusCode::from_u16(upstream.status.load(Ordering::SeqCst)).unwrap();
            async move {
                let mut resp = Response::new(full_body("upstream"));
                *resp.status_mut() = status;
                Ok::<_, BoxError>(resp)
            }
        }))
    }
}

pub fn request_from(addr: &str) -> Request<Body> {
    let addr: SocketAddr = addr.parse().unwrap();
    let mut req = Request::builder().uri("/").body(empty_body()).unwrap();
    req.extensions_mut().insert(ClientAddr(addr));
    req
}

pub async fn body_string(resp: Response<Body>) -> String {
    let bytes = resp.into_body().collect().await.unwrap().to_bytes();
    String::from_utf8(bytes.to_vec()).unwrap()
}

/// Drives `svc` through `poll_ready` and `call`. The boxed future from `call`
/// is `Send`, so this can run on a spawned task.
pub async fn send(mut svc: HttpService, req: Request<Body>) -> Response<Body> {
    std::future::poll_fn(|cx| svc.poll_ready(cx)).await.unwrap();
    svc.call(req).await.unwrap()
}
