//! Mocked API server for exercising call sequences against `kube::Client`.

use http::{Method, Request, Response, StatusCode};
use kube::client::Body;
use kube::Client;
use serde_json::{json, Value};
use tower_test::mock::{self, Handle, SendResponse};

pub struct ApiServerVerifier(Handle<Request<Body>, Response<Body>>);

pub fn mock_client() -> (Client, ApiServerVerifier) {
    let (mock_service, handle) = mock::pair::<Request<Body>, Response<Body>>();
    (
        Client::new(mock_service, "default"),
        ApiServerVerifier(handle),
    )
}

impl ApiServerVerifier {
    /// Expect the next request to be `method path` and answer with `status` and `body`.
    /// Returns the request body, or `Value::Null` if it was empty.
    pub async fn handle(&mut self, method: Method, path: &str, status: u16, body: Value) -> Value {
        let (request, send) = self.0.next_request().await.expect("service not called");
        assert_eq!(request.method(), method, "unexpected method for {}", request.uri());
        assert_eq!(request.uri().path(), path);

        let bytes = request.into_body().collect_bytes().await.unwrap();
        let request_body = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap()
        };

        send.send_response(
            Response::builder()
                .status(StatusCode::from_u16(status).unwrap())
                .body(Body::from(serde_json::to_vec(&body).unwrap()))
                .unwrap(),
        );
        request_body
    }

    /// Answer the next request with 200 and `body`
    pub async fn ok(&mut self, method: Method, path: &str, body: Value) -> Value {
        self.handle(method, path, 200, body).await
    }

    /// Answer the next request with a 404 Status
    pub async fn not_found(&mut self, method: Method, path: &str) -> Value {
        self.handle(method, path, 404, not_found_status()).await
    }

    /// The next request, for assertions the helpers above do not cover
    pub async fn next_raw(&mut self) -> (Request<Body>, SendResponse<Response<Body>>) {
        self.0.next_request().await.expect("service not called")
    }

    /// Answer the next request by echoing its body
    pub async fn echo(&mut self, method: Method, path: &str) -> Value {
        let (request, send) = self.0.next_request().await.expect("service not called");
        assert_eq!(request.method(), method, "unexpected method for {}", request.uri());
        assert_eq!(request.uri().path(), path);

        let bytes = request.into_body().collect_bytes().await.unwrap();
        let request_body: Value = serde_json::from_slice(&bytes).unwrap();
        send.send_response(Response::builder().body(Body::from(bytes.to_vec())).unwrap());
        request_body
    }
}

pub fn not_found_status() -> Value {
    json!({
        "kind": "Status",
        "apiVersion": "v1",
        "metadata": {},
        "status": "Failure",
        "message": "not found",
        "reason": "NotFound",
        "code": 404
    })
}

pub fn success_status() -> Value {
    json!({
        "kind": "Status",
        "apiVersion": "v1",
        "metadata": {},
        "status": "Success",
        "code": 200
    })
}

/// A Status response carrying `code`
pub fn status_response(code: u16) -> Response<Body> {
    let body = if code == 404 {
        not_found_status()
    } else {
        success_status()
    };
    Response::builder()
        .status(StatusCode::from_u16(code).unwrap())
        .body(Body::from(serde_json::to_vec(&body).unwrap()))
        .unwrap()
}
