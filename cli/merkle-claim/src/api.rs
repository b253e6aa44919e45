//! HTTP front of the claim service.
//!
//! `POST /claim {"wallet", "eventId", "proof"?}` answers
//! `{"success": true, "txHash", "status", "amount"}` or
//! `{"success": false, "error", "message", "retryable"}`.

use std::convert::Infallible;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use http_body_util::{BodyExt, Full, LengthLimitError, Limited};
use hyper::body::{Body, Bytes, Incoming};
use hyper::header::{HeaderValue, CONTENT_TYPE};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use hyper_util::server::graceful::GracefulShutdown;
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tracing::{debug, info, warn};

use crate::common::parse_hash32;
use crate::coordinator::{ClaimCoordinator, ClaimError, ClaimRequest};
use crate::eligibility::{EventId, Wallet};

const MAX_BODY_BYTES: usize = 64 * 1024;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
struct ClaimBody {
    wallet: Wallet,
    event_id: EventId,
    #[serde(default)]
    proof: Option<Vec<String>>,
}

/// Accepts connections until `shutdown` resolves, then waits for every open
/// connection to finish its in-flight request before returning.
pub async fn serve(
    listener: TcpListener,
    coordinator: Arc<ClaimCoordinator>,
    shutdown: impl Future<Output = ()>,
) -> std::io::Result<()> {
    info!(addr = %listener.local_addr()?, "Claim API listening");
    tokio::pin!(shutdown);
    let connections = GracefulShutdown::new();

    loop {
        let (stream, peer) = tokio::select! {
            _ = &mut shutdown => break,
            accepted = listener.accept() => match accepted {
                Ok(accepted) => accepted,
                Err(err) => {
                    warn!("Failed to accept connection: {err}");
                    continue;
                }
            },
        };

        let coordinator = coordinator.clone();
        let service =
            service_fn(move |req: Request<Incoming>| handle(req, coordinator.clone(), peer));
        let connection = http1::Builder::new().serve_connection(TokioIo::new(stream), service);
        let connection = connections.watch(connection);
        tokio::spawn(async move {
            if let Err(err) = connection.await {
                debug!(%peer, "Connection closed with error: {err}");
            }
        });
    }

    info!(
        open = connections.count(),
        "Claim API stopped accepting connections, draining"
    );
    connections.shutdown().await;
    info!("Claim API stopped");
    Ok(())
}

async fn handle<B>(
    req: Request<B>,
    coordinator: Arc<ClaimCoordinator>,
    peer: SocketAddr,
) -> Result<Response<Full<Bytes>>, Infallible>
where
    B: Body,
    B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
{
    let (parts, body) = req.into_parts();
    debug!(%peer, method = %parts.method, path = parts.uri.path(), "Request");

    let (status, value) = match (&parts.method, parts.uri.path()) {
        (&Method::GET, "/health") => (StatusCode::OK, json!({ "status": "ok" })),
        (&Method::POST, "/claim") => match Limited::new(body, MAX_BODY_BYTES).collect().await {
            Ok(collected) => claim_response(&coordinator, &collected.to_bytes()).await,
            Err(err) if err.downcast_ref::<LengthLimitError>().is_some() => failure(
                StatusCode::PAYLOAD_TOO_LARGE,
                "BadRequest",
                "request body too large".into(),
                false,
            ),
            Err(err) => failure(
                StatusCode::BAD_REQUEST,
                "BadRequest",
                format!("failed to read body: {err}"),
                false,
            ),
        },
        (_, "/health" | "/claim") => failure(
            StatusCode::METHOD_NOT_ALLOWED,
            "BadRequest",
            "method not allowed".into(),
            false,
        ),
        _ => failure(StatusCode::NOT_FOUND, "BadRequest", "no such route".into(), false),
    };

    let mut response = Response::new(Full::new(Bytes::from(value.to_string())));
    *response.status_mut() = status;
    response
        .headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    Ok(response)
}

/// Parses a claim body, runs it through the coordinator and renders the
/// outcome.
pub async fn claim_response(coordinator: &ClaimCoordinator, body: &[u8]) -> (StatusCode, Value) {
    let request = match parse_claim(body) {
        Ok(request) => request,
        Err(message) => return failure(StatusCode::BAD_REQUEST, "BadRequest", message, false),
    };

    match coordinator.claim(request).await {
        Ok(receipt) => (
            StatusCode::OK,
            json!({
                "success": true,
                "txHash": receipt.tx_hash,
                "status": receipt.settlement,
                "amount": receipt.amount.to_string(),
            }),
        ),
        Err(err) => failure(status_for(&err), err.kind(), err.to_string(), err.is_retryable()),
    }
}

fn parse_claim(body: &[u8]) -> Result<ClaimRequest, String> {
    let body: ClaimBody =
        serde_json::from_slice(body).map_err(|e| format!("invalid claim body: {e}"))?;
    let proof = body
        .proof
        .map(|nodes| {
            nodes
                .iter()
                .map(|node| parse_hash32(node).map_err(|e| format!("invalid proof node: {e}")))
                .collect::<Result<Vec<_>, _>>()
        })
        .transpose()?;
    Ok(ClaimRequest {
        wallet: body.wallet,
        event_id: body.event_id,
        proof,
    })
}

fn status_for(err: &ClaimError) -> StatusCode {
    match err {
        ClaimError::NotEligible { .. } => StatusCode::NOT_FOUND,
        ClaimError::AlreadyClaimed { .. } => StatusCode::CONFLICT,
        ClaimError::InvalidProof { .. } => StatusCode::UNPROCESSABLE_ENTITY,
        ClaimError::Reverted(_)
        | ClaimError::InsufficientFunds(_)
        | ClaimError::UnknownCampaign(_) => StatusCode::BAD_GATEWAY,
        ClaimError::Network { .. } => StatusCode::SERVICE_UNAVAILABLE,
        ClaimError::Ledger(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn failure(status: StatusCode, kind: &str, message: String, retryable: bool) -> (StatusCode, Value) {
    (
        status,
        json!({
            "success": false,
            "error": kind,
            "message": message,
            "retryable": retryable,
        }),
    )
}

#[cfg(test)]
mod tests {
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpStream;

    use std::time::Duration;

    use super::*;
    use crate::campaign::{Campaign, Campaigns};
    use crate::chain::mock::MockChain;
    use crate::chain::SubmitError;
    use crate::coordinator::RetryPolicy;
    use crate::ledger::conformance::{record, wallet};
    use crate::ledger::{EligibilityLedger, MemoryLedger};
    use crate::merkle::HashScheme;

    const AAA: &str = "0xaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa";

    async fn coordinator(chain: Arc<MockChain>) -> ClaimCoordinator {
        coordinator_with_ledger(chain).await.0
    }

    async fn coordinator_with_ledger(
        chain: Arc<MockChain>,
    ) -> (ClaimCoordinator, Arc<MemoryLedger>) {
        let ledger = Arc::new(MemoryLedger::new());
        ledger
            .seed(&[record(0xaa, 1, 100), record(0xbb, 1, 200)])
            .await
            .unwrap();
        let entries = ledger.entries(1).await.unwrap();
        let campaign = Campaign::from_entries(1, HashScheme::Keccak256, &entries).unwrap();
        let coordinator = ClaimCoordinator::new(
            ledger.clone(),
            chain,
            Arc::new(Campaigns::new([campaign])),
            RetryPolicy {
                max_attempts: 1,
                initial_delay_ms: 0,
                max_delay_ms: 0,
            },
        );
        (coordinator, ledger)
    }

    #[tokio::test]
    async fn test_claim_success_then_idempotent() {
        let coordinator = coordinator(Arc::new(MockChain::new())).await;
        let body = format!(r#"{{"wallet":"{AAA}","eventId":1}}"#);

        let (status, first) = claim_response(&coordinator, body.as_bytes()).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(first["success"], true);
        assert_eq!(first["status"], "Confirmed");
        assert_eq!(first["amount"], "100");

        let (status, second) = claim_response(&coordinator, body.as_bytes()).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(second["status"], "AlreadyClaimed");
        assert_eq!(second["txHash"], first["txHash"]);
    }

    #[tokio::test]
    async fn test_claim_errors() {
        let chain = Arc::new(MockChain::new());
        let coordinator = coordinator(chain.clone()).await;

        let body = format!(r#"{{"wallet":"{AAA}","eventId":2}}"#);
        let (status, value) = claim_response(&coordinator, body.as_bytes()).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(value["success"], false);
        assert_eq!(value["error"], "NotEligible");
        assert_eq!(value["retryable"], false);

        let body = format!(r#"{{"wallet":"{AAA}","eventId":1,"proof":["0x{}"]}}"#, "11".repeat(32));
        let (status, value) = claim_response(&coordinator, body.as_bytes()).await;
        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
        assert_eq!(value["error"], "InvalidProof");

        chain.fail_next([SubmitError::Network("connection refused".into())]);
        let body = format!(r#"{{"wallet":"{AAA}","eventId":1}}"#);
        let (status, value) = claim_response(&coordinator, body.as_bytes()).await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(value["error"], "NetworkError");
        assert_eq!(value["retryable"], true);

        chain.fail_next([SubmitError::InsufficientFunds("exceeds balance".into())]);
        let (status, value) = claim_response(&coordinator, body.as_bytes()).await;
        assert_eq!(status, StatusCode::BAD_GATEWAY);
        assert_eq!(value["error"], "InsufficientFunds");
    }

    #[tokio::test]
    async fn test_malformed_bodies() {
        let coordinator = coordinator(Arc::new(MockChain::new())).await;
        for body in [
            "not json".to_string(),
            r#"{"wallet":"0x1234","eventId":1}"#.to_string(),
            format!(r#"{{"wallet":"{AAA}"}}"#),
            format!(r#"{{"wallet":"{AAA}","eventId":1,"proof":["0x12"]}}"#),
            format!(r#"{{"wallet":"{AAA}","eventId":1,"extra":true}}"#),
        ] {
            let (status, value) = claim_response(&coordinator, body.as_bytes()).await;
            assert_eq!(status, StatusCode::BAD_REQUEST, "body {body}");
            assert_eq!(value["error"], "BadRequest");
        }
    }

    async fn roundtrip(addr: SocketAddr, request: String) -> String {
        let mut stream = TcpStream::connect(addr).await.unwrap();
        stream.write_all(request.as_bytes()).await.unwrap();
        let mut response = String::new();
        stream.read_to_string(&mut response).await.unwrap();
        response
    }

    #[tokio::test]
    async fn test_serve_over_http() {
        let coordinator = Arc::new(coordinator(Arc::new(MockChain::new())).await);
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (stop, stopped) = tokio::sync::oneshot::channel::<()>();
        let server = tokio::spawn(serve(listener, coordinator, async {
            let _ = stopped.await;
        }));

        let body = format!(r#"{{"wallet":"{AAA}","eventId":1}}"#);
        let response = roundtrip(
            addr,
            format!(
                "POST /claim HTTP/1.1\r\nHost: localhost\r\nContent-Type: application/json\r\n\
                 Content-Length: {}\r\nConnection: close\r\n\r\n{body}",
                body.len()
            ),
        )
        .await;
        assert!(response.starts_with("HTTP/1.1 200"), "{response}");
        assert!(response.contains("\"txHash\":\"0x"));

        let response = roundtrip(
            addr,
            "GET /health HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n".into(),
        )
        .await;
        assert!(response.starts_with("HTTP/1.1 200"));

        let response = roundtrip(
            addr,
            "GET /claim HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n".into(),
        )
        .await;
        assert!(response.starts_with("HTTP/1.1 405"));

        stop.send(()).unwrap();
        server.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_shutdown_waits_for_in_flight_claim() {
        let chain = Arc::new(MockChain::with_latency(Duration::from_millis(500)));
        let (coordinator, ledger) = coordinator_with_ledger(chain).await;
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (stop, stopped) = tokio::sync::oneshot::channel::<()>();
        let server = tokio::spawn(serve(listener, Arc::new(coordinator), async {
            let _ = stopped.await;
        }));

        let body = format!(r#"{{"wallet":"{AAA}","eventId":1}}"#);
        let client = tokio::spawn(roundtrip(
            addr,
            format!(
                "POST /claim HTTP/1.1\r\nHost: localhost\r\nContent-Type: application/json\r\n\
                 Content-Length: {}\r\nConnection: close\r\n\r\n{body}",
                body.len()
            ),
        ));
        tokio::time::sleep(Duration::from_millis(100)).await;
        stop.send(()).unwrap();
        server.await.unwrap().unwrap();

        let entry = ledger.lookup(&wallet(0xaa), 1).await.unwrap().unwrap();
        assert!(entry.claimed);
        let response = client.await.unwrap();
        assert!(response.starts_with("HTTP/1.1 200"), "{response}");
    }

    async fn call(
        coordinator: Arc<ClaimCoordinator>,
        request: Request<Full<Bytes>>,
    ) -> (StatusCode, Value) {
        let peer = SocketAddr::from(([127, 0, 0, 1], 40000));
        let response = handle(request, coordinator, peer).await.unwrap();
        let status = response.status();
        let body = response.into_body().collect().await.unwrap().to_bytes();
        (status, serde_json::from_slice(&body).unwrap())
    }

    #[tokio::test]
    async fn test_oversized_body_is_rejected() {
        let coordinator = Arc::new(coordinator(Arc::new(MockChain::new())).await);

        let padded = format!(
            r#"{{"wallet":"{AAA}","eventId":1,"proof":[]{}}}"#,
            " ".repeat(MAX_BODY_BYTES)
        );
        let request = Request::post("/claim")
            .body(Full::new(Bytes::from(padded)))
            .unwrap();
        let (status, value) = call(coordinator.clone(), request).await;
        assert_eq!(status, StatusCode::PAYLOAD_TOO_LARGE);
        assert_eq!(value["success"], false);
        assert_eq!(value["error"], "BadRequest");

        // An ordinary body on the same route still goes through.
        let body = format!(r#"{{"wallet":"{AAA}","eventId":1}}"#);
        let request = Request::post("/claim")
            .body(Full::new(Bytes::from(body)))
            .unwrap();
        let (status, value) = call(coordinator, request).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(value["success"], true);
    }
}
