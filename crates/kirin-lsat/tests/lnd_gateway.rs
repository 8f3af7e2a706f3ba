//! LndChallenger against a minimal in-process LND REST endpoint.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use actix_web::{web, App, HttpRequest, HttpResponse, HttpServer};
use base64::Engine;
use serde_json::{json, Value};

use lsat::{ChallengeError, Challenger, LndChallenger, LndConfig, PaymentHash, Preimage, Settlement};

const MACAROON: &str = "0201036c6e6402f801030a10";

#[derive(Default)]
struct FakeLnd {
    /// Invoice state keyed by hex payment hash.
    invoices: Mutex<HashMap<String, &'static str>>,
    /// Bodies of accepted add-invoice requests.
    requests: Mutex<Vec<Value>>,
    lookups: Mutex<Vec<String>>,
    fail_adds: bool,
}

fn authorized(req: &HttpRequest) -> bool {
    req.headers()
        .get("Grpc-Metadata-macaroon")
        .and_then(|v| v.to_str().ok())
        == Some(MACAROON)
}

async fn add_invoice(state: web::Data<FakeLnd>, req: HttpRequest, body: web::Json<Value>) -> HttpResponse {
    if !authorized(&req) {
        return HttpResponse::Unauthorized().json(json!({ "code": 2, "message": "verification failed" }));
    }
    if state.fail_adds {
        return HttpResponse::InternalServerError().json(json!({ "code": 2, "message": "wallet locked" }));
    }

    let mut invoices = state.invoices.lock().unwrap();
    let preimage = Preimage([invoices.len() as u8 + 1; 32]);
    let hash = preimage.hash();
    invoices.insert(hash.to_hex(), "OPEN");
    state.requests.lock().unwrap().push(body.into_inner());

    HttpResponse::Ok().json(json!({
        "r_hash": base64::engine::general_purpose::STANDARD.encode(hash.0),
        "payment_request": format!("lnbcrt{}", invoices.len()),
        "add_index": invoices.len().to_string()
    }))
}

async fn lookup_invoice(
    state: web::Data<FakeLnd>,
    req: HttpRequest,
    path: web::Path<String>,
) -> HttpResponse {
    if !authorized(&req) {
        return HttpResponse::Unauthorized().finish();
    }
    let hash = path.into_inner();
    state.lookups.lock().unwrap().push(hash.clone());
    match state.invoices.lock().unwrap().get(&hash) {
        // proto3 JSON leaves the zero value (OPEN) out.
        Some(&"OPEN") => HttpResponse::Ok().json(json!({ "memo": "kirin" })),
        Some(state) => HttpResponse::Ok().json(json!({ "state": state })),
        None => HttpResponse::NotFound().json(json!({ "code": 5, "message": "unable to locate invoice" })),
    }
}

fn spawn_fake_lnd(state: FakeLnd) -> (String, web::Data<FakeLnd>) {
    let state = web::Data::new(state);
    let data = state.clone();
    let server = HttpServer::new(move || {
        App::new()
            .app_data(data.clone())
            .route("/v1/invoices", web::post().to(add_invoice))
            .route("/v1/invoice/{hash}", web::get().to(lookup_invoice))
    })
    .workers(1)
    .bind(("127.0.0.1", 0))
    .unwrap();
    let addr = server.addrs()[0];
    actix_rt::spawn(server.run());
    (format!("http://{addr}"), state)
}

fn challenger(url: &str, macaroon: &str) -> LndChallenger {
    let mut config = LndConfig::new(url, macaroon);
    config.invoice_expiry_secs = 600;
    config.timeout = Duration::from_secs(5);
    LndChallenger::new(config).unwrap()
}

#[actix_rt::test]
async fn test_new_obligation_decodes_r_hash() {
    let (url, fake) = spawn_fake_lnd(FakeLnd::default());
    let lnd = challenger(&format!("{url}/"), MACAROON);

    let obligation = lnd.new_obligation("kirin: premium", 2000).await.unwrap();
    assert_eq!(obligation.payment_hash, Preimage([1; 32]).hash());
    assert_eq!(obligation.invoice, "lnbcrt1");
    assert_eq!(obligation.amount_msat, 2000);
    assert!(obligation.expires_at > lsat::unix_now());

    let requests = fake.requests.lock().unwrap();
    assert_eq!(requests[0]["memo"], "kirin: premium");
    // int64 fields travel as strings in LND's JSON mapping.
    assert_eq!(requests[0]["value_msat"], "2000");
    assert_eq!(requests[0]["expiry"], "600");
}

#[actix_rt::test]
async fn test_settlement_follows_invoice_state() {
    let (url, fake) = spawn_fake_lnd(FakeLnd::default());
    let lnd = challenger(&url, MACAROON);
    let hash = lnd.new_obligation("kirin", 1000).await.unwrap().payment_hash;

    assert_eq!(lnd.settlement(&hash).await.unwrap(), Settlement::Pending);
    assert_eq!(fake.lookups.lock().unwrap().as_slice(), [hash.to_hex()]);

    fake.invoices.lock().unwrap().insert(hash.to_hex(), "SETTLED");
    assert_eq!(lnd.settlement(&hash).await.unwrap(), Settlement::Settled);

    fake.invoices.lock().unwrap().insert(hash.to_hex(), "CANCELED");
    assert_eq!(lnd.settlement(&hash).await.unwrap(), Settlement::Expired);
}

#[actix_rt::test]
async fn test_unknown_invoice_is_rejected() {
    let (url, _fake) = spawn_fake_lnd(FakeLnd::default());
    let lnd = challenger(&url, MACAROON);

    let err = lnd.settlement(&PaymentHash([7; 32])).await.unwrap_err();
    assert!(matches!(err, ChallengeError::Rejected(_)), "{err:?}");
}

#[actix_rt::test]
async fn test_wrong_macaroon_is_rejected() {
    let (url, fake) = spawn_fake_lnd(FakeLnd::default());
    let lnd = challenger(&url, "deadbeef");

    let err = lnd.new_obligation("kirin", 1000).await.unwrap_err();
    assert!(matches!(err, ChallengeError::Rejected(_)), "{err:?}");
    assert!(fake.invoices.lock().unwrap().is_empty());
}

#[actix_rt::test]
async fn test_node_error_is_rejected() {
    let (url, _fake) = spawn_fake_lnd(FakeLnd {
        fail_adds: true,
        ..FakeLnd::default()
    });
    let lnd = challenger(&url, MACAROON);

    let err = lnd.new_obligation("kirin", 1000).await.unwrap_err();
    let ChallengeError::Rejected(detail) = err else {
        panic!("expected Rejected, got {err:?}");
    };
    assert!(detail.contains("500"));
}

#[actix_rt::test]
async fn test_unreachable_node() {
    // Bind then drop to get a port with nothing listening.
    let port = std::net::TcpListener::bind("127.0.0.1:0")
        .unwrap()
        .local_addr()
        .unwrap()
        .port();
    let lnd = challenger(&format!("http://127.0.0.1:{port}"), MACAROON);

    let err = lnd.new_obligation("kirin", 1000).await.unwrap_err();
    assert!(matches!(err, ChallengeError::Unreachable(_)), "{err:?}");
}
