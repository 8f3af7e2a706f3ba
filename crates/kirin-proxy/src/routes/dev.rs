//! Dev-mode wallet for the in-memory challenger.
//!
//! Mounted only when `CHALLENGER=memory`, which itself requires
//! `KIRIN_INSECURE_DEV=true`.

use actix_web::{web, HttpResponse};
use lsat::PaymentHash;

use crate::state::AppState;

/// POST /dev/pay/{payment_hash} - Settle a local invoice and reveal its preimage
pub async fn pay(path: web::Path<String>, state: web::Data<AppState>) -> HttpResponse {
    let Some(wallet) = state.dev_wallet.as_ref() else {
        return HttpResponse::NotFound().finish();
    };
    let payment_hash: PaymentHash = match path.into_inner().parse() {
        Ok(hash) => hash,
        Err(_) => {
            return HttpResponse::BadRequest().json(serde_json::json!({
                "error": "invalid_payment_hash",
                "message": "payment hash must be 64 hex characters"
            }))
        }
    };

    match wallet.pay(&payment_hash) {
        Some(preimage) => {
            tracing::info!(%payment_hash, "dev wallet settled invoice");
            HttpResponse::Ok().json(serde_json::json!({
                "payment_hash": payment_hash.to_hex(),
                "preimage": preimage.to_hex(),
            }))
        }
        None => HttpResponse::NotFound().json(serde_json::json!({
            "error": "unknown_invoice",
            "message": "no invoice with this payment hash"
        })),
    }
}

pub fn configure(cfg: &mut web::ServiceConfig) {
    cfg.route("/dev/pay/{payment_hash}", web::post().to(pay));
}
