pub mod dev;
pub mod health;
pub mod proxy;

use actix_web::web;

use crate::state::AppState;

/// Fixed routes for `state`. The proxy itself is mounted as the default
/// service with [`proxy::handle`].
pub fn configure(state: &AppState) -> impl FnOnce(&mut web::ServiceConfig) {
    let dev = state.dev_wallet.is_some();
    move |cfg: &mut web::ServiceConfig| {
        cfg.configure(health::configure);
        if dev {
            cfg.configure(dev::configure);
        }
    }
}
