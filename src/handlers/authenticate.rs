use crate::{error::AppError, state::AppState};
use actix_web::{web, HttpResponse};
use tracing::info;

/// `POST /api/authenticate`: a key the client presents when opening the
/// agent socket. The body always carries `key` on success.
pub async fn authenticate(state: web::Data<AppState>) -> Result<HttpResponse, AppError> {
    let payload = state.issuer.issue().await?;
    state.increment_credentials_issued();
    info!("issued agent credential");
    Ok(HttpResponse::Ok().json(payload))
}
