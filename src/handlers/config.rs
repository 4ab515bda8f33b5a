use crate::{error::AppError, state::AppState};
use actix_web::{web, HttpResponse};
use serde_json::json;

/// The effective configuration with the API key redacted.
pub async fn get_config(state: web::Data<AppState>) -> Result<HttpResponse, AppError> {
    let config = state.get_config().redacted();

    Ok(HttpResponse::Ok().json(json!({
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "config": config,
        "derived": {
            "combined_instructions": config.agent.combined_instructions(),
            "keepalive_interval_secs": config.transport.keepalive_interval().as_secs(),
            "reconnect_delay_secs": config.transport.reconnect_delay().as_secs()
        }
    })))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::tests::test_state;
    use actix_web::{test, App};

    #[actix_web::test]
    async fn test_config_is_redacted() {
        let state = test_state();
        {
            let mut config = state.get_config();
            config.credentials.api_key = Some("dg-secret".to_string());
            state.update_config(config).unwrap();
        }

        let app = test::init_service(
            App::new()
                .app_data(web::Data::new(state))
                .route("/config", web::get().to(get_config)),
        )
        .await;

        let req = test::TestRequest::get().uri("/config").to_request();
        let body: serde_json::Value = test::call_and_read_body_json(&app, req).await;
        assert_eq!(body["config"]["credentials"]["api_key"], "***");
        assert_eq!(body["config"]["credentials"]["strategy"], "provided");
        assert_eq!(body["derived"]["keepalive_interval_secs"], 10);
    }
}
