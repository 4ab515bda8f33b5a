use crate::{
    agent::AgentCommand,
    conversation::EntryKind,
    error::AppError,
    state::AppState,
};
use actix_web::{web, HttpResponse};
use serde::Deserialize;
use serde_json::json;

/// Current status, socket state, microphone state and levels.
pub async fn get_session(state: web::Data<AppState>) -> Result<HttpResponse, AppError> {
    Ok(HttpResponse::Ok().json(json!({
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "session": state.agent.snapshot()
    })))
}

#[derive(Debug, Deserialize)]
pub struct ConversationQuery {
    pub kind: Option<EntryKind>,
}

/// The conversation log in arrival order, optionally filtered by kind, and
/// the behind-the-scenes events.
pub async fn get_conversation(
    state: web::Data<AppState>,
    query: web::Query<ConversationQuery>,
) -> Result<HttpResponse, AppError> {
    let log = state.agent.log();
    let log = log.read().await;

    let entries = match query.kind {
        Some(kind) => log.entries_of(kind),
        None => log.entries().to_vec(),
    };

    Ok(HttpResponse::Ok().json(json!({
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "entries": entries,
        "events": log.events()
    })))
}

/// The voice-bot button: no effect before the conversation starts, toggles
/// sleep afterwards.
pub async fn voice_bot_action(state: web::Data<AppState>) -> Result<HttpResponse, AppError> {
    state.agent.send(AgentCommand::VoiceBotAction)?;
    Ok(HttpResponse::Accepted().json(json!({
        "status": "accepted",
        "timestamp": chrono::Utc::now().to_rfc3339()
    })))
}

#[derive(Debug, Deserialize)]
pub struct SettingsUpdate {
    pub instructions: Option<String>,
    pub voice: Option<String>,
}

/// Change the extra instructions and/or the voice of the live session.
pub async fn update_settings(
    state: web::Data<AppState>,
    body: web::Json<SettingsUpdate>,
) -> Result<HttpResponse, AppError> {
    let update = body.into_inner();
    if update.instructions.is_none() && update.voice.is_none() {
        return Err(AppError::BadRequest(
            "expected `instructions` and/or `voice`".to_string(),
        ));
    }

    let mut agent = serde_json::Map::new();
    if let Some(instructions) = &update.instructions {
        agent.insert("instructions".into(), json!(instructions));
    }
    if let Some(voice) = &update.voice {
        agent.insert("speak_model".into(), json!(voice));
    }
    let partial = json!({ "agent": agent }).to_string();

    let mut config = state.get_config();
    config
        .update_from_json(&partial)
        .map_err(|e| AppError::ValidationError(e.to_string()))?;
    state
        .update_config(config.clone())
        .map_err(AppError::ValidationError)?;

    if let Some(instructions) = update.instructions {
        state.agent.send(AgentCommand::UpdateInstructions(instructions))?;
    }
    if let Some(voice) = update.voice {
        state.agent.send(AgentCommand::UpdateVoice(voice))?;
    }

    Ok(HttpResponse::Ok().json(json!({
        "status": "success",
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "agent": {
            "instructions": config.agent.instructions,
            "combined_instructions": config.agent.combined_instructions(),
            "voice": config.agent.speak_model
        }
    })))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::tests::test_state;
    use actix_web::{test, App};
    use std::time::Duration;

    #[actix_web::test]
    async fn test_settings_reach_the_agent() {
        let state = test_state();
        let mut snapshots = state.agent.subscribe();
        let app = test::init_service(
            App::new()
                .app_data(web::Data::new(state.clone()))
                .route("/session/settings", web::put().to(update_settings)),
        )
        .await;

        let req = test::TestRequest::put()
            .uri("/session/settings")
            .set_json(json!({"instructions": "Answer in haiku", "voice": "aura-2-orion-en"}))
            .to_request();
        let body: serde_json::Value = test::call_and_read_body_json(&app, req).await;
        assert_eq!(body["agent"]["voice"], "aura-2-orion-en");
        assert!(body["agent"]["combined_instructions"]
            .as_str()
            .unwrap()
            .ends_with("\nAnswer in haiku"));
        assert_eq!(state.get_config().agent.speak_model, "aura-2-orion-en");

        loop {
            if snapshots.borrow().voice == "aura-2-orion-en" {
                break;
            }
            tokio::time::timeout(Duration::from_secs(5), snapshots.changed())
                .await
                .unwrap()
                .unwrap();
        }
        assert_eq!(state.agent.snapshot().instructions, "Answer in haiku");
    }

    #[actix_web::test]
    async fn test_settings_validation() {
        let app = test::init_service(
            App::new()
                .app_data(web::Data::new(test_state()))
                .route("/session/settings", web::put().to(update_settings)),
        )
        .await;

        let empty = test::TestRequest::put()
            .uri("/session/settings")
            .set_json(json!({}))
            .to_request();
        assert_eq!(test::call_service(&app, empty).await.status(), 400);

        let blank_voice = test::TestRequest::put()
            .uri("/session/settings")
            .set_json(json!({"voice": "  "}))
            .to_request();
        assert_eq!(test::call_service(&app, blank_voice).await.status(), 400);
    }

    #[actix_web::test]
    async fn test_conversation_and_session_reads() {
        let state = test_state();
        {
            let log = state.agent.log();
            let mut log = log.write().await;
            log.push_utterance(crate::protocol::Role::User, "hello");
        }
        let app = test::init_service(
            App::new()
                .app_data(web::Data::new(state))
                .route("/conversation", web::get().to(get_conversation))
                .route("/session", web::get().to(get_session))
                .route("/session/action", web::post().to(voice_bot_action)),
        )
        .await;

        let req = test::TestRequest::get().uri("/conversation").to_request();
        let body: serde_json::Value = test::call_and_read_body_json(&app, req).await;
        assert_eq!(body["entries"][0]["content"], "hello");

        let req = test::TestRequest::get()
            .uri("/conversation?kind=latency")
            .to_request();
        let body: serde_json::Value = test::call_and_read_body_json(&app, req).await;
        assert_eq!(body["entries"].as_array().unwrap().len(), 0);

        let req = test::TestRequest::get().uri("/session").to_request();
        let body: serde_json::Value = test::call_and_read_body_json(&app, req).await;
        assert_eq!(body["session"]["status"], "NONE");

        let req = test::TestRequest::post().uri("/session/action").to_request();
        assert_eq!(test::call_service(&app, req).await.status(), 202);
    }
}
