use actix_web::http::header;
use actix_web::{web, HttpRequest, HttpResponse, Responder};
use futures_util::StreamExt;
use serde::Deserialize;
use tracing::{info, warn};

use crate::models::chat::ChatCompletionRequest;
use crate::util::{credential_fingerprint, error_response, select_credential, AppState};

pub fn config_routes(cfg: &mut web::ServiceConfig) {
    cfg.service(
        web::scope("")
            .route("/status", web::get().to(status))
            .route("/v1/models", web::get().to(list_models))
            .route("/token/check", web::post().to(token_check))
            .route("/v1/chat/completions", web::post().to(chat_completions)),
    );
}

/// Service status endpoint.
async fn status(state: web::Data<AppState>) -> impl Responder {
    web::Json(serde_json::json!({
        "name": env!("CARGO_PKG_NAME"),
        "version": env!("CARGO_PKG_VERSION"),
        "model": state.config.models.first(),
        "routes": ["/status", "/v1/models", "/token/check", "/v1/chat/completions"],
    }))
}

async fn list_models(state: web::Data<AppState>) -> impl Responder {
    let data: Vec<serde_json::Value> = state
        .config
        .models
        .iter()
        .map(|id| {
            serde_json::json!({
                "id": id,
                "object": "model",
                "owned_by": env!("CARGO_PKG_NAME"),
            })
        })
        .collect();
    web::Json(serde_json::json!({ "object": "list", "data": data }))
}

#[derive(Debug, Deserialize)]
struct TokenCheckRequest {
    token: String,
}

async fn token_check(
    state: web::Data<AppState>,
    body: web::Json<TokenCheckRequest>,
) -> impl Responder {
    let token = body.into_inner().token;
    let live = match select_credential(&token) {
        Some(key) => state.relay.check(&key).await,
        None => false,
    };
    web::Json(serde_json::json!({ "live": live }))
}

fn request_credential(req: &HttpRequest) -> Option<String> {
    let raw = req
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok());
    crate::util::bearer_token(raw).and_then(|list| select_credential(&list))
}

async fn chat_completions(
    state: web::Data<AppState>,
    req: HttpRequest,
    body: web::Bytes,
) -> HttpResponse {
    let Some(key) = request_credential(&req) else {
        return error_response(
            http::StatusCode::UNAUTHORIZED,
            "Missing or invalid Authorization bearer credential",
        );
    };

    let chat_req: ChatCompletionRequest = match serde_json::from_slice(&body) {
        Ok(r) => r,
        Err(e) => {
            return error_response(
                http::StatusCode::BAD_REQUEST,
                &format!("Invalid chat completion request: {e}"),
            )
        }
    };
    if chat_req.messages.is_empty() {
        return error_response(
            http::StatusCode::BAD_REQUEST,
            "Request must contain at least one message",
        );
    }

    info!(
        "Chat completion for {} (model={}, messages={}, stream={})",
        credential_fingerprint(&key),
        chat_req.model,
        chat_req.messages.len(),
        chat_req.stream
    );

    if chat_req.stream {
        match state.relay.complete_stream(&key, &chat_req).await {
            Ok(body) => HttpResponse::Ok()
                .insert_header(("content-type", "text/event-stream"))
                .insert_header(("cache-control", "no-cache"))
                .insert_header(("connection", "keep-alive"))
                .streaming(body.map(Ok::<_, actix_web::Error>)),
            Err(err) => {
                warn!("Streaming chat completion failed: {}", err);
                error_response(err.status_code(), &err.to_string())
            }
        }
    } else {
        match state.relay.complete(&key, &chat_req).await {
            Ok(completion) => HttpResponse::Ok().json(completion),
            Err(err) => {
                warn!("Chat completion failed: {}", err);
                error_response(err.status_code(), &err.to_string())
            }
        }
    }
}
