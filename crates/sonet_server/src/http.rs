//! The RPC surface as JSON-over-HTTP plus the websocket stream.

use std::sync::Arc;

use axum::{
    extract::{Query, State},
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;
use tower_http::trace::TraceLayer;

use sonet_hub::ws::{ws_handler, WsContext};
use sonet_proto::api::*;

use crate::service::MessagingService;

#[derive(Clone)]
pub struct AppState {
    pub service: MessagingService,
}

pub fn build_router(service: MessagingService) -> Router {
    let ws_context = WsContext {
        hub: service.core().hub.clone(),
        handler: Arc::new(service.clone()),
    };
    let state = AppState { service };

    Router::new()
        .route("/v1/messages", post(send_message).get(get_messages))
        .route("/v1/chats", post(create_chat).get(get_chats))
        .route("/v1/typing", post(set_typing))
        .route("/v1/capabilities", get(capabilities))
        .with_state(state)
        .nest_service(
            "/ws",
            Router::new()
                .route("/", get(ws_handler))
                .with_state(ws_context),
        )
        .layer(TraceLayer::new_for_http())
}

async fn send_message(
    State(state): State<AppState>,
    Json(req): Json<SendMessageRequest>,
) -> Json<SendMessageResponse> {
    Json(state.service.send_message(req).await)
}

#[derive(Deserialize)]
struct GetMessagesParams {
    chat_id: String,
    requester_id: String,
    cursor: Option<String>,
    limit: Option<usize>,
}

async fn get_messages(
    State(state): State<AppState>,
    Query(params): Query<GetMessagesParams>,
) -> Json<GetMessagesResponse> {
    let req = GetMessagesRequest {
        chat_id: params.chat_id,
        requester_id: params.requester_id,
        cursor: params.cursor,
        limit: params.limit,
    };
    Json(state.service.get_messages(req).await)
}

async fn create_chat(
    State(state): State<AppState>,
    Json(req): Json<CreateChatRequest>,
) -> Json<CreateChatResponse> {
    Json(state.service.create_chat(req).await)
}

#[derive(Deserialize)]
struct GetChatsParams {
    user_id: String,
}

async fn get_chats(
    State(state): State<AppState>,
    Query(params): Query<GetChatsParams>,
) -> Json<GetChatsResponse> {
    Json(state.service.get_chats(GetChatsRequest { user_id: params.user_id }).await)
}

async fn set_typing(
    State(state): State<AppState>,
    Json(req): Json<SetTypingRequest>,
) -> Json<SetTypingResponse> {
    Json(state.service.set_typing(req).await)
}

async fn capabilities(State(state): State<AppState>) -> Json<CapabilitiesResponse> {
    Json(state.service.capabilities())
}
