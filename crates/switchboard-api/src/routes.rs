use axum::{
    Router,
    extract::{State, WebSocketUpgrade},
    middleware,
    response::IntoResponse,
    routing::{delete, get, post},
};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use switchboard_gateway::connection;

use crate::auth::AppState;
use crate::middleware::require_auth;
use crate::{conversations, feed, messages, users};

/// Full HTTP surface: health and gateway are public, everything else
/// requires a bearer token.
pub fn router(state: AppState) -> Router {
    let public_routes = Router::new()
        .route("/health", get(health))
        .route("/gateway", get(ws_upgrade))
        .with_state(state.clone());

    let protected_routes = Router::new()
        .route("/conversations", get(conversations::list_conversations))
        .route("/conversations/resolve", post(conversations::resolve_conversation))
        .route("/conversations/{conversation_id}", get(conversations::get_conversation))
        .route("/conversations/{conversation_id}/read", post(conversations::mark_read))
        .route("/conversations/{conversation_id}/touch", post(conversations::touch_conversation))
        .route(
            "/conversations/{conversation_id}/clear",
            get(conversations::get_clear_marker).post(conversations::clear_history),
        )
        .route(
            "/conversations/{conversation_id}/messages",
            get(messages::get_messages).post(messages::send_message),
        )
        .route(
            "/conversations/{conversation_id}/messages/{message_id}",
            delete(messages::delete_message),
        )
        .route("/users", get(users::list_users))
        .route("/users/{user_id}", get(users::get_user))
        .route("/feed/postings", get(feed::recent_postings))
        .route("/feed/resources", get(feed::recent_resources))
        .route("/feed/messages", get(feed::recent_inbox))
        .route("/postings", post(feed::create_posting))
        .route("/resources", post(feed::create_resource))
        .layer(middleware::from_fn_with_state(state.clone(), require_auth))
        .with_state(state);

    Router::new()
        .merge(public_routes)
        .merge(protected_routes)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
}

async fn health() -> &'static str {
    "ok"
}

async fn ws_upgrade(State(state): State<AppState>, ws: WebSocketUpgrade) -> impl IntoResponse {
    ws.on_upgrade(move |socket| {
        connection::handle_connection(
            socket,
            state.dispatcher.clone(),
            state.db.clone(),
            state.jwt_secret.clone(),
        )
    })
}
