//! actix-web route handlers: auth, session ownership, and the SSE bridge.
use actix_web::{web, HttpRequest, HttpResponse};
use futures::StreamExt;
use stamp_conv::{mint_session_id, session_owner, SessionOwner};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::warn;

use crate::pipeline::{run_chat, AppState, ChatRequestBody};

/// Single-turn QA: no conversation history is read for the prompt, but the
/// exchange is still persisted under the (possibly minted) session.
pub async fn knowledge_chat(
    req: HttpRequest,
    state: web::Data<AppState>,
    body: web::Json<ChatRequestBody>,
) -> HttpResponse {
    chat(req, state, body, false).await
}

/// Multi-turn QA with recent and relevant history folded into the prompt.
pub async fn knowledge_chat_conversation(
    req: HttpRequest,
    state: web::Data<AppState>,
    body: web::Json<ChatRequestBody>,
) -> HttpResponse {
    chat(req, state, body, true).await
}

async fn chat(
    req: HttpRequest,
    state: web::Data<AppState>,
    body: web::Json<ChatRequestBody>,
    multi_turn: bool,
) -> HttpResponse {
    let token = bearer_token(&req).unwrap_or_default();
    let verdict = match state.auth.validate(&token).await {
        Ok(v) if v.valid => v,
        Ok(_) => return HttpResponse::Unauthorized().body("invalid token"),
        Err(err) => {
            warn!(error = %err, "auth service failure");
            return HttpResponse::Unauthorized().body("token validation unavailable");
        }
    };

    // Ownership is enforced before the stream opens; a refused request never
    // sees a single frame.
    let session_id = match &body.session_id {
        Some(sid) => match session_owner(sid) {
            SessionOwner::User(uid) if uid != verdict.userid => {
                return HttpResponse::Forbidden().body("session does not belong to caller");
            }
            SessionOwner::User(_) => sid.clone(),
            SessionOwner::Legacy => {
                warn!(session = %sid, "legacy session id without owner prefix; allowing");
                sid.clone()
            }
        },
        None => mint_session_id(verdict.userid),
    };

    let (tx, rx) = mpsc::channel(32);
    let state = state.into_inner();
    let request = body.into_inner();
    tokio::spawn(Box::pin(run_chat(state, request, session_id, multi_turn, tx)));

    let body_stream = ReceiverStream::new(rx)
        .map(|frame| Ok::<_, actix_web::Error>(web::Bytes::from(frame.encode())));
    HttpResponse::Ok()
        .content_type("text/event-stream")
        .insert_header(("Cache-Control", "no-cache"))
        .streaming(body_stream)
}

fn bearer_token(req: &HttpRequest) -> Option<String> {
    let header = req.headers().get("Authorization")?.to_str().ok()?;
    header
        .strip_prefix("Bearer ")
        .map(str::trim)
        .map(str::to_string)
}
