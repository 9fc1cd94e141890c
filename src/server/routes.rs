use std::convert::Infallible;
use std::sync::Arc;

use axum::Json;
use axum::body::Bytes;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::sse::{Event, KeepAlive, Sse};
use futures::{Stream, StreamExt, stream};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tracing::{debug, warn};

use super::ApiError;
use crate::answer::AnswerEvent;
use crate::context::{AppContext, QueryRequest};
use crate::db::models::{ChatSession, Client, Message, SessionSummary};
use crate::error::{RagError, Result};
use crate::index::{DocumentRecord, StoredChunk};
use crate::indexer::IngestReport;
use crate::registry::ClientSummary;
use crate::sessions::ExchangeRecorder;

type Ctx = State<Arc<AppContext>>;
type ApiResult<T> = std::result::Result<T, ApiError>;

/// Run synchronous catalog/index work off the async workers.
async fn blocking<T, F>(ctx: Arc<AppContext>, f: F) -> ApiResult<T>
where
    T: Send + 'static,
    F: FnOnce(&AppContext) -> Result<T> + Send + 'static,
{
    let out = tokio::task::spawn_blocking(move || f(&ctx))
        .await
        .map_err(RagError::from)??;
    Ok(out)
}

// ── Health ───────────────────────────────────────────────────────────

pub async fn health(State(ctx): Ctx) -> Json<Value> {
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "embedding_provider": ctx.config.embedding.provider,
        "llm_provider": ctx.config.llm.provider,
        "llm_model": ctx.config.llm.model,
    }))
}

// ── Clients ──────────────────────────────────────────────────────────

#[derive(Deserialize)]
pub struct CreateClient {
    name: String,
}

pub async fn list_clients(State(ctx): Ctx) -> ApiResult<Json<Vec<Client>>> {
    blocking(ctx, |ctx| ctx.registry.list()).await.map(Json)
}

pub async fn create_client(
    State(ctx): Ctx,
    Json(body): Json<CreateClient>,
) -> ApiResult<(StatusCode, Json<Client>)> {
    let client = blocking(ctx, move |ctx| ctx.registry.create(&body.name)).await?;
    Ok((StatusCode::CREATED, Json(client)))
}

pub async fn get_client(State(ctx): Ctx, Path(id): Path<String>) -> ApiResult<Json<ClientSummary>> {
    blocking(ctx, move |ctx| ctx.registry.summary(&id)).await.map(Json)
}

// ── Documents ────────────────────────────────────────────────────────

pub async fn list_documents(
    State(ctx): Ctx,
    Path(id): Path<String>,
) -> ApiResult<Json<Vec<DocumentRecord>>> {
    blocking(ctx, move |ctx| ctx.registry.list_documents(&id))
        .await
        .map(Json)
}

pub async fn upload_document(
    State(ctx): Ctx,
    Path((id, filename)): Path<(String, String)>,
    body: Bytes,
) -> ApiResult<Json<DocumentRecord>> {
    blocking(ctx, move |ctx| ctx.registry.upload_document(&id, &filename, &body))
        .await
        .map(Json)
}

pub async fn delete_document(
    State(ctx): Ctx,
    Path((id, filename)): Path<(String, String)>,
) -> ApiResult<StatusCode> {
    blocking(ctx, move |ctx| ctx.registry.delete_document(&id, &filename)).await?;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Deserialize)]
pub struct ChunkFilter {
    #[serde(default)]
    document: Option<String>,
}

/// Stored chunks of a client, for inspecting how notes were split.
pub async fn list_chunks(
    State(ctx): Ctx,
    Path(id): Path<String>,
    Query(filter): Query<ChunkFilter>,
) -> ApiResult<Json<Vec<StoredChunk>>> {
    blocking(ctx, move |ctx| {
        ctx.registry.index(&id)?.list_chunks(filter.document.as_deref())
    })
    .await
    .map(Json)
}

// ── Ingestion ────────────────────────────────────────────────────────

#[derive(Deserialize)]
pub struct IngestBody {
    client_id: String,
    #[serde(default)]
    force: bool,
}

pub async fn ingest(State(ctx): Ctx, Json(body): Json<IngestBody>) -> ApiResult<Json<IngestReport>> {
    let report = ctx.ingest(&body.client_id, body.force).await?;
    Ok(Json(report))
}

// ── Query ────────────────────────────────────────────────────────────

fn sse_event(event: &AnswerEvent) -> Event {
    Event::default().data(serde_json::to_string(event).unwrap_or_default())
}

/// Stream an answer as server-sent events.
///
/// Every event carries one JSON [`AnswerEvent`]; a terminal event is
/// followed by the `[DONE]` sentinel. With a `session_id` the exchange is
/// appended to that session once the answer finishes.
pub async fn query(
    State(ctx): Ctx,
    Json(mut request): Json<QueryRequest>,
) -> ApiResult<Sse<impl Stream<Item = std::result::Result<Event, Infallible>>>> {
    if let Some(session_id) = &request.session_id {
        if request.history.is_empty() {
            let (client_id, session_id) = (request.client_id.clone(), session_id.clone());
            match blocking(ctx.clone(), move |ctx| ctx.sessions.load(&client_id, &session_id)).await {
                Ok(session) => request.history = session.messages,
                Err(ApiError(RagError::NotFound(_))) => {}
                Err(e) => return Err(e),
            }
        }
    }

    let answer = ctx.ask(&request).await?;

    let recorder = request.session_id.as_deref().map(|session_id| {
        ExchangeRecorder::new(
            ctx.sessions.clone(),
            &request.client_id,
            session_id,
            std::mem::take(&mut request.history),
            &request.query,
        )
    });
    debug!("Streaming answer for '{}'", request.client_id);

    // The terminal event is held back until the exchange is stored, so a
    // client that sees `[DONE]` can read the updated session.
    let events = stream::unfold((answer, recorder), |(mut answer, mut recorder)| async move {
        let event = answer.next().await?;
        if let Some(pending) = recorder.as_mut().and_then(|r| r.observe(&event)) {
            if let Err(e) = pending.await {
                warn!("Session recording task failed: {e}");
            }
        }
        let mut out = vec![Ok(sse_event(&event))];
        if event.is_terminal() {
            out.push(Ok(Event::default().data("[DONE]")));
        }
        Some((stream::iter(out), (answer, recorder)))
    })
    .flatten();

    Ok(Sse::new(events).keep_alive(KeepAlive::default()))
}

// ── Sessions ─────────────────────────────────────────────────────────

#[derive(Deserialize)]
pub struct SaveSession {
    #[serde(default)]
    title: Option<String>,
    #[serde(default)]
    messages: Vec<Message>,
}

#[derive(Serialize)]
pub struct SessionCreated {
    session_id: String,
}

pub async fn list_sessions(
    State(ctx): Ctx,
    Path(id): Path<String>,
) -> ApiResult<Json<Vec<SessionSummary>>> {
    blocking(ctx, move |ctx| ctx.sessions.list(&id)).await.map(Json)
}

pub async fn create_session(
    State(ctx): Ctx,
    Path(id): Path<String>,
    Json(body): Json<SaveSession>,
) -> ApiResult<(StatusCode, Json<SessionCreated>)> {
    let session_id = blocking(ctx, move |ctx| {
        ctx.sessions
            .save(&id, None, body.title.as_deref(), &body.messages)
    })
    .await?;
    Ok((StatusCode::CREATED, Json(SessionCreated { session_id })))
}

pub async fn get_session(
    State(ctx): Ctx,
    Path((id, session_id)): Path<(String, String)>,
) -> ApiResult<Json<ChatSession>> {
    blocking(ctx, move |ctx| ctx.sessions.load(&id, &session_id))
        .await
        .map(Json)
}

pub async fn update_session(
    State(ctx): Ctx,
    Path((id, session_id)): Path<(String, String)>,
    Json(body): Json<SaveSession>,
) -> ApiResult<Json<SessionCreated>> {
    let session_id = blocking(ctx, move |ctx| {
        ctx.sessions.save(
            &id,
            Some(&session_id),
            body.title.as_deref(),
            &body.messages,
        )
    })
    .await?;
    Ok(Json(SessionCreated { session_id }))
}

pub async fn delete_session(
    State(ctx): Ctx,
    Path((id, session_id)): Path<(String, String)>,
) -> ApiResult<StatusCode> {
    blocking(ctx, move |ctx| ctx.sessions.delete(&id, &session_id)).await?;
    Ok(StatusCode::NO_CONTENT)
}
