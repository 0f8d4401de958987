use std::convert::Infallible;

use axum::{
    extract::{DefaultBodyLimit, Json, Multipart, State},
    http::StatusCode,
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse,
    },
    routing::{get, post},
    Router,
};
use futures::Stream;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::sync::mpsc;
use tracing::{error, info};

use crate::{
    app_state::AppState,
    chat::{self, AnswerEvent, QueryOptions},
    errors::AppError,
    ingest,
    models::ChatMessage,
};

/// Límite de subida: PDFs de demo, no archivos arbitrariamente grandes.
const MAX_UPLOAD_BYTES: usize = 50 * 1024 * 1024;

// --- Payloads y Respuestas de la API ---

#[derive(Deserialize)]
pub struct AskPayload {
    question: String,
}

#[derive(Serialize)]
pub struct UploadResponse {
    ingested: usize,
    filename: String,
}

// --- Router ---

pub fn create_router(app_state: AppState) -> Router {
    Router::new()
        .route("/api/upload", post(upload_handler))
        .route("/api/ask", post(ask_handler))
        .route("/api/conversation", get(conversation_handler))
        .route("/api/health", get(health_handler))
        .route("/api/shutdown", post(shutdown_handler))
        .layer(DefaultBodyLimit::max(MAX_UPLOAD_BYTES))
        .with_state(app_state)
}

// --- Handlers ---

/// Recibe un PDF como multipart, lo ingiere y devuelve el número de páginas
/// escritas en el índice. Un fallo de parseo responde 422 sin tumbar la sesión.
#[axum::debug_handler]
async fn upload_handler(
    State(state): State<AppState>,
    mut multipart: Multipart,
) -> Result<Json<UploadResponse>, AppError> {
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| AppError::Parse(format!("subida multipart inválida: {e}")))?
    {
        let Some(filename) = field.file_name().map(str::to_string) else {
            continue;
        };

        let bytes = field
            .bytes()
            .await
            .map_err(|e| AppError::Parse(format!("no se pudo leer la subida: {e}")))?;

        let ingested = ingest::ingest_pdf(state.index.as_ref(), &filename, &bytes).await?;
        info!("Subida '{}' ingerida: {} páginas.", filename, ingested);
        return Ok(Json(UploadResponse { ingested, filename }));
    }

    Err(AppError::Parse(
        "la subida no contiene ningún fichero".to_string(),
    ))
}

/// Lanza las dos ramas de respuesta para una pregunta y las streamea como
/// eventos SSE etiquetados por rama (deltas, completed y failed).
#[axum::debug_handler]
async fn ask_handler(
    State(state): State<AppState>,
    Json(payload): Json<AskPayload>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let (tx, rx) = mpsc::channel::<AnswerEvent>(64);
    let opts = QueryOptions::from_config(&state.config);
    let question = payload.question;

    tokio::spawn(async move {
        chat::answer_question(
            state.index.as_ref(),
            &state.llm,
            &state.conversation,
            &question,
            opts,
            &tx,
        )
        .await;
    });

    let stream = futures::stream::unfold(rx, |mut rx| async move {
        let event = rx.recv().await?;
        let sse_event = Event::default()
            .json_data(&event)
            .unwrap_or_else(|_| Event::default().data("{}"));
        Some((Ok::<_, Infallible>(sse_event), rx))
    });

    Sse::new(stream).keep_alive(KeepAlive::default())
}

#[axum::debug_handler]
async fn conversation_handler(State(state): State<AppState>) -> Json<Vec<ChatMessage>> {
    Json(state.conversation.lock().unwrap().messages().to_vec())
}

/// Health check del data store: un ping al clúster con la sesión ya
/// establecida.
#[axum::debug_handler]
async fn health_handler(
    State(state): State<AppState>,
) -> Result<Json<serde_json::Value>, AppError> {
    state.store.ping().await.map_err(|e| {
        error!("Health check de Couchbase fallido: {e}");
        e
    })?;

    Ok(Json(json!({
        "status": "ok",
        "bucket": state.config.db_bucket,
        "index": state.config.index_name,
    })))
}

// --- Handler de Apagado ---

#[axum::debug_handler]
async fn shutdown_handler(State(state): State<AppState>) -> impl IntoResponse {
    info!("Petición de apagado recibida.");
    if let Some(sender) = state.shutdown_sender.lock().unwrap().take() {
        let _ = sender.send(());
    }
    StatusCode::OK
}
