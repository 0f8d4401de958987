//! Accessor del índice vectorial sobre Couchbase.
//!
//! API pública:
//!   - `VectorIndex::ensure_search_index()`
//!   - `add(records)` (sink de ingesta)
//!   - `retrieve(question)` (top-K por similitud descendente)
//!
//! La función de embedding se suministra al construir el accessor y se
//! invoca implícitamente en `add` y `retrieve`.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::{json, Value};
use tracing::info;
use uuid::Uuid;

use crate::couchbase_client::CouchbaseClient;
use crate::errors::AppError;
use crate::llm::LlmManager;
use crate::models::{DocumentRecord, PageRecord};

/// Destino de escritura de la ingesta. Separado en un trait para poder
/// ejercitar el pipeline sin red.
#[async_trait]
pub trait DocumentSink: Send + Sync {
    async fn add(&self, records: &[PageRecord]) -> Result<(), AppError>;
}

/// Fuente de contexto de la rama RAG.
#[async_trait]
pub trait ContextRetriever: Send + Sync {
    async fn retrieve(&self, question: &str) -> Result<Vec<DocumentRecord>, AppError>;
}

/// Envuelve el handle del clúster más el índice nombrado en un objeto con
/// búsqueda por similitud e inserción de documentos.
pub struct VectorIndex {
    client: Arc<CouchbaseClient>,
    llm: LlmManager,
    index_name: String,
    top_k: usize,
}

impl VectorIndex {
    pub fn new(
        client: Arc<CouchbaseClient>,
        llm: LlmManager,
        index_name: impl Into<String>,
        top_k: usize,
    ) -> Self {
        Self {
            client,
            llm,
            index_name: index_name.into(),
            top_k,
        }
    }

    /// Verifica que el índice de búsqueda exista. Su definición (métrica,
    /// dimensiones, TTL) es propiedad del store externo; aquí sólo se
    /// comprueba la presencia y se falla rápido si no está.
    pub async fn ensure_search_index(&self) -> Result<(), AppError> {
        if self.client.search_index_exists(&self.index_name).await? {
            info!("Índice de búsqueda '{}' verificado.", self.index_name);
            return Ok(());
        }
        Err(AppError::Connection(format!(
            "el índice de búsqueda '{}' no existe en el bucket configurado",
            self.index_name
        )))
    }
}

#[async_trait]
impl DocumentSink for VectorIndex {
    /// Calcula el embedding de cada registro y escribe el lote completo.
    /// Desde la perspectiva del llamante la operación es atómica-o-falla.
    async fn add(&self, records: &[PageRecord]) -> Result<(), AppError> {
        if records.is_empty() {
            return Ok(());
        }

        let texts: Vec<String> = records.iter().map(|r| r.text.clone()).collect();
        let vectors = self
            .llm
            .embed_texts(texts)
            .await
            .map_err(|e| AppError::Store(e.to_string()))?;

        let now = Utc::now().to_rfc3339();
        let docs: Vec<(String, Value)> = records
            .iter()
            .zip(vectors)
            .map(|(record, vector)| {
                (
                    Uuid::new_v4().to_string(),
                    json!({
                        "text": record.text,
                        "filename": record.filename,
                        "page": record.page,
                        "embedding": vector,
                        "ingested_at": now,
                    }),
                )
            })
            .collect();

        self.client.insert_documents(&docs).await
    }
}

#[async_trait]
impl ContextRetriever for VectorIndex {
    /// Embedding de la pregunta + búsqueda KNN de los top-K registros.
    async fn retrieve(&self, question: &str) -> Result<Vec<DocumentRecord>, AppError> {
        let vectors = self
            .llm
            .embed_texts(vec![question.to_string()])
            .await
            .map_err(AppError::retrieval)?;
        let query_vec = vectors.into_iter().next().ok_or_else(|| {
            AppError::Retrieval("no se pudo generar el embedding de la pregunta".to_string())
        })?;

        let payload = self
            .client
            .knn_search(&self.index_name, &query_vec, self.top_k)
            .await?;

        Ok(parse_search_hits(&payload))
    }
}

/// Convierte la respuesta del servicio de search en registros ordenados por
/// score descendente. Hits sin campo de texto se descartan.
fn parse_search_hits(payload: &Value) -> Vec<DocumentRecord> {
    let Some(hits) = payload["hits"].as_array() else {
        return Vec::new();
    };

    let mut records: Vec<DocumentRecord> = hits
        .iter()
        .filter_map(|hit| {
            let fields = &hit["fields"];
            let text = fields["text"].as_str()?;
            Some(DocumentRecord {
                text: text.to_string(),
                filename: fields["filename"].as_str().unwrap_or_default().to_string(),
                page: fields["page"].as_i64().unwrap_or(0),
                score: hit["score"].as_f64().unwrap_or(0.0),
            })
        })
        .collect();

    records.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
    records
}
