//! Acceso al servicio LLM: embeddings vía Rig (OpenAI) y chat en streaming
//! sobre la API de completions. Los chunks generados llegan en orden por un
//! canal mpsc; no hay reintentos.

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use futures::StreamExt;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tracing::warn;

use crate::config::AppConfig;
use crate::errors::AppError;

/// Generación en streaming. El pipeline de consulta depende de este trait
/// para poder ejercitarse con stubs en los tests.
#[async_trait]
pub trait AnswerGenerator: Send + Sync {
    async fn stream_answer(
        &self,
        prompt: &str,
        temperature: f64,
    ) -> Result<mpsc::Receiver<Result<String, AppError>>, AppError>;
}

/// Gestor de LLMs y embeddings.
#[derive(Debug, Clone)]
pub struct LlmManager {
    http: reqwest::Client,
    api_base: String,
    api_key: String,
    chat_model: String,
    embedding_model: String,
}

/// Resultado de parsear una línea del stream SSE de completions.
#[derive(Debug, PartialEq)]
enum SseLine {
    Delta(String),
    Done,
    Ignore,
}

fn parse_sse_line(line: &str) -> SseLine {
    let line = line.trim();
    if line.is_empty() {
        return SseLine::Ignore;
    }
    if line == "data: [DONE]" {
        return SseLine::Done;
    }
    let Some(data) = line.strip_prefix("data: ") else {
        return SseLine::Ignore;
    };
    match serde_json::from_str::<Value>(data) {
        Ok(payload) => match payload["choices"][0]["delta"]["content"].as_str() {
            Some(content) if !content.is_empty() => SseLine::Delta(content.to_string()),
            _ => SseLine::Ignore,
        },
        Err(_) => SseLine::Ignore,
    }
}

impl LlmManager {
    /// Construye el manager a partir de la configuración.
    pub fn from_config(cfg: &AppConfig) -> Result<Self> {
        Ok(Self {
            http: reqwest::Client::new(),
            api_base: cfg.openai_api_base.trim_end_matches('/').to_string(),
            api_key: cfg.openai_api_key.clone(),
            chat_model: cfg.llm_chat_model.clone(),
            embedding_model: cfg.llm_embedding_model.clone(),
        })
    }

    // ---------------------------------------------------------------------
    // EMBEDDINGS
    // ---------------------------------------------------------------------

    /// Calcula embeddings para una lista de textos, en bloque y en orden.
    pub async fn embed_texts(&self, texts: Vec<String>) -> Result<Vec<Vec<f64>>> {
        use rig::client::EmbeddingsClient as _;
        use rig::embeddings::EmbeddingModel as _;
        use rig::providers::openai::{self, TEXT_EMBEDDING_3_SMALL};

        let client = openai::Client::from_env();

        let model_name = if self.embedding_model.is_empty() {
            TEXT_EMBEDDING_3_SMALL
        } else {
            self.embedding_model.as_str()
        };

        let embedding_model = client.embedding_model(model_name);
        let expected = texts.len();
        let embeddings = embedding_model.embed_texts(texts).await?;

        if embeddings.len() != expected {
            return Err(anyhow!(
                "Número de embeddings ({}) distinto al número de textos ({})",
                embeddings.len(),
                expected
            ));
        }

        Ok(embeddings.into_iter().map(|e| e.vec).collect())
    }

    // ---------------------------------------------------------------------
    // CHAT / COMPLETION EN STREAMING
    // ---------------------------------------------------------------------

    /// Lanza una generación en streaming. Cada chunk llega por el canal en
    /// orden de generación; el canal se cierra al terminar el stream. Si el
    /// consumidor abandona el receptor, la tarea suelta la conexión.
    pub async fn stream_answer(
        &self,
        prompt: &str,
        temperature: f64,
    ) -> Result<mpsc::Receiver<Result<String, AppError>>, AppError> {
        let url = format!("{}/v1/chat/completions", self.api_base);
        let body = json!({
            "model": self.chat_model,
            "messages": [{ "role": "user", "content": prompt }],
            "temperature": temperature,
            "stream": true,
        });

        let resp = self
            .http
            .post(&url)
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(AppError::generation)?;

        if !resp.status().is_success() {
            let status = resp.status();
            let text = resp.text().await.unwrap_or_default();
            return Err(AppError::Generation(format!(
                "el servicio LLM respondió {status}: {text}"
            )));
        }

        let (tx, rx) = mpsc::channel(32);
        let mut stream = resp.bytes_stream();

        tokio::spawn(async move {
            // Las líneas SSE pueden llegar partidas entre chunks HTTP.
            let mut pending = String::new();

            while let Some(item) = stream.next().await {
                match item {
                    Ok(bytes) => {
                        pending.push_str(&String::from_utf8_lossy(&bytes));
                        while let Some(pos) = pending.find('\n') {
                            let line = pending[..pos].to_string();
                            pending.drain(..=pos);
                            match parse_sse_line(&line) {
                                SseLine::Delta(content) => {
                                    if tx.send(Ok(content)).await.is_err() {
                                        return;
                                    }
                                }
                                SseLine::Done => return,
                                SseLine::Ignore => {}
                            }
                        }
                    }
                    Err(e) => {
                        warn!("Stream del LLM interrumpido: {e}");
                        let _ = tx.send(Err(AppError::generation(e))).await;
                        return;
                    }
                }
            }
        });

        Ok(rx)
    }
}

#[async_trait]
impl AnswerGenerator for LlmManager {
    async fn stream_answer(
        &self,
        prompt: &str,
        temperature: f64,
    ) -> Result<mpsc::Receiver<Result<String, AppError>>, AppError> {
        LlmManager::stream_answer(self, prompt, temperature).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_content_delta() {
        let line = r#"data: {"choices":[{"delta":{"content":"París"}}]}"#;
        assert_eq!(parse_sse_line(line), SseLine::Delta("París".to_string()));
    }

    #[test]
    fn recognizes_done_marker() {
        assert_eq!(parse_sse_line("data: [DONE]"), SseLine::Done);
    }

    #[test]
    fn ignores_empty_deltas_and_noise() {
        assert_eq!(parse_sse_line(""), SseLine::Ignore);
        assert_eq!(parse_sse_line(": keep-alive"), SseLine::Ignore);
        assert_eq!(
            parse_sse_line(r#"data: {"choices":[{"delta":{}}]}"#),
            SseLine::Ignore
        );
        assert_eq!(
            parse_sse_line(r#"data: {"choices":[{"delta":{"content":""}}]}"#),
            SseLine::Ignore
        );
    }

    #[test]
    fn ignores_malformed_json() {
        assert_eq!(parse_sse_line("data: {no es json"), SseLine::Ignore);
    }
}
