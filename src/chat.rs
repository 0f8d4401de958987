//! Pipeline de consulta con respuesta dual.
//!
//! Para cada pregunta se producen dos respuestas en streaming:
//!   1. Rama RAG: recuperar top-K registros → componer prompt con contexto →
//!      generar → streamear → anexar a la conversación.
//!   2. Rama directa: la pregunta sin contexto, con generación determinista.
//!
//! Las ramas corren en secuencia (RAG primero), de modo que el mensaje RAG
//! siempre precede al directo en la conversación. Un fallo en una rama se
//! reporta como evento y no impide la otra.

use std::sync::{Arc, Mutex};

use serde::Serialize;
use tokio::sync::mpsc;
use tracing::{error, info};

use crate::config::AppConfig;
use crate::errors::AppError;
use crate::llm::AnswerGenerator;
use crate::models::{AnswerKind, Conversation, DocumentRecord};
use crate::vector_store::ContextRetriever;

/// Evento incremental que la capa de presentación recibe durante una consulta.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum AnswerEvent {
    Delta { kind: AnswerKind, text: String },
    Completed { kind: AnswerKind, answer: String },
    Failed { kind: AnswerKind, error: String },
}

/// Ajustes de generación por rama.
#[derive(Debug, Clone, Copy)]
pub struct QueryOptions {
    pub rag_temperature: f64,
    pub direct_temperature: f64,
}

impl QueryOptions {
    pub fn from_config(cfg: &AppConfig) -> Self {
        Self {
            rag_temperature: cfg.rag_temperature,
            direct_temperature: cfg.direct_temperature,
        }
    }
}

/// Plantilla fija de la rama RAG. Con contexto vacío la instrucción manda
/// explícitamente responder con conocimiento general: nunca se bloquea la
/// generación por falta de contexto.
fn rag_prompt(context: &str, question: &str) -> String {
    format!(
        "Eres un asistente que responde preguntas sobre un documento subido.\n\
         Usa el siguiente contexto para responder. Si el contexto está vacío o\n\
         no contiene la respuesta, responde con tu conocimiento general e\n\
         indícalo brevemente.\n\n\
         Contexto:\n{context}\n\n\
         Pregunta:\n{question}"
    )
}

/// Plantilla fija de la rama directa: la pregunta literal, sin contexto.
fn direct_prompt(question: &str) -> String {
    format!("Responde a la siguiente pregunta.\n\nPregunta:\n{question}")
}

/// Concatena el texto de los registros recuperados en orden de recuperación.
fn join_context(records: &[DocumentRecord]) -> String {
    records
        .iter()
        .map(|r| r.text.as_str())
        .collect::<Vec<_>>()
        .join("\n\n---\n\n")
}

/// Ejecuta ambas ramas para una pregunta, emitiendo eventos incrementales y
/// anexando las respuestas finales a la conversación.
pub async fn answer_question(
    retriever: &dyn ContextRetriever,
    llm: &dyn AnswerGenerator,
    conversation: &Arc<Mutex<Conversation>>,
    question: &str,
    opts: QueryOptions,
    events: &mpsc::Sender<AnswerEvent>,
) {
    conversation.lock().unwrap().push_user(question);

    match rag_branch(retriever, llm, question, opts.rag_temperature, events).await {
        Ok(answer) => {
            conversation
                .lock()
                .unwrap()
                .push_assistant(AnswerKind::Rag, answer.clone());
            let _ = events
                .send(AnswerEvent::Completed {
                    kind: AnswerKind::Rag,
                    answer,
                })
                .await;
        }
        Err(err) => {
            error!("Rama RAG fallida: {err}");
            let _ = events
                .send(AnswerEvent::Failed {
                    kind: AnswerKind::Rag,
                    error: err.to_string(),
                })
                .await;
        }
    }

    // La rama directa no depende del resultado de la rama RAG.
    match direct_branch(llm, question, opts.direct_temperature, events).await {
        Ok(answer) => {
            conversation
                .lock()
                .unwrap()
                .push_assistant(AnswerKind::Direct, answer.clone());
            let _ = events
                .send(AnswerEvent::Completed {
                    kind: AnswerKind::Direct,
                    answer,
                })
                .await;
        }
        Err(err) => {
            error!("Rama directa fallida: {err}");
            let _ = events
                .send(AnswerEvent::Failed {
                    kind: AnswerKind::Direct,
                    error: err.to_string(),
                })
                .await;
        }
    }
}

/// Idle → Retrieving → Composing → Generating/Streaming → Done.
async fn rag_branch(
    retriever: &dyn ContextRetriever,
    llm: &dyn AnswerGenerator,
    question: &str,
    temperature: f64,
    events: &mpsc::Sender<AnswerEvent>,
) -> Result<String, AppError> {
    let records = retriever.retrieve(question).await?;
    if records.is_empty() {
        info!("Recuperación sin resultados; se genera con contexto vacío.");
    }

    let prompt = rag_prompt(&join_context(&records), question);
    stream_branch(llm, &prompt, temperature, AnswerKind::Rag, events).await
}

async fn direct_branch(
    llm: &dyn AnswerGenerator,
    question: &str,
    temperature: f64,
    events: &mpsc::Sender<AnswerEvent>,
) -> Result<String, AppError> {
    let prompt = direct_prompt(question);
    stream_branch(llm, &prompt, temperature, AnswerKind::Direct, events).await
}

/// Acumula el stream en un buffer y reemite cada chunk en orden de llegada.
async fn stream_branch(
    llm: &dyn AnswerGenerator,
    prompt: &str,
    temperature: f64,
    kind: AnswerKind,
    events: &mpsc::Sender<AnswerEvent>,
) -> Result<String, AppError> {
    let mut rx = llm.stream_answer(prompt, temperature).await?;
    let mut buffer = String::new();

    while let Some(chunk) = rx.recv().await {
        let text = chunk?;
        buffer.push_str(&text);
        let _ = events.send(AnswerEvent::Delta { kind, text }).await;
    }

    Ok(buffer)
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;

    struct StaticRetriever(Vec<DocumentRecord>);

    #[async_trait]
    impl ContextRetriever for StaticRetriever {
        async fn retrieve(&self, _question: &str) -> Result<Vec<DocumentRecord>, AppError> {
            Ok(self.0.clone())
        }
    }

    struct FailingRetriever;

    #[async_trait]
    impl ContextRetriever for FailingRetriever {
        async fn retrieve(&self, _question: &str) -> Result<Vec<DocumentRecord>, AppError> {
            Err(AppError::Retrieval("índice caído".to_string()))
        }
    }

    /// Generador guionizado: registra los prompts y emite chunks fijos.
    struct ScriptedLlm {
        chunks: Vec<&'static str>,
        prompts: Mutex<Vec<String>>,
    }

    impl ScriptedLlm {
        fn new(chunks: Vec<&'static str>) -> Self {
            Self {
                chunks,
                prompts: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl AnswerGenerator for ScriptedLlm {
        async fn stream_answer(
            &self,
            prompt: &str,
            _temperature: f64,
        ) -> Result<mpsc::Receiver<Result<String, AppError>>, AppError> {
            self.prompts.lock().unwrap().push(prompt.to_string());
            let (tx, rx) = mpsc::channel(8);
            let chunks: Vec<String> = self.chunks.iter().map(|c| c.to_string()).collect();
            tokio::spawn(async move {
                for chunk in chunks {
                    if tx.send(Ok(chunk)).await.is_err() {
                        return;
                    }
                }
            });
            Ok(rx)
        }
    }

    fn paris_record() -> DocumentRecord {
        DocumentRecord {
            text: "París es la capital de Francia".to_string(),
            filename: "guia.pdf".to_string(),
            page: 2,
            score: 0.9,
        }
    }

    fn default_opts() -> QueryOptions {
        QueryOptions {
            rag_temperature: 0.3,
            direct_temperature: 0.0,
        }
    }

    async fn run(
        retriever: &dyn ContextRetriever,
        llm: &dyn AnswerGenerator,
        conversation: &Arc<Mutex<Conversation>>,
        question: &str,
    ) -> Vec<AnswerEvent> {
        let (tx, mut rx) = mpsc::channel(64);
        answer_question(retriever, llm, conversation, question, default_opts(), &tx).await;
        drop(tx);

        let mut events = Vec::new();
        while let Some(event) = rx.recv().await {
            events.push(event);
        }
        events
    }

    #[tokio::test]
    async fn chunks_arrive_in_generation_order() {
        let retriever = StaticRetriever(Vec::new());
        let llm = ScriptedLlm::new(vec!["Paris", " is", " the", " capital"]);
        let conversation = Arc::new(Mutex::new(Conversation::default()));

        let events = run(&retriever, &llm, &conversation, "¿Capital de Francia?").await;

        // Secuencia incremental del buffer observada para la rama RAG.
        let mut buffer = String::new();
        let mut observed = Vec::new();
        for event in &events {
            if let AnswerEvent::Delta { kind: AnswerKind::Rag, text } = event {
                buffer.push_str(text);
                observed.push(buffer.clone());
            }
        }
        assert_eq!(
            observed,
            vec!["Paris", "Paris is", "Paris is the", "Paris is the capital"]
        );

        let completed = events.iter().find_map(|e| match e {
            AnswerEvent::Completed { kind: AnswerKind::Rag, answer } => Some(answer.clone()),
            _ => None,
        });
        assert_eq!(completed.as_deref(), Some("Paris is the capital"));
    }

    #[tokio::test]
    async fn empty_context_still_reaches_generation() {
        let retriever = StaticRetriever(Vec::new());
        let llm = ScriptedLlm::new(vec!["respuesta genérica"]);
        let conversation = Arc::new(Mutex::new(Conversation::default()));

        let events = run(&retriever, &llm, &conversation, "¿Capital de Francia?").await;

        // La rama RAG completó a pesar del contexto vacío.
        assert!(events.iter().any(|e| matches!(
            e,
            AnswerEvent::Completed { kind: AnswerKind::Rag, .. }
        )));

        // Y el prompt compuesto no estaba vacío: lleva la pregunta literal.
        let prompts = llm.prompts.lock().unwrap();
        assert!(!prompts[0].is_empty());
        assert!(prompts[0].contains("¿Capital de Francia?"));
    }

    #[tokio::test]
    async fn rag_prompt_carries_retrieved_context() {
        let retriever = StaticRetriever(vec![paris_record()]);
        let llm = ScriptedLlm::new(vec!["París"]);
        let conversation = Arc::new(Mutex::new(Conversation::default()));

        run(&retriever, &llm, &conversation, "¿Capital de Francia?").await;

        let prompts = llm.prompts.lock().unwrap();
        assert_eq!(prompts.len(), 2);
        assert!(prompts[0].contains("París es la capital de Francia"));
        // La rama directa no lleva contexto recuperado.
        assert!(!prompts[1].contains("París es la capital de Francia"));
    }

    #[tokio::test]
    async fn rag_failure_does_not_block_the_direct_branch() {
        let retriever = FailingRetriever;
        let llm = ScriptedLlm::new(vec!["París."]);
        let conversation = Arc::new(Mutex::new(Conversation::default()));

        let events = run(&retriever, &llm, &conversation, "¿Capital de Francia?").await;

        assert!(events.iter().any(|e| matches!(
            e,
            AnswerEvent::Failed { kind: AnswerKind::Rag, .. }
        )));
        assert!(events.iter().any(|e| matches!(
            e,
            AnswerEvent::Completed { kind: AnswerKind::Direct, .. }
        )));

        // La conversación recoge el mensaje del usuario y sólo la respuesta directa.
        let convo = conversation.lock().unwrap();
        assert_eq!(convo.messages().len(), 2);
        assert_eq!(convo.messages()[1].kind, Some(AnswerKind::Direct));
    }

    #[tokio::test]
    async fn rag_message_precedes_direct_message() {
        let retriever = StaticRetriever(vec![paris_record()]);
        let llm = ScriptedLlm::new(vec!["París"]);
        let conversation = Arc::new(Mutex::new(Conversation::default()));

        run(&retriever, &llm, &conversation, "¿Capital de Francia?").await;

        let convo = conversation.lock().unwrap();
        assert_eq!(convo.messages().len(), 3);
        assert_eq!(convo.messages()[1].kind, Some(AnswerKind::Rag));
        assert_eq!(convo.messages()[2].kind, Some(AnswerKind::Direct));
    }

    #[test]
    fn prompt_templates_embed_the_question() {
        let rag = rag_prompt("contexto aquí", "¿Qué es RAG?");
        assert!(rag.contains("contexto aquí"));
        assert!(rag.contains("¿Qué es RAG?"));

        let direct = direct_prompt("¿Qué es RAG?");
        assert!(direct.contains("¿Qué es RAG?"));
        assert!(!direct.contains("Contexto"));
    }
}
