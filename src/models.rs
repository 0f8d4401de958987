//! Modelos de dominio (registros de página, contexto recuperado y conversación).

use chrono::Utc;
use serde::Serialize;
use uuid::Uuid;

/// Una página de un PDF subido, lista para ser insertada en el vector store.
/// El número de página es 1-based y se conserva como metadato.
#[derive(Debug, Clone, PartialEq)]
pub struct PageRecord {
    pub text: String,
    pub filename: String,
    pub page: i64,
}

/// Un registro recuperado del vector store, ordenado por similitud
/// descendente. Vive sólo durante la consulta que lo recuperó.
#[derive(Debug, Clone, Serialize)]
pub struct DocumentRecord {
    pub text: String,
    pub filename: String,
    pub page: i64,
    pub score: f64,
}

/// Origen de un mensaje de la conversación.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

/// Rama que produjo una respuesta del asistente.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AnswerKind {
    Rag,
    Direct,
}

/// Un mensaje de la conversación. Inmutable una vez creado.
#[derive(Debug, Clone, Serialize)]
pub struct ChatMessage {
    pub id: String,
    pub role: Role,
    pub kind: Option<AnswerKind>,
    pub content: String,
    pub created_at: String,
}

impl ChatMessage {
    fn new(role: Role, kind: Option<AnswerKind>, content: String) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            role,
            kind,
            content,
            created_at: Utc::now().to_rfc3339(),
        }
    }
}

/// Log ordenado y append-only de la conversación. Lo posee la capa de
/// presentación; las ramas de consulta sólo añaden mensajes al final.
#[derive(Debug, Default)]
pub struct Conversation {
    messages: Vec<ChatMessage>,
}

impl Conversation {
    pub fn push_user(&mut self, content: impl Into<String>) {
        self.messages
            .push(ChatMessage::new(Role::User, None, content.into()));
    }

    pub fn push_assistant(&mut self, kind: AnswerKind, content: impl Into<String>) {
        self.messages
            .push(ChatMessage::new(Role::Assistant, Some(kind), content.into()));
    }

    pub fn messages(&self) -> &[ChatMessage] {
        &self.messages
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn conversation_preserves_append_order() {
        let mut convo = Conversation::default();
        convo.push_user("¿Cuál es la capital de Francia?");
        convo.push_assistant(AnswerKind::Rag, "París, según el documento.");
        convo.push_assistant(AnswerKind::Direct, "París.");

        let messages = convo.messages();
        assert_eq!(messages.len(), 3);
        assert_eq!(messages[0].role, Role::User);
        assert_eq!(messages[1].kind, Some(AnswerKind::Rag));
        assert_eq!(messages[2].kind, Some(AnswerKind::Direct));
    }
}
