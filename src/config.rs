//! Carga y gestión de configuración de la aplicación (Couchbase + LLM).
//!
//! Toda variable obligatoria ausente es una condición fatal de arranque: se
//! informa del nombre concreto y el proceso no llega a intentar ninguna
//! conexión.

use std::env;

use crate::errors::AppError;

/// Configuración completa de la aplicación.
#[derive(Clone, Debug)]
pub struct AppConfig {
    pub db_conn_str: String,
    pub db_username: String,
    pub db_password: String,
    pub db_bucket: String,
    pub db_scope: String,
    pub db_collection: String,
    pub index_name: String,
    pub openai_api_key: String,

    pub server_addr: String,
    pub llm_chat_model: String,
    pub llm_embedding_model: String,
    pub openai_api_base: String,
    pub rag_temperature: f64,
    pub direct_temperature: f64,
    pub top_k: usize,
}

/// Lee una variable obligatoria, fallando con su nombre si no existe.
fn required(name: &str) -> Result<String, AppError> {
    env::var(name).map_err(|_| AppError::Configuration(format!("Falta {name} en el entorno")))
}

impl AppConfig {
    /// Carga la configuración desde variables de entorno (usando .env si existe).
    pub fn from_env() -> Result<Self, AppError> {
        let db_conn_str = required("DB_CONN_STR")?;
        let db_username = required("DB_USERNAME")?;
        let db_password = required("DB_PASSWORD")?;
        let db_bucket = required("DB_BUCKET")?;
        let db_scope = required("DB_SCOPE")?;
        let db_collection = required("DB_COLLECTION")?;
        let index_name = required("INDEX_NAME")?;
        let openai_api_key = required("OPENAI_API_KEY")?;

        let server_addr =
            env::var("SERVER_ADDR").unwrap_or_else(|_| "127.0.0.1:3322".to_string());
        let llm_chat_model =
            env::var("LLM_CHAT_MODEL").unwrap_or_else(|_| "gpt-4o-mini".to_string());
        let llm_embedding_model = env::var("LLM_EMBEDDING_MODEL")
            .unwrap_or_else(|_| "text-embedding-3-small".to_string());
        let openai_api_base = env::var("OPENAI_API_BASE")
            .unwrap_or_else(|_| "https://api.openai.com".to_string());

        let rag_temperature = parse_knob("RAG_TEMPERATURE", 0.3)?;
        let direct_temperature = parse_knob("DIRECT_TEMPERATURE", 0.0)?;

        let top_k = match env::var("TOP_K") {
            Ok(raw) => raw.parse::<usize>().map_err(|_| {
                AppError::Configuration(format!("TOP_K no es un entero válido: '{raw}'"))
            })?,
            Err(_) => 4,
        };

        Ok(Self {
            db_conn_str,
            db_username,
            db_password,
            db_bucket,
            db_scope,
            db_collection,
            index_name,
            openai_api_key,
            server_addr,
            llm_chat_model,
            llm_embedding_model,
            openai_api_base,
            rag_temperature,
            direct_temperature,
            top_k,
        })
    }
}

/// Temperaturas y demás ajustes numéricos opcionales.
fn parse_knob(name: &str, default: f64) -> Result<f64, AppError> {
    match env::var(name) {
        Ok(raw) => raw.parse::<f64>().map_err(|_| {
            AppError::Configuration(format!("{name} no es un número válido: '{raw}'"))
        }),
        Err(_) => Ok(default),
    }
}
