//! Taxonomía de errores de la aplicación.
//!
//! Los errores de configuración y conexión son fatales al arranque; los de
//! parseo, recuperación y generación se devuelven al usuario sin tumbar la
//! sesión.

use axum::{http::StatusCode, response::IntoResponse, Json};
use serde_json::json;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("configuración inválida: {0}")]
    Configuration(String),
    #[error("no se pudo conectar al data store: {0}")]
    Connection(String),
    #[error("documento no parseable: {0}")]
    Parse(String),
    #[error("error del data store: {0}")]
    Store(String),
    #[error("fallo recuperando contexto: {0}")]
    Retrieval(String),
    #[error("fallo generando la respuesta: {0}")]
    Generation(String),
    #[error("error de E/S: {0}")]
    Io(#[from] std::io::Error),
}

impl AppError {
    pub fn connection<E: std::fmt::Display>(err: E) -> Self {
        AppError::Connection(err.to_string())
    }

    pub fn retrieval<E: std::fmt::Display>(err: E) -> Self {
        AppError::Retrieval(err.to_string())
    }

    pub fn generation<E: std::fmt::Display>(err: E) -> Self {
        AppError::Generation(err.to_string())
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> axum::response::Response {
        let status = match &self {
            AppError::Configuration(_) => StatusCode::INTERNAL_SERVER_ERROR,
            AppError::Connection(_) => StatusCode::BAD_GATEWAY,
            AppError::Parse(_) => StatusCode::UNPROCESSABLE_ENTITY,
            AppError::Store(_) | AppError::Retrieval(_) | AppError::Generation(_) => {
                StatusCode::BAD_GATEWAY
            }
            AppError::Io(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };

        let body = Json(json!({ "error": self.to_string() }));
        (status, body).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_error_maps_to_unprocessable_entity() {
        let response = AppError::Parse("pdf corrupto".to_string()).into_response();
        assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);
    }

    #[test]
    fn store_errors_map_to_bad_gateway() {
        for err in [
            AppError::Connection("timeout".into()),
            AppError::Retrieval("índice caído".into()),
            AppError::Generation("api caída".into()),
        ] {
            assert_eq!(err.into_response().status(), StatusCode::BAD_GATEWAY);
        }
    }
}
