//! Conexión a Couchbase a través de sus superficies REST.
//!
//! El clúster expone tres servicios que usamos aquí: administración (:8091)
//! para el ping de arranque, query (:8093) para insertar documentos vía N1QL
//! y search (:8094) para las búsquedas KNN sobre el índice vectorial.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::{json, Value};
use tracing::info;
use url::Url;

use crate::config::AppConfig;
use crate::errors::AppError;

/// Tiempo máximo de espera a que el clúster esté listo.
const READY_TIMEOUT: Duration = Duration::from_secs(5);

/// Puertos por defecto de los servicios del clúster.
const MGMT_PORT: u16 = 8091;
const QUERY_PORT: u16 = 8093;
const SEARCH_PORT: u16 = 8094;

/// Handle compartible a un clúster Couchbase. Seguro de reutilizar en todo
/// el proceso; la concurrencia sobre la colección la gestiona el propio store.
#[derive(Debug)]
pub struct CouchbaseClient {
    http: reqwest::Client,
    mgmt_url: String,
    query_url: String,
    search_url: String,
    username: String,
    password: String,
    bucket: String,
    scope: String,
    collection: String,
}

/// Endpoints HTTP derivados de la cadena de conexión (couchbase://host[:puerto]).
fn service_urls(conn_str: &str) -> Result<(String, String, String), AppError> {
    let url = Url::parse(conn_str)
        .map_err(|e| AppError::Connection(format!("cadena de conexión inválida: {e}")))?;
    let host = url.host_str().unwrap_or("localhost");
    let mgmt_port = url.port().unwrap_or(MGMT_PORT);

    Ok((
        format!("http://{host}:{mgmt_port}"),
        format!("http://{host}:{QUERY_PORT}/query/service"),
        format!("http://{host}:{SEARCH_PORT}"),
    ))
}

impl CouchbaseClient {
    fn from_config(cfg: &AppConfig) -> Result<Self, AppError> {
        let (mgmt_url, query_url, search_url) = service_urls(&cfg.db_conn_str)?;
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(AppError::connection)?;

        Ok(Self {
            http,
            mgmt_url,
            query_url,
            search_url,
            username: cfg.db_username.clone(),
            password: cfg.db_password.clone(),
            bucket: cfg.db_bucket.clone(),
            scope: cfg.db_scope.clone(),
            collection: cfg.db_collection.clone(),
        })
    }

    /// Establece la sesión contra el clúster y espera a que esté listo.
    /// Un único intento: si el ping no responde dentro del plazo, el error
    /// es terminal para esta llamada.
    pub async fn connect(cfg: &AppConfig) -> Result<Self, AppError> {
        let client = Self::from_config(cfg)?;
        info!("Conectando a Couchbase en {}...", client.mgmt_url);
        client.ping().await?;
        info!("Conexión a Couchbase OK");
        Ok(client)
    }

    /// Ping al servicio de administración del clúster.
    pub async fn ping(&self) -> Result<(), AppError> {
        let url = format!("{}/pools/default", self.mgmt_url);
        let resp = self
            .http
            .get(&url)
            .basic_auth(&self.username, Some(&self.password))
            .timeout(READY_TIMEOUT)
            .send()
            .await
            .map_err(AppError::connection)?;

        if !resp.status().is_success() {
            return Err(AppError::Connection(format!(
                "el clúster respondió {} al ping",
                resp.status()
            )));
        }
        Ok(())
    }

    /// Comprueba que el índice de búsqueda exista en el bucket/scope
    /// configurados. La definición del índice es propiedad del store.
    pub async fn search_index_exists(&self, index_name: &str) -> Result<bool, AppError> {
        let url = format!(
            "{}/api/bucket/{}/scope/{}/index/{}",
            self.search_url, self.bucket, self.scope, index_name
        );
        let resp = self
            .http
            .get(&url)
            .basic_auth(&self.username, Some(&self.password))
            .send()
            .await
            .map_err(AppError::connection)?;

        Ok(resp.status().is_success())
    }

    /// Inserta un lote de documentos vía el servicio de query (N1QL).
    /// Se aborta en el primer fallo; el mensaje del store se propaga sin
    /// transformar.
    pub async fn insert_documents(&self, docs: &[(String, Value)]) -> Result<(), AppError> {
        let statement = format!(
            "INSERT INTO `{}`.`{}`.`{}` (KEY, VALUE) VALUES ($key, $doc)",
            self.bucket, self.scope, self.collection
        );

        for (key, doc) in docs {
            let body = json!({
                "statement": statement,
                "$key": key,
                "$doc": doc,
            });

            let resp = self
                .http
                .post(&self.query_url)
                .basic_auth(&self.username, Some(&self.password))
                .json(&body)
                .send()
                .await
                .map_err(|e| AppError::Store(e.to_string()))?;

            let status = resp.status();
            let payload: Value = resp
                .json()
                .await
                .map_err(|e| AppError::Store(e.to_string()))?;

            if !status.is_success() || payload["status"] != "success" {
                return Err(AppError::Store(format!(
                    "insert rechazado ({status}): {}",
                    payload["errors"]
                )));
            }
        }
        Ok(())
    }

    /// Búsqueda KNN sobre el índice vectorial vía el servicio de search.
    /// Devuelve el cuerpo JSON crudo; el accessor lo convierte en registros.
    pub async fn knn_search(
        &self,
        index_name: &str,
        vector: &[f64],
        k: usize,
    ) -> Result<Value, AppError> {
        let url = format!(
            "{}/api/bucket/{}/scope/{}/index/{}/query",
            self.search_url, self.bucket, self.scope, index_name
        );
        let body = json!({
            "size": k,
            "query": { "match_none": {} },
            "knn": [{ "field": "embedding", "vector": vector, "k": k }],
            "fields": ["text", "filename", "page"],
        });

        let resp = self
            .http
            .post(&url)
            .basic_auth(&self.username, Some(&self.password))
            .json(&body)
            .send()
            .await
            .map_err(AppError::retrieval)?;

        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            return Err(AppError::Retrieval(format!(
                "búsqueda rechazada ({status}): {text}"
            )));
        }

        resp.json().await.map_err(AppError::retrieval)
    }
}

/// Memoiza los handles por parámetros de conexión: llamadas repetidas con la
/// misma tripleta devuelven el mismo handle sin abrir una segunda sesión.
/// Se construye en `main` y se enhebra explícitamente; no hay estado global.
#[derive(Debug, Default)]
pub struct ConnectionCache {
    inner: Mutex<HashMap<(String, String, String), Arc<CouchbaseClient>>>,
}

impl ConnectionCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn get_or_connect(&self, cfg: &AppConfig) -> Result<Arc<CouchbaseClient>, AppError> {
        let key = (
            cfg.db_conn_str.clone(),
            cfg.db_username.clone(),
            cfg.db_password.clone(),
        );

        if let Some(client) = self.inner.lock().unwrap().get(&key) {
            return Ok(Arc::clone(client));
        }

        let client = Arc::new(CouchbaseClient::connect(cfg).await?);
        self.inner
            .lock()
            .unwrap()
            .insert(key, Arc::clone(&client));
        Ok(client)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config(conn_str: &str) -> AppConfig {
        AppConfig {
            db_conn_str: conn_str.to_string(),
            db_username: "admin".to_string(),
            db_password: "secreto".to_string(),
            db_bucket: "pdf-chat".to_string(),
            db_scope: "_default".to_string(),
            db_collection: "docs".to_string(),
            index_name: "pdf_index".to_string(),
            openai_api_key: "sk-test".to_string(),
            server_addr: "127.0.0.1:3322".to_string(),
            llm_chat_model: "gpt-4o-mini".to_string(),
            llm_embedding_model: "text-embedding-3-small".to_string(),
            openai_api_base: "https://api.openai.com".to_string(),
            rag_temperature: 0.3,
            direct_temperature: 0.0,
            top_k: 4,
        }
    }

    #[test]
    fn derives_service_urls_from_connection_string() {
        let (mgmt, query, search) = service_urls("couchbase://db.example.com").unwrap();
        assert_eq!(mgmt, "http://db.example.com:8091");
        assert_eq!(query, "http://db.example.com:8093/query/service");
        assert_eq!(search, "http://db.example.com:8094");
    }

    #[test]
    fn honors_explicit_management_port() {
        let (mgmt, _, _) = service_urls("couchbase://localhost:9091").unwrap();
        assert_eq!(mgmt, "http://localhost:9091");
    }

    #[test]
    fn rejects_invalid_connection_string() {
        let err = service_urls("no es una url").unwrap_err();
        assert!(matches!(err, AppError::Connection(_)));
    }

    #[tokio::test]
    async fn cached_handle_is_reused_without_a_second_session() {
        // Conn string inalcanzable: si la segunda llamada intentase conectar
        // de verdad, fallaría en vez de devolver el handle memoizado.
        let cfg = test_config("couchbase://127.0.0.1:1");
        let cache = ConnectionCache::new();

        let seeded = Arc::new(CouchbaseClient::from_config(&cfg).unwrap());
        cache.inner.lock().unwrap().insert(
            (
                cfg.db_conn_str.clone(),
                cfg.db_username.clone(),
                cfg.db_password.clone(),
            ),
            Arc::clone(&seeded),
        );

        let reused = cache.get_or_connect(&cfg).await.unwrap();
        assert!(Arc::ptr_eq(&seeded, &reused));
    }

    #[tokio::test]
    async fn different_parameters_do_not_share_a_handle() {
        let cfg_a = test_config("couchbase://127.0.0.1:1");
        let mut cfg_b = test_config("couchbase://127.0.0.1:1");
        cfg_b.db_username = "otra".to_string();

        let cache = ConnectionCache::new();
        let seeded = Arc::new(CouchbaseClient::from_config(&cfg_a).unwrap());
        cache.inner.lock().unwrap().insert(
            (
                cfg_a.db_conn_str.clone(),
                cfg_a.db_username.clone(),
                cfg_a.db_password.clone(),
            ),
            Arc::clone(&seeded),
        );

        // Parámetros distintos: la caché no responde y el connect real contra
        // un puerto cerrado termina en ConnectionError.
        let err = cache.get_or_connect(&cfg_b).await.unwrap_err();
        assert!(matches!(err, AppError::Connection(_)));
    }
}
