// Módulos de la aplicación
mod api;
mod app_state;
mod chat;
mod config;
mod couchbase_client;
mod errors;
mod ingest;
mod llm;
mod models;
mod vector_store;

use std::sync::{Arc, Mutex};

use axum::Router;
use tokio::sync::oneshot;
use tower_http::{
    cors::{Any, CorsLayer},
    services::ServeDir,
};
use tracing::info;
use tracing_subscriber::EnvFilter;

use crate::app_state::AppState;
use crate::couchbase_client::ConnectionCache;
use crate::models::Conversation;
use crate::vector_store::VectorIndex;

#[tokio::main]
async fn main() {
    // 1. Cargar .env e inicializar logging
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    // 2. Cargar configuración: sin ella no se intenta ninguna conexión
    let cfg = config::AppConfig::from_env().expect("Error al cargar la configuración");

    // 3. Conectar a Couchbase (handle memoizado por parámetros) y verificar
    //    el índice de búsqueda
    let connections = ConnectionCache::new();
    let store = connections
        .get_or_connect(&cfg)
        .await
        .expect("Error conectando a Couchbase");

    // 4. Inicializar gestor de LLMs e índice vectorial
    let llm = llm::LlmManager::from_config(&cfg).expect("Error inicializando LLM Manager");
    let index = Arc::new(VectorIndex::new(
        Arc::clone(&store),
        llm.clone(),
        cfg.index_name.clone(),
        cfg.top_k,
    ));
    index
        .ensure_search_index()
        .await
        .expect("Error verificando el índice de búsqueda");

    // Crear canal para la señal de apagado.
    let (shutdown_tx, shutdown_rx) = oneshot::channel();

    // 5. Crear estado compartido de la aplicación
    let app_state = AppState {
        config: cfg.clone(),
        store,
        index,
        llm,
        conversation: Arc::new(Mutex::new(Conversation::default())),
        shutdown_sender: Arc::new(Mutex::new(Some(shutdown_tx))),
    };

    // 6. Configurar el router de la API y el servicio de ficheros estáticos
    let app = Router::new()
        .nest("/", api::create_router(app_state.clone()))
        .fallback_service(ServeDir::new("frontend"))
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        );

    // 7. Iniciar el servidor
    let server_addr = &app_state.config.server_addr;
    let listener = tokio::net::TcpListener::bind(server_addr)
        .await
        .expect("Error abriendo el puerto del servidor");
    let server_url = format!("http://{}", server_addr);
    info!("🚀 Servidor escuchando en {}", &server_url);

    // Abrir el frontend en el navegador por defecto
    if webbrowser::open(&server_url).is_err() {
        info!(
            "No se pudo abrir el navegador. Por favor, accede a {} manualmente.",
            server_url
        );
    }

    // Configurar el apagado ordenado.
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            shutdown_rx.await.ok();
            info!("Señal de apagado recibida, iniciando cierre del servidor.");
        })
        .await
        .expect("Error sirviendo la aplicación");

    info!("✅ Servidor cerrado correctamente.");
}
