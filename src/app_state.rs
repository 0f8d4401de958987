use std::sync::{Arc, Mutex};

use tokio::sync::oneshot;

use crate::{
    config::AppConfig, couchbase_client::CouchbaseClient, llm::LlmManager, models::Conversation,
    vector_store::VectorIndex,
};

/// Estado compartido de la aplicación. El handle del clúster y el índice
/// vectorial son singletons de proceso; la conversación pertenece a la capa
/// de presentación y sólo se anexa.
#[derive(Clone)]
pub struct AppState {
    pub config: AppConfig,
    pub store: Arc<CouchbaseClient>,
    pub index: Arc<VectorIndex>,
    pub llm: LlmManager,
    pub conversation: Arc<Mutex<Conversation>>,
    pub shutdown_sender: Arc<Mutex<Option<oneshot::Sender<()>>>>,
}
