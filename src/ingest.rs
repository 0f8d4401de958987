//! Ingesta de un PDF subido: los bytes se vuelcan a un fichero temporal con
//! vida limitada a la llamada, se extrae el texto página a página y el lote
//! completo se escribe en el índice vectorial.

use std::io::Write;

use mime_guess::MimeGuess;
use tempfile::NamedTempFile;
use tracing::info;

use crate::errors::AppError;
use crate::models::PageRecord;
use crate::vector_store::DocumentSink;

/// Ingesta un documento subido. Devuelve el número de páginas escritas.
///
/// Una subida vacía es un no-op, no un error. Un PDF no parseable aborta la
/// ingesta de ese fichero con `Parse`; un fallo de escritura en el store se
/// propaga sin transformar.
pub async fn ingest_pdf(
    sink: &dyn DocumentSink,
    filename: &str,
    bytes: &[u8],
) -> Result<usize, AppError> {
    if bytes.is_empty() {
        info!("Subida vacía; no hay nada que ingerir.");
        return Ok(0);
    }

    if !looks_like_pdf(filename) {
        return Err(AppError::Parse(format!(
            "sólo se admiten ficheros PDF, no '{filename}'"
        )));
    }

    // El temporal se limpia al salir de la función por cualquier camino.
    let mut tmp = NamedTempFile::new()?;
    tmp.write_all(bytes)?;
    tmp.flush()?;

    let pages = pdf_extract::extract_text_by_pages(tmp.path()).map_err(|e| {
        AppError::Parse(format!("no se pudo extraer texto de '{filename}': {e}"))
    })?;

    let records = pages_to_records(filename, &pages);
    sink.add(&records).await?;

    info!("Ingerido '{}' con {} páginas.", filename, records.len());
    Ok(records.len())
}

/// Una unidad de texto por página lógica, en orden, con número 1-based.
fn pages_to_records(filename: &str, pages: &[String]) -> Vec<PageRecord> {
    pages
        .iter()
        .enumerate()
        .map(|(idx, text)| PageRecord {
            text: text.clone(),
            filename: filename.to_string(),
            page: idx as i64 + 1,
        })
        .collect()
}

fn looks_like_pdf(filename: &str) -> bool {
    MimeGuess::from_path(filename)
        .iter()
        .any(|mime| mime == mime_guess::mime::APPLICATION_PDF)
}
