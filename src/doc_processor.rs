use crate::db::models::{Attachment, AttachmentId, AttachmentKind};
use std::fs;
use std::path::Path;

#[derive(Debug, thiserror::Error)]
pub enum DocumentError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("PDF parse error: {0}")]
    Pdf(String),
    #[error("Unsupported file type: .{0}")]
    Unsupported(String),
}

fn extension(path: &Path) -> String {
    path.extension()
        .and_then(|e| e.to_str())
        .unwrap_or("")
        .to_lowercase()
}

fn filename(path: &Path) -> String {
    path.file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("unknown")
        .to_string()
}

/// Reads a `.txt`, `.md` or `.pdf` file into a document attachment with its
/// plain text extracted.
pub fn parse_file(path: &Path) -> Result<Attachment, DocumentError> {
    let ext = extension(path);
    let bytes = match ext.as_str() {
        "txt" | "md" | "markdown" | "pdf" => fs::read(path)?,
        _ => return Err(DocumentError::Unsupported(ext)),
    };

    let (mime_type, text) = if ext == "pdf" {
        let text = pdf_extract::extract_text_from_mem(&bytes)
            .map_err(|e| DocumentError::Pdf(e.to_string()))?;
        ("application/pdf", text)
    } else {
        let mime = if ext == "txt" { "text/plain" } else { "text/markdown" };
        (mime, String::from_utf8_lossy(&bytes).into_owned())
    };
    tracing::debug!(path = %path.display(), chars = text.len(), "parsed document");

    Ok(Attachment {
        id: AttachmentId::new(),
        kind: AttachmentKind::Document,
        mime_type: mime_type.to_string(),
        filename: filename(path),
        bytes,
        text: Some(text),
    })
}

pub fn image_mime_type(path: &Path) -> Option<&'static str> {
    match extension(path).as_str() {
        "jpg" | "jpeg" => Some("image/jpeg"),
        "png" => Some("image/png"),
        "gif" => Some("image/gif"),
        "webp" => Some("image/webp"),
        _ => None,
    }
}

/// Reads an image file into an image attachment.
pub fn load_image(path: &Path) -> Result<Attachment, DocumentError> {
    let mime_type =
        image_mime_type(path).ok_or_else(|| DocumentError::Unsupported(extension(path)))?;
    let bytes = fs::read(path)?;
    Ok(Attachment {
        id: AttachmentId::new(),
        kind: AttachmentKind::Image,
        mime_type: mime_type.to_string(),
        filename: filename(path),
        bytes,
        text: None,
    })
}
