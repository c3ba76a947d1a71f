use std::path::Path;

use anyhow::Context;
use base64::Engine;

use crate::error::{PipelineError, Result};
use crate::models::{AttachmentSource, FileAttachment, PendingFile};

pub const MAX_ATTACHMENT_BYTES: usize = 10 * 1024 * 1024;

pub const ALLOWED_MIME_TYPES: &[&str] = &[
    "application/pdf",
    "image/jpeg",
    "image/png",
    "image/gif",
    "image/webp",
    "text/plain",
];

/// Mime type for a file name, by extension.
pub fn guess_mime_type(name: &str) -> &'static str {
    let ext = name
        .rsplit_once('.')
        .map(|(_, ext)| ext.to_ascii_lowercase())
        .unwrap_or_default();
    match ext.as_str() {
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        "gif" => "image/gif",
        "webp" => "image/webp",
        "pdf" => "application/pdf",
        "txt" | "md" => "text/plain",
        _ => "application/octet-stream",
    }
}

pub fn validate(file: &PendingFile) -> Result<()> {
    if !ALLOWED_MIME_TYPES.contains(&file.mime_type.as_str()) {
        return Err(PipelineError::invalid_attachment(
            &file.name,
            format!("unsupported file type {}", file.mime_type),
        ));
    }
    if file.data.len() > MAX_ATTACHMENT_BYTES {
        return Err(PipelineError::invalid_attachment(
            &file.name,
            "file is larger than 10 MB",
        ));
    }
    Ok(())
}

/// Images are inlined as data URLs; other files keep only their name.
pub fn materialize(file: &PendingFile) -> FileAttachment {
    let source = if file.mime_type.starts_with("image/") {
        let encoded = base64::engine::general_purpose::STANDARD.encode(&file.data);
        AttachmentSource::DataUrl(format!("data:{};base64,{}", file.mime_type, encoded))
    } else {
        AttachmentSource::Placeholder
    };
    FileAttachment {
        name: file.name.clone(),
        mime_type: file.mime_type.clone(),
        source,
    }
}

/// Validate every file, then materialize them. Nothing is produced if any file is rejected.
pub fn process_files(files: &[PendingFile]) -> Result<Vec<FileAttachment>> {
    for file in files {
        validate(file)?;
    }
    Ok(files.iter().map(materialize).collect())
}

pub async fn read_file(path: &Path) -> anyhow::Result<PendingFile> {
    let data = tokio::fs::read(path)
        .await
        .with_context(|| format!("Failed to read {}", path.display()))?;
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "file".to_string());
    let mime_type = guess_mime_type(&name);
    Ok(PendingFile::new(name, mime_type, data))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_image_becomes_data_url() {
        let file = PendingFile::new("dot.png", "image/png", vec![1u8, 2, 3]);
        let att = materialize(&file);
        assert_eq!(att.url(), "data:image/png;base64,AQID");
        assert!(att.is_image());
    }

    #[test]
    fn test_pdf_becomes_placeholder() {
        let file = PendingFile::new("paper.pdf", "application/pdf", vec![0u8; 10]);
        assert_eq!(materialize(&file).url(), "#");
    }

    #[test]
    fn test_rejects_unsupported_and_oversized() {
        let zip = PendingFile::new("a.zip", "application/zip", vec![0u8]);
        assert!(matches!(
            process_files(&[zip]),
            Err(PipelineError::InvalidAttachment { .. })
        ));

        let big = PendingFile::new("big.txt", "text/plain", vec![0u8; MAX_ATTACHMENT_BYTES + 1]);
        let ok = PendingFile::new("ok.txt", "text/plain", vec![0u8]);
        assert!(process_files(&[ok, big]).is_err());
    }

    #[test]
    fn test_guess_mime_type() {
        assert_eq!(guess_mime_type("Photo.JPG"), "image/jpeg");
        assert_eq!(guess_mime_type("notes.txt"), "text/plain");
        assert_eq!(guess_mime_type("archive"), "application/octet-stream");
    }

    #[tokio::test]
    async fn test_read_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("hello.txt");
        std::fs::write(&path, "hello").unwrap();
        let file = read_file(&path).await.unwrap();
        assert_eq!(file.name, "hello.txt");
        assert_eq!(file.mime_type, "text/plain");
        assert_eq!(&file.data[..], b"hello");
    }
}
