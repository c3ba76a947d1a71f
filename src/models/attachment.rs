use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// Where the bytes of an attachment can be found.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum AttachmentSource {
    DataUrl(String),
    Placeholder,
    Remote(String),
}

impl AttachmentSource {
    pub fn kind_str(&self) -> &'static str {
        match self {
            AttachmentSource::DataUrl(_) => "data_url",
            AttachmentSource::Placeholder => "placeholder",
            AttachmentSource::Remote(_) => "remote",
        }
    }

    pub fn from_parts(kind: &str, value: Option<String>) -> Option<Self> {
        match (kind, value) {
            ("data_url", Some(v)) => Some(AttachmentSource::DataUrl(v)),
            ("placeholder", _) => Some(AttachmentSource::Placeholder),
            ("remote", Some(v)) => Some(AttachmentSource::Remote(v)),
            _ => None,
        }
    }

    pub fn value(&self) -> Option<&str> {
        match self {
            AttachmentSource::DataUrl(v) | AttachmentSource::Remote(v) => Some(v),
            AttachmentSource::Placeholder => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileAttachment {
    pub name: String,
    pub mime_type: String,
    pub source: AttachmentSource,
}

impl FileAttachment {
    pub fn url(&self) -> &str {
        self.source.value().unwrap_or("#")
    }

    pub fn is_image(&self) -> bool {
        self.mime_type.starts_with("image/")
    }
}

/// A file picked by the user that has not been materialized yet.
#[derive(Clone)]
pub struct PendingFile {
    pub name: String,
    pub mime_type: String,
    pub data: Bytes,
}

impl PendingFile {
    pub fn new(name: impl Into<String>, mime_type: impl Into<String>, data: impl Into<Bytes>) -> Self {
        Self {
            name: name.into(),
            mime_type: mime_type.into(),
            data: data.into(),
        }
    }
}

impl std::fmt::Debug for PendingFile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PendingFile")
            .field("name", &self.name)
            .field("mime_type", &self.mime_type)
            .field("data", &format!("[{} bytes]", self.data.len()))
            .finish()
    }
}
