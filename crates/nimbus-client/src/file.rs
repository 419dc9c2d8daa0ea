//! File uploads.

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use reqwest::Method;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tracing::debug;

use crate::client::Body;
use crate::{Client, Deferred, ErrorCode, NimbusError, RequestOptions};

const DEFAULT_CONTENT_TYPE: &str = "application/octet-stream";

/// Content types guessed from file extensions.
const CONTENT_TYPES: &[(&str, &str)] = &[
    ("txt", "text/plain"),
    ("html", "text/html"),
    ("css", "text/css"),
    ("csv", "text/csv"),
    ("json", "application/json"),
    ("pdf", "application/pdf"),
    ("zip", "application/zip"),
    ("png", "image/png"),
    ("jpg", "image/jpeg"),
    ("jpeg", "image/jpeg"),
    ("gif", "image/gif"),
    ("svg", "image/svg+xml"),
    ("webp", "image/webp"),
    ("mp3", "audio/mpeg"),
    ("mp4", "video/mp4"),
];

fn validate_name(name: &str) -> Result<(), NimbusError> {
    let mut chars = name.chars();
    let valid = match chars.next() {
        Some(first) if first.is_ascii_alphanumeric() || first == '_' => chars
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '@' | '.' | ' ' | '~' | '_' | '-')),
        _ => false,
    };
    if valid {
        Ok(())
    } else {
        Err(NimbusError::invalid(
            ErrorCode::InvalidFileName,
            format!("invalid file name {name:?}"),
        ))
    }
}

fn guess_content_type(name: &str) -> &'static str {
    let extension = name
        .rsplit_once('.')
        .map(|(_, ext)| ext.to_ascii_lowercase());
    extension
        .and_then(|ext| {
            CONTENT_TYPES
                .iter()
                .find(|(known, _)| *known == ext)
                .map(|(_, content_type)| *content_type)
        })
        .unwrap_or(DEFAULT_CONTENT_TYPE)
}

/// File contents waiting to be uploaded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileUpload {
    name: String,
    data: Vec<u8>,
    content_type: String,
}

impl FileUpload {
    /// Content type is guessed from the extension; override it with
    /// [`FileUpload::with_content_type`].
    pub fn new(name: &str, data: Vec<u8>) -> Result<Self, NimbusError> {
        validate_name(name)?;
        Ok(Self {
            name: name.to_string(),
            data,
            content_type: guess_content_type(name).to_string(),
        })
    }

    /// Contents given as standard base64.
    pub fn from_base64(name: &str, encoded: &str) -> Result<Self, NimbusError> {
        let data = STANDARD.decode(encoded.trim()).map_err(|e| {
            NimbusError::invalid(ErrorCode::FileReadError, format!("invalid base64: {e}"))
        })?;
        Self::new(name, data)
    }

    pub fn with_content_type(mut self, content_type: &str) -> Self {
        self.content_type = content_type.to_string();
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn content_type(&self) -> &str {
        &self.content_type
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

/// A file the server has stored.
///
/// The server may rename the file to keep names unique; `name` is the
/// stored name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "__type", rename = "File")]
pub struct StoredFile {
    pub name: String,
    pub url: String,
}

impl From<StoredFile> for Value {
    fn from(file: StoredFile) -> Self {
        json!({ "__type": "File", "name": file.name, "url": file.url })
    }
}

impl Client {
    /// Upload a file.
    pub fn save_file(&self, upload: FileUpload, options: RequestOptions) -> Deferred<StoredFile> {
        let client = self.clone();
        Deferred::spawn(async move {
            #[derive(Deserialize)]
            struct UploadResponse {
                name: String,
                url: String,
            }

            let path = format!("files/{}", upload.name);
            let size = upload.data.len();
            let response: UploadResponse = client
                .request(
                    Method::POST,
                    &path,
                    &[],
                    Body::Bytes {
                        data: upload.data,
                        content_type: upload.content_type,
                    },
                    &options,
                )
                .await?;
            debug!(name = %response.name, size, "uploaded file");
            Ok(StoredFile {
                name: response.name,
                url: response.url,
            })
        })
    }
}
