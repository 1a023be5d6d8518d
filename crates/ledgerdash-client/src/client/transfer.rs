//! File upload and download payloads.
//!
//! Both ride on the regular request pipeline; only the body and response
//! handling differ from JSON calls.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use reqwest::header::{HeaderMap, CONTENT_DISPOSITION, CONTENT_TYPE};
use reqwest::multipart::{Form, Part};

use crate::error::{ApiError, ApiResult};

const UPLOAD_CHUNK: usize = 64 * 1024;

/// Upload progress callback, invoked with a percentage in `0..=100`.
pub type ProgressFn = Arc<dyn Fn(u8) + Send + Sync>;

/// Multipart file upload.
///
/// Progress restarts from 0 if the pipeline has to replay the upload after
/// a token renewal.
#[derive(Clone)]
pub struct UploadBody {
    field: String,
    file_name: String,
    mime: Option<String>,
    bytes: Arc<Vec<u8>>,
    fields: Vec<(String, String)>,
    progress: Option<ProgressFn>,
}

impl std::fmt::Debug for UploadBody {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UploadBody")
            .field("field", &self.field)
            .field("file_name", &self.file_name)
            .field("mime", &self.mime)
            .field("len", &self.bytes.len())
            .field("fields", &self.fields)
            .field("progress", &self.progress.is_some())
            .finish()
    }
}

impl UploadBody {
    pub fn new(file_name: impl Into<String>, bytes: impl Into<Vec<u8>>) -> Self {
        Self {
            field: "file".to_string(),
            file_name: file_name.into(),
            mime: None,
            bytes: Arc::new(bytes.into()),
            fields: Vec::new(),
            progress: None,
        }
    }

    /// Read a file from disk into an upload body.
    pub async fn from_path(path: impl AsRef<Path>) -> ApiResult<Self> {
        let path = path.as_ref();
        let bytes = tokio::fs::read(path).await.map_err(|e| ApiError::InvalidRequest {
            message: format!("failed to read {}: {}", path.display(), e),
        })?;
        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "upload".to_string());
        Ok(Self::new(file_name, bytes))
    }

    /// Multipart field name of the file part (default `file`).
    pub fn with_field(mut self, field: impl Into<String>) -> Self {
        self.field = field.into();
        self
    }

    pub fn with_mime(mut self, mime: impl Into<String>) -> Self {
        self.mime = Some(mime.into());
        self
    }

    /// Extra text field sent alongside the file.
    pub fn with_text(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.fields.push((name.into(), value.into()));
        self
    }

    pub fn on_progress(mut self, progress: impl Fn(u8) + Send + Sync + 'static) -> Self {
        self.progress = Some(Arc::new(progress));
        self
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// Build a fresh multipart form; called once per attempt.
    pub(crate) fn to_form(&self) -> ApiResult<Form> {
        let total = self.bytes.len() as u64;
        let chunks = progress_chunks(&self.bytes, self.progress.clone());
        let body = reqwest::Body::wrap_stream(futures::stream::iter(chunks));

        let mut part = Part::stream_with_length(body, total).file_name(self.file_name.clone());
        if let Some(mime) = &self.mime {
            part = part.mime_str(mime).map_err(|e| ApiError::InvalidRequest {
                message: format!("invalid mime type {}: {}", mime, e),
            })?;
        }

        let mut form = Form::new();
        for (name, value) in &self.fields {
            form = form.text(name.clone(), value.clone());
        }
        Ok(form.part(self.field.clone(), part))
    }
}

/// Split the payload into chunks that report cumulative progress as the
/// transport pulls them.
fn progress_chunks(
    bytes: &[u8],
    progress: Option<ProgressFn>,
) -> impl Iterator<Item = Result<Vec<u8>, std::io::Error>> + Send + Sync + 'static {
    let total = bytes.len();
    let chunks: Vec<Vec<u8>> = bytes.chunks(UPLOAD_CHUNK).map(<[u8]>::to_vec).collect();

    if let Some(report) = &progress {
        report(if total == 0 { 100 } else { 0 });
    }

    let mut sent = 0usize;
    chunks.into_iter().map(move |chunk| {
        sent += chunk.len();
        if let Some(report) = &progress {
            report(percent(sent, total));
        }
        Ok(chunk)
    })
}

pub(crate) fn percent(sent: usize, total: usize) -> u8 {
    if total == 0 {
        return 100;
    }
    ((sent.min(total) as u128 * 100) / total as u128) as u8
}

/// Binary response body.
#[derive(Debug, Clone)]
pub struct Download {
    pub bytes: Vec<u8>,

    /// From `Content-Disposition`, when the server sent one.
    pub file_name: Option<String>,

    pub content_type: Option<String>,
}

impl Download {
    pub(crate) fn from_parts(headers: &HeaderMap, bytes: Vec<u8>) -> Self {
        Self {
            bytes,
            file_name: headers
                .get(CONTENT_DISPOSITION)
                .and_then(|v| v.to_str().ok())
                .and_then(parse_content_disposition),
            content_type: headers
                .get(CONTENT_TYPE)
                .and_then(|v| v.to_str().ok())
                .map(String::from),
        }
    }

    /// Write the body into `dir`, named after the server-provided file name
    /// or `fallback_name`. Returns the written path.
    pub async fn save_in(&self, dir: impl AsRef<Path>, fallback_name: &str) -> ApiResult<PathBuf> {
        let name = self
            .file_name
            .as_deref()
            .and_then(|n| Path::new(n).file_name())
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| fallback_name.to_string());
        let path = dir.as_ref().join(name);
        self.save_to(&path).await?;
        Ok(path)
    }

    pub async fn save_to(&self, path: impl AsRef<Path>) -> ApiResult<()> {
        let path = path.as_ref();
        tokio::fs::write(path, &self.bytes)
            .await
            .map_err(|e| ApiError::Storage {
                message: format!("failed to save download to {}: {}", path.display(), e),
            })
    }
}

/// Extract the file name from a `Content-Disposition` value, preferring the
/// RFC 5987 `filename*` form.
pub(crate) fn parse_content_disposition(value: &str) -> Option<String> {
    let mut plain = None;

    for param in value.split(';').map(str::trim) {
        let Some((key, raw)) = param.split_once('=') else {
            continue;
        };
        let key = key.trim().to_ascii_lowercase();
        let raw = raw.trim();

        if key == "filename*" {
            let encoded = raw.splitn(3, '\'').nth(2).unwrap_or(raw);
            if let Some(decoded) = percent_decode(encoded) {
                return Some(decoded);
            }
        } else if key == "filename" {
            plain = Some(raw.trim_matches('"').to_string());
        }
    }

    plain.filter(|n| !n.is_empty())
}

fn percent_decode(input: &str) -> Option<String> {
    // form decoding treats '+' as a space; header values keep it literal
    let escaped = input.replace('+', "%2B");
    let decoded: String = url::form_urlencoded::parse(format!("x={}", escaped).as_bytes())
        .next()
        .map(|(_, v)| v.into_owned())?;
    (!decoded.is_empty()).then_some(decoded)
}
