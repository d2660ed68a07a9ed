use std::io;
use std::path::Path;

use axum::{
    Extension, Json,
    extract::{Multipart, State, multipart::MultipartError},
    http::StatusCode,
    response::IntoResponse,
};
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tracing::{error, info, warn};
use uuid::Uuid;

use domu_types::api::{Envelope, UploadPayload};

use crate::error::ApiError;
use crate::middleware::CurrentUser;
use crate::state::AppState;

/// 50 MB per file
pub const MAX_UPLOAD_SIZE: usize = 50 * 1024 * 1024;

/// Request body cap: one max-size file plus multipart framing.
pub const UPLOAD_BODY_LIMIT: usize = MAX_UPLOAD_SIZE + 64 * 1024;

const BLOCKED_EXTENSIONS: &[&str] = &[
    "exe", "bat", "cmd", "com", "msi", "scr", "pif", "sh", "ps1", "vbs", "jar", "dll", "app", "apk",
];

const AVATAR_EXTENSIONS: &[&str] = &["png", "jpg", "jpeg", "gif", "webp"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum UploadKind {
    Chat,
    Avatar,
}

impl UploadKind {
    fn dir(self) -> &'static str {
        match self {
            Self::Chat => "chat",
            Self::Avatar => "avatars",
        }
    }
}

/// `POST /api/upload/chat`: attachment for a group message.
pub async fn chat(
    State(state): State<AppState>,
    Extension(user): Extension<CurrentUser>,
    multipart: Multipart,
) -> Result<impl IntoResponse, ApiError> {
    store_upload(&state, &user, multipart, UploadKind::Chat).await
}

/// `POST /api/upload/avatar`: images only. The client sets the returned URL
/// with `PUT /api/users/me`.
pub async fn avatar(
    State(state): State<AppState>,
    Extension(user): Extension<CurrentUser>,
    multipart: Multipart,
) -> Result<impl IntoResponse, ApiError> {
    store_upload(&state, &user, multipart, UploadKind::Avatar).await
}

async fn store_upload(
    state: &AppState,
    user: &CurrentUser,
    mut multipart: Multipart,
    kind: UploadKind,
) -> Result<(StatusCode, Json<Envelope<UploadPayload>>), ApiError> {
    let field = loop {
        match multipart.next_field().await.map_err(multipart_error)? {
            Some(field) if field.name() == Some("file") => break field,
            Some(_) => continue,
            None => return Err(ApiError::InvalidInput("missing 'file' field".into())),
        }
    };

    let ext = extension_for(field.file_name(), kind)?;
    let bytes = field.bytes().await.map_err(multipart_error)?;
    if bytes.is_empty() {
        return Err(ApiError::InvalidInput("file is empty".into()));
    }
    if bytes.len() > MAX_UPLOAD_SIZE {
        return Err(ApiError::PayloadTooLarge);
    }

    let dir = state.config.public_dir.join("uploads").join(kind.dir());
    tokio::fs::create_dir_all(&dir).await.map_err(|e| {
        error!("Failed to create upload directory {}: {}", dir.display(), e);
        ApiError::Internal(e.into())
    })?;

    let file_name = format!("{}.{}", Uuid::new_v4(), ext);
    let path = dir.join(&file_name);
    let file = tokio::fs::File::create(&path).await.map_err(|e| {
        error!("Failed to create file {}: {}", path.display(), e);
        ApiError::Internal(e.into())
    })?;
    write_or_discard(file, &path, &bytes).await.map_err(|e| {
        error!("Failed to write file {}: {}", path.display(), e);
        ApiError::Internal(e.into())
    })?;

    let url = format!("/uploads/{}/{}", kind.dir(), file_name);
    info!("{} uploaded {} ({} bytes)", user.account.username, url, bytes.len());

    Ok((
        StatusCode::CREATED,
        Json(Envelope::ok(UploadPayload {
            url,
            size: bytes.len() as u64,
        })),
    ))
}

/// Writes `bytes` through `out`; on failure the half-written file at `path`
/// is removed.
async fn write_or_discard<W: AsyncWrite + Unpin>(mut out: W, path: &Path, bytes: &[u8]) -> io::Result<()> {
    let written = match out.write_all(bytes).await {
        Ok(()) => out.flush().await,
        Err(e) => Err(e),
    };
    if written.is_err() {
        drop(out);
        if let Err(rm) = tokio::fs::remove_file(path).await {
            warn!("Could not remove partial upload {}: {}", path.display(), rm);
        }
    }
    written
}

fn multipart_error(err: MultipartError) -> ApiError {
    if err.status() == StatusCode::PAYLOAD_TOO_LARGE {
        ApiError::PayloadTooLarge
    } else {
        warn!("Malformed multipart body: {}", err.body_text());
        ApiError::InvalidInput("malformed multipart body".into())
    }
}

/// Lowercased extension taken from the client's file name. Only the
/// extension survives; the stored name is always a fresh UUID.
fn extension_for(file_name: Option<&str>, kind: UploadKind) -> Result<String, ApiError> {
    let ext = file_name
        .and_then(|name| name.rsplit_once('.'))
        .map(|(_, ext)| ext.to_ascii_lowercase())
        .filter(|ext| !ext.is_empty() && ext.len() <= 10 && ext.chars().all(|c| c.is_ascii_alphanumeric()));

    if let Some(ext) = &ext {
        if BLOCKED_EXTENSIONS.contains(&ext.as_str()) {
            return Err(ApiError::InvalidInput(format!("'.{}' files are not allowed", ext)));
        }
    }

    match kind {
        UploadKind::Avatar => match ext {
            Some(ext) if AVATAR_EXTENSIONS.contains(&ext.as_str()) => Ok(ext),
            _ => Err(ApiError::InvalidInput("avatar must be a png, jpg, gif or webp image".into())),
        },
        UploadKind::Chat => Ok(ext.unwrap_or_else(|| "bin".to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::pin::Pin;
    use std::task::{Context, Poll};

    /// Accepts nothing: every write fails the way a full disk would.
    struct FullDisk;

    impl AsyncWrite for FullDisk {
        fn poll_write(self: Pin<&mut Self>, _: &mut Context<'_>, _: &[u8]) -> Poll<io::Result<usize>> {
            Poll::Ready(Err(io::Error::other("no space left on device")))
        }

        fn poll_flush(self: Pin<&mut Self>, _: &mut Context<'_>) -> Poll<io::Result<()>> {
            Poll::Ready(Ok(()))
        }

        fn poll_shutdown(self: Pin<&mut Self>, _: &mut Context<'_>) -> Poll<io::Result<()>> {
            Poll::Ready(Ok(()))
        }
    }

    #[tokio::test]
    async fn failed_writes_leave_no_partial_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("half.bin");
        std::fs::write(&path, b"half").unwrap();

        assert!(write_or_discard(FullDisk, &path, b"payload").await.is_err());
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn successful_writes_keep_the_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("whole.bin");
        let file = tokio::fs::File::create(&path).await.unwrap();

        write_or_discard(file, &path, b"payload").await.unwrap();
        assert_eq!(std::fs::read(&path).unwrap(), b"payload");
    }

    #[test]
    fn executables_are_refused() {
        assert!(extension_for(Some("setup.EXE"), UploadKind::Chat).is_err());
        assert!(extension_for(Some("run.sh"), UploadKind::Chat).is_err());
        assert_eq!(extension_for(Some("notes.PDF"), UploadKind::Chat).unwrap(), "pdf");
    }

    #[test]
    fn odd_names_fall_back_to_bin() {
        assert_eq!(extension_for(None, UploadKind::Chat).unwrap(), "bin");
        assert_eq!(extension_for(Some("README"), UploadKind::Chat).unwrap(), "bin");
        assert_eq!(extension_for(Some("x.../../etc"), UploadKind::Chat).unwrap(), "bin");
    }

    #[test]
    fn avatars_must_be_images() {
        assert_eq!(extension_for(Some("me.JPG"), UploadKind::Avatar).unwrap(), "jpg");
        assert!(extension_for(Some("me.pdf"), UploadKind::Avatar).is_err());
        assert!(extension_for(None, UploadKind::Avatar).is_err());
    }
}
