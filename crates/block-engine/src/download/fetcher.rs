//! Artifact transfer.
//!
//! [`HttpFetcher`] streams `http(s)` bodies to a `.part` file next to the
//! destination and renames it once complete; `data:` URIs are decoded in
//! memory.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use base64::Engine;
use futures_util::TryStreamExt;
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;

use crate::error::{EngineError, Result};

/// Writes one artifact to disk.
#[async_trait]
pub trait ArtifactFetcher: Send + Sync {
    /// Fetch `url` into `dest`, returning the number of bytes written.
    ///
    /// Must return [`EngineError::Cancelled`] promptly once `cancel` fires
    /// and must not leave a partial file at `dest`.
    async fn fetch(&self, url: &str, dest: &Path, cancel: CancellationToken) -> Result<u64>;
}

/// Fetcher over `reqwest`
#[derive(Debug, Clone, Default)]
pub struct HttpFetcher {
    client: reqwest::Client,
}

impl HttpFetcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_client(client: reqwest::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl ArtifactFetcher for HttpFetcher {
    async fn fetch(&self, url: &str, dest: &Path, cancel: CancellationToken) -> Result<u64> {
        if url.starts_with("data:") {
            let (_, bytes) = decode_data_uri(url)?;
            write_complete(dest, &bytes).await?;
            return Ok(bytes.len() as u64);
        }

        let response = tokio::select! {
            _ = cancel.cancelled() => return Err(EngineError::Cancelled),
            response = self.client.get(url).send() => response?,
        };

        if !response.status().is_success() {
            return Err(EngineError::download(format!(
                "server returned {} for {}",
                response.status(),
                url
            )));
        }

        let part = part_path(dest);
        let result = stream_to_file(response, &part, &cancel).await;
        if result.is_err() {
            let _ = tokio::fs::remove_file(&part).await;
        }
        let written = result?;
        tokio::fs::rename(&part, dest).await?;

        Ok(written)
    }
}

async fn stream_to_file(
    response: reqwest::Response,
    part: &Path,
    cancel: &CancellationToken,
) -> Result<u64> {
    let mut file = tokio::fs::File::create(part).await?;
    let mut stream = response.bytes_stream();
    let mut written: u64 = 0;

    loop {
        let chunk = tokio::select! {
            _ = cancel.cancelled() => return Err(EngineError::Cancelled),
            chunk = stream.try_next() => chunk?,
        };
        let Some(chunk) = chunk else {
            break;
        };
        file.write_all(&chunk).await?;
        written += chunk.len() as u64;
    }

    file.flush().await?;
    Ok(written)
}

/// Split a `data:` URI into its MIME type and decoded payload
pub fn decode_data_uri(uri: &str) -> Result<(Option<String>, Vec<u8>)> {
    let rest = uri
        .strip_prefix("data:")
        .ok_or_else(|| EngineError::download("not a data URI"))?;
    let (meta, payload) = rest
        .split_once(',')
        .ok_or_else(|| EngineError::download("malformed data URI: missing ','"))?;

    let mime = meta
        .split(';')
        .next()
        .map(str::trim)
        .filter(|m| !m.is_empty())
        .map(str::to_string);

    let bytes = if meta.ends_with(";base64") {
        base64::engine::general_purpose::STANDARD
            .decode(payload.trim())
            .map_err(|e| EngineError::download(format!("invalid base64 payload: {}", e)))?
    } else {
        payload.as_bytes().to_vec()
    };

    Ok((mime, bytes))
}

fn part_path(dest: &Path) -> PathBuf {
    let mut name = dest.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    name.push(".part");
    dest.with_file_name(name)
}

async fn write_complete(dest: &Path, bytes: &[u8]) -> Result<()> {
    let part = part_path(dest);
    if let Err(e) = tokio::fs::write(&part, bytes).await {
        let _ = tokio::fs::remove_file(&part).await;
        return Err(e.into());
    }
    tokio::fs::rename(&part, dest).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tempfile::TempDir;
    use tokio::io::AsyncReadExt;
    use tokio::net::TcpListener;

    /// Serve one connection with `head` and `body`, then hold it open for `linger`
    async fn serve_once(head: &'static str, body: &'static [u8], linger: Duration) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut request = Vec::new();
            let mut buf = [0u8; 1024];
            while !request.windows(4).any(|w| w == b"\r\n\r\n") {
                let n = socket.read(&mut buf).await.unwrap();
                if n == 0 {
                    return;
                }
                request.extend_from_slice(&buf[..n]);
            }
            socket.write_all(head.as_bytes()).await.unwrap();
            socket.write_all(body).await.unwrap();
            socket.flush().await.unwrap();
            tokio::time::sleep(linger).await;
        });
        format!("http://{}/clip.mp4", addr)
    }

    fn local_fetcher() -> HttpFetcher {
        HttpFetcher::with_client(reqwest::Client::builder().no_proxy().build().unwrap())
    }

    #[test]
    fn test_decode_base64_data_uri() {
        let (mime, bytes) = decode_data_uri("data:text/plain;base64,aGVsbG8=").unwrap();
        assert_eq!(mime.as_deref(), Some("text/plain"));
        assert_eq!(bytes, b"hello");
    }

    #[test]
    fn test_decode_plain_data_uri() {
        let (mime, bytes) = decode_data_uri("data:,plain").unwrap();
        assert_eq!(mime, None);
        assert_eq!(bytes, b"plain");
    }

    #[test]
    fn test_decode_rejects_malformed() {
        assert!(decode_data_uri("data:image/png;base64").is_err());
        assert!(decode_data_uri("data:image/png;base64,%%%").is_err());
        assert!(decode_data_uri("https://cdn.test/a.png").is_err());
    }

    #[test]
    fn test_part_path() {
        assert_eq!(
            part_path(Path::new("/d/clip.mp4")),
            PathBuf::from("/d/clip.mp4.part")
        );
    }

    #[tokio::test]
    async fn test_fetch_data_uri_to_disk() {
        let temp_dir = TempDir::new().unwrap();
        let dest = temp_dir.path().join("note.txt");

        let written = HttpFetcher::new()
            .fetch("data:text/plain;base64,aGVsbG8=", &dest, CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(written, 5);
        assert_eq!(tokio::fs::read(&dest).await.unwrap(), b"hello");
        assert!(!part_path(&dest).exists());
    }

    #[tokio::test]
    async fn test_http_body_streams_to_destination() {
        let temp_dir = TempDir::new().unwrap();
        let dest = temp_dir.path().join("clip.mp4");
        let url = serve_once(
            "HTTP/1.1 200 OK\r\nContent-Length: 11\r\nConnection: close\r\n\r\n",
            b"frame bytes",
            Duration::ZERO,
        )
        .await;

        let written = local_fetcher()
            .fetch(&url, &dest, CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(written, 11);
        assert_eq!(tokio::fs::read(&dest).await.unwrap(), b"frame bytes");
        assert!(!part_path(&dest).exists());
    }

    #[tokio::test]
    async fn test_http_error_status_writes_nothing() {
        let temp_dir = TempDir::new().unwrap();
        let dest = temp_dir.path().join("clip.mp4");
        let url = serve_once(
            "HTTP/1.1 404 Not Found\r\nContent-Length: 0\r\nConnection: close\r\n\r\n",
            b"",
            Duration::ZERO,
        )
        .await;

        let err = local_fetcher()
            .fetch(&url, &dest, CancellationToken::new())
            .await
            .unwrap_err();

        assert!(err.to_string().contains("404"));
        assert!(!dest.exists());
        assert!(!part_path(&dest).exists());
    }

    #[tokio::test]
    async fn test_truncated_body_removes_partial_file() {
        let temp_dir = TempDir::new().unwrap();
        let dest = temp_dir.path().join("clip.mp4");
        let url = serve_once(
            "HTTP/1.1 200 OK\r\nContent-Length: 100\r\nConnection: close\r\n\r\n",
            b"only ten b",
            Duration::ZERO,
        )
        .await;

        let result = local_fetcher()
            .fetch(&url, &dest, CancellationToken::new())
            .await;

        assert!(result.is_err());
        assert!(!dest.exists());
        assert!(!part_path(&dest).exists());
    }

    #[tokio::test]
    async fn test_cancel_mid_stream_removes_partial_file() {
        let temp_dir = TempDir::new().unwrap();
        let dest = temp_dir.path().join("clip.mp4");
        let url = serve_once(
            "HTTP/1.1 200 OK\r\nContent-Length: 1000\r\n\r\n",
            b"first chunk",
            Duration::from_secs(10),
        )
        .await;

        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            trigger.cancel();
        });

        let err = tokio::time::timeout(
            Duration::from_secs(5),
            local_fetcher().fetch(&url, &dest, cancel),
        )
        .await
        .unwrap()
        .unwrap_err();

        assert!(err.is_cancelled());
        assert!(!dest.exists());
        assert!(!part_path(&dest).exists());
    }
}
