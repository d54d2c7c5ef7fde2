//! HTTP Download Manager
//!
//! Streams a package into a `.partial` file and renames it into place once
//! complete. Cancellation and a per-chunk stall timeout are checked while
//! waiting for each chunk.

use futures_util::StreamExt;
use reqwest::header::CONTENT_LENGTH;
use reqwest::StatusCode;
use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Notify;

/// Shared cancellation flag for in-flight transfers
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<CancelState>);

#[derive(Debug, Default)]
struct CancelState {
    cancelled: AtomicBool,
    notify: Notify,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.cancelled.store(true, Ordering::SeqCst);
        self.0.notify.notify_waiters();
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.cancelled.load(Ordering::SeqCst)
    }

    /// Resolves once the token is cancelled
    pub async fn cancelled(&self) {
        loop {
            // Registered before the flag check so a concurrent cancel is not missed
            let notified = self.0.notify.notified();
            if self.is_cancelled() {
                return;
            }
            notified.await;
        }
    }

    /// Clear a cancellation once it has been honoured
    pub fn reset(&self) {
        self.0.cancelled.store(false, Ordering::SeqCst);
    }
}

#[derive(Debug)]
pub struct DownloadResult {
    pub path: PathBuf,
    pub bytes_downloaded: u64,
}

#[derive(Error, Debug)]
pub enum DownloadError {
    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
    #[error("Invalid response: {0}")]
    InvalidResponse(String),
    #[error("Device is not authorized")]
    Forbidden,
    #[error("No data received for {0:?}")]
    Stalled(Duration),
    #[error("Download cancelled")]
    Cancelled,
}

/// Write chunks into `dest` via a `.partial` file
pub struct PartialFile {
    partial_path: PathBuf,
    dest: PathBuf,
    file: File,
    written: u64,
}

impl PartialFile {
    pub fn create(dest: &Path) -> io::Result<Self> {
        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent)?;
        }
        let partial_path = dest.with_extension("partial");
        // A leftover partial from an earlier attempt is never resumed
        let file = File::create(&partial_path)?;
        Ok(Self {
            partial_path,
            dest: dest.to_path_buf(),
            file,
            written: 0,
        })
    }

    pub fn write_chunk(&mut self, chunk: &[u8]) -> io::Result<()> {
        self.file.write_all(chunk)?;
        self.written += chunk.len() as u64;
        Ok(())
    }

    pub fn finish(mut self) -> io::Result<DownloadResult> {
        self.file.flush()?;
        self.file.sync_all()?;
        fs::rename(&self.partial_path, &self.dest)?;
        Ok(DownloadResult {
            path: self.dest.clone(),
            bytes_downloaded: self.written,
        })
    }

    pub fn discard(self) {
        let _ = fs::remove_file(&self.partial_path);
    }
}

pub struct Downloader {
    stall_timeout: Duration,
}

impl Downloader {
    /// `stall_timeout` bounds the wait for response headers and for each chunk
    pub fn new(stall_timeout: Duration) -> Self {
        Self { stall_timeout }
    }

    /// Download `request` into `dest`, reporting `(downloaded, total)` per chunk
    pub async fn download<F>(
        &self,
        request: reqwest::RequestBuilder,
        dest: &Path,
        cancel: &CancelToken,
        mut on_progress: F,
    ) -> Result<DownloadResult, DownloadError>
    where
        F: FnMut(u64, u64),
    {
        if cancel.is_cancelled() {
            return Err(DownloadError::Cancelled);
        }

        let response = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(DownloadError::Cancelled),
            sent = tokio::time::timeout(self.stall_timeout, request.send()) => {
                sent.map_err(|_| DownloadError::Stalled(self.stall_timeout))??
            }
        };
        match response.status() {
            StatusCode::OK => {}
            StatusCode::FORBIDDEN => return Err(DownloadError::Forbidden),
            status => {
                return Err(DownloadError::InvalidResponse(format!("HTTP {}", status)));
            }
        }

        let total_size = response
            .headers()
            .get(CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|s| s.parse::<u64>().ok())
            .unwrap_or(0);

        let mut partial = PartialFile::create(dest)?;
        let mut stream = response.bytes_stream();
        loop {
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => Err(DownloadError::Cancelled),
                next = tokio::time::timeout(self.stall_timeout, stream.next()) => {
                    next.map_err(|_| DownloadError::Stalled(self.stall_timeout))
                }
            };
            let chunk = match next {
                Ok(Some(Ok(chunk))) => chunk,
                Ok(None) => break,
                Ok(Some(Err(e))) => {
                    partial.discard();
                    return Err(e.into());
                }
                Err(e) => {
                    partial.discard();
                    return Err(e);
                }
            };
            if let Err(e) = partial.write_chunk(&chunk) {
                partial.discard();
                return Err(e.into());
            }
            on_progress(partial.written, total_size);
        }

        if total_size > 0 && partial.written != total_size {
            let written = partial.written;
            partial.discard();
            return Err(DownloadError::InvalidResponse(format!(
                "truncated transfer: {} of {} bytes",
                written, total_size
            )));
        }

        Ok(partial.finish()?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_partial_file_renames_on_finish() {
        let dir = tempdir().unwrap();
        let dest = dir.path().join("downloads").join("v1.0.0.tar.gz");

        let mut partial = PartialFile::create(&dest).unwrap();
        partial.write_chunk(b"abc").unwrap();
        partial.write_chunk(b"def").unwrap();
        assert!(dest.with_extension("partial").exists());
        assert!(!dest.exists());

        let result = partial.finish().unwrap();
        assert_eq!(result.bytes_downloaded, 6);
        assert_eq!(fs::read(&dest).unwrap(), b"abcdef");
        assert!(!dest.with_extension("partial").exists());
    }

    #[test]
    fn test_discard_leaves_nothing() {
        let dir = tempdir().unwrap();
        let dest = dir.path().join("v1.0.0.tar.gz");

        let mut partial = PartialFile::create(&dest).unwrap();
        partial.write_chunk(b"half").unwrap();
        partial.discard();

        assert!(!dest.exists());
        assert!(!dest.with_extension("partial").exists());
    }

    #[test]
    fn test_cancel_token_shared() {
        let token = CancelToken::new();
        let other = token.clone();
        other.cancel();
        assert!(token.is_cancelled());
        token.reset();
        assert!(!other.is_cancelled());
    }

    #[tokio::test]
    async fn test_cancelled_wakes_waiters() {
        let token = CancelToken::new();
        let waiter = tokio::spawn({
            let token = token.clone();
            async move { token.cancelled().await }
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        token.cancel();
        tokio::time::timeout(Duration::from_secs(5), waiter)
            .await
            .unwrap()
            .unwrap();
    }

    /// Serves `head` on every connection, then holds it open without sending more
    async fn stalling_server(head: &'static [u8]) -> String {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let mut held = Vec::new();
            while let Ok((mut socket, _)) = listener.accept().await {
                let mut request = [0u8; 1024];
                let _ = socket.read(&mut request).await;
                let _ = socket.write_all(head).await;
                held.push(socket);
            }
        });
        format!("http://{addr}/api/updates/v1.0.0/package")
    }

    #[tokio::test]
    async fn test_silent_server_times_out() {
        let url = stalling_server(b"").await;
        let dir = tempdir().unwrap();
        let dest = dir.path().join("v1.0.0.tar.gz");

        let result = Downloader::new(Duration::from_millis(200))
            .download(reqwest::Client::new().get(&url), &dest, &CancelToken::new(), |_, _| {})
            .await;
        assert!(matches!(result, Err(DownloadError::Stalled(_))), "{result:?}");
        assert!(!dest.exists());
    }

    #[tokio::test]
    async fn test_stalled_body_times_out_and_discards() {
        let url = stalling_server(b"HTTP/1.1 200 OK\r\ncontent-length: 100\r\n\r\nabc").await;
        let dir = tempdir().unwrap();
        let dest = dir.path().join("v1.0.0.tar.gz");

        let result = Downloader::new(Duration::from_millis(200))
            .download(reqwest::Client::new().get(&url), &dest, &CancelToken::new(), |_, _| {})
            .await;
        assert!(matches!(result, Err(DownloadError::Stalled(_))), "{result:?}");
        assert!(!dest.exists());
        assert!(!dest.with_extension("partial").exists());
    }

    #[tokio::test]
    async fn test_cancel_interrupts_waiting_request() {
        let url = stalling_server(b"").await;
        let dir = tempdir().unwrap();
        let cancel = CancelToken::new();
        tokio::spawn({
            let cancel = cancel.clone();
            async move {
                tokio::time::sleep(Duration::from_millis(50)).await;
                cancel.cancel();
            }
        });

        let result = tokio::time::timeout(
            Duration::from_secs(5),
            Downloader::new(Duration::from_secs(600)).download(
                reqwest::Client::new().get(&url),
                &dir.path().join("v1.0.0.tar.gz"),
                &cancel,
                |_, _| {},
            ),
        )
        .await
        .unwrap();
        assert!(matches!(result, Err(DownloadError::Cancelled)), "{result:?}");
    }
}
