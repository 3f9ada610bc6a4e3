use std::path::PathBuf;
use url::Url;

/// A validated inbound download request. Immutable once built.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadRequest {
    pub url: Url,
    pub path: PathBuf,
}

#[derive(thiserror::Error, Debug, PartialEq, Eq)]
pub enum RequestError {
    #[error("empty url")]
    EmptyUrl,

    #[error("empty destination path")]
    EmptyPath,

    #[error("unusable url {0:?}: {1}")]
    BadUrl(String, url::ParseError),

    #[error("unsupported url scheme {0:?}")]
    UnsupportedScheme(String),
}

impl DownloadRequest {
    /// Checks both fields before any session index is spent on the request.
    pub fn validate(url: &str, path: &str) -> Result<Self, RequestError> {
        if url.is_empty() {
            return Err(RequestError::EmptyUrl);
        }
        if path.is_empty() {
            return Err(RequestError::EmptyPath);
        }
        let parsed = Url::parse(url).map_err(|e| RequestError::BadUrl(url.to_string(), e))?;
        match parsed.scheme() {
            "http" | "https" => Ok(Self { url: parsed, path: PathBuf::from(path) }),
            other => Err(RequestError::UnsupportedScheme(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Pending,
    InProgress,
    Completed,
    Failed,
    Cancelled,
}

/// Per-transfer state, owned exclusively by one worker for its lifetime.
/// `total_bytes` stays 0 when the server declares no length, in which case
/// every reported percentage is 0 until the terminal event.
#[derive(Debug, Clone)]
pub struct DownloadSession {
    pub index: i64,
    pub request: DownloadRequest,
    pub bytes_downloaded: u64,
    pub total_bytes: u64,
    pub state: SessionState,
}

impl DownloadSession {
    pub fn new(index: i64, request: DownloadRequest) -> Self {
        Self { index, request, bytes_downloaded: 0, total_bytes: 0, state: SessionState::Pending }
    }

    pub fn percent(&self) -> u8 {
        if self.total_bytes == 0 {
            return 0;
        }
        ((self.bytes_downloaded * 100 / self.total_bytes).min(100)) as u8
    }
}

/// Tuning shared by every worker a manager spawns.
#[derive(Debug, Clone)]
pub struct TransferContext {
    pub user_agent: String,
    pub timeout_secs: u64,
    pub retries: u32,
    pub retry_backoff_ms: u64,
    pub chunk_size: u64,
}

impl Default for TransferContext {
    fn default() -> Self {
        Self {
            user_agent: "pipefetch/0.1".to_string(),
            timeout_secs: 60,
            retries: 2,
            retry_backoff_ms: 400,
            chunk_size: 1024 * 1024,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validate_accepts_http_and_https() {
        assert!(DownloadRequest::validate("http://x/file.bin", "/tmp/file.bin").is_ok());
        assert!(DownloadRequest::validate("https://x/file.bin", "/tmp/file.bin").is_ok());
    }

    #[test]
    fn validate_rejects_empty_fields() {
        assert_eq!(DownloadRequest::validate("", "/tmp/f"), Err(RequestError::EmptyUrl));
        assert_eq!(
            DownloadRequest::validate("http://x/f", ""),
            Err(RequestError::EmptyPath)
        );
    }

    #[test]
    fn validate_rejects_other_schemes() {
        assert!(matches!(
            DownloadRequest::validate("ftp://x/f", "/tmp/f"),
            Err(RequestError::UnsupportedScheme(_))
        ));
        assert!(matches!(
            DownloadRequest::validate("not a url", "/tmp/f"),
            Err(RequestError::BadUrl(..))
        ));
    }

    #[test]
    fn percent_is_zero_without_total() {
        let req = DownloadRequest::validate("http://x/f", "/tmp/f").unwrap();
        let mut s = DownloadSession::new(0, req);
        s.bytes_downloaded = 5 * 1024 * 1024;
        assert_eq!(s.percent(), 0);
    }

    #[test]
    fn percent_floors_and_caps() {
        let req = DownloadRequest::validate("http://x/f", "/tmp/f").unwrap();
        let mut s = DownloadSession::new(0, req);
        s.total_bytes = 3;
        s.bytes_downloaded = 1;
        assert_eq!(s.percent(), 33);
        s.bytes_downloaded = 2;
        assert_eq!(s.percent(), 66);
        // Server lied about the length; never report past 100.
        s.bytes_downloaded = 7;
        assert_eq!(s.percent(), 100);
    }
}
