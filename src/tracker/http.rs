use std::time::Duration;

use reqwest::Client;

use super::error::TrackerError;
use super::response::{parse_http_response, AnnounceRequest, AnnounceResponse};

const HTTP_TIMEOUT: Duration = Duration::from_secs(30);

pub struct HttpTracker {
    client: Client,
    url: String,
}

impl HttpTracker {
    pub fn new(url: &str) -> Result<Self, TrackerError> {
        if !url.starts_with("http://") && !url.starts_with("https://") {
            return Err(TrackerError::InvalidUrl(url.to_string()));
        }

        let client = Client::builder()
            .timeout(HTTP_TIMEOUT)
            .build()
            .map_err(TrackerError::Http)?;

        Ok(Self {
            client,
            url: url.to_string(),
        })
    }

    pub async fn announce(
        &self,
        request: &AnnounceRequest,
    ) -> Result<AnnounceResponse, TrackerError> {
        let mut url = format!(
            "{}?info_hash={}&peer_id={}&port={}&uploaded={}&downloaded={}&left={}&compact=1",
            self.url,
            url_encode(&request.info_hash),
            url_encode(&request.peer_id),
            request.port,
            request.uploaded,
            request.downloaded,
            request.left,
        );

        let event = request.event.as_str();
        if !event.is_empty() {
            url.push_str("&event=");
            url.push_str(event);
        }

        let response = self.client.get(&url).send().await?;
        let body = response.bytes().await?;

        parse_http_response(&body)
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

/// Percent-encodes arbitrary bytes for a query parameter; binary info-hashes
/// and peer ids cannot go through a str-based encoder.
fn url_encode(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 3);
    for &b in bytes {
        if b.is_ascii_alphanumeric() || matches!(b, b'-' | b'_' | b'.' | b'~') {
            out.push(b as char);
        } else {
            out.push_str(&format!("%{b:02X}"));
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_url_encode_binary() {
        assert_eq!(url_encode(b"abc-123._~"), "abc-123._~");
        assert_eq!(url_encode(&[0x00, 0xFF, b' ']), "%00%FF%20");
    }

    #[test]
    fn test_rejects_non_http_url() {
        assert!(HttpTracker::new("udp://tracker.example.com:80").is_err());
        assert!(HttpTracker::new("http://tracker.example.com/announce").is_ok());
    }
}
