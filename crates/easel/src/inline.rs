//! Converts remote result references into self-contained `data:` URLs.
//!
//! Result references are JSON values. Strings holding an `http(s)` URL are
//! fetched and base64-encoded; arrays are walked element by element with
//! their shape preserved; anything else (including existing `data:` URLs)
//! passes through untouched.

use std::time::Duration;

use base64::Engine as _;

use crate::version::user_agent;

const OCTET_STREAM: &str = "application/octet-stream";

#[derive(Debug, thiserror::Error)]
pub enum ConversionError {
    #[error("failed to fetch {url}: {source}")]
    Fetch {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("fetching {url} returned {status}")]
    Status { url: String, status: u16 },
}

impl ConversionError {
    pub fn url(&self) -> &str {
        match self {
            Self::Fetch { url, .. } | Self::Status { url, .. } => url,
        }
    }
}

/// Result of inlining one reference or a list of references.
#[derive(Debug)]
pub struct Inlined {
    /// Same shape as the input. Elements that failed hold their original reference.
    pub asset: serde_json::Value,
    pub failures: Vec<ConversionError>,
}

impl Inlined {
    /// True when a scalar reference could not be converted.
    ///
    /// A list with failed elements still keeps its shape and counts as usable.
    pub fn is_failed_scalar(&self) -> bool {
        !self.asset.is_array() && !self.failures.is_empty()
    }
}

/// Whether a reference points at something we can fetch.
pub fn is_remote(reference: &str) -> bool {
    let lower = reference.trim_start().to_ascii_lowercase();
    lower.starts_with("http://") || lower.starts_with("https://")
}

/// Media type implied by the final path segment, for the known image set.
fn media_type_from_extension(url: &reqwest::Url) -> Option<&'static str> {
    let segment = url.path_segments()?.next_back()?;
    let (_, ext) = segment.rsplit_once('.')?;
    match ext.to_ascii_lowercase().as_str() {
        "jpg" | "jpeg" => Some("image/jpeg"),
        "png" => Some("image/png"),
        "gif" => Some("image/gif"),
        "webp" => Some("image/webp"),
        _ => None,
    }
}

pub fn to_data_url(media_type: &str, bytes: &[u8]) -> String {
    let encoded = base64::engine::general_purpose::STANDARD.encode(bytes);
    format!("data:{media_type};base64,{encoded}")
}

#[derive(Clone)]
pub struct AssetInliner {
    client: reqwest::Client,
}

impl AssetInliner {
    pub fn new(timeout: Duration) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder()
            .user_agent(user_agent())
            .timeout(timeout)
            .build()?;
        Ok(Self { client })
    }

    pub fn with_client(client: reqwest::Client) -> Self {
        Self { client }
    }

    /// Inline a scalar reference or a list of references.
    pub async fn inline(&self, reference: &serde_json::Value) -> Inlined {
        let mut failures = Vec::new();

        let asset = match reference {
            serde_json::Value::Array(items) => {
                let mut converted = Vec::with_capacity(items.len());
                for item in items {
                    converted.push(self.inline_value(item, &mut failures).await);
                }
                serde_json::Value::Array(converted)
            }
            other => self.inline_value(other, &mut failures).await,
        };

        Inlined { asset, failures }
    }

    async fn inline_value(
        &self,
        value: &serde_json::Value,
        failures: &mut Vec<ConversionError>,
    ) -> serde_json::Value {
        let serde_json::Value::String(reference) = value else {
            return value.clone();
        };
        if !is_remote(reference) {
            return value.clone();
        }

        match self.fetch_data_url(reference).await {
            Ok(data_url) => serde_json::Value::String(data_url),
            Err(e) => {
                tracing::warn!(url = %reference, error = %e, "Failed to inline result asset");
                failures.push(e);
                value.clone()
            }
        }
    }

    /// Fetch one remote asset and encode it as a `data:` URL.
    pub async fn fetch_data_url(&self, url: &str) -> Result<String, ConversionError> {
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|source| ConversionError::Fetch {
                url: url.to_string(),
                source,
            })?;

        if !response.status().is_success() {
            return Err(ConversionError::Status {
                url: url.to_string(),
                status: response.status().as_u16(),
            });
        }

        let reported = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.split(';').next())
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty());

        // Extension of the final URL wins over the reported type.
        let media_type = media_type_from_extension(response.url())
            .map(str::to_string)
            .or(reported)
            .unwrap_or_else(|| OCTET_STREAM.to_string());

        let bytes = response
            .bytes()
            .await
            .map_err(|source| ConversionError::Fetch {
                url: url.to_string(),
                source,
            })?;

        tracing::debug!(%url, %media_type, size = bytes.len(), "Inlined result asset");
        Ok(to_data_url(&media_type, &bytes))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn inliner() -> AssetInliner {
        AssetInliner::new(Duration::from_secs(5)).unwrap()
    }

    async fn serve(server: &MockServer, at: &str, body: &[u8], content_type: Option<&str>) {
        let mut template = ResponseTemplate::new(200).set_body_bytes(body.to_vec());
        if let Some(ct) = content_type {
            template = template.insert_header("content-type", ct);
        }
        Mock::given(method("GET"))
            .and(path(at))
            .respond_with(template)
            .mount(server)
            .await;
    }

    #[test]
    fn remote_detection() {
        assert!(is_remote("https://replicate.delivery/a.png"));
        assert!(is_remote("HTTP://example.com/a.png"));
        assert!(!is_remote("data:image/png;base64,AAAA"));
        assert!(!is_remote("ftp://example.com/a.png"));
        assert!(!is_remote("a.png"));
    }

    #[test]
    fn extension_media_types() {
        let url = |s: &str| reqwest::Url::parse(s).unwrap();
        assert_eq!(
            media_type_from_extension(&url("https://x/out/0.jpg")),
            Some("image/jpeg")
        );
        assert_eq!(
            media_type_from_extension(&url("https://x/out/0.JPEG?sig=1")),
            Some("image/jpeg")
        );
        assert_eq!(
            media_type_from_extension(&url("https://x/out/0.webp")),
            Some("image/webp")
        );
        assert_eq!(media_type_from_extension(&url("https://x/out/0.tiff")), None);
        assert_eq!(media_type_from_extension(&url("https://x/out/blob")), None);
    }

    #[test]
    fn data_url_format() {
        assert_eq!(to_data_url("image/png", b"hi"), "data:image/png;base64,aGk=");
    }

    #[tokio::test]
    async fn non_remote_values_pass_through() {
        let inliner = inliner();
        for value in [
            json!("data:image/png;base64,aGk="),
            json!("not a url"),
            json!(42),
            json!(null),
            json!({"url": "https://x/a.png"}),
        ] {
            let inlined = inliner.inline(&value).await;
            assert_eq!(inlined.asset, value);
            assert!(inlined.failures.is_empty());
        }
    }

    #[tokio::test]
    async fn scalar_uses_extension_over_content_type() {
        let server = MockServer::start().await;
        serve(&server, "/out/0.jpg", b"hi", Some("application/octet-stream")).await;

        let inlined = inliner()
            .inline(&json!(format!("{}/out/0.jpg", server.uri())))
            .await;

        assert_eq!(inlined.asset, json!("data:image/jpeg;base64,aGk="));
        assert!(inlined.failures.is_empty());
    }

    #[tokio::test]
    async fn falls_back_to_content_type_then_octet_stream() {
        let server = MockServer::start().await;
        serve(&server, "/blob/a", b"hi", Some("image/avif; charset=binary")).await;
        serve(&server, "/blob/b", b"hi", None).await;

        let inliner = inliner();
        let a = inliner
            .inline(&json!(format!("{}/blob/a", server.uri())))
            .await;
        assert_eq!(a.asset, json!("data:image/avif;base64,aGk="));

        let b = inliner
            .fetch_data_url(&format!("{}/blob/b", server.uri()))
            .await
            .unwrap();
        assert!(b.starts_with("data:application/octet-stream;base64,"));
    }

    #[tokio::test]
    async fn sequence_preserves_shape_with_fallback() {
        let server = MockServer::start().await;
        serve(&server, "/out/0.png", b"zero", None).await;
        Mock::given(method("GET"))
            .and(path("/out/1.png"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let missing = format!("{}/out/1.png", server.uri());
        let input = json!([
            format!("{}/out/0.png", server.uri()),
            missing.clone(),
            "data:image/gif;base64,AAAA"
        ]);

        let inlined = inliner().inline(&input).await;

        assert_eq!(
            inlined.asset,
            json!([
                "data:image/png;base64,emVybw==",
                missing.clone(),
                "data:image/gif;base64,AAAA"
            ])
        );
        assert_eq!(inlined.failures.len(), 1);
        assert_eq!(inlined.failures[0].url(), missing);
        assert!(!inlined.is_failed_scalar());
    }

    #[tokio::test]
    async fn failed_scalar_keeps_reference() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let reference = json!(format!("{}/out/0.png", server.uri()));
        let inlined = inliner().inline(&reference).await;

        assert_eq!(inlined.asset, reference);
        assert!(inlined.is_failed_scalar());
        assert!(matches!(
            inlined.failures[0],
            ConversionError::Status { status: 500, .. }
        ));
    }
}
