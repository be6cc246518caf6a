//! User-data decomposition
//!
//! Turns the raw user-data blob into an ordered list of typed parts:
//! - Gzip compressed data is inflated
//! - MIME messages are split (nested multiparts flattened)
//! - Anything else becomes a single `text/x-not-multipart` part
//! - `text/plain` parts are re-typed from their leading marker
//! - `#include` / `#include-once` URL lists are fetched and decomposed in place
//! - `#cloud-config-archive` lists are exploded into parts

pub mod mime;
pub mod types;

use crate::CloudInitError;
use crate::state::CloudPaths;
use flate2::read::GzDecoder;
use serde_yaml::Value;
use sha2::{Digest, Sha256};
use std::future::Future;
use std::io::Read;
use std::path::PathBuf;
use std::pin::Pin;
use std::time::Duration;
use tokio::fs;
use tracing::{debug, info, warn};

/// Limit on nested `#include` documents
const MAX_INCLUDE_DEPTH: usize = 5;

/// One decomposed unit of user-data
#[derive(Debug, Clone, PartialEq)]
pub struct Part {
    pub content_type: String,
    pub filename: String,
    pub payload: Vec<u8>,
    /// Zero-based position in the decomposed sequence
    pub index: usize,
}

/// Generated filename for the part at `index` (`part-001` for the first)
pub fn part_filename(index: usize) -> String {
    format!("part-{:03}", index + 1)
}

type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Decomposes raw user-data into parts
pub struct UserDataProcessor {
    client: reqwest::Client,
    url_cache_dir: PathBuf,
}

impl UserDataProcessor {
    pub fn new(paths: &CloudPaths) -> Result<Self, CloudInitError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .connect_timeout(Duration::from_secs(5))
            .build()?;

        Ok(Self {
            client,
            url_cache_dir: paths.url_cache_dir(),
        })
    }

    /// Decompose raw user-data
    ///
    /// Empty or whitespace-only user-data yields no parts.
    pub async fn process(&self, raw: &[u8]) -> Result<Vec<Part>, CloudInitError> {
        let mut parts = Vec::new();
        if raw.iter().all(u8::is_ascii_whitespace) {
            debug!("User-data is empty");
            return Ok(parts);
        }

        self.process_blob(raw, 0, &mut parts).await?;
        info!("Decomposed user-data into {} parts", parts.len());
        Ok(parts)
    }

    fn process_blob<'a>(
        &'a self,
        raw: &'a [u8],
        depth: usize,
        out: &'a mut Vec<Part>,
    ) -> BoxFuture<'a, Result<(), CloudInitError>> {
        Box::pin(async move {
            for leaf in convert_blob(raw)? {
                let payload = decompress_if_needed(&leaf.payload)?;

                let content_type = if types::needs_retype(&leaf.mime_type) {
                    types::type_from_starts_with(&payload)
                        .map(String::from)
                        .unwrap_or(leaf.mime_type)
                } else {
                    leaf.mime_type
                };

                match content_type.as_str() {
                    types::INCLUDE_URL | types::INCLUDE_ONCE_URL => {
                        self.do_include(&payload, depth, out).await?;
                    }
                    types::CLOUD_CONFIG_ARCHIVE => explode_archive(&payload, out)?,
                    _ => attach(out, content_type, leaf.filename, payload),
                }
            }
            Ok(())
        })
    }

    /// Fetch every URL listed in an include document and decompose its content
    async fn do_include(
        &self,
        payload: &[u8],
        depth: usize,
        out: &mut Vec<Part>,
    ) -> Result<(), CloudInitError> {
        if depth >= MAX_INCLUDE_DEPTH {
            warn!("Include depth limit ({}) reached, skipping", MAX_INCLUDE_DEPTH);
            return Ok(());
        }

        let text = String::from_utf8_lossy(payload);
        let mut include_once = false;

        for line in text.lines() {
            let mut line = line.trim();
            let lower = line.to_lowercase();
            if lower.starts_with("#include-once") {
                line = line["#include-once".len()..].trim_start();
                include_once = true;
            } else if lower.starts_with("#include") {
                line = line["#include".len()..].trim_start();
                include_once = false;
            }
            if line.is_empty() || line.starts_with('#') {
                continue;
            }

            let content = match self.fetch_include(line, include_once).await {
                Ok(Some(content)) => content,
                Ok(None) => continue,
                Err(e) => {
                    warn!("Failed to include {}: {}", line, e);
                    continue;
                }
            };
            self.process_blob(&content, depth + 1, out).await?;
        }
        Ok(())
    }

    /// Download an include URL, consulting the cache for include-once URLs
    async fn fetch_include(&self, url: &str, once: bool) -> Result<Option<Vec<u8>>, CloudInitError> {
        let cache_path = self.url_cache_dir.join(url_cache_key(url));

        if once && fs::try_exists(&cache_path).await.unwrap_or(false) {
            debug!("Using cached include-once content for {}", url);
            return Ok(Some(fs::read(&cache_path).await?));
        }

        debug!("Fetching include {}", url);
        let response = self.client.get(url).send().await?;
        if !response.status().is_success() {
            warn!("Fetching {} returned {}, skipping", url, response.status());
            return Ok(None);
        }
        let content = response.bytes().await?.to_vec();

        if once {
            fs::create_dir_all(&self.url_cache_dir).await?;
            fs::write(&cache_path, &content).await?;
        }
        Ok(Some(content))
    }
}

/// Cache file name for an include-once URL
pub fn url_cache_key(url: &str) -> String {
    hex::encode(Sha256::digest(url.as_bytes()))
}

/// Split a blob into MIME leaves, or wrap it as a single not-multipart leaf
fn convert_blob(raw: &[u8]) -> Result<Vec<mime::MimePart>, CloudInitError> {
    let data = decompress_if_needed(raw)?;

    if mime::is_mime_message(&data) {
        return mime::parse_message(&String::from_utf8_lossy(&data));
    }

    Ok(vec![mime::MimePart {
        mime_type: types::NOT_MULTIPART.to_string(),
        filename: None,
        payload: data,
        headers: Default::default(),
    }])
}

fn attach(out: &mut Vec<Part>, content_type: String, filename: Option<String>, payload: Vec<u8>) {
    let index = out.len();
    let filename = filename
        .filter(|f| !f.trim().is_empty())
        .unwrap_or_else(|| part_filename(index));
    debug!("Attaching part {} ({}) as {}", index, content_type, filename);
    out.push(Part {
        content_type,
        filename,
        payload,
        index,
    });
}

/// Expand a `#cloud-config-archive` YAML list into parts
///
/// Entries are strings or mappings with `content`, optional `type` and
/// optional `filename`. Entries without a type are sniffed, defaulting to
/// cloud-config.
fn explode_archive(payload: &[u8], out: &mut Vec<Part>) -> Result<(), CloudInitError> {
    let text = String::from_utf8_lossy(payload);
    let body = text
        .trim_start()
        .strip_prefix("#cloud-config-archive")
        .unwrap_or(&text);

    let entries = match serde_yaml::from_str::<Value>(body)? {
        Value::Sequence(entries) => entries,
        Value::Null => return Ok(()),
        _ => {
            return Err(CloudInitError::InvalidData(
                "cloud-config-archive must be a list".to_string(),
            ));
        }
    };

    for entry in entries {
        let (content, ctype, filename) = match &entry {
            Value::String(content) => (content.clone(), None, None),
            Value::Mapping(map) => (
                map.get("content")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string(),
                map.get("type").and_then(Value::as_str).map(String::from),
                map.get("filename").and_then(Value::as_str).map(String::from),
            ),
            other => {
                warn!("Skipping cloud-config-archive entry of unexpected shape: {:?}", other);
                continue;
            }
        };

        let ctype = ctype
            .map(|t| types::normalize(&t))
            .filter(|t| !t.is_empty())
            .unwrap_or_else(|| {
                types::type_from_starts_with(content.as_bytes())
                    .unwrap_or(types::CLOUD_CONFIG)
                    .to_string()
            });
        attach(out, ctype, filename, content.into_bytes());
    }
    Ok(())
}

/// Decompress gzip data if needed
fn decompress_if_needed(data: &[u8]) -> Result<Vec<u8>, CloudInitError> {
    // Check for gzip magic bytes
    if data.len() >= 2 && data[0] == 0x1f && data[1] == 0x8b {
        debug!("Decompressing gzip user-data");
        let mut decoder = GzDecoder::new(data);
        let mut decompressed = Vec::new();
        decoder.read_to_end(&mut decompressed).map_err(|e| {
            CloudInitError::InvalidData(format!("Gzip decompression failed: {}", e))
        })?;
        Ok(decompressed)
    } else {
        Ok(data.to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn processor(temp: &TempDir) -> UserDataProcessor {
        UserDataProcessor::new(&CloudPaths::with_base(temp.path())).unwrap()
    }

    #[tokio::test]
    async fn test_single_cloud_config() {
        let temp = TempDir::new().unwrap();
        let parts = processor(&temp)
            .process(b"#cloud-config\nhostname: test")
            .await
            .unwrap();

        assert_eq!(parts.len(), 1);
        assert_eq!(parts[0].content_type, types::CLOUD_CONFIG);
        assert_eq!(parts[0].filename, "part-001");
        assert_eq!(parts[0].index, 0);
    }

    #[tokio::test]
    async fn test_unstructured_payload_keeps_sentinel_type() {
        let temp = TempDir::new().unwrap();
        let parts = processor(&temp).process(b"just some words").await.unwrap();

        assert_eq!(parts.len(), 1);
        assert_eq!(parts[0].content_type, types::NOT_MULTIPART);
    }

    #[tokio::test]
    async fn test_empty_payload() {
        let temp = TempDir::new().unwrap();
        assert!(processor(&temp).process(b"").await.unwrap().is_empty());
        assert!(processor(&temp).process(b" \n").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_gzip_payload() {
        use flate2::Compression;
        use flate2::write::GzEncoder;
        use std::io::Write;

        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(b"#!/bin/sh\necho compressed").unwrap();
        let compressed = encoder.finish().unwrap();

        let temp = TempDir::new().unwrap();
        let parts = processor(&temp).process(&compressed).await.unwrap();
        assert_eq!(parts[0].content_type, types::SHELLSCRIPT);
        assert_eq!(parts[0].payload, b"#!/bin/sh\necho compressed");
    }

    #[tokio::test]
    async fn test_multipart_retype_and_filenames() {
        let message = mime::create_multipart(
            &[
                ("text/plain", None, "#cloud-boothook\necho early"),
                ("text/x-shellscript", Some("setup.sh"), "#!/bin/sh"),
                ("text/plain", None, "plain words"),
            ],
            "XYZ",
        );

        let temp = TempDir::new().unwrap();
        let parts = processor(&temp).process(message.as_bytes()).await.unwrap();

        let summary: Vec<(&str, &str)> = parts
            .iter()
            .map(|p| (p.content_type.as_str(), p.filename.as_str()))
            .collect();
        assert_eq!(
            summary,
            vec![
                (types::BOOTHOOK, "part-001"),
                (types::SHELLSCRIPT, "setup.sh"),
                (types::PLAIN, "part-003"),
            ]
        );
    }

    #[tokio::test]
    async fn test_archive_explode() {
        let archive = br##"#cloud-config-archive
- type: text/x-shellscript
  content: "#!/bin/sh\necho one"
  filename: one.sh
- content: "#cloud-config\nhostname: two"
- "#!/bin/sh\necho three"
- content: "runcmd: [ls]"
"##;

        let temp = TempDir::new().unwrap();
        let parts = processor(&temp).process(archive).await.unwrap();

        let types_seen: Vec<&str> = parts.iter().map(|p| p.content_type.as_str()).collect();
        assert_eq!(
            types_seen,
            vec![types::SHELLSCRIPT, types::CLOUD_CONFIG, types::SHELLSCRIPT, types::CLOUD_CONFIG]
        );
        assert_eq!(parts[0].filename, "one.sh");
        assert_eq!(parts[1].filename, "part-002");
    }

    #[tokio::test]
    async fn test_include_fetches_and_decomposes() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/a"))
            .respond_with(ResponseTemplate::new(200).set_body_string("#cloud-config\nhostname: a"))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/missing"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let include = format!("#include\n{0}/a\n# comment\n{0}/missing\n", server.uri());

        let temp = TempDir::new().unwrap();
        let parts = processor(&temp).process(include.as_bytes()).await.unwrap();
        assert_eq!(parts.len(), 1);
        assert_eq!(parts[0].content_type, types::CLOUD_CONFIG);
        assert!(!temp.path().join("data/urlcache").exists());
    }

    #[tokio::test]
    async fn test_include_once_is_cached() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/once"))
            .respond_with(ResponseTemplate::new(200).set_body_string("#!/bin/sh\necho once"))
            .expect(1)
            .mount(&server)
            .await;

        let url = format!("{}/once", server.uri());
        let include = format!("#include-once\n{}\n", url);

        let temp = TempDir::new().unwrap();
        let processor = processor(&temp);
        let first = processor.process(include.as_bytes()).await.unwrap();
        let second = processor.process(include.as_bytes()).await.unwrap();

        assert_eq!(first, second);
        assert!(temp.path().join("data/urlcache").join(url_cache_key(&url)).exists());
    }

    #[test]
    fn test_part_filename() {
        assert_eq!(part_filename(0), "part-001");
        assert_eq!(part_filename(41), "part-042");
    }
}
