//! File-host adapters that list and download raw export files.

use std::path::PathBuf;
use std::sync::Arc;

use amis_storage::HttpFetcher;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::fs;
use tracing::debug;

use crate::decode::has_recognized_extension;
use crate::AdapterError;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceFile {
    pub name: String,
    /// Download URL or local path.
    pub location: String,
    pub size: Option<u64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FileSourceKind {
    /// Directory listing through the GitHub contents API.
    GithubContents,
    LocalDir,
}

#[async_trait]
pub trait FileSource: Send + Sync {
    fn source_id(&self) -> &str;
    fn kind(&self) -> FileSourceKind;

    /// Files in the order the host lists them.
    async fn list_files(&self, http: &HttpFetcher) -> Result<Vec<SourceFile>, AdapterError>;

    async fn fetch_file(
        &self,
        http: &HttpFetcher,
        file: &SourceFile,
    ) -> Result<Vec<u8>, AdapterError>;
}

/// Keep only files whose extension the extractor understands.
pub fn recognized_files(files: Vec<SourceFile>) -> Vec<SourceFile> {
    files
        .into_iter()
        .filter(|f| has_recognized_extension(&f.name))
        .collect()
}

#[derive(Debug, Deserialize)]
struct GithubEntry {
    name: String,
    #[serde(rename = "type")]
    entry_type: String,
    #[serde(default)]
    size: Option<u64>,
    #[serde(default)]
    download_url: Option<String>,
}

/// Parse a GitHub contents API directory response.
pub fn parse_github_listing(body: &[u8]) -> Result<Vec<SourceFile>, AdapterError> {
    let entries: Vec<GithubEntry> = serde_json::from_slice(body)?;
    Ok(entries
        .into_iter()
        .filter(|e| e.entry_type == "file")
        .filter_map(|e| {
            let location = e.download_url?;
            Some(SourceFile {
                name: e.name,
                location,
                size: e.size,
            })
        })
        .collect())
}

#[derive(Debug, Clone)]
pub struct GithubContentsSource {
    source_id: String,
    listing_url: String,
}

impl GithubContentsSource {
    pub fn new(source_id: impl Into<String>, listing_url: impl Into<String>) -> Self {
        Self {
            source_id: source_id.into(),
            listing_url: listing_url.into(),
        }
    }
}

#[async_trait]
impl FileSource for GithubContentsSource {
    fn source_id(&self) -> &str {
        &self.source_id
    }

    fn kind(&self) -> FileSourceKind {
        FileSourceKind::GithubContents
    }

    async fn list_files(&self, http: &HttpFetcher) -> Result<Vec<SourceFile>, AdapterError> {
        let resp = http.get_bytes(&self.source_id, &self.listing_url).await?;
        let files = parse_github_listing(&resp.body)?;
        debug!(source_id = %self.source_id, files = files.len(), "listed github directory");
        Ok(files)
    }

    async fn fetch_file(
        &self,
        http: &HttpFetcher,
        file: &SourceFile,
    ) -> Result<Vec<u8>, AdapterError> {
        Ok(http.get_bytes(&self.source_id, &file.location).await?.body)
    }
}

#[derive(Debug, Clone)]
pub struct LocalDirSource {
    source_id: String,
    dir: PathBuf,
}

impl LocalDirSource {
    pub fn new(source_id: impl Into<String>, dir: impl Into<PathBuf>) -> Self {
        Self {
            source_id: source_id.into(),
            dir: dir.into(),
        }
    }
}

#[async_trait]
impl FileSource for LocalDirSource {
    fn source_id(&self) -> &str {
        &self.source_id
    }

    fn kind(&self) -> FileSourceKind {
        FileSourceKind::LocalDir
    }

    /// Sorted by file name so repeated runs see the same order.
    async fn list_files(&self, _http: &HttpFetcher) -> Result<Vec<SourceFile>, AdapterError> {
        let mut entries = fs::read_dir(&self.dir).await?;
        let mut files = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let meta = entry.metadata().await?;
            if !meta.is_file() {
                continue;
            }
            files.push(SourceFile {
                name: entry.file_name().to_string_lossy().to_string(),
                location: entry.path().display().to_string(),
                size: Some(meta.len()),
            });
        }
        files.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(files)
    }

    async fn fetch_file(
        &self,
        _http: &HttpFetcher,
        file: &SourceFile,
    ) -> Result<Vec<u8>, AdapterError> {
        Ok(fs::read(&file.location).await?)
    }
}

pub fn file_source_for(
    source_id: &str,
    kind: FileSourceKind,
    location: &str,
) -> Arc<dyn FileSource> {
    match kind {
        FileSourceKind::GithubContents => Arc::new(GithubContentsSource::new(source_id, location)),
        FileSourceKind::LocalDir => Arc::new(LocalDirSource::new(source_id, location)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use amis_storage::HttpClientConfig;
    use tempfile::tempdir;

    const LISTING: &str = r#"[
        {"name": "market_1150210.txt", "type": "file", "size": 1200,
         "download_url": "https://raw.githubusercontent.com/o/r/main/data/market_1150210.txt"},
        {"name": "archive", "type": "dir", "size": 0, "download_url": null},
        {"name": "README.md", "type": "file", "size": 10,
         "download_url": "https://raw.githubusercontent.com/o/r/main/data/README.md"},
        {"name": "MARKET_1150211.TXT", "type": "file",
         "download_url": "https://raw.githubusercontent.com/o/r/main/data/MARKET_1150211.TXT"}
    ]"#;

    #[test]
    fn github_listing_keeps_files_with_download_urls() {
        let files = parse_github_listing(LISTING.as_bytes()).unwrap();
        let names: Vec<_> = files.iter().map(|f| f.name.as_str()).collect();
        assert_eq!(names, vec!["market_1150210.txt", "README.md", "MARKET_1150211.TXT"]);
        assert_eq!(files[0].size, Some(1200));
        assert_eq!(files[2].size, None);
    }

    #[test]
    fn recognized_filter_drops_other_extensions() {
        let files = recognized_files(parse_github_listing(LISTING.as_bytes()).unwrap());
        let names: Vec<_> = files.iter().map(|f| f.name.as_str()).collect();
        assert_eq!(names, vec!["market_1150210.txt", "MARKET_1150211.TXT"]);
    }

    #[test]
    fn malformed_listing_is_an_error() {
        assert!(matches!(
            parse_github_listing(b"{\"message\": \"rate limited\"}"),
            Err(AdapterError::Json(_))
        ));
    }

    #[tokio::test]
    async fn local_dir_source_lists_sorted_and_reads_bytes() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join("market_1150211.txt"), b"second").unwrap();
        std::fs::write(dir.path().join("market_1150210.txt"), b"first").unwrap();
        std::fs::create_dir(dir.path().join("nested")).unwrap();

        let http = HttpFetcher::new(HttpClientConfig::default()).unwrap();
        let source = file_source_for("local", FileSourceKind::LocalDir, &dir.path().display().to_string());
        assert_eq!(source.kind(), FileSourceKind::LocalDir);
        let files = source.list_files(&http).await.unwrap();
        assert_eq!(files.len(), 2);
        assert_eq!(files[0].name, "market_1150210.txt");
        assert_eq!(source.fetch_file(&http, &files[0]).await.unwrap(), b"first");
    }
}
