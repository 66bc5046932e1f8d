//! Segment URL manifests produced by the discovery crawler.
//!
//! Each `*.csv` in the urls directory has `name`, `content` and
//! `quality_urls` columns; `quality_urls` is a JSON object mapping a quality
//! label to the ordered segment list for that quality.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::Deserialize;

use crate::probe::ProbeRequest;

/// A segment is either a bare URL or a URL plus a byte range.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(untagged)]
pub enum SegmentDescriptor {
    Url(String),
    Ranged {
        url: String,
        #[serde(default, alias = "req_headers")]
        range: Option<String>,
    },
}

impl SegmentDescriptor {
    pub fn url(&self) -> &str {
        match self {
            SegmentDescriptor::Url(url) => url,
            SegmentDescriptor::Ranged { url, .. } => url,
        }
    }

    pub fn to_request(&self) -> ProbeRequest {
        match self {
            SegmentDescriptor::Url(url) => ProbeRequest::new(url.clone()),
            SegmentDescriptor::Ranged { url, range } => ProbeRequest {
                url: url.clone(),
                range: range.clone().filter(|r| !r.trim().is_empty()),
            },
        }
    }
}

/// One (video, quality) pair with its ordered segments.
#[derive(Debug, Clone, PartialEq)]
pub struct ManifestEntry {
    /// Already sanitized for use in file names.
    pub name: String,
    pub content: String,
    pub quality: String,
    pub segments: Vec<SegmentDescriptor>,
}

impl ManifestEntry {
    /// Streaming service, used as the results sub-directory.
    pub fn service(&self) -> &str {
        match self.content.split('_').next() {
            Some(s) if !s.is_empty() => s,
            _ => "service",
        }
    }

    /// `<name>--<quality>_<content>`, the shared prefix of the result and error files.
    pub fn file_stem(&self) -> String {
        format!("{}--{}_{}", self.name, self.quality, self.content)
    }
}

#[derive(Debug, Deserialize)]
struct ManifestRow {
    #[serde(default)]
    name: String,
    #[serde(default)]
    content: String,
    #[serde(default)]
    quality_urls: String,
}

/// Transliterate to ASCII, then keep only `[A-Za-z0-9_ ]`.
pub fn sanitize_name(name: &str) -> String {
    deunicode::deunicode(name)
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || *c == '_' || *c == ' ')
        .collect()
}

fn short(name: &str) -> String {
    name.chars().take(30).collect()
}

/// Load every manifest in `dir`, in file-name order.
///
/// Rows with a missing or unparseable `quality_urls` are skipped and logged.
pub fn load_manifests(dir: &Path) -> Result<Vec<ManifestEntry>> {
    let mut files: Vec<PathBuf> = std::fs::read_dir(dir)
        .with_context(|| format!("reading manifest dir {}", dir.display()))?
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter(|p| p.is_file() && p.extension().is_some_and(|ext| ext == "csv"))
        .collect();
    files.sort();

    let mut entries = Vec::new();
    for path in &files {
        tracing::info!("Reading URL manifest: {}", path.display());
        entries.extend(load_manifest_file(path)?);
    }
    Ok(entries)
}

pub fn load_manifest_file(path: &Path) -> Result<Vec<ManifestEntry>> {
    let mut reader = csv::Reader::from_path(path)
        .with_context(|| format!("opening manifest {}", path.display()))?;
    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();

    let mut entries = Vec::new();
    for (line, row) in reader.deserialize::<ManifestRow>().enumerate() {
        let row = match row {
            Ok(r) => r,
            Err(e) => {
                tracing::warn!("Skip malformed row {} in {}: {}", line + 1, file_name, e);
                continue;
            }
        };

        if row.quality_urls.trim().is_empty() {
            tracing::warn!(
                "Missing quality_urls for entry '{}' in {}",
                short(&row.name),
                file_name
            );
            continue;
        }

        let qualities: BTreeMap<String, Vec<SegmentDescriptor>> =
            match serde_json::from_str(&row.quality_urls) {
                Ok(q) => q,
                Err(e) => {
                    tracing::error!(
                        "Failed to parse quality_urls for '{}' in {}: {}",
                        short(&row.name),
                        file_name,
                        e
                    );
                    continue;
                }
            };

        let name = sanitize_name(&row.name);
        for (quality, segments) in qualities {
            entries.push(ManifestEntry {
                name: name.clone(),
                content: row.content.clone(),
                quality,
                segments,
            });
        }
    }
    Ok(entries)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_manifest(dir: &Path, file: &str, body: &str) {
        let mut f = std::fs::File::create(dir.join(file)).unwrap();
        f.write_all(body.as_bytes()).unwrap();
    }

    #[test]
    fn test_sanitize_name() {
        assert_eq!(sanitize_name("Ep. 1: Café / Ünïcode_x"), "Ep 1 Cafe  Unicode_x");
        assert_eq!(sanitize_name("plain_name 2"), "plain_name 2");
        assert_eq!(sanitize_name("../../etc"), "etc");
    }

    #[test]
    fn test_non_ascii_titles_keep_distinct_stems() {
        let entry = |title: &str| ManifestEntry {
            name: sanitize_name(title),
            content: "vimeo".into(),
            quality: "720p".into(),
            segments: Vec::new(),
        };
        let a = entry("東京物語");
        let b = entry("七人の侍");
        assert!(!a.name.trim().is_empty());
        assert!(!b.name.trim().is_empty());
        assert_ne!(a.file_stem(), b.file_stem());
    }

    #[test]
    fn test_descriptor_shapes() {
        let parsed: Vec<SegmentDescriptor> = serde_json::from_str(
            r#"["https://a/1.m4s",
                {"url": "https://a/2.m4s", "req_headers": "Range: bytes=0-500"},
                {"url": "https://a/3.m4s", "range": "bytes=10-20"},
                {"url": "https://a/4.m4s"}]"#,
        )
        .unwrap();

        assert_eq!(parsed[0], SegmentDescriptor::Url("https://a/1.m4s".into()));
        assert_eq!(parsed[1].to_request().byte_span(), Some("0-500"));
        assert_eq!(parsed[2].to_request().byte_span(), Some("10-20"));
        assert_eq!(parsed[3].to_request().range, None);
        assert_eq!(parsed[3].url(), "https://a/4.m4s");
    }

    #[test]
    fn test_load_manifests_expands_qualities() {
        let dir = tempfile::tempdir().unwrap();
        write_manifest(
            dir.path(),
            "b_vimeo.csv",
            "name,content,quality_urls\n\
             \"Show: One\",vimeo_staff,\"{\"\"720p\"\": [\"\"https://a/1\"\", \"\"https://a/2\"\"], \"\"1080p\"\": [\"\"https://b/1\"\"]}\"\n\
             missing,vimeo,\n\
             broken,vimeo,not-json\n",
        );
        write_manifest(
            dir.path(),
            "a_plex.csv",
            "name,content,quality_urls\nmovie,plex,\"{\"\"hd\"\": [\"\"https://p/1\"\"]}\"\n",
        );
        write_manifest(dir.path(), "notes.txt", "ignored");

        let entries = load_manifests(dir.path()).unwrap();
        assert_eq!(entries.len(), 3);

        // a_plex.csv sorts first
        assert_eq!(entries[0].content, "plex");
        assert_eq!(entries[0].quality, "hd");

        let hd = entries.iter().find(|e| e.quality == "1080p").unwrap();
        assert_eq!(hd.name, "Show One");
        assert_eq!(hd.segments.len(), 1);

        let sd = entries.iter().find(|e| e.quality == "720p").unwrap();
        assert_eq!(sd.segments.len(), 2);
        assert_eq!(sd.service(), "vimeo");
        assert_eq!(sd.file_stem(), "Show One--720p_vimeo_staff");
    }

    #[test]
    fn test_missing_dir_is_error() {
        assert!(load_manifests(Path::new("/nonexistent/edgeprobe/urls")).is_err());
    }
}
