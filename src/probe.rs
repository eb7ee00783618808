use std::fmt;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::OnceLock;

use futures::future::BoxFuture;
use futures::FutureExt;
use regex::Regex;
use tracing::{debug, info, warn};
use url::Url;

use crate::http::WebClient;

/// Some hosts serve transport-stream segments with an image extension and a
/// fixed-size fake image header prepended, to slip past naive filters.
pub(crate) const IMAGE_HEADER_LEN: usize = 212;
const IMAGE_SUFFIXES: &[&str] = &[".jpg", ".jpeg", ".png", ".gif", ".bmp", ".webp"];

/// Nested-manifest chases deeper than this are abandoned.
const MAX_REDIRECT_DEPTH: u8 = 5;

fn resolution_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"RESOLUTION=([0-9]+x[0-9]+)").expect("resolution regex"))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Resolution {
    pub width: u32,
    pub height: u32,
}

impl Resolution {
    pub const UNKNOWN: Resolution = Resolution {
        width: 0,
        height: 0,
    };

    pub fn area(&self) -> u64 {
        u64::from(self.width) * u64::from(self.height)
    }

    pub fn parse(label: &str) -> Option<Resolution> {
        let (w, h) = label.split_once('x')?;
        Some(Resolution {
            width: w.trim().parse().ok()?,
            height: h.trim().parse().ok()?,
        })
    }
}

impl fmt::Display for Resolution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

/// A probe answer: `confirmed` is false when the resolution could not be
/// established at all, as opposed to a genuinely reported 0x0.
#[derive(Debug, Clone, Copy)]
pub struct ProbeOutcome {
    pub resolution: Resolution,
    pub confirmed: bool,
}

impl ProbeOutcome {
    fn unknown() -> Self {
        ProbeOutcome {
            resolution: Resolution::UNKNOWN,
            confirmed: false,
        }
    }

    fn confirmed(resolution: Resolution) -> Self {
        ProbeOutcome {
            resolution,
            confirmed: true,
        }
    }
}

/// Anything that can turn a manifest URL into a resolution. The extractor
/// depends on this seam so tests can substitute a canned answer.
#[async_trait::async_trait]
pub trait ResolutionProbe: Sync {
    async fn resolve(&self, manifest_url: &str) -> Resolution;
}

#[async_trait::async_trait]
impl ResolutionProbe for ManifestProbe<'_> {
    async fn resolve(&self, manifest_url: &str) -> Resolution {
        ManifestProbe::resolve(self, manifest_url).await
    }
}

/// Determines the resolution of an HLS manifest: embedded `RESOLUTION=`
/// attribute first, then a fetched sample segment inspected with ffprobe,
/// then any nested manifests the document points at. Never fails; a dead
/// end is reported as unconfirmed 0x0.
pub struct ManifestProbe<'a> {
    web: &'a WebClient,
    temp_dir: PathBuf,
}

impl<'a> ManifestProbe<'a> {
    pub fn new(web: &'a WebClient, temp_dir: &Path) -> Self {
        ManifestProbe {
            web,
            temp_dir: temp_dir.to_path_buf(),
        }
    }

    /// Resolution for a manifest URL. Empty URLs and unreachable manifests
    /// come back as unknown rather than errors.
    pub async fn resolve(&self, manifest_url: &str) -> Resolution {
        if manifest_url.is_empty() {
            return Resolution::UNKNOWN;
        }
        debug!(url = manifest_url, "querying manifest");
        let text = match self.web.fetch_text(manifest_url).await {
            Ok(text) => text,
            Err(e) => {
                info!(url = manifest_url, error = %e, "manifest fetch failed");
                return Resolution::UNKNOWN;
            }
        };
        self.from_text(manifest_url, &text, 0).await.resolution
    }

    /// Probes raw manifest text against its base URL.
    pub fn from_text<'b>(
        &'b self,
        base_url: &'b str,
        text: &'b str,
        depth: u8,
    ) -> BoxFuture<'b, ProbeOutcome> {
        async move {
            if let Some(caps) = resolution_regex().captures(text) {
                if let Some(resolution) = Resolution::parse(&caps[1]) {
                    return ProbeOutcome::confirmed(resolution);
                }
            }

            let mut redirects = Vec::new();
            let mut sampled = false;
            for line in text.lines() {
                let line = line.trim();
                if line.is_empty() || line.starts_with('#') {
                    continue;
                }
                let absolute = join_url(base_url, line);
                if line.ends_with(".m3u8") {
                    redirects.push(absolute);
                    continue;
                }
                match self.web.fetch_bytes(&absolute).await {
                    Ok(Some(bytes)) => {
                        if self.write_sample(line, bytes).await {
                            sampled = true;
                            break;
                        }
                    }
                    Ok(None) => return ProbeOutcome::unknown(),
                    Err(e) => {
                        info!(url = absolute, error = %e, "sample fetch failed");
                    }
                }
            }

            if sampled {
                if let Some(resolution) = self.ffprobe_sample().await {
                    return ProbeOutcome::confirmed(resolution);
                }
            }

            if depth < MAX_REDIRECT_DEPTH {
                for redirect in redirects {
                    let redirect_text = match self.web.fetch_text(&redirect).await {
                        Ok(text) => text,
                        Err(e) => {
                            warn!(url = redirect, error = %e, "nested manifest fetch failed");
                            continue;
                        }
                    };
                    let outcome = self.from_text(&redirect, &redirect_text, depth + 1).await;
                    if outcome.confirmed {
                        return outcome;
                    }
                }
            }
            ProbeOutcome::unknown()
        }
        .boxed()
    }

    fn sample_path(&self) -> PathBuf {
        self.temp_dir.join("probe_sample.ts")
    }

    async fn write_sample(&self, line: &str, mut bytes: Vec<u8>) -> bool {
        if is_image_name(line) && bytes.len() > IMAGE_HEADER_LEN {
            info!("stripping image header from disguised segment");
            bytes.drain(..IMAGE_HEADER_LEN);
        }
        match tokio::fs::write(self.sample_path(), &bytes).await {
            Ok(()) => true,
            Err(e) => {
                warn!(error = %e, "writing sample segment failed");
                false
            }
        }
    }

    async fn ffprobe_sample(&self) -> Option<Resolution> {
        let ffprobe = which::which("ffprobe").ok()?;
        let output = tokio::process::Command::new(ffprobe)
            .args([
                "-v",
                "error",
                "-select_streams",
                "v",
                "-show_entries",
                "stream=width,height",
                "-of",
                "json",
            ])
            .arg(self.sample_path())
            .stderr(Stdio::null())
            .output()
            .await
            .ok()?;
        if !output.status.success() {
            return None;
        }
        parse_ffprobe_output(&output.stdout)
    }
}

fn parse_ffprobe_output(stdout: &[u8]) -> Option<Resolution> {
    let value: serde_json::Value = serde_json::from_slice(stdout).ok()?;
    let stream = value.get("streams")?.get(0)?;
    Some(Resolution {
        width: stream.get("width")?.as_u64()? as u32,
        height: stream.get("height")?.as_u64()? as u32,
    })
}

pub(crate) fn is_image_name(line: &str) -> bool {
    let lower = line.to_ascii_lowercase();
    IMAGE_SUFFIXES.iter().any(|suffix| lower.ends_with(suffix))
}

pub(crate) fn join_url(base: &str, reference: &str) -> String {
    match Url::parse(base).and_then(|b| b.join(reference)) {
        Ok(url) => url.to_string(),
        Err(_) => reference.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    /// Minimal HTTP server over canned path/body pairs; unknown paths 404.
    async fn serve(routes: Vec<(&'static str, Vec<u8>)>) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            loop {
                let Ok((mut stream, _)) = listener.accept().await else {
                    break;
                };
                let routes = routes.clone();
                tokio::spawn(async move {
                    let mut buf = [0u8; 1024];
                    let n = stream.read(&mut buf).await.unwrap_or(0);
                    let request = String::from_utf8_lossy(&buf[..n]).into_owned();
                    let path = request.split_whitespace().nth(1).unwrap_or("/").to_string();
                    let response = match routes.iter().find(|(route, _)| *route == path) {
                        Some((_, body)) => {
                            let mut bytes = format!(
                                "HTTP/1.1 200 OK\r\ncontent-length: {}\r\nconnection: close\r\n\r\n",
                                body.len()
                            )
                            .into_bytes();
                            bytes.extend_from_slice(body);
                            bytes
                        }
                        None => {
                            b"HTTP/1.1 404 Not Found\r\ncontent-length: 0\r\nconnection: close\r\n\r\n"
                                .to_vec()
                        }
                    };
                    let _ = stream.write_all(&response).await;
                });
            }
        });
        format!("http://{addr}")
    }

    #[test]
    fn resolution_label_round_trip() {
        let r = Resolution::parse("1280x720").unwrap();
        assert_eq!(r.to_string(), "1280x720");
        assert_eq!(r.area(), 1280 * 720);
        assert!(Resolution::parse("junk").is_none());
        assert!(Resolution::parse("12x").is_none());
    }

    #[tokio::test]
    async fn embedded_resolution_attribute_wins_without_network() {
        // The client never gets used: an embedded attribute short-circuits.
        let web = WebClient::new(&[], 4).unwrap();
        let dir = tempfile::tempdir().unwrap();
        let probe = ManifestProbe::new(&web, dir.path());
        let text = "#EXTM3U\n#EXT-X-STREAM-INF:BANDWIDTH=1,RESOLUTION=1280x720\nhttp://unreachable.invalid/v.m3u8\n";
        let outcome = probe
            .from_text("http://unreachable.invalid/master.m3u8", text, 0)
            .await;
        assert!(outcome.confirmed);
        assert_eq!(outcome.resolution.to_string(), "1280x720");
    }

    #[tokio::test]
    async fn nested_manifests_are_chased_for_a_resolution() {
        let base = serve(vec![
            ("/master.m3u8", b"#EXTM3U\nvariants/child.m3u8\n".to_vec()),
            (
                "/variants/child.m3u8",
                b"#EXT-X-STREAM-INF:BANDWIDTH=1,RESOLUTION=1280x720\nmedia.m3u8\n".to_vec(),
            ),
        ])
        .await;
        let web = WebClient::new(&[], 4).unwrap();
        let dir = tempfile::tempdir().unwrap();
        let probe = ManifestProbe::new(&web, dir.path());
        let resolution = probe.resolve(&format!("{base}/master.m3u8")).await;
        assert_eq!(resolution.to_string(), "1280x720");
    }

    #[tokio::test]
    async fn rejected_segment_ends_the_probe_unconfirmed() {
        let base = serve(vec![(
            "/media.m3u8",
            b"#EXTM3U\n#EXTINF:4,\nseg0.ts\n".to_vec(),
        )])
        .await;
        let web = WebClient::new(&[], 4).unwrap();
        let dir = tempfile::tempdir().unwrap();
        let probe = ManifestProbe::new(&web, dir.path());
        // seg0.ts 404s; the server said no, so the probe gives up here
        let resolution = probe.resolve(&format!("{base}/media.m3u8")).await;
        assert_eq!(resolution, Resolution::UNKNOWN);
    }

    #[tokio::test]
    async fn disguised_segment_loses_its_image_header() {
        let web = WebClient::new(&[], 4).unwrap();
        let dir = tempfile::tempdir().unwrap();
        let probe = ManifestProbe::new(&web, dir.path());
        let mut bytes = vec![0u8; IMAGE_HEADER_LEN];
        bytes.extend_from_slice(b"payload");
        assert!(probe.write_sample("seg0.jpg", bytes).await);
        let written = std::fs::read(probe.sample_path()).unwrap();
        assert_eq!(written, b"payload");
    }

    #[tokio::test]
    async fn plain_segment_is_written_untouched() {
        let web = WebClient::new(&[], 4).unwrap();
        let dir = tempfile::tempdir().unwrap();
        let probe = ManifestProbe::new(&web, dir.path());
        assert!(probe.write_sample("seg0.ts", b"payload".to_vec()).await);
        let written = std::fs::read(probe.sample_path()).unwrap();
        assert_eq!(written, b"payload");
    }

    #[test]
    fn ffprobe_json_parsing() {
        let out = br#"{"streams":[{"width":1920,"height":1080}]}"#;
        let r = parse_ffprobe_output(out).unwrap();
        assert_eq!(r.to_string(), "1920x1080");
        assert!(parse_ffprobe_output(b"{}").is_none());
    }

    #[test]
    fn image_names_are_detected_case_insensitively() {
        assert!(is_image_name("segment001.JPG"));
        assert!(is_image_name("a/b/c.webp"));
        assert!(!is_image_name("segment001.ts"));
    }

    #[test]
    fn relative_references_join_against_the_manifest_url() {
        assert_eq!(
            join_url("http://h.example/a/master.m3u8", "seg.ts"),
            "http://h.example/a/seg.ts"
        );
        assert_eq!(
            join_url("http://h.example/a/master.m3u8", "http://other.example/x.ts"),
            "http://other.example/x.ts"
        );
    }
}
