use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::sync::Arc;

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use futures::stream::{FuturesUnordered, StreamExt};
use tracing::{info, warn};

use crate::http::WebClient;
use crate::probe::{is_image_name, join_url, IMAGE_HEADER_LEN};

#[derive(Debug, Clone)]
pub struct DownloadResult {
    pub path: PathBuf,
    pub success: bool,
}

/// The m3u8-to-mp4 engine as the orchestrator sees it: one blocking call,
/// a success flag, and a final path. Implementations may fan out
/// internally but must not leak partial files into `dest` on failure.
#[async_trait]
pub trait EpisodeDownloader: Send + Sync {
    async fn download(
        &self,
        manifest_url: &str,
        dest: &Path,
        temp_dir: &Path,
    ) -> Result<DownloadResult>;
}

/// Fetches a media playlist, pulls its segments through a bounded worker
/// pool, and concatenates them into an mp4 with ffmpeg.
pub struct HlsDownloader {
    web: WebClient,
    concurrency: usize,
}

impl HlsDownloader {
    pub fn new(web: WebClient, concurrency: usize) -> Self {
        HlsDownloader {
            web,
            concurrency: concurrency.max(1),
        }
    }

    /// Chases nested manifests down to the media playlist.
    async fn media_playlist(&self, manifest_url: &str) -> Result<(String, String)> {
        let mut url = manifest_url.to_string();
        for _ in 0..5 {
            let text = self.web.fetch_text(&url).await?;
            let nested = text
                .lines()
                .map(str::trim)
                .find(|line| !line.is_empty() && !line.starts_with('#') && line.ends_with(".m3u8"));
            match nested {
                Some(next) => url = join_url(&url, next),
                None => return Ok((url, text)),
            }
        }
        bail!("manifest nesting too deep: {manifest_url}")
    }

    async fn fetch_segments(&self, base_url: &str, lines: &[String], work: &Path) -> Result<()> {
        let semaphore = Arc::new(tokio::sync::Semaphore::new(self.concurrency));
        let mut tasks = FuturesUnordered::new();
        for (index, line) in lines.iter().enumerate() {
            let permit = semaphore
                .clone()
                .acquire_owned()
                .await
                .context("semaphore closed")?;
            let web = self.web.clone();
            let url = join_url(base_url, line);
            let line = line.clone();
            let out = work.join(format!("seg_{index:05}.ts"));
            tasks.push(tokio::spawn(async move {
                let _permit = permit;
                let mut bytes = web
                    .fetch_bytes(&url)
                    .await?
                    .ok_or_else(|| anyhow!("segment rejected: {url}"))?;
                if is_image_name(&line) && bytes.len() > IMAGE_HEADER_LEN {
                    bytes.drain(..IMAGE_HEADER_LEN);
                }
                tokio::fs::write(&out, &bytes)
                    .await
                    .with_context(|| format!("write {}", out.display()))?;
                Ok::<(), anyhow::Error>(())
            }));
        }
        while let Some(joined) = tasks.next().await {
            joined.context("segment task panicked")??;
        }
        Ok(())
    }
}

#[async_trait]
impl EpisodeDownloader for HlsDownloader {
    async fn download(
        &self,
        manifest_url: &str,
        dest: &Path,
        temp_dir: &Path,
    ) -> Result<DownloadResult> {
        if manifest_url.is_empty() {
            bail!("empty manifest url");
        }
        let dest = unique_path(dest);
        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent).context("create output dir")?;
        }

        let (base_url, playlist) = self.media_playlist(manifest_url).await?;
        let segments = segment_lines(&playlist);
        if segments.is_empty() {
            bail!("no segments in playlist {base_url}");
        }
        info!(count = segments.len(), "downloading segments");

        let stem = dest
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or("episode");
        let work = temp_dir.join(format!("{}_work", sanitize_filename::sanitize(stem)));
        if work.exists() {
            fs::remove_dir_all(&work).ok();
        }
        fs::create_dir_all(&work).context("create work dir")?;

        let fetched = self.fetch_segments(&base_url, &segments, &work).await;
        let result = match fetched {
            Ok(()) => concat_segments(&work, segments.len(), &dest),
            Err(e) => Err(e),
        };

        if let Err(e) = fs::remove_dir_all(&work) {
            warn!(error = %e, "work dir cleanup failed");
        }
        result?;

        Ok(DownloadResult {
            path: dest,
            success: true,
        })
    }
}

fn segment_lines(playlist: &str) -> Vec<String> {
    playlist
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .map(str::to_string)
        .collect()
}

fn concat_segments(work: &Path, count: usize, dest: &Path) -> Result<()> {
    let list_path = work.join("file.list");
    let mut list_file = File::create(&list_path).context("create concat list")?;
    for index in 0..count {
        writeln!(list_file, "file 'seg_{index:05}.ts'")?;
    }
    drop(list_file);

    let ffmpeg = which::which("ffmpeg").map_err(|_| anyhow!("ffmpeg not found"))?;
    let status = Command::new(ffmpeg)
        .current_dir(work)
        .args(["-f", "concat", "-safe", "0", "-i", "file.list", "-c", "copy", "-y"])
        .arg(dest)
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .context("run ffmpeg concat")?;
    if !status.success() {
        bail!("ffmpeg concat failed");
    }
    Ok(())
}

/// Appends ` (n)` to the stem until the path is free, so a re-download
/// never clobbers an existing file.
fn unique_path(dest: &Path) -> PathBuf {
    if !dest.exists() {
        return dest.to_path_buf();
    }
    let stem = dest
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or("episode");
    let ext = dest.extension().and_then(|s| s.to_str()).unwrap_or("mp4");
    for n in 1.. {
        let candidate = dest.with_file_name(format!("{stem} ({n}).{ext}"));
        if !candidate.exists() {
            return candidate;
        }
    }
    unreachable!()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn segment_lines_skip_comments_and_blanks() {
        let playlist = "#EXTM3U\n#EXTINF:4.0,\nseg0.ts\n\n#EXTINF:4.0,\nseg1.jpg\n#EXT-X-ENDLIST\n";
        assert_eq!(segment_lines(playlist), vec!["seg0.ts", "seg1.jpg"]);
    }

    #[test]
    fn unique_path_leaves_free_paths_alone() {
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("ep.mp4");
        assert_eq!(unique_path(&dest), dest);
    }

    #[test]
    fn unique_path_steps_around_existing_files() {
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("ep.mp4");
        fs::write(&dest, b"x").unwrap();
        assert_eq!(unique_path(&dest), dir.path().join("ep (1).mp4"));
        fs::write(dir.path().join("ep (1).mp4"), b"x").unwrap();
        assert_eq!(unique_path(&dest), dir.path().join("ep (2).mp4"));
    }
}
