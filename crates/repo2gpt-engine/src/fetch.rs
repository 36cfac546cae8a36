//! Materialise a job's source as a local directory tree.

use std::fs::File;
use std::io::{self, BufReader};
use std::path::{Component, Path, PathBuf};

use async_trait::async_trait;
use base64::Engine as _;
use futures::StreamExt;
use repo2gpt_core::source::SourceSpec;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, instrument};

#[derive(Debug, thiserror::Error)]
pub enum FetchError {
    #[error("failed to clone repository: {0}")]
    Clone(String),

    #[error("failed to download archive: {0}")]
    Download(String),

    #[error("invalid archive: {0}")]
    Archive(String),

    #[error("invalid base64-encoded archive content: {0}")]
    Decode(String),

    #[error("unsupported source: {0}")]
    UnsupportedSource(String),

    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Progress callback for fetch sub-steps.
pub type FetchProgress<'a> = &'a (dyn Fn(&str) + Send + Sync);

/// Produces a file tree for a [`SourceSpec`] inside `workspace`, returning the tree root.
#[async_trait]
pub trait SourceFetcher: Send + Sync {
    async fn fetch(
        &self,
        source: &SourceSpec,
        workspace: &Path,
        progress: FetchProgress<'_>,
    ) -> Result<PathBuf, FetchError>;
}

/// Git via the system `git` binary, archives over HTTP or inline base64, and
/// optionally plain local directories.
pub struct DefaultFetcher {
    client: reqwest::Client,
    allow_local_sources: bool,
}

impl DefaultFetcher {
    pub fn new(allow_local_sources: bool) -> Result<Self, FetchError> {
        let client = reqwest::Client::builder()
            .user_agent(concat!("repo2gpt/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| FetchError::Download(e.to_string()))?;
        Ok(Self {
            client,
            allow_local_sources,
        })
    }

    async fn clone_repo(
        &self,
        url: &str,
        reference: Option<&str>,
        dest: &Path,
    ) -> Result<(), FetchError> {
        // Neither value may be read by git as an option.
        if url.starts_with('-') {
            return Err(FetchError::Clone(format!("invalid repository url '{url}'")));
        }
        if let Some(reference) = reference.filter(|r| r.starts_with('-')) {
            return Err(FetchError::Clone(format!("invalid ref '{reference}'")));
        }

        let dest_str = dest.to_string_lossy();
        run_git(&["clone", "--quiet", "--", url, &dest_str], None).await?;
        if let Some(reference) = reference {
            run_git(&["checkout", "--quiet", reference, "--"], Some(dest))
                .await
                .map_err(|e| FetchError::Clone(format!("unable to checkout ref '{reference}': {e}")))?;
        }
        Ok(())
    }

    async fn download(&self, url: &str, dest: &Path) -> Result<(), FetchError> {
        let response = self
            .client
            .get(url)
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(|e| FetchError::Download(e.to_string()))?;

        let mut file = tokio::fs::File::create(dest).await?;
        let mut body = response.bytes_stream();
        let mut written = 0u64;
        while let Some(chunk) = body.next().await {
            let chunk = chunk.map_err(|e| FetchError::Download(e.to_string()))?;
            written += chunk.len() as u64;
            file.write_all(&chunk).await?;
        }
        file.flush().await?;
        debug!(url, bytes = written, "archive downloaded");
        Ok(())
    }
}

#[async_trait]
impl SourceFetcher for DefaultFetcher {
    #[instrument(skip(self, workspace, progress), fields(source = source.kind()))]
    async fn fetch(
        &self,
        source: &SourceSpec,
        workspace: &Path,
        progress: FetchProgress<'_>,
    ) -> Result<PathBuf, FetchError> {
        let archives = workspace.join("archives");
        let archive = match source {
            SourceSpec::Git { url, reference } => {
                progress("Cloning repository");
                let dest = workspace.join("repository");
                self.clone_repo(url, reference.as_deref(), &dest).await?;
                return Ok(dest);
            }
            SourceSpec::Local { path } => {
                if !self.allow_local_sources {
                    return Err(FetchError::UnsupportedSource(
                        "local sources are disabled".into(),
                    ));
                }
                progress("Reading local directory");
                let root = tokio::fs::canonicalize(path).await?;
                if !root.is_dir() {
                    return Err(FetchError::UnsupportedSource(format!(
                        "{} is not a directory",
                        root.display()
                    )));
                }
                return Ok(root);
            }
            SourceSpec::ArchiveUrl { url, filename } => {
                progress("Downloading archive");
                tokio::fs::create_dir_all(&archives).await?;
                let name = match filename {
                    Some(name) => safe_file_name(name)?,
                    None => url_file_name(url),
                };
                let target = archives.join(name);
                self.download(url, &target).await?;
                target
            }
            SourceSpec::ArchiveUpload {
                filename,
                content_base64,
            } => {
                progress("Decoding uploaded archive");
                tokio::fs::create_dir_all(&archives).await?;
                let bytes = base64::engine::general_purpose::STANDARD
                    .decode(content_base64.trim())
                    .map_err(|e| FetchError::Decode(e.to_string()))?;
                let target = archives.join(safe_file_name(filename)?);
                tokio::fs::write(&target, bytes).await?;
                target
            }
        };

        progress("Extracting archive");
        let extracted = workspace.join("extracted");
        let dest = extracted.clone();
        tokio::task::spawn_blocking(move || extract_archive(&archive, &dest))
            .await
            .map_err(|e| FetchError::Archive(format!("extraction task failed: {e}")))??;
        select_root(&extracted)
    }
}

async fn run_git(args: &[&str], cwd: Option<&Path>) -> Result<(), FetchError> {
    let mut command = Command::new("git");
    command
        .args(args)
        .env("GIT_TERMINAL_PROMPT", "0")
        .kill_on_drop(true);
    if let Some(cwd) = cwd {
        command.current_dir(cwd);
    }
    let output = command
        .output()
        .await
        .map_err(|e| FetchError::Clone(format!("failed to run git: {e}")))?;
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(FetchError::Clone(stderr.trim().to_string()));
    }
    Ok(())
}

fn safe_file_name(name: &str) -> Result<String, FetchError> {
    Path::new(name)
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .filter(|n| !n.is_empty())
        .ok_or_else(|| FetchError::UnsupportedSource(format!("invalid archive filename {name:?}")))
}

fn url_file_name(url: &str) -> String {
    reqwest::Url::parse(url)
        .ok()
        .and_then(|u| {
            u.path_segments()
                .and_then(|mut segments| segments.next_back().map(str::to_string))
        })
        .filter(|n| !n.is_empty())
        .unwrap_or_else(|| "archive".to_string())
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum ArchiveFormat {
    Zip,
    Tar,
    TarGz,
}

impl ArchiveFormat {
    fn detect(path: &Path) -> Option<Self> {
        let name = path.file_name()?.to_string_lossy().to_lowercase();
        if name.ends_with(".zip") {
            Some(Self::Zip)
        } else if name.ends_with(".tar.gz") || name.ends_with(".tgz") {
            Some(Self::TarGz)
        } else if name.ends_with(".tar") {
            Some(Self::Tar)
        } else {
            None
        }
    }
}

/// Unpack `archive` into `dest`, refusing any member that would land outside it.
pub fn extract_archive(archive: &Path, dest: &Path) -> Result<(), FetchError> {
    let format = ArchiveFormat::detect(archive).ok_or_else(|| {
        FetchError::Archive(format!(
            "unsupported archive format: {}",
            archive
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default()
        ))
    })?;
    std::fs::create_dir_all(dest)?;
    let file = BufReader::new(File::open(archive)?);
    match format {
        ArchiveFormat::Zip => extract_zip(file, dest),
        ArchiveFormat::Tar => extract_tar(file, dest),
        ArchiveFormat::TarGz => extract_tar(flate2::read::GzDecoder::new(file), dest),
    }
}

fn extract_zip<R: io::Read + io::Seek>(reader: R, dest: &Path) -> Result<(), FetchError> {
    let mut zip = zip::ZipArchive::new(reader).map_err(|e| FetchError::Archive(e.to_string()))?;
    for i in 0..zip.len() {
        let mut entry = zip
            .by_index(i)
            .map_err(|e| FetchError::Archive(e.to_string()))?;
        let Some(relative) = entry.enclosed_name() else {
            return Err(FetchError::Archive(format!(
                "archive contains invalid path {:?}",
                entry.name()
            )));
        };
        let target = dest.join(relative);
        if entry.is_dir() {
            std::fs::create_dir_all(&target)?;
            continue;
        }
        if let Some(parent) = target.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut out = File::create(&target)?;
        io::copy(&mut entry, &mut out)?;
    }
    Ok(())
}

fn extract_tar<R: io::Read>(reader: R, dest: &Path) -> Result<(), FetchError> {
    let mut archive = tar::Archive::new(reader);
    let entries = archive
        .entries()
        .map_err(|e| FetchError::Archive(e.to_string()))?;
    for entry in entries {
        let mut entry = entry.map_err(|e| FetchError::Archive(e.to_string()))?;
        let path = entry
            .path()
            .map_err(|e| FetchError::Archive(e.to_string()))?
            .into_owned();
        if !is_enclosed(&path) {
            return Err(FetchError::Archive(format!(
                "archive contains invalid path {:?}",
                path.display().to_string()
            )));
        }
        let kind = entry.header().entry_type();
        if kind.is_symlink() || kind.is_hard_link() {
            debug!(path = %path.display(), "skipping link entry");
            continue;
        }
        entry
            .unpack_in(dest)
            .map_err(|e| FetchError::Archive(e.to_string()))?;
    }
    Ok(())
}

fn is_enclosed(path: &Path) -> bool {
    path.components()
        .all(|c| matches!(c, Component::Normal(_) | Component::CurDir))
}

/// An archive wrapping everything in one directory is rooted at that directory.
fn select_root(extracted: &Path) -> Result<PathBuf, FetchError> {
    let mut entries = std::fs::read_dir(extracted)?.collect::<Result<Vec<_>, _>>()?;
    if entries.len() == 1 && entries[0].file_type()?.is_dir() {
        if let Some(only) = entries.pop() {
            return Ok(only.path());
        }
    }
    Ok(extracted.to_path_buf())
}
