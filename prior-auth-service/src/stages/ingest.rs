use anyhow::anyhow;
use async_trait::async_trait;
use base64::{Engine as _, engine::general_purpose::STANDARD};
use image::ImageFormat;
use pa_flow::{CaseStore, Context, FlowError, Result, Stage, StageResult};
use pdf2image::{PDF, Pages};
use std::{
    io::Cursor,
    path::{Path, PathBuf},
    sync::Arc,
};
use tracing::{error, info, warn};

use crate::{
    backends::{BlobStore, is_url},
    models::PageImage,
    stages::keys::{self, context_keys, result_keys, steps},
};

const RAW_UPLOADS_DIR: &str = "raw_uploaded_files";
const PROCESSED_IMAGES_DIR: &str = "processed_images";

/// Flattens the uploaded PDFs into page images.
///
/// Raw uploads and rendered pages are both copied to the blob store under
/// `{remote_dir_base}/{case_id}/`. Skipped entirely when the context already
/// carries page images.
pub struct IngestStage {
    blob_store: Arc<dyn BlobStore>,
    remote_dir_base: String,
}

impl IngestStage {
    pub fn new(blob_store: Arc<dyn BlobStore>, remote_dir_base: impl Into<String>) -> Self {
        Self {
            blob_store,
            remote_dir_base: remote_dir_base.into(),
        }
    }

    fn remote_path(&self, case_id: &str, folder: &str, file_name: &str) -> String {
        format!(
            "{}/{}/{}/{}",
            self.remote_dir_base.trim_end_matches('/'),
            case_id,
            folder,
            file_name
        )
    }

    /// Store the original uploads; failures are logged and skipped.
    /// Names carry the 1-based upload position so equal basenames stay apart.
    async fn store_raw_files(&self, case_id: &str, files: &[String]) -> Vec<String> {
        let mut stored = Vec::new();
        for (idx, file) in files.iter().enumerate() {
            let name = format!("{}_{}", idx + 1, file_name(file));
            let remote = self.remote_path(case_id, RAW_UPLOADS_DIR, &name);
            let result = if is_url(file) {
                self.blob_store.copy(file, &remote).await
            } else {
                let path = Path::new(file);
                if path.is_dir() {
                    warn!(case_id = %case_id, path = %file, "Skipping directory in uploaded files");
                    continue;
                }
                self.blob_store.upload(path, &remote).await
            };

            match result {
                Ok(location) => stored.push(location),
                Err(e) => {
                    error!(case_id = %case_id, file = %file, error = %e, "Failed to store uploaded file")
                }
            }
        }
        stored
    }

    /// Local copy of an uploaded PDF; remote inputs are downloaded into `work_dir`
    async fn local_pdf(
        &self,
        file: &str,
        local_name: &str,
        work_dir: &Path,
    ) -> anyhow::Result<PathBuf> {
        if !is_url(file) {
            return Ok(PathBuf::from(file));
        }
        let bytes = self
            .blob_store
            .download_bytes(file)
            .await?
            .ok_or_else(|| anyhow!("Uploaded file not found: {}", file))?;
        let target = work_dir.join(local_name);
        tokio::fs::write(&target, bytes).await?;
        Ok(target)
    }

    async fn render_uploads(
        &self,
        case_id: &str,
        files: &[String],
        work_dir: &Path,
    ) -> Vec<(String, Vec<u8>)> {
        let mut pages = Vec::new();
        for (idx, file) in files.iter().enumerate() {
            if !file_name(file).to_lowercase().ends_with(".pdf") {
                warn!(case_id = %case_id, file = %file, "Skipping non-PDF upload");
                continue;
            }

            let local_name = format!("{}_{}", idx + 1, file_name(file));
            let rendered = match self.local_pdf(file, &local_name, work_dir).await {
                Ok(path) => render_pdf_pages(&path).await,
                Err(e) => Err(e),
            };
            match rendered {
                Ok(images) => {
                    let stem = format!("{}_{}", idx + 1, file_stem(file));
                    info!(case_id = %case_id, file = %file, pages = images.len(), "PDF rendered");
                    pages.extend(
                        images
                            .into_iter()
                            .enumerate()
                            .map(|(i, png)| (format!("{}_page_{}.png", stem, i + 1), png)),
                    );
                }
                Err(e) => {
                    error!(case_id = %case_id, file = %file, error = %e, "Failed to render PDF")
                }
            }
        }
        pages
    }
}

fn file_name(location: &str) -> String {
    let without_query = location.split('?').next().unwrap_or(location);
    without_query
        .rsplit(['/', '\\'])
        .next()
        .filter(|name| !name.is_empty())
        .unwrap_or("upload")
        .to_string()
}

fn file_stem(location: &str) -> String {
    let name = file_name(location);
    match name.rsplit_once('.') {
        Some((stem, _)) if !stem.is_empty() => stem.to_string(),
        _ => name,
    }
}

/// Render every page of a PDF to PNG bytes
async fn render_pdf_pages(pdf_path: &Path) -> anyhow::Result<Vec<Vec<u8>>> {
    if !tokio::fs::try_exists(pdf_path).await? {
        return Err(anyhow!("PDF file not found: {}", pdf_path.display()));
    }

    let pdf_path = pdf_path.to_path_buf();
    tokio::task::spawn_blocking(move || -> anyhow::Result<Vec<Vec<u8>>> {
        let pdf = PDF::from_file(&pdf_path).map_err(|e| anyhow!("Failed to load PDF: {}", e))?;
        let images = pdf
            .render(Pages::All, None)
            .map_err(|e| anyhow!("Failed to render PDF pages: {}", e))?;

        images
            .iter()
            .map(|image| {
                let mut buffer = Vec::new();
                image
                    .write_to(&mut Cursor::new(&mut buffer), ImageFormat::Png)
                    .map_err(|e| anyhow!("Failed to encode page: {}", e))?;
                Ok(buffer)
            })
            .collect()
    })
    .await?
}

#[async_trait]
impl Stage for IngestStage {
    fn id(&self) -> &str {
        "ingest"
    }

    async fn run(&self, context: &Context, store: &CaseStore) -> Result<StageResult> {
        let case_id = context.case_id();
        if context.contains(context_keys::PAGE_IMAGES) {
            info!(case_id = %case_id, "Page images supplied, skipping ingest");
            return Ok(StageResult::proceed("Page images supplied"));
        }

        let files: Vec<String> = context.require(context_keys::UPLOADED_FILES).await?;
        info!(case_id = %case_id, files = files.len(), "Ingesting uploaded files");

        let raw = self.store_raw_files(case_id, &files).await;
        store.log(
            keys::entry(result_keys::RAW_UPLOADED_FILES, &raw),
            None,
            steps::INGEST,
        );

        // removed when dropped at the end of the stage
        let work_dir = tempfile::tempdir()
            .map_err(|e| FlowError::StageFailed(format!("Failed to create work directory: {}", e)))?;

        let pages = self.render_uploads(case_id, &files, work_dir.path()).await;
        if pages.is_empty() {
            return Err(FlowError::StageFailed(
                "No page images could be produced from the uploaded files".to_string(),
            ));
        }

        let mut processed = Vec::new();
        for (name, png) in &pages {
            let local = work_dir.path().join(name);
            if let Err(e) = tokio::fs::write(&local, png).await {
                warn!(case_id = %case_id, page = %name, error = %e, "Failed to write page image");
                continue;
            }
            let remote = self.remote_path(case_id, PROCESSED_IMAGES_DIR, name);
            match self.blob_store.upload(&local, &remote).await {
                Ok(location) => processed.push(location),
                Err(e) => {
                    error!(case_id = %case_id, page = %name, error = %e, "Failed to upload page image")
                }
            }
        }
        store.log(
            keys::entry(result_keys::PROCESSED_IMAGES, &processed),
            None,
            steps::INGEST,
        );

        let images: Vec<PageImage> = pages
            .iter()
            .map(|(name, png)| PageImage::new(name.clone(), STANDARD.encode(png)))
            .collect();
        context.set(context_keys::PAGE_IMAGES, &images).await?;

        info!(case_id = %case_id, pages = images.len(), "Ingest completed");
        Ok(StageResult::proceed(format!(
            "{} page image(s) produced",
            images.len()
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::fakes::MemoryBlobStore;
    use pa_flow::InMemoryCaseRepository;

    fn store(case_id: &str) -> CaseStore {
        CaseStore::new(case_id, Arc::new(InMemoryCaseRepository::new()))
    }

    #[test]
    fn file_names_ignore_directories_and_queries() {
        assert_eq!(file_name("/tmp/uploads/referral.pdf"), "referral.pdf");
        assert_eq!(
            file_name("https://acct.blob.core.windows.net/c/notes.pdf?sv=1"),
            "notes.pdf"
        );
        assert_eq!(file_stem("scan.final.pdf"), "scan.final");
    }

    #[tokio::test]
    async fn supplied_images_skip_ingest() {
        let blobs = Arc::new(MemoryBlobStore::default());
        let context = Context::new("case-i");
        context
            .set(context_keys::PAGE_IMAGES, vec![PageImage::new("p1.png", "AAAA")])
            .await
            .unwrap();
        let store = store("case-i");

        IngestStage::new(blobs.clone(), "runs")
            .run(&context, &store)
            .await
            .unwrap();

        assert!(blobs.blobs.is_empty());
        assert!(store.results().is_empty());
    }

    #[tokio::test]
    async fn no_renderable_pages_fail_the_stage_after_storing_raw_files() {
        let dir = tempfile::tempdir().unwrap();
        let notes = dir.path().join("notes.txt");
        tokio::fs::write(&notes, b"plain text").await.unwrap();

        let blobs = Arc::new(MemoryBlobStore::default());
        let context = Context::new("case-j");
        context
            .set(
                context_keys::UPLOADED_FILES,
                vec![notes.to_string_lossy().to_string()],
            )
            .await
            .unwrap();
        let store = store("case-j");

        let result = IngestStage::new(blobs.clone(), "runs")
            .run(&context, &store)
            .await;

        assert!(matches!(result, Err(FlowError::StageFailed(_))));
        assert!(blobs.blobs.contains_key("runs/case-j/raw_uploaded_files/1_notes.txt"));
        assert_eq!(
            store.results()["raw_uploaded_files"][0],
            "runs/case-j/raw_uploaded_files/1_notes.txt"
        );
    }

    #[tokio::test]
    async fn uploads_sharing_a_file_name_are_stored_separately() {
        let dir = tempfile::tempdir().unwrap();
        let mut uploads = Vec::new();
        for (folder, body) in [("a", "first"), ("b", "second")] {
            tokio::fs::create_dir(dir.path().join(folder)).await.unwrap();
            let path = dir.path().join(folder).join("notes.txt");
            tokio::fs::write(&path, body).await.unwrap();
            uploads.push(path.to_string_lossy().to_string());
        }

        let blobs = Arc::new(MemoryBlobStore::default());
        let context = Context::new("case-k");
        context
            .set(context_keys::UPLOADED_FILES, &uploads)
            .await
            .unwrap();
        let store = store("case-k");

        let _ = IngestStage::new(blobs.clone(), "runs")
            .run(&context, &store)
            .await;

        let first = blobs.blobs.get("runs/case-k/raw_uploaded_files/1_notes.txt").unwrap();
        let second = blobs.blobs.get("runs/case-k/raw_uploaded_files/2_notes.txt").unwrap();
        assert_eq!(first.as_slice(), b"first");
        assert_eq!(second.as_slice(), b"second");
        assert_eq!(store.results()["raw_uploaded_files"].as_array().unwrap().len(), 2);
    }
}
