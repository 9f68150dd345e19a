//! Publisher: writes the report artifacts of a run.

use super::{Stage, StageContext, StageFailure, StageKind};
use crate::config::is_language_tag;
use crate::persistence::atomic_write;
use crate::state::{ResearchState, StageErrorRecord, StateDelta};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};

/// Formats rendered by an external converter.
pub const CONVERTED_FORMATS: &[&str] = &["pdf", "docx"];

/// Renders Markdown into another document format.
#[async_trait]
pub trait DocumentConverter: Send + Sync {
    /// Convert `markdown` into `format`, writing `{stem}.{format}` under `dest_dir`.
    async fn convert(
        &self,
        markdown: &str,
        stem: &str,
        format: &str,
        dest_dir: &Path,
    ) -> std::io::Result<PathBuf>;
}

pub struct Publisher {
    converter: Option<Arc<dyn DocumentConverter>>,
}

impl Publisher {
    pub fn new(converter: Option<Arc<dyn DocumentConverter>>) -> Self {
        Self { converter }
    }
}

/// Directory holding a run's artifacts.
pub fn run_output_dir(output_dir: &Path, run_id: &uuid::Uuid) -> PathBuf {
    output_dir.join(run_id.to_string())
}

/// `{stem}.{ext}` inside `dir`, or `None` if the name would leave `dir`.
fn artifact_path(dir: &Path, stem: &str, ext: &str) -> Option<PathBuf> {
    let path = dir.join(format!("{stem}.{ext}"));
    (path.parent() == Some(dir)).then_some(path)
}

/// One body of text to publish: the report itself or its translation.
struct Rendition<'a> {
    stem: String,
    lang: Option<String>,
    body: &'a str,
}

impl Rendition<'_> {
    fn key(&self, format: &str) -> String {
        match &self.lang {
            Some(lang) => format!("{format}_{lang}"),
            None => format.to_string(),
        }
    }
}

#[async_trait]
impl Stage for Publisher {
    fn kind(&self) -> StageKind {
        StageKind::Publisher
    }

    async fn execute(
        &self,
        state: &ResearchState,
        ctx: &StageContext,
    ) -> Result<StateDelta, StageFailure> {
        let report = state
            .report_body()
            .ok_or_else(|| StageFailure::Fatal("no report to publish".into()))?;
        let dir = run_output_dir(&ctx.options.output_dir, &ctx.run_id);

        let markdown_path = dir.join("report.md");
        atomic_write(&markdown_path, report.as_bytes()).map_err(|e| {
            StageFailure::Fatal(format!("failed to write {}: {e}", markdown_path.display()))
        })?;
        let mut delta = StateDelta::new().with_artifact("markdown", &markdown_path);
        let mut renditions = vec![Rendition {
            stem: "report".to_string(),
            lang: None,
            body: report,
        }];

        if let Some(translated) = &state.translated_report {
            let lang = state.target_language.trim().to_lowercase();
            let stem = format!("report.{lang}");
            match artifact_path(&dir, &stem, "md").filter(|_| is_language_tag(&lang)) {
                Some(path) => {
                    match atomic_write(&path, translated.as_bytes()) {
                        Ok(()) => delta = delta.with_artifact(format!("markdown_{lang}"), &path),
                        Err(e) => {
                            warn!(run_id = %ctx.run_id, path = %path.display(), error = %e, "Translated report not written");
                            delta = delta.with_error(StageErrorRecord::warning(
                                StageKind::Publisher,
                                format!("failed to write {}: {e}", path.display()),
                            ));
                        }
                    }
                    renditions.push(Rendition {
                        stem,
                        lang: Some(lang),
                        body: translated,
                    });
                }
                None => {
                    warn!(run_id = %ctx.run_id, lang = %lang, "Refusing to publish translation under an invalid language tag");
                    delta = delta.with_error(StageErrorRecord::warning(
                        StageKind::Publisher,
                        format!("target language '{lang}' is not a language tag; translated report not published"),
                    ));
                }
            }
        }

        for format in &ctx.options.formats {
            let format = format.trim().to_lowercase();
            if format == "markdown" || format == "md" {
                continue;
            }
            if !CONVERTED_FORMATS.contains(&format.as_str()) {
                delta = delta.with_error(StageErrorRecord::warning(
                    StageKind::Publisher,
                    format!("unsupported publish format '{format}'"),
                ));
                continue;
            }
            let Some(converter) = &self.converter else {
                delta = delta.with_error(StageErrorRecord::warning(
                    StageKind::Publisher,
                    format!("no document converter available for '{format}'"),
                ));
                continue;
            };
            for rendition in &renditions {
                let key = rendition.key(&format);
                match converter
                    .convert(rendition.body, &rendition.stem, &format, &dir)
                    .await
                {
                    Ok(path) => delta = delta.with_artifact(key, path),
                    Err(e) => {
                        warn!(run_id = %ctx.run_id, artifact = %key, error = %e, "Conversion failed");
                        delta = delta.with_error(StageErrorRecord::warning(
                            StageKind::Publisher,
                            format!("{key} conversion failed: {e}"),
                        ));
                    }
                }
            }
        }

        info!(
            run_id = %ctx.run_id,
            dir = %dir.display(),
            artifacts = delta.published_artifacts.as_ref().map_or(0, |a| a.len()),
            "Report published"
        );
        Ok(delta)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RunOptions;
    use crate::providers::mock::{ScriptedLlm, ScriptedSearch, ScriptedTranslate, scripted_coordinator};
    use crate::state::Tone;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::TempDir;
    use tokio_util::sync::CancellationToken;
    use uuid::Uuid;

    struct FakeConverter {
        calls: AtomicUsize,
        fail_on: &'static str,
    }

    #[async_trait]
    impl DocumentConverter for FakeConverter {
        async fn convert(
            &self,
            markdown: &str,
            stem: &str,
            format: &str,
            dest_dir: &Path,
        ) -> std::io::Result<PathBuf> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if format == self.fail_on {
                return Err(std::io::Error::other("converter crashed"));
            }
            let path = dest_dir.join(format!("{stem}.{format}"));
            std::fs::write(&path, markdown)?;
            Ok(path)
        }
    }

    fn context(dir: &TempDir, formats: &[&str]) -> StageContext {
        let coordinator = scripted_coordinator(
            Arc::new(ScriptedLlm::always("l", "unused")),
            Arc::new(ScriptedSearch::with_hits("s", vec![])),
            Arc::new(ScriptedTranslate::echo("tr")),
        )
        .unwrap();
        let options = RunOptions {
            output_dir: dir.path().to_path_buf(),
            formats: formats.iter().map(|f| f.to_string()).collect(),
            ..RunOptions::default()
        };
        StageContext::new(
            Uuid::new_v4(),
            Arc::new(coordinator),
            Arc::new(options),
            CancellationToken::new(),
        )
    }

    fn state() -> ResearchState {
        let mut state = ResearchState::new("energy", Tone::Objective, "DE", vec![]);
        state.final_report = Some("# Energy\n".into());
        state.translated_report = Some("# Energie\n".into());
        state
    }

    #[tokio::test]
    async fn test_writes_markdown_artifacts() {
        let dir = TempDir::new().unwrap();
        let ctx = context(&dir, &["markdown"]);
        let delta = Publisher::new(None).execute(&state(), &ctx).await.unwrap();
        let artifacts = delta.published_artifacts.unwrap();
        let md = &artifacts["markdown"];
        assert_eq!(std::fs::read_to_string(md).unwrap(), "# Energy\n");
        assert!(md.starts_with(dir.path().join(ctx.run_id.to_string())));
        let de = &artifacts["markdown_de"];
        assert!(de.ends_with("report.de.md"));
        assert_eq!(std::fs::read_to_string(de).unwrap(), "# Energie\n");
        assert!(delta.errors.is_empty());
    }

    #[tokio::test]
    async fn test_converter_failure_is_not_fatal() {
        let dir = TempDir::new().unwrap();
        let ctx = context(&dir, &["pdf", "docx", "epub"]);
        let converter = Arc::new(FakeConverter {
            calls: AtomicUsize::new(0),
            fail_on: "docx",
        });
        let publisher = Publisher::new(Some(converter.clone()));
        let delta = publisher.execute(&state(), &ctx).await.unwrap();
        assert_eq!(converter.calls.load(Ordering::SeqCst), 4);
        let artifacts = delta.published_artifacts.unwrap();
        assert!(artifacts.contains_key("pdf"));
        assert!(artifacts.contains_key("pdf_de"));
        assert!(!artifacts.contains_key("docx"));
        assert!(!artifacts.contains_key("docx_de"));
        assert_eq!(delta.errors.len(), 3);
        assert!(delta.errors.iter().all(|e| !e.fatal));
    }

    #[tokio::test]
    async fn test_translation_is_converted_separately() {
        let dir = TempDir::new().unwrap();
        let ctx = context(&dir, &["pdf", "docx"]);
        let converter = Arc::new(FakeConverter {
            calls: AtomicUsize::new(0),
            fail_on: "none",
        });
        let publisher = Publisher::new(Some(converter.clone()));
        let delta = publisher.execute(&state(), &ctx).await.unwrap();
        assert_eq!(converter.calls.load(Ordering::SeqCst), 4);
        assert!(delta.errors.is_empty());

        let artifacts = delta.published_artifacts.unwrap();
        assert!(artifacts["pdf"].ends_with("report.pdf"));
        assert!(artifacts["pdf_de"].ends_with("report.de.pdf"));
        assert!(artifacts["docx_de"].ends_with("report.de.docx"));
        assert_eq!(std::fs::read_to_string(&artifacts["pdf"]).unwrap(), "# Energy\n");
        assert_eq!(std::fs::read_to_string(&artifacts["pdf_de"]).unwrap(), "# Energie\n");
    }

    #[tokio::test]
    async fn test_translation_never_leaves_run_dir() {
        let dir = TempDir::new().unwrap();
        let ctx = context(&dir, &["pdf"]);
        let converter = Arc::new(FakeConverter {
            calls: AtomicUsize::new(0),
            fail_on: "none",
        });
        let mut state = state();
        state.target_language = "/../../escaped".into();

        let delta = Publisher::new(Some(converter.clone()))
            .execute(&state, &ctx)
            .await
            .unwrap();
        assert!(!dir.path().join("escaped.md").exists());
        assert!(!dir.path().join("escaped.pdf").exists());
        assert_eq!(converter.calls.load(Ordering::SeqCst), 1);

        let artifacts = delta.published_artifacts.unwrap();
        let keys: Vec<&str> = artifacts.keys().map(String::as_str).collect();
        assert_eq!(keys, vec!["markdown", "pdf"]);
        assert_eq!(delta.errors.len(), 1);
        assert!(delta.errors[0].message.contains("not a language tag"));
    }

    #[test]
    fn test_artifact_path_stays_in_dir() {
        let dir = Path::new("/out/run");
        assert_eq!(
            artifact_path(dir, "report.de", "md"),
            Some(PathBuf::from("/out/run/report.de.md"))
        );
        assert_eq!(artifact_path(dir, "report./../../x", "md"), None);
        assert_eq!(artifact_path(dir, "a/b", "md"), None);
    }

    #[tokio::test]
    async fn test_missing_converter_warns() {
        let dir = TempDir::new().unwrap();
        let ctx = context(&dir, &["pdf"]);
        let delta = Publisher::new(None).execute(&state(), &ctx).await.unwrap();
        assert_eq!(delta.errors.len(), 1);
        assert!(delta.errors[0].message.contains("no document converter"));
    }

    #[tokio::test]
    async fn test_nothing_to_publish_is_fatal() {
        let dir = TempDir::new().unwrap();
        let ctx = context(&dir, &[]);
        let state = ResearchState::new("energy", Tone::Objective, "en", vec![]);
        let err = Publisher::new(None).execute(&state, &ctx).await.unwrap_err();
        assert!(err.is_fatal());
    }
}
