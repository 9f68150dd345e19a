//! Document conversion through an external `pandoc` binary.

use async_trait::async_trait;
use dossier_core::DocumentConverter;
use std::io;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::debug;

/// Converts Markdown by piping it into `pandoc`.
#[derive(Debug, Clone)]
pub struct PandocConverter {
    program: PathBuf,
}

impl Default for PandocConverter {
    fn default() -> Self {
        Self {
            program: PathBuf::from("pandoc"),
        }
    }
}

impl PandocConverter {
    pub fn with_program(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
        }
    }
}

#[async_trait]
impl DocumentConverter for PandocConverter {
    async fn convert(
        &self,
        markdown: &str,
        stem: &str,
        format: &str,
        dest_dir: &Path,
    ) -> io::Result<PathBuf> {
        let dest = dest_dir.join(format!("{stem}.{format}"));
        let mut child = Command::new(&self.program)
            .arg("--from=markdown")
            .arg("--output")
            .arg(&dest)
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;

        // stderr is drained by wait_with_output while stdin is still being fed.
        let stdin = child.stdin.take();
        let body = markdown.to_owned();
        let writer = tokio::spawn(async move {
            if let Some(mut stdin) = stdin {
                stdin.write_all(body.as_bytes()).await?;
                stdin.shutdown().await?;
            }
            Ok::<_, io::Error>(())
        });

        let output = child.wait_with_output().await?;
        if !output.status.success() {
            writer.abort();
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(io::Error::other(format!(
                "{} exited with {}: {}",
                self.program.display(),
                output.status,
                stderr.trim()
            )));
        }
        writer.await.map_err(io::Error::other)??;
        debug!(format, path = %dest.display(), "Converted report");
        Ok(dest)
    }
}
