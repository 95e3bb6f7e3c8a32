//! Process-wide tracing setup, and the per-pipeline dual-sink logger
//! (REDESIGN FLAGS: "dual logger abstraction").

use std::path::Path;

use chrono::Utc;
use tokio::fs::OpenOptions;
use tokio::io::AsyncWriteExt;
use tracing_subscriber::EnvFilter;

pub fn init() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();
}

/// Fan-out sink for one pipeline run: always writes to the process-wide
/// structured logger, and writes to a per-deployment log file when one
/// could be opened. Callers never branch on "is there a file" — that
/// branch lives once, here, instead of at every log call site.
pub struct PipelineLog {
    slug: String,
    file: Option<tokio::fs::File>,
}

impl PipelineLog {
    /// Opens `<log_root>/<slug>.log` in append-create mode (redeploys
    /// append to history rather than truncating, per spec §4.6). A failure
    /// to open the file never fails the deployment: the pipeline proceeds
    /// with the structured logger only.
    pub async fn open(log_root: &Path, slug: &str) -> Self {
        let path = log_root.join(format!("{slug}.log"));
        let file = match OpenOptions::new().create(true).append(true).open(&path).await {
            Ok(f) => Some(f),
            Err(err) => {
                tracing::warn!(slug, error = %err, path = %path.display(), "could not open per-deployment log file");
                None
            }
        };
        Self {
            slug: slug.to_string(),
            file,
        }
    }

    pub async fn info(&mut self, message: &str) {
        tracing::info!(slug = %self.slug, "{message}");
        self.write_line("INFO", message).await;
    }

    pub async fn error(&mut self, message: &str) {
        tracing::error!(slug = %self.slug, "{message}");
        self.write_line("ERROR", message).await;
    }

    async fn write_line(&mut self, level: &str, message: &str) {
        let Some(file) = self.file.as_mut() else {
            return;
        };
        let line = format!("{} {level} {message}\n", Utc::now().to_rfc3339());
        if let Err(err) = file.write_all(line.as_bytes()).await {
            tracing::warn!(slug = %self.slug, error = %err, "failed writing to per-deployment log file");
        }
    }
}
