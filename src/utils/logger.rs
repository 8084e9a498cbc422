use anyhow::Context;
use std::str::FromStr;
use tracing::Level;
use tracing_appender::rolling::{RollingFileAppender, Rotation};

/// Logging bootstrap for processes embedding the framework.
/// Level and sink are environment-driven so deployed pipelines can be
/// redirected without a rebuild.
#[derive(Debug, Clone, serde::Deserialize, serde::Serialize)]
pub struct LoggerConfig {
    pub level: String,
    pub file_dir: Option<String>,
    pub file_prefix: Option<String>,
    pub rolling: Option<String>,
    #[serde(default)]
    pub max_files: usize,
}

impl LoggerConfig {
    /// Reads MATRIX_LOG_LEVEL, MATRIX_LOG_DIR, MATRIX_LOG_PREFIX and
    /// MATRIX_LOG_ROLLING, defaulting to info-level stdout logging.
    pub fn from_env() -> Self {
        let level = std::env::var("MATRIX_LOG_LEVEL").unwrap_or_else(|_| "info".to_string());
        let file_dir = std::env::var("MATRIX_LOG_DIR").ok();
        let file_prefix = std::env::var("MATRIX_LOG_PREFIX").ok();
        let rolling = std::env::var("MATRIX_LOG_ROLLING").ok();

        Self {
            level,
            file_dir,
            file_prefix,
            rolling,
            max_files: 2,
        }
    }

    pub fn init(&self) -> anyhow::Result<Option<tracing_appender::non_blocking::WorkerGuard>> {
        let level = Level::from_str(&self.level).unwrap_or(Level::INFO);

        if let Some(dir) = self.file_dir.as_deref() {
            let prefix = self.file_prefix.as_deref().unwrap_or("matrix");

            let rotation = match self.rolling.as_deref() {
                Some("hourly") => Rotation::HOURLY,
                Some("minutely") => Rotation::MINUTELY,
                _ => Rotation::DAILY,
            };

            let appender: RollingFileAppender = RollingFileAppender::builder()
                .rotation(rotation)
                .max_log_files(self.max_files.max(1))
                .filename_prefix(prefix)
                .build(dir)
                .with_context(|| format!("failed to create rolling appender in {}", dir))?;

            let (nb, guard) = tracing_appender::non_blocking(appender);

            let _ = tracing_subscriber::fmt()
                .with_max_level(level)
                .with_writer(nb)
                .try_init();

            tracing::info!("logging to dir: {}, prefix: {}", dir, prefix);
            Ok(Some(guard))
        } else {
            let _ = tracing_subscriber::fmt().with_max_level(level).try_init();
            Ok(None)
        }
    }
}

impl Default for LoggerConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            file_dir: None,
            file_prefix: None,
            rolling: Some("daily".to_string()),
            max_files: 2,
        }
    }
}
