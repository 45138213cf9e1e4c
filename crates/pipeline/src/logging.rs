//! Per-run log files.
//!
//! Each run writes to `<log_root>/<flow_type>/<run_id>.log`, one line per
//! event as `[%Y-%m-%d %H:%M:%S] [pid] [LEVEL] message`. The binary installs
//! the file layer next to its console layer.

use crate::errors::{PipelineError, Result};
use std::fmt;
use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};
use tracing::{Event, Subscriber};
use tracing_subscriber::fmt::format::Writer;
use tracing_subscriber::fmt::{FmtContext, FormatEvent, FormatFields};
use tracing_subscriber::registry::LookupSpan;

pub fn run_log_path(log_root: &Path, flow_type: &str, run_id: &str) -> PathBuf {
    log_root.join(flow_type).join(format!("{run_id}.log"))
}

/// Create (or open for append) the log file of a run.
pub fn open_run_log(log_root: &Path, flow_type: &str, run_id: &str) -> Result<(PathBuf, File)> {
    let path = run_log_path(log_root, flow_type, run_id);
    if let Some(dir) = path.parent() {
        fs::create_dir_all(dir).map_err(|e| PipelineError::io(dir, e))?;
    }
    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(&path)
        .map_err(|e| PipelineError::io(&path, e))?;
    Ok((path, file))
}

/// Line format of run log files
#[derive(Debug, Clone, Copy, Default)]
pub struct RunLogFormat;

impl<S, N> FormatEvent<S, N> for RunLogFormat
where
    S: Subscriber + for<'a> LookupSpan<'a>,
    N: for<'a> FormatFields<'a> + 'static,
{
    fn format_event(
        &self,
        ctx: &FmtContext<'_, S, N>,
        mut writer: Writer<'_>,
        event: &Event<'_>,
    ) -> fmt::Result {
        write!(
            writer,
            "[{}] [{}] [{}] ",
            chrono::Local::now().format("%Y-%m-%d %H:%M:%S"),
            std::process::id(),
            event.metadata().level()
        )?;
        ctx.field_format().format_fields(writer.by_ref(), event)?;
        writeln!(writer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};
    use tempfile::tempdir;
    use tracing_subscriber::fmt::MakeWriter;
    use tracing_subscriber::layer::SubscriberExt;

    #[derive(Clone, Default)]
    struct Buffer(Arc<Mutex<Vec<u8>>>);

    impl std::io::Write for Buffer {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }
        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    impl<'a> MakeWriter<'a> for Buffer {
        type Writer = Buffer;
        fn make_writer(&'a self) -> Self::Writer {
            self.clone()
        }
    }

    #[test]
    fn test_log_file_location() {
        let dir = tempdir().unwrap();
        let (path, _file) = open_run_log(dir.path(), "train_flow", "abc123").unwrap();
        assert_eq!(path, dir.path().join("train_flow").join("abc123.log"));
        assert!(path.exists());
    }

    #[test]
    fn test_line_format() {
        let buffer = Buffer::default();
        let subscriber = tracing_subscriber::registry().with(
            tracing_subscriber::fmt::layer()
                .event_format(RunLogFormat)
                .with_ansi(false)
                .with_writer(buffer.clone()),
        );
        tracing::subscriber::with_default(subscriber, || {
            tracing::info!(dataset = "sales", "ingested");
        });

        let text = String::from_utf8(buffer.0.lock().unwrap().clone()).unwrap();
        let line = text.lines().next().unwrap();
        assert!(line.starts_with('['));
        assert!(line.contains(&format!("] [{}] [INFO] ", std::process::id())));
        assert!(line.contains("ingested"));
        assert!(line.contains("dataset="));
    }
}
