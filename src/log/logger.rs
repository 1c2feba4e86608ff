//! Per-unit logger with a stdout and a stderr channel.

use crate::log::output::{FileOutput, MultiOutput, Output, WriterOutput};
use crate::log::rotating::{RotatingFile, RotatingFileOptions};
use std::fmt;
use std::io::{self, Write};
use std::sync::Arc;

/// Options for creating a [`Logger`].
pub struct LoggerOptions {
    /// Prefix of every console line
    pub console_prefix: String,
    /// Console target for the stdout channel, `None` disables it
    pub console_out: Option<Box<dyn Write + Send>>,
    /// Console target for the stderr channel, `None` disables it
    pub console_err: Option<Box<dyn Write + Send>>,
    /// Rotating files, `filename` gets `.out` and `.err` appended
    pub file: Option<RotatingFileOptions>,
}

impl Default for LoggerOptions {
    fn default() -> Self {
        Self {
            console_prefix: String::new(),
            console_out: Some(Box::new(io::stdout())),
            console_err: Some(Box::new(io::stderr())),
            file: None,
        }
    }
}

/// Line-oriented logger writing to console and rotating files at once.
#[derive(Clone)]
pub struct Logger {
    out: Arc<dyn Output>,
    err: Arc<dyn Output>,
}

impl Logger {
    pub fn new(opts: LoggerOptions) -> io::Result<Self> {
        let out = build_output(&opts.console_prefix, opts.console_out, opts.file.as_ref(), "out")?;
        let err = build_output(&opts.console_prefix, opts.console_err, opts.file.as_ref(), "err")?;
        Ok(Self { out, err })
    }

    /// Stdout channel.
    pub fn out(&self) -> Arc<dyn Output> {
        Arc::clone(&self.out)
    }

    /// Stderr channel.
    pub fn err(&self) -> Arc<dyn Output> {
        Arc::clone(&self.err)
    }

    pub fn print(&self, message: &str) {
        let _ = self.out.write_line(&line(message));
    }

    pub fn printf(&self, args: fmt::Arguments<'_>) {
        self.print(&args.to_string());
    }

    pub fn error(&self, message: &str) {
        let _ = self.err.write_line(&line(message));
    }

    pub fn errorf(&self, args: fmt::Arguments<'_>) {
        self.error(&args.to_string());
    }

    pub fn close(&self) -> io::Result<()> {
        let out = self.out.close();
        let err = self.err.close();
        out.and(err)
    }
}

fn line(message: &str) -> Vec<u8> {
    let mut buf = Vec::with_capacity(message.len() + 1);
    buf.extend_from_slice(message.as_bytes());
    if !message.ends_with('\n') {
        buf.push(b'\n');
    }
    buf
}

fn build_output(
    prefix: &str,
    console: Option<Box<dyn Write + Send>>,
    file: Option<&RotatingFileOptions>,
    stream: &str,
) -> io::Result<Arc<dyn Output>> {
    let mut outputs: Vec<Arc<dyn Output>> = Vec::new();

    if let Some(console) = console {
        outputs.push(Arc::new(WriterOutput::new(console, prefix, "")));
    }

    if let Some(file) = file {
        let mut opts = file.clone();
        opts.filename = format!("{}.{}", opts.filename, stream);
        outputs.push(Arc::new(FileOutput::new(RotatingFile::open(opts)?)));
    }

    Ok(match outputs.len() {
        1 => outputs.remove(0),
        _ => Arc::new(MultiOutput::new(outputs)),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::log::testing::CaptureBuffer;
    use tempfile::TempDir;

    #[test]
    fn test_console_prefix() {
        let buf = CaptureBuffer::default();
        let logger = Logger::new(LoggerOptions {
            console_prefix: "minit: ".to_string(),
            console_out: Some(Box::new(buf.clone())),
            console_err: Some(Box::new(buf.clone())),
            file: None,
        })
        .unwrap();

        logger.print("starting");
        logger.errorf(format_args!("failed: {}", 42));

        assert_eq!(buf.contents(), "minit: starting\nminit: failed: 42\n");
    }

    #[tokio::test]
    async fn test_console_and_files() {
        let dir = TempDir::new().unwrap();
        let buf = CaptureBuffer::default();
        let logger = Logger::new(LoggerOptions {
            console_prefix: String::new(),
            console_out: Some(Box::new(buf.clone())),
            console_err: None,
            file: Some(RotatingFileOptions {
                dir: dir.path().to_path_buf(),
                filename: "web".to_string(),
                max_file_size: 0,
                max_file_count: 5,
            }),
        })
        .unwrap();

        logger.print("hello");
        logger
            .out()
            .read_from(Box::new(&b"child line\npartial"[..]))
            .await
            .unwrap();
        logger.error("oops");
        logger.close().unwrap();

        let out = std::fs::read_to_string(dir.path().join("web.out.log")).unwrap();
        let err = std::fs::read_to_string(dir.path().join("web.err.log")).unwrap();
        assert_eq!(out, "hello\nchild line\npartial\n");
        assert_eq!(err, "oops\n");
        assert_eq!(buf.contents(), "hello\nchild line\npartial\n");
    }

    #[test]
    fn test_no_targets() {
        let logger = Logger::new(LoggerOptions {
            console_prefix: String::new(),
            console_out: None,
            console_err: None,
            file: None,
        })
        .unwrap();
        logger.print("dropped");
    }
}
