//! Line outputs and the fan-out used to deliver them.

use crate::log::rotating::RotatingFile;
use async_trait::async_trait;
use std::io::{self, Write};
use std::sync::{Arc, Mutex};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWriteExt, BufReader, DuplexStream};
use tracing::debug;

/// Boxed byte stream, usually a child's stdout or stderr.
pub type BoxReader = Box<dyn AsyncRead + Send + Unpin>;

/// Buffer size of the pipe feeding each fan-out target.
const PIPE_CAPACITY: usize = 64 * 1024;

/// A single stream of log lines.
#[async_trait]
pub trait Output: Send + Sync {
    /// Write one line, `line` should end with a newline.
    fn write_line(&self, line: &[u8]) -> io::Result<()>;

    /// Pump `reader` line by line into this output until EOF.
    ///
    /// A trailing partial line is terminated with a newline.
    async fn read_from(&self, reader: BoxReader) -> io::Result<u64> {
        let mut reader = BufReader::new(reader);
        let mut line = Vec::new();
        let mut total = 0u64;
        loop {
            line.clear();
            let n = reader.read_until(b'\n', &mut line).await?;
            if n == 0 {
                break;
            }
            total += n as u64;
            if line.last() != Some(&b'\n') {
                line.push(b'\n');
            }
            self.write_line(&line)?;
        }
        Ok(total)
    }

    fn close(&self) -> io::Result<()> {
        Ok(())
    }
}

/// Output over any writer, with an optional line prefix and suffix.
pub struct WriterOutput<W> {
    writer: Mutex<W>,
    prefix: Vec<u8>,
    suffix: Vec<u8>,
}

impl<W: Write + Send> WriterOutput<W> {
    pub fn new(writer: W, prefix: impl Into<Vec<u8>>, suffix: impl Into<Vec<u8>>) -> Self {
        Self {
            writer: Mutex::new(writer),
            prefix: prefix.into(),
            suffix: suffix.into(),
        }
    }
}

#[async_trait]
impl<W: Write + Send> Output for WriterOutput<W> {
    fn write_line(&self, line: &[u8]) -> io::Result<()> {
        let mut writer = self
            .writer
            .lock()
            .map_err(|_| io::Error::new(io::ErrorKind::Other, "writer lock poisoned"))?;
        if self.prefix.is_empty() && self.suffix.is_empty() {
            writer.write_all(line)?;
        } else {
            let mut buf = Vec::with_capacity(self.prefix.len() + line.len() + self.suffix.len());
            buf.extend_from_slice(&self.prefix);
            buf.extend_from_slice(line);
            buf.extend_from_slice(&self.suffix);
            writer.write_all(&buf)?;
        }
        writer.flush()
    }
}

/// Output appending to a rotating log file.
pub struct FileOutput {
    file: RotatingFile,
}

impl FileOutput {
    pub fn new(file: RotatingFile) -> Self {
        Self { file }
    }
}

#[async_trait]
impl Output for FileOutput {
    fn write_line(&self, line: &[u8]) -> io::Result<()> {
        self.file.write(line).map(|_| ())
    }

    fn close(&self) -> io::Result<()> {
        self.file.close()
    }
}

/// Output delivering every line to all of its targets.
pub struct MultiOutput {
    outputs: Vec<Arc<dyn Output>>,
}

impl MultiOutput {
    pub fn new(outputs: Vec<Arc<dyn Output>>) -> Self {
        Self { outputs }
    }
}

#[async_trait]
impl Output for MultiOutput {
    fn write_line(&self, line: &[u8]) -> io::Result<()> {
        let mut result = Ok(());
        for output in &self.outputs {
            if let Err(e) = output.write_line(line) {
                if result.is_ok() {
                    result = Err(e);
                }
            }
        }
        result
    }

    /// Split `reader` into one pipe per target, each target reads its own
    /// pipe concurrently. The first target error is returned after all
    /// targets are done.
    async fn read_from(&self, mut reader: BoxReader) -> io::Result<u64> {
        let mut pipes: Vec<Option<DuplexStream>> = Vec::with_capacity(self.outputs.len());
        let mut targets = Vec::with_capacity(self.outputs.len());
        for output in &self.outputs {
            let (tx, rx) = tokio::io::duplex(PIPE_CAPACITY);
            pipes.push(Some(tx));
            targets.push(output.read_from(Box::new(rx)));
        }

        let copy = async move {
            let mut buf = vec![0u8; 8192];
            let mut total = 0u64;
            loop {
                let n = match reader.read(&mut buf).await {
                    Ok(0) => break Ok(total),
                    Ok(n) => n,
                    Err(e) => break Err(e),
                };
                total += n as u64;
                for pipe in pipes.iter_mut() {
                    if let Some(tx) = pipe {
                        if let Err(e) = tx.write_all(&buf[..n]).await {
                            // target stopped reading, keep feeding the others
                            debug!(error = %e, "fan-out target closed");
                            *pipe = None;
                        }
                    }
                }
            }
            // dropping the pipes signals EOF to every target
        };

        let (copied, results) = tokio::join!(copy, futures::future::join_all(targets));

        let total = copied?;
        for result in results {
            result?;
        }
        Ok(total)
    }

    fn close(&self) -> io::Result<()> {
        let mut result = Ok(());
        for output in &self.outputs {
            if let Err(e) = output.close() {
                if result.is_ok() {
                    result = Err(e);
                }
            }
        }
        result
    }
}
