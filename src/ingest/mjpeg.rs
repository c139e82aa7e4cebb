//! HTTP MJPEG frame source.
//!
//! Handles the two common HTTP camera modes:
//! - `multipart/x-mixed-replace` streams, split on JPEG SOI/EOI markers
//! - plain JPEG snapshot endpoints, fetched once per frame

use std::io::Read;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use log::{info, warn};

use crate::frame::Frame;
use crate::ingest::{mask_credentials, FrameSource};

const MAX_JPEG_BYTES: usize = 5 * 1024 * 1024;
const HTTP_TIMEOUT: Duration = Duration::from_secs(10);

pub struct MjpegSource {
    url: String,
    agent: ureq::Agent,
    stream: Option<HttpStream>,
}

enum HttpStream {
    Mjpeg(MjpegStream),
    Snapshot,
}

impl MjpegSource {
    pub fn new(url: &str) -> Self {
        Self {
            url: url.to_string(),
            agent: ureq::AgentBuilder::new()
                .timeout_connect(HTTP_TIMEOUT)
                .timeout_read(HTTP_TIMEOUT)
                .build(),
            stream: None,
        }
    }

    fn connect(&mut self) -> Result<()> {
        let response = self
            .agent
            .get(&self.url)
            .call()
            .context("connect to http camera")?;
        let content_type = response.header("Content-Type").unwrap_or("").to_lowercase();
        if content_type.contains("multipart") {
            self.stream = Some(HttpStream::Mjpeg(MjpegStream::new(response.into_reader())));
        } else {
            self.stream = Some(HttpStream::Snapshot);
        }
        info!(
            "MjpegSource: connected to {} ({})",
            mask_credentials(&self.url),
            if content_type.contains("multipart") {
                "mjpeg"
            } else {
                "snapshot"
            }
        );
        Ok(())
    }

    fn fetch_snapshot(&self) -> Result<Vec<u8>> {
        let response = self
            .agent
            .get(&self.url)
            .call()
            .context("fetch jpeg snapshot")?;
        let mut bytes = Vec::new();
        response
            .into_reader()
            .take(MAX_JPEG_BYTES as u64)
            .read_to_end(&mut bytes)
            .context("read jpeg snapshot")?;
        if bytes.is_empty() {
            return Err(anyhow!("empty jpeg snapshot"));
        }
        Ok(bytes)
    }
}

impl FrameSource for MjpegSource {
    fn describe(&self) -> String {
        mask_credentials(&self.url)
    }

    fn open(&mut self) -> bool {
        if self.stream.is_some() {
            return true;
        }
        match self.connect() {
            Ok(()) => true,
            Err(err) => {
                warn!(
                    "MjpegSource: open {} failed: {:#}",
                    mask_credentials(&self.url),
                    err
                );
                false
            }
        }
    }

    fn read_frame(&mut self) -> Result<Frame> {
        let jpeg = match self.stream.as_mut() {
            Some(HttpStream::Mjpeg(stream)) => stream.read_next_jpeg()?,
            Some(HttpStream::Snapshot) => self.fetch_snapshot()?,
            None => return Err(anyhow!("http source not opened")),
        };
        Frame::decode(&jpeg)
    }

    fn close(&mut self) {
        self.stream = None;
    }
}

struct MjpegStream {
    reader: Box<dyn Read + Send>,
    buffer: Vec<u8>,
}

impl MjpegStream {
    fn new(reader: Box<dyn Read + Send>) -> Self {
        Self {
            reader,
            buffer: Vec::with_capacity(64 * 1024),
        }
    }

    fn read_next_jpeg(&mut self) -> Result<Vec<u8>> {
        let mut chunk = vec![0u8; 8192];
        loop {
            if let Some((start, end)) = find_jpeg_bounds(&self.buffer) {
                let frame = self.buffer[start..end].to_vec();
                self.buffer.drain(..end);
                return Ok(frame);
            }

            let read = self.reader.read(&mut chunk).context("read mjpeg chunk")?;
            if read == 0 {
                return Err(anyhow!("mjpeg stream ended"));
            }
            self.buffer.extend_from_slice(&chunk[..read]);

            if self.buffer.len() > MAX_JPEG_BYTES * 2 {
                let keep = 2.min(self.buffer.len());
                let drain_len = self.buffer.len() - keep;
                self.buffer.drain(..drain_len);
            }
        }
    }
}

/// Byte range of the first complete JPEG (SOI..=EOI) in `buffer`.
fn find_jpeg_bounds(buffer: &[u8]) -> Option<(usize, usize)> {
    let start = buffer.windows(2).position(|w| w == [0xFF, 0xD8])?;
    let end = buffer[start + 2..]
        .windows(2)
        .position(|w| w == [0xFF, 0xD9])?;
    Some((start, start + 2 + end + 2))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn jpeg_bounds_skip_multipart_headers() {
        let mut data = b"--frame\r\nContent-Type: image/jpeg\r\n\r\n".to_vec();
        let start = data.len();
        data.extend_from_slice(&[0xFF, 0xD8, 1, 2, 3, 0xFF, 0xD9]);
        data.extend_from_slice(b"\r\n--frame");
        assert_eq!(find_jpeg_bounds(&data), Some((start, start + 7)));
        assert_eq!(find_jpeg_bounds(&[0xFF, 0xD8, 0x00]), None);
    }

    #[test]
    fn stream_yields_consecutive_frames() -> Result<()> {
        let first = Frame::filled(16, 8, [255, 0, 0]).encode_jpeg(80)?;
        let second = Frame::filled(8, 16, [0, 0, 255]).encode_jpeg(80)?;
        let mut body = Vec::new();
        for jpeg in [&first, &second] {
            body.extend_from_slice(b"--frame\r\nContent-Type: image/jpeg\r\n\r\n");
            body.extend_from_slice(jpeg);
            body.extend_from_slice(b"\r\n");
        }
        let mut stream = MjpegStream::new(Box::new(Cursor::new(body)));

        let a = Frame::decode(&stream.read_next_jpeg()?)?;
        let b = Frame::decode(&stream.read_next_jpeg()?)?;
        assert_eq!((a.width(), a.height()), (16, 8));
        assert_eq!((b.width(), b.height()), (8, 16));
        assert!(stream.read_next_jpeg().is_err());
        Ok(())
    }

    #[test]
    fn unopened_source_fails_reads() {
        let mut source = MjpegSource::new("http://127.0.0.1:9/stream");
        assert!(source.read_frame().is_err());
    }
}
