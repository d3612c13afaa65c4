//! Export-to-import stream pump
//!
//! Moves bytes from an export stream into an import stream, decoding zstd
//! in-process when the producer compressed, optionally through a bounded
//! queue that decouples the producer's rate from the consumer's. Stream
//! failures are collected, not raised: whether a transfer worked is decided
//! afterwards by looking at the target.

use crate::progress::ProgressReporter;
use async_compression::tokio::bufread::ZstdDecoder;
use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;
use tracing::{debug, warn};
use zreplica_types::{BufferSize, ByteSink, ByteSource, Error};

/// How the stream is shaped between export and import
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PipelineOptions {
    /// The export stream is zstd-compressed
    pub compressed: bool,
    /// Decoupling buffer capacity
    pub buffer: BufferSize,
}

/// What the pump observed
#[derive(Debug, Default)]
pub struct PipelineStats {
    /// Bytes written into the import
    pub bytes: u64,
    /// Stream and process failures, in the order they were seen
    pub errors: Vec<Error>,
}

type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;

/// Pump `source` into `sink` until the export ends or either side fails
pub async fn run_pipeline(
    source: ByteSource,
    sink: ByteSink,
    options: PipelineOptions,
    progress: &ProgressReporter,
) -> PipelineStats {
    let ByteSource {
        reader,
        handle: producer,
    } = source;
    let ByteSink {
        mut writer,
        handle: consumer,
    } = sink;

    let reader: BoxedReader = if options.compressed {
        let mut decoder = ZstdDecoder::new(BufReader::new(reader));
        decoder.multiple_members(true);
        Box::new(decoder)
    } else {
        reader
    };

    let (bytes, stream_error) = if options.buffer.is_enabled() {
        buffered_copy(reader, &mut writer, options.buffer, progress).await
    } else {
        direct_copy(reader, &mut writer, progress).await
    };

    let mut stats = PipelineStats {
        bytes,
        errors: stream_error.into_iter().collect(),
    };

    if let Err(e) = writer.shutdown().await {
        debug!("Closing import stream failed: {}", e);
    }
    drop(writer);

    for (side, handle) in [("export", producer), ("import", consumer)] {
        if let Err(e) = handle.finish().await {
            warn!("{} process failed: {}", side, e);
            stats.errors.push(e);
        }
    }

    debug!(bytes = stats.bytes, errors = stats.errors.len(), "Pipeline closed");
    stats
}

async fn direct_copy(
    mut reader: BoxedReader,
    writer: &mut (dyn AsyncWrite + Send + Unpin),
    progress: &ProgressReporter,
) -> (u64, Option<Error>) {
    let mut buffer = vec![0u8; BufferSize::CHUNK];
    let mut total_bytes = 0u64;

    loop {
        let bytes_read = match reader.read(&mut buffer).await {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) => return (total_bytes, Some(stream_error("reading export stream", e))),
        };

        if let Err(e) = writer.write_all(&buffer[..bytes_read]).await {
            return (total_bytes, Some(stream_error("writing import stream", e)));
        }
        total_bytes += bytes_read as u64;
        progress.record_bytes(total_bytes).await;
    }

    (total_bytes, None)
}

async fn buffered_copy(
    reader: BoxedReader,
    writer: &mut (dyn AsyncWrite + Send + Unpin),
    buffer: BufferSize,
    progress: &ProgressReporter,
) -> (u64, Option<Error>) {
    let (tx, mut rx) = mpsc::channel::<std::io::Result<Bytes>>(buffer.chunks());

    let reader_task = tokio::spawn(async move {
        let mut reader = reader;
        loop {
            let mut chunk = BytesMut::with_capacity(BufferSize::CHUNK);
            match reader.read_buf(&mut chunk).await {
                Ok(0) => break,
                Ok(_) => {
                    if tx.send(Ok(chunk.freeze())).await.is_err() {
                        break;
                    }
                }
                Err(e) => {
                    let _ = tx.send(Err(e)).await;
                    break;
                }
            }
        }
    });

    let mut total_bytes = 0u64;
    let mut failure = None;
    while let Some(item) = rx.recv().await {
        let chunk = match item {
            Ok(chunk) => chunk,
            Err(e) => {
                failure = Some(stream_error("reading export stream", e));
                break;
            }
        };
        if let Err(e) = writer.write_all(&chunk).await {
            failure = Some(stream_error("writing import stream", e));
            break;
        }
        total_bytes += chunk.len() as u64;
        progress.record_bytes(total_bytes).await;
    }

    drop(rx);
    if let Err(e) = reader_task.await {
        warn!("Buffer reader task ended abnormally: {}", e);
    }

    (total_bytes, failure)
}

fn stream_error(context: &str, error: std::io::Error) -> Error {
    Error::Io {
        message: format!("{}: {}", context, error),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_compression::tokio::write::ZstdEncoder;
    use async_trait::async_trait;
    use rstest::rstest;
    use std::time::Duration;
    use tokio::io::{duplex, AsyncReadExt};
    use zreplica_types::{Result, RunId, StreamHandle};

    struct Finished(Result<()>);

    #[async_trait]
    impl StreamHandle for Finished {
        async fn finish(self: Box<Self>) -> Result<()> {
            self.0
        }
    }

    fn payload() -> Vec<u8> {
        (0..300_000u32).map(|i| (i % 251) as u8).collect()
    }

    async fn compress(data: &[u8]) -> Vec<u8> {
        let mut encoder = ZstdEncoder::new(Vec::new());
        encoder.write_all(data).await.unwrap();
        encoder.shutdown().await.unwrap();
        encoder.into_inner()
    }

    fn reporter() -> ProgressReporter {
        ProgressReporter::new(RunId::new_v4(), Duration::from_secs(60))
    }

    #[rstest]
    #[case(false, 0)]
    #[case(false, BufferSize::CHUNK * 2)]
    #[case(true, 0)]
    #[case(true, BufferSize::CHUNK * 4)]
    #[tokio::test]
    async fn test_bytes_arrive_intact(#[case] compressed: bool, #[case] buffer: usize) {
        let data = payload();
        let wire = if compressed { compress(&data).await } else { data.clone() };

        let (import_end, mut received) = duplex(1024 * 1024);
        let source = ByteSource {
            reader: Box::new(std::io::Cursor::new(wire)),
            handle: Box::new(Finished(Ok(()))),
        };
        let sink = ByteSink {
            writer: Box::new(import_end),
            handle: Box::new(Finished(Ok(()))),
        };
        let options = PipelineOptions {
            compressed,
            buffer: BufferSize::new(buffer).unwrap(),
        };

        let stats = run_pipeline(source, sink, options, &reporter()).await;
        assert!(stats.errors.is_empty(), "{:?}", stats.errors);
        assert_eq!(stats.bytes, data.len() as u64);

        let mut landed = Vec::new();
        received.read_to_end(&mut landed).await.unwrap();
        assert_eq!(landed, data);
    }

    #[tokio::test]
    async fn test_process_failures_are_collected() {
        let (import_end, _received) = duplex(1024 * 1024);
        let source = ByteSource {
            reader: Box::new(std::io::Cursor::new(b"partial".to_vec())),
            handle: Box::new(Finished(Err(Error::command("zfs send", Some(1), "broken")))),
        };
        let sink = ByteSink {
            writer: Box::new(import_end),
            handle: Box::new(Finished(Err(Error::command("zfs receive", Some(1), "bad stream")))),
        };

        let stats = run_pipeline(source, sink, PipelineOptions::default(), &reporter()).await;
        assert_eq!(stats.bytes, 7);
        assert_eq!(stats.errors.len(), 2);
    }

    #[rstest]
    #[case(0)]
    #[case(BufferSize::CHUNK)]
    #[tokio::test]
    async fn test_export_read_error_ends_the_pump(#[case] buffer: usize) {
        let export = tokio_test::io::Builder::new()
            .read(b"head")
            .read_error(std::io::Error::new(std::io::ErrorKind::BrokenPipe, "ssh closed"))
            .build();
        let (import_end, mut received) = duplex(1024);
        let source = ByteSource {
            reader: Box::new(export),
            handle: Box::new(Finished(Ok(()))),
        };
        let sink = ByteSink {
            writer: Box::new(import_end),
            handle: Box::new(Finished(Ok(()))),
        };
        let options = PipelineOptions {
            compressed: false,
            buffer: BufferSize::new(buffer).unwrap(),
        };

        let stats = run_pipeline(source, sink, options, &reporter()).await;
        assert_eq!(stats.bytes, 4);
        assert_eq!(stats.errors.len(), 1);
        assert!(stats.errors[0].to_string().contains("ssh closed"));

        let mut landed = Vec::new();
        received.read_to_end(&mut landed).await.unwrap();
        assert_eq!(landed, b"head");
    }

    #[tokio::test]
    async fn test_closed_import_stops_the_pump() {
        let (import_end, received) = duplex(64);
        drop(received);
        let source = ByteSource {
            reader: Box::new(std::io::Cursor::new(payload())),
            handle: Box::new(Finished(Ok(()))),
        };
        let sink = ByteSink {
            writer: Box::new(import_end),
            handle: Box::new(Finished(Ok(()))),
        };

        let options = PipelineOptions {
            compressed: false,
            buffer: BufferSize::new(BufferSize::CHUNK).unwrap(),
        };
        let stats = run_pipeline(source, sink, options, &reporter()).await;
        assert_eq!(stats.errors.len(), 1);
        assert!(stats.bytes < payload().len() as u64);
    }
}
