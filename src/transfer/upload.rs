//! Sending side of a transfer.

use super::{Query, TransferRequest};
use crate::{
    client::Inner,
    conn::{BulkWriter, ConnWriter, Counters},
    error::Result,
    link::LinkFrame,
};
use std::{
    io::{self, SeekFrom},
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};
use tokio::{
    fs,
    io::{AsyncReadExt, AsyncSeekExt},
    time::Instant,
};

const CHUNK: usize = 1024 * 1024;
const PROGRESS_INTERVAL: Duration = Duration::from_secs(1);

enum Source {
    Memory(Arc<Vec<u8>>),
    File { path: PathBuf, size: u64 },
}

impl Source {
    fn size(&self) -> u64 {
        match self {
            Self::Memory(bytes) => bytes.len() as u64,
            Self::File { size, .. } => *size,
        }
    }
}

struct SlotGuard<'a>(&'a Inner);

impl Drop for SlotGuard<'_> {
    fn drop(&mut self) {
        self.0.lock().slots.release_upload();
    }
}

fn find(inner: &Inner, query: Query) -> Option<Source> {
    let state = inner.lock();

    match query {
        Query::FileList => state.share.file_list.clone().map(Source::Memory),
        Query::Leaves(tth) => state
            .share
            .tree
            .file_by_tth(&tth)
            .map(|file| Source::Memory(Arc::new(file.leaves.to_bytes()))),
        Query::File(tth) => state.share.tree.file_by_tth(&tth).map(|file| Source::File {
            path: file.real_path.clone(),
            size: file.size,
        }),
    }
}

/// Resolves the requested range against the source size. Only files can be read partially.
fn range(request: &TransferRequest, size: u64) -> Option<u64> {
    let partial = request.start != 0 || request.length.is_some();
    if partial && !matches!(request.query, Query::File(_)) {
        return None;
    }

    let available = size.checked_sub(request.start)?;
    match request.length {
        None => Some(available),
        Some(length) if length <= available => Some(length),
        Some(_) => None,
    }
}

/// Answers one `GET`. Refusals are sent to the peer and leave the link usable.
pub(crate) async fn serve<F: LinkFrame>(
    inner: &Inner,
    writer: &ConnWriter<F>,
    request: TransferRequest,
    compression: bool,
) -> Result<()> {
    log::debug!("Peer requested {}", request.query);

    if !inner.lock().slots.try_acquire_upload() {
        log::debug!("No free upload slot for {}", request.query);
        return writer.write(&F::no_slots()).await;
    }
    let _slot = SlotGuard(inner);

    let source = match find(inner, request.query) {
        Some(source) => source,
        None => return writer.write(&F::not_available()).await,
    };

    let length = match range(&request, source.size()) {
        Some(length) => length,
        None => return writer.write(&F::error("Invalid range")).await,
    };

    let reply = TransferRequest {
        length: Some(length),
        compressed: request.compressed && compression,
        ..request
    };

    let mut bulk = writer.lock().await?;
    bulk.write(&F::snd(&reply).to_bytes()).await?;

    if reply.compressed {
        bulk.enable_zlib();
    }

    let started = Instant::now();

    match source {
        Source::Memory(bytes) => {
            let start = request.start as usize;
            bulk.write(&bytes[start..start + length as usize]).await?;
        }
        Source::File { path, .. } => {
            send_file(&mut bulk, writer.counters(), &path, request.start, length).await?;
        }
    }

    if reply.compressed {
        bulk.disable_zlib().await?;
    }
    bulk.flush().await?;

    log::debug!(
        "Sent {} ({} bytes) in {:.2}s",
        request.query,
        length,
        started.elapsed().as_secs_f64()
    );

    Ok(())
}

async fn send_file(
    bulk: &mut BulkWriter,
    counters: &Counters,
    path: &Path,
    start: u64,
    length: u64,
) -> Result<()> {
    let mut file = fs::File::open(path).await?;
    file.seek(SeekFrom::Start(start)).await?;

    let mut buffer = vec![0u8; CHUNK.min(length as usize)];
    let mut remaining = length;
    let mut last_report = Instant::now();
    counters.take_written();

    while remaining > 0 {
        let want = buffer.len().min(remaining as usize);
        let n = file.read(&mut buffer[..want]).await?;
        if n == 0 {
            return Err(io::Error::from(io::ErrorKind::UnexpectedEof).into());
        }

        bulk.write(&buffer[..n]).await?;
        remaining -= n as u64;

        let elapsed = last_report.elapsed();
        if elapsed >= PROGRESS_INTERVAL {
            log::debug!(
                "Uploading {}: {} of {} bytes, {:.0} KiB/s",
                path.display(),
                length - remaining,
                length,
                counters.take_written() as f64 / 1024.0 / elapsed.as_secs_f64()
            );
            last_report = Instant::now();
        }
    }

    Ok(())
}
