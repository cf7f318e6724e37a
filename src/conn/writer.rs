use super::{reader::wait_closed, BoxStream, Counters, Frame};
use crate::error::{Error, Result};
use flate2::{Compress, Compression, FlushCompress, Status};
use std::{marker::PhantomData, sync::Arc, time::Duration};
use tokio::{
    io::{AsyncWrite, AsyncWriteExt, WriteHalf},
    sync::{mpsc, oneshot, watch, Mutex, OwnedMutexGuard},
    task, time,
};

const DEFLATE_CHUNK: usize = 32 * 1024;

/// Writer that can deflate a section of the outgoing stream.
pub(crate) struct FrameWriter<W> {
    inner: W,
    deflate: Option<Compress>,
    timeout: Option<Duration>,
    counters: Arc<Counters>,
}

impl<W: AsyncWrite + Unpin> FrameWriter<W> {
    pub fn new(inner: W, timeout: Option<Duration>, counters: Arc<Counters>) -> Self {
        Self {
            inner,
            deflate: None,
            timeout,
            counters,
        }
    }

    pub async fn write(&mut self, bytes: &[u8]) -> Result<()> {
        if self.deflate.is_none() {
            return self.write_raw(bytes).await;
        }

        let out = self.deflate(bytes, FlushCompress::None)?;
        self.write_raw(&out).await
    }

    /// Pushes everything written so far to the peer, sync-flushing the compressor if active.
    pub async fn flush(&mut self) -> Result<()> {
        if self.deflate.is_some() {
            let out = self.deflate(&[], FlushCompress::Sync)?;
            self.write_raw(&out).await?;
        }

        match self.timeout {
            Some(timeout) => time::timeout(timeout, self.inner.flush())
                .await
                .map_err(|_| Error::Timeout("while writing"))??,
            None => self.inner.flush().await?,
        }

        Ok(())
    }

    pub fn enable_zlib(&mut self) {
        if self.deflate.is_none() {
            self.deflate = Some(Compress::new(Compression::default(), true));
        }
    }

    /// Finishes the compressed section. Following writes are plain.
    pub async fn disable_zlib(&mut self) -> Result<()> {
        if self.deflate.is_none() {
            return Ok(());
        }

        let out = self.deflate(&[], FlushCompress::Finish)?;
        self.deflate = None;
        self.write_raw(&out).await
    }

    pub async fn shutdown(&mut self) {
        if let Err(error) = self.inner.shutdown().await {
            log::trace!("Failed to shut down connection: {}", error);
        }
    }

    fn deflate(&mut self, mut input: &[u8], flush: FlushCompress) -> Result<Vec<u8>> {
        let deflate = match self.deflate.as_mut() {
            Some(deflate) => deflate,
            None => return Ok(input.to_vec()),
        };

        let mut out = Vec::new();

        loop {
            out.reserve(DEFLATE_CHUNK);

            let before = deflate.total_in();
            let status = deflate
                .compress_vec(input, &mut out, flush)
                .map_err(|error| Error::Zlib(error.to_string()))?;
            input = &input[(deflate.total_in() - before) as usize..];

            let room_left = out.len() < out.capacity();

            if matches!(flush, FlushCompress::Finish) {
                if status == Status::StreamEnd {
                    break;
                }
            } else if input.is_empty() && room_left {
                break;
            }
        }

        Ok(out)
    }

    async fn write_raw(&mut self, bytes: &[u8]) -> Result<()> {
        if bytes.is_empty() {
            return Ok(());
        }

        match self.timeout {
            Some(timeout) => time::timeout(timeout, self.inner.write_all(bytes))
                .await
                .map_err(|_| Error::Timeout("while writing"))??,
            None => self.inner.write_all(bytes).await?,
        }

        self.counters.add_written(bytes.len());
        Ok(())
    }
}

// ----------------------------------------------------------------------------//

type SharedWriter = Arc<Mutex<FrameWriter<WriteHalf<BoxStream>>>>;

/// Exclusive access to the writing half, for bulk transfers.
pub(crate) type BulkWriter = OwnedMutexGuard<FrameWriter<WriteHalf<BoxStream>>>;

enum Queued {
    Frame(Vec<u8>),
    Barrier(oneshot::Sender<()>),
}

/// Cloneable writing half of a framed connection.
pub(crate) struct ConnWriter<F> {
    shared: SharedWriter,
    queue: mpsc::UnboundedSender<Queued>,
    closed: Arc<watch::Sender<bool>>,
    counters: Arc<Counters>,
    _frame: PhantomData<fn(F)>,
}

impl<F> Clone for ConnWriter<F> {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
            queue: self.queue.clone(),
            closed: self.closed.clone(),
            counters: self.counters.clone(),
            _frame: PhantomData,
        }
    }
}

impl<F: Frame> ConnWriter<F> {
    pub(super) fn spawn(
        writer: FrameWriter<WriteHalf<BoxStream>>,
        closed_tx: watch::Sender<bool>,
        closed_rx: watch::Receiver<bool>,
    ) -> Self {
        let counters = writer.counters.clone();
        let shared = Arc::new(Mutex::new(writer));
        let closed = Arc::new(closed_tx);
        let (queue, queue_rx) = mpsc::unbounded_channel();

        task::spawn(run_queue(
            shared.clone(),
            queue_rx,
            closed.clone(),
            closed_rx,
        ));

        Self {
            shared,
            queue,
            closed,
            counters,
            _frame: PhantomData,
        }
    }

    /// Queues a message. Never blocks; messages sent after close are dropped.
    pub fn send(&self, frame: &F) {
        log::trace!("Sending {:?}", frame);

        if self.queue.send(Queued::Frame(frame.to_bytes())).is_err() {
            log::debug!("Dropping {:?}, connection is closed", frame);
        }
    }

    /// Writes a message after everything queued before it, and waits until it is flushed.
    pub async fn write(&self, frame: &F) -> Result<()> {
        log::trace!("Writing {:?}", frame);

        let mut writer = self.lock().await?;
        writer.write(&frame.to_bytes()).await?;
        writer.flush().await
    }

    /// Waits for the queue to drain, then takes the writer for exclusive use.
    pub async fn lock(&self) -> Result<BulkWriter> {
        let (tx, rx) = oneshot::channel();
        self.queue
            .send(Queued::Barrier(tx))
            .map_err(|_| Error::Closed)?;
        rx.await.map_err(|_| Error::Closed)?;

        if self.is_closed() {
            return Err(Error::Closed);
        }

        Ok(self.shared.clone().lock_owned().await)
    }

    pub fn close(&self) {
        self.closed.send_replace(true);
    }

    pub fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }

    /// Resolves once the connection is closed.
    pub async fn closed(&self) {
        wait_closed(&mut self.closed.subscribe()).await
    }

    pub fn counters(&self) -> &Arc<Counters> {
        &self.counters
    }
}

async fn run_queue(
    shared: SharedWriter,
    mut queue: mpsc::UnboundedReceiver<Queued>,
    closed: Arc<watch::Sender<bool>>,
    mut closed_rx: watch::Receiver<bool>,
) {
    loop {
        let item = tokio::select! {
            item = queue.recv() => item,
            _ = wait_closed(&mut closed_rx) => None,
        };

        let item = match item {
            Some(item) => item,
            None => break,
        };

        match item {
            Queued::Frame(bytes) => {
                let mut writer = shared.lock().await;

                let result = match writer.write(&bytes).await {
                    Ok(()) => writer.flush().await,
                    Err(error) => Err(error),
                };

                if let Err(error) = result {
                    log::debug!("Failed to write queued message: {}", error);
                    closed.send_replace(true);
                    break;
                }
            }
            Queued::Barrier(tx) => {
                tx.send(()).ok();
            }
        }
    }

    closed.send_replace(true);
    shared.lock().await.shutdown().await;
}
