use super::{BoxStream, Counters, Frame};
use crate::error::{Error, Result, TransferError};
use flate2::{Decompress, FlushDecompress, Status};
use std::{marker::PhantomData, mem, sync::Arc, time::Duration};
use tokio::{
    io::{AsyncRead, AsyncReadExt, ReadHalf},
    sync::watch,
    time,
};

/// Size of a single socket read. Also bounds how much a binary read returns.
const READ_BUFFER_LEN: usize = 2048;

const INFLATE_CHUNK: usize = 16 * 1024;

/// Longest message we are willing to buffer while looking for a delimiter.
const MAX_FRAME_LEN: usize = 1024 * 1024;

enum Inflated {
    Output,
    Consumed,
    Starved,
    StreamEnd,
}

/// Buffered reader that switches between delimited messages and raw bytes, and can inflate a
/// zlib section embedded in the stream.
///
/// All reads are cancel safe: buffered state lives in the reader, never in the future.
pub(crate) struct FrameReader<R> {
    inner: R,
    // Bytes read from the socket but not yet inflated.
    raw: Vec<u8>,
    // Bytes ready to be handed out.
    plain: Vec<u8>,
    // How many bytes at the front of `plain` came out of the inflater.
    inflated: usize,
    inflate: Option<Decompress>,
    timeout: Option<Duration>,
    counters: Arc<Counters>,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    pub fn new(inner: R, timeout: Option<Duration>, counters: Arc<Counters>) -> Self {
        Self {
            inner,
            raw: Vec::new(),
            plain: Vec::with_capacity(READ_BUFFER_LEN),
            inflated: 0,
            inflate: None,
            timeout,
            counters,
        }
    }

    /// Reads up to the next `delimiter`, which is consumed but not returned.
    pub async fn read_frame(&mut self, delimiter: u8) -> Result<Vec<u8>> {
        let mut scanned = 0;

        loop {
            if let Some(pos) = self.plain[scanned..].iter().position(|b| *b == delimiter) {
                let end = scanned + pos;
                let frame = self.plain[..end].to_vec();
                self.take(end + 1);
                return Ok(frame);
            }

            scanned = self.plain.len();

            if scanned > MAX_FRAME_LEN {
                return Err(Error::protocol("message too long"));
            }

            self.fill().await?;
        }
    }

    /// Reads whatever is available, at most `buf.len()` bytes.
    pub async fn read_binary(&mut self, buf: &mut [u8]) -> Result<usize> {
        while self.plain.is_empty() {
            self.fill().await?;
        }

        let n = buf.len().min(self.plain.len());
        buf[..n].copy_from_slice(&self.plain[..n]);
        self.take(n);

        Ok(n)
    }

    fn take(&mut self, n: usize) {
        self.plain.drain(..n);
        self.inflated = self.inflated.saturating_sub(n);
    }

    /// Starts inflating. Anything already buffered belongs to the compressed section.
    pub fn enable_zlib(&mut self) {
        if self.inflate.is_some() {
            return;
        }

        let mut pending = mem::take(&mut self.plain);
        pending.extend_from_slice(&self.raw);
        self.raw = pending;
        self.inflated = 0;
        self.inflate = Some(Decompress::new(true));
    }

    /// Reads to the end of the current compressed section. Fails if the section inflates to
    /// more than was read out of it.
    pub async fn finish_zlib(&mut self) -> Result<()> {
        loop {
            if self.inflated > 0 {
                return Err(TransferError::Overflow.into());
            }
            if self.inflate.is_none() {
                return Ok(());
            }
            self.fill().await?;
        }
    }

    async fn fill(&mut self) -> Result<()> {
        if self.inflate.is_none() {
            let mut buf = [0u8; READ_BUFFER_LEN];
            let n = self.read_socket(&mut buf).await?;
            self.plain.extend_from_slice(&buf[..n]);
            return Ok(());
        }

        let mut starved = self.raw.is_empty();

        loop {
            if starved {
                let mut buf = [0u8; READ_BUFFER_LEN];
                let n = self.read_socket(&mut buf).await?;
                self.raw.extend_from_slice(&buf[..n]);
            }

            match self.inflate_step()? {
                Inflated::Output | Inflated::StreamEnd => return Ok(()),
                Inflated::Consumed => starved = self.raw.is_empty(),
                Inflated::Starved => starved = true,
            }
        }
    }

    fn inflate_step(&mut self) -> Result<Inflated> {
        let inflate = match self.inflate.as_mut() {
            Some(inflate) => inflate,
            None => return Ok(Inflated::StreamEnd),
        };

        let before_in = inflate.total_in();
        let before_out = self.plain.len();
        self.plain.reserve(INFLATE_CHUNK);

        let status = inflate
            .decompress_vec(&self.raw, &mut self.plain, FlushDecompress::None)
            .map_err(|error| Error::Zlib(error.to_string()))?;

        let consumed = (inflate.total_in() - before_in) as usize;
        self.raw.drain(..consumed);
        self.inflated += self.plain.len() - before_out;

        if status == Status::StreamEnd {
            self.inflate = None;
            // Whatever follows the compressed section is plain again.
            let rest = mem::take(&mut self.raw);
            self.plain.extend_from_slice(&rest);
            log::trace!("Compressed section ended, {} trailing bytes", rest.len());
            return Ok(Inflated::StreamEnd);
        }

        if self.plain.len() > before_out {
            Ok(Inflated::Output)
        } else if consumed > 0 {
            Ok(Inflated::Consumed)
        } else {
            Ok(Inflated::Starved)
        }
    }

    async fn read_socket(&mut self, buf: &mut [u8]) -> Result<usize> {
        let n = match self.timeout {
            Some(timeout) => time::timeout(timeout, self.inner.read(buf))
                .await
                .map_err(|_| Error::Timeout("while reading"))??,
            None => self.inner.read(buf).await?,
        };

        if n == 0 {
            return Err(Error::Closed);
        }

        self.counters.add_read(n);
        Ok(n)
    }
}

// ----------------------------------------------------------------------------//

/// Reading half of a framed connection.
pub(crate) struct ConnReader<F> {
    frames: FrameReader<ReadHalf<BoxStream>>,
    closed: watch::Receiver<bool>,
    _frame: PhantomData<fn() -> F>,
}

impl<F: Frame> ConnReader<F> {
    pub(super) fn new(
        frames: FrameReader<ReadHalf<BoxStream>>,
        closed: watch::Receiver<bool>,
    ) -> Self {
        Self {
            frames,
            closed,
            _frame: PhantomData,
        }
    }

    pub async fn read(&mut self) -> Result<F> {
        let bytes = tokio::select! {
            result = self.frames.read_frame(F::DELIMITER) => result?,
            _ = wait_closed(&mut self.closed) => return Err(Error::Closed),
        };

        let frame = F::decode(&bytes)?;
        log::trace!("Received {:?}", frame);

        Ok(frame)
    }

    pub async fn read_binary(&mut self, buf: &mut [u8]) -> Result<usize> {
        tokio::select! {
            result = self.frames.read_binary(buf) => result,
            _ = wait_closed(&mut self.closed) => Err(Error::Closed),
        }
    }

    pub fn enable_zlib(&mut self) {
        self.frames.enable_zlib()
    }

    pub async fn finish_zlib(&mut self) -> Result<()> {
        tokio::select! {
            result = self.frames.finish_zlib() => result,
            _ = wait_closed(&mut self.closed) => Err(Error::Closed),
        }
    }

    pub fn counters(&self) -> &Arc<Counters> {
        &self.frames.counters
    }
}

/// Resolves once the connection is marked closed or every writer handle is gone.
pub(super) async fn wait_closed(closed: &mut watch::Receiver<bool>) {
    let _ = closed.wait_for(|closed| *closed).await;
}
