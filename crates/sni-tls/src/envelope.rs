//! Prelogin envelope adapter for the TLS handshake.
//!
//! While the handshake runs, outbound TLS records are split into chunks of at
//! most [`MAX_ENVELOPE_PAYLOAD`] bytes and each chunk is prefixed with an
//! 8-byte prelogin header. Inbound envelopes are stripped so the TLS engine
//! only sees record bytes. After [`HandshakeEnvelope::finish_handshake`] the
//! adapter is a transparent pass-through.

use std::cmp;
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll, ready};

use sni_protocol::{ENVELOPE_HEADER_SIZE, EnvelopeHeader, MAX_ENVELOPE_PAYLOAD};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

/// Stream adapter that frames TLS handshake bytes in prelogin envelopes.
pub struct HandshakeEnvelope<S> {
    stream: S,
    enveloping: bool,

    // Inbound envelope state
    header: [u8; ENVELOPE_HEADER_SIZE],
    header_filled: usize,
    payload_left: usize,

    // Outbound envelopes not yet accepted by the stream
    pending: Vec<u8>,
    pending_written: usize,
}

impl<S> HandshakeEnvelope<S> {
    /// Wrap a stream, enveloping until the handshake finishes.
    pub fn new(stream: S) -> Self {
        Self {
            stream,
            enveloping: true,
            header: [0u8; ENVELOPE_HEADER_SIZE],
            header_filled: 0,
            payload_left: 0,
            pending: Vec::new(),
            pending_written: 0,
        }
    }

    /// Wrap a stream that never envelopes.
    pub fn passthrough(stream: S) -> Self {
        let mut this = Self::new(stream);
        this.enveloping = false;
        this
    }

    /// Stop enveloping. Later reads and writes go straight to the stream.
    pub fn finish_handshake(&mut self) {
        if self.enveloping {
            tracing::trace!("prelogin envelope framing finished");
        }
        self.enveloping = false;
    }

    /// Whether bytes are still being enveloped.
    #[must_use]
    pub fn is_enveloping(&self) -> bool {
        self.enveloping
    }

    /// Get a reference to the underlying stream.
    pub fn get_ref(&self) -> &S {
        &self.stream
    }

    /// Get a mutable reference to the underlying stream.
    pub fn get_mut(&mut self) -> &mut S {
        &mut self.stream
    }

    /// Consume the adapter and return the underlying stream.
    pub fn into_inner(self) -> S {
        self.stream
    }

    fn envelope(&mut self, buf: &[u8]) {
        let mut chunks = buf.chunks(MAX_ENVELOPE_PAYLOAD).peekable();
        while let Some(chunk) = chunks.next() {
            let header = EnvelopeHeader {
                is_last: chunks.peek().is_none(),
                length: (chunk.len() + ENVELOPE_HEADER_SIZE) as u16,
            };
            header.encode(&mut self.pending);
            self.pending.extend_from_slice(chunk);
        }
    }
}

impl<S: AsyncWrite + Unpin> HandshakeEnvelope<S> {
    fn poll_drain(&mut self, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        while self.pending_written < self.pending.len() {
            let n = ready!(
                Pin::new(&mut self.stream).poll_write(cx, &self.pending[self.pending_written..])
            )?;
            if n == 0 {
                return Poll::Ready(Err(io::ErrorKind::WriteZero.into()));
            }
            self.pending_written += n;
        }
        self.pending.clear();
        self.pending_written = 0;
        Poll::Ready(Ok(()))
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for HandshakeEnvelope<S> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();

        if !this.enveloping {
            return Pin::new(&mut this.stream).poll_read(cx, buf);
        }

        while this.payload_left == 0 {
            while this.header_filled < ENVELOPE_HEADER_SIZE {
                let mut header_buf = ReadBuf::new(&mut this.header[this.header_filled..]);
                ready!(Pin::new(&mut this.stream).poll_read(cx, &mut header_buf))?;
                let n = header_buf.filled().len();
                if n == 0 {
                    if this.header_filled == 0 {
                        return Poll::Ready(Ok(()));
                    }
                    return Poll::Ready(Err(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        "connection closed inside a prelogin envelope header",
                    )));
                }
                this.header_filled += n;
            }

            this.header_filled = 0;
            let header = EnvelopeHeader::decode(&mut this.header.as_slice())
                .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
            this.payload_left = header.payload_length();

            tracing::trace!(
                payload = this.payload_left,
                last = header.is_last,
                "reading prelogin envelope"
            );
        }

        let want = cmp::min(this.payload_left, buf.remaining());
        if want == 0 {
            return Poll::Ready(Ok(()));
        }

        let n = {
            let mut limited = ReadBuf::new(buf.initialize_unfilled_to(want));
            ready!(Pin::new(&mut this.stream).poll_read(cx, &mut limited))?;
            limited.filled().len()
        };
        if n == 0 {
            return Poll::Ready(Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "connection closed inside a prelogin envelope payload",
            )));
        }
        buf.advance(n);
        this.payload_left -= n;

        Poll::Ready(Ok(()))
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for HandshakeEnvelope<S> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();

        if !this.enveloping {
            return Pin::new(&mut this.stream).poll_write(cx, buf);
        }

        if !this.pending.is_empty() {
            ready!(this.poll_drain(cx))?;
        }

        this.envelope(buf);
        tracing::trace!(bytes = buf.len(), "enveloping handshake write");

        // Accepted bytes are buffered; a pending drain resumes on flush.
        if let Poll::Ready(Err(e)) = this.poll_drain(cx) {
            return Poll::Ready(Err(e));
        }
        Poll::Ready(Ok(buf.len()))
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        ready!(this.poll_drain(cx))?;
        Pin::new(&mut this.stream).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        ready!(this.poll_drain(cx))?;
        Pin::new(&mut this.stream).poll_shutdown(cx)
    }
}

impl<S> std::fmt::Debug for HandshakeEnvelope<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandshakeEnvelope")
            .field("enveloping", &self.enveloping)
            .field("payload_left", &self.payload_left)
            .field("pending", &(self.pending.len() - self.pending_written))
            .finish_non_exhaustive()
    }
}
