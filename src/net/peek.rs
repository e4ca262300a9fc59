/* printrelay (AGPL-3.0)

Copyright (C) 2025 - printrelay contributors

This program is free software: you can redistribute it and/or modify
it under the terms of the GNU Affero General Public License as published by
the Free Software Foundation, either version 3 of the License, or
(at your option) any later version.

This program is distributed in the hope that it will be useful,
but WITHOUT ANY WARRANTY; without even the implied warranty of
MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
GNU Affero General Public License for more details.

You should have received a copy of the GNU Affero General Public License
along with this program.  If not, see <https://www.gnu.org/licenses/>.

*/

use std::{
    pin::Pin,
    sync::atomic::{AtomicU64, Ordering},
    task::{Context, Poll},
};

use bytes::BytesMut;
use tokio::io::{AsyncRead, ReadBuf};

/// A body reader that can prefetch a prefix and then either rewind the
/// stream untouched or replace the consumed prefix with different bytes.
///
/// `PeekBody` starts in recording mode: every byte handed to the caller is
/// also appended to an internal buffer. Calling [`PeekBody::rewind`] makes
/// subsequent reads yield the recorded buffer followed by the live inner
/// stream; [`PeekBody::replace`] does the same but with caller-supplied
/// bytes in place of the recorded prefix. Call one of the two as soon as
/// prefetching is done, since recording grows the buffer without bound.
///
/// The proxy uses this to pull an IPP operation message off an HTTP body,
/// re-encode it with translated URLs, splice the re-encoded bytes back in
/// front of the still-unread document data, and stream the rest untouched.
pub struct PeekBody<R> {
    inner: R,
    buf: BytesMut,
    recording: bool,
    count: AtomicU64,
}

impl<R: AsyncRead + Unpin> PeekBody<R> {
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            buf: BytesMut::new(),
            recording: true,
            count: AtomicU64::new(0),
        }
    }

    /// Total bytes returned by all preceding reads. Unaffected by
    /// `rewind`/`replace`; observable from concurrent tasks.
    pub fn count(&self) -> u64 {
        self.count.load(Ordering::Relaxed)
    }

    /// The wrapped reader.
    pub fn get_ref(&self) -> &R {
        &self.inner
    }

    /// The recorded prefix. Only meaningful while still recording; later
    /// reads, `rewind` and `replace` invalidate the content.
    pub fn bytes(&self) -> &[u8] {
        &self.buf
    }

    /// Rewinds the stream to the beginning: the recorded bytes become
    /// readable again, followed by the live inner stream. Stops recording.
    pub fn rewind(&mut self) {
        self.recording = false;
    }

    /// Like [`PeekBody::rewind`], but the consumed prefix is replaced with
    /// `data`.
    pub fn replace(&mut self, data: &[u8]) {
        self.buf.clear();
        self.buf.extend_from_slice(data);
        self.recording = false;
    }

    fn add_count(&self, n: usize) {
        if n > 0 {
            self.count.fetch_add(n as u64, Ordering::Relaxed);
        }
    }
}

impl<R: AsyncRead + Unpin> AsyncRead for PeekBody<R> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        out: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        let me = &mut *self;

        if me.recording {
            let pre = out.filled().len();
            match Pin::new(&mut me.inner).poll_read(cx, out) {
                Poll::Ready(Ok(())) => {
                    let n = out.filled().len() - pre;
                    me.buf.extend_from_slice(&out.filled()[pre..]);
                    me.add_count(n);
                    Poll::Ready(Ok(()))
                }
                other => other,
            }
        } else if !me.buf.is_empty() {
            let n = me.buf.len().min(out.remaining());
            let chunk = me.buf.split_to(n);
            out.put_slice(&chunk);
            me.add_count(n);
            Poll::Ready(Ok(()))
        } else {
            let pre = out.filled().len();
            match Pin::new(&mut me.inner).poll_read(cx, out) {
                Poll::Ready(Ok(())) => {
                    me.add_count(out.filled().len() - pre);
                    Poll::Ready(Ok(()))
                }
                other => other,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use tokio::io::AsyncReadExt;

    use super::*;

    fn cursor(data: &'static [u8]) -> Cursor<&'static [u8]> {
        Cursor::new(data)
    }

    #[tokio::test]
    async fn rewind_restores_full_body() {
        // Property: k reads, rewind, drain == original body.
        let mut p = PeekBody::new(cursor(b"hello world"));
        let mut head = [0u8; 5];
        p.read_exact(&mut head).await.unwrap();
        assert_eq!(&head, b"hello");
        assert_eq!(p.bytes(), b"hello");

        p.rewind();
        let mut out = Vec::new();
        p.read_to_end(&mut out).await.unwrap();
        assert_eq!(out, b"hello world");
    }

    #[tokio::test]
    async fn replace_splices_new_prefix() {
        // Property: read k, replace(R), drain == R ++ body[k..].
        let mut p = PeekBody::new(cursor(b"abcdef"));
        let mut head = [0u8; 3];
        p.read_exact(&mut head).await.unwrap();

        p.replace(b"XYZW");
        let mut out = Vec::new();
        p.read_to_end(&mut out).await.unwrap();
        assert_eq!(out, b"XYZWdef");
    }

    #[tokio::test]
    async fn count_is_monotonic_across_modes() {
        let mut p = PeekBody::new(cursor(b"abcdef"));
        let mut head = [0u8; 2];
        p.read_exact(&mut head).await.unwrap();
        assert_eq!(p.count(), 2);

        p.replace(b"12345");
        assert_eq!(p.count(), 2);

        let mut out = Vec::new();
        p.read_to_end(&mut out).await.unwrap();
        assert_eq!(out, b"12345cdef");
        assert_eq!(p.count(), 2 + 9);
    }

    #[tokio::test]
    async fn rewind_without_reads_is_passthrough() {
        let mut p = PeekBody::new(cursor(b"xyz"));
        p.rewind();
        let mut out = Vec::new();
        p.read_to_end(&mut out).await.unwrap();
        assert_eq!(out, b"xyz");
        assert_eq!(p.count(), 3);
    }

    #[tokio::test]
    async fn replace_with_empty_drops_prefix() {
        let mut p = PeekBody::new(cursor(b"abcdef"));
        let mut head = [0u8; 4];
        p.read_exact(&mut head).await.unwrap();
        p.replace(b"");
        let mut out = Vec::new();
        p.read_to_end(&mut out).await.unwrap();
        assert_eq!(out, b"ef");
    }
}
