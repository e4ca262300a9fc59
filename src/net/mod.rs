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

pub mod autotls;
pub mod peek;

pub use autotls::AutoTlsListener;
pub use peek::PeekBody;

use std::{
    pin::Pin,
    task::{Context, Poll},
    time::Duration,
};

use tokio::io::{AsyncRead, ReadBuf};
use tokio::net::TcpStream;

/// Aborts a connection: linger(0) turns the close into a TCP reset so the
/// peer learns immediately instead of waiting on a half-open socket.
pub fn abort(conn: TcpStream) {
    let _ = conn.set_linger(Some(Duration::from_secs(0)));
    drop(conn);
}

/// Mirrors every byte read through it into a sniff buffer.
///
/// Used on outgoing IPP request bodies so the trace sink can capture the
/// trailing document data after the request has been streamed upstream.
pub struct TeeReader<R> {
    inner: R,
    sniffed: Vec<u8>,
}

impl<R: AsyncRead + Unpin> TeeReader<R> {
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            sniffed: Vec::new(),
        }
    }

    /// Everything read through this reader so far.
    pub fn sniffed(&self) -> &[u8] {
        &self.sniffed
    }
}

impl<R: AsyncRead + Unpin> AsyncRead for TeeReader<R> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        out: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        let me = &mut *self;
        let pre = out.filled().len();
        match Pin::new(&mut me.inner).poll_read(cx, out) {
            Poll::Ready(Ok(())) => {
                me.sniffed.extend_from_slice(&out.filled()[pre..]);
                Poll::Ready(Ok(()))
            }
            other => other,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use tokio::io::AsyncReadExt;

    use super::*;

    #[tokio::test]
    async fn tee_mirrors_all_bytes() {
        let mut tee = TeeReader::new(Cursor::new(b"ipp-head-then-pdf".to_vec()));
        let mut out = Vec::new();
        tee.read_to_end(&mut out).await.unwrap();
        assert_eq!(out, b"ipp-head-then-pdf");
        assert_eq!(tee.sniffed(), b"ipp-head-then-pdf");
    }
}
