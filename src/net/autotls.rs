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

use std::{collections::VecDeque, io, net::SocketAddr, sync::Arc, sync::Mutex};

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

use crate::net::abort;
use crate::utils::{ProxyError, ProxyResult};

/// One half of an auto-TLS listener pair.
///
/// [`AutoTlsListener::new`] wraps a TCP listener and returns two logical
/// listeners sharing its address. Every accepted socket is classified by
/// peeking its first byte: a TLS handshake record (`0x16`) routes it to the
/// encrypted half, anything else to the plain half. The bytes stay in the
/// kernel buffer, so the TLS library or HTTP parser downstream sees the
/// stream from its very first byte.
///
/// Closing either half closes the parent listener, aborts every pending and
/// queued socket and unblocks all waiting accepts with
/// [`ProxyError::ListenerClosed`].
#[derive(Clone)]
pub struct AutoTlsListener {
    inner: Arc<Inner>,
    encrypted: bool,
}

struct Inner {
    /// Parent listener. Taken out (and thereby closed) on close(). Only the
    /// single accepter task holds this lock for longer than a queue poke.
    parent: tokio::sync::Mutex<Option<TcpListener>>,
    addr: SocketAddr,
    state: Mutex<State>,
    /// Wakes accept() waiters when a socket was queued or the accepter
    /// role became free.
    queue_wakeup: Notify,
    /// Wakes close() when the last pending detection finished.
    drained: Notify,
    cancel: CancellationToken,
}

struct State {
    closed: bool,
    /// At most one task blocks in parent.accept() at any time; everyone
    /// else waits on `queue_wakeup`.
    have_accepter: bool,
    /// Sockets currently undergoing first-byte detection.
    pending: usize,
    plain: VecDeque<TcpStream>,
    encrypted: VecDeque<TcpStream>,
}

impl AutoTlsListener {
    /// Wraps `parent` and returns the `(plain, encrypted)` listener pair.
    pub fn new(parent: TcpListener) -> io::Result<(AutoTlsListener, AutoTlsListener)> {
        let addr = parent.local_addr()?;
        let inner = Arc::new(Inner {
            parent: tokio::sync::Mutex::new(Some(parent)),
            addr,
            state: Mutex::new(State {
                closed: false,
                have_accepter: false,
                pending: 0,
                plain: VecDeque::new(),
                encrypted: VecDeque::new(),
            }),
            queue_wakeup: Notify::new(),
            drained: Notify::new(),
            cancel: CancellationToken::new(),
        });

        Ok((
            AutoTlsListener {
                inner: inner.clone(),
                encrypted: false,
            },
            AutoTlsListener {
                inner,
                encrypted: true,
            },
        ))
    }

    /// The parent listener's address, shared by both halves.
    pub fn local_addr(&self) -> SocketAddr {
        self.inner.addr
    }

    /// Waits for the next connection classified for this half.
    ///
    /// All connections are pulled from the shared parent; whichever caller
    /// finds the accepter role free takes it, classifies the socket and
    /// queues it for the matching half. Dropping an `accept()` future
    /// mid-flight is only safe once the listener is closing.
    pub async fn accept(&self) -> ProxyResult<TcpStream> {
        loop {
            // Register for wakeups before inspecting state, so a notify
            // between the check and the await cannot be missed.
            let wakeup = self.inner.queue_wakeup.notified();
            tokio::pin!(wakeup);
            wakeup.as_mut().enable();

            match self.poll_queue() {
                QueuePoll::Ready(conn) => return Ok(conn),
                QueuePoll::Closed => return Err(ProxyError::ListenerClosed),
                QueuePoll::Wait => {
                    wakeup.await;
                    continue;
                }
                QueuePoll::BecomeAccepter => {}
            }

            let guard = AccepterGuard { inner: &self.inner };
            let res = self.accept_and_sort().await;
            drop(guard);

            // Ok means a socket went into one of the queues; loop back and
            // race for it. Errors terminate this accept only; other waiters
            // elect a new accepter.
            res?;
        }
    }

    /// Synchronous state check for `accept()`, kept out of the async body
    /// so the `MutexGuard` never has to cross an await point.
    fn poll_queue(&self) -> QueuePoll {
        let mut st = self.inner.state.lock().unwrap();
        let queue = if self.encrypted {
            &mut st.encrypted
        } else {
            &mut st.plain
        };
        if let Some(conn) = queue.pop_front() {
            return QueuePoll::Ready(conn);
        }
        if st.closed {
            return QueuePoll::Closed;
        }
        if st.have_accepter {
            return QueuePoll::Wait;
        }
        st.have_accepter = true;
        QueuePoll::BecomeAccepter
    }

    /// Accepts one connection from the parent, runs first-byte detection
    /// and pushes the socket into the matching queue.
    async fn accept_and_sort(&self) -> ProxyResult<()> {
        let inner = &*self.inner;

        let conn = {
            let parent = inner.parent.lock().await;
            let listener = parent.as_ref().ok_or(ProxyError::ListenerClosed)?;
            tokio::select! {
                res = listener.accept() => res.map(|(conn, _)| conn)?,
                _ = inner.cancel.cancelled() => return Err(ProxyError::ListenerClosed),
            }
        };

        // Count the socket as pending so close() knows to wait for it.
        {
            let mut st = inner.state.lock().unwrap();
            if st.closed {
                drop(st);
                abort(conn);
                return Err(ProxyError::ListenerClosed);
            }
            st.pending += 1;
        }

        // Detection happens outside the lock; a silent client parks here
        // until it sends its first byte or the listener closes.
        let verdict = tokio::select! {
            res = detect_tls(&conn) => Some(res),
            _ = inner.cancel.cancelled() => None,
        };

        let mut st = inner.state.lock().unwrap();
        st.pending -= 1;

        let mut doomed = None;
        let res = if st.closed {
            doomed = Some(conn);
            Err(ProxyError::ListenerClosed)
        } else {
            match verdict {
                Some(Ok(true)) => {
                    st.encrypted.push_back(conn);
                    Ok(())
                }
                Some(Ok(false)) => {
                    st.plain.push_back(conn);
                    Ok(())
                }
                Some(Err(err)) => {
                    doomed = Some(conn);
                    Err(err.into())
                }
                None => {
                    doomed = Some(conn);
                    Err(ProxyError::ListenerClosed)
                }
            }
        };

        let last_pending = st.closed && st.pending == 0;
        drop(st);

        if let Some(conn) = doomed {
            abort(conn);
        }
        if last_pending {
            inner.drained.notify_waiters();
        }

        res
    }

    /// Closes the listener pair: the parent socket is dropped, queued and
    /// pending sockets are aborted and every accept() unblocks. Returns
    /// once no socket is pending anymore.
    pub async fn close(&self) {
        let doomed: Vec<TcpStream>;
        {
            let mut st = self.inner.state.lock().unwrap();
            if st.closed {
                return;
            }
            st.closed = true;
            let mut v: Vec<TcpStream> = st.plain.drain(..).collect();
            v.extend(st.encrypted.drain(..));
            doomed = v;
        }

        self.inner.cancel.cancel();

        // The accepter leaves parent.accept() on cancellation, so this lock
        // frees up promptly. Dropping the listener closes the socket.
        {
            let mut parent = self.inner.parent.lock().await;
            *parent = None;
        }

        for conn in doomed {
            abort(conn);
        }
        self.inner.queue_wakeup.notify_waiters();

        // An in-flight detection still owns its socket; wait for it to
        // observe the cancellation and abort.
        loop {
            let drained = self.inner.drained.notified();
            tokio::pin!(drained);
            drained.as_mut().enable();
            if self.inner.state.lock().unwrap().pending == 0 {
                break;
            }
            drained.await;
        }
    }

    /// Queue depths `(plain, encrypted, pending)`. Diagnostic interface,
    /// used by tests.
    pub fn counters(&self) -> (usize, usize, usize) {
        let st = self.inner.state.lock().unwrap();
        (st.plain.len(), st.encrypted.len(), st.pending)
    }
}

/// Outcome of a single, non-blocking look at the shared queue state.
enum QueuePoll {
    Ready(TcpStream),
    Closed,
    Wait,
    BecomeAccepter,
}

/// Frees the accepter role even when the accept() future is dropped.
struct AccepterGuard<'a> {
    inner: &'a Inner,
}

impl Drop for AccepterGuard<'_> {
    fn drop(&mut self) {
        self.inner.state.lock().unwrap().have_accepter = false;
        self.inner.queue_wakeup.notify_waiters();
    }
}

/// Peeks the first bytes without consuming them. A TLS connection always
/// starts with a handshake record, content type 0x16.
async fn detect_tls(conn: &TcpStream) -> io::Result<bool> {
    let mut buf = [0u8; 16];
    let n = conn.peek(&mut buf).await?;
    if n == 0 {
        return Err(io::Error::new(
            io::ErrorKind::UnexpectedEof,
            "connection closed before the first byte",
        ));
    }
    Ok(buf[0] == 0x16)
}
