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
    fs,
    path::PathBuf,
    sync::{Arc, Mutex},
};

/// Sink for per-request trace records.
///
/// Each record is a named byte blob written as one file inside the trace
/// directory. For an IPP exchange the proxy emits, in order, the request
/// message (`NNNNNNNN-<Op>.ipp`), optional trailing document data
/// (`NNNNNNNN-data.<magic>`) and the response message
/// (`NNNNNNNN-<status>.ipp`), where `NNNNNNNN` is the zero-padded request
/// number. Writes are serialized so records from concurrent requests never
/// interleave; write failures are logged, not fatal.
#[derive(Clone)]
pub struct TraceWriter {
    inner: Arc<TraceInner>,
}

struct TraceInner {
    dir: PathBuf,
    lock: Mutex<()>,
}

impl TraceWriter {
    pub fn new(dir: PathBuf) -> std::io::Result<Self> {
        fs::create_dir_all(&dir)?;
        Ok(Self {
            inner: Arc::new(TraceInner {
                dir,
                lock: Mutex::new(()),
            }),
        })
    }

    pub fn send(&self, name: &str, data: &[u8]) {
        let path = self.inner.dir.join(name);
        let _guard = self.inner.lock.lock().unwrap();
        if let Err(err) = fs::write(&path, data) {
            tracing::warn!(name, error = %err, "failed to write trace record");
        } else {
            tracing::debug!(name, bytes = data.len(), "trace record written");
        }
    }
}

/// Classifies trailing document data by its leading bytes. The tag goes
/// into the trace file extension: `NNNNNNNN-data.<magic>`.
///
/// Recognized formats: pdf, pclm (a PDF container with a PCLm marker),
/// ps, jpeg, urf. Everything else is raw.
pub fn magic(data: &[u8]) -> &'static str {
    if data.starts_with(b"%PDF") {
        let probe = &data[..data.len().min(1024)];
        if probe.windows(4).any(|w| w == b"PCLm") {
            return "pclm";
        }
        return "pdf";
    }
    if data.starts_with(b"%!") {
        return "ps";
    }
    if data.starts_with(&[0xff, 0xd8, 0xff]) {
        return "jpeg";
    }
    if data.starts_with(b"UNIRAST") {
        return "urf";
    }
    "raw"
}
