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

// IPP binary message codec, RFC 8010 SS3.
//
// The message is kept in encoded order as a flat list of raw
// (value-tag, name, value) entries per group, so an unmodified message
// re-encodes byte for byte. Additional values of a 1setOf appear as
// entries with an empty name; collection members appear between the
// begCollection and endCollection entries, exactly as on the wire.
//
// The decoder reads from an async stream and consumes exactly the message
// bytes, up to and including the end-of-attributes tag. Anything after
// that (IPP document data) is left unread for the caller.

use std::io;

use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt};

/// Delimiter tag range, RFC 8010 SS3.5.1. Tags 0x00..=0x0f start a new
/// attribute group; 0x03 terminates the attribute section.
pub const TAG_END_OF_ATTRIBUTES: u8 = 0x03;
pub const TAG_OPERATION_ATTRIBUTES: u8 = 0x01;
pub const TAG_JOB_ATTRIBUTES: u8 = 0x02;
pub const TAG_PRINTER_ATTRIBUTES: u8 = 0x04;

/// Value tags the proxy cares about, RFC 8010 SS3.5.2.
pub const VALUE_TAG_URI: u8 = 0x45;
pub const VALUE_TAG_MEMBER_NAME: u8 = 0x4a;

/// Upper bound on a decoded attribute section. Stops a misbehaving client
/// from growing the prefetch buffer without limit.
const MAX_MESSAGE_BYTES: u64 = 8 * 1024 * 1024;

#[derive(Debug, Error)]
pub enum IppError {
    #[error("IPP message truncated")]
    Truncated,

    #[error("attribute before any group delimiter")]
    AttributeOutsideGroup,

    #[error("additional value without a preceding attribute")]
    DanglingAdditionalValue,

    #[error("IPP message too large")]
    TooLarge,

    #[error("IO error: {0}")]
    Io(io::Error),
}

impl From<io::Error> for IppError {
    fn from(err: io::Error) -> Self {
        if err.kind() == io::ErrorKind::UnexpectedEof {
            IppError::Truncated
        } else {
            IppError::Io(err)
        }
    }
}

/// One raw attribute entry as encoded on the wire. An empty name marks an
/// additional value of the preceding attribute (1setOf) or a collection
/// member value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attr {
    pub tag: u8,
    pub name: Vec<u8>,
    pub value: Vec<u8>,
}

/// An attribute group in encoded order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Group {
    pub tag: u8,
    pub attrs: Vec<Attr>,
}

/// A decoded IPP message. `code` carries the operation id in requests and
/// the status code in responses; the codec does not distinguish.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub version: (u8, u8),
    pub code: u16,
    pub request_id: u32,
    pub groups: Vec<Group>,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct DecodeOptions {
    /// Tolerate minor spec violations seen in the field: attributes before
    /// the first group delimiter and additional values without a named
    /// predecessor are accepted instead of rejected.
    pub lenient: bool,
}

impl DecodeOptions {
    pub fn lenient() -> Self {
        Self { lenient: true }
    }
}

/// Decodes one message from the stream, consuming exactly the attribute
/// section. Document data following the message stays unread.
pub async fn decode<R: AsyncRead + Unpin>(
    r: &mut R,
    opts: DecodeOptions,
) -> Result<Message, IppError> {
    let mut consumed: u64 = 0;

    let mut header = [0u8; 8];
    r.read_exact(&mut header).await?;
    consumed += 8;

    let mut msg = Message {
        version: (header[0], header[1]),
        code: u16::from_be_bytes([header[2], header[3]]),
        request_id: u32::from_be_bytes([header[4], header[5], header[6], header[7]]),
        groups: Vec::new(),
    };

    let mut group: Option<Group> = None;

    loop {
        let tag = read_u8(r).await?;
        consumed += 1;

        if tag == TAG_END_OF_ATTRIBUTES {
            break;
        }

        if tag <= 0x0f {
            if let Some(done) = group.take() {
                msg.groups.push(done);
            }
            group = Some(Group {
                tag,
                attrs: Vec::new(),
            });
            continue;
        }

        // Attribute entry: value-tag, name-length, name, value-length, value.
        let name_len = read_u16(r).await? as usize;
        let mut name = vec![0u8; name_len];
        r.read_exact(&mut name).await?;

        let value_len = read_u16(r).await? as usize;
        let mut value = vec![0u8; value_len];
        r.read_exact(&mut value).await?;

        consumed += 4 + name_len as u64 + value_len as u64;
        if consumed > MAX_MESSAGE_BYTES {
            return Err(IppError::TooLarge);
        }

        if group.is_none() {
            if !opts.lenient {
                return Err(IppError::AttributeOutsideGroup);
            }
            // Workaround: some firmwares omit the first delimiter.
            group = Some(Group {
                tag: TAG_OPERATION_ATTRIBUTES,
                attrs: Vec::new(),
            });
        }
        let cur = group.as_mut().unwrap();

        if name.is_empty() && cur.attrs.is_empty() && !opts.lenient {
            return Err(IppError::DanglingAdditionalValue);
        }

        cur.attrs.push(Attr { tag, name, value });
    }

    if let Some(done) = group.take() {
        msg.groups.push(done);
    }

    Ok(msg)
}

/// Encodes the message. For a message produced by [`decode`] and left
/// unmodified, the output equals the decoded input byte for byte.
pub fn encode(msg: &Message) -> Vec<u8> {
    let mut out = Vec::with_capacity(256);
    out.push(msg.version.0);
    out.push(msg.version.1);
    out.extend_from_slice(&msg.code.to_be_bytes());
    out.extend_from_slice(&msg.request_id.to_be_bytes());

    for group in &msg.groups {
        out.push(group.tag);
        for attr in &group.attrs {
            out.push(attr.tag);
            out.extend_from_slice(&(attr.name.len() as u16).to_be_bytes());
            out.extend_from_slice(&attr.name);
            out.extend_from_slice(&(attr.value.len() as u16).to_be_bytes());
            out.extend_from_slice(&attr.value);
        }
    }

    out.push(TAG_END_OF_ATTRIBUTES);
    out
}

async fn read_u8<R: AsyncRead + Unpin>(r: &mut R) -> Result<u8, IppError> {
    let mut b = [0u8; 1];
    r.read_exact(&mut b).await?;
    Ok(b[0])
}

async fn read_u16<R: AsyncRead + Unpin>(r: &mut R) -> Result<u16, IppError> {
    let mut b = [0u8; 2];
    r.read_exact(&mut b).await?;
    Ok(u16::from_be_bytes(b))
}

/// Human-readable operation name, RFC 8011 SS4, used in trace file names
/// and logs. Unknown codes render as hex.
pub fn operation_name(code: u16) -> String {
    match code {
        0x0002 => "Print-Job".into(),
        0x0003 => "Print-URI".into(),
        0x0004 => "Validate-Job".into(),
        0x0005 => "Create-Job".into(),
        0x0006 => "Send-Document".into(),
        0x0007 => "Send-URI".into(),
        0x0008 => "Cancel-Job".into(),
        0x0009 => "Get-Job-Attributes".into(),
        0x000a => "Get-Jobs".into(),
        0x000b => "Get-Printer-Attributes".into(),
        0x000c => "Hold-Job".into(),
        0x000d => "Release-Job".into(),
        0x0010 => "Pause-Printer".into(),
        0x0011 => "Resume-Printer".into(),
        0x003b => "Cancel-My-Jobs".into(),
        0x003c => "Resubmit-Job".into(),
        0x003d => "Close-Job".into(),
        0x0039 => "Identify-Printer".into(),
        other => format!("Op-0x{other:04x}"),
    }
}

/// Status code keyword, RFC 8011 SS4.1.8.
pub fn status_name(code: u16) -> String {
    match code {
        0x0000 => "successful-ok".into(),
        0x0001 => "successful-ok-ignored-or-substituted-attributes".into(),
        0x0002 => "successful-ok-conflicting-attributes".into(),
        0x0400 => "client-error-bad-request".into(),
        0x0401 => "client-error-forbidden".into(),
        0x0403 => "client-error-not-authorized".into(),
        0x0404 => "client-error-not-possible".into(),
        0x0406 => "client-error-not-found".into(),
        0x040a => "client-error-document-format-not-supported".into(),
        0x040b => "client-error-attributes-or-values-not-supported".into(),
        0x0500 => "server-error-internal-error".into(),
        0x0501 => "server-error-operation-not-supported".into(),
        0x0506 => "server-error-temporary-error".into(),
        0x0507 => "server-error-not-accepting-jobs".into(),
        0x0508 => "server-error-busy".into(),
        other => format!("status-0x{other:04x}"),
    }
}
