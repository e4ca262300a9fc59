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

use std::fmt;

use http::Uri;

use crate::config::{effective_port, scheme_default_port};
use crate::ipp::codec::{Message, VALUE_TAG_MEMBER_NAME, VALUE_TAG_URI};

/// The `(scheme, host, port)` identity of one side of the translation,
/// plus the authority spelling used when rewriting toward this side.
#[derive(Debug, Clone)]
struct Origin {
    host: String,
    port: u16,
    authority: String,
}

impl Origin {
    fn from_uri(uri: &Uri) -> Self {
        let authority = uri
            .authority()
            .map(|a| a.as_str().to_string())
            .unwrap_or_default();
        Origin {
            host: uri.host().unwrap_or_default().to_ascii_lowercase(),
            port: effective_port(uri),
            authority,
        }
    }

    /// A URL belongs to this origin when host and effective port agree.
    /// The scheme only contributes its default port: printers spell the
    /// same endpoint as http:// or ipp:// interchangeably.
    fn matches(&self, uri: &Uri) -> bool {
        let host = match uri.host() {
            Some(host) => host,
            None => return false,
        };
        if !host.eq_ignore_ascii_case(&self.host) {
            return false;
        }
        let port = uri
            .port_u16()
            .unwrap_or_else(|| scheme_default_port(uri.scheme_str().unwrap_or("http")));
        port == self.port
    }
}

/// Bidirectional URL rewriting between the proxy's local origin and the
/// target device origin. Strings that do not parse as absolute URLs, or
/// whose origin matches neither side, pass through unchanged.
#[derive(Debug, Clone)]
pub struct UrlXlat {
    local: Origin,
    target: Origin,
}

impl UrlXlat {
    pub fn new(local: &Uri, target: &Uri) -> Self {
        Self {
            local: Origin::from_uri(local),
            target: Origin::from_uri(target),
        }
    }

    /// Client to device direction: local origin becomes the target origin.
    pub fn forward(&self, s: &str) -> String {
        rewrite(s, &self.local, &self.target)
    }

    /// Device to client direction: target origin becomes the local origin.
    pub fn reverse(&self, s: &str) -> String {
        rewrite(s, &self.target, &self.local)
    }
}

/// Swaps the authority of `s` when its origin matches `from`. The scheme
/// of `s` is preserved; only host and port change.
fn rewrite(s: &str, from: &Origin, to: &Origin) -> String {
    let uri: Uri = match s.parse() {
        Ok(uri) => uri,
        Err(_) => return s.to_string(),
    };
    if uri.scheme_str().is_none() || !from.matches(&uri) {
        return s.to_string();
    }

    let scheme = uri.scheme_str().unwrap_or("http");
    let path_and_query = uri.path_and_query().map(|pq| pq.as_str()).unwrap_or("");
    format!("{}://{}{}", scheme, to.authority, path_and_query)
}

/// One rewritten attribute value, recorded for logging.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Change {
    pub name: String,
    pub old: String,
    pub new: String,
}

/// The set of attribute rewrites performed on one message.
#[derive(Debug, Clone, Default)]
pub struct ChangeSet {
    changes: Vec<Change>,
}

impl ChangeSet {
    pub fn is_empty(&self) -> bool {
        self.changes.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Change> {
        self.changes.iter()
    }

    pub fn len(&self) -> usize {
        self.changes.len()
    }
}

impl fmt::Display for ChangeSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, c) in self.changes.iter().enumerate() {
            if i > 0 {
                writeln!(f)?;
            }
            write!(f, "{}: {} -> {}", c.name, c.old, c.new)?;
        }
        Ok(())
    }
}

#[derive(Clone, Copy)]
enum Direction {
    Forward,
    Reverse,
}

/// Rewrites every URI-typed value in an IPP message.
///
/// The walk follows encoded order, so a message without matching URLs
/// re-encodes to the same bytes it was decoded from. Additional values of
/// a 1setOf and collection members are individual entries in the flat
/// model and are translated element-wise; changes are reported under the
/// innermost attribute or member name.
#[derive(Debug, Clone)]
pub struct MsgXlat {
    url: UrlXlat,
}

impl MsgXlat {
    pub fn new(url: UrlXlat) -> Self {
        Self { url }
    }

    /// Request direction.
    pub fn forward(&self, msg: &Message) -> (Message, ChangeSet) {
        self.translate(msg, Direction::Forward)
    }

    /// Response direction.
    pub fn reverse(&self, msg: &Message) -> (Message, ChangeSet) {
        self.translate(msg, Direction::Reverse)
    }

    fn translate(&self, msg: &Message, dir: Direction) -> (Message, ChangeSet) {
        let mut out = msg.clone();
        let mut changes = ChangeSet::default();

        for group in &mut out.groups {
            // Tracks the logical attribute name across additional values
            // and collection members.
            let mut current_name = String::new();

            for attr in &mut group.attrs {
                if !attr.name.is_empty() {
                    current_name = String::from_utf8_lossy(&attr.name).into_owned();
                }
                if attr.tag == VALUE_TAG_MEMBER_NAME {
                    current_name = String::from_utf8_lossy(&attr.value).into_owned();
                    continue;
                }
                if attr.tag != VALUE_TAG_URI {
                    continue;
                }

                let old = match std::str::from_utf8(&attr.value) {
                    Ok(s) => s.to_string(),
                    Err(_) => continue,
                };
                let new = match dir {
                    Direction::Forward => self.url.forward(&old),
                    Direction::Reverse => self.url.reverse(&old),
                };
                if new != old {
                    attr.value = new.clone().into_bytes();
                    changes.changes.push(Change {
                        name: current_name.clone(),
                        old,
                        new,
                    });
                }
            }
        }

        (out, changes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ipp::codec::test_messages::*;
    use crate::ipp::codec::{encode, Attr, Group, TAG_PRINTER_ATTRIBUTES};

    fn xlat() -> UrlXlat {
        UrlXlat::new(
            &"http://127.0.0.1:50000".parse().unwrap(),
            &"ipp://device.local:631/ipp/print".parse().unwrap(),
        )
    }

    #[test]
    fn forward_rewrites_local_origin() {
        let x = xlat();
        assert_eq!(
            x.forward("ipp://127.0.0.1:50000/ipp/print"),
            "ipp://device.local:631/ipp/print"
        );
        // Scheme is preserved, only the authority moves.
        assert_eq!(
            x.forward("http://127.0.0.1:50000/escl/ScannerCapabilities"),
            "http://device.local:631/escl/ScannerCapabilities"
        );
    }

    #[test]
    fn reverse_rewrites_target_origin() {
        let x = xlat();
        assert_eq!(
            x.reverse("ipp://device.local:631/ipp/print"),
            "ipp://127.0.0.1:50000/ipp/print"
        );
        // Implicit default port also matches the target origin.
        assert_eq!(
            x.reverse("ipp://device.local/ipp/print"),
            "ipp://127.0.0.1:50000/ipp/print"
        );
    }

    #[test]
    fn roundtrip_restores_the_original() {
        let x = xlat();
        // Local-origin strings survive forward then reverse.
        for s in ["ipp://127.0.0.1:50000/ipp/print", "http://127.0.0.1:50000/"] {
            assert_eq!(x.reverse(&x.forward(s)), s);
        }
        // Target-origin strings survive reverse then forward.
        for s in [
            "ipp://device.local:631/ipp/print",
            "ipps://device.local:631/ipp/print",
        ] {
            assert_eq!(x.forward(&x.reverse(s)), s);
        }
    }

    #[test]
    fn unrelated_strings_pass_through() {
        let x = xlat();
        for s in [
            "ipp://other.host:631/ipp/print",
            "not a url at all",
            "utf-8",
            "ipp://127.0.0.1:9999/ipp/print",
        ] {
            assert_eq!(x.forward(s), s);
            assert_eq!(x.reverse(s), s);
        }
    }

    #[test]
    fn message_without_matches_is_byte_stable() {
        let mut attrs = charset_preamble();
        attrs.push(uri_attr("printer-uri", "ipp://other.host:631/ipp/print"));
        let msg = simple_request(0x000b, attrs);
        let before = encode(&msg);

        let (translated, changes) = MsgXlat::new(xlat()).forward(&msg);
        assert!(changes.is_empty());
        assert_eq!(encode(&translated), before);
    }

    #[test]
    fn rewrites_uri_attribute_and_reports_change() {
        let mut attrs = charset_preamble();
        attrs.push(uri_attr("printer-uri", "ipp://127.0.0.1:50000/ipp/print"));
        let msg = simple_request(0x000b, attrs);

        let (translated, changes) = MsgXlat::new(xlat()).forward(&msg);
        assert_eq!(changes.len(), 1);
        let change = changes.iter().next().unwrap();
        assert_eq!(change.name, "printer-uri");
        assert_eq!(change.new, "ipp://device.local:631/ipp/print");

        let rewritten = &translated.groups[0].attrs[2];
        assert_eq!(rewritten.value, b"ipp://device.local:631/ipp/print");
        // Neighbors untouched.
        assert_eq!(translated.groups[0].attrs[0], msg.groups[0].attrs[0]);
    }

    #[test]
    fn multivalued_uri_translates_element_wise() {
        let msg = Message {
            version: (1, 1),
            code: 0x0000,
            request_id: 3,
            groups: vec![Group {
                tag: TAG_PRINTER_ATTRIBUTES,
                attrs: vec![
                    uri_attr(
                        "printer-uri-supported",
                        "ipp://device.local:631/ipp/print",
                    ),
                    Attr {
                        tag: VALUE_TAG_URI,
                        name: Vec::new(),
                        value: b"ipps://device.local:631/ipp/print".to_vec(),
                    },
                ],
            }],
        };

        let (translated, changes) = MsgXlat::new(xlat()).reverse(&msg);
        assert_eq!(changes.len(), 2);
        for change in changes.iter() {
            assert_eq!(change.name, "printer-uri-supported");
        }
        assert_eq!(
            translated.groups[0].attrs[0].value,
            b"ipp://127.0.0.1:50000/ipp/print"
        );
        assert_eq!(
            translated.groups[0].attrs[1].value,
            b"ipps://127.0.0.1:50000/ipp/print"
        );
    }

    #[test]
    fn collection_member_uri_is_translated_by_tag() {
        // begCollection, memberAttrName, member uri value, endCollection.
        let msg = simple_request(
            0x0002,
            vec![
                Attr {
                    tag: 0x34,
                    name: b"destination-uris".to_vec(),
                    value: Vec::new(),
                },
                Attr {
                    tag: VALUE_TAG_MEMBER_NAME,
                    name: Vec::new(),
                    value: b"destination-uri".to_vec(),
                },
                Attr {
                    tag: VALUE_TAG_URI,
                    name: Vec::new(),
                    value: b"ipp://127.0.0.1:50000/ipp/print".to_vec(),
                },
                Attr {
                    tag: 0x37,
                    name: Vec::new(),
                    value: Vec::new(),
                },
            ],
        );

        let (translated, changes) = MsgXlat::new(xlat()).forward(&msg);
        assert_eq!(changes.len(), 1);
        let change = changes.iter().next().unwrap();
        assert_eq!(change.name, "destination-uri");
        assert_eq!(
            translated.groups[0].attrs[2].value,
            b"ipp://device.local:631/ipp/print"
        );
    }
}
