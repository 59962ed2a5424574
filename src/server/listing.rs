/*!
GET handlers: directory listings (JSON or HTML) and raw file contents.
*/

use std::collections::BTreeMap;
use std::fs::File;
use std::io::{self, Read, Write};
use std::time::UNIX_EPOCH;

use serde::Serialize;
use tracing::warn;

use crate::errors::ShaasError;
use crate::fsentry::{self, EntryKind, FilesystemEntry};
use crate::server::http::{self, ChunkedWriter, RequestContext};

/// Per-child details in a JSON listing.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct EntryDetails {
    pub size: u64,
    #[serde(rename = "type")]
    pub kind: String,
    /// Permission bits as a decimal number (0o755 is 493).
    pub permission: u32,
    pub updated_at: String,
}

impl From<&FilesystemEntry> for EntryDetails {
    fn from(e: &FilesystemEntry) -> Self {
        EntryDetails {
            size: e.size(),
            kind: e.type_indicator().to_string(),
            permission: e.permission(),
            updated_at: humantime::format_rfc3339_nanos(e.modified().unwrap_or(UNIX_EPOCH))
                .to_string(),
        }
    }
}

/// Pretty-printed JSON object keyed by child name, followed by a newline.
pub fn render_json(entries: &[(String, FilesystemEntry)]) -> Vec<u8> {
    let map: BTreeMap<&str, EntryDetails> = entries
        .iter()
        .map(|(name, e)| (name.as_str(), EntryDetails::from(e)))
        .collect();
    let mut out = serde_json::to_string_pretty(&map).unwrap_or_else(|_| "{}".to_string());
    out.push('\n');
    out.into_bytes()
}

fn escape_html(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '&' => out.push_str("&amp;"),
            '\'' => out.push_str("&#39;"),
            '"' => out.push_str("&#34;"),
            c => out.push(c),
        }
    }
    out
}

/// Minimal `<pre><ul>` listing; directories get a trailing `/` in their label.
pub fn render_html(url_path: &str, entries: &[(String, FilesystemEntry)]) -> String {
    let mut base = escape_html(url_path);
    if !base.ends_with('/') {
        base.push('/');
    }
    let mut out = String::from("<pre><ul>");
    for (name, e) in entries {
        let mut label = name.clone();
        if e.kind() == EntryKind::Directory {
            label.push('/');
        }
        out.push_str(&format!(
            "<li><a href='{}{}'>{}</a></li>",
            base,
            urlencoding::encode(name),
            escape_html(&label)
        ));
    }
    out.push_str("</ul></pre>");
    out
}

/// Respond with a listing of `entry`, HTML when the client accepts it.
pub fn serve_directory<W: Write>(
    w: &mut W,
    ctx: &RequestContext,
    entry: &FilesystemEntry,
) -> Result<(), ShaasError> {
    let entries = fsentry::read_dir_sorted(entry.path()).map_err(ShaasError::ReadDir)?;
    let result = if ctx.accepts_html() {
        let body = render_html(&ctx.path, &entries);
        http::respond_bytes(w, 200, "text/html; charset=utf-8", &[], body.as_bytes())
    } else {
        http::respond_bytes(w, 200, "application/json", &[], &render_json(&entries))
    };
    if let Err(e) = result {
        warn!(error = %e, "writing listing failed");
    }
    Ok(())
}

/// Respond with the raw bytes of a regular file. Files that report a size get a
/// Content-Length; empty or size-less files (procfs and friends) are sent chunked.
pub fn serve_file<W: Write>(w: &mut W, entry: &FilesystemEntry) -> Result<(), ShaasError> {
    let file = File::open(entry.path()).map_err(ShaasError::ReadFile)?;
    if let Err(e) = write_file(w, file, entry.size()) {
        warn!(error = %e, "writing file failed");
    }
    Ok(())
}

fn write_file<W: Write>(w: &mut W, mut file: File, size: u64) -> io::Result<()> {
    let content_type = ("Content-Type", "application/octet-stream".to_string());
    if size > 0 {
        http::write_head(w, 200, &[content_type, ("Content-Length", size.to_string())])?;
        io::copy(&mut file.take(size), w)?;
        return w.flush();
    }
    http::write_head(w, 200, &[content_type, ("Transfer-Encoding", "chunked".to_string())])?;
    let mut chunked = ChunkedWriter::new(w);
    io::copy(&mut file, &mut chunked)?;
    chunked.finish()
}
