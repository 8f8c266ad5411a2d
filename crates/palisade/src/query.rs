//! Query text handling: comment skipping, cacheability, snippets.

use bytes::Bytes;
use flate2::read::GzDecoder;
use std::io::Read;

/// How much of a query is kept verbatim for logging and error bodies.
pub const SNIPPET_LEN: usize = 1024;

/// Strips leading whitespace and both comment styles (`-- …\n` and
/// `/* … */`) from the start of a query. Idempotent.
pub fn skip_leading_comments(mut query: &[u8]) -> &[u8] {
    loop {
        while let [first, rest @ ..] = query {
            if first.is_ascii_whitespace() {
                query = rest;
            } else {
                break;
            }
        }
        if let Some(rest) = query.strip_prefix(b"--") {
            query = match rest.iter().position(|&b| b == b'\n') {
                Some(pos) => &rest[pos + 1..],
                // A dash comment without a newline swallows the rest.
                None => &[],
            };
            continue;
        }
        if let Some(rest) = query.strip_prefix(b"/*") {
            query = match rest.windows(2).position(|w| w == b"*/") {
                Some(pos) => &rest[pos + 2..],
                // Unterminated block comment: nothing follows.
                None => &[],
            };
            continue;
        }
        return query;
    }
}

/// A query is cacheable iff its first non-comment token is `SELECT` or
/// `WITH`, case-insensitive.
pub fn is_cacheable(query: &[u8]) -> bool {
    let stripped = skip_leading_comments(query);
    let token_len = stripped
        .iter()
        .position(|b| !b.is_ascii_alphabetic())
        .unwrap_or(stripped.len());
    let token = &stripped[..token_len];
    token.eq_ignore_ascii_case(b"select") || token.eq_ignore_ascii_case(b"with")
}

/// Combines the URL `query` parameter with the request body into the
/// full query text the backend will see. Either part may be empty.
pub fn full_query(url_query: &str, body: &Bytes) -> Vec<u8> {
    if body.is_empty() {
        return url_query.as_bytes().to_vec();
    }
    if url_query.is_empty() {
        return body.to_vec();
    }
    let mut combined = Vec::with_capacity(url_query.len() + 1 + body.len());
    combined.extend_from_slice(url_query.as_bytes());
    combined.push(b'\n');
    combined.extend_from_slice(body);
    combined
}

/// Renders up to [`SNIPPET_LEN`] bytes of the start and end of a query
/// for error bodies, recovering gzip-compressed bodies when possible.
pub fn readable_snippet(query: &[u8], gzip: bool) -> String {
    let decoded;
    let query = if gzip {
        decoded = gunzip_prefix(query);
        decoded.as_slice()
    } else {
        query
    };

    if query.len() <= 2 * SNIPPET_LEN {
        return String::from_utf8_lossy(query).into_owned();
    }
    format!(
        "{} ... {}",
        String::from_utf8_lossy(&query[..SNIPPET_LEN]),
        String::from_utf8_lossy(&query[query.len() - SNIPPET_LEN..])
    )
}

/// Best-effort gzip recovery of the first couple of KiB; on any
/// decoder error the raw bytes are returned instead.
fn gunzip_prefix(raw: &[u8]) -> Vec<u8> {
    let mut decoder = GzDecoder::new(raw);
    let mut out = vec![0u8; 2 * SNIPPET_LEN];
    let mut filled = 0;
    while filled < out.len() {
        match decoder.read(&mut out[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(_) => return raw.to_vec(),
        }
    }
    out.truncate(filled);
    out
}
