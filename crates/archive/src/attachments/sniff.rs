//! Content-type detection for attachments without a stored header

/// Bytes read from the start of a payload for sniffing
pub const SNIFF_LEN: usize = 1024;

const DEFAULT_CONTENT_TYPE: &str = "application/octet-stream";

/// Types that only say "some bytes" or "some text"; a filename guess is
/// more useful than these
const GENERIC_TYPES: &[&str] = &[
    DEFAULT_CONTENT_TYPE,
    "text/plain",
    "application/zip",
    "application/x-zerosize",
];

fn is_generic(mime: &str) -> bool {
    GENERIC_TYPES.contains(&mime)
}

/// Detect a content type from the leading bytes of a payload and its filename
///
/// A specific magic-number match wins. Otherwise the type registered for the
/// filename extension is used, then the generic sniffed type, then
/// `application/octet-stream`.
pub fn sniff_content_type(head: &[u8], filename: &str) -> String {
    let sniffed = (!head.is_empty()).then(|| tree_magic_mini::from_u8(head));
    if let Some(mime) = sniffed
        && !is_generic(mime)
    {
        return mime.to_string();
    }

    if let Some(guess) = mime_guess::from_path(filename).first_raw()
        && guess != DEFAULT_CONTENT_TYPE
    {
        return guess.to_string();
    }

    match sniffed {
        Some("application/x-zerosize") | None => DEFAULT_CONTENT_TYPE.to_string(),
        Some(mime) => mime.to_string(),
    }
}
