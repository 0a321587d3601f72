//! Download URL templates.

use percent_encoding::{AsciiSet, NON_ALPHANUMERIC, utf8_percent_encode};

/// Characters left as-is inside a single path segment.
const SEGMENT: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'.')
    .remove(b'_')
    .remove(b'~');

/// Percent-encode each `/`-separated segment of a key, keeping the slashes.
pub fn encode_key(key: &str) -> String {
    key.split('/')
        .map(|segment| utf8_percent_encode(segment, SEGMENT).to_string())
        .collect::<Vec<_>>()
        .join("/")
}

/// Expand `{bucket}` and `{key}` in a provider's download template.
pub fn expand_download_template(template: &str, bucket: &str, key: &str) -> String {
    template
        .replace("{bucket}", &utf8_percent_encode(bucket, SEGMENT).to_string())
        .replace("{key}", &encode_key(key))
}
