//! Response text decoding
//!
//! Order of precedence: fixed encoding from the source config, then BOM,
//! then the `charset` parameter of `Content-Type`, then UTF-8. Malformed
//! sequences become U+FFFD instead of failing the request.

use encoding_rs::{Encoding, UTF_8};

/// Resolve an encoding label such as `"latin1"` or `"utf-8"`
pub fn encoding_for_label(label: &str) -> Option<&'static Encoding> {
    Encoding::for_label(label.trim().as_bytes())
}

/// Extract the `charset` parameter of a `Content-Type` value
pub fn charset_from_content_type(content_type: &str) -> Option<&str> {
    content_type.split(';').skip(1).find_map(|param| {
        let (name, value) = param.split_once('=')?;
        name.trim()
            .eq_ignore_ascii_case("charset")
            .then(|| value.trim().trim_matches(['"', '\''].as_ref()))
    })
}

/// Decode a response body into text
pub fn decode_text(
    bytes: &[u8],
    fixed: Option<&'static Encoding>,
    content_type: Option<&str>,
) -> String {
    if let Some(encoding) = fixed {
        let (text, _) = encoding.decode_without_bom_handling(bytes);
        return text.into_owned();
    }

    let encoding = Encoding::for_bom(bytes)
        .map(|(encoding, _)| encoding)
        .or_else(|| {
            content_type
                .and_then(charset_from_content_type)
                .and_then(encoding_for_label)
        })
        .unwrap_or(UTF_8);

    let (text, _, _) = encoding.decode(bytes);
    text.into_owned()
}
