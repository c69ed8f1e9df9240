//! Sanitization of attachments and payloads before they enter history.
//!
//! Event history is replayed to clients and persisted durably, so inline
//! binary content is kept out of it. Attachments keep small textual inline
//! payloads; everything else is reduced to a reference. Payload maps are
//! scrubbed of serialized byte arrays.

use serde_json::Value;
use tracing::debug;

use crate::types::Attachment;

/// Inline payloads larger than this are always stripped.
pub const MAX_INLINE_ATTACHMENT_BYTES: usize = 128 * 1024;

/// Minimum array length considered a candidate for binary scrubbing.
const BINARY_ARRAY_MIN_LEN: usize = 32;

/// Whether a media type is textual enough to keep inline.
///
/// Retains `text/*`, markdown, and JSON payloads.
fn is_textual_media_type(media_type: &str) -> bool {
    let mt = media_type
        .split(';')
        .next()
        .unwrap_or(media_type)
        .trim()
        .to_ascii_lowercase();
    mt.starts_with("text/")
        || mt == "application/json"
        || mt.ends_with("+json")
        || mt == "application/markdown"
        || mt == "application/x-markdown"
}

/// Sanitize a single attachment for inclusion in event history.
///
/// - Names are trimmed.
/// - Data URIs are removed from the `uri` field.
/// - Inline data is retained only when it is at most
///   [`MAX_INLINE_ATTACHMENT_BYTES`] and the media type is textual.
///
/// Returns `None` when the attachment is left with neither a usable URI
/// nor retained inline data.
pub fn sanitize_attachment(attachment: &Attachment) -> Option<Attachment> {
    let name = attachment.name.trim().to_string();

    let uri = if attachment.uri.starts_with("data:") {
        String::new()
    } else {
        attachment.uri.clone()
    };

    let data = attachment.data.as_ref().and_then(|data| {
        let textual = attachment
            .media_type
            .as_deref()
            .map(is_textual_media_type)
            .unwrap_or(false);
        if textual && data.len() <= MAX_INLINE_ATTACHMENT_BYTES {
            Some(data.clone())
        } else {
            None
        }
    });

    if uri.is_empty() && data.is_none() {
        debug!(name = %name, "Dropping attachment with no uri and no retained data");
        return None;
    }

    Some(Attachment {
        name,
        uri,
        media_type: attachment.media_type.clone(),
        data,
    })
}

/// Sanitize a list of attachments, dropping the unusable ones.
pub fn sanitize_attachments(attachments: &[Attachment]) -> Vec<Attachment> {
    attachments.iter().filter_map(sanitize_attachment).collect()
}

/// Replace serialized byte arrays anywhere in a payload with null.
///
/// Serialized binary shows up in JSON as a long array of octet-range
/// integers. Arrays of at least 32 elements where every element is an
/// integer in `0..=255` are replaced; everything else is walked
/// recursively and left intact.
pub fn scrub_binary_payloads(value: &mut Value) {
    match value {
        Value::Array(items) => {
            if looks_like_byte_array(items) {
                *value = Value::Null;
                return;
            }
            for item in items {
                scrub_binary_payloads(item);
            }
        }
        Value::Object(map) => {
            for (_, v) in map.iter_mut() {
                scrub_binary_payloads(v);
            }
        }
        _ => {}
    }
}

/// Produce a history-safe copy of an event with binary payloads
/// scrubbed. The envelope metadata is untouched.
pub fn sanitize_event(event: &crate::types::AgentEvent) -> crate::types::AgentEvent {
    let mut sanitized = event.clone();
    match &mut sanitized {
        crate::types::AgentEvent::Envelope(env) => {
            for (_, value) in env.payload.iter_mut() {
                scrub_binary_payloads(value);
            }
        }
        crate::types::AgentEvent::Kinded(kinded) => {
            scrub_binary_payloads(&mut kinded.data);
        }
    }
    sanitized
}

fn looks_like_byte_array(items: &[Value]) -> bool {
    items.len() >= BINARY_ARRAY_MIN_LEN
        && items
            .iter()
            .all(|v| matches!(v.as_u64(), Some(n) if n <= 255))
}
