//! Gmail API response normalization
//!
//! Converts a full Gmail message into the detail written back onto a stub.

use base64::prelude::*;
use chrono::{DateTime, Utc};

use super::api::{self, GmailLabel, GmailMessage, MessagePart};
use crate::error::SyncError;
use crate::models::{
    BodyPart, EmailAddress, Header, Label, LabelId, MessageDetail, MessagePayload, ThreadId,
};

/// Normalize a Gmail message into [`MessageDetail`]
///
/// `fallback_thread_id` is used when the response omits its thread. The
/// internal date falls back to the `Date` header and then to the current
/// time, so the result always carries one.
pub fn normalize_detail(
    gmail_msg: GmailMessage,
    fallback_thread_id: &ThreadId,
) -> Result<MessageDetail, SyncError> {
    if gmail_msg.id.is_empty() {
        return Err(SyncError::Data("message response has no id".to_string()));
    }

    let payload = gmail_msg
        .payload
        .as_ref()
        .ok_or_else(|| SyncError::Data(format!("message {} has no payload", gmail_msg.id)))?;

    let headers: Vec<Header> = payload
        .headers
        .iter()
        .flatten()
        .map(|h| Header::new(&h.name, &h.value))
        .collect();

    let mut parts = Vec::new();
    collect_parts(&root_as_part(payload), &mut parts);

    let payload = MessagePayload {
        mime_type: payload.mime_type.clone(),
        headers,
        parts,
    };

    let internal_date = gmail_msg
        .internal_date
        .as_deref()
        .and_then(|s| s.parse::<i64>().ok())
        .or_else(|| payload.header("Date").and_then(parse_date_header))
        .unwrap_or_else(|| Utc::now().timestamp_millis());

    let thread_id = if gmail_msg.thread_id.is_empty() {
        fallback_thread_id.clone()
    } else {
        ThreadId::new(&gmail_msg.thread_id)
    };

    let subject = payload.header("Subject").unwrap_or_default().to_string();
    let from = payload.header("From").map(EmailAddress::parse);

    Ok(MessageDetail {
        thread_id,
        internal_date,
        history_id: gmail_msg.history_id,
        snippet: decode_html_entities(&gmail_msg.snippet),
        subject,
        from,
        size_estimate: gmail_msg.size_estimate.unwrap_or(0),
        label_ids: gmail_msg
            .label_ids
            .unwrap_or_default()
            .into_iter()
            .map(LabelId::from)
            .collect(),
        payload,
    })
}

/// Convert a remote label; labels without an id are dropped
pub fn normalize_label(remote: GmailLabel) -> Option<Label> {
    if remote.id.is_empty() {
        return None;
    }

    Some(Label {
        is_system: remote.label_type.as_deref() == Some("system"),
        name: if remote.name.is_empty() {
            remote.id.clone()
        } else {
            remote.name
        },
        id: LabelId::new(remote.id),
        message_list_visibility: remote.message_list_visibility,
        label_list_visibility: remote.label_list_visibility,
        messages_total: remote.messages_total.unwrap_or(0),
        messages_unread: remote.messages_unread.unwrap_or(0),
        threads_total: remote.threads_total.unwrap_or(0),
        threads_unread: remote.threads_unread.unwrap_or(0),
    })
}

/// Parse an RFC 2822 `Date` header into epoch milliseconds
fn parse_date_header(value: &str) -> Option<i64> {
    // Some mailers append a zone comment: "... +0000 (UTC)"
    let trimmed = match value.find(" (") {
        Some(idx) => &value[..idx],
        None => value,
    };
    DateTime::parse_from_rfc2822(trimmed.trim())
        .ok()
        .map(|dt| dt.with_timezone(&Utc).timestamp_millis())
}

/// View the top-level payload as a part so single-part messages share the walk
fn root_as_part(payload: &api::MessagePayload) -> MessagePart {
    MessagePart {
        part_id: payload.part_id.clone(),
        mime_type: payload.mime_type.clone(),
        filename: payload.filename.clone(),
        headers: None,
        body: payload.body.clone(),
        parts: payload.parts.clone(),
    }
}

/// Flatten the MIME tree into its leaf parts
fn collect_parts(part: &MessagePart, out: &mut Vec<BodyPart>) {
    if let Some(children) = &part.parts
        && !children.is_empty()
    {
        for child in children {
            collect_parts(child, out);
        }
        return;
    }

    let mime_type = part
        .mime_type
        .clone()
        .unwrap_or_else(|| "application/octet-stream".to_string());
    let body = part.body.as_ref();

    let text = if mime_type.starts_with("text/") {
        body.and_then(|b| b.data.as_deref()).and_then(decode_base64_body)
    } else {
        None
    };

    out.push(BodyPart {
        part_id: part.part_id.clone(),
        mime_type,
        filename: part.filename.clone().filter(|f| !f.is_empty()),
        size: body.and_then(|b| b.size).unwrap_or(0),
        text,
        attachment_id: body.and_then(|b| b.attachment_id.clone()),
    });
}

/// Decode base64-encoded body data
///
/// Gmail uses URL-safe base64 but padding can vary, so we try multiple decoders.
fn decode_base64_body(data: &str) -> Option<String> {
    use base64::engine::general_purpose::{STANDARD, STANDARD_NO_PAD, URL_SAFE};

    let decoders: &[&base64::engine::GeneralPurpose] =
        &[&BASE64_URL_SAFE_NO_PAD, &URL_SAFE, &STANDARD, &STANDARD_NO_PAD];

    for decoder in decoders {
        if let Ok(decoded) = decoder.decode(data)
            && let Ok(s) = String::from_utf8(decoded)
        {
            return Some(s);
        }
    }

    None
}

/// Decode HTML entities in snippet text
fn decode_html_entities(s: &str) -> String {
    s.replace("&amp;", "&")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&#39;", "'")
        .replace("&nbsp;", " ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gmail::api::{Header as ApiHeader, MessageBody};
    use base64::prelude::*;

    fn header(name: &str, value: &str) -> ApiHeader {
        ApiHeader {
            name: name.to_string(),
            value: value.to_string(),
        }
    }

    fn text_part(mime: &str, text: &str) -> MessagePart {
        MessagePart {
            mime_type: Some(mime.to_string()),
            body: Some(MessageBody {
                size: Some(text.len() as u64),
                data: Some(BASE64_URL_SAFE_NO_PAD.encode(text)),
                attachment_id: None,
            }),
            ..MessagePart::default()
        }
    }

    fn multipart_message() -> GmailMessage {
        GmailMessage {
            id: "m1".to_string(),
            thread_id: "t1".to_string(),
            label_ids: Some(vec!["INBOX".to_string(), "UNREAD".to_string()]),
            snippet: "Hi &amp; welcome".to_string(),
            internal_date: Some("1700000000000".to_string()),
            history_id: Some("900".to_string()),
            size_estimate: Some(2048),
            payload: Some(api::MessagePayload {
                headers: Some(vec![
                    header("From", "Ann <ann@example.com>"),
                    header("Subject", "Hello"),
                    header("Date", "Tue, 14 Nov 2023 22:13:20 +0000"),
                ]),
                mime_type: Some("multipart/alternative".to_string()),
                parts: Some(vec![
                    text_part("text/plain", "plain body"),
                    text_part("text/html", "<p>html body</p>"),
                ]),
                ..api::MessagePayload::default()
            }),
        }
    }

    #[test]
    fn test_normalize_multipart() {
        let detail = normalize_detail(multipart_message(), &ThreadId::new("fallback")).unwrap();

        assert_eq!(detail.thread_id.as_str(), "t1");
        assert_eq!(detail.internal_date, 1_700_000_000_000);
        assert_eq!(detail.subject, "Hello");
        assert_eq!(detail.from.as_ref().unwrap().email, "ann@example.com");
        assert_eq!(detail.snippet, "Hi & welcome");
        assert_eq!(detail.label_ids.len(), 2);
        assert_eq!(detail.payload.parts.len(), 2);
        assert_eq!(detail.payload.body("text/plain"), Some("plain body"));
        assert_eq!(detail.payload.body("text/html"), Some("<p>html body</p>"));
    }

    #[test]
    fn test_internal_date_falls_back_to_date_header() {
        let mut msg = multipart_message();
        msg.internal_date = None;

        let detail = normalize_detail(msg, &ThreadId::new("t1")).unwrap();
        assert_eq!(detail.internal_date, 1_700_000_000_000);
    }

    #[test]
    fn test_internal_date_never_missing() {
        let mut msg = multipart_message();
        msg.internal_date = None;
        if let Some(payload) = msg.payload.as_mut() {
            payload.headers = None;
        }

        let before = Utc::now().timestamp_millis();
        let detail = normalize_detail(msg, &ThreadId::new("t1")).unwrap();
        assert!(detail.internal_date >= before);
    }

    #[test]
    fn test_missing_payload_is_data_error() {
        let mut msg = multipart_message();
        msg.payload = None;
        let err = normalize_detail(msg, &ThreadId::new("t1")).unwrap_err();
        assert!(err.is_data_error());
    }

    #[test]
    fn test_missing_thread_uses_fallback() {
        let mut msg = multipart_message();
        msg.thread_id = String::new();
        let detail = normalize_detail(msg, &ThreadId::new("stub-thread")).unwrap();
        assert_eq!(detail.thread_id.as_str(), "stub-thread");
    }

    #[test]
    fn test_parse_date_header_with_comment() {
        assert_eq!(
            parse_date_header("Tue, 14 Nov 2023 22:13:20 +0000 (UTC)"),
            Some(1_700_000_000_000)
        );
        assert_eq!(parse_date_header("not a date"), None);
    }

    #[test]
    fn test_attachment_part_is_not_decoded() {
        let part = MessagePart {
            mime_type: Some("application/pdf".to_string()),
            filename: Some("report.pdf".to_string()),
            body: Some(MessageBody {
                size: Some(10),
                data: None,
                attachment_id: Some("att-1".to_string()),
            }),
            ..MessagePart::default()
        };
        let mut out = Vec::new();
        collect_parts(&part, &mut out);
        assert_eq!(out.len(), 1);
        assert!(out[0].text.is_none());
        assert_eq!(out[0].attachment_id.as_deref(), Some("att-1"));
    }

    #[test]
    fn test_normalize_label() {
        let mut remote = GmailLabel::new("INBOX", "INBOX");
        remote.label_type = Some("system".to_string());
        remote.messages_unread = Some(3);
        let label = normalize_label(remote).unwrap();
        assert!(label.is_system);
        assert_eq!(label.messages_unread, 3);
        assert_eq!(label.messages_total, 0);

        let unnamed = normalize_label(GmailLabel::new("Label_9", "")).unwrap();
        assert_eq!(unnamed.name, "Label_9");
        assert!(!unnamed.is_system);

        assert!(normalize_label(GmailLabel::new("", "orphan")).is_none());
    }

    #[test]
    fn test_decode_base64_body() {
        assert_eq!(
            decode_base64_body("SGVsbG8sIFdvcmxkIQ"),
            Some("Hello, World!".to_string())
        );
    }
}
