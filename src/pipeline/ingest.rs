//! Raw RFC 822 mail → `Message`.

use chrono::{DateTime, Utc};
use mail_parser::{MessageParser, MimeHeaders};
use tracing::debug;
use uuid::Uuid;

use crate::error::ClassificationError;
use crate::pipeline::types::{Attachment, Message};

/// Parse raw mail bytes. Bytes that don't parse as mail are `CorruptInput`.
pub fn parse_rfc822(raw: &[u8]) -> Result<Message, ClassificationError> {
    if raw.iter().all(|b| b.is_ascii_whitespace()) {
        return Err(ClassificationError::CorruptInput("empty mail".into()));
    }
    let parsed = MessageParser::default()
        .parse(raw)
        .ok_or_else(|| ClassificationError::CorruptInput("unparseable mail".into()))?;

    let id = parsed
        .message_id()
        .map(|s| s.to_string())
        .unwrap_or_else(|| format!("gen-{}", Uuid::new_v4()));

    let attachments: Vec<Attachment> = parsed
        .attachments()
        .map(|part| {
            let part: &mail_parser::MessagePart = part;
            let media_type = MimeHeaders::content_type(part)
                .map(|ct| match ct.subtype() {
                    Some(sub) => format!("{}/{}", ct.ctype(), sub),
                    None => ct.ctype().to_string(),
                })
                .unwrap_or_else(|| "application/octet-stream".to_string());
            Attachment {
                name: MimeHeaders::attachment_name(part)
                    .unwrap_or("unnamed")
                    .to_string(),
                size: part.contents().len() as u64,
                media_type,
            }
        })
        .collect();

    let received_at = parsed
        .date()
        .and_then(|d| DateTime::<Utc>::from_timestamp(d.to_timestamp(), 0))
        .unwrap_or_else(Utc::now);

    let message = Message {
        id,
        sender: first_address(parsed.from()),
        recipient: first_address(parsed.to()),
        subject: parsed.subject().unwrap_or_default().to_string(),
        body: parsed
            .body_text(0)
            .map(|t| t.to_string())
            .unwrap_or_default(),
        attachments,
        received_at,
    };

    debug!(
        id = %message.id,
        sender = %message.sender,
        attachments = message.attachments.len(),
        "Parsed raw mail"
    );
    Ok(message)
}

fn first_address(addr: Option<&mail_parser::Address>) -> String {
    addr.and_then(|a| a.first())
        .and_then(|a| a.address())
        .map(|s| s.to_string())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    const SIMPLE: &str = "From: Jane Client <jane@example.com>\r\n\
To: smith-v-jones@firm.com\r\n\
Subject: URGENT: Motion for Summary Judgment\r\n\
Message-ID: <abc123@example.com>\r\n\
Date: Tue, 14 Jan 2025 09:30:00 +0000\r\n\
\r\n\
Opposing counsel filed this morning.\r\n";

    const WITH_ATTACHMENT: &str = "From: jane@example.com\r\n\
To: intake@firm.com\r\n\
Subject: Signed lease\r\n\
MIME-Version: 1.0\r\n\
Content-Type: multipart/mixed; boundary=\"XX\"\r\n\
\r\n\
--XX\r\n\
Content-Type: text/plain\r\n\
\r\n\
See attached.\r\n\
--XX\r\n\
Content-Type: application/pdf\r\n\
Content-Disposition: attachment; filename=\"lease.pdf\"\r\n\
\r\n\
PDFDATA\r\n\
--XX--\r\n";

    #[test]
    fn parses_headers_and_body() {
        let m = parse_rfc822(SIMPLE.as_bytes()).unwrap();
        assert_eq!(m.id, "abc123@example.com");
        assert_eq!(m.sender, "jane@example.com");
        assert_eq!(m.recipient, "smith-v-jones@firm.com");
        assert_eq!(m.subject, "URGENT: Motion for Summary Judgment");
        assert!(m.body.contains("Opposing counsel"));
        assert_eq!(m.received_at.timestamp(), 1_736_847_000);
    }

    #[test]
    fn parses_attachments() {
        let m = parse_rfc822(WITH_ATTACHMENT.as_bytes()).unwrap();
        assert_eq!(m.attachments.len(), 1);
        assert_eq!(m.attachments[0].name, "lease.pdf");
        assert_eq!(m.attachments[0].media_type, "application/pdf");
        assert!(m.body.contains("See attached"));
        assert!(m.id.starts_with("gen-"));
    }

    #[test]
    fn empty_bytes_are_corrupt() {
        let err = parse_rfc822(b"  \r\n").unwrap_err();
        assert_eq!(err.mode(), "corrupt_input");
    }
}
