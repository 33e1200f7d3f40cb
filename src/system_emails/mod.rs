//! Synthesised system mail: delivery status notifications for messages the
//! pipeline could not deliver.

use crate::{delivery::SendError, models::Message};
use mail_builder::{
    MessageBuilder,
    headers::{HeaderType, content_type::ContentType},
    mime::{BodyPart, MimePart, make_boundary},
};
use std::fmt::Write;

/// At most this much of the original message is quoted in the report.
const MAX_HEADER_SIZE: usize = 4096;

/// Build the DSN (RFC 6522 multipart/report) for a message that failed
/// terminally. The bounce goes back to the original envelope sender with a
/// null sender of its own, so it can never bounce again.
pub fn build_bounce(message: &Message, error: &SendError, reporting_mta: &str) -> Message {
    let temporary = error.is_temporary();

    let mut text = format!(
        "This is the mail system at host {reporting_mta}.\r\n\r\n\
         I'm sorry to have to inform you that your message could not\r\n\
         be delivered to one or more recipients.\r\n\r\n"
    );
    for recipient in &message.to {
        let _ = write!(text, "<{recipient}>: {error}\r\n");
    }
    if temporary {
        text.push_str("\r\nDelivery was retried but kept failing; the message has been given up on.\r\n");
    }

    let mut dsn = String::new();
    let _ = write!(dsn, "Reporting-MTA: dns;{reporting_mta}\r\n");
    let _ = write!(dsn, "Arrival-Date: {}\r\n", message.created_at.to_rfc2822());
    dsn.push_str("\r\n");
    for recipient in &message.to {
        let _ = write!(dsn, "Final-Recipient: rfc822; {recipient}\r\n");
        let _ = write!(
            dsn,
            "Action: {}\r\n",
            if temporary { "delayed" } else { "failed" }
        );
        let _ = write!(
            dsn,
            "Status: {}\r\n",
            if temporary { "4.0.0" } else { "5.0.0" }
        );
        let _ = write!(dsn, "Diagnostic-Code: smtp; {error}\r\n");
        dsn.push_str("\r\n");
    }

    let original = original_headers(&message.data);
    let from_addr = format!("mailer-daemon@{reporting_mta}");

    let data = MessageBuilder::new()
        .from(("Mail Delivery Subsystem", from_addr.as_str()))
        .header("To", HeaderType::Text(message.from.as_str().into()))
        .header("Auto-Submitted", HeaderType::Text("auto-replied".into()))
        .message_id(format!("<{}@{}>", make_boundary("."), reporting_mta))
        .subject("Delivery Status Notification (Failure)")
        .body(MimePart::new(
            ContentType::new("multipart/report").attribute("report-type", "delivery-status"),
            BodyPart::Multipart(vec![
                MimePart::new(ContentType::new("text/plain"), BodyPart::Text(text.into())),
                MimePart::new(
                    ContentType::new("message/delivery-status"),
                    BodyPart::Text(dsn.into()),
                ),
                MimePart::new(
                    ContentType::new("message/rfc822"),
                    BodyPart::Text(original.into()),
                ),
            ]),
        ))
        .write_to_vec()
        .unwrap_or_default();

    let mut bounce = Message::new(String::new(), vec![message.from.clone()], data);
    bounce.id = format!("{}-bounce", message.id);
    bounce
}

/// The original message's header block, up to the first blank line, capped
/// at [`MAX_HEADER_SIZE`] bytes.
fn original_headers(data: &[u8]) -> String {
    let mut buf = &data[..data.len().min(MAX_HEADER_SIZE)];

    let mut prev = 0u8;
    let mut last_lf = buf.len();
    for (pos, &ch) in buf.iter().enumerate() {
        match ch {
            b'\n' => {
                last_lf = pos + 1;
                if prev == b'\n' {
                    break;
                }
                prev = ch;
            }
            b'\r' => (),
            0 => break,
            _ => prev = ch,
        }
    }
    if last_lf < buf.len() {
        buf = &buf[..last_lf];
    }

    String::from_utf8_lossy(buf).into_owned()
}
