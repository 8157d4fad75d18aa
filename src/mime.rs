//! MIME parsing helpers on top of `mailparse`.
//!
//! Extracts the pieces of a wire message the data model cares about: decoded
//! headers, address lists, text/HTML bodies (honoring Content-Disposition so
//! attachments are not mistaken for bodies) and attachment metadata.

use chrono::{DateTime, TimeZone, Utc};
use mailparse::{DispositionType, MailHeaderMap, ParsedMail};

use crate::types::{Address, Attachment};

/// Decode a raw header value (RFC 2047 encoded words included) by running it
/// back through the header parser.
pub fn decode_header_value(raw: &str) -> String {
    let synthetic = format!("X-Decode: {raw}\r\n\r\n");
    match mailparse::parse_headers(synthetic.as_bytes()) {
        Ok((headers, _)) => headers
            .get_first_value("X-Decode")
            .unwrap_or_else(|| raw.to_string()),
        Err(_) => raw.to_string(),
    }
}

/// Parse a comma-separated address header into model addresses.
pub fn parse_address_list(header: Option<&str>) -> Vec<Address> {
    let Some(header) = header else {
        return Vec::new();
    };
    let trimmed = header.trim();
    if trimmed.is_empty() {
        return Vec::new();
    }

    let Ok(parsed) = mailparse::addrparse(trimmed) else {
        return Vec::new();
    };

    let mut out = Vec::new();
    for addr in parsed.iter() {
        match addr {
            mailparse::MailAddr::Single(info) => {
                out.push(Address::new(
                    info.addr.clone(),
                    info.display_name.clone().unwrap_or_default(),
                ));
            }
            mailparse::MailAddr::Group(group) => {
                for info in &group.addrs {
                    out.push(Address::new(
                        info.addr.clone(),
                        info.display_name.clone().unwrap_or_default(),
                    ));
                }
            }
        }
    }
    out
}

/// Split a References header into its message ids (space-separated).
pub fn parse_references(header: Option<&str>) -> Vec<String> {
    header
        .map(|raw| {
            raw.split_whitespace()
                .filter(|r| !r.is_empty())
                .map(|r| r.to_string())
                .collect()
        })
        .unwrap_or_default()
}

/// Parse a Date header into UTC, falling back to the given default.
pub fn parse_date_header(header: Option<&str>, fallback: DateTime<Utc>) -> DateTime<Utc> {
    header
        .and_then(|raw| mailparse::dateparse(raw).ok())
        .and_then(|ts| Utc.timestamp_opt(ts, 0).single())
        .unwrap_or(fallback)
}

/// Extract the plain-text and HTML bodies of a message. Attachment parts are
/// skipped. When the message only carries HTML, a plain-text rendition is
/// derived from it so the text body (and the search index) is never empty for
/// HTML-only mail.
pub fn extract_bodies(parsed: &ParsedMail) -> (Option<String>, Option<String>) {
    let mut text: Option<String> = None;
    let mut html: Option<String> = None;
    collect_bodies(parsed, &mut text, &mut html);

    if text.is_none() {
        if let Some(html_body) = &html {
            text = Some(html2text::from_read(html_body.as_bytes(), 80).unwrap_or_default());
        }
    }

    (text, html)
}

fn collect_bodies(part: &ParsedMail, text: &mut Option<String>, html: &mut Option<String>) {
    if part.subparts.is_empty() {
        let disposition = part.get_content_disposition();
        if disposition.disposition == DispositionType::Attachment {
            return;
        }

        let mimetype = part.ctype.mimetype.to_ascii_lowercase();
        if mimetype == "text/plain" && text.is_none() {
            if let Ok(body) = part.get_body() {
                *text = Some(body);
            }
        } else if mimetype == "text/html" && html.is_none() {
            if let Ok(body) = part.get_body() {
                *html = Some(body);
            }
        }
        return;
    }

    for sub in &part.subparts {
        collect_bodies(sub, text, html);
    }
}

/// Extract attachment metadata: filename, decoded size, content type.
pub fn extract_attachments(parsed: &ParsedMail) -> Vec<Attachment> {
    let mut attachments = Vec::new();
    collect_attachments(parsed, &mut attachments);
    attachments
}

fn collect_attachments(part: &ParsedMail, out: &mut Vec<Attachment>) {
    if part.subparts.is_empty() {
        let disposition = part.get_content_disposition();
        if disposition.disposition == DispositionType::Attachment {
            let filename = attachment_filename(part);
            let size = part.get_body_raw().map(|b| b.len() as u64).unwrap_or(0);
            out.push(Attachment {
                filename,
                size,
                content_type: part.ctype.mimetype.clone(),
            });
        }
        return;
    }
    for sub in &part.subparts {
        collect_attachments(sub, out);
    }
}

fn attachment_filename(part: &ParsedMail) -> String {
    let disposition = part.get_content_disposition();
    disposition
        .params
        .get("filename")
        .cloned()
        .or_else(|| part.ctype.params.get("name").cloned())
        .map(|name| decode_header_value(&name))
        .unwrap_or_else(|| "unnamed".to_string())
}

/// Find the decoded bytes of the attachment with the given filename.
pub fn find_attachment_bytes(parsed: &ParsedMail, filename: &str) -> Option<Vec<u8>> {
    if parsed.subparts.is_empty() {
        let disposition = parsed.get_content_disposition();
        if disposition.disposition == DispositionType::Attachment
            && attachment_filename(parsed) == filename
        {
            return parsed.get_body_raw().ok();
        }
        return None;
    }
    parsed
        .subparts
        .iter()
        .find_map(|sub| find_attachment_bytes(sub, filename))
}
