use anyhow::{Context, Result};
use base64::Engine as _;
use html2text::from_read;
use mailparse::{DispositionType, MailHeaderMap, ParsedMail};

use crate::remote::BodyContent;
use crate::types::Attachment;

const SNIPPET_CHARS: usize = 200;
const EMPTY_SNIPPET: &str = "(no text content)";

/// Parses a full RFC 5322 message into the cached body form.
pub fn extract(raw: &[u8]) -> Result<BodyContent> {
    let parsed = mailparse::parse_mail(raw).context("parsing MIME message")?;
    Ok(extract_parsed(&parsed))
}

/// Like `extract`, but never fails: unparseable input is kept as plain text.
pub fn extract_lossy(raw: &[u8]) -> BodyContent {
    extract(raw).unwrap_or_else(|_| {
        let html = text_to_html(&String::from_utf8_lossy(raw));
        BodyContent {
            snippet: snippet_from_html(&html),
            html,
            attachments: Vec::new(),
        }
    })
}

pub fn extract_parsed(parsed: &ParsedMail) -> BodyContent {
    let mut parts = Parts::default();
    walk(parsed, "", &mut parts);

    let html = match (parts.html, parts.text) {
        (Some(html), _) if !html.trim().is_empty() => html,
        (_, Some(text)) => text_to_html(&text),
        _ => text_to_html(""),
    };

    BodyContent {
        snippet: snippet_from_html(&html),
        html,
        attachments: parts.attachments,
    }
}

#[derive(Default)]
struct Parts {
    html: Option<String>,
    text: Option<String>,
    attachments: Vec<Attachment>,
}

// Part ids follow IMAP section numbering: a single-part message is "1",
// children of a multipart are "1", "2", nested ones "1.2".
fn walk(part: &ParsedMail, id: &str, out: &mut Parts) {
    if !part.subparts.is_empty() {
        for (idx, sub) in part.subparts.iter().enumerate() {
            let child = if id.is_empty() {
                (idx + 1).to_string()
            } else {
                format!("{id}.{}", idx + 1)
            };
            walk(sub, &child, out);
        }
        return;
    }

    let leaf_id = if id.is_empty() { "1" } else { id };
    let disposition = part.get_content_disposition();
    let filename = disposition
        .params
        .get("filename")
        .or_else(|| part.ctype.params.get("name"))
        .cloned();

    if disposition.disposition == DispositionType::Attachment || filename.is_some() {
        let size = part.get_body_raw().map(|b| b.len() as u64).unwrap_or(0);
        out.attachments.push(Attachment {
            part_id: leaf_id.to_string(),
            filename: filename.unwrap_or_else(|| format!("part-{leaf_id}")),
            content_type: part.ctype.mimetype.clone(),
            size,
            encoding: part
                .headers
                .get_first_value("Content-Transfer-Encoding")
                .map(|v| v.trim().to_ascii_lowercase())
                .unwrap_or_else(|| "7bit".to_string()),
        });
        return;
    }

    let mimetype = part.ctype.mimetype.to_ascii_lowercase();
    if mimetype == "text/html" && out.html.is_none() {
        out.html = part.get_body().ok();
    } else if mimetype == "text/plain" && out.text.is_none() {
        out.text = part.get_body().ok();
    }
}

fn text_to_html(text: &str) -> String {
    let escaped = text
        .replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;");
    format!("<pre>{escaped}</pre>")
}

/// Short plain-text preview. Never empty, so a fetched body always carries one.
pub fn snippet_from_html(html: &str) -> String {
    let text = from_read(html.as_bytes(), 80).unwrap_or_default();
    let collapsed = text.split_whitespace().collect::<Vec<_>>().join(" ");
    if collapsed.is_empty() {
        return EMPTY_SNIPPET.to_string();
    }
    match collapsed.char_indices().nth(SNIPPET_CHARS) {
        Some((cut, _)) => format!("{}...", &collapsed[..cut]),
        None => collapsed,
    }
}

/// Undoes the Content-Transfer-Encoding of a fetched part.
pub fn decode_transfer(raw: &[u8], encoding: &str) -> Result<Vec<u8>> {
    match encoding.trim().to_ascii_lowercase().as_str() {
        "base64" => {
            let compact: Vec<u8> = raw
                .iter()
                .copied()
                .filter(|b| !b.is_ascii_whitespace())
                .collect();
            base64::engine::general_purpose::STANDARD
                .decode(compact)
                .context("decoding base64 part")
        }
        "quoted-printable" => {
            quoted_printable::decode(raw, quoted_printable::ParseMode::Robust)
                .context("decoding quoted-printable part")
        }
        _ => Ok(raw.to_vec()),
    }
}
