//! Channel and item titles from RSS 2.0 or Atom documents.

use quick_xml::events::{BytesText, Event};
use quick_xml::Reader;

#[derive(Debug, Clone, PartialEq, Default)]
pub struct FeedDocument {
    pub title: Option<String>,
    pub items: Vec<String>,
}

/// Text gathered between a `<title>` and its matching close tag.
struct TitleCapture {
    depth: u32,
    text: String,
}

/// Reads until the end of input or the first well-formedness error; whatever
/// was complete by then is returned.
pub fn parse_feed(xml: &str) -> FeedDocument {
    let mut reader = Reader::from_str(xml);
    let mut doc = FeedDocument::default();
    let mut in_item = false;
    let mut seen_item = false;
    let mut item_title: Option<String> = None;
    let mut capture: Option<TitleCapture> = None;

    loop {
        let event = match reader.read_event() {
            Ok(Event::Eof) => break,
            Ok(event) => event,
            Err(err) => {
                tracing::debug!(
                    position = reader.buffer_position(),
                    error = %err,
                    "feed document truncated"
                );
                break;
            }
        };

        if let Some(cap) = capture.as_mut() {
            match &event {
                Event::Start(_) => cap.depth += 1,
                Event::End(_) => cap.depth -= 1,
                Event::Text(t) => cap.text.push_str(&text_of(t)),
                Event::CData(c) => cap.text.push_str(&String::from_utf8_lossy(c)),
                _ => {}
            }
            if cap.depth == 0 {
                let title = normalize(&cap.text);
                capture = None;
                if title.is_empty() {
                    continue;
                }
                if in_item {
                    item_title = Some(title);
                } else {
                    doc.title = Some(title);
                }
            }
            continue;
        }

        match event {
            Event::Start(e) => match e.local_name().as_ref() {
                b"item" | b"entry" => {
                    in_item = true;
                    seen_item = true;
                    item_title = None;
                }
                b"title" => {
                    let wanted = if in_item {
                        item_title.is_none()
                    } else {
                        !seen_item && doc.title.is_none()
                    };
                    if wanted {
                        capture = Some(TitleCapture {
                            depth: 1,
                            text: String::new(),
                        });
                    }
                }
                _ => {}
            },
            Event::End(e) if in_item && matches!(e.local_name().as_ref(), b"item" | b"entry") => {
                in_item = false;
                if let Some(title) = item_title.take() {
                    doc.items.push(title);
                }
            }
            _ => {}
        }
    }
    doc
}

/// Unknown entities and stray ampersands are kept verbatim.
fn text_of(t: &BytesText<'_>) -> String {
    t.unescape()
        .unwrap_or_else(|_| String::from_utf8_lossy(t))
        .into_owned()
}

fn normalize(raw: &str) -> String {
    raw.split_whitespace().collect::<Vec<_>>().join(" ")
}
