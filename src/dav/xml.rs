//! WebDAV/CardDAV request bodies and multistatus parsing.

use quick_xml::escape::escape;
use quick_xml::events::Event;
use quick_xml::Reader;

use crate::error::{Error, Result};

// ============================================================================
// Request bodies
// ============================================================================

pub fn propfind_current_user_principal() -> String {
    r#"<?xml version="1.0" encoding="utf-8"?>
<d:propfind xmlns:d="DAV:">
  <d:prop>
    <d:current-user-principal/>
  </d:prop>
</d:propfind>"#
        .to_string()
}

pub fn propfind_home_set() -> String {
    r#"<?xml version="1.0" encoding="utf-8"?>
<d:propfind xmlns:d="DAV:" xmlns:card="urn:ietf:params:xml:ns:carddav">
  <d:prop>
    <card:addressbook-home-set/>
  </d:prop>
</d:propfind>"#
        .to_string()
}

pub fn propfind_address_books() -> String {
    r#"<?xml version="1.0" encoding="utf-8"?>
<d:propfind xmlns:d="DAV:" xmlns:card="urn:ietf:params:xml:ns:carddav">
  <d:prop>
    <d:resourcetype/>
    <d:displayname/>
    <card:addressbook-description/>
  </d:prop>
</d:propfind>"#
        .to_string()
}

/// `addressbook-query` REPORT body. `filter` is `(property, value)` matched
/// with `equals` under case-insensitive collation; `None` selects every card.
pub fn addressbook_query(filter: Option<(&str, &str)>) -> String {
    let filter = match filter {
        Some((name, value)) => format!(
            r#"<card:filter>
    <card:prop-filter name="{}">
      <card:text-match collation="i;unicode-casemap" match-type="equals">{}</card:text-match>
    </card:prop-filter>
  </card:filter>"#,
            escape(name),
            escape(value)
        ),
        None => "<card:filter/>".to_string(),
    };
    format!(
        r#"<?xml version="1.0" encoding="utf-8"?>
<card:addressbook-query xmlns:d="DAV:" xmlns:card="urn:ietf:params:xml:ns:carddav">
  <d:prop>
    <d:getetag/>
    <card:address-data/>
  </d:prop>
  {}
</card:addressbook-query>"#,
        filter
    )
}

// ============================================================================
// Multistatus parsing
// ============================================================================

/// Properties gathered from the successful propstat blocks of one response.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Props {
    pub current_user_principal: Option<String>,
    pub addressbook_home_set: Option<String>,
    /// Local names of the resourcetype children (`collection`, `addressbook`, ...).
    pub resource_types: Vec<String>,
    pub display_name: Option<String>,
    pub description: Option<String>,
    pub etag: Option<String>,
    pub address_data: Option<String>,
}

impl Props {
    fn merge(&mut self, other: Props) {
        self.current_user_principal = other.current_user_principal.or(self.current_user_principal.take());
        self.addressbook_home_set = other.addressbook_home_set.or(self.addressbook_home_set.take());
        self.resource_types.extend(other.resource_types);
        self.display_name = other.display_name.or(self.display_name.take());
        self.description = other.description.or(self.description.take());
        self.etag = other.etag.or(self.etag.take());
        self.address_data = other.address_data.or(self.address_data.take());
    }

    pub fn is_address_book(&self) -> bool {
        self.resource_types.iter().any(|t| t == "addressbook")
    }
}

/// One `<d:response>` element.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Entry {
    pub href: String,
    /// Response-level status, present for e.g. deleted members.
    pub status: Option<u16>,
    pub props: Props,
}

fn status_code(line: &str) -> Option<u16> {
    line.split_whitespace().nth(1).and_then(|code| code.parse().ok())
}

fn set_text(slot: &mut Option<String>, text: &str) {
    slot.get_or_insert_with(String::new).push_str(text);
}

/// Parse a `207 Multi-Status` body, matching elements by local name.
pub fn parse_multistatus(body: &str) -> Result<Vec<Entry>> {
    let mut reader = Reader::from_str(body);
    reader.config_mut().trim_text(true);

    let mut stack: Vec<String> = Vec::new();
    let mut entries = Vec::new();
    let mut entry: Option<Entry> = None;
    let mut propstat: Option<(Props, Option<u16>)> = None;

    loop {
        let text = match reader.read_event()? {
            Event::Start(e) => {
                let name = String::from_utf8_lossy(e.local_name().as_ref()).into_owned();
                match name.as_str() {
                    "response" => entry = Some(Entry::default()),
                    "propstat" => propstat = Some((Props::default(), None)),
                    _ => {
                        if stack.last().map(String::as_str) == Some("resourcetype") {
                            if let Some((props, _)) = propstat.as_mut() {
                                props.resource_types.push(name.clone());
                            }
                        }
                    }
                }
                stack.push(name);
                continue;
            }
            Event::Empty(e) => {
                if stack.last().map(String::as_str) == Some("resourcetype") {
                    if let Some((props, _)) = propstat.as_mut() {
                        let name = String::from_utf8_lossy(e.local_name().as_ref()).into_owned();
                        props.resource_types.push(name);
                    }
                }
                continue;
            }
            Event::End(e) => {
                let name = String::from_utf8_lossy(e.local_name().as_ref()).into_owned();
                if stack.pop().as_deref() != Some(name.as_str()) {
                    return Err(Error::Xml(format!("unbalanced element </{}>", name)));
                }
                match name.as_str() {
                    "propstat" => {
                        if let (Some((props, status)), Some(entry)) = (propstat.take(), entry.as_mut()) {
                            // only successful propstats carry values
                            if matches!(status, None | Some(200..=299)) {
                                entry.props.merge(props);
                            }
                        }
                    }
                    "response" => {
                        if let Some(entry) = entry.take() {
                            entries.push(entry);
                        }
                    }
                    _ => {}
                }
                continue;
            }
            Event::Text(e) => e
                .unescape()
                .map_err(|err| Error::Xml(err.to_string()))?
                .into_owned(),
            Event::CData(e) => String::from_utf8_lossy(&e.into_inner()).into_owned(),
            Event::Eof => break,
            _ => continue,
        };

        let current = stack.last().map(String::as_str).unwrap_or_default();
        let parent = stack
            .len()
            .checked_sub(2)
            .map(|i| stack[i].as_str())
            .unwrap_or_default();

        match (parent, current) {
            ("response", "href") => {
                if let Some(entry) = entry.as_mut() {
                    entry.href.push_str(&text);
                }
            }
            ("response", "status") => {
                if let Some(entry) = entry.as_mut() {
                    entry.status = status_code(&text);
                }
            }
            ("propstat", "status") => {
                if let Some((_, status)) = propstat.as_mut() {
                    *status = status_code(&text);
                }
            }
            (parent, current) => {
                let Some((props, _)) = propstat.as_mut() else {
                    continue;
                };
                match (parent, current) {
                    ("current-user-principal", "href") => {
                        set_text(&mut props.current_user_principal, &text)
                    }
                    ("addressbook-home-set", "href") => {
                        set_text(&mut props.addressbook_home_set, &text)
                    }
                    (_, "displayname") => set_text(&mut props.display_name, &text),
                    (_, "addressbook-description") => set_text(&mut props.description, &text),
                    (_, "getetag") => set_text(&mut props.etag, &text),
                    (_, "address-data") => set_text(&mut props.address_data, &text),
                    _ => {}
                }
            }
        }
    }

    if !stack.is_empty() {
        return Err(Error::Xml(format!("unclosed element <{}>", stack.join("/"))));
    }
    Ok(entries)
}
