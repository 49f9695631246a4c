//! Contact cards: building new vCards and reading the ones a server returns.
//!
//! Both directions go through `vcard4`. Server cards may be 3.0 or 4.0
//! (Baikal happily stores 3.0 cards written by other clients), so they are
//! read loosely: a malformed property is skipped rather than failing the card.

use serde::Serialize;
use uuid::Uuid;
use vcard4::property::{TextListProperty, TextOrUriProperty, TextProperty};
use vcard4::Vcard;

use crate::error::{Error, Result};

/// A contact as stored on the server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Contact {
    /// Resource path of the card.
    pub href: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub etag: Option<String>,
    pub uid: String,
    pub emails: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub formatted_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub given_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub family_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub additional_name: Option<String>,
    /// The card text exactly as received.
    #[serde(skip)]
    pub raw: String,
}

impl Contact {
    /// Parse a card returned by the server.
    pub fn parse(href: &str, etag: Option<String>, data: &str) -> Result<Self> {
        let card = vcard4::parse_loose(data)
            .map_err(|err| Error::Format(format!("{}: not a vCard: {}", href, err)))?
            .into_iter()
            .next()
            .ok_or_else(|| Error::Format(format!("{}: not a vCard", href)))?;

        let uid = card_uid(&card)
            .filter(|u| !u.is_empty())
            .ok_or_else(|| Error::Format(format!("{}: card has no UID", href)))?;
        let component = |index: usize| {
            card.name
                .as_ref()
                .and_then(|n| n.value.get(index))
                .map(|s| s.trim())
                .filter(|s| !s.is_empty())
                .map(str::to_string)
        };

        Ok(Self {
            href: href.to_string(),
            etag,
            uid,
            emails: card
                .email
                .iter()
                .map(|p| p.value.trim())
                .filter(|e| !e.is_empty())
                .map(str::to_string)
                .collect(),
            formatted_name: card
                .formatted_name
                .first()
                .map(|p| p.value.trim().to_string())
                .filter(|s| !s.is_empty()),
            family_name: component(0),
            given_name: component(1),
            additional_name: component(2),
            raw: data.to_string(),
        })
    }

    /// Whether any EMAIL of this card equals `email` (case-insensitive).
    pub fn has_email(&self, email: &str) -> bool {
        self.emails.iter().any(|e| e.eq_ignore_ascii_case(email))
    }
}

/// Render a new minimal vCard 4.0 for `email`.
///
/// `name` is split on its first space into given and family name; a single
/// word becomes the additional name. FN falls back to the address.
pub fn new_card(uid: &Uuid, email: &str, name: Option<&str>) -> Result<String> {
    let name = name.map(str::trim).filter(|n| !n.is_empty());
    let mut card = Vcard::new(name.unwrap_or(email).to_string());
    card.uid = Some(TextOrUriProperty::Text(TextProperty {
        group: None,
        value: uid.to_string(),
        parameters: None,
    }));
    if let Some(name) = name {
        let (family, given, additional) = match name.split_once(' ') {
            Some((given, family)) => (family.trim(), given, ""),
            None => ("", "", name),
        };
        card.name = Some(TextListProperty::new_semi_colon(
            [family, given, additional, "", ""]
                .into_iter()
                .map(str::to_string)
                .collect(),
        ));
    }
    card.email.push(TextProperty {
        group: None,
        value: email.to_string(),
        parameters: None,
    });
    card.validate()
        .map_err(|err| Error::Format(format!("cannot build card for {}: {}", email, err)))?;
    Ok(card.to_string())
}

fn card_uid(card: &Vcard) -> Option<String> {
    match &card.uid {
        Some(TextOrUriProperty::Text(text)) => Some(text.value.trim().to_string()),
        Some(TextOrUriProperty::Uri(uri)) => Some(uri.value.to_string()),
        None => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_card_with_full_name() {
        let uid = Uuid::new_v4();
        let text = new_card(&uid, "ada@example.org", Some("Ada Lovelace King")).unwrap();
        assert!(text.starts_with("BEGIN:VCARD\r\nVERSION:4.0\r\n"));

        let contact = Contact::parse("/x/1.vcf", None, &text).unwrap();
        assert_eq!(contact.uid, uid.to_string());
        assert_eq!(contact.emails, vec!["ada@example.org"]);
        assert_eq!(contact.formatted_name.as_deref(), Some("Ada Lovelace King"));
        assert_eq!(contact.given_name.as_deref(), Some("Ada"));
        assert_eq!(contact.family_name.as_deref(), Some("Lovelace King"));
        assert_eq!(contact.additional_name, None);
    }

    #[test]
    fn test_new_card_single_word_and_no_name() {
        let uid = Uuid::new_v4();
        let single = Contact::parse("h", None, &new_card(&uid, "x@y.z", Some("Cher")).unwrap()).unwrap();
        assert_eq!(single.additional_name.as_deref(), Some("Cher"));
        assert_eq!(single.given_name, None);

        let bare = Contact::parse("h", None, &new_card(&uid, "x@y.z", None).unwrap()).unwrap();
        assert_eq!(bare.formatted_name.as_deref(), Some("x@y.z"));
        assert_eq!(bare.family_name, None);
        assert!(!bare.raw.contains("\nN:"));
    }

    #[test]
    fn test_new_card_escapes_commas_in_names() {
        let uid = Uuid::new_v4();
        let text = new_card(&uid, "pat@y.z", Some("Pat Smith, Jr")).unwrap();
        assert!(text.contains("FN:Pat Smith\\, Jr\r\n"));
        let contact = Contact::parse("h", None, &text).unwrap();
        assert_eq!(contact.formatted_name.as_deref(), Some("Pat Smith, Jr"));
        assert_eq!(contact.family_name.as_deref(), Some("Smith, Jr"));
    }

    #[test]
    fn test_parse_vcard3_with_groups_and_folding() {
        let data = "BEGIN:VCARD\r\nVERSION:3.0\r\nUID:abc-123\r\nFN:Jane\r\n  Doe\r\nN:Doe;Jane;;;\r\nitem1.EMAIL;TYPE=INTERNET:jane@example.org\r\nEMAIL:Jane.Doe@Work.example\r\nTEL:+1 555\r\nEND:VCARD\r\n";
        let contact = Contact::parse("/b/abc-123.vcf", Some("\"e1\"".into()), data).unwrap();
        assert_eq!(contact.uid, "abc-123");
        assert_eq!(contact.formatted_name.as_deref(), Some("Jane Doe"));
        assert_eq!(contact.family_name.as_deref(), Some("Doe"));
        assert_eq!(contact.given_name.as_deref(), Some("Jane"));
        assert_eq!(contact.emails, vec!["jane@example.org", "Jane.Doe@Work.example"]);
        assert!(contact.has_email("jane.doe@work.example"));
        assert_eq!(contact.raw, data);
    }

    #[test]
    fn test_parse_urn_uid() {
        let data = "BEGIN:VCARD\r\nVERSION:4.0\r\nFN:Bo\r\nUID:urn:uuid:4fbe8971-0bc3-424c-9c26-36c3e1eff6b1\r\nEND:VCARD\r\n";
        let contact = Contact::parse("h", None, data).unwrap();
        assert_eq!(contact.uid, "urn:uuid:4fbe8971-0bc3-424c-9c26-36c3e1eff6b1");
        assert!(contact.emails.is_empty());
    }

    #[test]
    fn test_parse_rejects_missing_uid_and_garbage() {
        assert!(matches!(
            Contact::parse("h", None, "BEGIN:VCARD\r\nVERSION:4.0\r\nFN:A\r\nEMAIL:a@b.c\r\nEND:VCARD\r\n"),
            Err(Error::Format(_))
        ));
        assert!(matches!(
            Contact::parse("h", None, "hello"),
            Err(Error::Format(_))
        ));
    }
}
