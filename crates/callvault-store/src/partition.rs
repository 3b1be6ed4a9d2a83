//! XML codec for backup files and per-year partitions.
//!
//! Backups and partitions share one format:
//!
//! ```xml
//! <calls count="1">
//!   <call number="+15555550100" duration="42" date="1420070400000" type="1"
//!         readable_date="Jan 1, 2015 12:00:00 AM" contact_name="Alice" />
//! </calls>
//!
//! <smses count="2">
//!   <sms address="+15555550100" date="1420070400000" type="1" body="hi" />
//!   <mms address="+15555550100" date="1420070400000" msg_box="1">
//!     <parts>
//!       <part seq="0" ct="image/jpeg" name="cat.jpg" data="/9j/4AAQ..." />
//!     </parts>
//!     <addrs><addr address="+15555550100" type="137" /></addrs>
//!   </mms>
//! </smses>
//! ```
//!
//! In a partition, part payloads are replaced by a `path` attribute pointing
//! into the attachment store. Reading always goes through [`SafeDecoder`].

use std::{collections::BTreeMap, io::{BufRead, Write}};

use base64::{Engine as _, engine::general_purpose::STANDARD as B64};
use chrono::{DateTime, TimeZone, Utc};
use quick_xml::{
  Writer,
  events::{BytesDecl, BytesEnd, BytesStart, Event},
};

use callvault_core::{
  EntityKind,
  record::{CallRecord, Message, MmsAddress, MmsPart, MmsRecord, PartPayload, SmsRecord},
};
use callvault_security::{Element, SafeDecoder, Token};

use crate::{
  Error, Result, attachment::hash_bytes,
  layout::{parse_attachment_rel_path, root_element},
};

// ─── Document ────────────────────────────────────────────────────────────────

/// A decoded backup or partition.
#[derive(Debug, Clone, Default)]
pub struct Document<T> {
  /// The root element's `count` attribute, if present and numeric.
  pub declared_count: Option<usize>,
  pub records:        Vec<T>,
  pub rejected:       Vec<Rejected>,
}

/// A record element that was well-formed XML but not a usable record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rejected {
  pub element: String,
  pub reason:  String,
}

/// Which entity a document holds, judged by its root element. `None` for
/// anything else.
pub fn sniff<R: BufRead>(decoder: &mut SafeDecoder<R>) -> Result<Option<EntityKind>> {
  while let Some(token) = decoder.next_token()? {
    if let Token::Start(el) | Token::Empty(el) = token {
      return Ok(EntityKind::ALL
        .into_iter()
        .find(|&kind| root_element(kind) == el.name));
    }
  }
  Ok(None)
}

// ─── Reading ─────────────────────────────────────────────────────────────────

pub fn read_calls<R: BufRead>(decoder: &mut SafeDecoder<R>) -> Result<Document<CallRecord>> {
  read_document(decoder, EntityKind::Calls, |decoder, token, doc| {
    match token {
      Token::Empty(el) if el.name == "call" => push(doc, "call", parse_call(el)),
      Token::Start(el) if el.name == "call" => {
        skip_element(decoder)?;
        push(doc, "call", parse_call(el));
      }
      Token::Start(_) => skip_element(decoder)?,
      _ => {}
    }
    Ok(())
  })
}

pub fn read_messages<R: BufRead>(decoder: &mut SafeDecoder<R>) -> Result<Document<Message>> {
  read_document(decoder, EntityKind::Sms, |decoder, token, doc| {
    match token {
      Token::Empty(el) if el.name == "sms" => push(doc, "sms", parse_sms(el)),
      Token::Start(el) if el.name == "sms" => {
        skip_element(decoder)?;
        push(doc, "sms", parse_sms(el));
      }
      Token::Empty(el) if el.name == "mms" => {
        push(doc, "mms", parse_mms(el, Vec::new(), Vec::new()));
      }
      Token::Start(el) if el.name == "mms" => {
        let (parts, addrs) = read_mms_children(decoder)?;
        push(doc, "mms", parse_mms(el, parts, addrs));
      }
      Token::Start(_) => skip_element(decoder)?,
      _ => {}
    }
    Ok(())
  })
}

fn read_document<T, R, F>(
  decoder: &mut SafeDecoder<R>,
  kind: EntityKind,
  mut on_child: F,
) -> Result<Document<T>>
where
  R: BufRead,
  F: FnMut(&mut SafeDecoder<R>, Token, &mut Document<T>) -> Result<()>,
{
  let expected = root_element(kind);
  let mut doc = Document {
    declared_count: None,
    records:        Vec::new(),
    rejected:       Vec::new(),
  };

  let (root, has_children) = loop {
    match decoder.next_token()? {
      Some(Token::Start(el)) => break (el, true),
      Some(Token::Empty(el)) => break (el, false),
      Some(_) => continue,
      None => return Err(Error::Malformed(format!("empty document, expected <{expected}>"))),
    }
  };
  if root.name != expected {
    return Err(Error::UnexpectedRoot {
      expected: expected.to_string(),
      found:    root.name,
    });
  }
  doc.declared_count = root.attr("count").and_then(|c| c.trim().parse().ok());

  if has_children {
    while let Some(token) = decoder.next_token()? {
      if decoder.depth() == 0 {
        break;
      }
      on_child(decoder, token, &mut doc)?;
    }
  }
  // Anything after the root element is ignored, but must still be
  // well-formed.
  while decoder.next_token()?.is_some() {}
  Ok(doc)
}

fn push<T>(doc: &mut Document<T>, element: &str, parsed: Result<T, String>) {
  match parsed {
    Ok(record) => doc.records.push(record),
    Err(reason) => doc.rejected.push(Rejected {
      element: element.to_string(),
      reason,
    }),
  }
}

/// Consume tokens up to and including the `End` of the element whose
/// `Start` was just returned.
fn skip_element<R: BufRead>(decoder: &mut SafeDecoder<R>) -> Result<()> {
  let target = decoder.depth() - 1;
  while decoder.next_token()?.is_some() {
    if decoder.depth() == target {
      return Ok(());
    }
  }
  Err(Error::Malformed("unexpected end of document".into()))
}

type MmsChildren = (Vec<Element>, Vec<Element>);

fn read_mms_children<R: BufRead>(decoder: &mut SafeDecoder<R>) -> Result<MmsChildren> {
  let target = decoder.depth() - 1;
  let mut parts = Vec::new();
  let mut addrs = Vec::new();
  while let Some(token) = decoder.next_token()? {
    if decoder.depth() == target {
      return Ok((parts, addrs));
    }
    match token {
      Token::Empty(el) if el.name == "part" => parts.push(el),
      Token::Empty(el) if el.name == "addr" => addrs.push(el),
      Token::Start(el) if el.name == "part" => {
        skip_element(decoder)?;
        parts.push(el);
      }
      Token::Start(el) if el.name == "addr" => {
        skip_element(decoder)?;
        addrs.push(el);
      }
      // <parts> and <addrs> are transparent containers.
      _ => {}
    }
  }
  Err(Error::Malformed("unexpected end of document inside <mms>".into()))
}

// ── Attribute helpers ─────────────────────────────────────────────────────

type Attrs = BTreeMap<String, String>;

fn attrs(el: Element) -> Attrs { el.attributes.into_iter().collect() }

fn required(a: &mut Attrs, key: &str) -> Result<String, String> {
  a.remove(key).ok_or_else(|| format!("missing {key:?} attribute"))
}

fn number<T: std::str::FromStr>(a: &mut Attrs, key: &str) -> Result<T, String> {
  let raw = required(a, key)?;
  raw
    .trim()
    .parse()
    .map_err(|_| format!("{key:?} is not a number: {raw:?}"))
}

fn millis(a: &mut Attrs, key: &str) -> Result<DateTime<Utc>, String> {
  let ms: i64 = number(a, key)?;
  Utc
    .timestamp_millis_opt(ms)
    .single()
    .ok_or_else(|| format!("{key:?} is out of range: {ms}"))
}

// ── Record parsers ────────────────────────────────────────────────────────

fn parse_call(el: Element) -> Result<CallRecord, String> {
  let mut a = attrs(el);
  Ok(CallRecord {
    number:        required(&mut a, "number")?,
    duration:      number(&mut a, "duration")?,
    date:          millis(&mut a, "date")?,
    call_type:     number(&mut a, "type")?,
    readable_date: a.remove("readable_date"),
    contact_name:  a.remove("contact_name"),
    extra:         a,
  })
}

fn parse_sms(el: Element) -> Result<Message, String> {
  let mut a = attrs(el);
  Ok(Message::Sms(SmsRecord {
    address:       required(&mut a, "address")?,
    date:          millis(&mut a, "date")?,
    sms_type:      number(&mut a, "type")?,
    body:          a.remove("body").unwrap_or_default(),
    readable_date: a.remove("readable_date"),
    contact_name:  a.remove("contact_name"),
    extra:         a,
  }))
}

fn parse_mms(
  el: Element,
  parts: Vec<Element>,
  addrs: Vec<Element>,
) -> Result<Message, String> {
  let mut a = attrs(el);
  let parts = parts
    .into_iter()
    .map(parse_part)
    .collect::<Result<Vec<_>, _>>()?;
  let addresses = addrs
    .into_iter()
    .map(|el| {
      let mut a = attrs(el);
      Ok(MmsAddress {
        address: required(&mut a, "address")?,
        extra:   a,
      })
    })
    .collect::<Result<Vec<_>, String>>()?;
  Ok(Message::Mms(MmsRecord {
    address: a.remove("address").unwrap_or_default(),
    date: millis(&mut a, "date")?,
    msg_box: number(&mut a, "msg_box")?,
    readable_date: a.remove("readable_date"),
    contact_name: a.remove("contact_name"),
    parts,
    addresses,
    extra: a,
  }))
}

fn parse_part(el: Element) -> Result<MmsPart, String> {
  let mut a = attrs(el);
  let data = a.remove("data");
  let path = a.remove("path");
  let payload = match (data, path) {
    (Some(_), Some(_)) => return Err("part has both data and path".into()),
    (Some(encoded), None) => {
      let data = B64
        .decode(encoded.trim())
        .map_err(|e| format!("part data is not base64: {e}"))?;
      Some(PartPayload::Inline {
        hash: hash_bytes(&data),
        data,
      })
    }
    (None, Some(path)) => {
      let (hash, _) = parse_attachment_rel_path(&path)
        .ok_or_else(|| format!("invalid attachment path: {path:?}"))?;
      Some(PartPayload::Stored {
        hash: hash.to_string(),
        path,
      })
    }
    (None, None) => None,
  };
  Ok(MmsPart {
    seq: a.remove("seq").and_then(|s| s.trim().parse().ok()).unwrap_or(0),
    content_type: a.remove("ct").unwrap_or_default(),
    name: a.remove("name"),
    text: a.remove("text"),
    payload,
    extra: a,
  })
}

// ─── Writing ─────────────────────────────────────────────────────────────────

fn xml_err(e: impl std::fmt::Display) -> Error { Error::XmlWrite(e.to_string()) }

struct Tag(BytesStart<'static>);

impl Tag {
  fn new(name: &'static str) -> Self { Self(BytesStart::new(name)) }

  fn attr(mut self, key: &str, value: &str) -> Self {
    self.0.push_attribute((key, value));
    self
  }

  fn opt(self, key: &str, value: Option<&str>) -> Self {
    match value {
      Some(v) => self.attr(key, v),
      None => self,
    }
  }

  fn extra(mut self, extra: &Attrs) -> Self {
    for (k, v) in extra {
      self = self.attr(k, v);
    }
    self
  }
}

fn begin<W: Write>(out: W, root: &str, count: usize) -> Result<Writer<W>> {
  let mut writer = Writer::new_with_indent(out, b' ', 2);
  writer
    .write_event(Event::Decl(BytesDecl::new("1.0", Some("UTF-8"), Some("yes"))))
    .map_err(xml_err)?;
  let mut start = BytesStart::new(root);
  start.push_attribute(("count", count.to_string().as_str()));
  writer.write_event(Event::Start(start)).map_err(xml_err)?;
  Ok(writer)
}

fn end<W: Write>(mut writer: Writer<W>, root: &str) -> Result<()> {
  writer
    .write_event(Event::End(BytesEnd::new(root)))
    .map_err(xml_err)?;
  writer.into_inner().write_all(b"\n")?;
  Ok(())
}

pub fn write_calls<W: Write>(out: W, records: &[CallRecord]) -> Result<()> {
  let root = root_element(EntityKind::Calls);
  let mut writer = begin(out, root, records.len())?;
  for call in records {
    let tag = Tag::new("call")
      .attr("number", &call.number)
      .attr("duration", &call.duration.to_string())
      .attr("date", &call.date.timestamp_millis().to_string())
      .attr("type", &call.call_type.to_string())
      .opt("readable_date", call.readable_date.as_deref())
      .opt("contact_name", call.contact_name.as_deref())
      .extra(&call.extra);
    writer.write_event(Event::Empty(tag.0)).map_err(xml_err)?;
  }
  end(writer, root)
}

pub fn write_messages<W: Write>(out: W, records: &[Message]) -> Result<()> {
  let root = root_element(EntityKind::Sms);
  let mut writer = begin(out, root, records.len())?;
  for message in records {
    match message {
      Message::Sms(sms) => {
        let tag = Tag::new("sms")
          .attr("address", &sms.address)
          .attr("date", &sms.date.timestamp_millis().to_string())
          .attr("type", &sms.sms_type.to_string())
          .attr("body", &sms.body)
          .opt("readable_date", sms.readable_date.as_deref())
          .opt("contact_name", sms.contact_name.as_deref())
          .extra(&sms.extra);
        writer.write_event(Event::Empty(tag.0)).map_err(xml_err)?;
      }
      Message::Mms(mms) => write_mms(&mut writer, mms)?,
    }
  }
  end(writer, root)
}

fn write_mms<W: Write>(writer: &mut Writer<W>, mms: &MmsRecord) -> Result<()> {
  let tag = Tag::new("mms")
    .attr("address", &mms.address)
    .attr("date", &mms.date.timestamp_millis().to_string())
    .attr("msg_box", &mms.msg_box.to_string())
    .opt("readable_date", mms.readable_date.as_deref())
    .opt("contact_name", mms.contact_name.as_deref())
    .extra(&mms.extra);
  writer.write_event(Event::Start(tag.0)).map_err(xml_err)?;

  writer
    .write_event(Event::Start(BytesStart::new("parts")))
    .map_err(xml_err)?;
  for part in &mms.parts {
    let mut tag = Tag::new("part")
      .attr("seq", &part.seq.to_string())
      .attr("ct", &part.content_type)
      .opt("name", part.name.as_deref())
      .opt("text", part.text.as_deref());
    tag = match &part.payload {
      Some(PartPayload::Stored { path, .. }) => tag.attr("path", path),
      Some(PartPayload::Inline { data, .. }) => tag.attr("data", &B64.encode(data)),
      None => tag,
    };
    writer
      .write_event(Event::Empty(tag.extra(&part.extra).0))
      .map_err(xml_err)?;
  }
  writer
    .write_event(Event::End(BytesEnd::new("parts")))
    .map_err(xml_err)?;

  writer
    .write_event(Event::Start(BytesStart::new("addrs")))
    .map_err(xml_err)?;
  for addr in &mms.addresses {
    let tag = Tag::new("addr").attr("address", &addr.address).extra(&addr.extra);
    writer.write_event(Event::Empty(tag.0)).map_err(xml_err)?;
  }
  writer
    .write_event(Event::End(BytesEnd::new("addrs")))
    .map_err(xml_err)?;

  writer
    .write_event(Event::End(BytesEnd::new("mms")))
    .map_err(xml_err)?;
  Ok(())
}

#[cfg(test)]
mod tests {
  use callvault_core::Entry;

  use super::*;

  fn calls(doc: &str) -> Result<Document<CallRecord>> {
    read_calls(&mut SafeDecoder::from_bytes(doc.as_bytes()))
  }

  fn messages(doc: &str) -> Result<Document<Message>> {
    read_messages(&mut SafeDecoder::from_bytes(doc.as_bytes()))
  }

  #[test]
  fn reads_calls_and_keeps_unknown_attributes() {
    let doc = calls(
      r#"<?xml version='1.0' encoding='UTF-8' standalone='yes' ?>
<calls count="2">
  <call number="+15555550100" duration="42" date="1420070400000" type="1"
        presentation="1" readable_date="Jan 1, 2015" contact_name="Alice" />
  <call number="+15555550101" duration="0" date="1420070500000" type="3" />
</calls>"#,
    )
    .unwrap();
    assert_eq!(doc.declared_count, Some(2));
    assert_eq!(doc.records.len(), 2);
    let first = &doc.records[0];
    assert_eq!(first.duration, 42);
    assert_eq!(first.contact_name.as_deref(), Some("Alice"));
    assert_eq!(first.extra.get("presentation").map(String::as_str), Some("1"));
    assert_eq!(first.year(), 2015);
  }

  #[test]
  fn bad_records_are_rejected_not_fatal() {
    let doc = calls(
      r#"<calls count="3">
  <call number="1" duration="1" date="not-a-date" type="1" />
  <call number="2" duration="1" type="1" />
  <call number="3" duration="1" date="1420070400000" type="1" />
</calls>"#,
    )
    .unwrap();
    assert_eq!(doc.records.len(), 1);
    assert_eq!(doc.rejected.len(), 2);
  }

  #[test]
  fn wrong_root_is_an_error() {
    assert!(matches!(
      calls(r#"<smses count="0"/>"#),
      Err(Error::UnexpectedRoot { .. })
    ));
  }

  #[test]
  fn empty_root_element_is_an_empty_document() {
    let doc = messages(r#"<smses count="0"/>"#).unwrap();
    assert_eq!(doc.declared_count, Some(0));
    assert!(doc.records.is_empty());
  }

  #[test]
  fn reads_mms_with_inline_payload() {
    let data = B64.encode(b"jpeg bytes");
    let doc = messages(&format!(
      r#"<smses count="2">
  <sms address="100" date="1420070400000" type="1" body="&lt;b&gt;hi&lt;/b&gt;" />
  <mms address="100" date="1420070400001" msg_box="1" m_id="x">
    <parts>
      <part seq="-1" ct="application/smil" text="&lt;smil/&gt;" />
      <part seq="0" ct="image/jpeg" name="cat.jpg" data="{data}" />
    </parts>
    <addrs><addr address="100" type="137" charset="106" /></addrs>
  </mms>
</smses>"#
    ))
    .unwrap();
    assert_eq!(doc.records.len(), 2);
    let Message::Sms(sms) = &doc.records[0] else { panic!("expected sms") };
    assert_eq!(sms.body, "<b>hi</b>");
    let Message::Mms(mms) = &doc.records[1] else { panic!("expected mms") };
    assert_eq!(mms.parts.len(), 2);
    assert_eq!(mms.addresses[0].extra.get("type").map(String::as_str), Some("137"));
    let Some(PartPayload::Inline { hash, data }) = &mms.parts[1].payload else {
      panic!("expected inline payload")
    };
    assert_eq!(data, b"jpeg bytes");
    assert_eq!(hash, &hash_bytes(b"jpeg bytes"));
  }

  #[test]
  fn written_partition_reads_back_identically() {
    let doc = messages(&format!(
      r#"<smses count="2">
  <sms address="100" date="1420070400000" type="2" body="a &amp; b" read="1" />
  <mms address="100" date="1420070400001" msg_box="2">
    <parts><part seq="0" ct="image/png" name="x.png" path="attachments/{p}/{h}/x.png" /></parts>
    <addrs />
  </mms>
</smses>"#,
      h = "ab".repeat(32),
      p = "ab",
    ))
    .unwrap();

    let mut out = Vec::new();
    write_messages(&mut out, &doc.records).unwrap();
    let back = messages(std::str::from_utf8(&out).unwrap()).unwrap();
    assert_eq!(back.declared_count, Some(2));
    assert_eq!(back.records, doc.records);
  }

  #[test]
  fn sniff_detects_entity_kind() {
    let mut d = SafeDecoder::from_bytes(b"<?xml version='1.0'?><calls count='0'/>");
    assert_eq!(sniff(&mut d).unwrap(), Some(EntityKind::Calls));
    let mut d = SafeDecoder::from_bytes(b"<contacts/>");
    assert_eq!(sniff(&mut d).unwrap(), None);
  }
}
