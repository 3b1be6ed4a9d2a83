//! Call and message records as they appear in device backups.
//!
//! Only the attributes the archive reasons about are typed; everything else
//! a backup carries is preserved verbatim in `extra` so that a record read
//! from a backup is written back out unchanged.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::entry::Entry;

/// Fields that describe how a record was rendered on the device, not what
/// happened. They differ between captures of the same event and are left
/// out of every content hash.
pub const PRESENTATION_FIELDS: &[&str] = &["readable_date", "contact_name"];

// ─── Hashing ─────────────────────────────────────────────────────────────────

/// Feeds `name=value` pairs into SHA-256 in a fixed framing.
struct FieldHasher(Sha256);

impl FieldHasher {
  fn new(tag: &str) -> Self {
    let mut hasher = Sha256::new();
    hasher.update(tag.as_bytes());
    hasher.update([0u8]);
    Self(hasher)
  }

  fn field(&mut self, name: &str, value: impl AsRef<[u8]>) -> &mut Self {
    self.0.update(name.as_bytes());
    self.0.update(b"=");
    self.0.update(value.as_ref());
    self.0.update([0u8]);
    self
  }

  fn optional(&mut self, name: &str, value: Option<&str>) -> &mut Self {
    match value {
      Some(v) => self.field(name, v),
      None => {
        self.0.update(name.as_bytes());
        self.0.update(b"?\0");
        self
      }
    }
  }

  fn extra(&mut self, extra: &BTreeMap<String, String>) -> &mut Self {
    for (name, value) in extra {
      if !PRESENTATION_FIELDS.contains(&name.as_str()) {
        self.field(name, value);
      }
    }
    self
  }

  fn finish(self) -> String { hex::encode(self.0.finalize()) }
}

// ─── Calls ───────────────────────────────────────────────────────────────────

/// A single entry from the device call log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallRecord {
  pub number:        String,
  /// Call length in seconds.
  pub duration:      i64,
  pub date:          DateTime<Utc>,
  /// Android call type: 1 incoming, 2 outgoing, 3 missed, 4 voicemail,
  /// 5 rejected, 6 refused.
  pub call_type:     i32,
  pub readable_date: Option<String>,
  pub contact_name:  Option<String>,
  pub extra:         BTreeMap<String, String>,
}

impl Entry for CallRecord {
  fn content_hash(&self) -> String {
    let mut h = FieldHasher::new("call");
    h.field("number", &self.number)
      .field("duration", self.duration.to_string())
      .field("date", self.date.timestamp_millis().to_string())
      .field("type", self.call_type.to_string())
      .extra(&self.extra);
    h.finish()
  }

  fn timestamp(&self) -> DateTime<Utc> { self.date }
}

// ─── Messages ────────────────────────────────────────────────────────────────

/// A plain text message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SmsRecord {
  pub address:       String,
  pub date:          DateTime<Utc>,
  /// 1 received, 2 sent, other values per the Android provider.
  pub sms_type:      i32,
  pub body:          String,
  pub readable_date: Option<String>,
  pub contact_name:  Option<String>,
  pub extra:         BTreeMap<String, String>,
}

/// The binary content of an MMS part, either still inline (straight out of
/// a backup) or already moved into the attachment store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PartPayload {
  Inline { hash: String, data: Vec<u8> },
  /// `path` is repository-relative, e.g. `attachments/ab/<hash>/photo.jpg`.
  Stored { hash: String, path: String },
}

impl PartPayload {
  /// SHA-256 of the payload bytes, independent of where they live.
  pub fn hash(&self) -> &str {
    match self {
      Self::Inline { hash, .. } | Self::Stored { hash, .. } => hash,
    }
  }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MmsPart {
  pub seq:          i32,
  pub content_type: String,
  pub name:         Option<String>,
  pub text:         Option<String>,
  pub payload:      Option<PartPayload>,
  pub extra:        BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MmsAddress {
  pub address: String,
  pub extra:   BTreeMap<String, String>,
}

/// A multimedia message with its parts and participant addresses.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MmsRecord {
  pub address:       String,
  pub date:          DateTime<Utc>,
  pub msg_box:       i32,
  pub readable_date: Option<String>,
  pub contact_name:  Option<String>,
  pub parts:         Vec<MmsPart>,
  pub addresses:     Vec<MmsAddress>,
  pub extra:         BTreeMap<String, String>,
}

/// Anything stored in an `sms-YYYY.xml` partition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Message {
  Sms(SmsRecord),
  Mms(MmsRecord),
}

impl Message {
  pub fn date(&self) -> DateTime<Utc> {
    match self {
      Self::Sms(s) => s.date,
      Self::Mms(m) => m.date,
    }
  }

  /// Content hashes of every attachment this message references.
  pub fn attachment_hashes(&self) -> impl Iterator<Item = &str> {
    let parts: &[MmsPart] = match self {
      Self::Sms(_) => &[],
      Self::Mms(m) => &m.parts,
    };
    parts.iter().filter_map(|p| p.payload.as_ref().map(PartPayload::hash))
  }
}

impl Entry for Message {
  fn content_hash(&self) -> String {
    match self {
      Self::Sms(s) => {
        let mut h = FieldHasher::new("sms");
        h.field("address", &s.address)
          .field("date", s.date.timestamp_millis().to_string())
          .field("type", s.sms_type.to_string())
          .field("body", &s.body)
          .extra(&s.extra);
        h.finish()
      }
      Self::Mms(m) => {
        let mut h = FieldHasher::new("mms");
        h.field("address", &m.address)
          .field("date", m.date.timestamp_millis().to_string())
          .field("msg_box", m.msg_box.to_string())
          .extra(&m.extra);
        for part in &m.parts {
          h.field("part.seq", part.seq.to_string())
            .field("part.ct", &part.content_type)
            .optional("part.name", part.name.as_deref())
            .optional("part.text", part.text.as_deref())
            .optional("part.content", part.payload.as_ref().map(PartPayload::hash))
            .extra(&part.extra);
        }
        for addr in &m.addresses {
          h.field("addr", &addr.address).extra(&addr.extra);
        }
        h.finish()
      }
    }
  }

  fn timestamp(&self) -> DateTime<Utc> { self.date() }
}

#[cfg(test)]
pub(crate) mod test_helpers {
  use chrono::TimeZone;

  use super::*;

  pub(crate) fn at(millis: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(millis).unwrap()
  }

  pub(crate) fn call(number: &str, millis: i64) -> CallRecord {
    CallRecord {
      number:        number.to_string(),
      duration:      42,
      date:          at(millis),
      call_type:     1,
      readable_date: None,
      contact_name:  None,
      extra:         BTreeMap::new(),
    }
  }

  pub(crate) fn sms(body: &str, millis: i64) -> Message {
    Message::Sms(SmsRecord {
      address:       "+15555550100".to_string(),
      date:          at(millis),
      sms_type:      1,
      body:          body.to_string(),
      readable_date: None,
      contact_name:  None,
      extra:         BTreeMap::new(),
    })
  }
}

#[cfg(test)]
mod tests {
  use super::{test_helpers::*, *};

  #[test]
  fn presentation_fields_do_not_affect_call_hash() {
    let a = call("+15555550100", 1_420_070_400_000);
    let mut b = a.clone();
    b.readable_date = Some("Jan 1, 2015 12:00:00 AM".into());
    b.contact_name = Some("Alice".into());
    b.extra.insert("contact_name".into(), "Alice again".into());
    assert_eq!(a.content_hash(), b.content_hash());
  }

  #[test]
  fn identity_fields_change_call_hash() {
    let a = call("+15555550100", 1_420_070_400_000);
    let mut b = a.clone();
    b.duration = 43;
    assert_ne!(a.content_hash(), b.content_hash());

    let mut c = a.clone();
    c.extra.insert("presentation".into(), "1".into());
    assert_ne!(a.content_hash(), c.content_hash());
  }

  #[test]
  fn sms_and_call_hashes_are_hex_sha256() {
    let h = sms("hello", 0).content_hash();
    assert_eq!(h.len(), 64);
    assert!(h.chars().all(|c| c.is_ascii_hexdigit()));
  }

  #[test]
  fn mms_hash_ignores_payload_location() {
    let part = |payload| MmsPart {
      seq: 0,
      content_type: "image/jpeg".into(),
      name: Some("cat.jpg".into()),
      text: None,
      payload: Some(payload),
      extra: BTreeMap::new(),
    };
    let mms = |payload| {
      Message::Mms(MmsRecord {
        address:       "+15555550100".into(),
        date:          at(1_600_000_000_000),
        msg_box:       1,
        readable_date: None,
        contact_name:  None,
        parts:         vec![part(payload)],
        addresses:     vec![],
        extra:         BTreeMap::new(),
      })
    };

    let inline = mms(PartPayload::Inline { hash: "ab".repeat(32), data: vec![1, 2, 3] });
    let stored = mms(PartPayload::Stored {
      hash: "ab".repeat(32),
      path: format!("attachments/ab/{}/cat.jpg", "ab".repeat(32)),
    });
    assert_eq!(inline.content_hash(), stored.content_hash());
    assert_eq!(inline.attachment_hashes().count(), 1);
  }

  #[test]
  fn year_is_utc_calendar_year() {
    // 2014-12-31T23:30:00Z
    let c = call("1", 1_420_068_600_000);
    assert_eq!(c.year(), 2014);
  }
}
