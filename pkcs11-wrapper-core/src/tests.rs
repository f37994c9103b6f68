// Copyright 2022 Google LLC
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//      http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use pkcs11_sys::*;
use pkcs11_wrapper_traits::{LEN_SENSITIVE, LEN_UNAVAILABLE, RawAttribute};

use crate::{
    Error,
    Result,
    attribute::{Attribute, AttributeType},
    object::{KeyType, Object, ObjectKind},
    registry,
    template::{Attributes, TemplatePurpose},
};

fn raw(type_: CK_ATTRIBUTE_TYPE, value: &[u8]) -> RawAttribute {
    RawAttribute::with_value(type_, value.to_vec()).unwrap()
}

fn secret_key_response() -> Vec<RawAttribute> {
    vec![
        raw(CKA_CLASS, &CKO_SECRET_KEY.to_ne_bytes()),
        raw(CKA_KEY_TYPE, &CKK_AES.to_ne_bytes()),
        raw(CKA_LABEL, b"aes key"),
        raw(CKA_ID, b""),
        raw(CKA_VALUE_LEN, &(32 as CK_ULONG).to_ne_bytes()),
        RawAttribute::sensitive(CKA_VALUE),
        RawAttribute::unavailable(CKA_CHECK_VALUE),
    ]
}

#[test]
fn absorb_is_idempotent() -> Result<()> {
    let response = secret_key_response();
    let mut once = Attributes::new();
    once.absorb(&response)?;
    let mut twice = once.clone();
    twice.absorb(&response)?;
    assert_eq!(once, twice);
    assert_eq!(once.to_blob(TemplatePurpose::Search)?, twice.to_blob(TemplatePurpose::Search)?);
    Ok(())
}

#[test]
fn absorb_records_presence() -> Result<()> {
    let mut table = Attributes::new();
    table.absorb(&secret_key_response())?;

    let id = table.get(AttributeType::Id).unwrap();
    assert!(id.is_present());
    assert_eq!(id.as_bytes(), Some(&[][..]));
    assert!(table.get(AttributeType::Value).unwrap().is_sensitive());
    assert_eq!(table.get(AttributeType::Value).unwrap().value(), None);
    assert!(table.get(AttributeType::CheckValue).unwrap().is_unavailable());
    Ok(())
}

#[test]
fn search_omits_unread_and_read_requests_everything() -> Result<()> {
    let mut table = Attributes::with_types([AttributeType::Label, AttributeType::Id]);
    table.set(AttributeType::Class, CKO_DATA)?;

    let search = table.build_template(TemplatePurpose::Search)?;
    assert_eq!(search.len(), 1);
    assert_eq!(search[0].type_, CKA_CLASS);

    let read = table.build_template(TemplatePurpose::Read)?;
    assert_eq!(read.iter().map(|raw| raw.type_).collect::<Vec<_>>(), [
        CKA_LABEL, CKA_ID, CKA_CLASS
    ]);
    assert!(read.iter().all(RawAttribute::is_request));
    Ok(())
}

#[test]
fn unknown_identifiers_are_kept_as_bytes() -> Result<()> {
    let vendor: CK_ATTRIBUTE_TYPE = CKA_VENDOR_DEFINED | 0x42;
    let mut table = Attributes::new();
    table.absorb(&[raw(vendor, b"\x01\x02")])?;

    let attribute = table.get(AttributeType::Other(vendor)).unwrap();
    assert_eq!(attribute.as_bytes(), Some(&b"\x01\x02"[..]));
    assert_eq!(table.build_template(TemplatePurpose::Create)?, [raw(vendor, b"\x01\x02")]);
    Ok(())
}

#[test]
fn malformed_response_leaves_table_untouched() -> Result<()> {
    let mut table = Attributes::new();
    table.absorb(&secret_key_response())?;
    let before = table.clone();

    let response = [raw(CKA_LABEL, b"renamed"), raw(CKA_VALUE_LEN, b"\x01\x02\x03")];
    assert!(matches!(
        table.absorb(&response),
        Err(Error::MalformedAttribute { type_: AttributeType::ValueLen, .. })
    ));
    assert_eq!(table, before);
    Ok(())
}

#[test]
fn registry_dispatch() -> Result<()> {
    assert_eq!(
        registry::resolve(CKO_SECRET_KEY, Some(CKK_AES)),
        ObjectKind::SecretKey(KeyType::Aes)
    );
    assert_eq!(registry::resolve(CKO_DATA, None), ObjectKind::Data);
    // A stray key type on a data object does not matter.
    assert_eq!(registry::resolve(CKO_DATA, Some(CKK_AES)), ObjectKind::Data);
    assert_eq!(
        registry::resolve(CKO_SECRET_KEY, Some(CKK_VENDOR_DEFINED | 7)),
        ObjectKind::Unknown { class: CKO_SECRET_KEY, subtype: Some(CKK_VENDOR_DEFINED | 7) }
    );
    assert_eq!(
        registry::resolve(CKO_VENDOR_DEFINED, None),
        ObjectKind::Unknown { class: CKO_VENDOR_DEFINED, subtype: None }
    );

    let mut table = Attributes::new();
    table.absorb(&secret_key_response())?;
    assert_eq!(registry::resolve_attributes(&table), ObjectKind::SecretKey(KeyType::Aes));
    assert!(matches!(
        registry::resolve_attributes(&Attributes::new()),
        ObjectKind::Unknown { subtype: None, .. }
    ));
    Ok(())
}

#[test]
fn from_attributes_types_the_table() -> Result<()> {
    let mut table = Attributes::new();
    table.absorb(&secret_key_response())?;
    table.absorb(&[raw(CKA_VENDOR_DEFINED | 1, b"x")])?;

    let object = Object::from_attributes(Some(12), table);
    assert_eq!(object.kind(), ObjectKind::SecretKey(KeyType::Aes));
    assert_eq!(object.handle(), Some(12));
    assert_eq!(object.get(AttributeType::Label).and_then(Attribute::as_str), Some("aes key"));
    // Schema attributes the response did not cover stay unread.
    assert!(!object.get(AttributeType::Encrypt).unwrap().is_read());
    // Extra attributes follow the schema.
    assert_eq!(
        object.attributes().last().map(Attribute::attribute_type),
        Some(AttributeType::Other(CKA_VENDOR_DEFINED | 1))
    );
    Ok(())
}

#[test]
fn clones_are_deep() -> Result<()> {
    let mut original = Object::data();
    original.set(AttributeType::Value, b"hello")?;
    let mut copy = original.clone();
    copy.set(AttributeType::Value, b"jello")?;

    assert_eq!(
        original.get(AttributeType::Value).and_then(Attribute::as_bytes),
        Some(&b"hello"[..])
    );
    assert_ne!(original, copy);
    Ok(())
}

#[test]
fn flat_blob_absorb() -> Result<()> {
    let mut table = Attributes::new();
    table.set(AttributeType::Label, "flat")?;
    table.set(AttributeType::Token, true)?;
    let blob = table.to_blob(TemplatePurpose::Create)?;

    let mut decoded = Attributes::new();
    decoded.absorb_blob(&blob)?;
    assert_eq!(decoded, table);
    assert!(decoded.absorb_blob(&blob[..blob.len() - 1]).is_err());

    let sentinels =
        [RawAttribute::sensitive(CKA_VALUE), RawAttribute::unavailable(CKA_MODULUS)];
    assert_eq!(sentinels[0].value_len, LEN_SENSITIVE);
    assert_eq!(sentinels[1].value_len, LEN_UNAVAILABLE);
    Ok(())
}
