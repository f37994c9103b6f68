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

//! Generic <-> vendor code translation. Codes without the vendor-defined bit,
//! and every code when no converter is configured, pass through unchanged.
//! Attribute templates are translated in depth: nested attribute arrays and
//! mechanism-valued attributes carry codes of their own.

use std::collections::HashMap;

use pkcs11_sys::{
    CK_ATTRIBUTE_TYPE,
    CK_MECHANISM_TYPE,
    CK_ULONG,
    CK_UNAVAILABLE_INFORMATION,
    CKA_VENDOR_DEFINED,
    CKM_VENDOR_DEFINED,
};
use pkcs11_wrapper_traits::{RawAttribute, VendorCodeConverter};
use tracing::debug;

use crate::attribute::{AttributeKind, AttributeType, decode_flat, encode_flat};

const ULONG_SIZE: usize = std::mem::size_of::<CK_ULONG>();

#[derive(Debug, Clone, Default)]
struct CodeMap {
    to_vendor: HashMap<CK_ULONG, CK_ULONG>,
    to_generic: HashMap<CK_ULONG, CK_ULONG>,
}

impl CodeMap {
    fn insert(&mut self, generic: CK_ULONG, vendor: CK_ULONG) {
        self.to_vendor.insert(generic, vendor);
        self.to_generic.insert(vendor, generic);
    }
}

/// A bidirectional lookup table, typically loaded from a vendor's
/// documentation of its proprietary mechanism and attribute numbers.
#[derive(Debug, Clone, Default)]
pub struct VendorCodeTable {
    mechanisms: CodeMap,
    attributes: CodeMap,
}

impl VendorCodeTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_mechanism(mut self, generic: CK_MECHANISM_TYPE, vendor: CK_MECHANISM_TYPE) -> Self {
        self.mechanisms.insert(generic, vendor);
        self
    }

    pub fn with_attribute(mut self, generic: CK_ATTRIBUTE_TYPE, vendor: CK_ATTRIBUTE_TYPE) -> Self {
        self.attributes.insert(generic, vendor);
        self
    }
}

impl VendorCodeConverter for VendorCodeTable {
    fn generic_to_vendor_mechanism(&self, code: CK_MECHANISM_TYPE) -> CK_MECHANISM_TYPE {
        self.mechanisms.to_vendor.get(&code).copied().unwrap_or(code)
    }

    fn vendor_to_generic_mechanism(&self, code: CK_MECHANISM_TYPE) -> CK_MECHANISM_TYPE {
        self.mechanisms.to_generic.get(&code).copied().unwrap_or(code)
    }

    fn generic_to_vendor_attribute(&self, code: CK_ATTRIBUTE_TYPE) -> CK_ATTRIBUTE_TYPE {
        self.attributes.to_vendor.get(&code).copied().unwrap_or(code)
    }

    fn vendor_to_generic_attribute(&self, code: CK_ATTRIBUTE_TYPE) -> CK_ATTRIBUTE_TYPE {
        self.attributes.to_generic.get(&code).copied().unwrap_or(code)
    }
}

pub fn mechanism_to_vendor(
    code: CK_MECHANISM_TYPE,
    converter: Option<&dyn VendorCodeConverter>,
) -> CK_MECHANISM_TYPE {
    match converter {
        Some(converter) if code & CKM_VENDOR_DEFINED != 0 => {
            let vendor = converter.generic_to_vendor_mechanism(code);
            debug!("mechanism {code:#x} sent as {vendor:#x}");
            vendor
        }
        _ => code,
    }
}

pub fn mechanism_to_generic(
    code: CK_MECHANISM_TYPE,
    converter: Option<&dyn VendorCodeConverter>,
) -> CK_MECHANISM_TYPE {
    match converter {
        Some(converter) if code & CKM_VENDOR_DEFINED != 0 => {
            converter.vendor_to_generic_mechanism(code)
        }
        _ => code,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Direction {
    ToVendor,
    ToGeneric,
}

impl Direction {
    fn attribute(self, converter: &dyn VendorCodeConverter, code: CK_ULONG) -> CK_ULONG {
        match self {
            Direction::ToVendor => converter.generic_to_vendor_attribute(code),
            Direction::ToGeneric => converter.vendor_to_generic_attribute(code),
        }
    }

    fn mechanism(self, converter: &dyn VendorCodeConverter, code: CK_ULONG) -> CK_ULONG {
        match self {
            Direction::ToVendor => converter.generic_to_vendor_mechanism(code),
            Direction::ToGeneric => converter.vendor_to_generic_mechanism(code),
        }
    }
}

/// Translates one template entry. Vendor attributes hold opaque bytes, so
/// only standard attributes have their values inspected. Values that do not
/// parse are left for the decoder to reject.
fn translate(raw: &mut RawAttribute, converter: &dyn VendorCodeConverter, direction: Direction) {
    if raw.type_ & CKA_VENDOR_DEFINED != 0 {
        raw.type_ = direction.attribute(converter, raw.type_);
        return;
    }
    let Some(value) = raw.value.as_mut() else { return };
    match AttributeType::from(raw.type_).kind() {
        AttributeKind::AttributeArray => {
            let Some(mut nested) = decode_flat(value) else { return };
            for inner in &mut nested {
                translate(inner, converter, direction);
            }
            // Codes keep their width, so every nested length still holds.
            *value = encode_flat(&nested);
        }
        AttributeKind::Mechanism | AttributeKind::MechanismArray => {
            for chunk in value.chunks_exact_mut(ULONG_SIZE) {
                let Ok(bytes) = <[u8; ULONG_SIZE]>::try_from(&*chunk) else { continue };
                let code = CK_ULONG::from_ne_bytes(bytes);
                if code & CKM_VENDOR_DEFINED != 0 && code != CK_UNAVAILABLE_INFORMATION {
                    chunk.copy_from_slice(&direction.mechanism(converter, code).to_ne_bytes());
                }
            }
        }
        _ => {}
    }
}

pub fn attributes_to_vendor(
    template: &mut [RawAttribute],
    converter: Option<&dyn VendorCodeConverter>,
) {
    let Some(converter) = converter else { return };
    for raw in template {
        translate(raw, converter, Direction::ToVendor);
    }
}

pub fn attributes_to_generic(
    response: &mut [RawAttribute],
    converter: Option<&dyn VendorCodeConverter>,
) {
    let Some(converter) = converter else { return };
    for raw in response {
        translate(raw, converter, Direction::ToGeneric);
    }
}

#[cfg(test)]
mod tests {
    use pkcs11_sys::{
        CK_TRUE,
        CKA_ALLOWED_MECHANISMS,
        CKA_ENCRYPT,
        CKA_LABEL,
        CKA_WRAP_TEMPLATE,
        CKM_AES_CBC,
    };

    use super::*;

    const GENERIC_SM4: CK_MECHANISM_TYPE = CKM_VENDOR_DEFINED | 0x0105;
    const VENDOR_SM4: CK_MECHANISM_TYPE = CKM_VENDOR_DEFINED | 0x8005;

    #[test]
    fn vendor_bit_gates_translation() {
        let table = VendorCodeTable::new()
            .with_mechanism(GENERIC_SM4, VENDOR_SM4)
            .with_mechanism(CKM_AES_CBC, VENDOR_SM4 + 1);
        let converter: Option<&dyn VendorCodeConverter> = Some(&table);

        assert_eq!(mechanism_to_vendor(GENERIC_SM4, converter), VENDOR_SM4);
        assert_eq!(mechanism_to_generic(VENDOR_SM4, converter), GENERIC_SM4);
        // Standard codes are never looked up.
        assert_eq!(mechanism_to_vendor(CKM_AES_CBC, converter), CKM_AES_CBC);
        // Without a table vendor codes pass through.
        assert_eq!(mechanism_to_vendor(GENERIC_SM4, None), GENERIC_SM4);
    }

    #[test]
    fn attribute_codes() {
        let generic = CKA_VENDOR_DEFINED | 0x10;
        let vendor = CKA_VENDOR_DEFINED | 0x9010;
        let table = VendorCodeTable::new().with_attribute(generic, vendor);
        let mut template = vec![RawAttribute::request(CKA_LABEL), RawAttribute::request(generic)];

        attributes_to_vendor(&mut template, Some(&table));
        assert_eq!(template[0].type_, CKA_LABEL);
        assert_eq!(template[1].type_, vendor);

        attributes_to_generic(&mut template, Some(&table));
        assert_eq!(template[1].type_, generic);
    }

    #[test]
    fn nested_templates_are_translated() {
        let generic = CKA_VENDOR_DEFINED | 0x10;
        let vendor = CKA_VENDOR_DEFINED | 0x9010;
        let table = VendorCodeTable::new().with_attribute(generic, vendor);
        let inner = [
            RawAttribute::with_value(CKA_ENCRYPT, vec![CK_TRUE]).unwrap(),
            RawAttribute::with_value(generic, vec![1u8, 2, 3]).unwrap(),
        ];
        let mut template =
            vec![RawAttribute::with_value(CKA_WRAP_TEMPLATE, encode_flat(&inner)).unwrap()];
        let sent_len = template[0].value_len;

        attributes_to_vendor(&mut template, Some(&table));
        let nested = decode_flat(template[0].value.as_deref().unwrap()).unwrap();
        assert_eq!(nested[0].type_, CKA_ENCRYPT);
        assert_eq!(nested[1].type_, vendor);
        assert_eq!(nested[1].value.as_deref(), Some(&[1u8, 2, 3][..]));
        assert_eq!(template[0].value_len, sent_len);

        attributes_to_generic(&mut template, Some(&table));
        assert_eq!(decode_flat(template[0].value.as_deref().unwrap()).unwrap(), inner);
    }

    #[test]
    fn mechanism_values_are_translated() {
        let table = VendorCodeTable::new().with_mechanism(GENERIC_SM4, VENDOR_SM4);
        let codes: Vec<u8> = [CKM_AES_CBC, GENERIC_SM4]
            .iter()
            .flat_map(|code| code.to_ne_bytes())
            .collect();
        let mut template = vec![RawAttribute::with_value(CKA_ALLOWED_MECHANISMS, codes).unwrap()];

        attributes_to_vendor(&mut template, Some(&table));
        let sent: Vec<CK_ULONG> = template[0]
            .value
            .as_deref()
            .unwrap()
            .chunks_exact(ULONG_SIZE)
            .map(|chunk| CK_ULONG::from_ne_bytes(chunk.try_into().unwrap()))
            .collect();
        assert_eq!(sent, [CKM_AES_CBC, VENDOR_SM4]);
    }
}
