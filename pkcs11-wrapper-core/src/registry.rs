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

//! Maps an object's discriminants to its [`ObjectKind`].

use std::{collections::HashMap, sync::LazyLock};

use pkcs11_sys::*;
use strum::IntoEnumIterator;
use tracing::debug;

use crate::{
    attribute::AttributeType,
    object::{CertificateType, HardwareFeatureType, KeyType, ObjectKind},
    template::Attributes,
};

/// Every attribute that can act as a discriminant, for a single up-front read.
pub const DISCRIMINANTS: [AttributeType; 4] = [
    AttributeType::Class,
    AttributeType::KeyType,
    AttributeType::CertificateType,
    AttributeType::HwFeatureType,
];

static KINDS: LazyLock<HashMap<(CK_OBJECT_CLASS, Option<CK_ULONG>), ObjectKind>> =
    LazyLock::new(|| {
        let mut kinds: Vec<ObjectKind> = vec![ObjectKind::Data, ObjectKind::Profile];
        kinds.extend(CertificateType::iter().map(ObjectKind::Certificate));
        kinds.extend(HardwareFeatureType::iter().map(ObjectKind::HardwareFeature));
        for key_type in KeyType::iter() {
            kinds.push(ObjectKind::PublicKey(key_type));
            kinds.push(ObjectKind::PrivateKey(key_type));
            kinds.push(ObjectKind::SecretKey(key_type));
            kinds.push(ObjectKind::DomainParameters(key_type));
        }
        kinds.into_iter().map(|kind| ((kind.class(), kind.subtype()), kind)).collect()
    });

/// The attribute holding the second discriminant of `class`, if it has one.
pub fn discriminant_attribute(class: CK_OBJECT_CLASS) -> Option<AttributeType> {
    match class {
        CKO_PUBLIC_KEY | CKO_PRIVATE_KEY | CKO_SECRET_KEY | CKO_DOMAIN_PARAMETERS => {
            Some(AttributeType::KeyType)
        }
        CKO_CERTIFICATE => Some(AttributeType::CertificateType),
        CKO_HW_FEATURE => Some(AttributeType::HwFeatureType),
        _ => None,
    }
}

/// Never fails: combinations without a dedicated kind become
/// [`ObjectKind::Unknown`] carrying the raw discriminants.
pub fn resolve(class: CK_OBJECT_CLASS, subtype: Option<CK_ULONG>) -> ObjectKind {
    let subtype = discriminant_attribute(class).and(subtype);
    match KINDS.get(&(class, subtype)) {
        Some(kind) => *kind,
        None => {
            debug!("no object kind for class {class:#x} subtype {subtype:x?}");
            ObjectKind::Unknown { class, subtype }
        }
    }
}

/// Resolves a table holding (at least) the discriminants. A missing class
/// resolves to an unknown kind.
pub fn resolve_attributes(attributes: &Attributes) -> ObjectKind {
    let class = attributes.class().unwrap_or(CK_UNAVAILABLE_INFORMATION);
    let subtype = discriminant_attribute(class)
        .and_then(|type_| attributes.get(type_))
        .and_then(|attribute| attribute.as_ulong());
    resolve(class, subtype)
}
