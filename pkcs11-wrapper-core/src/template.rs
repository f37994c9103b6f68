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

use core::ops::Deref;

use pkcs11_sys::{CK_KEY_TYPE, CK_OBJECT_CLASS};
use pkcs11_wrapper_traits::RawAttribute;
use tracing::debug;

use crate::{
    Error,
    Result,
    attribute::{Attribute, AttributeType, AttributeValue, decode_flat, encode_flat},
};

/// What a template is being built for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TemplatePurpose {
    /// Filter for an object search: only attributes holding a value.
    Search,
    /// Template for object creation or attribute writes: same as `Search`.
    Create,
    /// Request for a read: every attribute as an empty placeholder.
    Read,
}

/// Ordered attribute table. Identifiers are unique and insertion order is the
/// order attributes are encoded in.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct Attributes(Vec<Attribute>);

impl Attributes {
    pub fn new() -> Self {
        Attributes(Vec::new())
    }

    /// Table of unread attributes, e.g. the request for an object's schema.
    pub fn with_types(types: impl IntoIterator<Item = AttributeType>) -> Self {
        let mut attributes = Attributes::new();
        for type_ in types {
            attributes.entry(type_);
        }
        attributes
    }

    pub fn get(&self, type_: AttributeType) -> Option<&Attribute> {
        self.0.iter().find(|attr| attr.attribute_type() == type_)
    }

    pub fn get_mut(&mut self, type_: AttributeType) -> Option<&mut Attribute> {
        self.0.iter_mut().find(|attr| attr.attribute_type() == type_)
    }

    pub fn contains(&self, type_: AttributeType) -> bool {
        self.get(type_).is_some()
    }

    /// Inserts an attribute, replacing (in place) any attribute with the same
    /// identifier. Returns the replaced attribute.
    pub fn insert(&mut self, attribute: Attribute) -> Option<Attribute> {
        match self.get_mut(attribute.attribute_type()) {
            Some(existing) => Some(std::mem::replace(existing, attribute)),
            None => {
                self.0.push(attribute);
                None
            }
        }
    }

    pub fn remove(&mut self, type_: AttributeType) -> Option<Attribute> {
        let index = self.0.iter().position(|attr| attr.attribute_type() == type_)?;
        Some(self.0.remove(index))
    }

    /// Sets the value of an attribute, adding the attribute if needed.
    pub fn set(&mut self, type_: AttributeType, value: impl Into<AttributeValue>) -> Result<()> {
        let mut attribute = self.get(type_).cloned().unwrap_or_else(|| Attribute::new(type_));
        attribute.set_value(value)?;
        self.insert(attribute);
        Ok(())
    }

    pub fn class(&self) -> Option<CK_OBJECT_CLASS> {
        self.get(AttributeType::Class)?.as_ulong()
    }

    pub fn key_type(&self) -> Option<CK_KEY_TYPE> {
        self.get(AttributeType::KeyType)?.as_ulong()
    }

    pub fn build_template(&self, purpose: TemplatePurpose) -> Result<Vec<RawAttribute>> {
        match purpose {
            TemplatePurpose::Read => Ok(self.0.iter().map(Attribute::request).collect()),
            TemplatePurpose::Search | TemplatePurpose::Create => {
                self.0.iter().filter(|attr| attr.is_present()).map(Attribute::encode).collect()
            }
        }
    }

    /// Template serialized as one flat blob, see [`encode_flat`].
    pub fn to_blob(&self, purpose: TemplatePurpose) -> Result<Vec<u8>> {
        Ok(encode_flat(&self.build_template(purpose)?))
    }

    /// Decodes a token response into the table. Attributes missing from the
    /// table are added; identifiers this crate does not know are kept as opaque
    /// bytes. Either every entry is absorbed or the table is left unchanged.
    pub fn absorb(&mut self, response: &[RawAttribute]) -> Result<()> {
        let mut staged = self.clone();
        for raw in response {
            let type_ = AttributeType::from(raw.type_);
            if let AttributeType::Other(code) = type_ {
                debug!("keeping unrecognized attribute {code:#x} as bytes");
            }
            staged.entry(type_).decode(raw.value_len, raw.value.as_deref())?;
        }
        *self = staged;
        Ok(())
    }

    pub fn absorb_blob(&mut self, blob: &[u8]) -> Result<()> {
        let response = decode_flat(blob).ok_or_else(|| {
            Error::InvalidParameter("attribute blob is truncated".to_string())
        })?;
        self.absorb(&response)
    }

    fn entry(&mut self, type_: AttributeType) -> &mut Attribute {
        let index = match self.0.iter().position(|attr| attr.attribute_type() == type_) {
            Some(index) => index,
            None => {
                self.0.push(Attribute::new(type_));
                self.0.len() - 1
            }
        };
        &mut self.0[index]
    }
}

impl Deref for Attributes {
    type Target = [Attribute];

    fn deref(&self) -> &[Attribute] {
        &self.0
    }
}

impl FromIterator<Attribute> for Attributes {
    fn from_iter<T: IntoIterator<Item = Attribute>>(iter: T) -> Self {
        let mut attributes = Attributes::new();
        for attribute in iter {
            attributes.insert(attribute);
        }
        attributes
    }
}

impl From<Vec<Attribute>> for Attributes {
    fn from(value: Vec<Attribute>) -> Self {
        value.into_iter().collect()
    }
}

impl<'a> IntoIterator for &'a Attributes {
    type Item = &'a Attribute;
    type IntoIter = std::slice::Iter<'a, Attribute>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.iter()
    }
}
