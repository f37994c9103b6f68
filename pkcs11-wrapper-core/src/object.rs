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

use std::fmt;

use pkcs11_sys::*;
use pkcs11_wrapper_traits::RawAttribute;
use strum_macros::{Display, EnumIter};

use crate::{
    Error,
    Result,
    attribute::{Attribute, AttributeType, AttributeValue},
    registry,
    template::Attributes,
};

macro_rules! code_enum {
    ($(#[$meta:meta])* $name:ident: $code_type:ty { $($variant:ident => $code:ident,)* }) => {
        $(#[$meta])*
        #[derive(Debug, Display, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, EnumIter)]
        pub enum $name {
            $($variant,)*
        }

        impl TryFrom<$code_type> for $name {
            type Error = $code_type;

            fn try_from(code: $code_type) -> std::result::Result<Self, $code_type> {
                match code {
                    $($code => Ok($name::$variant),)*
                    other => Err(other),
                }
            }
        }

        impl From<$name> for $code_type {
            fn from(value: $name) -> Self {
                match value {
                    $($name::$variant => $code,)*
                }
            }
        }
    };
}

code_enum! {
    /// Standard key types. Vendor key types resolve to [`ObjectKind::Unknown`].
    KeyType: CK_KEY_TYPE {
        Rsa => CKK_RSA,
        Dsa => CKK_DSA,
        Dh => CKK_DH,
        Ec => CKK_EC,
        X942Dh => CKK_X9_42_DH,
        GenericSecret => CKK_GENERIC_SECRET,
        Rc2 => CKK_RC2,
        Rc4 => CKK_RC4,
        Des => CKK_DES,
        Des2 => CKK_DES2,
        Des3 => CKK_DES3,
        Aes => CKK_AES,
        Blowfish => CKK_BLOWFISH,
        Twofish => CKK_TWOFISH,
        EcEdwards => CKK_EC_EDWARDS,
        EcMontgomery => CKK_EC_MONTGOMERY,
    }
}

code_enum! {
    CertificateType: CK_CERTIFICATE_TYPE {
        X509 => CKC_X_509,
        X509AttributeCertificate => CKC_X_509_ATTR_CERT,
        Wtls => CKC_WTLS,
    }
}

code_enum! {
    HardwareFeatureType: CK_HW_FEATURE_TYPE {
        MonotonicCounter => CKH_MONOTONIC_COUNTER,
        Clock => CKH_CLOCK,
        UserInterface => CKH_USER_INTERFACE,
    }
}

/// The concrete kind of a token object, selected by its class and, for most
/// classes, a second discriminant (key, certificate or hardware feature type).
#[derive(Debug, Display, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ObjectKind {
    Data,
    Certificate(CertificateType),
    PublicKey(KeyType),
    PrivateKey(KeyType),
    SecretKey(KeyType),
    DomainParameters(KeyType),
    HardwareFeature(HardwareFeatureType),
    Profile,
    /// A class/subtype combination with no dedicated schema. The raw
    /// discriminants are kept.
    Unknown { class: CK_OBJECT_CLASS, subtype: Option<CK_ULONG> },
}

// The key and certificate type attributes are spelled out in full; their
// variant names are taken by the discriminant enums above.
use AttributeType::{
    AcIssuer,
    AllowedMechanisms,
    AlwaysAuthenticate,
    AlwaysSensitive,
    Application,
    AttrTypes,
    Base,
    CertificateCategory,
    CheckValue,
    Class,
    Coefficient,
    Copyable,
    Decrypt,
    Derive,
    Destroyable,
    EcParams,
    EcPoint,
    Encrypt,
    EndDate,
    Exponent1,
    Exponent2,
    Extractable,
    HasReset,
    HashOfIssuerPublicKey,
    HashOfSubjectPublicKey,
    HwFeatureType,
    Id,
    Issuer,
    JavaMidpSecurityDomain,
    KeyGenMechanism,
    Label,
    Local,
    Modifiable,
    Modulus,
    ModulusBits,
    NameHashAlgorithm,
    NeverExtractable,
    ObjectId,
    Owner,
    Prime,
    Prime1,
    Prime2,
    PrimeBits,
    Private,
    PrivateExponent,
    ProfileId,
    PublicExponent,
    PublicKeyInfo,
    ResetOnInit,
    Sensitive,
    SerialNumber,
    Sign,
    SignRecover,
    StartDate,
    Subject,
    Subprime,
    SubprimeBits,
    Token,
    Trusted,
    UniqueId,
    Unwrap,
    UnwrapTemplate,
    Url,
    Value,
    ValueBits,
    ValueLen,
    Verify,
    VerifyRecover,
    Wrap,
    WrapTemplate,
    WrapWithTrusted,
};

const STORAGE: &[AttributeType] =
    &[Token, Private, Modifiable, Label, Copyable, Destroyable, UniqueId];
const DATA: &[AttributeType] = &[Application, ObjectId, Value];
const CERTIFICATE: &[AttributeType] = &[
    AttributeType::CertificateType,
    Trusted,
    CertificateCategory,
    CheckValue,
    StartDate,
    EndDate,
    PublicKeyInfo,
];
const X509: &[AttributeType] = &[
    Subject,
    Id,
    Issuer,
    SerialNumber,
    Value,
    Url,
    HashOfSubjectPublicKey,
    HashOfIssuerPublicKey,
    JavaMidpSecurityDomain,
    NameHashAlgorithm,
];
const X509_ATTRIBUTE: &[AttributeType] = &[Owner, AcIssuer, SerialNumber, AttrTypes, Value];
const WTLS: &[AttributeType] = &[
    Subject,
    Issuer,
    Value,
    Url,
    HashOfSubjectPublicKey,
    HashOfIssuerPublicKey,
    NameHashAlgorithm,
];
const KEY: &[AttributeType] = &[
    AttributeType::KeyType,
    Id,
    StartDate,
    EndDate,
    Derive,
    Local,
    KeyGenMechanism,
    AllowedMechanisms,
];
const PUBLIC_KEY: &[AttributeType] =
    &[Subject, Encrypt, Verify, VerifyRecover, Wrap, Trusted, WrapTemplate, PublicKeyInfo];
const PRIVATE_KEY: &[AttributeType] = &[
    Subject,
    Sensitive,
    Decrypt,
    Sign,
    SignRecover,
    Unwrap,
    Extractable,
    AlwaysSensitive,
    NeverExtractable,
    WrapWithTrusted,
    UnwrapTemplate,
    AlwaysAuthenticate,
    PublicKeyInfo,
];
const SECRET_KEY: &[AttributeType] = &[
    Sensitive,
    Encrypt,
    Decrypt,
    Sign,
    Verify,
    Wrap,
    Unwrap,
    Extractable,
    AlwaysSensitive,
    NeverExtractable,
    CheckValue,
    WrapWithTrusted,
    Trusted,
    WrapTemplate,
    UnwrapTemplate,
];
const DOMAIN_PARAMETERS: &[AttributeType] = &[AttributeType::KeyType, Local];
const HARDWARE_FEATURE: &[AttributeType] = &[HwFeatureType];
const PROFILE: &[AttributeType] = &[ProfileId];

fn public_key_attributes(key_type: KeyType) -> &'static [AttributeType] {
    match key_type {
        KeyType::Rsa => &[Modulus, ModulusBits, PublicExponent],
        KeyType::Dsa => &[Prime, Subprime, Base, Value],
        KeyType::Dh => &[Prime, Base, Value],
        KeyType::X942Dh => &[Prime, Base, Subprime, Value],
        KeyType::Ec | KeyType::EcEdwards | KeyType::EcMontgomery => &[EcParams, EcPoint],
        _ => &[],
    }
}

fn private_key_attributes(key_type: KeyType) -> &'static [AttributeType] {
    match key_type {
        KeyType::Rsa => &[
            Modulus,
            PublicExponent,
            PrivateExponent,
            Prime1,
            Prime2,
            Exponent1,
            Exponent2,
            Coefficient,
        ],
        KeyType::Dsa => &[Prime, Subprime, Base, Value],
        KeyType::Dh => &[Prime, Base, Value, ValueBits],
        KeyType::X942Dh => &[Prime, Base, Subprime, Value],
        KeyType::Ec | KeyType::EcEdwards | KeyType::EcMontgomery => &[EcParams, Value],
        _ => &[],
    }
}

fn secret_key_attributes(key_type: KeyType) -> &'static [AttributeType] {
    match key_type {
        KeyType::Des | KeyType::Des2 | KeyType::Des3 => &[Value],
        KeyType::GenericSecret
        | KeyType::Rc2
        | KeyType::Rc4
        | KeyType::Aes
        | KeyType::Blowfish
        | KeyType::Twofish => &[Value, ValueLen],
        _ => &[],
    }
}

fn domain_parameter_attributes(key_type: KeyType) -> &'static [AttributeType] {
    match key_type {
        KeyType::Dsa => &[Prime, Subprime, Base, PrimeBits],
        KeyType::Dh => &[Prime, Base, PrimeBits],
        KeyType::X942Dh => &[Prime, Base, Subprime, PrimeBits, SubprimeBits],
        KeyType::Ec | KeyType::EcEdwards | KeyType::EcMontgomery => &[EcParams],
        _ => &[],
    }
}

fn hardware_feature_attributes(feature: HardwareFeatureType) -> &'static [AttributeType] {
    match feature {
        HardwareFeatureType::MonotonicCounter => &[ResetOnInit, HasReset, Value],
        HardwareFeatureType::Clock => &[Value],
        HardwareFeatureType::UserInterface => &[],
    }
}

impl ObjectKind {
    pub fn class(&self) -> CK_OBJECT_CLASS {
        match self {
            ObjectKind::Data => CKO_DATA,
            ObjectKind::Certificate(_) => CKO_CERTIFICATE,
            ObjectKind::PublicKey(_) => CKO_PUBLIC_KEY,
            ObjectKind::PrivateKey(_) => CKO_PRIVATE_KEY,
            ObjectKind::SecretKey(_) => CKO_SECRET_KEY,
            ObjectKind::DomainParameters(_) => CKO_DOMAIN_PARAMETERS,
            ObjectKind::HardwareFeature(_) => CKO_HW_FEATURE,
            ObjectKind::Profile => CKO_PROFILE,
            ObjectKind::Unknown { class, .. } => *class,
        }
    }

    /// Value of the second discriminant, if the kind has one.
    pub fn subtype(&self) -> Option<CK_ULONG> {
        match self {
            ObjectKind::Certificate(certificate_type) => Some((*certificate_type).into()),
            ObjectKind::PublicKey(key_type)
            | ObjectKind::PrivateKey(key_type)
            | ObjectKind::SecretKey(key_type)
            | ObjectKind::DomainParameters(key_type) => Some((*key_type).into()),
            ObjectKind::HardwareFeature(feature) => Some((*feature).into()),
            ObjectKind::Unknown { subtype, .. } => *subtype,
            ObjectKind::Data | ObjectKind::Profile => None,
        }
    }

    pub fn key_type(&self) -> Option<KeyType> {
        match self {
            ObjectKind::PublicKey(key_type)
            | ObjectKind::PrivateKey(key_type)
            | ObjectKind::SecretKey(key_type)
            | ObjectKind::DomainParameters(key_type) => Some(*key_type),
            _ => None,
        }
    }

    /// Every attribute an object of this kind carries, in encode order,
    /// starting with `CKA_CLASS`.
    pub fn attribute_types(&self) -> Vec<AttributeType> {
        let layers: Vec<&[AttributeType]> = match *self {
            ObjectKind::Data => vec![STORAGE, DATA],
            ObjectKind::Certificate(certificate_type) => vec![
                STORAGE,
                CERTIFICATE,
                match certificate_type {
                    CertificateType::X509 => X509,
                    CertificateType::X509AttributeCertificate => X509_ATTRIBUTE,
                    CertificateType::Wtls => WTLS,
                },
            ],
            ObjectKind::PublicKey(key_type) => {
                vec![STORAGE, KEY, PUBLIC_KEY, public_key_attributes(key_type)]
            }
            ObjectKind::PrivateKey(key_type) => {
                vec![STORAGE, KEY, PRIVATE_KEY, private_key_attributes(key_type)]
            }
            ObjectKind::SecretKey(key_type) => {
                vec![STORAGE, KEY, SECRET_KEY, secret_key_attributes(key_type)]
            }
            ObjectKind::DomainParameters(key_type) => {
                vec![STORAGE, DOMAIN_PARAMETERS, domain_parameter_attributes(key_type)]
            }
            ObjectKind::HardwareFeature(feature) => {
                vec![HARDWARE_FEATURE, hardware_feature_attributes(feature)]
            }
            ObjectKind::Profile => vec![PROFILE],
            ObjectKind::Unknown { .. } => vec![STORAGE],
        };
        let mut types = vec![Class];
        for type_ in layers.into_iter().flatten() {
            if !types.contains(type_) {
                types.push(*type_);
            }
        }
        types
    }
}

/// A token object: an optional handle plus a snapshot of its attributes.
///
/// The snapshot is only as fresh as the last read. Cloning copies every
/// attribute value.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Object {
    handle: Option<CK_OBJECT_HANDLE>,
    kind: ObjectKind,
    attributes: Attributes,
}

impl Object {
    /// An object template of the given kind with its discriminants set and
    /// every other attribute unread.
    pub fn new(kind: ObjectKind) -> Self {
        let mut attributes = Attributes::with_types(kind.attribute_types());
        attributes.insert(Attribute::ulong(Class, kind.class()));
        if let (Some(subtype), Some(type_)) =
            (kind.subtype(), registry::discriminant_attribute(kind.class()))
        {
            attributes.insert(Attribute::ulong(type_, subtype));
        }
        Object { handle: None, kind, attributes }
    }

    pub fn data() -> Self {
        Object::new(ObjectKind::Data)
    }

    pub fn certificate(certificate_type: CertificateType) -> Self {
        Object::new(ObjectKind::Certificate(certificate_type))
    }

    pub fn public_key(key_type: KeyType) -> Self {
        Object::new(ObjectKind::PublicKey(key_type))
    }

    pub fn private_key(key_type: KeyType) -> Self {
        Object::new(ObjectKind::PrivateKey(key_type))
    }

    pub fn secret_key(key_type: KeyType) -> Self {
        Object::new(ObjectKind::SecretKey(key_type))
    }

    /// Types an attribute table read from the token. Attributes outside the
    /// kind's schema are kept after the schema attributes.
    pub fn from_attributes(handle: Option<CK_OBJECT_HANDLE>, attributes: Attributes) -> Self {
        let kind = registry::resolve_attributes(&attributes);
        let mut object = Object::new(kind);
        for attribute in &attributes {
            object.attributes.insert(attribute.clone());
        }
        object.handle = handle;
        object
    }

    /// Binds the object to a token handle, e.g. before reading it.
    pub fn with_handle(mut self, handle: CK_OBJECT_HANDLE) -> Self {
        self.handle = Some(handle);
        self
    }

    pub fn handle(&self) -> Option<CK_OBJECT_HANDLE> {
        self.handle
    }

    pub fn kind(&self) -> ObjectKind {
        self.kind
    }

    pub fn class(&self) -> CK_OBJECT_CLASS {
        self.kind.class()
    }

    pub fn attributes(&self) -> &Attributes {
        &self.attributes
    }

    pub fn get(&self, type_: AttributeType) -> Option<&Attribute> {
        self.attributes.get(type_)
    }

    /// Sets an attribute value. The discriminants are fixed by the kind.
    pub fn set(&mut self, type_: AttributeType, value: impl Into<AttributeValue>) -> Result<()> {
        if type_ == Class || Some(type_) == registry::discriminant_attribute(self.class()) {
            return Err(Error::InvalidParameter(format!(
                "{type_} is fixed for a {} object",
                self.kind
            )));
        }
        self.attributes.set(type_, value)
    }

    /// Decodes a token response into the snapshot, see [`Attributes::absorb`].
    pub fn absorb(&mut self, response: &[RawAttribute]) -> Result<()> {
        self.attributes.absorb(response)
    }

    /// Whether every present attribute of `template` has an equal present
    /// value on this object.
    pub fn matches(&self, template: &Attributes) -> bool {
        template
            .iter()
            .filter(|wanted| wanted.is_present())
            .all(|wanted| self.get(wanted.attribute_type()) == Some(wanted))
    }
}

/// One header line naming the kind and handle, then one line per attribute.
impl fmt::Display for Object {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.handle {
            Some(handle) => write!(f, "{} object #{handle}", self.kind)?,
            None => write!(f, "{} object (unsaved)", self.kind)?,
        }
        for attribute in &self.attributes {
            write!(f, "\n  {attribute}")?;
        }
        Ok(())
    }
}
