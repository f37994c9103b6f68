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
use pkcs11_wrapper_traits::{LEN_SENSITIVE, LEN_UNAVAILABLE, RawAttribute};
use strum_macros::{Display, EnumIter};
use tracing::trace;

use crate::{Error, Result};

const BBOOL_SIZE: usize = std::mem::size_of::<CK_BBOOL>();
const ULONG_SIZE: usize = std::mem::size_of::<CK_ULONG>();
const LONG_SIZE: usize = std::mem::size_of::<CK_LONG>();
const DATE_SIZE: usize = 8;

/// The payload variant carried by an attribute. Fixed per identifier.
#[derive(Debug, Display, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AttributeKind {
    Bool,
    Ulong,
    Bytes,
    Chars,
    Date,
    Mechanism,
    MechanismArray,
    AttributeArray,
}

macro_rules! attribute_types {
    ($($variant:ident => $code:ident: $kind:ident,)*) => {
        #[derive(Debug, Display, PartialEq, Eq, Hash, Clone, Copy, PartialOrd, Ord, EnumIter)]
        pub enum AttributeType {
            $($variant,)*
            /// Vendor-defined or otherwise unlisted identifier, kept as opaque bytes.
            Other(CK_ATTRIBUTE_TYPE),
        }

        impl From<CK_ATTRIBUTE_TYPE> for AttributeType {
            fn from(type_: CK_ATTRIBUTE_TYPE) -> Self {
                match type_ {
                    $($code => AttributeType::$variant,)*
                    other => AttributeType::Other(other),
                }
            }
        }

        impl From<AttributeType> for CK_ATTRIBUTE_TYPE {
            fn from(attribute_type: AttributeType) -> Self {
                match attribute_type {
                    $(AttributeType::$variant => $code,)*
                    AttributeType::Other(code) => code,
                }
            }
        }

        impl AttributeType {
            pub fn kind(&self) -> AttributeKind {
                match self {
                    $(AttributeType::$variant => AttributeKind::$kind,)*
                    AttributeType::Other(_) => AttributeKind::Bytes,
                }
            }
        }
    };
}

attribute_types! {
    Class => CKA_CLASS: Ulong,
    Token => CKA_TOKEN: Bool,
    Private => CKA_PRIVATE: Bool,
    Label => CKA_LABEL: Chars,
    UniqueId => CKA_UNIQUE_ID: Chars,
    Application => CKA_APPLICATION: Chars,
    Value => CKA_VALUE: Bytes,
    ObjectId => CKA_OBJECT_ID: Bytes,
    CertificateType => CKA_CERTIFICATE_TYPE: Ulong,
    Issuer => CKA_ISSUER: Bytes,
    SerialNumber => CKA_SERIAL_NUMBER: Bytes,
    AcIssuer => CKA_AC_ISSUER: Bytes,
    Owner => CKA_OWNER: Bytes,
    AttrTypes => CKA_ATTR_TYPES: Bytes,
    Trusted => CKA_TRUSTED: Bool,
    CertificateCategory => CKA_CERTIFICATE_CATEGORY: Ulong,
    JavaMidpSecurityDomain => CKA_JAVA_MIDP_SECURITY_DOMAIN: Ulong,
    Url => CKA_URL: Chars,
    HashOfSubjectPublicKey => CKA_HASH_OF_SUBJECT_PUBLIC_KEY: Bytes,
    HashOfIssuerPublicKey => CKA_HASH_OF_ISSUER_PUBLIC_KEY: Bytes,
    NameHashAlgorithm => CKA_NAME_HASH_ALGORITHM: Mechanism,
    CheckValue => CKA_CHECK_VALUE: Bytes,
    KeyType => CKA_KEY_TYPE: Ulong,
    Subject => CKA_SUBJECT: Bytes,
    Id => CKA_ID: Bytes,
    Sensitive => CKA_SENSITIVE: Bool,
    Encrypt => CKA_ENCRYPT: Bool,
    Decrypt => CKA_DECRYPT: Bool,
    Wrap => CKA_WRAP: Bool,
    Unwrap => CKA_UNWRAP: Bool,
    Sign => CKA_SIGN: Bool,
    SignRecover => CKA_SIGN_RECOVER: Bool,
    Verify => CKA_VERIFY: Bool,
    VerifyRecover => CKA_VERIFY_RECOVER: Bool,
    Derive => CKA_DERIVE: Bool,
    StartDate => CKA_START_DATE: Date,
    EndDate => CKA_END_DATE: Date,
    Modulus => CKA_MODULUS: Bytes,
    ModulusBits => CKA_MODULUS_BITS: Ulong,
    PublicExponent => CKA_PUBLIC_EXPONENT: Bytes,
    PrivateExponent => CKA_PRIVATE_EXPONENT: Bytes,
    Prime1 => CKA_PRIME_1: Bytes,
    Prime2 => CKA_PRIME_2: Bytes,
    Exponent1 => CKA_EXPONENT_1: Bytes,
    Exponent2 => CKA_EXPONENT_2: Bytes,
    Coefficient => CKA_COEFFICIENT: Bytes,
    PublicKeyInfo => CKA_PUBLIC_KEY_INFO: Bytes,
    Prime => CKA_PRIME: Bytes,
    Subprime => CKA_SUBPRIME: Bytes,
    Base => CKA_BASE: Bytes,
    PrimeBits => CKA_PRIME_BITS: Ulong,
    SubprimeBits => CKA_SUBPRIME_BITS: Ulong,
    ValueBits => CKA_VALUE_BITS: Ulong,
    ValueLen => CKA_VALUE_LEN: Ulong,
    Extractable => CKA_EXTRACTABLE: Bool,
    Local => CKA_LOCAL: Bool,
    NeverExtractable => CKA_NEVER_EXTRACTABLE: Bool,
    AlwaysSensitive => CKA_ALWAYS_SENSITIVE: Bool,
    KeyGenMechanism => CKA_KEY_GEN_MECHANISM: Mechanism,
    Modifiable => CKA_MODIFIABLE: Bool,
    Copyable => CKA_COPYABLE: Bool,
    Destroyable => CKA_DESTROYABLE: Bool,
    EcParams => CKA_EC_PARAMS: Bytes,
    EcPoint => CKA_EC_POINT: Bytes,
    AlwaysAuthenticate => CKA_ALWAYS_AUTHENTICATE: Bool,
    WrapWithTrusted => CKA_WRAP_WITH_TRUSTED: Bool,
    WrapTemplate => CKA_WRAP_TEMPLATE: AttributeArray,
    UnwrapTemplate => CKA_UNWRAP_TEMPLATE: AttributeArray,
    DeriveTemplate => CKA_DERIVE_TEMPLATE: AttributeArray,
    HwFeatureType => CKA_HW_FEATURE_TYPE: Ulong,
    ResetOnInit => CKA_RESET_ON_INIT: Bool,
    HasReset => CKA_HAS_RESET: Bool,
    AllowedMechanisms => CKA_ALLOWED_MECHANISMS: MechanismArray,
    ProfileId => CKA_PROFILE_ID: Ulong,
}

impl AttributeType {
    pub fn is_vendor_defined(&self) -> bool {
        CK_ATTRIBUTE_TYPE::from(*self) & CKA_VENDOR_DEFINED != 0
    }
}

/// A calendar date, exchanged as eight ASCII digits `YYYYMMDD`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Date {
    year: u16,
    month: u8,
    day: u8,
}

impl Date {
    /// Fails unless the day exists in that month, leap years included.
    pub fn new(year: u16, month: u8, day: u8) -> Result<Self> {
        if year > 9999 || !(1..=12).contains(&month) || day == 0 || day > days_in(year, month) {
            return Err(Error::InvalidParameter(format!(
                "{year:04}-{month:02}-{day:02} is not a valid date"
            )));
        }
        Ok(Date { year, month, day })
    }

    pub fn year(&self) -> u16 {
        self.year
    }

    pub fn month(&self) -> u8 {
        self.month
    }

    pub fn day(&self) -> u8 {
        self.day
    }

    fn to_bytes(self) -> Vec<u8> {
        format!("{:04}{:02}{:02}", self.year, self.month, self.day).into_bytes()
    }

    fn parse(bytes: &[u8]) -> Option<Self> {
        if bytes.len() != DATE_SIZE || !bytes.iter().all(u8::is_ascii_digit) {
            return None;
        }
        let digits = std::str::from_utf8(bytes).ok()?;
        let year = digits[0..4].parse().ok()?;
        let month = digits[4..6].parse().ok()?;
        let day = digits[6..8].parse().ok()?;
        Date::new(year, month, day).ok()
    }
}

fn days_in(year: u16, month: u8) -> u8 {
    match month {
        2 if year % 4 == 0 && (year % 100 != 0 || year % 400 == 0) => 29,
        2 => 28,
        4 | 6 | 9 | 11 => 30,
        _ => 31,
    }
}

impl fmt::Display for Date {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:04}-{:02}-{:02}", self.year, self.month, self.day)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum AttributeValue {
    Bool(bool),
    Ulong(CK_ULONG),
    Bytes(Vec<u8>),
    Chars(String),
    /// `None` is the empty date some tokens report for unset validity periods.
    Date(Option<Date>),
    Mechanism(CK_MECHANISM_TYPE),
    MechanismArray(Vec<CK_MECHANISM_TYPE>),
    AttributeArray(Vec<Attribute>),
}

impl AttributeValue {
    pub fn kind(&self) -> AttributeKind {
        match self {
            AttributeValue::Bool(_) => AttributeKind::Bool,
            AttributeValue::Ulong(_) => AttributeKind::Ulong,
            AttributeValue::Bytes(_) => AttributeKind::Bytes,
            AttributeValue::Chars(_) => AttributeKind::Chars,
            AttributeValue::Date(_) => AttributeKind::Date,
            AttributeValue::Mechanism(_) => AttributeKind::Mechanism,
            AttributeValue::MechanismArray(_) => AttributeKind::MechanismArray,
            AttributeValue::AttributeArray(_) => AttributeKind::AttributeArray,
        }
    }

    // Reconciles the handful of conversions `Into<AttributeValue>` cannot tell
    // apart, e.g. a plain integer destined for a mechanism-reference attribute.
    fn coerce(self, kind: AttributeKind) -> std::result::Result<Self, Self> {
        match (self, kind) {
            (value, kind) if value.kind() == kind => Ok(value),
            (AttributeValue::Ulong(code), AttributeKind::Mechanism) => {
                Ok(AttributeValue::Mechanism(code))
            }
            (AttributeValue::Mechanism(code), AttributeKind::Ulong) => {
                Ok(AttributeValue::Ulong(code))
            }
            (AttributeValue::Chars(s), AttributeKind::Bytes) => {
                Ok(AttributeValue::Bytes(s.into_bytes()))
            }
            (value, _) => Err(value),
        }
    }

    fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(match self {
            AttributeValue::Bool(b) => {
                CK_BBOOL::to_ne_bytes(if *b { CK_TRUE } else { CK_FALSE }).to_vec()
            }
            AttributeValue::Ulong(int) | AttributeValue::Mechanism(int) => {
                int.to_ne_bytes().to_vec()
            }
            AttributeValue::Bytes(bytes) => bytes.clone(),
            AttributeValue::Chars(s) => s.as_bytes().to_vec(),
            AttributeValue::Date(date) => date.map(Date::to_bytes).unwrap_or_default(),
            AttributeValue::MechanismArray(codes) => {
                codes.iter().flat_map(|code| code.to_ne_bytes()).collect()
            }
            AttributeValue::AttributeArray(attributes) => {
                let raw = attributes.iter().map(Attribute::encode).collect::<Result<Vec<_>>>()?;
                encode_flat(&raw)
            }
        })
    }
}

impl fmt::Display for AttributeValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AttributeValue::Bool(b) => write!(f, "{b}"),
            AttributeValue::Ulong(int) => write!(f, "{int}"),
            AttributeValue::Mechanism(code) => write!(f, "{code:#x}"),
            AttributeValue::Bytes(bytes) => {
                bytes.iter().try_for_each(|byte| write!(f, "{byte:02x}"))
            }
            AttributeValue::Chars(s) => f.write_str(s),
            AttributeValue::Date(Some(date)) => write!(f, "{date}"),
            AttributeValue::Date(None) => f.write_str("<empty>"),
            AttributeValue::MechanismArray(codes) => write!(f, "{codes:x?}"),
            AttributeValue::AttributeArray(attributes) => {
                write!(f, "[{} attributes]", attributes.len())
            }
        }
    }
}

impl From<bool> for AttributeValue {
    fn from(value: bool) -> Self {
        AttributeValue::Bool(value)
    }
}

impl From<CK_ULONG> for AttributeValue {
    fn from(value: CK_ULONG) -> Self {
        AttributeValue::Ulong(value)
    }
}

impl From<Vec<u8>> for AttributeValue {
    fn from(value: Vec<u8>) -> Self {
        AttributeValue::Bytes(value)
    }
}

impl From<&[u8]> for AttributeValue {
    fn from(value: &[u8]) -> Self {
        AttributeValue::Bytes(value.to_vec())
    }
}

impl<const N: usize> From<&[u8; N]> for AttributeValue {
    fn from(value: &[u8; N]) -> Self {
        AttributeValue::Bytes(value.to_vec())
    }
}

impl From<String> for AttributeValue {
    fn from(value: String) -> Self {
        AttributeValue::Chars(value)
    }
}

impl From<&str> for AttributeValue {
    fn from(value: &str) -> Self {
        AttributeValue::Chars(value.to_string())
    }
}

impl From<Date> for AttributeValue {
    fn from(value: Date) -> Self {
        AttributeValue::Date(Some(value))
    }
}

impl From<Vec<CK_MECHANISM_TYPE>> for AttributeValue {
    fn from(value: Vec<CK_MECHANISM_TYPE>) -> Self {
        AttributeValue::MechanismArray(value)
    }
}

impl From<Vec<Attribute>> for AttributeValue {
    fn from(value: Vec<Attribute>) -> Self {
        AttributeValue::AttributeArray(value)
    }
}

/// Exactly one of these holds for every attribute.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub enum AttributeState {
    #[default]
    NotRead,
    Present(AttributeValue),
    /// The token refused to reveal the value.
    Sensitive,
    /// The attribute does not apply to the object.
    Unavailable,
}

/// A typed unit of token object state.
///
/// Equality is structural over identifier, state and payload, so an attribute
/// that was reported sensitive never equals one that was read.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Attribute {
    type_: AttributeType,
    state: AttributeState,
}

impl Attribute {
    pub fn new(type_: AttributeType) -> Self {
        Attribute { type_, state: AttributeState::NotRead }
    }

    pub fn with_value(type_: AttributeType, value: impl Into<AttributeValue>) -> Result<Self> {
        let mut attribute = Attribute::new(type_);
        attribute.set_value(value)?;
        Ok(attribute)
    }

    /// Integer attribute known to be present, e.g. an object's class.
    pub(crate) fn ulong(type_: AttributeType, value: CK_ULONG) -> Self {
        debug_assert_eq!(type_.kind(), AttributeKind::Ulong);
        Attribute { type_, state: AttributeState::Present(AttributeValue::Ulong(value)) }
    }

    /// Builds an attribute from a token response entry.
    pub fn from_raw(raw: &RawAttribute) -> Result<Self> {
        let mut attribute = Attribute::new(AttributeType::from(raw.type_));
        attribute.decode(raw.value_len, raw.value.as_deref())?;
        Ok(attribute)
    }

    pub fn attribute_type(&self) -> AttributeType {
        self.type_
    }

    pub fn kind(&self) -> AttributeKind {
        self.type_.kind()
    }

    pub fn state(&self) -> &AttributeState {
        &self.state
    }

    pub fn value(&self) -> Option<&AttributeValue> {
        match &self.state {
            AttributeState::Present(value) => Some(value),
            _ => None,
        }
    }

    pub fn is_present(&self) -> bool {
        matches!(self.state, AttributeState::Present(_))
    }

    pub fn is_sensitive(&self) -> bool {
        self.state == AttributeState::Sensitive
    }

    pub fn is_unavailable(&self) -> bool {
        self.state == AttributeState::Unavailable
    }

    pub fn is_read(&self) -> bool {
        self.state != AttributeState::NotRead
    }

    /// Sets the payload. The value must match the identifier's kind.
    pub fn set_value(&mut self, value: impl Into<AttributeValue>) -> Result<()> {
        let value = value.into().coerce(self.kind()).map_err(|value| {
            Error::malformed(
                self.type_,
                format!("expected a {} value, got {}", self.kind(), value.kind()),
            )
        })?;
        self.state = AttributeState::Present(value);
        Ok(())
    }

    /// Forgets any value so the attribute is requested again on the next read.
    pub fn clear(&mut self) {
        self.state = AttributeState::NotRead;
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self.value()? {
            AttributeValue::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_ulong(&self) -> Option<CK_ULONG> {
        match self.value()? {
            AttributeValue::Ulong(int) | AttributeValue::Mechanism(int) => Some(*int),
            _ => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self.value()? {
            AttributeValue::Bytes(bytes) => Some(bytes),
            AttributeValue::Chars(s) => Some(s.as_bytes()),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self.value()? {
            AttributeValue::Chars(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_date(&self) -> Option<Date> {
        match self.value()? {
            AttributeValue::Date(date) => *date,
            _ => None,
        }
    }

    pub fn as_mechanisms(&self) -> Option<&[CK_MECHANISM_TYPE]> {
        match self.value()? {
            AttributeValue::MechanismArray(codes) => Some(codes),
            _ => None,
        }
    }

    pub fn as_attributes(&self) -> Option<&[Attribute]> {
        match self.value()? {
            AttributeValue::AttributeArray(attributes) => Some(attributes),
            _ => None,
        }
    }

    /// Encodes the attribute into its wire shape. Attributes that have not been
    /// read encode as request placeholders.
    pub fn encode(&self) -> Result<RawAttribute> {
        let code = CK_ATTRIBUTE_TYPE::from(self.type_);
        Ok(match &self.state {
            AttributeState::NotRead => RawAttribute::request(code),
            AttributeState::Sensitive => RawAttribute::sensitive(code),
            AttributeState::Unavailable => RawAttribute::unavailable(code),
            AttributeState::Present(value) => RawAttribute::with_value(code, value.to_bytes()?)
                .ok_or_else(|| Error::malformed(self.type_, "value too large to encode"))?,
        })
    }

    /// Request placeholder for this attribute, regardless of its state.
    pub fn request(&self) -> RawAttribute {
        RawAttribute::request(self.type_.into())
    }

    /// Replaces the state with the one described by a wire value. On failure
    /// the attribute is left untouched.
    pub fn decode(&mut self, value_len: CK_LONG, value: Option<&[u8]>) -> Result<()> {
        self.state = decode_state(self.type_, value_len, value)?;
        trace!(attribute = %self.type_, state = ?self.state, "decoded attribute");
        Ok(())
    }
}

impl fmt::Display for Attribute {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.state {
            AttributeState::NotRead => write!(f, "{}: <not read>", self.type_),
            AttributeState::Present(value) => write!(f, "{}: {value}", self.type_),
            AttributeState::Sensitive => write!(f, "{}: <sensitive>", self.type_),
            AttributeState::Unavailable => write!(f, "{}: <unavailable>", self.type_),
        }
    }
}

fn decode_state(
    type_: AttributeType,
    value_len: CK_LONG,
    value: Option<&[u8]>,
) -> Result<AttributeState> {
    match value_len {
        LEN_UNAVAILABLE => return Ok(AttributeState::Unavailable),
        LEN_SENSITIVE => return Ok(AttributeState::Sensitive),
        len if len < 0 => return Err(Error::malformed(type_, format!("reserved length {len}"))),
        _ => {}
    }
    let bytes = value.unwrap_or_default();
    if usize::try_from(value_len)? != bytes.len() {
        return Err(Error::malformed(
            type_,
            format!("length {value_len} does not match {} value bytes", bytes.len()),
        ));
    }
    decode_value(type_, bytes).map(AttributeState::Present)
}

fn decode_value(type_: AttributeType, bytes: &[u8]) -> Result<AttributeValue> {
    Ok(match type_.kind() {
        AttributeKind::Bool => AttributeValue::Bool(try_u8_into_bool(type_, bytes)?),
        AttributeKind::Ulong => AttributeValue::Ulong(try_into_ulong(type_, bytes)?),
        AttributeKind::Mechanism => AttributeValue::Mechanism(try_into_ulong(type_, bytes)?),
        AttributeKind::Bytes => AttributeValue::Bytes(bytes.to_vec()),
        AttributeKind::Chars => AttributeValue::Chars(
            String::from_utf8(bytes.to_vec())
                .map_err(|e| Error::malformed(type_, e.to_string()))?,
        ),
        AttributeKind::Date if bytes.is_empty() => AttributeValue::Date(None),
        AttributeKind::Date => AttributeValue::Date(Some(
            Date::parse(bytes).ok_or_else(|| Error::malformed(type_, "not a YYYYMMDD date"))?,
        )),
        AttributeKind::MechanismArray => {
            if bytes.len() % ULONG_SIZE != 0 {
                return Err(Error::malformed(
                    type_,
                    format!("{} bytes is not a whole number of mechanisms", bytes.len()),
                ));
            }
            let codes = bytes.chunks_exact(ULONG_SIZE).map(|chunk| try_into_ulong(type_, chunk));
            AttributeValue::MechanismArray(codes.collect::<Result<_>>()?)
        }
        AttributeKind::AttributeArray => {
            let raw = decode_flat(bytes)
                .ok_or_else(|| Error::malformed(type_, "truncated nested attribute"))?;
            AttributeValue::AttributeArray(
                raw.iter().map(Attribute::from_raw).collect::<Result<_>>()?,
            )
        }
    })
}

fn try_u8_into_bool(type_: AttributeType, slice: &[u8]) -> Result<bool> {
    let as_array: [u8; BBOOL_SIZE] = slice.try_into().map_err(|_| {
        Error::malformed(type_, format!("expected {BBOOL_SIZE} byte, got {}", slice.len()))
    })?;
    Ok(!matches!(CK_BBOOL::from_ne_bytes(as_array), CK_FALSE))
}

fn try_into_ulong(type_: AttributeType, slice: &[u8]) -> Result<CK_ULONG> {
    let as_array: [u8; ULONG_SIZE] = slice.try_into().map_err(|_| {
        Error::malformed(type_, format!("expected {ULONG_SIZE} bytes, got {}", slice.len()))
    })?;
    Ok(CK_ULONG::from_ne_bytes(as_array))
}

/// Serializes attribute entries back to back as
/// `CK_ULONG type | CK_LONG length | value bytes`. Entries without a value
/// (placeholders and sentinels) contribute no value bytes.
pub fn encode_flat(attributes: &[RawAttribute]) -> Vec<u8> {
    let mut out = Vec::new();
    for raw in attributes {
        out.extend_from_slice(&raw.type_.to_ne_bytes());
        out.extend_from_slice(&raw.value_len.to_ne_bytes());
        if let Some(value) = &raw.value {
            out.extend_from_slice(value);
        }
    }
    out
}

/// Inverse of [`encode_flat`]. Returns `None` on truncated input.
pub fn decode_flat(mut bytes: &[u8]) -> Option<Vec<RawAttribute>> {
    let mut out = Vec::new();
    while !bytes.is_empty() {
        let (type_bytes, rest) = bytes.split_at_checked(ULONG_SIZE)?;
        let (len_bytes, rest) = rest.split_at_checked(LONG_SIZE)?;
        let type_ = CK_ULONG::from_ne_bytes(type_bytes.try_into().ok()?);
        let value_len = CK_LONG::from_ne_bytes(len_bytes.try_into().ok()?);
        if value_len < 0 {
            out.push(RawAttribute { type_, value_len, value: None });
            bytes = rest;
            continue;
        }
        let (value, rest) = rest.split_at_checked(usize::try_from(value_len).ok()?)?;
        out.push(RawAttribute { type_, value_len, value: Some(value.to_vec()) });
        bytes = rest;
    }
    Some(out)
}

#[cfg(test)]
mod tests {
    use strum::IntoEnumIterator;

    use super::*;

    fn round_trip(attribute: &Attribute) -> Attribute {
        let raw = attribute.encode().unwrap();
        Attribute::from_raw(&raw).unwrap()
    }

    #[test]
    fn identifier_codes_round_trip() {
        for type_ in AttributeType::iter().filter(|t| !matches!(t, AttributeType::Other(_))) {
            assert_eq!(AttributeType::from(CK_ATTRIBUTE_TYPE::from(type_)), type_);
        }
        let vendor: CK_ATTRIBUTE_TYPE = CKA_VENDOR_DEFINED | 0x1234;
        assert_eq!(AttributeType::from(vendor), AttributeType::Other(vendor));
        assert!(AttributeType::Other(vendor).is_vendor_defined());
        assert!(!AttributeType::Label.is_vendor_defined());
    }

    #[test]
    fn payload_variants_round_trip() {
        let nested = vec![
            Attribute::with_value(AttributeType::Encrypt, true).unwrap(),
            Attribute::with_value(AttributeType::Label, "inner").unwrap(),
        ];
        let cases = [
            Attribute::with_value(AttributeType::Token, true).unwrap(),
            Attribute::with_value(AttributeType::Private, false).unwrap(),
            Attribute::with_value(AttributeType::Class, CKO_SECRET_KEY).unwrap(),
            Attribute::with_value(AttributeType::Value, b"\x00\x01\xff").unwrap(),
            Attribute::with_value(AttributeType::Value, Vec::<u8>::new()).unwrap(),
            Attribute::with_value(AttributeType::Label, "").unwrap(),
            Attribute::with_value(AttributeType::Label, "signing key \u{1F511}").unwrap(),
            Attribute::with_value(AttributeType::StartDate, Date::new(2024, 2, 29).unwrap())
                .unwrap(),
            Attribute::with_value(AttributeType::EndDate, AttributeValue::Date(None)).unwrap(),
            Attribute::with_value(AttributeType::KeyGenMechanism, CKM_AES_KEY_GEN).unwrap(),
            Attribute::with_value(
                AttributeType::AllowedMechanisms,
                vec![CKM_AES_CBC, CKM_AES_GCM, CKM_VENDOR_DEFINED | 7],
            )
            .unwrap(),
            Attribute::with_value(AttributeType::AllowedMechanisms, Vec::<CK_ULONG>::new())
                .unwrap(),
            Attribute::with_value(AttributeType::WrapTemplate, nested).unwrap(),
            Attribute::with_value(AttributeType::Other(0x8000_0001), b"vendor").unwrap(),
        ];
        for attribute in &cases {
            assert_eq!(&round_trip(attribute), attribute, "{attribute}");
        }
    }

    #[test]
    fn zero_length_bytes_are_present() {
        let mut attribute = Attribute::new(AttributeType::ObjectId);
        attribute.decode(0, Some(&[])).unwrap();
        assert!(attribute.is_present());
        assert_eq!(attribute.as_bytes(), Some(&[][..]));

        let mut attribute = Attribute::new(AttributeType::ObjectId);
        attribute.decode(0, None).unwrap();
        assert_eq!(attribute.as_bytes(), Some(&[][..]));
    }

    #[test]
    fn sentinels() {
        let mut attribute = Attribute::with_value(AttributeType::Value, b"secret").unwrap();
        attribute.decode(LEN_SENSITIVE, None).unwrap();
        assert!(attribute.is_sensitive());
        assert_eq!(attribute.value(), None);

        attribute.decode(LEN_UNAVAILABLE, None).unwrap();
        assert!(attribute.is_unavailable());
        assert_eq!(attribute.value(), None);

        assert_eq!(round_trip(&attribute), attribute);
    }

    #[test]
    fn presence_takes_part_in_equality() {
        let mut sensitive = Attribute::new(AttributeType::Value);
        sensitive.decode(LEN_SENSITIVE, None).unwrap();
        let mut unavailable = Attribute::new(AttributeType::Value);
        unavailable.decode(LEN_UNAVAILABLE, None).unwrap();
        assert_ne!(sensitive, unavailable);
        assert_ne!(sensitive, Attribute::new(AttributeType::Value));
    }

    #[test]
    fn fixed_width_mismatch_is_malformed() {
        let mut attribute = Attribute::with_value(AttributeType::Class, CKO_DATA).unwrap();
        let err = attribute.decode(3, Some(&[0, 0, 0])).unwrap_err();
        assert!(matches!(err, Error::MalformedAttribute { type_: AttributeType::Class, .. }));
        // Failed decodes leave the previous state alone.
        assert_eq!(attribute.as_ulong(), Some(CKO_DATA));

        let mut attribute = Attribute::new(AttributeType::Token);
        assert!(attribute.decode(2, Some(&[1, 0])).is_err());
        assert!(!attribute.is_read());
    }

    #[test]
    fn length_must_match_bytes() {
        let mut attribute = Attribute::new(AttributeType::Value);
        assert!(matches!(
            attribute.decode(4, Some(b"ab")),
            Err(Error::MalformedAttribute { .. })
        ));
        assert!(matches!(attribute.decode(-3, None), Err(Error::MalformedAttribute { .. })));
    }

    #[test]
    fn dates() {
        let mut attribute = Attribute::new(AttributeType::StartDate);
        attribute.decode(8, Some(b"20230115")).unwrap();
        assert_eq!(attribute.as_date(), Some(Date::new(2023, 1, 15).unwrap()));
        assert!(attribute.decode(8, Some(b"2023011x")).is_err());
        assert!(attribute.decode(6, Some(b"202301")).is_err());
        assert!(matches!(Date::new(2023, 13, 1), Err(Error::InvalidParameter(_))));
    }

    #[test]
    fn day_must_exist_in_month() {
        assert!(Date::new(2023, 2, 31).is_err());
        assert!(Date::new(2023, 2, 29).is_err());
        assert!(Date::new(2023, 4, 31).is_err());
        assert!(Date::new(1900, 2, 29).is_err());
        assert!(Date::new(2024, 2, 29).is_ok());
        assert!(Date::new(2000, 2, 29).is_ok());
        assert!(Date::new(2023, 12, 31).is_ok());

        let mut attribute = Attribute::new(AttributeType::EndDate);
        assert!(attribute.decode(8, Some(b"20230230")).is_err());
    }

    #[test]
    fn set_value_checks_kind() {
        let mut attribute = Attribute::new(AttributeType::Encrypt);
        assert!(matches!(
            attribute.set_value(b"yes"),
            Err(Error::MalformedAttribute { type_: AttributeType::Encrypt, .. })
        ));
        assert!(!attribute.is_read());
        // Integers are accepted for mechanism references.
        let attribute =
            Attribute::with_value(AttributeType::KeyGenMechanism, CKM_DES3_KEY_GEN).unwrap();
        assert_eq!(attribute.value(), Some(&AttributeValue::Mechanism(CKM_DES3_KEY_GEN)));
    }

    #[test]
    fn unread_attributes_encode_as_placeholders() {
        let raw = Attribute::new(AttributeType::Label).encode().unwrap();
        assert!(raw.is_request());
        assert_eq!(raw.type_, CKA_LABEL);
    }

    #[test]
    fn truncated_flat_blob() {
        let raw = [RawAttribute::with_value(CKA_ID, vec![1, 2, 3]).unwrap()];
        let mut blob = encode_flat(&raw);
        assert_eq!(decode_flat(&blob).unwrap(), raw);
        blob.pop();
        assert_eq!(decode_flat(&blob), None);
    }
}
