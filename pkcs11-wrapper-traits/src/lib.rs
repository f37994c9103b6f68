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

use std::sync::Arc;

use pkcs11_sys::{
    CK_ATTRIBUTE_TYPE,
    CK_FLAGS,
    CK_LONG,
    CK_MECHANISM_INFO,
    CK_MECHANISM_TYPE,
    CK_NOTIFICATION,
    CK_OBJECT_HANDLE,
    CK_RV,
    CK_SESSION_HANDLE,
    CK_SLOT_ID,
    CK_TOKEN_INFO,
    CK_USER_TYPE,
};
use thiserror::Error;

pub type Result<T> = std::result::Result<T, TransportError>;

/// Length reported for an attribute that does not apply to the object.
pub const LEN_UNAVAILABLE: CK_LONG = -1;
/// Length reported for an attribute whose value the token refuses to reveal.
pub const LEN_SENSITIVE: CK_LONG = -2;

/// A failed token call, identified by the token-defined return value.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error(
    "token returned {rv:#x}{}",
    .extra_info.as_deref().map(|i| format!(" ({i})")).unwrap_or_default()
)]
pub struct TransportError {
    pub rv: CK_RV,
    pub extra_info: Option<String>,
}

impl TransportError {
    pub fn new(rv: CK_RV) -> Self {
        TransportError { rv, extra_info: None }
    }

    pub fn with_info(rv: CK_RV, extra_info: impl Into<String>) -> Self {
        TransportError { rv, extra_info: Some(extra_info.into()) }
    }
}

impl From<CK_RV> for TransportError {
    fn from(rv: CK_RV) -> Self {
        TransportError::new(rv)
    }
}

/// One entry of a flat attribute template as exchanged with the token.
///
/// A request placeholder has no value and a zero length. Responses carry
/// either `Some(value)` with a matching non-negative length, or no value and
/// one of the [`LEN_UNAVAILABLE`] / [`LEN_SENSITIVE`] sentinels.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RawAttribute {
    pub type_: CK_ATTRIBUTE_TYPE,
    pub value_len: CK_LONG,
    pub value: Option<Vec<u8>>,
}

impl RawAttribute {
    pub fn request(type_: CK_ATTRIBUTE_TYPE) -> Self {
        RawAttribute { type_, value_len: 0, value: None }
    }

    pub fn unavailable(type_: CK_ATTRIBUTE_TYPE) -> Self {
        RawAttribute { type_, value_len: LEN_UNAVAILABLE, value: None }
    }

    pub fn sensitive(type_: CK_ATTRIBUTE_TYPE) -> Self {
        RawAttribute { type_, value_len: LEN_SENSITIVE, value: None }
    }

    /// Returns `None` if the value is too large to describe with a `CK_LONG`.
    pub fn with_value(type_: CK_ATTRIBUTE_TYPE, value: Vec<u8>) -> Option<Self> {
        let value_len = CK_LONG::try_from(value.len()).ok()?;
        Some(RawAttribute { type_, value_len, value: Some(value) })
    }

    pub fn is_request(&self) -> bool {
        self.value.is_none() && self.value_len == 0
    }

    pub fn is_unavailable(&self) -> bool {
        self.value_len == LEN_UNAVAILABLE
    }

    pub fn is_sensitive(&self) -> bool {
        self.value_len == LEN_SENSITIVE
    }
}

/// A mechanism code and its encoded parameter block.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RawMechanism {
    pub mechanism: CK_MECHANISM_TYPE,
    pub parameter: Vec<u8>,
}

/// Notification target handed to the transport when a session is opened.
///
/// The transport may invoke it from any thread. An `Err` asks the transport
/// to report that code back to the token library.
pub type NotifyCallback =
    Arc<dyn Fn(CK_SESSION_HANDLE, CK_NOTIFICATION) -> Result<()> + Send + Sync>;

/// Translates vendor-defined codes between their generic and vendor-specific
/// numbering. Only consulted for codes with the vendor-defined bit set.
pub trait VendorCodeConverter: Send + Sync {
    fn generic_to_vendor_mechanism(&self, code: CK_MECHANISM_TYPE) -> CK_MECHANISM_TYPE;
    fn vendor_to_generic_mechanism(&self, code: CK_MECHANISM_TYPE) -> CK_MECHANISM_TYPE;
    fn generic_to_vendor_attribute(&self, code: CK_ATTRIBUTE_TYPE) -> CK_ATTRIBUTE_TYPE {
        code
    }
    fn vendor_to_generic_attribute(&self, code: CK_ATTRIBUTE_TYPE) -> CK_ATTRIBUTE_TYPE {
        code
    }
}

/// The token call surface. Every call blocks for the duration of the device
/// operation and may fail with a token-defined return value.
pub trait Transport: Send + Sync {
    fn name(&self) -> String;
    fn get_slot_list(&self, token_present: bool) -> Result<Vec<CK_SLOT_ID>>;
    fn get_token_info(&self, slot: CK_SLOT_ID) -> Result<CK_TOKEN_INFO>;
    fn get_mechanism_list(&self, slot: CK_SLOT_ID) -> Result<Vec<CK_MECHANISM_TYPE>>;
    fn get_mechanism_info(
        &self,
        slot: CK_SLOT_ID,
        mechanism: CK_MECHANISM_TYPE,
    ) -> Result<CK_MECHANISM_INFO>;
    fn init_token(&self, slot: CK_SLOT_ID, so_pin: &[u8], label: &[u8; 32]) -> Result<()>;

    fn open_session(
        &self,
        slot: CK_SLOT_ID,
        flags: CK_FLAGS,
        notify: Option<NotifyCallback>,
    ) -> Result<CK_SESSION_HANDLE>;
    fn close_session(&self, session: CK_SESSION_HANDLE) -> Result<()>;
    fn login(&self, session: CK_SESSION_HANDLE, user_type: CK_USER_TYPE, pin: &[u8]) -> Result<()>;
    fn logout(&self, session: CK_SESSION_HANDLE) -> Result<()>;

    fn create_object(
        &self,
        session: CK_SESSION_HANDLE,
        template: &[RawAttribute],
    ) -> Result<CK_OBJECT_HANDLE>;
    fn destroy_object(&self, session: CK_SESSION_HANDLE, object: CK_OBJECT_HANDLE) -> Result<()>;
    /// Answers one entry per requested attribute, in request order. Attributes
    /// that are sensitive or do not apply are reported through the length
    /// sentinels rather than by failing the call.
    fn get_attribute_value(
        &self,
        session: CK_SESSION_HANDLE,
        object: CK_OBJECT_HANDLE,
        template: &[RawAttribute],
    ) -> Result<Vec<RawAttribute>>;
    fn set_attribute_value(
        &self,
        session: CK_SESSION_HANDLE,
        object: CK_OBJECT_HANDLE,
        template: &[RawAttribute],
    ) -> Result<()>;
    fn find_objects(
        &self,
        session: CK_SESSION_HANDLE,
        template: &[RawAttribute],
    ) -> Result<Vec<CK_OBJECT_HANDLE>>;

    fn encrypt(
        &self,
        session: CK_SESSION_HANDLE,
        mechanism: &RawMechanism,
        key: CK_OBJECT_HANDLE,
        data: &[u8],
    ) -> Result<Vec<u8>>;
    fn decrypt(
        &self,
        session: CK_SESSION_HANDLE,
        mechanism: &RawMechanism,
        key: CK_OBJECT_HANDLE,
        data: &[u8],
    ) -> Result<Vec<u8>>;
    fn sign(
        &self,
        session: CK_SESSION_HANDLE,
        mechanism: &RawMechanism,
        key: CK_OBJECT_HANDLE,
        data: &[u8],
    ) -> Result<Vec<u8>>;
    fn verify(
        &self,
        session: CK_SESSION_HANDLE,
        mechanism: &RawMechanism,
        key: CK_OBJECT_HANDLE,
        data: &[u8],
        signature: &[u8],
    ) -> Result<()>;

    fn generate_key(
        &self,
        session: CK_SESSION_HANDLE,
        mechanism: &RawMechanism,
        template: &[RawAttribute],
    ) -> Result<CK_OBJECT_HANDLE>;
    fn generate_key_pair(
        &self,
        session: CK_SESSION_HANDLE,
        mechanism: &RawMechanism,
        public_template: &[RawAttribute],
        private_template: &[RawAttribute],
    ) -> Result<(CK_OBJECT_HANDLE, CK_OBJECT_HANDLE)>;
    fn derive_key(
        &self,
        session: CK_SESSION_HANDLE,
        mechanism: &RawMechanism,
        base_key: CK_OBJECT_HANDLE,
        template: &[RawAttribute],
    ) -> Result<CK_OBJECT_HANDLE>;
}

#[cfg(test)]
mod tests {
    use pkcs11_sys::{CKA_LABEL, CKR_DEVICE_ERROR};

    use super::*;

    #[test]
    fn raw_attribute_sentinels() {
        assert!(RawAttribute::unavailable(CKA_LABEL).is_unavailable());
        assert!(RawAttribute::sensitive(CKA_LABEL).is_sensitive());
        assert!(RawAttribute::request(CKA_LABEL).is_request());
        let empty = RawAttribute::with_value(CKA_LABEL, vec![]).unwrap();
        assert!(!empty.is_request());
        assert_eq!(empty.value_len, 0);
    }

    #[test]
    fn transport_error_display() {
        assert_eq!(TransportError::new(CKR_DEVICE_ERROR).to_string(), "token returned 0x30");
        assert_eq!(
            TransportError::with_info(CKR_DEVICE_ERROR, "reader unplugged").to_string(),
            "token returned 0x30 (reader unplugged)"
        );
    }
}
