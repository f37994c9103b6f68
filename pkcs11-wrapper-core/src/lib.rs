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

use attribute::AttributeType;
use pkcs11_sys::*;
use pkcs11_wrapper_traits::TransportError;
use thiserror::Error;

pub mod attribute;
pub mod mechanism;
pub mod object;
pub mod parameters;
pub mod registry;
pub mod template;
pub mod vendor;

#[cfg(test)]
mod tests;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    // Token errors.
    #[error("token call failed: {0}")]
    TokenCommunication(TransportError),

    #[error("token has been removed")]
    DeviceRemoved,

    // Local validation errors, raised before any token call.
    #[error("malformed value for attribute {type_}: {reason}")]
    MalformedAttribute { type_: AttributeType, reason: String },

    #[error("invalid parameter: {0}")]
    InvalidParameter(String),

    #[error("session is closed")]
    InvalidSession,

    // Other errors.
    #[error("notify handler failed: {0}")]
    NotifyHandler(String),

    #[error("{0}")]
    TryFromInt(#[from] std::num::TryFromIntError),
}

impl Error {
    /// Classifies a failed transport call.
    pub fn from_transport(e: TransportError) -> Self {
        match e.rv {
            CKR_DEVICE_REMOVED | CKR_TOKEN_NOT_PRESENT => Error::DeviceRemoved,
            _ => Error::TokenCommunication(e),
        }
    }

    pub(crate) fn malformed(type_: AttributeType, reason: impl Into<String>) -> Self {
        Error::MalformedAttribute { type_, reason: reason.into() }
    }
}

impl From<&Error> for CK_RV {
    fn from(e: &Error) -> Self {
        match e {
            Error::TokenCommunication(e) => e.rv,
            Error::DeviceRemoved => CKR_DEVICE_REMOVED,
            Error::MalformedAttribute { .. } => CKR_ATTRIBUTE_VALUE_INVALID,
            Error::InvalidParameter(_) => CKR_ARGUMENTS_BAD,
            Error::InvalidSession => CKR_SESSION_HANDLE_INVALID,

            Error::NotifyHandler(_) | Error::TryFromInt(_) => CKR_GENERAL_ERROR,
        }
    }
}

impl From<Error> for CK_RV {
    fn from(e: Error) -> Self {
        CK_RV::from(&e)
    }
}
