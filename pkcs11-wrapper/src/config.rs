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

use std::{fmt, str::FromStr, sync::Arc};

use pkcs11_sys::CK_RV;
use pkcs11_wrapper_core::Error;
use pkcs11_wrapper_traits::{TransportError, VendorCodeConverter};
use strum_macros::{Display, EnumIter, EnumString};
use tracing::warn;

pub const NOTIFY_ERROR_SHAPE_ENV: &str = "PKCS11_WRAPPER_NOTIFY_ERROR_SHAPE";

/// How an error raised by a notify handler is reported back to the transport.
#[derive(Debug, Display, EnumString, EnumIter, Clone, Copy, PartialEq, Eq, Default)]
#[strum(serialize_all = "kebab-case")]
pub enum NotifyErrorShape {
    /// The transport cannot take errors from the notify path. The error is
    /// logged and dropped.
    Unsupported,
    /// The return value only.
    Code,
    /// The return value plus the handler's message.
    #[default]
    CodeWithInfo,
}

impl NotifyErrorShape {
    /// The error handed back to the transport, if this shape can carry one.
    pub(crate) fn build(&self, error: &Error) -> Option<TransportError> {
        let rv = CK_RV::from(error);
        match self {
            NotifyErrorShape::Unsupported => None,
            NotifyErrorShape::Code => Some(TransportError::new(rv)),
            NotifyErrorShape::CodeWithInfo => {
                Some(TransportError::with_info(rv, error.to_string()))
            }
        }
    }
}

#[derive(Clone, Default)]
pub struct ModuleConfig {
    pub notify_error_shape: NotifyErrorShape,
    /// Generic to vendor code translation. `None` passes vendor codes through.
    pub vendor_codes: Option<Arc<dyn VendorCodeConverter>>,
}

impl ModuleConfig {
    /// Defaults, overridden by `PKCS11_WRAPPER_NOTIFY_ERROR_SHAPE`.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = ModuleConfig::default();
        if let Some(value) = lookup(NOTIFY_ERROR_SHAPE_ENV) {
            match NotifyErrorShape::from_str(value.trim()) {
                Ok(shape) => config.notify_error_shape = shape,
                Err(_) => warn!(
                    "ignoring {NOTIFY_ERROR_SHAPE_ENV}={value:?}, using {}",
                    config.notify_error_shape
                ),
            }
        }
        config
    }

    pub fn with_notify_error_shape(mut self, shape: NotifyErrorShape) -> Self {
        self.notify_error_shape = shape;
        self
    }

    pub fn with_vendor_codes(mut self, converter: Arc<dyn VendorCodeConverter>) -> Self {
        self.vendor_codes = Some(converter);
        self
    }

    pub(crate) fn converter(&self) -> Option<&dyn VendorCodeConverter> {
        self.vendor_codes.as_deref()
    }
}

impl fmt::Debug for ModuleConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModuleConfig")
            .field("notify_error_shape", &self.notify_error_shape)
            .field("vendor_codes", &self.vendor_codes.is_some())
            .finish()
    }
}
