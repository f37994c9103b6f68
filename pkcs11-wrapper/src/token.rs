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

use std::{
    fmt,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
};

use pkcs11_sys::*;
use pkcs11_wrapper_core::{
    Error,
    Result,
    mechanism::{Mechanism, MechanismInfo},
    vendor::{mechanism_to_generic, mechanism_to_vendor},
};
use pkcs11_wrapper_traits::{self as traits, Transport};
use tracing::{error, instrument, warn};

use crate::{
    config::ModuleConfig,
    notify::{ApplicationData, Notify},
    sessions::{Session, SessionMode},
    utils::{right_pad_string_to_array, trim_padded},
};

struct TokenState {
    slot: CK_SLOT_ID,
    transport: Arc<dyn Transport>,
    config: Arc<ModuleConfig>,
    removed: AtomicBool,
}

/// The token in one slot. Clones share state: once any call reports the
/// token removed, every session on it fails with [`Error::DeviceRemoved`]
/// without reaching the transport.
#[derive(Clone)]
pub struct Token(Arc<TokenState>);

impl Token {
    pub(crate) fn new(
        slot: CK_SLOT_ID,
        transport: Arc<dyn Transport>,
        config: Arc<ModuleConfig>,
    ) -> Self {
        Token(Arc::new(TokenState { slot, transport, config, removed: AtomicBool::new(false) }))
    }

    pub fn slot(&self) -> CK_SLOT_ID {
        self.0.slot
    }

    pub fn is_removed(&self) -> bool {
        self.0.removed.load(Ordering::SeqCst)
    }

    pub(crate) fn config(&self) -> &ModuleConfig {
        &self.0.config
    }

    /// Runs a transport call unless the token is gone, and classifies its
    /// failure.
    pub(crate) fn call<T>(
        &self,
        f: impl FnOnce(&dyn Transport) -> traits::Result<T>,
    ) -> Result<T> {
        if self.is_removed() {
            return Err(Error::DeviceRemoved);
        }
        f(self.0.transport.as_ref()).map_err(|e| match Error::from_transport(e) {
            Error::DeviceRemoved => {
                if !self.0.removed.swap(true, Ordering::SeqCst) {
                    warn!(slot = self.0.slot, "token removed");
                }
                Error::DeviceRemoved
            }
            e => {
                error!(slot = self.0.slot, %e);
                e
            }
        })
    }

    #[instrument(skip(self), fields(slot = self.slot()))]
    pub fn info(&self) -> Result<TokenInfo> {
        let slot = self.slot();
        self.call(|transport| transport.get_token_info(slot)).map(TokenInfo::from)
    }

    /// Mechanisms the token supports, vendor codes translated to generic ones.
    #[instrument(skip(self), fields(slot = self.slot()))]
    pub fn mechanisms(&self) -> Result<Vec<Mechanism>> {
        let slot = self.slot();
        let codes = self.call(|transport| transport.get_mechanism_list(slot))?;
        let converter = self.config().converter();
        Ok(codes
            .into_iter()
            .map(|code| Mechanism::new(mechanism_to_generic(code, converter)))
            .collect())
    }

    #[instrument(skip(self), fields(slot = self.slot(), %mechanism))]
    pub fn mechanism_info(&self, mechanism: &Mechanism) -> Result<MechanismInfo> {
        let slot = self.slot();
        let code = mechanism_to_vendor(mechanism.code(), self.config().converter());
        self.call(|transport| transport.get_mechanism_info(slot, code)).map(MechanismInfo::from)
    }

    /// Initializes the token. The label is space padded (or cut) to 32 bytes.
    #[instrument(skip(self, so_pin), fields(slot = self.slot()))]
    pub fn init_token(&self, so_pin: &[u8], label: &str) -> Result<()> {
        let slot = self.slot();
        let label = right_pad_string_to_array::<32>(label);
        self.call(|transport| transport.init_token(slot, so_pin, &label))
    }

    #[instrument(skip(self, application, notify), fields(slot = self.slot()))]
    pub fn open_session(
        &self,
        mode: SessionMode,
        application: Option<ApplicationData>,
        notify: Option<Arc<dyn Notify>>,
    ) -> Result<Session> {
        Session::open(self.clone(), mode, application, notify)
    }
}

impl PartialEq for Token {
    fn eq(&self, other: &Self) -> bool {
        self.slot() == other.slot()
    }
}

impl Eq for Token {}

impl fmt::Debug for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Token")
            .field("slot", &self.0.slot)
            .field("transport", &self.0.transport.name())
            .field("removed", &self.is_removed())
            .finish()
    }
}

/// `CK_TOKEN_INFO` with its blank padded strings trimmed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenInfo {
    pub label: String,
    pub manufacturer_id: String,
    pub model: String,
    pub serial_number: String,
    pub flags: CK_FLAGS,
    pub max_session_count: CK_ULONG,
    pub session_count: CK_ULONG,
    pub max_rw_session_count: CK_ULONG,
    pub rw_session_count: CK_ULONG,
    pub max_pin_len: CK_ULONG,
    pub min_pin_len: CK_ULONG,
    pub total_public_memory: CK_ULONG,
    pub free_public_memory: CK_ULONG,
    pub total_private_memory: CK_ULONG,
    pub free_private_memory: CK_ULONG,
    pub hardware_version: (u8, u8),
    pub firmware_version: (u8, u8),
    pub utc_time: String,
}

impl TokenInfo {
    pub fn is_initialized(&self) -> bool {
        self.flags & CKF_TOKEN_INITIALIZED != 0
    }

    pub fn login_required(&self) -> bool {
        self.flags & CKF_LOGIN_REQUIRED != 0
    }
}

impl From<CK_TOKEN_INFO> for TokenInfo {
    fn from(info: CK_TOKEN_INFO) -> Self {
        TokenInfo {
            label: trim_padded(&info.label),
            manufacturer_id: trim_padded(&info.manufacturerID),
            model: trim_padded(&info.model),
            serial_number: trim_padded(&info.serialNumber),
            flags: info.flags,
            max_session_count: info.ulMaxSessionCount,
            session_count: info.ulSessionCount,
            max_rw_session_count: info.ulMaxRwSessionCount,
            rw_session_count: info.ulRwSessionCount,
            max_pin_len: info.ulMaxPinLen,
            min_pin_len: info.ulMinPinLen,
            total_public_memory: info.ulTotalPublicMemory,
            free_public_memory: info.ulFreePublicMemory,
            total_private_memory: info.ulTotalPrivateMemory,
            free_private_memory: info.ulFreePrivateMemory,
            hardware_version: (info.hardwareVersion.major, info.hardwareVersion.minor),
            firmware_version: (info.firmwareVersion.major, info.firmwareVersion.minor),
            utc_time: trim_padded(&info.utcTime),
        }
    }
}
