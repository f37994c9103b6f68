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

//! In-memory transport for unit tests. Objects are stored as raw attribute
//! vectors; the "cryptography" is an XOR with the key value.

use std::{
    collections::HashMap,
    sync::{
        Mutex,
        atomic::{AtomicUsize, Ordering},
    },
};

use pkcs11_sys::*;
use pkcs11_wrapper_traits::{
    NotifyCallback,
    RawAttribute,
    RawMechanism,
    Result,
    Transport,
    TransportError,
};

use crate::utils::right_pad_string_to_array;

pub const SLOT: CK_SLOT_ID = 0;
pub const AES_BLOCK: usize = 16;
pub const MECHANISMS: [CK_MECHANISM_TYPE; 4] =
    [CKM_AES_KEY_GEN, CKM_AES_CBC_PAD, CKM_SHA256_HMAC, CKM_VENDOR_DEFINED | 0x4410];

#[derive(Default)]
struct State {
    next_handle: CK_ULONG,
    label: Option<[u8; 32]>,
    sessions: HashMap<CK_SESSION_HANDLE, Option<NotifyCallback>>,
    objects: HashMap<CK_OBJECT_HANDLE, Vec<RawAttribute>>,
    logged_in: bool,
}

impl State {
    fn allocate(&mut self) -> CK_ULONG {
        self.next_handle += 1;
        self.next_handle
    }

    fn session(&self, session: CK_SESSION_HANDLE) -> Result<()> {
        if self.sessions.contains_key(&session) {
            Ok(())
        } else {
            Err(CKR_SESSION_HANDLE_INVALID.into())
        }
    }

    fn object(&self, object: CK_OBJECT_HANDLE) -> Result<&Vec<RawAttribute>> {
        self.objects.get(&object).ok_or_else(|| CKR_OBJECT_HANDLE_INVALID.into())
    }

    fn key_value(&self, key: CK_OBJECT_HANDLE) -> Result<Vec<u8>> {
        let key = self.objects.get(&key).ok_or(TransportError::new(CKR_KEY_HANDLE_INVALID))?;
        find(key, CKA_VALUE)
            .and_then(|raw| raw.value.clone())
            .filter(|value| !value.is_empty())
            .ok_or_else(|| TransportError::with_info(CKR_KEY_HANDLE_INVALID, "key has no value"))
    }

    fn store(&mut self, template: &[RawAttribute], extra: &[RawAttribute]) -> CK_OBJECT_HANDLE {
        let mut attributes: Vec<RawAttribute> =
            template.iter().filter(|raw| raw.value.is_some()).cloned().collect();
        for raw in extra {
            upsert(&mut attributes, raw.clone());
        }
        let handle = self.allocate();
        self.objects.insert(handle, attributes);
        handle
    }
}

fn find(attributes: &[RawAttribute], type_: CK_ATTRIBUTE_TYPE) -> Option<&RawAttribute> {
    attributes.iter().find(|raw| raw.type_ == type_)
}

fn upsert(attributes: &mut Vec<RawAttribute>, raw: RawAttribute) {
    match attributes.iter_mut().find(|existing| existing.type_ == raw.type_) {
        Some(existing) => *existing = raw,
        None => attributes.push(raw),
    }
}

fn raw(type_: CK_ATTRIBUTE_TYPE, value: &[u8]) -> RawAttribute {
    RawAttribute::with_value(type_, value.to_vec()).unwrap()
}

fn xor(data: &[u8], key: &[u8]) -> Vec<u8> {
    data.iter().zip(key.iter().cycle()).map(|(d, k)| d ^ k).collect()
}

#[derive(Default)]
pub struct FakeTransport {
    state: Mutex<State>,
    calls: AtomicUsize,
    failure: Mutex<Option<CK_RV>>,
    notify_on_open: Mutex<Option<CK_NOTIFICATION>>,
}

impl FakeTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of transport calls made so far.
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Every following call fails with `rv`, until cleared with `None`.
    pub fn fail_with(&self, rv: Option<CK_RV>) {
        *self.failure.lock().unwrap() = rv;
    }

    /// Every following `open_session` fires `event` at the new session's
    /// handler before returning its handle.
    pub fn notify_on_open(&self, event: Option<CK_NOTIFICATION>) {
        *self.notify_on_open.lock().unwrap() = event;
    }

    /// Delivers a notification the way a token library would: on the calling
    /// thread, with no lock held.
    pub fn notify(
        &self,
        session: CK_SESSION_HANDLE,
        event: CK_NOTIFICATION,
    ) -> Option<Result<()>> {
        let callback = self.state.lock().unwrap().sessions.get(&session)?.clone()?;
        Some(callback(session, event))
    }

    pub fn open_sessions(&self) -> usize {
        self.state.lock().unwrap().sessions.len()
    }

    fn enter(&self) -> Result<std::sync::MutexGuard<'_, State>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(rv) = *self.failure.lock().unwrap() {
            return Err(rv.into());
        }
        Ok(self.state.lock().unwrap())
    }

    fn check_slot(slot: CK_SLOT_ID) -> Result<()> {
        if slot == SLOT { Ok(()) } else { Err(CKR_SLOT_ID_INVALID.into()) }
    }
}

impl Transport for FakeTransport {
    fn name(&self) -> String {
        "fake transport".to_string()
    }

    fn get_slot_list(&self, _token_present: bool) -> Result<Vec<CK_SLOT_ID>> {
        let _state = self.enter()?;
        Ok(vec![SLOT])
    }

    fn get_token_info(&self, slot: CK_SLOT_ID) -> Result<CK_TOKEN_INFO> {
        let state = self.enter()?;
        Self::check_slot(slot)?;
        Ok(CK_TOKEN_INFO {
            label: state.label.unwrap_or(right_pad_string_to_array("fake token")),
            manufacturerID: right_pad_string_to_array("pkcs11-wrapper"),
            model: right_pad_string_to_array("fake"),
            serialNumber: *b"0000000000000001",
            flags: CKF_RNG | CKF_LOGIN_REQUIRED | CKF_TOKEN_INITIALIZED,
            ulSessionCount: state.sessions.len() as CK_ULONG,
            hardwareVersion: CK_VERSION { major: 2, minor: 40 },
            ..Default::default()
        })
    }

    fn get_mechanism_list(&self, slot: CK_SLOT_ID) -> Result<Vec<CK_MECHANISM_TYPE>> {
        let _state = self.enter()?;
        Self::check_slot(slot)?;
        Ok(MECHANISMS.to_vec())
    }

    fn get_mechanism_info(
        &self,
        slot: CK_SLOT_ID,
        mechanism: CK_MECHANISM_TYPE,
    ) -> Result<CK_MECHANISM_INFO> {
        let _state = self.enter()?;
        Self::check_slot(slot)?;
        match mechanism {
            CKM_AES_KEY_GEN => {
                Ok(CK_MECHANISM_INFO { ulMinKeySize: 16, ulMaxKeySize: 32, flags: CKF_GENERATE })
            }
            CKM_AES_CBC_PAD => Ok(CK_MECHANISM_INFO {
                ulMinKeySize: 16,
                ulMaxKeySize: 32,
                flags: CKF_HW | CKF_ENCRYPT | CKF_DECRYPT,
            }),
            _ if MECHANISMS.contains(&mechanism) => Ok(CK_MECHANISM_INFO::default()),
            _ => Err(CKR_MECHANISM_INVALID.into()),
        }
    }

    fn init_token(&self, slot: CK_SLOT_ID, _so_pin: &[u8], label: &[u8; 32]) -> Result<()> {
        let mut state = self.enter()?;
        Self::check_slot(slot)?;
        state.label = Some(*label);
        Ok(())
    }

    fn open_session(
        &self,
        slot: CK_SLOT_ID,
        flags: CK_FLAGS,
        notify: Option<NotifyCallback>,
    ) -> Result<CK_SESSION_HANDLE> {
        let mut state = self.enter()?;
        Self::check_slot(slot)?;
        if flags & CKF_SERIAL_SESSION == 0 {
            return Err(TransportError::new(CKR_ARGUMENTS_BAD));
        }
        let handle = state.allocate();
        state.sessions.insert(handle, notify.clone());
        drop(state);
        let event = *self.notify_on_open.lock().unwrap();
        if let (Some(event), Some(callback)) = (event, notify) {
            _ = callback(handle, event);
        }
        Ok(handle)
    }

    fn close_session(&self, session: CK_SESSION_HANDLE) -> Result<()> {
        let mut state = self.enter()?;
        state.sessions.remove(&session).map(|_| ()).ok_or(CKR_SESSION_HANDLE_INVALID.into())
    }

    fn login(
        &self,
        session: CK_SESSION_HANDLE,
        _user_type: CK_USER_TYPE,
        pin: &[u8],
    ) -> Result<()> {
        let mut state = self.enter()?;
        state.session(session)?;
        if state.logged_in {
            return Err(CKR_USER_ALREADY_LOGGED_IN.into());
        }
        if pin != b"1234" {
            return Err(CKR_PIN_INCORRECT.into());
        }
        state.logged_in = true;
        Ok(())
    }

    fn logout(&self, session: CK_SESSION_HANDLE) -> Result<()> {
        let mut state = self.enter()?;
        state.session(session)?;
        if !std::mem::take(&mut state.logged_in) {
            return Err(CKR_USER_NOT_LOGGED_IN.into());
        }
        Ok(())
    }

    fn create_object(
        &self,
        session: CK_SESSION_HANDLE,
        template: &[RawAttribute],
    ) -> Result<CK_OBJECT_HANDLE> {
        let mut state = self.enter()?;
        state.session(session)?;
        if find(template, CKA_CLASS).is_none() {
            return Err(CKR_TEMPLATE_INCOMPLETE.into());
        }
        Ok(state.store(template, &[]))
    }

    fn destroy_object(&self, session: CK_SESSION_HANDLE, object: CK_OBJECT_HANDLE) -> Result<()> {
        let mut state = self.enter()?;
        state.session(session)?;
        state.objects.remove(&object).map(|_| ()).ok_or(CKR_OBJECT_HANDLE_INVALID.into())
    }

    fn get_attribute_value(
        &self,
        session: CK_SESSION_HANDLE,
        object: CK_OBJECT_HANDLE,
        template: &[RawAttribute],
    ) -> Result<Vec<RawAttribute>> {
        let state = self.enter()?;
        state.session(session)?;
        let attributes = state.object(object)?;
        let sensitive = find(attributes, CKA_SENSITIVE)
            .and_then(|raw| raw.value.as_deref())
            .is_some_and(|value| value == [CK_TRUE]);
        Ok(template
            .iter()
            .map(|request| match find(attributes, request.type_) {
                Some(_) if sensitive && request.type_ == CKA_VALUE => {
                    RawAttribute::sensitive(request.type_)
                }
                Some(stored) => stored.clone(),
                None => RawAttribute::unavailable(request.type_),
            })
            .collect())
    }

    fn set_attribute_value(
        &self,
        session: CK_SESSION_HANDLE,
        object: CK_OBJECT_HANDLE,
        template: &[RawAttribute],
    ) -> Result<()> {
        let mut state = self.enter()?;
        state.session(session)?;
        let attributes =
            state.objects.get_mut(&object).ok_or(TransportError::new(CKR_OBJECT_HANDLE_INVALID))?;
        for raw in template {
            if raw.type_ == CKA_CLASS {
                return Err(CKR_ATTRIBUTE_READ_ONLY.into());
            }
            upsert(attributes, raw.clone());
        }
        Ok(())
    }

    fn find_objects(
        &self,
        session: CK_SESSION_HANDLE,
        template: &[RawAttribute],
    ) -> Result<Vec<CK_OBJECT_HANDLE>> {
        let state = self.enter()?;
        state.session(session)?;
        let mut handles: Vec<CK_OBJECT_HANDLE> = state
            .objects
            .iter()
            .filter(|(_, attributes)| {
                template.iter().all(|wanted| find(attributes, wanted.type_) == Some(wanted))
            })
            .map(|(handle, _)| *handle)
            .collect();
        handles.sort_unstable();
        Ok(handles)
    }

    fn encrypt(
        &self,
        session: CK_SESSION_HANDLE,
        mechanism: &RawMechanism,
        key: CK_OBJECT_HANDLE,
        data: &[u8],
    ) -> Result<Vec<u8>> {
        let state = self.enter()?;
        state.session(session)?;
        if mechanism.mechanism == CKM_AES_CBC_PAD && mechanism.parameter.len() != AES_BLOCK {
            return Err(CKR_MECHANISM_PARAM_INVALID.into());
        }
        Ok(xor(data, &state.key_value(key)?))
    }

    fn decrypt(
        &self,
        session: CK_SESSION_HANDLE,
        mechanism: &RawMechanism,
        key: CK_OBJECT_HANDLE,
        data: &[u8],
    ) -> Result<Vec<u8>> {
        self.encrypt(session, mechanism, key, data)
    }

    fn sign(
        &self,
        session: CK_SESSION_HANDLE,
        _mechanism: &RawMechanism,
        key: CK_OBJECT_HANDLE,
        data: &[u8],
    ) -> Result<Vec<u8>> {
        let state = self.enter()?;
        state.session(session)?;
        let digest = xor(data, &state.key_value(key)?);
        Ok(digest.chunks(4).map(|chunk| chunk.iter().fold(0, |a, b| a ^ b)).collect())
    }

    fn verify(
        &self,
        session: CK_SESSION_HANDLE,
        mechanism: &RawMechanism,
        key: CK_OBJECT_HANDLE,
        data: &[u8],
        signature: &[u8],
    ) -> Result<()> {
        if self.sign(session, mechanism, key, data)? == signature {
            Ok(())
        } else {
            Err(CKR_SIGNATURE_INVALID.into())
        }
    }

    fn generate_key(
        &self,
        session: CK_SESSION_HANDLE,
        mechanism: &RawMechanism,
        template: &[RawAttribute],
    ) -> Result<CK_OBJECT_HANDLE> {
        let mut state = self.enter()?;
        state.session(session)?;
        if mechanism.mechanism != CKM_AES_KEY_GEN {
            return Err(CKR_MECHANISM_INVALID.into());
        }
        let extra = [
            raw(CKA_CLASS, &CKO_SECRET_KEY.to_ne_bytes()),
            raw(CKA_KEY_TYPE, &CKK_AES.to_ne_bytes()),
            raw(CKA_VALUE, &[0x5a; AES_BLOCK]),
            raw(CKA_LOCAL, &[CK_TRUE]),
        ];
        Ok(state.store(template, &extra))
    }

    fn generate_key_pair(
        &self,
        session: CK_SESSION_HANDLE,
        mechanism: &RawMechanism,
        public_template: &[RawAttribute],
        private_template: &[RawAttribute],
    ) -> Result<(CK_OBJECT_HANDLE, CK_OBJECT_HANDLE)> {
        let mut state = self.enter()?;
        state.session(session)?;
        if mechanism.mechanism != CKM_EC_KEY_PAIR_GEN {
            return Err(CKR_MECHANISM_INVALID.into());
        }
        let key_type = raw(CKA_KEY_TYPE, &CKK_EC.to_ne_bytes());
        let public = state.store(public_template, &[
            raw(CKA_CLASS, &CKO_PUBLIC_KEY.to_ne_bytes()),
            key_type.clone(),
            raw(CKA_EC_POINT, b"\x04\x41point"),
        ]);
        let private = state.store(private_template, &[
            raw(CKA_CLASS, &CKO_PRIVATE_KEY.to_ne_bytes()),
            key_type,
            raw(CKA_VALUE, b"scalar"),
        ]);
        Ok((public, private))
    }

    fn derive_key(
        &self,
        session: CK_SESSION_HANDLE,
        mechanism: &RawMechanism,
        base_key: CK_OBJECT_HANDLE,
        template: &[RawAttribute],
    ) -> Result<CK_OBJECT_HANDLE> {
        let mut state = self.enter()?;
        state.session(session)?;
        let base = state.key_value(base_key)?;
        let value = xor(&base, &mechanism.parameter);
        Ok(state.store(template, &[raw(CKA_VALUE, &value)]))
    }
}
