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
        Mutex,
        OnceLock,
        PoisonError,
        atomic::{AtomicBool, Ordering},
    },
};

use pkcs11_sys::*;
use pkcs11_wrapper_core::{
    Error,
    Result,
    mechanism::Mechanism,
    object::Object,
    template::{Attributes, TemplatePurpose},
    vendor::{attributes_to_generic, attributes_to_vendor},
};
use pkcs11_wrapper_traits::{self as traits, RawAttribute, RawMechanism, Transport};
use strum_macros::Display;
use tracing::{debug, instrument};

use crate::{
    notify::{self, ApplicationData, Notify},
    objects,
    token::Token,
};

#[derive(Debug, Display, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionMode {
    ReadOnly,
    ReadWrite,
}

impl SessionMode {
    fn flags(self) -> CK_FLAGS {
        match self {
            SessionMode::ReadOnly => CKF_SERIAL_SESSION,
            SessionMode::ReadWrite => CKF_SERIAL_SESSION | CKF_RW_SESSION,
        }
    }
}

#[derive(Debug, Display, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UserType {
    SecurityOfficer,
    User,
    ContextSpecific,
}

impl From<UserType> for CK_USER_TYPE {
    fn from(user_type: UserType) -> Self {
        match user_type {
            UserType::SecurityOfficer => CKU_SO,
            UserType::User => CKU_USER,
            UserType::ContextSpecific => CKU_CONTEXT_SPECIFIC,
        }
    }
}

pub(crate) struct SessionInner {
    pub(crate) token: Token,
    mode: SessionMode,
    /// Set once the transport has assigned a handle, which may happen inside
    /// a notify callback that arrives before `open_session` returns.
    pub(crate) handle: OnceLock<CK_SESSION_HANDLE>,
    closed: AtomicBool,
    pub(crate) notify: Option<Arc<dyn Notify>>,
    pub(crate) application: Option<ApplicationData>,
    callback_error: Mutex<Option<Error>>,
}

impl SessionInner {
    pub(crate) fn set_callback_error(&self, error: Error) {
        *self.callback_error.lock().unwrap_or_else(PoisonError::into_inner) = Some(error);
    }
}

impl Drop for SessionInner {
    fn drop(&mut self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let Some(&handle) = self.handle.get() else { return };
        if let Err(e) = self.token.call(|transport| transport.close_session(handle)) {
            debug!(handle, %e, "closing dropped session failed");
        }
    }
}

/// An open session on a token.
///
/// Clones refer to the same session; the session is closed by [`close`] or
/// when the last clone is dropped. The token runs one operation per session
/// at a time: callers sharing a session between threads must serialize their
/// calls.
///
/// [`close`]: Session::close
#[derive(Clone)]
pub struct Session(pub(crate) Arc<SessionInner>);

impl Session {
    pub(crate) fn open(
        token: Token,
        mode: SessionMode,
        application: Option<ApplicationData>,
        notify: Option<Arc<dyn Notify>>,
    ) -> Result<Session> {
        let inner = Arc::new(SessionInner {
            token,
            mode,
            handle: OnceLock::new(),
            closed: AtomicBool::new(false),
            notify,
            application,
            callback_error: Mutex::new(None),
        });
        let callback = inner.notify.as_ref().map(|_| {
            notify::bridge(Arc::downgrade(&inner), inner.token.config().notify_error_shape)
        });
        let slot = inner.token.slot();
        let handle =
            inner.token.call(|transport| transport.open_session(slot, mode.flags(), callback))?;
        let handle = *inner.handle.get_or_init(|| handle);
        debug!(slot, handle, %mode, "opened session");
        Ok(Session(inner))
    }

    /// The transport's handle for this session.
    pub fn handle(&self) -> CK_SESSION_HANDLE {
        self.0.handle.get().copied().unwrap_or(CK_INVALID_HANDLE)
    }

    pub fn token(&self) -> &Token {
        &self.0.token
    }

    pub fn mode(&self) -> SessionMode {
        self.0.mode
    }

    pub fn is_open(&self) -> bool {
        !self.0.closed.load(Ordering::SeqCst)
    }

    pub fn application(&self) -> Option<&ApplicationData> {
        self.0.application.as_ref()
    }

    /// Takes the last error raised by this session's notify handler.
    pub fn take_callback_error(&self) -> Option<Error> {
        self.0.callback_error.lock().unwrap_or_else(PoisonError::into_inner).take()
    }

    fn call<T>(
        &self,
        f: impl FnOnce(&dyn Transport, CK_SESSION_HANDLE) -> traits::Result<T>,
    ) -> Result<T> {
        if !self.is_open() {
            return Err(Error::InvalidSession);
        }
        let handle = self.0.handle.get().copied().ok_or(Error::InvalidSession)?;
        self.0.token.call(|transport| f(transport, handle))
    }

    fn encode(&self, mechanism: &Mechanism) -> RawMechanism {
        mechanism.encode(self.0.token.config().converter())
    }

    fn template(
        &self,
        attributes: &Attributes,
        purpose: TemplatePurpose,
    ) -> Result<Vec<RawAttribute>> {
        let mut template = attributes.build_template(purpose)?;
        attributes_to_vendor(&mut template, self.0.token.config().converter());
        Ok(template)
    }

    /// Closes the session. Closing twice fails with [`Error::InvalidSession`].
    #[instrument(skip(self), fields(session = self.handle()))]
    pub fn close(&self) -> Result<()> {
        if self.0.closed.swap(true, Ordering::SeqCst) {
            return Err(Error::InvalidSession);
        }
        let handle = self.0.handle.get().copied().ok_or(Error::InvalidSession)?;
        self.0.token.call(|transport| transport.close_session(handle))
    }

    /// Logs in. The login state belongs to the token and is shared by every
    /// session on it.
    #[instrument(skip(self, pin), fields(session = self.handle()))]
    pub fn login(&self, user_type: UserType, pin: &[u8]) -> Result<()> {
        self.call(|transport, handle| transport.login(handle, user_type.into(), pin))
    }

    #[instrument(skip(self), fields(session = self.handle()))]
    pub fn logout(&self) -> Result<()> {
        self.call(|transport, handle| transport.logout(handle))
    }

    /// Creates an object from the present attributes of `template` and reads
    /// it back.
    #[instrument(skip_all, fields(session = self.handle(), kind = %template.kind()))]
    pub fn create_object(&self, template: &Object) -> Result<Object> {
        let template = self.template(template.attributes(), TemplatePurpose::Create)?;
        let object = self.call(|transport, handle| transport.create_object(handle, &template))?;
        self.get_object(object)
    }

    /// Reads an object, typing it by its class and subtype.
    #[instrument(skip(self), fields(session = self.handle()))]
    pub fn get_object(&self, object: CK_OBJECT_HANDLE) -> Result<Object> {
        objects::instantiate(self, object)
    }

    /// Refreshes every attribute of a previously read object.
    pub fn read_attributes(&self, object: &mut Object) -> Result<()> {
        let handle = object
            .handle()
            .ok_or_else(|| Error::InvalidParameter("object has no token handle".to_string()))?;
        let response = self.get_attribute_values(handle, object.attributes())?;
        object.absorb(&response)
    }

    /// Requests every attribute of `attributes` and returns the response with
    /// generic attribute codes.
    pub(crate) fn get_attribute_values(
        &self,
        object: CK_OBJECT_HANDLE,
        attributes: &Attributes,
    ) -> Result<Vec<RawAttribute>> {
        let template = self.template(attributes, TemplatePurpose::Read)?;
        let mut response = self.call(|transport, handle| {
            transport.get_attribute_value(handle, object, &template)
        })?;
        attributes_to_generic(&mut response, self.0.token.config().converter());
        Ok(response)
    }

    #[instrument(skip(self, attributes), fields(session = self.handle()))]
    pub fn set_attributes(&self, object: CK_OBJECT_HANDLE, attributes: &Attributes) -> Result<()> {
        let template = self.template(attributes, TemplatePurpose::Create)?;
        self.call(|transport, handle| transport.set_attribute_value(handle, object, &template))
    }

    #[instrument(skip(self), fields(session = self.handle()))]
    pub fn destroy_object(&self, object: CK_OBJECT_HANDLE) -> Result<()> {
        self.call(|transport, handle| transport.destroy_object(handle, object))
    }

    /// Handles of the objects matching the present attributes of `filter`.
    #[instrument(skip_all, fields(session = self.handle()))]
    pub fn find_objects(&self, filter: &Attributes) -> Result<Vec<CK_OBJECT_HANDLE>> {
        let template = self.template(filter, TemplatePurpose::Search)?;
        self.call(|transport, handle| transport.find_objects(handle, &template))
    }

    pub fn find(&self, filter: &Attributes) -> Result<Vec<Object>> {
        self.find_objects(filter)?.into_iter().map(|object| self.get_object(object)).collect()
    }

    #[instrument(skip(self, data), fields(session = self.handle(), %mechanism))]
    pub fn encrypt(
        &self,
        mechanism: &Mechanism,
        key: CK_OBJECT_HANDLE,
        data: &[u8],
    ) -> Result<Vec<u8>> {
        let mechanism = self.encode(mechanism);
        self.call(|transport, handle| transport.encrypt(handle, &mechanism, key, data))
    }

    #[instrument(skip(self, data), fields(session = self.handle(), %mechanism))]
    pub fn decrypt(
        &self,
        mechanism: &Mechanism,
        key: CK_OBJECT_HANDLE,
        data: &[u8],
    ) -> Result<Vec<u8>> {
        let mechanism = self.encode(mechanism);
        self.call(|transport, handle| transport.decrypt(handle, &mechanism, key, data))
    }

    #[instrument(skip(self, data), fields(session = self.handle(), %mechanism))]
    pub fn sign(
        &self,
        mechanism: &Mechanism,
        key: CK_OBJECT_HANDLE,
        data: &[u8],
    ) -> Result<Vec<u8>> {
        let mechanism = self.encode(mechanism);
        self.call(|transport, handle| transport.sign(handle, &mechanism, key, data))
    }

    #[instrument(skip(self, data, signature), fields(session = self.handle(), %mechanism))]
    pub fn verify(
        &self,
        mechanism: &Mechanism,
        key: CK_OBJECT_HANDLE,
        data: &[u8],
        signature: &[u8],
    ) -> Result<()> {
        let mechanism = self.encode(mechanism);
        self.call(|transport, handle| transport.verify(handle, &mechanism, key, data, signature))
    }

    #[instrument(skip(self, template), fields(session = self.handle(), %mechanism))]
    pub fn generate_key(&self, mechanism: &Mechanism, template: &Object) -> Result<Object> {
        let mechanism = self.encode(mechanism);
        let template = self.template(template.attributes(), TemplatePurpose::Create)?;
        let key =
            self.call(|transport, handle| transport.generate_key(handle, &mechanism, &template))?;
        self.get_object(key)
    }

    #[instrument(skip(self, public, private), fields(session = self.handle(), %mechanism))]
    pub fn generate_key_pair(
        &self,
        mechanism: &Mechanism,
        public: &Object,
        private: &Object,
    ) -> Result<(Object, Object)> {
        let mechanism = self.encode(mechanism);
        let public = self.template(public.attributes(), TemplatePurpose::Create)?;
        let private = self.template(private.attributes(), TemplatePurpose::Create)?;
        let (public, private) = self.call(|transport, handle| {
            transport.generate_key_pair(handle, &mechanism, &public, &private)
        })?;
        Ok((self.get_object(public)?, self.get_object(private)?))
    }

    #[instrument(skip(self, template), fields(session = self.handle(), %mechanism))]
    pub fn derive_key(
        &self,
        mechanism: &Mechanism,
        base_key: CK_OBJECT_HANDLE,
        template: &Object,
    ) -> Result<Object> {
        let mechanism = self.encode(mechanism);
        let template = self.template(template.attributes(), TemplatePurpose::Create)?;
        let key = self.call(|transport, handle| {
            transport.derive_key(handle, &mechanism, base_key, &template)
        })?;
        self.get_object(key)
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("slot", &self.0.token.slot())
            .field("handle", &self.0.handle.get())
            .field("mode", &self.0.mode)
            .field("open", &self.is_open())
            .finish()
    }
}

impl PartialEq for Session {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl Eq for Session {}
