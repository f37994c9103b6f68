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
    any::Any,
    panic::{self, AssertUnwindSafe},
    sync::{Arc, Weak},
};

use pkcs11_sys::{CK_NOTIFICATION, CK_SESSION_HANDLE, CKN_SURRENDER};
use pkcs11_wrapper_core::{Error, Result};
use pkcs11_wrapper_traits::NotifyCallback;
use tracing::{debug, warn};

use crate::{
    config::NotifyErrorShape,
    sessions::{Session, SessionInner},
};

/// Opaque value handed back to the notify handler of a session.
pub type ApplicationData = Arc<dyn Any + Send + Sync>;

/// Receives token notifications for one session.
///
/// Called on whatever thread the transport delivers the notification on,
/// possibly before `open_session` has returned.
pub trait Notify: Send + Sync {
    fn notify(
        &self,
        session: &Session,
        surrender: bool,
        application: Option<&ApplicationData>,
    ) -> Result<()>;
}

impl<F> Notify for F
where
    F: Fn(&Session, bool, Option<&ApplicationData>) -> Result<()> + Send + Sync,
{
    fn notify(
        &self,
        session: &Session,
        surrender: bool,
        application: Option<&ApplicationData>,
    ) -> Result<()> {
        self(session, surrender, application)
    }
}

/// Wraps a session's handler into the callback the transport invokes.
///
/// Handler errors and panics never reach the transport as unwinds: they are
/// stored on the session (see [`Session::take_callback_error`]) and reported
/// in the configured shape.
pub(crate) fn bridge(session: Weak<SessionInner>, shape: NotifyErrorShape) -> NotifyCallback {
    Arc::new(move |handle: CK_SESSION_HANDLE, event: CK_NOTIFICATION| {
        let Some(inner) = session.upgrade() else {
            debug!(handle, event, "notification for a dropped session");
            return Ok(());
        };
        inner.handle.get_or_init(|| handle);
        let Some(handler) = inner.notify.clone() else {
            return Ok(());
        };
        let session = Session(inner);
        let surrender = event == CKN_SURRENDER;

        let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
            handler.notify(&session, surrender, session.application())
        }));
        let error = match outcome {
            Ok(Ok(())) => return Ok(()),
            Ok(Err(e)) => e,
            Err(payload) => Error::NotifyHandler(panic_message(payload.as_ref())),
        };
        warn!(handle, %error, "notify handler failed");

        let reply = shape.build(&error);
        session.0.set_callback_error(error);
        match reply {
            Some(reply) => Err(reply),
            None => {
                warn!(handle, "notify error cannot be reported to the transport, dropping it");
                Ok(())
            }
        }
    })
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "notify handler panicked".to_string()
    }
}
