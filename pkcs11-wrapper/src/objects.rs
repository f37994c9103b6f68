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

use pkcs11_sys::CK_OBJECT_HANDLE;
use pkcs11_wrapper_core::{Result, object::Object, registry, template::Attributes};
use tracing::debug;

use crate::sessions::Session;

/// Reads an object in two round trips: the discriminants first, then every
/// attribute of the kind they select.
pub(crate) fn instantiate(session: &Session, handle: CK_OBJECT_HANDLE) -> Result<Object> {
    let mut discriminants = Attributes::with_types(registry::DISCRIMINANTS);
    let response = session.get_attribute_values(handle, &discriminants)?;
    discriminants.absorb(&response)?;

    let kind = registry::resolve_attributes(&discriminants);
    debug!(handle, %kind, "instantiating object");

    let mut object = Object::new(kind).with_handle(handle);
    session.read_attributes(&mut object)?;
    Ok(object)
}
