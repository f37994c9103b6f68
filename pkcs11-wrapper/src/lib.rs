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

#![deny(unsafe_op_in_unsafe_fn)]

pub use pkcs11_wrapper_core::{
    Error,
    Result,
    attribute,
    mechanism,
    object,
    parameters,
    registry,
    template,
    vendor,
};
pub use pkcs11_wrapper_traits::{self as traits, Transport, VendorCodeConverter};
use tracing::metadata::LevelFilter;
use tracing_error::ErrorLayer;
use tracing_subscriber::{EnvFilter, Registry, fmt::format::FmtSpan, prelude::*};
mod config;
mod notify;
mod objects;
mod sessions;
mod token;
mod utils;

#[cfg(test)]
mod fake_transport;

use std::{
    collections::HashMap,
    fmt,
    sync::{Arc, Mutex, Once, PoisonError},
};

use pkcs11_sys::CK_SLOT_ID;

pub use crate::{
    config::{ModuleConfig, NOTIFY_ERROR_SHAPE_ENV, NotifyErrorShape},
    notify::{ApplicationData, Notify},
    sessions::{Session, SessionMode, UserType},
    token::{Token, TokenInfo},
};

pub const LOG_STDERR_ENV: &str = "PKCS11_WRAPPER_LOG_STDERR";

static TRACING_INIT: Once = Once::new();

/// Installs the process-wide subscriber: journald when reachable, stderr
/// otherwise or when `PKCS11_WRAPPER_LOG_STDERR` is set. The level defaults to
/// WARN and follows `RUST_LOG`. A subscriber installed by the application
/// takes precedence.
pub fn init_tracing() {
    TRACING_INIT.call_once(|| {
        let env_filter =
            EnvFilter::builder().with_default_directive(LevelFilter::WARN.into()).from_env_lossy();
        let force_stderr = std::env::var(LOG_STDERR_ENV).is_ok();
        if !force_stderr {
            if let Ok(journald_layer) = tracing_journald::layer() {
                _ = Registry::default()
                    .with(journald_layer.with_syslog_identifier("pkcs11-wrapper".into()))
                    .with(env_filter)
                    .with(ErrorLayer::default())
                    .try_init();
                return;
            }
        }
        _ = Registry::default()
            .with(
                tracing_subscriber::fmt::layer()
                    .with_writer(std::io::stderr)
                    .with_span_events(FmtSpan::ENTER),
            )
            .with(env_filter)
            .with(ErrorLayer::default())
            .try_init();
    });
}

/// Entry point: a transport plus the per-slot token state handed out for it.
pub struct Module {
    transport: Arc<dyn Transport>,
    config: Arc<ModuleConfig>,
    tokens: Mutex<HashMap<CK_SLOT_ID, Token>>,
}

impl Module {
    /// A module configured from the environment, see [`ModuleConfig::from_env`].
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self::with_config(transport, ModuleConfig::from_env())
    }

    pub fn with_config(transport: Arc<dyn Transport>, config: ModuleConfig) -> Self {
        init_tracing();
        Module { transport, config: Arc::new(config), tokens: Mutex::new(HashMap::new()) }
    }

    pub fn config(&self) -> &ModuleConfig {
        &self.config
    }

    #[tracing::instrument(skip(self))]
    pub fn slots(&self, token_present: bool) -> Result<Vec<CK_SLOT_ID>> {
        self.transport.get_slot_list(token_present).map_err(Error::from_transport)
    }

    /// The token in `slot`. Every caller gets the same shared state until the
    /// token is reported removed; after that a fresh token is handed out while
    /// sessions opened earlier stay invalid.
    pub fn token(&self, slot: CK_SLOT_ID) -> Token {
        let mut tokens = self.tokens.lock().unwrap_or_else(PoisonError::into_inner);
        match tokens.get(&slot) {
            Some(token) if !token.is_removed() => token.clone(),
            _ => {
                let token = Token::new(slot, self.transport.clone(), self.config.clone());
                tokens.insert(slot, token.clone());
                token
            }
        }
    }
}

impl fmt::Debug for Module {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Module")
            .field("transport", &self.transport.name())
            .field("config", &self.config)
            .finish()
    }
}
