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

//! Mechanism parameter payloads and their parameter-block layouts.
//!
//! Every word in a block is a native-endian `CK_ULONG`. Byte buffers passed to
//! a constructor are copied; later changes to the caller's buffer do not reach
//! the parameters.

use pkcs11_sys::*;

use crate::{Error, Result};

const ULONG_SIZE: usize = std::mem::size_of::<CK_ULONG>();

/// OAEP encoding parameter source meaning "no encoding parameter".
pub const CKZ_EMPTY: CK_RSA_PKCS_OAEP_SOURCE_TYPE = 0;

/// A parameter payload with a fixed block layout.
pub trait ParameterBlock: Sized {
    fn to_bytes(&self) -> Vec<u8>;
    fn from_bytes(bytes: &[u8]) -> Result<Self>;
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Parameters {
    /// A single `CK_ULONG`, e.g. the output length of a `*_MAC_GENERAL`.
    Ulong(CK_ULONG),
    /// A block passed through untouched.
    Opaque(Vec<u8>),
    InitializationVector(InitializationVector),
    Ecdh1Derive(Ecdh1DeriveParameters),
    RsaPkcsOaep(RsaPkcsOaepParameters),
    RsaPkcsPss(RsaPkcsPssParameters),
}

impl Parameters {
    pub fn opaque(block: impl Into<Vec<u8>>) -> Self {
        Parameters::Opaque(block.into())
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        match self {
            Parameters::Ulong(value) => value.to_ne_bytes().to_vec(),
            Parameters::Opaque(block) => block.clone(),
            Parameters::InitializationVector(iv) => iv.to_bytes(),
            Parameters::Ecdh1Derive(params) => params.to_bytes(),
            Parameters::RsaPkcsOaep(params) => params.to_bytes(),
            Parameters::RsaPkcsPss(params) => params.to_bytes(),
        }
    }
}

impl From<InitializationVector> for Parameters {
    fn from(value: InitializationVector) -> Self {
        Parameters::InitializationVector(value)
    }
}

impl From<Ecdh1DeriveParameters> for Parameters {
    fn from(value: Ecdh1DeriveParameters) -> Self {
        Parameters::Ecdh1Derive(value)
    }
}

impl From<RsaPkcsOaepParameters> for Parameters {
    fn from(value: RsaPkcsOaepParameters) -> Self {
        Parameters::RsaPkcsOaep(value)
    }
}

impl From<RsaPkcsPssParameters> for Parameters {
    fn from(value: RsaPkcsPssParameters) -> Self {
        Parameters::RsaPkcsPss(value)
    }
}

/// Initialization vector for block cipher modes. The block is the IV itself.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct InitializationVector(Vec<u8>);

impl InitializationVector {
    pub fn new(iv: impl Into<Vec<u8>>) -> Result<Self> {
        let iv = iv.into();
        if iv.is_empty() {
            return Err(Error::InvalidParameter("initialization vector is empty".to_string()));
        }
        Ok(InitializationVector(iv))
    }

    pub fn iv(&self) -> &[u8] {
        &self.0
    }
}

impl ParameterBlock for InitializationVector {
    fn to_bytes(&self) -> Vec<u8> {
        self.0.clone()
    }

    fn from_bytes(bytes: &[u8]) -> Result<Self> {
        InitializationVector::new(bytes)
    }
}

/// `CK_ECDH1_DERIVE_PARAMS`.
///
/// Block: `kdf | shared_len | shared_data | public_len | public_data`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Ecdh1DeriveParameters {
    kdf: CK_EC_KDF_TYPE,
    shared_data: Vec<u8>,
    public_data: Vec<u8>,
}

impl Ecdh1DeriveParameters {
    pub fn new(
        kdf: CK_EC_KDF_TYPE,
        shared_data: impl Into<Vec<u8>>,
        public_data: impl Into<Vec<u8>>,
    ) -> Result<Self> {
        let params = Ecdh1DeriveParameters {
            kdf,
            shared_data: shared_data.into(),
            public_data: public_data.into(),
        };
        params.validate()?;
        Ok(params)
    }

    pub fn kdf(&self) -> CK_EC_KDF_TYPE {
        self.kdf
    }

    pub fn shared_data(&self) -> &[u8] {
        &self.shared_data
    }

    pub fn public_data(&self) -> &[u8] {
        &self.public_data
    }

    pub fn set_shared_data(&mut self, shared_data: impl Into<Vec<u8>>) -> Result<()> {
        let mut updated = self.clone();
        updated.shared_data = shared_data.into();
        updated.validate()?;
        *self = updated;
        Ok(())
    }

    fn validate(&self) -> Result<()> {
        match self.kdf {
            CKD_NULL | CKD_SHA1_KDF | CKD_SHA224_KDF | CKD_SHA256_KDF | CKD_SHA384_KDF
            | CKD_SHA512_KDF => {}
            kdf => {
                return Err(Error::InvalidParameter(format!(
                    "unknown key derivation function {kdf:#x}"
                )));
            }
        }
        // The null KDF has nowhere to put shared data.
        if self.kdf == CKD_NULL && !self.shared_data.is_empty() {
            return Err(Error::InvalidParameter(
                "shared data requires a key derivation function".to_string(),
            ));
        }
        if self.public_data.is_empty() {
            return Err(Error::InvalidParameter("public data is empty".to_string()));
        }
        Ok(())
    }
}

impl ParameterBlock for Ecdh1DeriveParameters {
    fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::new();
        put_ulong(&mut out, self.kdf);
        put_prefixed(&mut out, &self.shared_data);
        put_prefixed(&mut out, &self.public_data);
        out
    }

    fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let mut reader = Reader(bytes);
        let kdf = reader.ulong()?;
        let shared_data = reader.prefixed()?;
        let public_data = reader.prefixed()?;
        reader.finish()?;
        Ecdh1DeriveParameters::new(kdf, shared_data, public_data)
    }
}

/// `CK_RSA_PKCS_OAEP_PARAMS`.
///
/// Block: `hash_alg | mgf | source | source_len | source_data`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RsaPkcsOaepParameters {
    hash_alg: CK_MECHANISM_TYPE,
    mgf: CK_RSA_PKCS_MGF_TYPE,
    source: CK_RSA_PKCS_OAEP_SOURCE_TYPE,
    source_data: Vec<u8>,
}

impl RsaPkcsOaepParameters {
    /// `source` must be [`CKZ_EMPTY`] or [`CKZ_DATA_SPECIFIED`].
    pub fn new(
        hash_alg: CK_MECHANISM_TYPE,
        mgf: CK_RSA_PKCS_MGF_TYPE,
        source: CK_RSA_PKCS_OAEP_SOURCE_TYPE,
        source_data: impl Into<Vec<u8>>,
    ) -> Result<Self> {
        check_mgf(mgf)?;
        check_source(source)?;
        Ok(RsaPkcsOaepParameters { hash_alg, mgf, source, source_data: source_data.into() })
    }

    pub fn hash_alg(&self) -> CK_MECHANISM_TYPE {
        self.hash_alg
    }

    pub fn mgf(&self) -> CK_RSA_PKCS_MGF_TYPE {
        self.mgf
    }

    pub fn source(&self) -> CK_RSA_PKCS_OAEP_SOURCE_TYPE {
        self.source
    }

    pub fn source_data(&self) -> &[u8] {
        &self.source_data
    }

    pub fn set_source(&mut self, source: CK_RSA_PKCS_OAEP_SOURCE_TYPE) -> Result<()> {
        check_source(source)?;
        self.source = source;
        Ok(())
    }

    pub fn set_source_data(&mut self, source_data: impl Into<Vec<u8>>) {
        self.source_data = source_data.into();
    }
}

impl ParameterBlock for RsaPkcsOaepParameters {
    fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::new();
        put_ulong(&mut out, self.hash_alg);
        put_ulong(&mut out, self.mgf);
        put_ulong(&mut out, self.source);
        put_prefixed(&mut out, &self.source_data);
        out
    }

    fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let mut reader = Reader(bytes);
        let hash_alg = reader.ulong()?;
        let mgf = reader.ulong()?;
        let source = reader.ulong()?;
        let source_data = reader.prefixed()?;
        reader.finish()?;
        RsaPkcsOaepParameters::new(hash_alg, mgf, source, source_data)
    }
}

/// `CK_RSA_PKCS_PSS_PARAMS`.
///
/// Block: `hash_alg | mgf | salt_len`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RsaPkcsPssParameters {
    hash_alg: CK_MECHANISM_TYPE,
    mgf: CK_RSA_PKCS_MGF_TYPE,
    salt_len: CK_ULONG,
}

impl RsaPkcsPssParameters {
    pub fn new(
        hash_alg: CK_MECHANISM_TYPE,
        mgf: CK_RSA_PKCS_MGF_TYPE,
        salt_len: CK_ULONG,
    ) -> Result<Self> {
        check_mgf(mgf)?;
        Ok(RsaPkcsPssParameters { hash_alg, mgf, salt_len })
    }

    pub fn hash_alg(&self) -> CK_MECHANISM_TYPE {
        self.hash_alg
    }

    pub fn mgf(&self) -> CK_RSA_PKCS_MGF_TYPE {
        self.mgf
    }

    pub fn salt_len(&self) -> CK_ULONG {
        self.salt_len
    }
}

impl ParameterBlock for RsaPkcsPssParameters {
    fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::new();
        put_ulong(&mut out, self.hash_alg);
        put_ulong(&mut out, self.mgf);
        put_ulong(&mut out, self.salt_len);
        out
    }

    fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let mut reader = Reader(bytes);
        let hash_alg = reader.ulong()?;
        let mgf = reader.ulong()?;
        let salt_len = reader.ulong()?;
        reader.finish()?;
        RsaPkcsPssParameters::new(hash_alg, mgf, salt_len)
    }
}

fn check_mgf(mgf: CK_RSA_PKCS_MGF_TYPE) -> Result<()> {
    match mgf {
        CKG_MGF1_SHA1 | CKG_MGF1_SHA224 | CKG_MGF1_SHA256 | CKG_MGF1_SHA384 | CKG_MGF1_SHA512 => {
            Ok(())
        }
        _ => Err(Error::InvalidParameter(format!("unknown mask generation function {mgf:#x}"))),
    }
}

fn check_source(source: CK_RSA_PKCS_OAEP_SOURCE_TYPE) -> Result<()> {
    match source {
        CKZ_EMPTY | CKZ_DATA_SPECIFIED => Ok(()),
        _ => Err(Error::InvalidParameter(format!(
            "OAEP source must be empty or data-specified, got {source:#x}"
        ))),
    }
}

fn put_ulong(out: &mut Vec<u8>, value: CK_ULONG) {
    out.extend_from_slice(&value.to_ne_bytes());
}

fn put_prefixed(out: &mut Vec<u8>, bytes: &[u8]) {
    put_ulong(out, bytes.len() as CK_ULONG);
    out.extend_from_slice(bytes);
}

struct Reader<'a>(&'a [u8]);

impl Reader<'_> {
    fn take(&mut self, len: usize) -> Result<&[u8]> {
        let (head, rest) = self
            .0
            .split_at_checked(len)
            .ok_or_else(|| Error::InvalidParameter("parameter block is truncated".to_string()))?;
        self.0 = rest;
        Ok(head)
    }

    fn ulong(&mut self) -> Result<CK_ULONG> {
        let mut word = [0u8; ULONG_SIZE];
        word.copy_from_slice(self.take(ULONG_SIZE)?);
        Ok(CK_ULONG::from_ne_bytes(word))
    }

    fn prefixed(&mut self) -> Result<Vec<u8>> {
        let len = usize::try_from(self.ulong()?)?;
        Ok(self.take(len)?.to_vec())
    }

    fn finish(self) -> Result<()> {
        if !self.0.is_empty() {
            return Err(Error::InvalidParameter(format!(
                "{} unexpected bytes after parameter block",
                self.0.len()
            )));
        }
        Ok(())
    }
}
