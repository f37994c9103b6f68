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

use std::fmt;

use pkcs11_sys::*;
use pkcs11_wrapper_traits::{RawMechanism, VendorCodeConverter};
use strum_macros::Display;

use crate::{
    Error,
    Result,
    parameters::{
        Ecdh1DeriveParameters,
        InitializationVector,
        ParameterBlock,
        Parameters,
        RsaPkcsOaepParameters,
        RsaPkcsPssParameters,
    },
    vendor::{mechanism_to_generic, mechanism_to_vendor},
};

/// The parameter shape a mechanism expects.
#[derive(Debug, Display, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MechanismFamily {
    NoParameters,
    Scalar,
    InitializationVector,
    Opaque,
    Ecdh1Derive,
    RsaPkcsOaep,
    RsaPkcsPss,
    /// Vendor-defined or unlisted mechanisms; any parameters are passed on.
    Unrestricted,
}

impl MechanismFamily {
    pub fn of(code: CK_MECHANISM_TYPE) -> Self {
        match code {
            CKM_RSA_PKCS_KEY_PAIR_GEN
            | CKM_RSA_PKCS
            | CKM_RSA_X_509
            | CKM_SHA1_RSA_PKCS
            | CKM_SHA256_RSA_PKCS
            | CKM_SHA384_RSA_PKCS
            | CKM_SHA512_RSA_PKCS
            | CKM_DES_KEY_GEN
            | CKM_DES_ECB
            | CKM_DES2_KEY_GEN
            | CKM_DES3_KEY_GEN
            | CKM_DES3_ECB
            | CKM_DES3_MAC
            | CKM_SHA_1
            | CKM_SHA224
            | CKM_SHA256
            | CKM_SHA384
            | CKM_SHA512
            | CKM_SHA256_HMAC
            | CKM_GENERIC_SECRET_KEY_GEN
            | CKM_EC_KEY_PAIR_GEN
            | CKM_ECDSA
            | CKM_ECDSA_SHA256
            | CKM_AES_KEY_GEN
            | CKM_AES_ECB
            | CKM_AES_MAC => MechanismFamily::NoParameters,
            CKM_DES3_MAC_GENERAL | CKM_AES_MAC_GENERAL | CKM_SHA256_HMAC_GENERAL => {
                MechanismFamily::Scalar
            }
            CKM_DES_CBC
            | CKM_DES_CBC_PAD
            | CKM_DES3_CBC
            | CKM_DES3_CBC_PAD
            | CKM_AES_CBC
            | CKM_AES_CBC_PAD => MechanismFamily::InitializationVector,
            CKM_AES_CTR | CKM_AES_GCM => MechanismFamily::Opaque,
            CKM_ECDH1_DERIVE | CKM_ECDH1_COFACTOR_DERIVE => MechanismFamily::Ecdh1Derive,
            CKM_RSA_PKCS_OAEP => MechanismFamily::RsaPkcsOaep,
            CKM_RSA_PKCS_PSS
            | CKM_SHA1_RSA_PKCS_PSS
            | CKM_SHA256_RSA_PKCS_PSS
            | CKM_SHA384_RSA_PKCS_PSS
            | CKM_SHA512_RSA_PKCS_PSS => MechanismFamily::RsaPkcsPss,
            _ => MechanismFamily::Unrestricted,
        }
    }

    pub fn accepts(&self, parameters: &Parameters) -> bool {
        matches!(
            (self, parameters),
            (MechanismFamily::Unrestricted, _)
                | (MechanismFamily::Scalar, Parameters::Ulong(_))
                | (MechanismFamily::InitializationVector, Parameters::InitializationVector(_))
                | (MechanismFamily::Opaque, Parameters::Opaque(_))
                | (MechanismFamily::Ecdh1Derive, Parameters::Ecdh1Derive(_))
                | (MechanismFamily::RsaPkcsOaep, Parameters::RsaPkcsOaep(_))
                | (MechanismFamily::RsaPkcsPss, Parameters::RsaPkcsPss(_))
        )
    }

    fn decode(&self, block: &[u8]) -> Result<Option<Parameters>> {
        if block.is_empty() {
            return Ok(None);
        }
        Ok(Some(match self {
            MechanismFamily::NoParameters => {
                return Err(Error::InvalidParameter(format!(
                    "mechanism takes no parameters, got {} bytes",
                    block.len()
                )));
            }
            MechanismFamily::Scalar => {
                let word = block.try_into().map_err(|_| {
                    Error::InvalidParameter(format!(
                        "expected one CK_ULONG, got {} bytes",
                        block.len()
                    ))
                })?;
                Parameters::Ulong(CK_ULONG::from_ne_bytes(word))
            }
            MechanismFamily::InitializationVector => {
                InitializationVector::from_bytes(block)?.into()
            }
            MechanismFamily::Opaque | MechanismFamily::Unrestricted => Parameters::opaque(block),
            MechanismFamily::Ecdh1Derive => Ecdh1DeriveParameters::from_bytes(block)?.into(),
            MechanismFamily::RsaPkcsOaep => RsaPkcsOaepParameters::from_bytes(block)?.into(),
            MechanismFamily::RsaPkcsPss => RsaPkcsPssParameters::from_bytes(block)?.into(),
        }))
    }
}

/// A mechanism code with optional parameters.
///
/// Parameters are checked against the mechanism's family when they are
/// attached. A mechanism may be built without parameters and given them later.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Mechanism {
    code: CK_MECHANISM_TYPE,
    parameters: Option<Parameters>,
}

impl Mechanism {
    pub fn new(code: CK_MECHANISM_TYPE) -> Self {
        Mechanism { code, parameters: None }
    }

    pub fn with_parameters(
        code: CK_MECHANISM_TYPE,
        parameters: impl Into<Parameters>,
    ) -> Result<Self> {
        let mut mechanism = Mechanism::new(code);
        mechanism.set_parameters(parameters)?;
        Ok(mechanism)
    }

    pub fn code(&self) -> CK_MECHANISM_TYPE {
        self.code
    }

    pub fn parameters(&self) -> Option<&Parameters> {
        self.parameters.as_ref()
    }

    pub fn family(&self) -> MechanismFamily {
        MechanismFamily::of(self.code)
    }

    pub fn is_vendor_defined(&self) -> bool {
        self.code & CKM_VENDOR_DEFINED != 0
    }

    /// Attaches parameters after checking them against the family. An empty
    /// opaque block encodes exactly like no parameters and is stored as none.
    pub fn set_parameters(&mut self, parameters: impl Into<Parameters>) -> Result<()> {
        let parameters = parameters.into();
        if matches!(&parameters, Parameters::Opaque(block) if block.is_empty()) {
            self.parameters = None;
            return Ok(());
        }
        let family = self.family();
        if !family.accepts(&parameters) {
            return Err(Error::InvalidParameter(format!(
                "mechanism {:#x} ({family}) does not take {parameters:?}",
                self.code
            )));
        }
        self.parameters = Some(parameters);
        Ok(())
    }

    pub fn clear_parameters(&mut self) {
        self.parameters = None;
    }

    pub fn encode(&self, converter: Option<&dyn VendorCodeConverter>) -> RawMechanism {
        RawMechanism {
            mechanism: mechanism_to_vendor(self.code, converter),
            parameter: self.parameters.as_ref().map(Parameters::to_bytes).unwrap_or_default(),
        }
    }

    pub fn decode(raw: &RawMechanism, converter: Option<&dyn VendorCodeConverter>) -> Result<Self> {
        let code = mechanism_to_generic(raw.mechanism, converter);
        let parameters = MechanismFamily::of(code).decode(&raw.parameter)?;
        Ok(Mechanism { code, parameters })
    }
}

impl From<CK_MECHANISM_TYPE> for Mechanism {
    fn from(code: CK_MECHANISM_TYPE) -> Self {
        Mechanism::new(code)
    }
}

impl fmt::Display for Mechanism {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.code)?;
        if let Some(parameters) = &self.parameters {
            write!(f, " {parameters:?}")?;
        }
        Ok(())
    }
}

/// Capabilities of a mechanism on one token.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MechanismInfo {
    pub min_key_size: CK_ULONG,
    pub max_key_size: CK_ULONG,
    pub flags: CK_FLAGS,
}

impl MechanismInfo {
    fn has(&self, flag: CK_FLAGS) -> bool {
        self.flags & flag != 0
    }

    pub fn is_hardware(&self) -> bool {
        self.has(CKF_HW)
    }

    pub fn supports_encrypt(&self) -> bool {
        self.has(CKF_ENCRYPT)
    }

    pub fn supports_decrypt(&self) -> bool {
        self.has(CKF_DECRYPT)
    }

    pub fn supports_digest(&self) -> bool {
        self.has(CKF_DIGEST)
    }

    pub fn supports_sign(&self) -> bool {
        self.has(CKF_SIGN)
    }

    pub fn supports_verify(&self) -> bool {
        self.has(CKF_VERIFY)
    }

    pub fn supports_generate(&self) -> bool {
        self.has(CKF_GENERATE)
    }

    pub fn supports_generate_key_pair(&self) -> bool {
        self.has(CKF_GENERATE_KEY_PAIR)
    }

    pub fn supports_wrap(&self) -> bool {
        self.has(CKF_WRAP)
    }

    pub fn supports_unwrap(&self) -> bool {
        self.has(CKF_UNWRAP)
    }

    pub fn supports_derive(&self) -> bool {
        self.has(CKF_DERIVE)
    }
}

impl From<CK_MECHANISM_INFO> for MechanismInfo {
    fn from(info: CK_MECHANISM_INFO) -> Self {
        MechanismInfo {
            min_key_size: info.ulMinKeySize,
            max_key_size: info.ulMaxKeySize,
            flags: info.flags,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{parameters::CKZ_EMPTY, vendor::VendorCodeTable};

    #[test]
    fn parameters_must_match_family() {
        let iv = InitializationVector::new([0u8; 8]).unwrap();
        assert!(Mechanism::with_parameters(CKM_DES3_CBC_PAD, iv.clone()).is_ok());
        assert!(matches!(
            Mechanism::with_parameters(CKM_RSA_PKCS_OAEP, iv.clone()),
            Err(Error::InvalidParameter(_))
        ));
        assert!(matches!(
            Mechanism::with_parameters(CKM_AES_KEY_GEN, Parameters::Ulong(16)),
            Err(Error::InvalidParameter(_))
        ));
        // Vendor mechanisms take anything.
        assert!(Mechanism::with_parameters(CKM_VENDOR_DEFINED | 1, iv).is_ok());
    }

    #[test]
    fn encode_decode() {
        let oaep =
            RsaPkcsOaepParameters::new(CKM_SHA256, CKG_MGF1_SHA256, CKZ_EMPTY, b"").unwrap();
        let cases = [
            Mechanism::new(CKM_AES_KEY_GEN),
            Mechanism::with_parameters(
                CKM_AES_CBC_PAD,
                InitializationVector::new([7u8; 16]).unwrap(),
            )
            .unwrap(),
            Mechanism::with_parameters(CKM_AES_MAC_GENERAL, Parameters::Ulong(8)).unwrap(),
            Mechanism::with_parameters(CKM_RSA_PKCS_OAEP, oaep).unwrap(),
            Mechanism::with_parameters(
                CKM_ECDH1_DERIVE,
                Ecdh1DeriveParameters::new(CKD_NULL, b"", b"\x04pub").unwrap(),
            )
            .unwrap(),
            Mechanism::with_parameters(
                CKM_SHA256_RSA_PKCS_PSS,
                RsaPkcsPssParameters::new(CKM_SHA256, CKG_MGF1_SHA256, 32).unwrap(),
            )
            .unwrap(),
            Mechanism::with_parameters(CKM_AES_GCM, Parameters::opaque(vec![1, 2, 3])).unwrap(),
        ];
        for mechanism in &cases {
            let raw = mechanism.encode(None);
            assert_eq!(&Mechanism::decode(&raw, None).unwrap(), mechanism, "{mechanism}");
        }
    }

    #[test]
    fn empty_opaque_block_means_no_parameters() {
        let mut gcm = Mechanism::with_parameters(CKM_AES_GCM, Parameters::opaque(Vec::<u8>::new()))
            .unwrap();
        assert_eq!(gcm.parameters(), None);
        assert_eq!(Mechanism::decode(&gcm.encode(None), None).unwrap(), gcm);

        gcm.set_parameters(Parameters::opaque([1u8, 2])).unwrap();
        gcm.set_parameters(Parameters::opaque(Vec::<u8>::new())).unwrap();
        assert_eq!(gcm.parameters(), None);
        // No-parameter mechanisms take the empty block too.
        assert!(Mechanism::with_parameters(CKM_SHA256, Parameters::opaque([0u8; 0])).is_ok());
    }

    #[test]
    fn vendor_codes_are_translated_on_encode() {
        let generic = CKM_VENDOR_DEFINED | 0x10;
        let vendor = CKM_VENDOR_DEFINED | 0x4410;
        let table = VendorCodeTable::new().with_mechanism(generic, vendor);

        let raw = Mechanism::new(generic).encode(Some(&table));
        assert_eq!(raw.mechanism, vendor);
        assert_eq!(Mechanism::decode(&raw, Some(&table)).unwrap().code(), generic);
        assert_eq!(Mechanism::new(generic).encode(None).mechanism, generic);
    }

    #[test]
    fn mechanism_info_flags() {
        let info = MechanismInfo::from(CK_MECHANISM_INFO {
            ulMinKeySize: 16,
            ulMaxKeySize: 32,
            flags: CKF_HW | CKF_ENCRYPT | CKF_DECRYPT,
        });
        assert!(info.is_hardware());
        assert!(info.supports_encrypt() && info.supports_decrypt());
        assert!(!info.supports_sign());
    }
}
