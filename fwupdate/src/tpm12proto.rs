// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! TPM 1.2 protocol types, as defined in the TCG main specification.
//!
//! The 1.2 wire format is variable-length almost everywhere (nested key and
//! pubkey structures, authorization trailers), so these types marshal through
//! the [`codec`](crate::codec) cursor instead of fixed-layout structs.

use crate::codec::CodecError;
use crate::codec::Reader;
use crate::codec::Writer;

/// Largest command or response the tool ever exchanges with a 1.2 chip.
pub const MAX_COMMAND_SIZE: usize = 4096;

pub const TPM_TAG_RQU_COMMAND: u16 = 0x00c1;
pub const TPM_TAG_RQU_AUTH1_COMMAND: u16 = 0x00c2;
pub const TPM_TAG_RSP_COMMAND: u16 = 0x00c4;
pub const TPM_TAG_RSP_AUTH1_COMMAND: u16 = 0x00c5;

pub const TPM_ORD_OIAP: u32 = 0x0000000a;
pub const TPM_ORD_OSAP: u32 = 0x0000000b;
pub const TPM_ORD_TAKE_OWNERSHIP: u32 = 0x0000000d;
pub const TPM_ORD_SET_CAPABILITY: u32 = 0x0000003f;
pub const TPM_ORD_OWNER_CLEAR: u32 = 0x0000005b;
pub const TPM_ORD_READ_PUBEK: u32 = 0x0000007c;
/// Vendor ordinal carrying the Infineon field-upgrade subcommands.
pub const TPM_ORD_FIELD_UPGRADE: u32 = 0x000000aa;
pub const TSC_ORD_PHYSICAL_PRESENCE: u32 = 0x4000000a;

// TPM_RESULT values the flow inspects.
pub const TPM_SUCCESS: u32 = 0;
pub const TPM_AUTHFAIL: u32 = 1;
pub const TPM_BAD_PARAMETER: u32 = 3;
pub const TPM_DEACTIVATED: u32 = 6;
pub const TPM_DISABLED: u32 = 7;
pub const TPM_FAIL: u32 = 9;
pub const TPM_BAD_ORDINAL: u32 = 10;
/// Returned in a 1.2-format header by a 2.0 chip that received a 1.2 tag.
pub const TPM_BAD_TAG: u32 = 30;

// TSC_PhysicalPresence argument bits.
pub const TPM_PHYSICAL_PRESENCE_PRESENT: u16 = 0x0008;
pub const TPM_PHYSICAL_PRESENCE_CMD_ENABLE: u16 = 0x0020;

// TPM_SetCapability areas and subcaps.
pub const TPM_SET_STCLEAR_DATA: u32 = 0x00000004;
pub const TPM_SD_DEFERREDPHYSICALPRESENCE: u32 = 0x00000006;

// OSAP entity types.
pub const TPM_ET_OWNER: u16 = 0x0002;

// TakeOwnership protocol id.
pub const TPM_PID_OWNER: u16 = 0x0005;

// TPM_KEY algorithm constants for the SRK parameter block.
pub const TPM_ALG_RSA: u32 = 0x00000001;
pub const TPM_ES_RSAESOAEP_SHA1_MGF1: u16 = 0x0003;
pub const TPM_SS_NONE: u16 = 0x0001;
pub const TPM_KEY_STORAGE: u16 = 0x0011;
pub const TPM_AUTH_ALWAYS: u8 = 0x01;

pub const SHA1_DIGEST_SIZE: usize = 20;

pub type Nonce = [u8; SHA1_DIGEST_SIZE];
pub type Authdata = [u8; SHA1_DIGEST_SIZE];

/// Every 1.2 command starts with tag, total size, ordinal.
pub const TPM12_HEADER_SIZE: usize = 10;
/// Tag, total size, TPM_RESULT.
pub const TPM12_REPLY_HEADER_SIZE: usize = 10;

/// Parsed response header of a 1.2 reply.
#[derive(Debug, Copy, Clone)]
pub struct ReplyHeader12 {
    pub tag: u16,
    pub size: u32,
    pub result: u32,
}

impl ReplyHeader12 {
    pub fn unmarshal(reader: &mut Reader<'_>) -> Result<Self, CodecError> {
        Ok(Self {
            tag: reader.read_u16()?,
            size: reader.read_u32()?,
            result: reader.read_u32()?,
        })
    }
}

/// Write the fixed command prefix, leaving the size field deferred. The
/// returned deferred slot must be patched with the final [`Writer::len`].
pub fn marshal_header(
    writer: &mut Writer<'_>,
    tag: u16,
    ordinal: u32,
) -> Result<crate::codec::DeferredU32, CodecError> {
    writer.write_u16(tag)?;
    let size = writer.defer_u32()?;
    writer.write_u32(ordinal)?;
    Ok(size)
}

/// `TPM_STRUCT_VER`, fixed at 1.1.0.0 for all 1.2 structures.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct TpmStructVer {
    pub major: u8,
    pub minor: u8,
    pub rev_major: u8,
    pub rev_minor: u8,
}

impl TpmStructVer {
    pub const V1_1: TpmStructVer = TpmStructVer {
        major: 1,
        minor: 1,
        rev_major: 0,
        rev_minor: 0,
    };

    pub fn marshal(&self, writer: &mut Writer<'_>) -> Result<(), CodecError> {
        writer.write_u8(self.major)?;
        writer.write_u8(self.minor)?;
        writer.write_u8(self.rev_major)?;
        writer.write_u8(self.rev_minor)
    }

    pub fn unmarshal(reader: &mut Reader<'_>) -> Result<Self, CodecError> {
        Ok(Self {
            major: reader.read_u8()?,
            minor: reader.read_u8()?,
            rev_major: reader.read_u8()?,
            rev_minor: reader.read_u8()?,
        })
    }
}

/// `TPM_RSA_KEY_PARMS`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TpmRsaKeyParms {
    pub key_length: u32,
    pub num_primes: u32,
    /// Empty means the default exponent 2^16 + 1.
    pub exponent: Vec<u8>,
}

impl TpmRsaKeyParms {
    pub fn marshal(&self, writer: &mut Writer<'_>) -> Result<(), CodecError> {
        writer.write_u32(self.key_length)?;
        writer.write_u32(self.num_primes)?;
        writer.write_u32(self.exponent.len() as u32)?;
        writer.write_bytes(&self.exponent)
    }

    pub fn unmarshal(reader: &mut Reader<'_>) -> Result<Self, CodecError> {
        let key_length = reader.read_u32()?;
        let num_primes = reader.read_u32()?;
        let exponent_size = reader.read_u32()? as usize;
        let exponent = reader.read_bytes(exponent_size)?.to_vec();
        Ok(Self {
            key_length,
            num_primes,
            exponent,
        })
    }

    pub fn wire_size(&self) -> usize {
        12 + self.exponent.len()
    }
}

/// `TPM_KEY_PARMS` restricted to RSA, the only algorithm the flow touches.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TpmKeyParms {
    pub algorithm_id: u32,
    pub enc_scheme: u16,
    pub sig_scheme: u16,
    pub parms: TpmRsaKeyParms,
}

impl TpmKeyParms {
    pub fn marshal(&self, writer: &mut Writer<'_>) -> Result<(), CodecError> {
        writer.write_u32(self.algorithm_id)?;
        writer.write_u16(self.enc_scheme)?;
        writer.write_u16(self.sig_scheme)?;
        writer.write_u32(self.parms.wire_size() as u32)?;
        self.parms.marshal(writer)
    }

    pub fn unmarshal(reader: &mut Reader<'_>) -> Result<Self, CodecError> {
        let algorithm_id = reader.read_u32()?;
        let enc_scheme = reader.read_u16()?;
        let sig_scheme = reader.read_u16()?;
        let parm_size = reader.read_u32()? as usize;
        let mut parm_reader = Reader::new(reader.read_bytes(parm_size)?);
        let parms = TpmRsaKeyParms::unmarshal(&mut parm_reader)?;
        Ok(Self {
            algorithm_id,
            enc_scheme,
            sig_scheme,
            parms,
        })
    }
}

/// `TPM_STORE_PUBKEY`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TpmStorePubkey {
    pub key: Vec<u8>,
}

impl TpmStorePubkey {
    pub fn marshal(&self, writer: &mut Writer<'_>) -> Result<(), CodecError> {
        writer.write_u32(self.key.len() as u32)?;
        writer.write_bytes(&self.key)
    }

    pub fn unmarshal(reader: &mut Reader<'_>) -> Result<Self, CodecError> {
        let key_length = reader.read_u32()? as usize;
        Ok(Self {
            key: reader.read_bytes(key_length)?.to_vec(),
        })
    }
}

/// `TPM_PUBKEY`, as returned by `TPM_ReadPubek`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TpmPubkey {
    pub algorithm_parms: TpmKeyParms,
    pub pub_key: TpmStorePubkey,
}

impl TpmPubkey {
    pub fn marshal(&self, writer: &mut Writer<'_>) -> Result<(), CodecError> {
        self.algorithm_parms.marshal(writer)?;
        self.pub_key.marshal(writer)
    }

    pub fn unmarshal(reader: &mut Reader<'_>) -> Result<Self, CodecError> {
        Ok(Self {
            algorithm_parms: TpmKeyParms::unmarshal(reader)?,
            pub_key: TpmStorePubkey::unmarshal(reader)?,
        })
    }
}

/// `TPM_KEY`, used as the SRK parameter block in `TPM_TakeOwnership`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TpmKey12 {
    pub ver: TpmStructVer,
    pub key_usage: u16,
    pub key_flags: u32,
    pub auth_data_usage: u8,
    pub algorithm_parms: TpmKeyParms,
    pub pcr_info: Vec<u8>,
    pub pub_key: TpmStorePubkey,
    pub enc_data: Vec<u8>,
}

impl TpmKey12 {
    /// The hard-coded 2048-bit storage root key parameter block.
    pub fn srk_params() -> Self {
        Self {
            ver: TpmStructVer::V1_1,
            key_usage: TPM_KEY_STORAGE,
            key_flags: 0,
            auth_data_usage: TPM_AUTH_ALWAYS,
            algorithm_parms: TpmKeyParms {
                algorithm_id: TPM_ALG_RSA,
                enc_scheme: TPM_ES_RSAESOAEP_SHA1_MGF1,
                sig_scheme: TPM_SS_NONE,
                parms: TpmRsaKeyParms {
                    key_length: 2048,
                    num_primes: 2,
                    exponent: Vec::new(),
                },
            },
            pcr_info: Vec::new(),
            pub_key: TpmStorePubkey { key: Vec::new() },
            enc_data: Vec::new(),
        }
    }

    pub fn marshal(&self, writer: &mut Writer<'_>) -> Result<(), CodecError> {
        self.ver.marshal(writer)?;
        writer.write_u16(self.key_usage)?;
        writer.write_u32(self.key_flags)?;
        writer.write_u8(self.auth_data_usage)?;
        self.algorithm_parms.marshal(writer)?;
        writer.write_u32(self.pcr_info.len() as u32)?;
        writer.write_bytes(&self.pcr_info)?;
        self.pub_key.marshal(writer)?;
        writer.write_u32(self.enc_data.len() as u32)?;
        writer.write_bytes(&self.enc_data)
    }

    pub fn unmarshal(reader: &mut Reader<'_>) -> Result<Self, CodecError> {
        let ver = TpmStructVer::unmarshal(reader)?;
        let key_usage = reader.read_u16()?;
        let key_flags = reader.read_u32()?;
        let auth_data_usage = reader.read_u8()?;
        let algorithm_parms = TpmKeyParms::unmarshal(reader)?;
        let pcr_info_size = reader.read_u32()? as usize;
        let pcr_info = reader.read_bytes(pcr_info_size)?.to_vec();
        let pub_key = TpmStorePubkey::unmarshal(reader)?;
        let enc_data_size = reader.read_u32()? as usize;
        let enc_data = reader.read_bytes(enc_data_size)?.to_vec();
        Ok(Self {
            ver,
            key_usage,
            key_flags,
            auth_data_usage,
            algorithm_parms,
            pcr_info,
            pub_key,
            enc_data,
        })
    }
}

/// Command authorization trailer of a `TPM_TAG_RQU_AUTH1_COMMAND`.
#[derive(Debug, Clone)]
pub struct AuthTrailer {
    pub auth_handle: u32,
    pub nonce_odd: Nonce,
    pub continue_auth_session: bool,
    pub auth: Authdata,
}

impl AuthTrailer {
    pub fn marshal(&self, writer: &mut Writer<'_>) -> Result<(), CodecError> {
        writer.write_u32(self.auth_handle)?;
        writer.write_bytes(&self.nonce_odd)?;
        writer.write_u8(self.continue_auth_session as u8)?;
        writer.write_bytes(&self.auth)
    }
}

/// Session state returned by `TPM_OIAP` / `TPM_OSAP`.
#[derive(Debug, Clone)]
pub struct AuthSession12 {
    pub handle: u32,
    pub nonce_even: Nonce,
}

/// `TPM_OSAP` additionally returns the even OSAP nonce used to derive the
/// shared secret.
#[derive(Debug, Clone)]
pub struct OsapSession {
    pub session: AuthSession12,
    pub nonce_even_osap: Nonce,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn srk_params_wire_bytes() {
        // TPM_KEY with empty exponent, pcrInfo, pubKey, encData.
        let mut buf = [0u8; 64];
        let mut writer = Writer::new(&mut buf);
        TpmKey12::srk_params().marshal(&mut writer).unwrap();
        let len = writer.len();
        let expected: [u8; 47] = [
            0x01, 0x01, 0x00, 0x00, // ver 1.1.0.0
            0x00, 0x11, // keyUsage: storage
            0x00, 0x00, 0x00, 0x00, // keyFlags
            0x01, // authDataUsage: always
            0x00, 0x00, 0x00, 0x01, // algorithmID: RSA
            0x00, 0x03, // encScheme: OAEP SHA1 MGF1
            0x00, 0x01, // sigScheme: none
            0x00, 0x00, 0x00, 0x0c, // parmSize
            0x00, 0x00, 0x08, 0x00, // keyLength 2048
            0x00, 0x00, 0x00, 0x02, // numPrimes
            0x00, 0x00, 0x00, 0x00, // exponentSize
            0x00, 0x00, 0x00, 0x00, // PCRInfoSize
            0x00, 0x00, 0x00, 0x00, // pubKey.keyLength
            0x00, 0x00, 0x00, 0x00, // encSize
        ];
        assert_eq!(&buf[..len], &expected);
    }

    #[test]
    fn tpm_key_round_trip() {
        let key = TpmKey12 {
            enc_data: vec![0xaa; 16],
            pub_key: TpmStorePubkey {
                key: vec![0x55; 32],
            },
            ..TpmKey12::srk_params()
        };
        let mut buf = [0u8; 256];
        let mut writer = Writer::new(&mut buf);
        key.marshal(&mut writer).unwrap();
        let len = writer.len();

        let mut reader = Reader::new(&buf[..len]);
        let parsed = TpmKey12::unmarshal(&mut reader).unwrap();
        assert_eq!(parsed, key);
        assert_eq!(reader.remaining(), 0);

        // Re-marshalling reproduces the original wire bytes.
        let mut buf2 = [0u8; 256];
        let mut writer2 = Writer::new(&mut buf2);
        parsed.marshal(&mut writer2).unwrap();
        let len2 = writer2.len();
        assert_eq!(&buf[..len], &buf2[..len2]);
    }

    #[test]
    fn pubkey_unmarshal_truncated() {
        let pubkey = TpmPubkey {
            algorithm_parms: TpmKeyParms {
                algorithm_id: TPM_ALG_RSA,
                enc_scheme: TPM_ES_RSAESOAEP_SHA1_MGF1,
                sig_scheme: TPM_SS_NONE,
                parms: TpmRsaKeyParms {
                    key_length: 2048,
                    num_primes: 2,
                    exponent: Vec::new(),
                },
            },
            pub_key: TpmStorePubkey {
                key: vec![0x11; 256],
            },
        };
        let mut buf = [0u8; 512];
        let mut writer = Writer::new(&mut buf);
        pubkey.marshal(&mut writer).unwrap();
        let len = writer.len();

        // Any truncation point must fail cleanly, never panic.
        for cut in 0..len {
            let mut reader = Reader::new(&buf[..cut]);
            assert!(TpmPubkey::unmarshal(&mut reader).is_err());
        }
        let mut reader = Reader::new(&buf[..len]);
        assert_eq!(TpmPubkey::unmarshal(&mut reader).unwrap(), pubkey);
    }

    #[test]
    fn header_patching() {
        let mut buf = [0u8; 32];
        let mut writer = Writer::new(&mut buf);
        let size = marshal_header(&mut writer, TPM_TAG_RQU_COMMAND, TPM_ORD_OIAP).unwrap();
        let total = writer.len() as u32;
        writer.patch_u32(size, total);
        assert_eq!(
            &buf[..10],
            &[0x00, 0xc1, 0x00, 0x00, 0x00, 0x0a, 0x00, 0x00, 0x00, 0x0a]
        );
    }
}
