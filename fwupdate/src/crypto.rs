// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Cryptographic helpers for the 1.2 authorization paths, from OpenSSL.

use crate::tpm12proto::Authdata;
use crate::tpm12proto::Nonce;
use crate::tpm12proto::SHA1_DIGEST_SIZE;
use openssl::bn::BigNum;
use openssl::hash::Hasher;
use openssl::hash::MessageDigest;
use openssl::pkey::PKey;
use openssl::sign::Signer;
use thiserror::Error;

/// The public exponent of every endorsement key the tool encrypts against.
const RSA_PUBLIC_EXPONENT: u32 = 65537;

#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("failed to build an RSA key from the EK modulus")]
    EkModulusToRsa(#[source] openssl::error::ErrorStack),
    #[error("PkeyCtx encrypt_init() failed")]
    PkeyCtxEncryptInit(#[source] openssl::error::ErrorStack),
    #[error("PkeyCtx set_rsa_padding() failed")]
    PkeyCtxSetRsaPadding(#[source] openssl::error::ErrorStack),
    #[error("PkeyCtx set_rsa_oaep_md() failed")]
    PkeyCtxSetRsaOaepMd(#[source] openssl::error::ErrorStack),
    #[error("RSA-OAEP encryption failed")]
    Encrypt(#[source] openssl::error::ErrorStack),
    #[error("SHA-1 digest failed")]
    Digest(#[source] openssl::error::ErrorStack),
    #[error("HMAC-SHA1 failed")]
    Hmac(#[source] openssl::error::ErrorStack),
    #[error("random nonce generation failed")]
    Nonce(#[source] getrandom::Error),
}

/// RSA-OAEP (SHA-1, MGF1) encrypt `input` against a raw public modulus with
/// exponent 65537, as the 1.2 take-ownership exchange requires.
pub fn rsa_oaep_sha1_encrypt(modulus: &[u8], input: &[u8]) -> Result<Vec<u8>, CryptoError> {
    let n = BigNum::from_slice(modulus).map_err(CryptoError::EkModulusToRsa)?;
    let e = BigNum::from_u32(RSA_PUBLIC_EXPONENT).map_err(CryptoError::EkModulusToRsa)?;
    let rsa =
        openssl::rsa::Rsa::from_public_components(n, e).map_err(CryptoError::EkModulusToRsa)?;
    let pkey = PKey::from_rsa(rsa).map_err(CryptoError::EkModulusToRsa)?;

    let mut ctx = openssl::pkey_ctx::PkeyCtx::new(&pkey).map_err(CryptoError::Encrypt)?;
    ctx.encrypt_init().map_err(CryptoError::PkeyCtxEncryptInit)?;
    ctx.set_rsa_padding(openssl::rsa::Padding::PKCS1_OAEP)
        .map_err(CryptoError::PkeyCtxSetRsaPadding)?;
    ctx.set_rsa_oaep_md(openssl::md::Md::sha1())
        .map_err(CryptoError::PkeyCtxSetRsaOaepMd)?;

    let mut output = vec![];
    ctx.encrypt_to_vec(input, &mut output)
        .map_err(CryptoError::Encrypt)?;

    Ok(output)
}

pub fn sha1(data: &[u8]) -> Result<[u8; SHA1_DIGEST_SIZE], CryptoError> {
    let mut hasher = Hasher::new(MessageDigest::sha1()).map_err(CryptoError::Digest)?;
    hasher.update(data).map_err(CryptoError::Digest)?;
    let digest = hasher.finish().map_err(CryptoError::Digest)?;
    Ok(digest.as_ref().try_into().expect("SHA-1 is 20 bytes"))
}

/// HMAC-SHA1 over the 1.2 authorization input (`1H1` digest, nonces,
/// continue flag), keyed with the relevant auth secret.
pub fn hmac_sha1(key: &Authdata, data: &[u8]) -> Result<[u8; SHA1_DIGEST_SIZE], CryptoError> {
    let pkey = PKey::hmac(key).map_err(CryptoError::Hmac)?;
    let mut signer = Signer::new(MessageDigest::sha1(), &pkey).map_err(CryptoError::Hmac)?;
    signer.update(data).map_err(CryptoError::Hmac)?;
    let mac = signer.sign_to_vec().map_err(CryptoError::Hmac)?;
    Ok(mac.as_slice().try_into().expect("HMAC-SHA1 is 20 bytes"))
}

pub fn random_nonce() -> Result<Nonce, CryptoError> {
    let mut nonce = [0u8; SHA1_DIGEST_SIZE];
    getrandom::getrandom(&mut nonce).map_err(CryptoError::Nonce)?;
    Ok(nonce)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sha1_of_zero_bytes() {
        // SHA-1 of twenty zero bytes; the well-known SRK auth digest.
        let digest = sha1(&[0u8; 20]).unwrap();
        assert_eq!(
            digest,
            [
                0x67, 0x68, 0x03, 0x3e, 0x21, 0x64, 0x68, 0x24, 0x7b, 0xd0, 0x31, 0xa0, 0xa2,
                0xd9, 0x87, 0x6d, 0x79, 0x81, 0x8f, 0x8f
            ]
        );
    }

    #[test]
    fn hmac_sha1_rfc2202_vector() {
        let key = [0x0b; 20];
        let mac = hmac_sha1(&key, b"Hi There").unwrap();
        assert_eq!(
            mac,
            [
                0xb6, 0x17, 0x31, 0x86, 0x55, 0x05, 0x72, 0x64, 0xe2, 0x8b, 0xc0, 0xb6, 0xfb,
                0x37, 0x8c, 0x8e, 0xf1, 0x46, 0xbe, 0x00
            ]
        );
    }

    #[test]
    fn oaep_output_is_modulus_sized() {
        // A 2048-bit modulus (any odd value works for encryption sizing).
        let mut modulus = vec![0xffu8; 256];
        modulus[255] = 0xfd;
        let encrypted = rsa_oaep_sha1_encrypt(&modulus, &[0u8; 20]).unwrap();
        assert_eq!(encrypted.len(), 256);
    }

    #[test]
    fn nonces_differ() {
        assert_ne!(random_nonce().unwrap(), random_nonce().unwrap());
    }
}
