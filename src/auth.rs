//! MySQL 인증 처리
//!
//! 세 가지 비밀번호 암호화 방식을 구현합니다.
//! - mysql_native_password: `SHA1(password) XOR SHA1(seed + SHA1(SHA1(password)))`
//! - caching_sha2_password: `SHA256(password) XOR SHA256(SHA256(SHA256(password)) + seed)`
//! - RSA 공개키: `(password + \0) XOR seed`를 서버 공개키로 암호화

use crate::error::{CdcError, Result};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use byteorder::{LittleEndian, WriteBytesExt};
use rsa::pkcs1::DecodeRsaPublicKey;
use rsa::pkcs8::DecodePublicKey;
use rsa::{Oaep, Pkcs1v15Encrypt, RsaPublicKey};
use sha1::Sha1;
use sha2::{Digest, Sha256};
use std::io::Write;

/// Client capability flags
pub mod capabilities {
    pub const LONG_PASSWORD: u32 = 1;
    pub const FOUND_ROWS: u32 = 2;
    pub const LONG_FLAG: u32 = 4;
    pub const CONNECT_WITH_DB: u32 = 8;
    pub const PROTOCOL_41: u32 = 512;
    pub const TRANSACTIONS: u32 = 8192;
    pub const SECURE_CONNECTION: u32 = 32768;
    pub const MULTI_STATEMENTS: u32 = 1 << 16;
    pub const MULTI_RESULTS: u32 = 1 << 17;
    pub const PLUGIN_AUTH: u32 = 1 << 19;
}

/// caching_sha2_password 진행 단계 표시 (AuthMoreData 본문)
pub const FAST_AUTH_SUCCESS: u8 = 0x03;
pub const PERFORM_FULL_AUTHENTICATION: u8 = 0x04;

/// caching_sha2_password 공개키 요청
pub const CACHING_SHA2_REQUEST_PUBLIC_KEY: u8 = 0x02;

/// sha256_password 공개키 요청
pub const SHA256_REQUEST_PUBLIC_KEY: u8 = 0x01;

/// 인증 플러그인
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthPlugin {
    NativePassword,
    CachingSha2Password,
    Sha256Password,
}

impl AuthPlugin {
    pub fn from_name(name: &str) -> Result<Self> {
        match name {
            "mysql_native_password" => Ok(AuthPlugin::NativePassword),
            "caching_sha2_password" => Ok(AuthPlugin::CachingSha2Password),
            "sha256_password" => Ok(AuthPlugin::Sha256Password),
            other => Err(CdcError::UnsupportedOperation(format!(
                "Unsupported auth plugin: {}",
                other
            ))),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            AuthPlugin::NativePassword => "mysql_native_password",
            AuthPlugin::CachingSha2Password => "caching_sha2_password",
            AuthPlugin::Sha256Password => "sha256_password",
        }
    }
}

/// RSA 암호화 변환 방식
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RsaTransformation {
    /// RSA/ECB/OAEPWithSHA-1AndMGF1Padding
    OaepSha1,
    /// RSA/ECB/PKCS1Padding
    Pkcs1,
}

impl RsaTransformation {
    /// caching_sha2_password는 8.0.5부터 OAEP를 사용
    pub fn for_plugin(plugin: AuthPlugin, server_8_0_5_or_later: bool) -> Self {
        match plugin {
            AuthPlugin::CachingSha2Password if !server_8_0_5_or_later => RsaTransformation::Pkcs1,
            _ => RsaTransformation::OaepSha1,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            RsaTransformation::OaepSha1 => "RSA/ECB/OAEPWithSHA-1AndMGF1Padding",
            RsaTransformation::Pkcs1 => "RSA/ECB/PKCS1Padding",
        }
    }
}

/// mysql_native_password 암호화
pub fn scramble_native_password(password: &[u8], seed: &[u8]) -> Vec<u8> {
    // SHA1(password)
    let stage1 = Sha1::digest(password);

    // SHA1(SHA1(password))
    let stage2 = Sha1::digest(stage1);

    // SHA1(seed + SHA1(SHA1(password)))
    let mut hasher = Sha1::new();
    hasher.update(seed);
    hasher.update(stage2);
    let stage3 = hasher.finalize();

    stage1
        .iter()
        .zip(stage3.iter())
        .map(|(a, b)| a ^ b)
        .collect()
}

/// caching_sha2_password 암호화
pub fn scramble_caching_sha2(password: &[u8], seed: &[u8]) -> Vec<u8> {
    let stage1 = Sha256::digest(password);
    let stage2 = Sha256::digest(stage1);

    let mut hasher = Sha256::new();
    hasher.update(stage2);
    hasher.update(seed);
    let stage3 = hasher.finalize();

    stage1
        .iter()
        .zip(stage3.iter())
        .map(|(a, b)| a ^ b)
        .collect()
}

/// RSA 공개키 암호화 (full authentication)
///
/// null 종료된 비밀번호를 seed와 XOR한 뒤(seed는 반복 사용) 서버 공개키로
/// 암호화합니다. 키 파싱이나 암호화 실패는 모두 치명적입니다.
pub fn encrypt_with_public_key(
    password: &[u8],
    seed: &[u8],
    public_key_pem: &str,
    transformation: RsaTransformation,
) -> Result<Vec<u8>> {
    if seed.is_empty() {
        return Err(CdcError::EncryptionError("Empty auth seed".to_string()));
    }

    let mut input = Vec::with_capacity(password.len() + 1);
    input.extend_from_slice(password);
    input.push(0);
    for (i, byte) in input.iter_mut().enumerate() {
        *byte ^= seed[i % seed.len()];
    }

    let public_key = parse_public_key(public_key_pem)?;
    let mut rng = rand::thread_rng();
    let encrypted = match transformation {
        RsaTransformation::OaepSha1 => public_key.encrypt(&mut rng, Oaep::new::<Sha1>(), &input),
        RsaTransformation::Pkcs1 => public_key.encrypt(&mut rng, Pkcs1v15Encrypt, &input),
    };

    encrypted.map_err(|e| {
        CdcError::EncryptionError(format!("{} failed: {}", transformation.name(), e))
    })
}

/// PEM 헤더/푸터를 제거하고 공개키 파싱 (SubjectPublicKeyInfo, PKCS#1 순)
fn parse_public_key(pem: &str) -> Result<RsaPublicKey> {
    let body: String = pem
        .lines()
        .filter(|line| !line.starts_with("-----"))
        .flat_map(|line| line.chars())
        .filter(|c| !c.is_whitespace() && *c != '\0')
        .collect();

    let der = STANDARD
        .decode(body.as_bytes())
        .map_err(|e| CdcError::EncryptionError(format!("Invalid public key encoding: {}", e)))?;

    RsaPublicKey::from_public_key_der(&der)
        .or_else(|_| RsaPublicKey::from_pkcs1_der(&der))
        .map_err(|e| CdcError::EncryptionError(format!("Invalid RSA public key: {}", e)))
}

/// 플러그인별 첫 인증 응답 생성
pub fn create_auth_response(plugin: AuthPlugin, password: &str, seed: &[u8]) -> Vec<u8> {
    if password.is_empty() {
        return Vec::new();
    }

    match plugin {
        AuthPlugin::NativePassword => scramble_native_password(password.as_bytes(), seed),
        AuthPlugin::CachingSha2Password => scramble_caching_sha2(password.as_bytes(), seed),
        // TLS 없이 평문을 보낼 수 없으므로 공개키부터 요청
        AuthPlugin::Sha256Password => vec![SHA256_REQUEST_PUBLIC_KEY],
    }
}

/// 인증 패킷 생성
pub fn create_handshake_response(
    username: &str,
    password: &str,
    plugin: AuthPlugin,
    seed: &[u8],
    collation: u8,
) -> Result<Vec<u8>> {
    let mut buffer = Vec::new();

    let client_capabilities = capabilities::LONG_PASSWORD
        | capabilities::LONG_FLAG
        | capabilities::PROTOCOL_41
        | capabilities::TRANSACTIONS
        | capabilities::SECURE_CONNECTION
        | capabilities::MULTI_RESULTS
        | capabilities::PLUGIN_AUTH;

    buffer.write_u32::<LittleEndian>(client_capabilities)?;

    // Max packet size (4 bytes) - 0 means default (16MB)
    buffer.write_u32::<LittleEndian>(0)?;

    buffer.write_u8(collation)?;

    // Reserved (23 bytes of zeros)
    buffer.write_all(&[0u8; 23])?;

    // Username (null-terminated string)
    buffer.write_all(username.as_bytes())?;
    buffer.write_u8(0)?;

    let auth_response = create_auth_response(plugin, password, seed);
    buffer.write_u8(auth_response.len() as u8)?;
    buffer.write_all(&auth_response)?;

    buffer.write_all(plugin.name().as_bytes())?;
    buffer.write_u8(0)?;

    Ok(buffer)
}
