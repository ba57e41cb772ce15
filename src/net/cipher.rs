//! Cipher policy evaluation.
//!
//! Turns an OpenSSL-style cipher string such as `HIGH:!aNULL:!MD5` into the
//! ordered list of rustls cipher suites the listener will offer.
//!
//! # Supported syntax
//! - Tokens separated by `:`, `,` or whitespace
//! - `X` appends matching suites, `-X` removes them, `!X` removes them for good,
//!   `+X` moves them to the end
//! - `X+Y` matches suites carrying both keywords
//! - `@STRENGTH` / `@SECLEVEL=n` are accepted and ignored
//!
//! Keywords naming algorithms rustls never implements (`aNULL`, `MD5`, `RC4`,
//! `3DES`, ...) match nothing, so excluding them is always satisfied.

use rustls::{CipherSuite, ProtocolVersion, SupportedCipherSuite};

/// Error type for cipher policy evaluation.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CipherPolicyError {
    #[error("cipher policy '{0}' selects no supported cipher suite")]
    NoSuites(String),
}

/// Static description of a suite in OpenSSL vocabulary.
struct SuiteInfo {
    openssl_name: &'static str,
    iana_name: &'static str,
    kx: Option<&'static str>,
    auth: Option<&'static str>,
    enc: &'static str,
    bits: u16,
    hash: &'static str,
}

fn describe(suite: CipherSuite) -> Option<SuiteInfo> {
    let info = match suite {
        CipherSuite::TLS13_AES_256_GCM_SHA384 => SuiteInfo {
            openssl_name: "TLS_AES_256_GCM_SHA384",
            iana_name: "TLS_AES_256_GCM_SHA384",
            kx: None,
            auth: None,
            enc: "AESGCM",
            bits: 256,
            hash: "SHA384",
        },
        CipherSuite::TLS13_AES_128_GCM_SHA256 => SuiteInfo {
            openssl_name: "TLS_AES_128_GCM_SHA256",
            iana_name: "TLS_AES_128_GCM_SHA256",
            kx: None,
            auth: None,
            enc: "AESGCM",
            bits: 128,
            hash: "SHA256",
        },
        CipherSuite::TLS13_CHACHA20_POLY1305_SHA256 => SuiteInfo {
            openssl_name: "TLS_CHACHA20_POLY1305_SHA256",
            iana_name: "TLS_CHACHA20_POLY1305_SHA256",
            kx: None,
            auth: None,
            enc: "CHACHA20",
            bits: 256,
            hash: "SHA256",
        },
        CipherSuite::TLS_ECDHE_ECDSA_WITH_AES_256_GCM_SHA384 => SuiteInfo {
            openssl_name: "ECDHE-ECDSA-AES256-GCM-SHA384",
            iana_name: "TLS_ECDHE_ECDSA_WITH_AES_256_GCM_SHA384",
            kx: Some("ECDHE"),
            auth: Some("ECDSA"),
            enc: "AESGCM",
            bits: 256,
            hash: "SHA384",
        },
        CipherSuite::TLS_ECDHE_ECDSA_WITH_AES_128_GCM_SHA256 => SuiteInfo {
            openssl_name: "ECDHE-ECDSA-AES128-GCM-SHA256",
            iana_name: "TLS_ECDHE_ECDSA_WITH_AES_128_GCM_SHA256",
            kx: Some("ECDHE"),
            auth: Some("ECDSA"),
            enc: "AESGCM",
            bits: 128,
            hash: "SHA256",
        },
        CipherSuite::TLS_ECDHE_ECDSA_WITH_CHACHA20_POLY1305_SHA256 => SuiteInfo {
            openssl_name: "ECDHE-ECDSA-CHACHA20-POLY1305",
            iana_name: "TLS_ECDHE_ECDSA_WITH_CHACHA20_POLY1305_SHA256",
            kx: Some("ECDHE"),
            auth: Some("ECDSA"),
            enc: "CHACHA20",
            bits: 256,
            hash: "SHA256",
        },
        CipherSuite::TLS_ECDHE_RSA_WITH_AES_256_GCM_SHA384 => SuiteInfo {
            openssl_name: "ECDHE-RSA-AES256-GCM-SHA384",
            iana_name: "TLS_ECDHE_RSA_WITH_AES_256_GCM_SHA384",
            kx: Some("ECDHE"),
            auth: Some("RSA"),
            enc: "AESGCM",
            bits: 256,
            hash: "SHA384",
        },
        CipherSuite::TLS_ECDHE_RSA_WITH_AES_128_GCM_SHA256 => SuiteInfo {
            openssl_name: "ECDHE-RSA-AES128-GCM-SHA256",
            iana_name: "TLS_ECDHE_RSA_WITH_AES_128_GCM_SHA256",
            kx: Some("ECDHE"),
            auth: Some("RSA"),
            enc: "AESGCM",
            bits: 128,
            hash: "SHA256",
        },
        CipherSuite::TLS_ECDHE_RSA_WITH_CHACHA20_POLY1305_SHA256 => SuiteInfo {
            openssl_name: "ECDHE-RSA-CHACHA20-POLY1305",
            iana_name: "TLS_ECDHE_RSA_WITH_CHACHA20_POLY1305_SHA256",
            kx: Some("ECDHE"),
            auth: Some("RSA"),
            enc: "CHACHA20",
            bits: 256,
            hash: "SHA256",
        },
        _ => return None,
    };
    Some(info)
}

/// Whether a single keyword (no `+` combination) selects `suite`.
fn keyword_matches(keyword: &str, suite: &SupportedCipherSuite) -> bool {
    let is_tls13 = suite.version().version == ProtocolVersion::TLSv1_3;
    match keyword {
        // Every suite rustls ships is an AEAD suite with at least 128-bit keys.
        "ALL" | "DEFAULT" | "HIGH" | "AEAD" | "COMPLEMENTOFDEFAULT" => return true,
        "TLSv1.2" => return !is_tls13,
        "TLSv1.3" => return is_tls13,
        _ => {}
    }

    let Some(info) = describe(suite.suite()) else {
        return keyword == format!("{:?}", suite.suite());
    };

    if keyword.eq_ignore_ascii_case(info.openssl_name) || keyword.eq_ignore_ascii_case(info.iana_name) {
        return true;
    }

    match keyword {
        "ECDHE" | "EECDH" | "kECDHE" | "kEECDH" => info.kx == Some("ECDHE"),
        "RSA" | "aRSA" => info.auth == Some("RSA"),
        "ECDSA" | "aECDSA" => info.auth == Some("ECDSA"),
        "AES" => info.enc == "AESGCM",
        "AESGCM" => info.enc == "AESGCM",
        "AES128" => info.enc == "AESGCM" && info.bits == 128,
        "AES256" => info.enc == "AESGCM" && info.bits == 256,
        "CHACHA20" => info.enc == "CHACHA20",
        "SHA256" => info.hash == "SHA256",
        "SHA384" => info.hash == "SHA384",
        _ => false,
    }
}

/// Whether a token body (possibly `A+B+C`) selects `suite`.
fn selector_matches(selector: &str, suite: &SupportedCipherSuite) -> bool {
    selector
        .split('+')
        .filter(|part| !part.is_empty())
        .all(|part| keyword_matches(part, suite))
}

/// Evaluate `policy` against `available`, returning the allowed suites in
/// preference order.
pub fn apply_cipher_policy(
    policy: &str,
    available: &[SupportedCipherSuite],
) -> Result<Vec<SupportedCipherSuite>, CipherPolicyError> {
    let mut selected: Vec<SupportedCipherSuite> = Vec::new();
    let mut killed: Vec<CipherSuite> = Vec::new();

    let tokens = policy
        .split(|c: char| c == ':' || c == ',' || c.is_whitespace())
        .filter(|t| !t.is_empty());

    for token in tokens {
        if token.starts_with('@') {
            continue;
        }

        if let Some(selector) = token.strip_prefix('!') {
            selected.retain(|s| !selector_matches(selector, s));
            for suite in available.iter().filter(|s| selector_matches(selector, s)) {
                killed.push(suite.suite());
            }
        } else if let Some(selector) = token.strip_prefix('-') {
            selected.retain(|s| !selector_matches(selector, s));
        } else if let Some(selector) = token.strip_prefix('+') {
            let (moved, kept): (Vec<_>, Vec<_>) =
                selected.into_iter().partition(|s| selector_matches(selector, s));
            selected = kept;
            selected.extend(moved);
        } else {
            let mut unknown = true;
            for suite in available.iter().filter(|s| selector_matches(token, s)) {
                unknown = false;
                let id = suite.suite();
                if !killed.contains(&id) && !selected.iter().any(|s| s.suite() == id) {
                    selected.push(*suite);
                }
            }
            if unknown {
                tracing::debug!(token = %token, "Cipher policy token matches no supported suite");
            }
        }
    }

    if selected.is_empty() {
        return Err(CipherPolicyError::NoSuites(policy.to_string()));
    }
    Ok(selected)
}

/// The OpenSSL-style name of a suite, for logging.
pub fn suite_name(suite: CipherSuite) -> String {
    describe(suite)
        .map(|info| info.openssl_name.to_string())
        .unwrap_or_else(|| format!("{:?}", suite))
}
