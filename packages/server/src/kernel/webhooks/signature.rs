//! Webhook signature verification.
//!
//! Every platform signs the raw body with HMAC-SHA256 over the store's
//! webhook secret; they differ only in header name and digest encoding.
//! Verification is constant-time via `Mac::verify_slice`.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use hmac::{Hmac, Mac};
use sha2::Sha256;

use crate::domains::stores::Platform;

type HmacSha256 = Hmac<Sha256>;

/// How a platform encodes its HMAC digest header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DigestEncoding {
    Base64,
    Hex,
    /// Hex with a `sha256=` prefix.
    PrefixedHex,
}

/// The signature header a platform sends, and how to read it.
pub fn signature_header(platform: Platform) -> (&'static str, DigestEncoding) {
    match platform {
        Platform::Shopify => ("x-shopify-hmac-sha256", DigestEncoding::Base64),
        Platform::Printify => ("x-printify-signature", DigestEncoding::PrefixedHex),
        Platform::Etsy => ("x-etsy-signature", DigestEncoding::Hex),
        Platform::Gumroad => ("x-gumroad-signature", DigestEncoding::Hex),
        Platform::AmazonSpApi => ("x-amz-signature", DigestEncoding::Hex),
        Platform::AmazonKdp => ("x-amz-signature", DigestEncoding::Hex),
    }
}

/// Verify a raw body against the platform's signature header value.
///
/// The comparison runs through the Mac verifier, which is constant-time;
/// only encoding errors short-circuit.
pub fn verify(secret: &str, body: &[u8], header_value: &str, encoding: DigestEncoding) -> bool {
    let provided = match decode_digest(header_value, encoding) {
        Some(bytes) => bytes,
        None => return false,
    };

    let mut mac = match HmacSha256::new_from_slice(secret.as_bytes()) {
        Ok(mac) => mac,
        Err(_) => return false,
    };
    mac.update(body);
    mac.verify_slice(&provided).is_ok()
}

/// Compute the signature a platform would send, for tests and outbound
/// verification tooling.
pub fn sign(secret: &str, body: &[u8], encoding: DigestEncoding) -> String {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .expect("HMAC accepts any key length");
    mac.update(body);
    let digest = mac.finalize().into_bytes();
    match encoding {
        DigestEncoding::Base64 => BASE64.encode(digest),
        DigestEncoding::Hex => hex::encode(digest),
        DigestEncoding::PrefixedHex => format!("sha256={}", hex::encode(digest)),
    }
}

fn decode_digest(header_value: &str, encoding: DigestEncoding) -> Option<Vec<u8>> {
    match encoding {
        DigestEncoding::Base64 => BASE64.decode(header_value.trim()).ok(),
        DigestEncoding::Hex => hex::decode(header_value.trim()).ok(),
        DigestEncoding::PrefixedHex => {
            let stripped = header_value.trim().strip_prefix("sha256=")?;
            hex::decode(stripped).ok()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SECRET: &str = "whsec_test";
    const BODY: &[u8] = br#"{"id":123,"topic":"orders/create"}"#;

    #[test]
    fn valid_base64_signature_verifies() {
        let header = sign(SECRET, BODY, DigestEncoding::Base64);
        assert!(verify(SECRET, BODY, &header, DigestEncoding::Base64));
    }

    #[test]
    fn prefixed_hex_signature_verifies() {
        let header = sign(SECRET, BODY, DigestEncoding::PrefixedHex);
        assert!(header.starts_with("sha256="));
        assert!(verify(SECRET, BODY, &header, DigestEncoding::PrefixedHex));
    }

    #[test]
    fn tampered_body_fails() {
        let header = sign(SECRET, BODY, DigestEncoding::Hex);
        assert!(!verify(SECRET, b"{}", &header, DigestEncoding::Hex));
    }

    #[test]
    fn wrong_secret_fails() {
        let header = sign(SECRET, BODY, DigestEncoding::Base64);
        assert!(!verify("other_secret", BODY, &header, DigestEncoding::Base64));
    }

    #[test]
    fn malformed_digest_fails_closed() {
        assert!(!verify(SECRET, BODY, "not base64 at all!!!", DigestEncoding::Base64));
        assert!(!verify(SECRET, BODY, "zzzz", DigestEncoding::Hex));
        assert!(!verify(SECRET, BODY, "missing_prefix", DigestEncoding::PrefixedHex));
    }

    #[test]
    fn each_platform_declares_a_header() {
        let (header, _) = signature_header(Platform::Shopify);
        assert_eq!(header, "x-shopify-hmac-sha256");
        let (header, encoding) = signature_header(Platform::Printify);
        assert_eq!(header, "x-printify-signature");
        assert_eq!(encoding, DigestEncoding::PrefixedHex);
    }
}
