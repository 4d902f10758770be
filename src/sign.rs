//! Request signing for the Tuya-style cloud API.
//!
//! Every outgoing request carries an HMAC-SHA256 signature over a canonical
//! string-to-sign. The format must match the platform byte-for-byte or the
//! cloud rejects the call with a signature error:
//!
//! ```text
//! string_to_sign = METHOD \n sha256_hex(body) \n <empty headers line> \n path+query
//! signing_input  = access_id + access_token + t + string_to_sign
//! sign           = UPPERHEX(HMAC-SHA256(secret_key, signing_input))
//! ```
//!
//! Token-acquisition requests sign themselves with an empty access token.

use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256};

type HmacSha256 = Hmac<Sha256>;

/// Value of the `sign_method` header on every signed request.
pub const SIGN_METHOD: &str = "HMAC-SHA256";

/// Current time as Unix epoch milliseconds, rendered the way the platform
/// expects the `t` header (decimal string).
pub fn now_millis() -> String {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis()
        .to_string()
}

/// Header set attached to a signed request.
#[derive(Debug, Clone)]
pub struct SignedHeaders {
    pub client_id: String,
    pub access_token: Option<String>,
    pub t: String,
    pub sign: String,
}

/// Holds the cloud credentials and produces request signatures.
///
/// `sign` is a pure function of its inputs: no I/O, no clock access — the
/// caller supplies the timestamp.
#[derive(Clone)]
pub struct RequestSigner {
    access_id: String,
    secret_key: String,
}

impl RequestSigner {
    pub fn new(access_id: impl Into<String>, secret_key: impl Into<String>) -> Self {
        Self {
            access_id: access_id.into(),
            secret_key: secret_key.into(),
        }
    }

    /// Compute the uppercase hex signature for one request.
    ///
    /// `body` is the exact JSON string that will be sent on the wire (the
    /// hash covers the serialized bytes, so serialize once and sign that).
    /// `query` includes the leading `?` when present, empty otherwise.
    pub fn sign(
        &self,
        method: &str,
        path: &str,
        query: &str,
        body: Option<&str>,
        access_token: Option<&str>,
        t: &str,
    ) -> String {
        let body_hash = hex::encode(Sha256::digest(body.unwrap_or("").as_bytes()));
        // The third line is a signed-headers field the platform defines but
        // this client never populates; it is always empty.
        let string_to_sign = format!("{method}\n{body_hash}\n\n{path}{query}");
        let signing_input = format!(
            "{}{}{t}{string_to_sign}",
            self.access_id,
            access_token.unwrap_or("")
        );

        let mut mac = HmacSha256::new_from_slice(self.secret_key.as_bytes())
            .expect("HMAC-SHA256 accepts keys of any length");
        mac.update(signing_input.as_bytes());
        hex::encode(mac.finalize().into_bytes()).to_uppercase()
    }

    /// Build the full signed header set for one request.
    pub fn headers(
        &self,
        method: &str,
        path: &str,
        query: &str,
        body: Option<&str>,
        access_token: Option<&str>,
        t: &str,
    ) -> SignedHeaders {
        SignedHeaders {
            client_id: self.access_id.clone(),
            access_token: access_token.map(str::to_owned),
            t: t.to_string(),
            sign: self.sign(method, path, query, body, access_token, t),
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================
