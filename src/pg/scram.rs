//! SCRAM-SHA-256 client (RFC 5802 / RFC 7677) for PostgreSQL SASL auth.
//!
//! [`ScramSession`] walks three steps: `client_first`, `client_final` (answers
//! the server challenge) and `verify_server` (checks the server signature).
//! Channel binding is not offered (`n,,` header).

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use hmac::{Hmac, Mac};
use rand::Rng;
use sha2::{Digest, Sha256};

use super::error::PgError;

type HmacSha256 = Hmac<Sha256>;

pub const MECHANISM: &str = "SCRAM-SHA-256";

/// GS2 header without channel binding, base64 encoded as sent in `c=`.
const GS2_HEADER_B64: &str = "biws";

enum Stage {
    /// client-first sent; waiting for the server challenge.
    Started,
    /// client-final sent; holds the signature the server must present.
    Challenged { expected_server_signature: [u8; 32] },
    Done,
}

/// One SCRAM-SHA-256 authentication exchange.
pub struct ScramSession {
    password: String,
    client_first_bare: String,
    client_nonce: String,
    stage: Stage,
}

impl ScramSession {
    pub fn new(user: &str, password: &str) -> Self {
        let nonce: [u8; 18] = rand::thread_rng().gen();
        Self::with_nonce(user, password, &BASE64.encode(nonce))
    }

    fn with_nonce(user: &str, password: &str, nonce: &str) -> Self {
        Self {
            password: password.to_string(),
            client_first_bare: format!("n={},r={}", escape_username(user), nonce),
            client_nonce: nonce.to_string(),
            stage: Stage::Started,
        }
    }

    /// `n,,n=<user>,r=<client nonce>`
    pub fn client_first(&self) -> Vec<u8> {
        format!("n,,{}", self.client_first_bare).into_bytes()
    }

    /// Answer `r=<nonce>,s=<salt>,i=<iterations>` with the client proof.
    pub fn client_final(&mut self, server_first: &[u8]) -> Result<Vec<u8>, PgError> {
        if !matches!(self.stage, Stage::Started) {
            return Err(auth_error("unexpected server-first message"));
        }

        let server_first = std::str::from_utf8(server_first)
            .map_err(|_| auth_error("server-first message is not UTF-8"))?;

        let mut nonce = None;
        let mut salt = None;
        let mut iterations = None;
        for attr in server_first.split(',') {
            match attr.split_once('=') {
                Some(("r", v)) => nonce = Some(v),
                Some(("s", v)) => {
                    salt = Some(BASE64.decode(v).map_err(|_| auth_error("invalid salt"))?)
                }
                Some(("i", v)) => {
                    iterations = Some(
                        v.parse::<u32>()
                            .map_err(|_| auth_error("invalid iteration count"))?,
                    )
                }
                _ => {}
            }
        }

        let nonce = nonce.ok_or_else(|| auth_error("server nonce missing"))?;
        let salt = salt.ok_or_else(|| auth_error("salt missing"))?;
        let iterations = iterations.ok_or_else(|| auth_error("iteration count missing"))?;

        if nonce.len() <= self.client_nonce.len() || !nonce.starts_with(&self.client_nonce) {
            return Err(auth_error("server nonce does not extend the client nonce"));
        }
        if iterations == 0 {
            return Err(auth_error("iteration count must be positive"));
        }

        let without_proof = format!("c={},r={}", GS2_HEADER_B64, nonce);
        let auth_message = format!(
            "{},{},{}",
            self.client_first_bare, server_first, without_proof
        );

        let salted = salted_password(&self.password, &salt, iterations)?;
        let client_key = hmac(&salted, b"Client Key")?;
        let stored_key: [u8; 32] = Sha256::digest(client_key).into();
        let client_signature = hmac(&stored_key, auth_message.as_bytes())?;

        let mut proof = client_key;
        proof
            .iter_mut()
            .zip(client_signature.iter())
            .for_each(|(p, s)| *p ^= s);

        let server_key = hmac(&salted, b"Server Key")?;
        self.stage = Stage::Challenged {
            expected_server_signature: hmac(&server_key, auth_message.as_bytes())?,
        };

        Ok(format!("{},p={}", without_proof, BASE64.encode(proof)).into_bytes())
    }

    /// Check `v=<server signature>`.
    pub fn verify_server(&mut self, server_final: &[u8]) -> Result<(), PgError> {
        let expected = match self.stage {
            Stage::Challenged {
                expected_server_signature,
            } => expected_server_signature,
            _ => return Err(auth_error("unexpected server-final message")),
        };

        let server_final = std::str::from_utf8(server_final)
            .map_err(|_| auth_error("server-final message is not UTF-8"))?;

        if let Some(err) = server_final.strip_prefix("e=") {
            return Err(auth_error(&format!("server rejected proof: {}", err)));
        }

        let signature = server_final
            .strip_prefix("v=")
            .and_then(|v| BASE64.decode(v).ok())
            .ok_or_else(|| auth_error("malformed server signature"))?;

        if signature.as_slice() != expected.as_slice() {
            return Err(auth_error("server signature mismatch"));
        }

        self.stage = Stage::Done;
        Ok(())
    }
}

fn auth_error(msg: &str) -> PgError {
    PgError::Auth(format!("SCRAM: {}", msg))
}

/// `Hi()`: PBKDF2 with HMAC-SHA-256.
fn salted_password(password: &str, salt: &[u8], iterations: u32) -> Result<[u8; 32], PgError> {
    let mut out = [0u8; 32];
    pbkdf2::pbkdf2::<HmacSha256>(password.as_bytes(), salt, iterations, &mut out)
        .map_err(|_| auth_error("key derivation failed"))?;
    Ok(out)
}

fn hmac(key: &[u8], data: &[u8]) -> Result<[u8; 32], PgError> {
    let mut mac =
        <HmacSha256 as Mac>::new_from_slice(key).map_err(|_| auth_error("invalid HMAC key"))?;
    mac.update(data);
    Ok(mac.finalize().into_bytes().into())
}

/// `=` and `,` are reserved in SCRAM attribute values.
fn escape_username(user: &str) -> String {
    user.replace('=', "=3D").replace(',', "=2C")
}

#[cfg(test)]
mod tests {
    use super::*;

    // RFC 7677, section 3.
    const NONCE: &str = "rOprNGfwEbeRWgbNEkqO";
    const SERVER_FIRST: &str =
        "r=rOprNGfwEbeRWgbNEkqO%hvYDpWUa2RaTCAfuxFIlj)hNlF$k0,s=W22ZaJ0SNY7soEsUEjb6gQ==,i=4096";
    const CLIENT_FINAL: &str = "c=biws,r=rOprNGfwEbeRWgbNEkqO%hvYDpWUa2RaTCAfuxFIlj)hNlF$k0,p=dHzbZapWIk4jUhN+Ute9ytag9zjfMHgsqmmiz7AndVQ=";
    const SERVER_FINAL: &str = "v=6rriTRBi23WpRR/wtup+mMhUZUn/dB5nLTJRsjl95G4=";

    #[test]
    fn test_rfc7677_exchange() {
        let mut session = ScramSession::with_nonce("user", "pencil", NONCE);
        assert_eq!(session.client_first(), b"n,,n=user,r=rOprNGfwEbeRWgbNEkqO");

        let client_final = session.client_final(SERVER_FIRST.as_bytes()).unwrap();
        assert_eq!(String::from_utf8(client_final).unwrap(), CLIENT_FINAL);

        session.verify_server(SERVER_FINAL.as_bytes()).unwrap();
    }

    #[test]
    fn test_wrong_server_signature() {
        let mut session = ScramSession::with_nonce("user", "pencil", NONCE);
        session.client_final(SERVER_FIRST.as_bytes()).unwrap();
        let forged = format!("v={}", BASE64.encode([0u8; 32]));
        assert!(session.verify_server(forged.as_bytes()).is_err());
    }

    #[test]
    fn test_nonce_must_extend_client_nonce() {
        let mut session = ScramSession::with_nonce("user", "pencil", NONCE);
        let bad = "r=someoneelse,s=W22ZaJ0SNY7soEsUEjb6gQ==,i=4096";
        assert!(session.client_final(bad.as_bytes()).is_err());

        let mut session = ScramSession::with_nonce("user", "pencil", NONCE);
        let echoed = format!("r={},s=W22ZaJ0SNY7soEsUEjb6gQ==,i=4096", NONCE);
        assert!(session.client_final(echoed.as_bytes()).is_err());
    }

    #[test]
    fn test_out_of_order_steps() {
        let mut session = ScramSession::new("user", "pencil");
        assert!(session.verify_server(SERVER_FINAL.as_bytes()).is_err());
        assert!(session.client_first().starts_with(b"n,,n=user,r="));
    }

    #[test]
    fn test_username_escaping() {
        assert_eq!(escape_username("a=b,c"), "a=3Db=2Cc");
    }
}
