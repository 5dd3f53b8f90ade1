//! Auth token + one-shot pairing codes.
//!
//! The server holds one bearer token. New clients pair by presenting a
//! short-lived pairing code minted by an already-authenticated caller;
//! a successful claim consumes the code and returns the token. Failed
//! claims are counted and lock pairing out entirely for a cooldown.

use std::collections::HashMap;
use std::io::Write;
use std::path::Path;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use ring::rand::{SecureRandom, SystemRandom};
use thiserror::Error;
use tracing::{info, warn};

const PAIRING_TTL: Duration = Duration::from_secs(5 * 60);
const MAX_FAILED_ATTEMPTS: u32 = 5;
const LOCKOUT: Duration = Duration::from_secs(5 * 60);
const CODE_LEN: usize = 8;
/// No 0/O or 1/I — codes get read out loud.
const CODE_CHARSET: &[u8] = b"ABCDEFGHJKLMNPQRSTUVWXYZ23456789";

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum PairError {
    #[error("invalid_code")]
    InvalidCode,

    #[error("expired")]
    Expired,

    #[error("locked")]
    Locked,
}

struct PairingState {
    codes: HashMap<String, Instant>,
    failed_attempts: u32,
    locked_until: Option<Instant>,
}

pub struct AuthService {
    token: String,
    allow_query_token: bool,
    pairing: Mutex<PairingState>,
}

impl AuthService {
    pub fn new(token: String) -> Self {
        Self {
            token,
            allow_query_token: std::env::var("FYP_ALLOW_QUERY_TOKEN_AUTH").as_deref() == Ok("1"),
            pairing: Mutex::new(PairingState {
                codes: HashMap::new(),
                failed_attempts: 0,
                locked_until: None,
            }),
        }
    }

    pub fn allow_query_token(&self) -> bool {
        self.allow_query_token
    }

    /// Constant-time token check.
    pub fn verify_token(&self, presented: &str) -> bool {
        ring::constant_time::verify_slices_are_equal(
            self.token.as_bytes(),
            presented.as_bytes(),
        )
        .is_ok()
    }

    /// Mint a one-shot pairing code with a 5 minute TTL.
    pub fn create_pairing_code(&self) -> String {
        let rng = SystemRandom::new();
        let mut bytes = [0u8; CODE_LEN];
        rng.fill(&mut bytes).expect("rng failure");
        let code: String = bytes
            .iter()
            .map(|b| CODE_CHARSET[*b as usize % CODE_CHARSET.len()] as char)
            .collect();

        let mut state = self.pairing.lock().expect("pairing lock poisoned");
        state.codes.insert(code.clone(), Instant::now());
        info!(
            component = "pairing",
            event = "pairing.code_created",
            "Pairing code created"
        );
        code
    }

    /// Exchange a pairing code for the bearer token. Consumes the code.
    pub fn claim(&self, code: &str) -> Result<String, PairError> {
        let mut state = self.pairing.lock().expect("pairing lock poisoned");
        let now = Instant::now();

        if let Some(until) = state.locked_until {
            if now < until {
                return Err(PairError::Locked);
            }
            state.locked_until = None;
            state.failed_attempts = 0;
        }

        // Expire stale codes on every claim
        state.codes.retain(|_, created| now - *created <= PAIRING_TTL);

        let normalized = code.trim().to_ascii_uppercase();
        match state.codes.remove(&normalized) {
            Some(created) if now - created <= PAIRING_TTL => {
                state.failed_attempts = 0;
                Ok(self.token.clone())
            }
            Some(_) => Err(PairError::Expired),
            None => {
                state.failed_attempts += 1;
                if state.failed_attempts >= MAX_FAILED_ATTEMPTS {
                    state.locked_until = Some(now + LOCKOUT);
                    warn!(
                        component = "pairing",
                        event = "pairing.locked",
                        attempts = state.failed_attempts,
                        "Pairing locked after repeated bad codes"
                    );
                    return Err(PairError::Locked);
                }
                Err(PairError::InvalidCode)
            }
        }
    }
}

/// Read the token file, or generate one and write it with 0600 perms.
pub fn load_or_generate_token(path: &Path) -> anyhow::Result<String> {
    if let Ok(existing) = std::fs::read_to_string(path) {
        let trimmed = existing.trim();
        if !trimmed.is_empty() {
            return Ok(trimmed.to_string());
        }
    }

    let rng = SystemRandom::new();
    let mut bytes = [0u8; 32];
    rng.fill(&mut bytes)
        .map_err(|_| anyhow::anyhow!("rng failure"))?;
    let token = URL_SAFE_NO_PAD.encode(bytes);

    let mut options = std::fs::OpenOptions::new();
    options.write(true).create(true).truncate(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }
    let mut file = options.open(path)?;
    file.write_all(token.as_bytes())?;

    info!(
        component = "pairing",
        event = "pairing.token_generated",
        path = %path.display(),
        "Auth token generated"
    );
    Ok(token)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn claim_roundtrip_consumes_code() {
        let auth = AuthService::new("tok".into());
        let code = auth.create_pairing_code();
        assert_eq!(code.len(), CODE_LEN);

        assert_eq!(auth.claim(&code), Ok("tok".to_string()));
        // One-shot: second claim of the same code fails
        assert_eq!(auth.claim(&code), Err(PairError::InvalidCode));
    }

    #[test]
    fn claim_is_case_insensitive() {
        let auth = AuthService::new("tok".into());
        let code = auth.create_pairing_code();
        assert!(auth.claim(&code.to_ascii_lowercase()).is_ok());
    }

    #[test]
    fn repeated_bad_codes_lock_pairing() {
        let auth = AuthService::new("tok".into());
        for _ in 0..MAX_FAILED_ATTEMPTS - 1 {
            assert_eq!(auth.claim("WRONG123"), Err(PairError::InvalidCode));
        }
        assert_eq!(auth.claim("WRONG123"), Err(PairError::Locked));

        // Even a valid code is refused while locked
        let code = auth.create_pairing_code();
        assert_eq!(auth.claim(&code), Err(PairError::Locked));
    }

    #[test]
    fn verify_token_matches_exactly() {
        let auth = AuthService::new("secret-token".into());
        assert!(auth.verify_token("secret-token"));
        assert!(!auth.verify_token("secret-troken"));
        assert!(!auth.verify_token(""));
    }

    #[test]
    fn token_file_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("auth-token");

        let first = load_or_generate_token(&path).unwrap();
        assert!(!first.is_empty());
        let second = load_or_generate_token(&path).unwrap();
        assert_eq!(first, second);
    }
}
