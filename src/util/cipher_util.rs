use chrono::{DateTime, Duration, TimeZone, Utc};
use derive_more::derive::Display;
use hmac::digest::InvalidLength;
use hmac::{Hmac, Mac};
use rand::rngs::OsRng;
use rand::RngCore;
use sha2::{Digest, Sha256};
use std::convert::TryInto;

use crate::models::{ProblemId, TeamId};

#[derive(Debug, Clone, PartialEq, Eq, Display)]
pub enum DecodeTokenError {
    #[display("Expired {} seconds ago.", _0.num_seconds())]
    Expired(Duration),
    #[display("Token signature does not match.")]
    InvalidSignature,
    #[display("Token was issued for another purpose.")]
    WrongKind,
    #[display("Token should be two hexadecimal parts joined by a dot.")]
    InvalidFormat,
}

type HmacSha256 = Hmac<Sha256>;

const KIND_TEAM: u8 = 1;
const KIND_BUNDLE: u8 = 2;
// kind + team id + expiry
const HEADER_LEN: usize = 1 + 4 + 8;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TeamClaims {
    pub team_id: TeamId,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BundleClaims {
    pub team_id: TeamId,
    pub instance: String,
    pub expires_at: DateTime<Utc>,
}

/// Signs and opens the bearer tokens the platform trusts. Issuing team tokens is the
/// login service's job; this side only needs the shared secret to check them.
pub struct TokenVerifier {
    keyed: HmacSha256,
}

impl TokenVerifier {
    pub fn new(secret: &str) -> Result<Self, InvalidLength> {
        Ok(Self {
            keyed: HmacSha256::new_from_slice(secret.as_bytes())?,
        })
    }

    fn mac(&self, payload: &[u8]) -> HmacSha256 {
        let mut mac = self.keyed.clone();
        mac.update(payload);
        mac
    }

    fn seal(&self, kind: u8, team_id: TeamId, expires_at: DateTime<Utc>, extra: &[u8]) -> String {
        let mut payload = Vec::with_capacity(HEADER_LEN + extra.len());
        payload.push(kind);
        payload.extend_from_slice(&team_id.to_be_bytes());
        payload.extend_from_slice(&expires_at.timestamp().to_be_bytes());
        payload.extend_from_slice(extra);

        format!(
            "{}.{}",
            hex::encode(&payload),
            hex::encode(self.mac(&payload).finalize().into_bytes())
        )
    }

    fn open(
        &self,
        kind: u8,
        token: &str,
    ) -> Result<(TeamId, DateTime<Utc>, Vec<u8>), DecodeTokenError> {
        let (payload_hex, signature_hex) =
            token.split_once('.').ok_or(DecodeTokenError::InvalidFormat)?;
        let payload = hex::decode(payload_hex).map_err(|_| DecodeTokenError::InvalidFormat)?;
        let mut received = [0u8; 32];
        hex::decode_to_slice(signature_hex, &mut received)
            .map_err(|_| DecodeTokenError::InvalidFormat)?;

        if payload.len() < HEADER_LEN {
            return Err(DecodeTokenError::InvalidFormat);
        }
        self.mac(&payload)
            .verify_slice(&received)
            .map_err(|_| DecodeTokenError::InvalidSignature)?;
        if payload[0] != kind {
            return Err(DecodeTokenError::WrongKind);
        }

        let team_id = i32::from_be_bytes(
            payload[1..5]
                .try_into()
                .map_err(|_| DecodeTokenError::InvalidFormat)?,
        );
        let expiry = i64::from_be_bytes(
            payload[5..HEADER_LEN]
                .try_into()
                .map_err(|_| DecodeTokenError::InvalidFormat)?,
        );
        let expires_at = Utc
            .timestamp_opt(expiry, 0)
            .single()
            .ok_or(DecodeTokenError::InvalidFormat)?;

        let now = Utc::now();
        if now > expires_at {
            return Err(DecodeTokenError::Expired(now - expires_at));
        }

        Ok((team_id, expires_at, payload[HEADER_LEN..].to_vec()))
    }

    pub fn issue_team(&self, team_id: TeamId, valid_for: Duration) -> String {
        self.seal(KIND_TEAM, team_id, Utc::now() + valid_for, &[])
    }

    pub fn verify_team(&self, token: &str) -> Result<TeamClaims, DecodeTokenError> {
        let (team_id, expires_at, _) = self.open(KIND_TEAM, token)?;
        Ok(TeamClaims {
            team_id,
            expires_at,
        })
    }

    /// Access token for a file-bundle challenge, scoped to one team and one instance.
    pub fn issue_bundle(&self, team_id: TeamId, instance: &str, valid_for: Duration) -> String {
        self.seal(
            KIND_BUNDLE,
            team_id,
            Utc::now() + valid_for,
            instance.as_bytes(),
        )
    }

    pub fn verify_bundle(&self, token: &str) -> Result<BundleClaims, DecodeTokenError> {
        let (team_id, expires_at, extra) = self.open(KIND_BUNDLE, token)?;
        let instance = String::from_utf8(extra).map_err(|_| DecodeTokenError::InvalidFormat)?;
        Ok(BundleClaims {
            team_id,
            instance,
            expires_at,
        })
    }
}

pub fn get_salt<const N: usize>() -> [u8; N] {
    let mut salt = [0u8; N];
    OsRng.fill_bytes(&mut salt);
    salt
}

/// `PREFIX{32 hex digits}`, fresh for every launch.
pub fn gen_flag(prefix: &str) -> String {
    format!("{prefix}{{{}}}", hex::encode(get_salt::<16>()))
}

pub fn gen_container_name(owner: &str, problem_id: ProblemId) -> String {
    format!("{owner}_{problem_id}_{}", uuid::Uuid::new_v4().simple())
}

pub fn sha256_hex(input: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(input);
    hex::encode(hasher.finalize().as_slice())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flags_are_prefixed_and_distinct() {
        let a = gen_flag("C0D");
        let b = gen_flag("C0D");
        assert!(a.starts_with("C0D{") && a.ends_with('}'));
        assert_eq!(a.len(), "C0D{}".len() + 32);
        assert_ne!(a, b);
    }

    #[test]
    fn container_names_embed_owner_and_problem() {
        let name = gen_container_name("7", 3);
        assert!(name.starts_with("7_3_"));
        assert_ne!(name, gen_container_name("7", 3));
    }

    #[test]
    fn team_token_round_trip() {
        let verifier = TokenVerifier::new("secret").unwrap();
        let token = verifier.issue_team(42, Duration::hours(1));
        let claims = verifier.verify_team(&token).unwrap();
        assert_eq!(claims.team_id, 42);
    }

    #[test]
    fn tampered_or_foreign_tokens_are_rejected() {
        let verifier = TokenVerifier::new("secret").unwrap();
        let token = verifier.issue_team(42, Duration::hours(1));

        let other = TokenVerifier::new("other secret").unwrap();
        assert_eq!(
            other.verify_team(&token),
            Err(DecodeTokenError::InvalidSignature)
        );

        let (payload, signature) = token.split_once('.').unwrap();
        let mut bytes = hex::decode(payload).unwrap();
        bytes[4] ^= 1;
        let forged = format!("{}.{signature}", hex::encode(bytes));
        assert_eq!(
            verifier.verify_team(&forged),
            Err(DecodeTokenError::InvalidSignature)
        );

        assert_eq!(
            verifier.verify_team("not-a-token"),
            Err(DecodeTokenError::InvalidFormat)
        );
    }

    #[test]
    fn signatures_are_hmac_sha256() {
        // RFC 4231, test case 2
        let verifier = TokenVerifier::new("Jefe").unwrap();
        let tag = verifier
            .mac(b"what do ya want for nothing?")
            .finalize()
            .into_bytes();
        assert_eq!(
            hex::encode(tag),
            "5bdcc146bf60754e6a042426089575c75a003f089d2739839dec58b964ec3843"
        );
    }

    #[test]
    fn expired_tokens_are_rejected() {
        let verifier = TokenVerifier::new("secret").unwrap();
        let token = verifier.issue_team(1, Duration::seconds(-120));
        assert!(matches!(
            verifier.verify_team(&token),
            Err(DecodeTokenError::Expired(_))
        ));
    }

    #[test]
    fn bundle_tokens_are_scoped() {
        let verifier = TokenVerifier::new("secret").unwrap();
        let token = verifier.issue_bundle(5, "5_9_abc", Duration::hours(1));
        let claims = verifier.verify_bundle(&token).unwrap();
        assert_eq!(claims.team_id, 5);
        assert_eq!(claims.instance, "5_9_abc");

        // a bundle token is not a login
        assert_eq!(verifier.verify_team(&token), Err(DecodeTokenError::WrongKind));
    }

    #[test]
    fn sha256_hex_matches_known_digest() {
        assert_eq!(
            sha256_hex("abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }
}
