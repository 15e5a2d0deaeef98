//! Client cookie handling
//!
//! The cookie is the client's opaque handle: its payload carries the
//! computer id as NUL-padded UTF-8 and nothing else is validated. The
//! binding trait is the seam where a time-bound MAC can land later without
//! touching the sync layer.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Cookies expire five days after issue.
pub const COOKIE_EXPIRATION_DAYS: i64 = 5;

/// Opaque client cookie.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cookie {
    pub expiration: DateTime<Utc>,
    pub encrypted_data: Vec<u8>,
}

/// Encode/decode of the cookie payload.
pub trait CookieBinding: Send + Sync {
    fn issue(&self, computer_id: &str, now: DateTime<Utc>) -> Cookie;

    /// Computer id carried by the cookie, with the terminating NULs
    /// trimmed.
    fn computer_id(&self, cookie: &Cookie) -> String;
}

/// The current binding: payload bytes are the computer id verbatim.
#[derive(Debug, Default, Clone, Copy)]
pub struct OpaqueBinding;

impl CookieBinding for OpaqueBinding {
    fn issue(&self, computer_id: &str, now: DateTime<Utc>) -> Cookie {
        Cookie {
            expiration: now + Duration::days(COOKIE_EXPIRATION_DAYS),
            encrypted_data: computer_id.as_bytes().to_vec(),
        }
    }

    fn computer_id(&self, cookie: &Cookie) -> String {
        String::from_utf8_lossy(&cookie.encrypted_data)
            .trim_end_matches('\0')
            .to_string()
    }
}

/// Issue a fresh cookie, keeping the computer id of the old one when the
/// client presented it, otherwise minting a new id.
pub fn renew(
    binding: &dyn CookieBinding,
    old: Option<&Cookie>,
    now: DateTime<Utc>,
) -> Cookie {
    let computer_id = match old {
        Some(cookie) => {
            let id = binding.computer_id(cookie);
            if id.is_empty() {
                Uuid::new_v4().to_string()
            } else {
                id
            }
        }
        None => Uuid::new_v4().to_string(),
    };
    binding.issue(&computer_id, now)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_issue_sets_five_day_expiration() {
        let now = Utc::now();
        let cookie = OpaqueBinding.issue("pc-7", now);
        assert_eq!(cookie.expiration, now + Duration::days(5));
        assert_eq!(OpaqueBinding.computer_id(&cookie), "pc-7");
    }

    #[test]
    fn test_decode_trims_trailing_nuls() {
        let cookie = Cookie {
            expiration: Utc::now(),
            encrypted_data: b"pc-7\0\0\0".to_vec(),
        };
        assert_eq!(OpaqueBinding.computer_id(&cookie), "pc-7");
    }

    #[test]
    fn test_renew_keeps_existing_computer_id() {
        let now = Utc::now();
        let old = OpaqueBinding.issue("pc-9", now);
        let renewed = renew(&OpaqueBinding, Some(&old), now + Duration::days(1));
        assert_eq!(OpaqueBinding.computer_id(&renewed), "pc-9");
        assert_eq!(renewed.expiration, now + Duration::days(6));
    }

    #[test]
    fn test_renew_without_old_mints_new_id() {
        let a = renew(&OpaqueBinding, None, Utc::now());
        let b = renew(&OpaqueBinding, None, Utc::now());
        assert_ne!(
            OpaqueBinding.computer_id(&a),
            OpaqueBinding.computer_id(&b)
        );
    }
}
