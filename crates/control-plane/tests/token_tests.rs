use chrono::Duration;
use uuid::Uuid;

use control_plane::token::{check_device_token, check_enroll_token};
use control_plane::{utcnow, DeviceAuthToken, EnrollToken, TokenCheck, TokenService};

fn service() -> TokenService {
    TokenService::new("unit-test-pepper")
}

fn enroll_token(hash: &str) -> EnrollToken {
    EnrollToken {
        id: Uuid::new_v4(),
        tenant_id: control_plane::default_tenant_id(),
        token_hash: hash.to_string(),
        created_at: utcnow(),
        expires_at: None,
        used_at: None,
        revoked_at: None,
        used_by_device_id: None,
        note: None,
    }
}

#[test]
fn minted_token_never_equals_stored_hash() {
    let minted = service().mint();
    assert_ne!(minted.raw, minted.hash);
    assert!(!minted.hash.contains(&minted.raw));
    assert_eq!(minted.prefix.len(), 8);
    assert!(minted.raw.starts_with(&minted.prefix));
    // 32 bytes of entropy, base32 without padding.
    assert_eq!(minted.raw.len(), 52);
    // HMAC-SHA256 rendered as lowercase hex.
    assert_eq!(minted.hash.len(), 64);
    assert!(minted.hash.chars().all(|c| c.is_ascii_hexdigit()));
}

#[test]
fn hash_is_deterministic_per_pepper() {
    let service = service();
    let minted = service.mint();
    assert_eq!(service.hash(&minted.raw), minted.hash);

    let other_pepper = TokenService::new("different-pepper");
    assert_ne!(other_pepper.hash(&minted.raw), minted.hash);
}

#[test]
fn near_miss_tokens_do_not_verify() {
    let service = service();
    let minted = service.mint();
    // Same prefix, different tail.
    let mut forged = minted.raw.clone();
    forged.pop();
    forged.push('x');
    assert_ne!(service.hash(&forged), minted.hash);
}

#[test]
fn enroll_token_checks_cover_lifecycle() {
    let now = utcnow();
    let fresh = enroll_token("h");
    assert_eq!(check_enroll_token(&fresh, now), TokenCheck::Valid);

    let mut used = enroll_token("h");
    used.used_at = Some(now);
    assert_eq!(check_enroll_token(&used, now), TokenCheck::Used);

    let mut revoked = enroll_token("h");
    revoked.revoked_at = Some(now);
    assert_eq!(check_enroll_token(&revoked, now), TokenCheck::Revoked);

    let mut expired = enroll_token("h");
    expired.expires_at = Some(now - Duration::minutes(1));
    assert_eq!(check_enroll_token(&expired, now), TokenCheck::Expired);

    let mut future = enroll_token("h");
    future.expires_at = Some(now + Duration::minutes(5));
    assert_eq!(check_enroll_token(&future, now), TokenCheck::Valid);
}

#[test]
fn device_token_check_flags_revocation() {
    let token = DeviceAuthToken {
        id: Uuid::new_v4(),
        tenant_id: control_plane::default_tenant_id(),
        device_id: Uuid::new_v4(),
        token_hash: "h".to_string(),
        prefix: "abcdefgh".to_string(),
        issued_at: utcnow(),
        revoked_at: None,
        last_used_at: None,
        replaced_by_id: None,
    };
    assert_eq!(check_device_token(&token), TokenCheck::Valid);

    let revoked = DeviceAuthToken {
        revoked_at: Some(utcnow()),
        ..token
    };
    assert_eq!(check_device_token(&revoked), TokenCheck::Revoked);
}
