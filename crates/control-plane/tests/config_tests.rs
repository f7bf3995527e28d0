use std::collections::HashMap;

use control_plane::{ConfigError, Settings};

fn base_values() -> HashMap<String, String> {
    HashMap::from([
        ("BASELINER_ADMIN_KEY".to_string(), "admin-key".to_string()),
        ("BASELINER_TOKEN_PEPPER".to_string(), "pepper".to_string()),
    ])
}

#[test]
fn defaults_apply_for_unset_options() {
    let settings = Settings::from_map(&base_values()).expect("settings");
    assert_eq!(settings.database_url, "baseliner.sqlite");
    assert_eq!(settings.max_body_bytes_default, 1_048_576);
    assert_eq!(settings.max_body_bytes_device_reports, 10_485_760);
    assert_eq!(settings.max_report_items, 500);
    assert_eq!(settings.max_report_log_events, 2_000);
    assert!(settings.rate_limit.enabled);
    assert_eq!(settings.rate_limit.reports_per_minute, 60);
    assert_eq!(settings.rate_limit.reports_burst, 10);
    assert_eq!(settings.request_timeout_seconds, 30);
    assert_eq!(settings.request_timeout_seconds_device_reports, 60);
}

#[test]
fn missing_admin_key_is_an_error() {
    let mut values = base_values();
    values.remove("BASELINER_ADMIN_KEY");
    let err = Settings::from_map(&values).expect_err("missing key");
    assert!(matches!(err, ConfigError::Missing("BASELINER_ADMIN_KEY")));
}

#[test]
fn missing_pepper_is_an_error() {
    let mut values = base_values();
    values.insert("BASELINER_TOKEN_PEPPER".to_string(), "   ".to_string());
    let err = Settings::from_map(&values).expect_err("blank pepper");
    assert!(matches!(err, ConfigError::Missing("BASELINER_TOKEN_PEPPER")));
}

#[test]
fn unknown_keys_in_owned_namespaces_are_rejected() {
    let mut values = base_values();
    values.insert(
        "RATE_LIMIT_REPORTS_PER_HOUR".to_string(),
        "10".to_string(),
    );
    let err = Settings::from_map(&values).expect_err("unknown key");
    assert!(matches!(err, ConfigError::UnknownKey(key) if key == "RATE_LIMIT_REPORTS_PER_HOUR"));

    let mut values = base_values();
    values.insert("BASELINER_ADMIN_KEYS".to_string(), "oops".to_string());
    let err = Settings::from_map(&values).expect_err("typoed key");
    assert!(matches!(err, ConfigError::UnknownKey(key) if key == "BASELINER_ADMIN_KEYS"));

    let mut values = base_values();
    values.insert(
        "MAX_REQUEST_BODY_BYTES".to_string(),
        "1024".to_string(),
    );
    let err = Settings::from_map(&values).expect_err("truncated key");
    assert!(matches!(err, ConfigError::UnknownKey(key) if key == "MAX_REQUEST_BODY_BYTES"));
}

#[test]
fn numeric_options_reject_garbage() {
    let mut values = base_values();
    values.insert(
        "MAX_REQUEST_BODY_BYTES_DEFAULT".to_string(),
        "lots".to_string(),
    );
    let err = Settings::from_map(&values).expect_err("bad number");
    assert!(matches!(err, ConfigError::TypeMismatch(key, _) if key == "MAX_REQUEST_BODY_BYTES_DEFAULT"));
}

#[test]
fn numeric_options_reject_negatives() {
    let mut values = base_values();
    values.insert("RATE_LIMIT_REPORTS_BURST".to_string(), "-5".to_string());
    let err = Settings::from_map(&values).expect_err("negative");
    assert!(matches!(err, ConfigError::OutOfRange(key, _) if key == "RATE_LIMIT_REPORTS_BURST"));
}

#[test]
fn boolean_options_accept_common_spellings() {
    let mut values = base_values();
    values.insert("RATE_LIMIT_ENABLED".to_string(), "no".to_string());
    let settings = Settings::from_map(&values).expect("settings");
    assert!(!settings.rate_limit.enabled);

    values.insert("RATE_LIMIT_ENABLED".to_string(), "definitely".to_string());
    let err = Settings::from_map(&values).expect_err("bad boolean");
    assert!(matches!(err, ConfigError::TypeMismatch(key, _) if key == "RATE_LIMIT_ENABLED"));
}

#[test]
fn sqlite_path_strips_dsn_prefixes() {
    let mut values = base_values();
    values.insert(
        "DATABASE_URL".to_string(),
        "sqlite:///var/lib/baseliner.sqlite".to_string(),
    );
    let settings = Settings::from_map(&values).expect("settings");
    assert_eq!(settings.sqlite_path(), "/var/lib/baseliner.sqlite");

    values.insert("DATABASE_URL".to_string(), "sqlite:local.db".to_string());
    let settings = Settings::from_map(&values).expect("settings");
    assert_eq!(settings.sqlite_path(), "local.db");

    values.insert("DATABASE_URL".to_string(), ":memory:".to_string());
    let settings = Settings::from_map(&values).expect("settings");
    assert_eq!(settings.sqlite_path(), ":memory:");
}
