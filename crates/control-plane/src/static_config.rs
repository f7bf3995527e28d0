#[derive(Clone, Debug)]
pub struct SettingItem {
    pub key: &'static str,
    pub description: &'static str,
    pub value_type: &'static str,
    pub default_value: &'static str,
}

pub static SETTINGS_TABLE: &[SettingItem] = &[
    SettingItem {
        key: "DATABASE_URL",
        description: "Relational store DSN (sqlite://path, sqlite:path, bare path, or :memory:)",
        value_type: "string",
        default_value: "baseliner.sqlite",
    },
    SettingItem {
        key: "BASELINER_ADMIN_KEY",
        description: "Admin API key expected in X-Admin-Key",
        value_type: "string",
        default_value: "",
    },
    SettingItem {
        key: "BASELINER_TOKEN_PEPPER",
        description: "HMAC key for enroll/device token hashing",
        value_type: "string",
        default_value: "",
    },
    SettingItem {
        key: "MAX_REQUEST_BODY_BYTES_DEFAULT",
        description: "Request body cap for routes without a dedicated cap",
        value_type: "number",
        default_value: "1048576",
    },
    SettingItem {
        key: "MAX_REQUEST_BODY_BYTES_DEVICE_REPORTS",
        description: "Request body cap for POST /api/v1/device/reports",
        value_type: "number",
        default_value: "10485760",
    },
    SettingItem {
        key: "MAX_REPORT_ITEMS",
        description: "Soft cap on items[] per run report",
        value_type: "number",
        default_value: "500",
    },
    SettingItem {
        key: "MAX_REPORT_LOG_EVENTS",
        description: "Soft cap on logs[] per run report",
        value_type: "number",
        default_value: "2000",
    },
    SettingItem {
        key: "RATE_LIMIT_ENABLED",
        description: "Enable the in-process report rate limiter",
        value_type: "boolean",
        default_value: "true",
    },
    SettingItem {
        key: "RATE_LIMIT_REPORTS_PER_MINUTE",
        description: "Sustained report rate per device",
        value_type: "number",
        default_value: "60",
    },
    SettingItem {
        key: "RATE_LIMIT_REPORTS_BURST",
        description: "Burst capacity per device",
        value_type: "number",
        default_value: "10",
    },
    SettingItem {
        key: "RATE_LIMIT_REPORTS_IP_PER_MINUTE",
        description: "Sustained report rate per source IP (unauthenticated fallback)",
        value_type: "number",
        default_value: "60",
    },
    SettingItem {
        key: "RATE_LIMIT_REPORTS_IP_BURST",
        description: "Burst capacity per source IP",
        value_type: "number",
        default_value: "10",
    },
    SettingItem {
        key: "REQUEST_TIMEOUT_SECONDS",
        description: "Request deadline for routes without a dedicated deadline",
        value_type: "number",
        default_value: "30",
    },
    SettingItem {
        key: "REQUEST_TIMEOUT_SECONDS_DEVICE_REPORTS",
        description: "Request deadline for POST /api/v1/device/reports",
        value_type: "number",
        default_value: "60",
    },
];
