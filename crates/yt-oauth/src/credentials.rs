use chrono::{DateTime, Duration, TimeZone, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{Map, Value};

/// Seconds before the real expiry at which a token is treated as expired
const EXPIRY_SKEW_SECS: i64 = 60;

/// Point in time at which an access token stops being valid.
///
/// Read from either epoch milliseconds or an ISO-8601 timestamp, always
/// written back as epoch milliseconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct ExpiryDate(DateTime<Utc>);

impl ExpiryDate {
    pub fn from_millis(millis: i64) -> Option<Self> {
        Utc.timestamp_millis_opt(millis).single().map(Self)
    }

    /// Expiry `expires_in` seconds after `now`, as reported by token endpoints
    pub fn after(now: DateTime<Utc>, expires_in: u64) -> Self {
        let delta = i64::try_from(expires_in).ok().and_then(Duration::try_seconds);
        Self(
            delta
                .and_then(|delta| now.checked_add_signed(delta))
                .unwrap_or(DateTime::<Utc>::MAX_UTC),
        )
    }

    pub fn as_millis(&self) -> i64 {
        self.0.timestamp_millis()
    }

    pub fn as_datetime(&self) -> DateTime<Utc> {
        self.0
    }
}

impl From<DateTime<Utc>> for ExpiryDate {
    fn from(value: DateTime<Utc>) -> Self {
        Self(value)
    }
}

impl Serialize for ExpiryDate {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_i64(self.as_millis())
    }
}

impl<'de> Deserialize<'de> for ExpiryDate {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        use serde::de::Error;

        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Millis(i64),
            Text(String),
        }

        match Raw::deserialize(deserializer)? {
            Raw::Millis(millis) => Self::from_millis(millis)
                .ok_or_else(|| D::Error::custom(format!("expiry out of range: {millis}"))),
            Raw::Text(text) => {
                if let Ok(parsed) = DateTime::parse_from_rfc3339(&text) {
                    return Ok(Self(parsed.with_timezone(&Utc)));
                }
                text.parse::<i64>()
                    .ok()
                    .and_then(Self::from_millis)
                    .ok_or_else(|| D::Error::custom(format!("invalid expiry date: {text}")))
            }
        }
    }
}

/// Token bundle issued by the provider and persisted between runs
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Credentials {
    /// Access token for API requests
    pub access_token: String,
    /// Refresh token, only issued on the first grant or when the provider rotates it
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expiry_date: Option<ExpiryDate>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scope: Option<String>,
    /// Token type (usually "Bearer")
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id_token: Option<String>,
    /// Provider fields this crate does not interpret, kept as-is
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Credentials {
    pub fn new(access_token: impl Into<String>) -> Self {
        Self {
            access_token: access_token.into(),
            refresh_token: None,
            expiry_date: None,
            scope: None,
            token_type: None,
            id_token: None,
            extra: Map::new(),
        }
    }

    /// Check if the token is expired or will expire soon (within 60 seconds).
    ///
    /// A record without an expiry is never considered expired.
    pub fn is_expired(&self) -> bool {
        self.is_expired_at(Utc::now())
    }

    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        match self.expiry_date {
            Some(expiry) => now + Duration::seconds(EXPIRY_SKEW_SECS) >= expiry.as_datetime(),
            None => false,
        }
    }

    /// Overlay the fields present in `update`, leaving the others untouched
    pub fn apply(&mut self, update: &CredentialUpdate) {
        if let Some(access_token) = &update.access_token {
            self.access_token = access_token.clone();
        }
        if let Some(refresh_token) = &update.refresh_token {
            self.refresh_token = Some(refresh_token.clone());
        }
        if let Some(expiry_date) = update.expiry_date {
            self.expiry_date = Some(expiry_date);
        }
        if let Some(scope) = &update.scope {
            self.scope = Some(scope.clone());
        }
        if let Some(token_type) = &update.token_type {
            self.token_type = Some(token_type.clone());
        }
        if let Some(id_token) = &update.id_token {
            self.id_token = Some(id_token.clone());
        }
    }
}

/// Partial credential record, as delivered by a token refresh
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CredentialUpdate {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub access_token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expiry_date: Option<ExpiryDate>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scope: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id_token: Option<String>,
}

impl CredentialUpdate {
    /// The fields that are present, as JSON object entries
    pub(crate) fn present_fields(&self) -> Map<String, Value> {
        match serde_json::to_value(self) {
            Ok(Value::Object(fields)) => fields,
            _ => Map::new(),
        }
    }
}

impl From<&Credentials> for CredentialUpdate {
    fn from(record: &Credentials) -> Self {
        Self {
            access_token: Some(record.access_token.clone()),
            refresh_token: record.refresh_token.clone(),
            expiry_date: record.expiry_date,
            scope: record.scope.clone(),
            token_type: record.token_type.clone(),
            id_token: record.id_token.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn expiry_accepts_millis_and_iso() {
        let from_millis: ExpiryDate = serde_json::from_str("1700000000000").unwrap();
        let from_iso: ExpiryDate = serde_json::from_str("\"2023-11-14T22:13:20Z\"").unwrap();
        assert_eq!(from_millis, from_iso);
        assert_eq!(serde_json::to_string(&from_iso).unwrap(), "1700000000000");
    }

    #[test]
    fn expiry_rejects_garbage() {
        assert!(serde_json::from_str::<ExpiryDate>("\"tomorrow\"").is_err());
    }

    #[test]
    fn unknown_fields_survive_a_round_trip() {
        let json = r#"{"access_token":"A1","refresh_token_expires_in":604799}"#;
        let record: Credentials = serde_json::from_str(json).unwrap();
        assert_eq!(record.extra["refresh_token_expires_in"], 604799);
        let written = serde_json::to_value(&record).unwrap();
        assert_eq!(written["refresh_token_expires_in"], 604799);
    }

    #[test]
    fn apply_keeps_refresh_token_when_update_lacks_one() {
        let mut record = Credentials::new("A1");
        record.refresh_token = Some("R1".to_string());
        record.expiry_date = ExpiryDate::from_millis(1_000);

        record.apply(&CredentialUpdate {
            access_token: Some("A2".to_string()),
            expiry_date: ExpiryDate::from_millis(2_000),
            ..Default::default()
        });

        assert_eq!(record.access_token, "A2");
        assert_eq!(record.refresh_token.as_deref(), Some("R1"));
        assert_eq!(record.expiry_date, ExpiryDate::from_millis(2_000));
    }

    #[test]
    fn expiry_check_uses_skew() {
        let now = Utc::now();
        let mut record = Credentials::new("A1");
        assert!(!record.is_expired_at(now));

        record.expiry_date = Some(ExpiryDate::after(now, 30));
        assert!(record.is_expired_at(now));

        record.expiry_date = Some(ExpiryDate::after(now, 3600));
        assert!(!record.is_expired_at(now));
    }

    #[test]
    fn update_only_lists_present_fields() {
        let update = CredentialUpdate {
            access_token: Some("A2".to_string()),
            ..Default::default()
        };
        let fields = update.present_fields();
        assert_eq!(fields.len(), 1);
        assert_eq!(fields["access_token"], "A2");
    }
}
