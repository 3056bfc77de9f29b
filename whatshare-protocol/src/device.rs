//! Paired Device Records
//!
//! A [`PairedDevice`] is the durable result of a successful pairing
//! handshake. Every device keeps two kinds of records:
//!
//! - **Outbound**: the single desktop counterpart shared content is forwarded to
//! - **Inbound**: devices allowed to send content to this device, identified by
//!   a user-chosen name
//!
//! Names are pattern-constrained (see [`validate_name`]) so they can be typed
//! on either side and shown in notifications.

use crate::error::ValidationError;
use crate::secret::SharedSecret;
use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::OnceLock;

/// Maximum length of a device name, in characters
pub const MAX_NAME_LEN: usize = 32;

/// Accepted device names
pub const VALID_NAME_PATTERN: &str = r"^[A-Za-z0-9 ._-]{1,32}$";

/// Role of a paired device relative to this device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceRole {
    /// May send content to this device
    Inbound,
    /// Receives content shared on this device
    Outbound,
}

impl fmt::Display for DeviceRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeviceRole::Inbound => write!(f, "inbound"),
            DeviceRole::Outbound => write!(f, "outbound"),
        }
    }
}

/// An established pairing
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PairedDevice {
    /// Device model as reported by the device itself (free text)
    #[serde(rename = "type")]
    pub device_type: String,

    /// Name chosen by the user
    pub name: String,

    /// Inbound or outbound
    pub role: DeviceRole,

    /// Keying material for forwarded payloads
    pub secret: SharedSecret,

    /// When the pairing was committed
    pub created_at: DateTime<Utc>,
}

impl PairedDevice {
    /// Create a record stamped with the current time
    pub fn new(
        device_type: impl Into<String>,
        name: impl Into<String>,
        role: DeviceRole,
        secret: SharedSecret,
    ) -> Self {
        Self::with_created_at(device_type, name, role, secret, Utc::now())
    }

    /// Create a record with an explicit creation time
    pub fn with_created_at(
        device_type: impl Into<String>,
        name: impl Into<String>,
        role: DeviceRole,
        secret: SharedSecret,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            device_type: device_type.into(),
            name: name.into(),
            role,
            secret,
            created_at,
        }
    }

    /// Check if this is the outbound record
    pub fn is_outbound(&self) -> bool {
        self.role == DeviceRole::Outbound
    }
}

fn name_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(VALID_NAME_PATTERN).expect("device name pattern is valid"))
}

fn is_allowed_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || matches!(c, ' ' | '.' | '_' | '-')
}

/// Check a candidate device name against [`VALID_NAME_PATTERN`]
///
/// Matching is exact and case-sensitive; no trimming is applied.
///
/// # Examples
///
/// ```
/// use whatshare_protocol::device::validate_name;
/// use whatshare_protocol::ValidationError;
///
/// assert!(validate_name("kitchen-pc").is_ok());
/// assert_eq!(validate_name(""), Err(ValidationError::Empty));
/// assert_eq!(validate_name("pc/1"), Err(ValidationError::InvalidCharacter('/')));
/// ```
pub fn validate_name(name: &str) -> Result<(), ValidationError> {
    if name_pattern().is_match(name) {
        return Ok(());
    }

    if name.is_empty() {
        return Err(ValidationError::Empty);
    }

    if let Some(c) = name.chars().find(|c| !is_allowed_char(*c)) {
        return Err(ValidationError::InvalidCharacter(c));
    }

    Err(ValidationError::TooLong { max: MAX_NAME_LEN })
}
