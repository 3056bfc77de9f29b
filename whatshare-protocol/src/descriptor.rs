//! Pairing Descriptor
//!
//! The descriptor is what two devices exchange to establish a pairing:
//! the model of the device that produced it and the shared secret.
//!
//! It travels in two encodings:
//!
//! - **QR payload**: compact JSON, `{"deviceType":"Pixel","secret":[7,42,19]}`
//! - **Long URL**: the same JSON, base64url-encoded into the `d` query
//!   parameter of a landing URL, so a URL shortener can store it

use crate::secret::SharedSecret;
use crate::{ProtocolError, Result};
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use serde::{Deserialize, Serialize};
use url::Url;

/// Query parameter carrying the encoded descriptor
pub const DESCRIPTOR_PARAM: &str = "d";

/// Connection descriptor exchanged through the QR code and the relay
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PairingDescriptor {
    /// Model of the device that produced the descriptor
    pub device_type: String,

    /// Keying material for the pairing
    pub secret: SharedSecret,
}

impl PairingDescriptor {
    /// Create a descriptor from its parts
    pub fn new(device_type: impl Into<String>, secret: SharedSecret) -> Self {
        Self {
            device_type: device_type.into(),
            secret,
        }
    }

    /// Create a descriptor with a freshly generated secret
    pub fn generate(device_type: impl Into<String>) -> Result<Self> {
        Ok(Self::new(device_type, SharedSecret::generate()?))
    }

    /// Serialize to compact JSON
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Parse compact JSON
    ///
    /// # Errors
    ///
    /// Returns `ProtocolError::Decode` if the text is not a descriptor, has
    /// an empty device type or an empty secret.
    pub fn from_json(text: &str) -> Result<Self> {
        let descriptor: Self = serde_json::from_str(text.trim())
            .map_err(|e| ProtocolError::Decode(format!("Invalid pairing descriptor: {}", e)))?;

        if descriptor.device_type.trim().is_empty() {
            return Err(ProtocolError::Decode(
                "Pairing descriptor has no device type".to_string(),
            ));
        }
        if descriptor.secret.words().is_empty() {
            return Err(ProtocolError::Decode(
                "Pairing descriptor has an empty secret".to_string(),
            ));
        }

        Ok(descriptor)
    }

    /// Text to encode in the QR code shown to the counterpart
    pub fn to_qr_payload(&self) -> Result<String> {
        self.to_json()
    }

    /// Parse the text decoded from a scanned QR code
    pub fn from_qr_payload(payload: &str) -> Result<Self> {
        Self::from_json(payload)
    }

    /// Embed this descriptor into `landing` as the `d` query parameter
    ///
    /// # Examples
    ///
    /// ```
    /// use url::Url;
    /// use whatshare_protocol::descriptor::PairingDescriptor;
    /// use whatshare_protocol::secret::SharedSecret;
    ///
    /// let descriptor = PairingDescriptor::new("Pixel", SharedSecret::from_words(vec![7, 42, 19]));
    /// let landing = Url::parse("https://whatshare.example/pair").unwrap();
    /// let long_url = descriptor.to_long_url(&landing).unwrap();
    ///
    /// assert_eq!(PairingDescriptor::from_long_url(long_url.as_str()).unwrap(), descriptor);
    /// ```
    pub fn to_long_url(&self, landing: &Url) -> Result<Url> {
        let encoded = URL_SAFE_NO_PAD.encode(self.to_json()?);

        let mut url = landing.clone();
        url.query_pairs_mut()
            .append_pair(DESCRIPTOR_PARAM, &encoded);
        Ok(url)
    }

    /// Extract a descriptor from a long URL produced by [`Self::to_long_url`]
    pub fn from_long_url(long_url: &str) -> Result<Self> {
        let url = Url::parse(long_url)
            .map_err(|e| ProtocolError::Decode(format!("Invalid long URL: {}", e)))?;

        let encoded = url
            .query_pairs()
            .find(|(key, _)| key == DESCRIPTOR_PARAM)
            .map(|(_, value)| value.into_owned())
            .ok_or_else(|| {
                ProtocolError::Decode("Long URL carries no pairing descriptor".to_string())
            })?;

        let json = URL_SAFE_NO_PAD
            .decode(encoded.as_bytes())
            .map_err(|e| ProtocolError::Decode(format!("Invalid descriptor encoding: {}", e)))?;
        let json = String::from_utf8(json)
            .map_err(|_| ProtocolError::Decode("Descriptor is not UTF-8".to_string()))?;

        Self::from_json(&json)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> PairingDescriptor {
        PairingDescriptor::new("Pixel", SharedSecret::from_words(vec![7, 42, 19]))
    }

    #[test]
    fn test_json_shape() {
        assert_eq!(
            sample().to_json().unwrap(),
            r#"{"deviceType":"Pixel","secret":[7,42,19]}"#
        );
    }

    #[test]
    fn test_qr_payload_parsing() {
        let parsed =
            PairingDescriptor::from_qr_payload("  {\"deviceType\":\"Pixel\",\"secret\":[7,42,19]}\n")
                .unwrap();
        assert_eq!(parsed, sample());
    }

    #[test]
    fn test_rejects_bad_payloads() {
        for payload in [
            "",
            "not json",
            r#"{"deviceType":"","secret":[1]}"#,
            r#"{"deviceType":"Pixel","secret":[]}"#,
            r#"{"deviceType":"Pixel"}"#,
        ] {
            let err = PairingDescriptor::from_qr_payload(payload).unwrap_err();
            assert!(matches!(err, ProtocolError::Decode(_)), "{payload}");
        }
    }

    #[test]
    fn test_long_url_keeps_landing() {
        let landing = Url::parse("https://whatshare.example/pair?v=1").unwrap();
        let url = sample().to_long_url(&landing).unwrap();

        assert_eq!(url.host_str(), Some("whatshare.example"));
        assert!(url.query().unwrap().starts_with("v=1&d="));
        assert_eq!(PairingDescriptor::from_long_url(url.as_str()).unwrap(), sample());
    }

    #[test]
    fn test_long_url_without_descriptor() {
        let err = PairingDescriptor::from_long_url("https://whatshare.example/pair").unwrap_err();
        assert!(matches!(err, ProtocolError::Decode(_)));

        let err = PairingDescriptor::from_long_url("https://x.example/?d=%%%").unwrap_err();
        assert!(matches!(err, ProtocolError::Decode(_)));
    }
}
