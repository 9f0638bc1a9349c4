use serde::{Deserialize, Serialize};

use crate::registration::Registration;

/// The structure encoded into every participant QR code.
///
/// It is never persisted; it is rebuilt from the registration whenever a code
/// is shown, mailed or exported.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScanPayload {
    pub id: String,
    pub index: usize,
    pub name: String,
    pub events: Vec<String>,
}

impl ScanPayload {
    /// One payload per roster entry, in roster order.
    pub fn for_registration(reg: &Registration) -> Vec<ScanPayload> {
        reg.roster()
            .iter()
            .enumerate()
            .map(|(index, m)| ScanPayload {
                id: reg.id.clone(),
                index,
                name: m.name.clone(),
                events: m.events.clone(),
            })
            .collect()
    }

    pub fn to_text(&self) -> String {
        // A struct of strings and integers always serializes.
        serde_json::to_string(self).unwrap_or_default()
    }
}

/// Image sizes requested from the QR generator.
pub const EMAIL_QR_SIZE: u32 = 250;
pub const EXPORT_QR_SIZE: u32 = 150;
pub const DISPLAY_QR_SIZE: u32 = 300;

/// Remote QR image generator, parameterized by size and payload text.
#[derive(Debug, Clone)]
pub struct QrEndpoint {
    base: String,
}

impl QrEndpoint {
    pub fn new(base: &str) -> Self {
        QrEndpoint {
            base: base.to_string(),
        }
    }

    /// Build the image URL for `data`
    ///
    /// # Arguments
    /// * `size` - Width and height of the square image in pixels
    /// * `data` - Text to encode, URL-encoded into the query string
    /// * `margin` - Quiet-zone width, omitted from the URL when `None`
    ///
    /// # Examples
    /// ```
    /// use regdesk::payload::QrEndpoint;
    ///
    /// let qr = QrEndpoint::new("https://api.qrserver.com/v1/create-qr-code/");
    /// assert_eq!(
    ///     qr.url(150, "a b", Some(0)),
    ///     "https://api.qrserver.com/v1/create-qr-code/?size=150x150&data=a%20b&margin=0"
    /// );
    /// ```
    pub fn url(&self, size: u32, data: &str, margin: Option<u32>) -> String {
        let mut url = format!(
            "{}?size={}x{}&data={}",
            self.base,
            size,
            size,
            urlencoding::encode(data)
        );
        if let Some(margin) = margin {
            url.push_str(&format!("&margin={}", margin));
        }
        url
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn team() -> Registration {
        serde_json::from_str(
            r#"{"id":"R1","name":"Lead","status":"Verified",
                "serverTimestamp":"2026-03-01T10:00:00Z",
                "members":[{"name":"A","events":["Quiz"]},{"name":"B","events":"Chess"}]}"#,
        )
        .unwrap()
    }

    #[test]
    fn payload_fields_follow_member() {
        let payloads = ScanPayload::for_registration(&team());
        assert_eq!(payloads.len(), 2);
        assert_eq!(payloads[1].index, 1);
        assert_eq!(payloads[1].name, "B");
        assert_eq!(payloads[1].events, vec!["Chess".to_string()]);

        let text = payloads[0].to_text();
        assert_eq!(text, r#"{"id":"R1","index":0,"name":"A","events":["Quiz"]}"#);
    }

    #[test]
    fn url_encodes_json_payload() {
        let qr = QrEndpoint::new("https://qr.example/");
        let url = qr.url(EMAIL_QR_SIZE, r#"{"id":"R1"}"#, None);
        assert_eq!(url, "https://qr.example/?size=250x250&data=%7B%22id%22%3A%22R1%22%7D");
    }
}
