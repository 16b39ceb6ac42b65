//! Uniform validation pass applied to every message before it is queued.

use axum::http::Uri;
use base64::Engine;
use thiserror::Error;

use super::Message;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("{0} is required")]
    Required(&'static str),

    #[error("{0} must contain printable ASCII characters only")]
    NotPrintable(&'static str),

    #[error("html must be 0 or 1")]
    InvalidHtml,

    #[error("priority must be between -2 and 2")]
    InvalidPriority,

    #[error("ttl must not be negative")]
    NegativeTtl,

    #[error("url must be an http or https URL")]
    InvalidUrl,

    #[error("attachment_base64 is not valid base64")]
    InvalidBase64,

    #[error("attachment_type is required with attachment_base64")]
    MissingAttachmentType,

    #[error("attachment and attachment_base64 are mutually exclusive")]
    ConflictingAttachments,
}

/// Non-empty and made of printable ASCII (0x20..=0x7E) only.
pub fn is_printable_ascii(value: &str) -> bool {
    !value.is_empty() && value.bytes().all(|b| (0x20..=0x7e).contains(&b))
}

fn is_http_url(value: &str) -> bool {
    match value.parse::<Uri>() {
        Ok(uri) => {
            matches!(uri.scheme_str(), Some("http") | Some("https"))
                && uri.host().is_some_and(|host| !host.is_empty())
        }
        Err(_) => false,
    }
}

impl Message {
    /// Check every field constraint. The first violation is reported.
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.token.is_empty() {
            return Err(ValidationError::Required("token"));
        }
        if !is_printable_ascii(&self.token) {
            return Err(ValidationError::NotPrintable("token"));
        }
        if self.user.is_empty() {
            return Err(ValidationError::Required("user"));
        }
        if !is_printable_ascii(&self.user) {
            return Err(ValidationError::NotPrintable("user"));
        }
        if self.message.is_empty() {
            return Err(ValidationError::Required("message"));
        }

        if !(0..=1).contains(&self.html) {
            return Err(ValidationError::InvalidHtml);
        }
        if !(-2..=2).contains(&self.priority) {
            return Err(ValidationError::InvalidPriority);
        }
        if self.ttl < 0 {
            return Err(ValidationError::NegativeTtl);
        }

        if !self.url.is_empty() && !is_http_url(&self.url) {
            return Err(ValidationError::InvalidUrl);
        }

        if !self.attachment_base64.is_empty() {
            if !self.attachment.is_empty() {
                return Err(ValidationError::ConflictingAttachments);
            }
            base64::engine::general_purpose::STANDARD
                .decode(self.attachment_base64.as_bytes())
                .map_err(|_| ValidationError::InvalidBase64)?;
            if self.attachment_type.is_empty() {
                return Err(ValidationError::MissingAttachmentType);
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid() -> Message {
        Message {
            token: "azGDORePK8gMaC0QOYAMyEEuzJnyUi".to_string(),
            user: "uQiRzpo4DXghDmr9QzzfQu27cmVRsG".to_string(),
            message: "Backup finished".to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn test_minimal_message_is_valid() {
        assert_eq!(valid().validate(), Ok(()));
    }

    #[test]
    fn test_required_fields() {
        let mut message = valid();
        message.token.clear();
        assert_eq!(message.validate(), Err(ValidationError::Required("token")));

        let mut message = valid();
        message.user.clear();
        assert_eq!(message.validate(), Err(ValidationError::Required("user")));

        let mut message = valid();
        message.message.clear();
        assert_eq!(message.validate(), Err(ValidationError::Required("message")));
    }

    #[test]
    fn test_token_must_be_printable_ascii() {
        let mut message = valid();
        message.token = "tok\u{e9}n".to_string();
        assert_eq!(
            message.validate(),
            Err(ValidationError::NotPrintable("token"))
        );

        message.token = "tok\nen".to_string();
        assert_eq!(
            message.validate(),
            Err(ValidationError::NotPrintable("token"))
        );
    }

    #[test]
    fn test_numeric_ranges() {
        let mut message = valid();
        message.priority = 3;
        assert_eq!(message.validate(), Err(ValidationError::InvalidPriority));

        let mut message = valid();
        message.priority = -2;
        assert_eq!(message.validate(), Ok(()));

        let mut message = valid();
        message.html = 2;
        assert_eq!(message.validate(), Err(ValidationError::InvalidHtml));

        let mut message = valid();
        message.ttl = -1;
        assert_eq!(message.validate(), Err(ValidationError::NegativeTtl));
    }

    #[test]
    fn test_url_scheme() {
        let mut message = valid();
        message.url = "https://status.example.org/incident/42".to_string();
        assert_eq!(message.validate(), Ok(()));

        message.url = "ftp://example.org/file".to_string();
        assert_eq!(message.validate(), Err(ValidationError::InvalidUrl));

        message.url = "not a url".to_string();
        assert_eq!(message.validate(), Err(ValidationError::InvalidUrl));
    }

    #[test]
    fn test_attachment_base64() {
        let mut message = valid();
        message.attachment_base64 = "aGVsbG8gd29ybGQ=".to_string();
        message.attachment_type = "text/plain".to_string();
        assert_eq!(message.validate(), Ok(()));

        message.attachment_base64 = "***".to_string();
        assert_eq!(message.validate(), Err(ValidationError::InvalidBase64));

        message.attachment_base64 = "aGVsbG8gd29ybGQ=".to_string();
        message.attachment_type.clear();
        assert_eq!(
            message.validate(),
            Err(ValidationError::MissingAttachmentType)
        );

        message.attachment_type = "text/plain".to_string();
        message.attachment = "inline".to_string();
        assert_eq!(
            message.validate(),
            Err(ValidationError::ConflictingAttachments)
        );
    }

    #[test]
    fn test_is_printable_ascii() {
        assert!(is_printable_ascii("abc XYZ ~!"));
        assert!(!is_printable_ascii(""));
        assert!(!is_printable_ascii("tab\there"));
    }
}
