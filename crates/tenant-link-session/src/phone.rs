//! Phone number to protocol address normalization.

/// Country code and address domain used to build protocol addresses.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PhoneFormat {
    country_code: String,
    domain: String,
}

impl Default for PhoneFormat {
    fn default() -> Self {
        Self::new("62", "s.whatsapp.net")
    }
}

impl PhoneFormat {
    /// Create a format. Non-digits in `country_code` are ignored.
    #[must_use]
    pub fn new(country_code: &str, domain: &str) -> Self {
        Self {
            country_code: country_code.chars().filter(char::is_ascii_digit).collect(),
            domain: domain.trim_start_matches('@').to_owned(),
        }
    }

    /// Normalize a raw phone number to international digits.
    ///
    /// Non-digits are stripped, a leading trunk `0` becomes the country
    /// code, and the country code is prepended when missing. Returns `None`
    /// when no digits remain.
    #[must_use]
    pub fn normalize(&self, raw: &str) -> Option<String> {
        let digits: String = raw.chars().filter(char::is_ascii_digit).collect();
        if digits.is_empty() {
            return None;
        }

        let normalized = if let Some(national) = digits.strip_prefix('0') {
            format!("{}{national}", self.country_code)
        } else if digits.starts_with(&self.country_code) {
            digits
        } else {
            format!("{}{digits}", self.country_code)
        };
        Some(normalized)
    }

    /// Normalize and suffix the protocol address domain.
    #[must_use]
    pub fn to_address(&self, raw: &str) -> Option<String> {
        self.normalize(raw)
            .map(|digits| format!("{digits}@{}", self.domain))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_trunk_prefix_replaced_with_country_code() {
        let format = PhoneFormat::default();
        assert_eq!(
            format.to_address("081234567890").as_deref(),
            Some("6281234567890@s.whatsapp.net")
        );
    }

    #[test]
    fn test_international_input_kept() {
        let format = PhoneFormat::default();
        assert_eq!(
            format.to_address("+6281234567890").as_deref(),
            Some("6281234567890@s.whatsapp.net")
        );
        assert_eq!(
            format.to_address("+62 812-3456-7890").as_deref(),
            Some("6281234567890@s.whatsapp.net")
        );
    }

    #[test]
    fn test_missing_country_code_prepended() {
        let format = PhoneFormat::default();
        assert_eq!(format.normalize("81234567890").as_deref(), Some("6281234567890"));
    }

    #[test]
    fn test_no_digits_is_rejected() {
        assert_eq!(PhoneFormat::default().normalize("n/a"), None);
        assert_eq!(PhoneFormat::default().to_address(""), None);
    }

    #[test]
    fn test_custom_format() {
        let format = PhoneFormat::new("+49", "@c.us");
        assert_eq!(
            format.to_address("0151 2345678").as_deref(),
            Some("491512345678@c.us")
        );
    }
}
