// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! Input normalization and validation for account fields.

use unicode_normalization::UnicodeNormalization;

use super::AuthError;

const MIN_PASSWORD_LEN: usize = 8;
const MAX_PASSWORD_LEN: usize = 128;
const MAX_DISPLAY_NAME_LEN: usize = 32;
const MAX_EMAIL_LEN: usize = 254;

/// Canonical form used for storage and lookup: trimmed, NFKC, lowercase.
pub fn normalize_email(raw: &str) -> String {
    raw.trim().nfkc().collect::<String>().to_lowercase()
}

/// Shape check on an already normalized address.
pub fn validate_email(email: &str) -> Result<(), AuthError> {
    let invalid = || AuthError::Validation("A valid e-mail address is required".to_string());

    if email.is_empty() || email.len() > MAX_EMAIL_LEN || email.chars().any(char::is_whitespace) {
        return Err(invalid());
    }
    let (local, domain) = email.split_once('@').ok_or_else(invalid)?;
    if local.is_empty() || domain.contains('@') {
        return Err(invalid());
    }
    let labels_ok = domain.split('.').count() >= 2 && domain.split('.').all(|label| !label.is_empty());
    if !labels_ok {
        return Err(invalid());
    }
    Ok(())
}

/// Minimum 8 characters with a lowercase, an uppercase, a digit and a symbol.
pub fn validate_password(password: &str) -> Result<(), AuthError> {
    let length = password.chars().count();
    let strong = (MIN_PASSWORD_LEN..=MAX_PASSWORD_LEN).contains(&length)
        && password.chars().any(char::is_lowercase)
        && password.chars().any(char::is_uppercase)
        && password.chars().any(|c| c.is_ascii_digit())
        && password.chars().any(|c| !c.is_alphanumeric() && !c.is_whitespace());

    if strong {
        Ok(())
    } else {
        Err(AuthError::Validation(format!(
            "Password must be {MIN_PASSWORD_LEN} to {MAX_PASSWORD_LEN} characters and contain an \
             uppercase letter, a lowercase letter, a digit and a symbol"
        )))
    }
}

/// Trimmed display name of 1 to 32 characters.
pub fn validate_display_name(raw: &str) -> Result<String, AuthError> {
    let name = raw.trim();
    let length = name.chars().count();
    if length == 0 || length > MAX_DISPLAY_NAME_LEN {
        return Err(AuthError::Validation(format!(
            "Display name must be between 1 and {MAX_DISPLAY_NAME_LEN} characters"
        )));
    }
    Ok(name.to_string())
}
