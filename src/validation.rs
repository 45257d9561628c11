//! Field rules plugged into the `validator` derives on request payloads.
//!
//! Rules that carry their own message set it here; the rest get theirs from
//! the `message = ...` on the field attribute.

use regex::Regex;
use std::borrow::Cow;
use std::sync::OnceLock;
use validator::ValidationError;

use crate::{AppError, Result};

/// Passwords that satisfy the character-class rules but are too well known to
/// accept. Compared case-insensitively.
const COMMON_PASSWORDS: &[&str] = &[
    "P@ssw0rd",
    "P@ssw0rd1",
    "P@ssword1",
    "P@ssword123",
    "Password1!",
    "Password123!",
    "Passw0rd1!",
    "Qwerty123!",
    "Qwerty1!",
    "Qwerty12345!",
    "1qaz@WSX",
    "1qaz!QAZ",
    "Zaq12wsx!",
    "Abc12345!",
    "Abcd1234!",
    "Admin123!",
    "Admin@123",
    "Welcome1!",
    "Welcome123!",
    "Welcome@123",
    "Letmein1!",
    "Iloveyou1!",
    "Test1234!",
    "Changeme1!",
    "Summer2024!",
    "Winter2024!",
];

fn name_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[\p{L}' -]{2,50}$").expect("name pattern is valid"))
}

fn is_cyrillic(c: char) -> bool {
    ('\u{0400}'..='\u{04FF}').contains(&c)
}

fn rule_error(code: &'static str, message: &'static str) -> ValidationError {
    ValidationError::new(code).with_message(Cow::Borrowed(message))
}

pub fn normalize_email(email: &str) -> String {
    email.trim().to_lowercase()
}

/// No Cyrillic characters and no `.ru` domain.
pub fn unrestricted_email(email: &str) -> std::result::Result<(), ValidationError> {
    if email.chars().any(is_cyrillic) || email.to_ascii_lowercase().ends_with(".ru") {
        return Err(ValidationError::new("restricted_email"));
    }
    Ok(())
}

/// 2..50 letters, apostrophes, hyphens or spaces once trimmed, with at least
/// one letter.
pub fn person_name(value: &str) -> std::result::Result<(), ValidationError> {
    let value = value.trim();
    if !name_regex().is_match(value) || !value.chars().any(char::is_alphabetic) {
        return Err(ValidationError::new("name"));
    }
    Ok(())
}

/// At least one lowercase letter, uppercase letter, digit and ASCII
/// punctuation character, no whitespace, and not a well-known password.
/// Length is checked by the field's `length` rule.
pub fn password_strength(password: &str) -> std::result::Result<(), ValidationError> {
    let well_formed = !password.chars().any(char::is_whitespace)
        && password.chars().any(|c| c.is_ascii_lowercase())
        && password.chars().any(|c| c.is_ascii_uppercase())
        && password.chars().any(|c| c.is_ascii_digit())
        && password.chars().any(|c| c.is_ascii_punctuation());
    if !well_formed {
        return Err(rule_error("password", "Password is incorrect"));
    }

    if COMMON_PASSWORDS.iter().any(|common| common.eq_ignore_ascii_case(password)) {
        return Err(rule_error("common_password", "Password is too common"));
    }
    Ok(())
}

pub fn password_excludes_names(
    password: &str,
    names: [&str; 2],
) -> std::result::Result<(), ValidationError> {
    let lowered = password.to_lowercase();
    for name in names {
        let name = name.trim().to_lowercase();
        if !name.is_empty() && lowered.contains(&name) {
            return Err(rule_error(
                "password_contains_name",
                "Password must not contain your name",
            ));
        }
    }
    Ok(())
}

pub fn verification_code(code: &str) -> std::result::Result<(), ValidationError> {
    if code.len() != 6 || !code.chars().all(|c| c.is_ascii_digit()) {
        return Err(rule_error("code", "Must contain 6 digits"));
    }
    Ok(())
}

pub fn require_non_empty(field: &str, value: &str) -> Result<()> {
    if value.trim().is_empty() {
        return Err(AppError::ValidationError(format!("{field} is required")));
    }
    Ok(())
}
