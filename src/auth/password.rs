//! Salted password hashing with bcrypt.
//!
//! Hashing is CPU bound, so both operations run on the blocking pool.

use crate::{AppError, Result};

pub async fn hash_password(password: &str, cost: u32) -> Result<String> {
    let password = password.to_owned();
    tokio::task::spawn_blocking(move || bcrypt::hash(password, cost))
        .await?
        .map_err(|e| AppError::InternalError(format!("Password hashing failed: {}", e)))
}

/// A malformed stored hash counts as a mismatch.
pub async fn verify_password(password: &str, hash: &str) -> Result<bool> {
    if hash.is_empty() {
        return Ok(false);
    }

    let password = password.to_owned();
    let hash = hash.to_owned();
    let verified = tokio::task::spawn_blocking(move || bcrypt::verify(password, &hash)).await?;

    Ok(verified.unwrap_or(false))
}
