//! Backend credential storage using the OS credential store.
//!
//! On Windows this uses DPAPI (via the `keyring` crate), on macOS Keychain,
//! and on Linux the Secret Service API. Headless deployments without a
//! credential store fall back to `RESI_BACKEND_URL` / `RESI_BACKEND_KEY`.

use keyring::Entry;
use tracing::{info, warn};

const SERVICE_NAME: &str = "resi-tracker";

// Credential keys
const KEY_BACKEND_URL: &str = "backend_url";
const KEY_BACKEND_ANON_KEY: &str = "backend_anon_key";

const ENV_BACKEND_URL: &str = "RESI_BACKEND_URL";
const ENV_BACKEND_KEY: &str = "RESI_BACKEND_KEY";

/// All credential keys managed by this module.
const ALL_KEYS: &[&str] = &[KEY_BACKEND_URL, KEY_BACKEND_ANON_KEY];

// ---------------------------------------------------------------------------
// Low-level helpers
// ---------------------------------------------------------------------------

/// Retrieve a single credential from the OS keyring. Returns `None` when the
/// entry does not exist (or the platform returns a "not found" error).
pub fn get_credential(key: &str) -> Option<String> {
    let entry = match Entry::new(SERVICE_NAME, key) {
        Ok(e) => e,
        Err(e) => {
            warn!(key, error = %e, "keyring: failed to create entry");
            return None;
        }
    };
    match entry.get_password() {
        Ok(pw) => Some(pw),
        Err(keyring::Error::NoEntry) => None,
        Err(e) => {
            warn!(key, error = %e, "keyring: failed to read credential");
            None
        }
    }
}

/// Store a credential in the OS keyring.
pub fn set_credential(key: &str, value: &str) -> Result<(), String> {
    let entry = Entry::new(SERVICE_NAME, key).map_err(|e| e.to_string())?;
    entry.set_password(value).map_err(|e| e.to_string())?;
    Ok(())
}

/// Delete a credential from the OS keyring. Silently succeeds if the entry
/// does not exist.
pub fn delete_credential(key: &str) -> Result<(), String> {
    let entry = Entry::new(SERVICE_NAME, key).map_err(|e| e.to_string())?;
    match entry.delete_credential() {
        Ok(()) => Ok(()),
        Err(keyring::Error::NoEntry) => Ok(()),
        Err(e) => Err(e.to_string()),
    }
}

fn env_value(name: &str) -> Option<String> {
    std::env::var(name).ok()
}

/// First candidate that is present and non-blank, trimmed.
fn first_non_empty<I>(candidates: I) -> Option<String>
where
    I: IntoIterator<Item = Option<String>>,
{
    candidates
        .into_iter()
        .flatten()
        .map(|v| v.trim().to_string())
        .find(|v| !v.is_empty())
}

// ---------------------------------------------------------------------------
// High-level API
// ---------------------------------------------------------------------------

pub fn backend_url() -> Option<String> {
    first_non_empty([get_credential(KEY_BACKEND_URL), env_value(ENV_BACKEND_URL)])
}

pub fn backend_anon_key() -> Option<String> {
    first_non_empty([
        get_credential(KEY_BACKEND_ANON_KEY),
        env_value(ENV_BACKEND_KEY),
    ])
}

/// The backend is usable once both URL and anon key resolve.
pub fn is_configured() -> bool {
    backend_url().is_some() && backend_anon_key().is_some()
}

/// Persist backend credentials received during setup.
pub fn store_backend_credentials(url: &str, anon_key: &str) -> Result<(), String> {
    let url = url.trim().trim_end_matches('/');
    if url.is_empty() {
        return Err("Missing backend URL".into());
    }
    if anon_key.trim().is_empty() {
        return Err("Missing backend anon key".into());
    }
    set_credential(KEY_BACKEND_URL, url)?;
    set_credential(KEY_BACKEND_ANON_KEY, anon_key.trim())?;
    info!("Backend credentials stored");
    Ok(())
}

/// Remove every stored credential.
pub fn clear_credentials() -> Result<(), String> {
    for key in ALL_KEYS {
        delete_credential(key)?;
    }
    info!("Backend credentials cleared");
    Ok(())
}
