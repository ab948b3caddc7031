use anyhow::{Context, Result};
use std::path::PathBuf;
use tracing::info;
use uuid::Uuid;

/// Who this process is on the signaling hub: the persisted peer id plus the
/// access password and its digest.
#[derive(Debug, Clone)]
pub struct Identity {
    /// Stable peer id: an uppercase v4 UUID persisted across runs.
    pub local_id: String,
    /// Plain access password the operator shares out-of-band.
    pub local_pwd: String,
    /// Uppercase hex MD5 of `local_pwd`; what remote peers present as
    /// `receiver_pwd`.
    pub local_pwd_md5: String,
}

impl Identity {
    /// Build the identity from the configured password, generating and
    /// persisting whatever is missing.
    pub fn load(configured_pwd: &str) -> Result<Self> {
        let local_id = load_or_create_uuid()?;
        let local_pwd = if configured_pwd.is_empty() || Uuid::parse_str(configured_pwd).is_err() {
            Uuid::new_v4().to_string().to_uppercase()
        } else {
            configured_pwd.to_string()
        };
        let local_pwd_md5 = pwd_md5(&local_pwd);
        info!(id = %local_id, "local identity ready");
        Ok(Self {
            local_id,
            local_pwd,
            local_pwd_md5,
        })
    }
}

/// Uppercase hex MD5 of a password, the digest form used everywhere on the
/// wire.
pub fn pwd_md5(pwd: &str) -> String {
    format!("{:X}", md5::compute(pwd.as_bytes()))
}

fn uuid_path() -> Result<PathBuf> {
    let base = dirs::config_dir().context("no config directory on this platform")?;
    Ok(base.join("airan").join("uuid"))
}

/// Read the persisted peer id, creating one on first run. Equivalent of the
/// desktop build's `Global/Uuid` settings entry.
fn load_or_create_uuid() -> Result<String> {
    let path = uuid_path()?;
    if let Ok(stored) = std::fs::read_to_string(&path) {
        let stored = stored.trim().to_uppercase();
        if Uuid::parse_str(&stored).is_ok() {
            return Ok(stored);
        }
    }
    let fresh = Uuid::new_v4().to_string().to_uppercase();
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("creating {}", parent.display()))?;
    }
    std::fs::write(&path, &fresh).with_context(|| format!("writing {}", path.display()))?;
    Ok(fresh)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn md5_is_uppercase_hex() {
        // Reference digest of the empty string.
        assert_eq!(pwd_md5(""), "D41D8CD98F00B204E9800998ECF8427E");
        let digest = pwd_md5("E8A1B2C3-0000-4000-8000-123456789ABC");
        assert_eq!(digest.len(), 32);
        assert!(digest.chars().all(|c| c.is_ascii_digit() || c.is_ascii_uppercase()));
    }

    #[test]
    fn generated_password_is_a_uuid() {
        let identity = Identity::load("").unwrap();
        assert!(Uuid::parse_str(&identity.local_pwd).is_ok());
        assert_eq!(identity.local_pwd, identity.local_pwd.to_uppercase());
        assert_eq!(identity.local_pwd_md5, pwd_md5(&identity.local_pwd));
    }

    #[test]
    fn configured_password_is_kept() {
        let pwd = "6BA7B810-9DAD-11D1-80B4-00C04FD430C8";
        let identity = Identity::load(pwd).unwrap();
        assert_eq!(identity.local_pwd, pwd);
    }
}
