//! Typed access to the `settings` key/value table

use chrono::Utc;
use sea_orm::sea_query::OnConflict;
use sea_orm::{ConnectionTrait, DatabaseConnection, EntityTrait, Set};
use tracing::info;
use tunnelgate_db::entities::setting;
use tunnelgate_drivers::{KeyPair, PrivateKey};

use crate::error::{ControlError, Result};

pub const ADDRESS_CURSOR: &str = "address_cursor";
pub const BASE_DOMAIN: &str = "base_domain";
pub const SERVER_PRIVATE_KEY: &str = "server_private_key";
pub const SERVER_PUBLIC_KEY: &str = "server_public_key";

pub async fn get<C: ConnectionTrait>(conn: &C, key: &str) -> Result<Option<String>> {
    let row = setting::Entity::find_by_id(key.to_string()).one(conn).await?;
    Ok(row.map(|r| r.value))
}

/// Insert or overwrite a setting
pub async fn put<C: ConnectionTrait>(conn: &C, key: &str, value: &str) -> Result<()> {
    let row = setting::ActiveModel {
        key: Set(key.to_string()),
        value: Set(value.to_string()),
        updated_at: Set(Utc::now()),
    };

    setting::Entity::insert(row)
        .on_conflict(
            OnConflict::column(setting::Column::Key)
                .update_columns([setting::Column::Value, setting::Column::UpdatedAt])
                .to_owned(),
        )
        .exec(conn)
        .await?;

    Ok(())
}

pub async fn delete<C: ConnectionTrait>(conn: &C, key: &str) -> Result<()> {
    setting::Entity::delete_by_id(key.to_string())
        .exec(conn)
        .await?;
    Ok(())
}

/// Settings accessors shared by the coordinator components
#[derive(Clone)]
pub struct Settings {
    db: DatabaseConnection,
}

impl Settings {
    pub fn new(db: DatabaseConnection) -> Self {
        Self { db }
    }

    pub async fn base_domain(&self) -> Result<Option<String>> {
        get(&self.db, BASE_DOMAIN).await
    }

    /// Base domain or `ConfigurationMissing`
    pub async fn require_base_domain(&self) -> Result<String> {
        self.base_domain()
            .await?
            .ok_or(ControlError::ConfigurationMissing("Base domain"))
    }

    pub async fn set_base_domain(&self, domain: &str) -> Result<String> {
        let domain = normalize_domain(domain)?;
        put(&self.db, BASE_DOMAIN, &domain).await?;
        info!("Base domain set to {}", domain);
        Ok(domain)
    }

    /// Load the server key pair, generating and storing one on first use
    pub async fn server_keypair(&self) -> Result<KeyPair> {
        if let Some(encoded) = get(&self.db, SERVER_PRIVATE_KEY).await? {
            let private =
                PrivateKey::from_base64(&encoded).map_err(|e| ControlError::CorruptRecord {
                    field: SERVER_PRIVATE_KEY.to_string(),
                    reason: e.to_string(),
                })?;
            let keypair = KeyPair::from_private(private);

            // The public half is derived; keep the stored copy in step with it.
            let public = keypair.public.to_base64();
            if get(&self.db, SERVER_PUBLIC_KEY).await?.as_deref() != Some(public.as_str()) {
                put(&self.db, SERVER_PUBLIC_KEY, &public).await?;
            }
            return Ok(keypair);
        }

        let keypair = KeyPair::generate();
        put(&self.db, SERVER_PRIVATE_KEY, &keypair.private.to_base64()).await?;
        put(&self.db, SERVER_PUBLIC_KEY, &keypair.public.to_base64()).await?;
        info!("Generated server key pair (public key {})", keypair.public);

        Ok(keypair)
    }

    pub async fn server_public_key(&self) -> Result<String> {
        match get(&self.db, SERVER_PUBLIC_KEY).await? {
            Some(key) => Ok(key),
            None => Ok(self.server_keypair().await?.public.to_base64()),
        }
    }
}

/// Lowercase a bare host name, rejecting schemes, paths and ports
pub fn normalize_domain(domain: &str) -> Result<String> {
    let domain = domain.trim().trim_end_matches('.').to_ascii_lowercase();

    if domain.is_empty() {
        return Err(ControlError::InvalidRequest(
            "Base domain cannot be empty".to_string(),
        ));
    }

    if domain.len() > 253 {
        return Err(ControlError::InvalidRequest(
            "Base domain too long (max 253 characters)".to_string(),
        ));
    }

    for label in domain.split('.') {
        let valid = !label.is_empty()
            && !label.starts_with('-')
            && !label.ends_with('-')
            && label
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-');
        if !valid {
            return Err(ControlError::InvalidRequest(format!(
                "Base domain '{}' is not a valid host name",
                domain
            )));
        }
    }

    Ok(domain)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_domain() {
        assert_eq!(
            normalize_domain("Tunnels.Example.COM.").unwrap(),
            "tunnels.example.com"
        );
        assert!(normalize_domain("").is_err());
        assert!(normalize_domain("https://example.com").is_err());
        assert!(normalize_domain("example.com:8080").is_err());
        assert!(normalize_domain("-bad.example.com").is_err());
        assert!(normalize_domain("a..b").is_err());
    }
}
