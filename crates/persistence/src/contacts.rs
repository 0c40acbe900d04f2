use crate::{rows, SqliteStore};
use anyhow::{Context, Result};
use chrono::Utc;
use tracing::instrument;
use zapdesk_core::types::{Contact, NewContact};

/// Identifier columns a contact lookup may match on.
#[derive(Debug, Clone, Default)]
pub struct ContactIdentifiers<'a> {
    pub number: &'a str,
    pub preferred_id: Option<&'a str>,
    pub lid: Option<&'a str>,
    pub phone_number: Option<&'a str>,
}

impl SqliteStore {
    #[instrument(skip(self))]
    pub async fn get_contact(&self, id: i64) -> Result<Option<Contact>> {
        let row = sqlx::query("SELECT * FROM contacts WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .context("Failed to load contact")?;
        row.map(|r| rows::contact(&r)).transpose().map_err(Into::into)
    }

    #[instrument(skip(self))]
    pub async fn find_contact_by_number(&self, tenant_id: i64, number: &str) -> Result<Option<Contact>> {
        let row = sqlx::query("SELECT * FROM contacts WHERE tenant_id = ? AND number = ? LIMIT 1")
            .bind(tenant_id)
            .bind(number)
            .fetch_optional(&self.pool)
            .await
            .context("Failed to find contact by number")?;
        row.map(|r| rows::contact(&r)).transpose().map_err(Into::into)
    }

    /// Match on any identifier column so the same person is found whichever
    /// namespace the transport used last time.
    #[instrument(skip(self))]
    pub async fn find_contact_by_identifiers(
        &self,
        tenant_id: i64,
        ids: &ContactIdentifiers<'_>,
    ) -> Result<Option<Contact>> {
        let preferred = ids.preferred_id.unwrap_or(ids.number);
        let row = sqlx::query(
            r#"
            SELECT * FROM contacts
            WHERE tenant_id = ?
              AND (number = ? OR preferred_id = ? OR lid = ? OR phone_number = ?
                   OR lid = ? OR phone_number = ?)
            ORDER BY id ASC
            LIMIT 1
            "#,
        )
        .bind(tenant_id)
        .bind(ids.number)
        .bind(preferred)
        .bind(ids.lid)
        .bind(ids.phone_number)
        .bind(preferred)
        .bind(preferred)
        .fetch_optional(&self.pool)
        .await
        .context("Failed to look up contact")?;
        row.map(|r| rows::contact(&r)).transpose().map_err(Into::into)
    }

    #[instrument(skip(self))]
    pub async fn create_contact(&self, contact: &NewContact) -> Result<Contact> {
        let now = Utc::now();
        let row = sqlx::query(
            r#"
            INSERT INTO contacts
                (tenant_id, name, number, preferred_id, lid, phone_number, profile_pic_url,
                 is_group, channel_id, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            RETURNING *
            "#,
        )
        .bind(contact.tenant_id)
        .bind(&contact.name)
        .bind(&contact.number)
        .bind(&contact.preferred_id)
        .bind(&contact.lid)
        .bind(&contact.phone_number)
        .bind(&contact.profile_pic_url)
        .bind(contact.is_group)
        .bind(contact.channel_id)
        .bind(now)
        .bind(now)
        .fetch_one(&self.pool)
        .await
        .context("Failed to insert contact")?;
        Ok(rows::contact(&row)?)
    }

    /// Persist the mutable fields of an already loaded contact.
    #[instrument(skip(self, contact), fields(contact_id = contact.id))]
    pub async fn save_contact(&self, contact: &Contact) -> Result<Contact> {
        let row = sqlx::query(
            r#"
            UPDATE contacts
            SET name = ?, number = ?, preferred_id = ?, lid = ?, phone_number = ?,
                profile_pic_url = ?, ignore_messages = ?, channel_id = ?, updated_at = ?
            WHERE id = ?
            RETURNING *
            "#,
        )
        .bind(&contact.name)
        .bind(&contact.number)
        .bind(&contact.preferred_id)
        .bind(&contact.lid)
        .bind(&contact.phone_number)
        .bind(&contact.profile_pic_url)
        .bind(contact.ignore_messages)
        .bind(contact.channel_id)
        .bind(Utc::now())
        .bind(contact.id)
        .fetch_one(&self.pool)
        .await
        .context("Failed to update contact")?;
        Ok(rows::contact(&row)?)
    }

    /// Backfill lid columns on every contact stored under the phone number.
    #[instrument(skip(self))]
    pub async fn apply_lid_mapping(
        &self,
        tenant_id: i64,
        pn_digits: &str,
        lid: &str,
        phone_number: &str,
    ) -> Result<Vec<Contact>> {
        let updated = sqlx::query(
            r#"
            UPDATE contacts
            SET lid = ?, phone_number = ?, preferred_id = ?, updated_at = ?
            WHERE tenant_id = ? AND number = ?
            RETURNING *
            "#,
        )
        .bind(lid)
        .bind(phone_number)
        .bind(lid)
        .bind(Utc::now())
        .bind(tenant_id)
        .bind(pn_digits)
        .fetch_all(&self.pool)
        .await
        .context("Failed to apply lid mapping")?;
        updated
            .iter()
            .map(rows::contact)
            .collect::<sqlx::Result<Vec<_>>>()
            .map_err(Into::into)
    }

    #[instrument(skip(self))]
    pub async fn count_contacts(&self, tenant_id: i64) -> Result<i64> {
        let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM contacts WHERE tenant_id = ?")
            .bind(tenant_id)
            .fetch_one(&self.pool)
            .await
            .context("Failed to count contacts")?;
        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn store_with_tenant() -> SqliteStore {
        let store = SqliteStore::in_memory().await.unwrap();
        store.create_tenant("Acme", &[]).await.unwrap();
        store
    }

    fn new_contact(number: &str) -> NewContact {
        NewContact {
            tenant_id: 1,
            name: "Maria".to_string(),
            number: number.to_string(),
            preferred_id: Some(format!("{number}@s.whatsapp.net")),
            phone_number: Some(format!("{number}@s.whatsapp.net")),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_lookup_matches_any_identifier_column() {
        let store = store_with_tenant().await;
        let created = store.create_contact(&new_contact("5511999990000")).await.unwrap();

        let by_phone = store
            .find_contact_by_identifiers(
                1,
                &ContactIdentifiers {
                    number: "0000",
                    preferred_id: Some("5511999990000@s.whatsapp.net"),
                    lid: None,
                    phone_number: None,
                },
            )
            .await
            .unwrap();
        assert_eq!(by_phone.map(|c| c.id), Some(created.id));

        let other_tenant = store
            .find_contact_by_identifiers(
                2,
                &ContactIdentifiers {
                    number: "5511999990000",
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert!(other_tenant.is_none());
    }

    #[tokio::test]
    async fn test_lid_mapping_backfills_by_number() {
        let store = store_with_tenant().await;
        store.create_contact(&new_contact("5511999990000")).await.unwrap();

        let updated = store
            .apply_lid_mapping(1, "5511999990000", "123456@lid", "5511999990000@s.whatsapp.net")
            .await
            .unwrap();
        assert_eq!(updated.len(), 1);
        assert_eq!(updated[0].lid.as_deref(), Some("123456@lid"));

        let found = store
            .find_contact_by_identifiers(
                1,
                &ContactIdentifiers {
                    number: "123456",
                    preferred_id: Some("123456@lid"),
                    lid: Some("123456@lid"),
                    phone_number: None,
                },
            )
            .await
            .unwrap();
        assert!(found.is_some());
    }
}
