use crate::identity::{is_lid_user, jid_digits, ResolvedIdentity};
use crate::Engine;
use anyhow::Result;
use serde_json::json;
use tracing::{debug, info, instrument};
use zapdesk_core::bus::{contact_event, ROOM_NOTIFICATION};
use zapdesk_core::error::CrmError;
use zapdesk_core::transport::{NumberLookup, WhatsAppTransport};
use zapdesk_core::types::{Contact, NewContact};
use zapdesk_persistence::ContactIdentifiers;

/// Identity of a contact as seen on an incoming message.
#[derive(Debug, Clone)]
pub struct ContactUpsert {
    pub tenant_id: i64,
    pub channel_id: Option<i64>,
    pub name: String,
    /// Raw jid (or bare number) the message came from.
    pub number: String,
    pub is_group: bool,
    pub profile_pic_url: Option<String>,
}

fn canonical_number(raw: &str, is_group: bool) -> String {
    if is_group {
        raw.trim_end_matches("@g.us").to_string()
    } else {
        jid_digits(raw)
    }
}

impl Engine {
    /// Find the contact by any of its identifiers or create it, converging
    /// lid and phone-number views of the same person onto one row.
    #[instrument(skip(self, transport, req), fields(tenant_id = req.tenant_id, number = %req.number))]
    pub async fn upsert_contact(
        &self,
        transport: Option<&dyn WhatsAppTransport>,
        req: ContactUpsert,
    ) -> Result<Contact> {
        let digits = canonical_number(&req.number, req.is_group);
        let identity = match transport {
            Some(t) if !req.is_group => self.identity.resolve(t, &req.number).await,
            _ => ResolvedIdentity {
                preferred: req.number.clone(),
                lid: None,
                phone_number: None,
            },
        };
        let number = identity.phone_number.clone().unwrap_or_else(|| digits.clone());
        // Unmapped lid digits are not a phone number.
        let phone_number = identity
            .phone_number
            .clone()
            .or_else(|| (!req.is_group && !is_lid_user(&req.number)).then(|| digits.clone()));

        let found = self
            .store
            .find_contact_by_identifiers(
                req.tenant_id,
                &ContactIdentifiers {
                    number: &number,
                    preferred_id: Some(&req.number),
                    lid: identity.lid.as_deref(),
                    phone_number: phone_number.as_deref(),
                },
            )
            .await?;

        let (contact, action) = match found {
            Some(mut existing) => {
                if let Some(url) = req.profile_pic_url {
                    existing.profile_pic_url = Some(url);
                }
                existing.preferred_id = Some(identity.preferred.clone());
                if identity.lid.is_some() {
                    existing.lid = identity.lid.clone();
                }
                if identity.phone_number.is_some() {
                    existing.phone_number = identity.phone_number.clone();
                    existing.number = number;
                }
                if existing.channel_id.is_none() {
                    existing.channel_id = req.channel_id;
                }
                (self.store.save_contact(&existing).await?, "update")
            }
            None => {
                let created = self
                    .store
                    .create_contact(&NewContact {
                        tenant_id: req.tenant_id,
                        name: req.name,
                        number,
                        preferred_id: Some(identity.preferred.clone()),
                        lid: identity.lid.clone(),
                        phone_number,
                        profile_pic_url: req.profile_pic_url,
                        is_group: req.is_group,
                        channel_id: req.channel_id,
                    })
                    .await?;
                info!(contact_id = created.id, "Contact created");
                (created, "create")
            }
        };

        self.bus.emit_to_rooms(
            [ROOM_NOTIFICATION],
            &contact_event(req.tenant_id),
            json!({ "action": action, "contact": contact }),
        );
        Ok(contact)
    }

    /// Upsert the sender of a message, fetching its profile picture on the way.
    pub(crate) async fn verify_contact(
        &self,
        transport: &dyn WhatsAppTransport,
        tenant_id: i64,
        channel_id: i64,
        jid: &str,
        name: &str,
        is_group: bool,
    ) -> Result<Contact> {
        let profile_pic_url = match transport.profile_picture_url(jid).await {
            Ok(url) => url,
            Err(e) => {
                debug!(jid = %jid, error = %e, "No profile picture; using placeholder");
                format!(
                    "{}/nopicture.png",
                    self.config.frontend_url.as_deref().unwrap_or_default()
                )
            }
        };
        self.upsert_contact(
            Some(transport),
            ContactUpsert {
                tenant_id,
                channel_id: Some(channel_id),
                name: name.to_string(),
                number: jid.to_string(),
                is_group,
                profile_pic_url: Some(profile_pic_url),
            },
        )
        .await
    }

    /// Agent-initiated contact creation; duplicate numbers are refused.
    pub async fn create_contact(&self, tenant_id: i64, name: &str, number: &str) -> Result<Contact> {
        let digits = jid_digits(number);
        if digits.is_empty() {
            return Err(CrmError::InvalidContact.into());
        }
        if self.store.find_contact_by_number(tenant_id, &digits).await?.is_some() {
            return Err(CrmError::DuplicateContact.into());
        }
        let contact = self
            .store
            .create_contact(&NewContact {
                tenant_id,
                name: name.to_string(),
                number: digits.clone(),
                phone_number: Some(digits),
                ..Default::default()
            })
            .await?;
        self.bus.emit_to_rooms(
            [ROOM_NOTIFICATION],
            &contact_event(tenant_id),
            json!({ "action": "create", "contact": contact }),
        );
        Ok(contact)
    }

    /// Ask the network whether the number has WhatsApp at all.
    pub async fn check_is_valid_contact(
        &self,
        transport: &dyn WhatsAppTransport,
        number: &str,
    ) -> Result<(), CrmError> {
        let found = transport
            .on_whatsapp(number)
            .await
            .map_err(|_| CrmError::CheckContactFailed)?;
        match found.first() {
            Some(lookup) if !lookup.jid.is_empty() => Ok(()),
            _ => Err(CrmError::InvalidContact),
        }
    }

    pub async fn check_number(
        &self,
        transport: &dyn WhatsAppTransport,
        number: &str,
    ) -> Result<NumberLookup, CrmError> {
        let jid = format!("{}@s.whatsapp.net", jid_digits(number));
        let found = transport
            .on_whatsapp(&jid)
            .await
            .map_err(|_| CrmError::CheckContactFailed)?;
        found
            .into_iter()
            .find(|lookup| lookup.exists)
            .ok_or(CrmError::NumberNotFound)
    }
}
