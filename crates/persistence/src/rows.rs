use sqlx::sqlite::SqliteRow;
use sqlx::Row;
use tracing::warn;
use zapdesk_core::types::{
    Channel, Contact, Integration, IntegrationKind, Message, Prompt, Queue, QueueOption,
    ScheduleEntry, Tenant, Ticket, TicketStatus, TicketTracking, User, UserRating,
};

fn decode_err(column: &str, reason: String) -> sqlx::Error {
    sqlx::Error::ColumnDecode {
        index: column.to_string(),
        source: reason.into(),
    }
}

/// Malformed schedule JSON degrades to an empty table.
fn schedules(row: &SqliteRow) -> sqlx::Result<Vec<ScheduleEntry>> {
    let raw: String = row.try_get("schedules")?;
    Ok(serde_json::from_str(&raw).unwrap_or_else(|e| {
        warn!(error = %e, "Ignoring malformed schedule table");
        Vec::new()
    }))
}

pub(crate) fn contact(row: &SqliteRow) -> sqlx::Result<Contact> {
    Ok(Contact {
        id: row.try_get("id")?,
        tenant_id: row.try_get("tenant_id")?,
        name: row.try_get("name")?,
        number: row.try_get("number")?,
        preferred_id: row.try_get("preferred_id")?,
        lid: row.try_get("lid")?,
        phone_number: row.try_get("phone_number")?,
        profile_pic_url: row.try_get("profile_pic_url")?,
        is_group: row.try_get("is_group")?,
        ignore_messages: row.try_get("ignore_messages")?,
        channel_id: row.try_get("channel_id")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

pub(crate) fn ticket(row: &SqliteRow) -> sqlx::Result<Ticket> {
    let status: String = row.try_get("status")?;
    let status: TicketStatus = status.parse().map_err(|e| decode_err("status", e))?;
    Ok(Ticket {
        id: row.try_get("id")?,
        tenant_id: row.try_get("tenant_id")?,
        contact_id: row.try_get("contact_id")?,
        channel_id: row.try_get("channel_id")?,
        status,
        user_id: row.try_get("user_id")?,
        queue_id: row.try_get("queue_id")?,
        queue_option_id: row.try_get("queue_option_id")?,
        chatbot: row.try_get("chatbot")?,
        use_integration: row.try_get("use_integration")?,
        integration_id: row.try_get("integration_id")?,
        prompt_id: row.try_get("prompt_id")?,
        amount_used_bot_queues: row.try_get("amount_used_bot_queues")?,
        last_message: row.try_get("last_message")?,
        from_me: row.try_get("from_me")?,
        is_group: row.try_get("is_group")?,
        unread_messages: row.try_get("unread_messages")?,
        awaiting_queue_selection: row.try_get("awaiting_queue_selection")?,
        version: row.try_get("version")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

pub(crate) fn tracking(row: &SqliteRow) -> sqlx::Result<TicketTracking> {
    Ok(TicketTracking {
        id: row.try_get("id")?,
        ticket_id: row.try_get("ticket_id")?,
        tenant_id: row.try_get("tenant_id")?,
        channel_id: row.try_get("channel_id")?,
        user_id: row.try_get("user_id")?,
        queued_at: row.try_get("queued_at")?,
        started_at: row.try_get("started_at")?,
        chatbot_at: row.try_get("chatbot_at")?,
        rating_at: row.try_get("rating_at")?,
        finished_at: row.try_get("finished_at")?,
        closed_at: row.try_get("closed_at")?,
        rated: row.try_get("rated")?,
        created_at: row.try_get("created_at")?,
    })
}

pub(crate) fn message(row: &SqliteRow) -> sqlx::Result<Message> {
    Ok(Message {
        id: row.try_get("id")?,
        tenant_id: row.try_get("tenant_id")?,
        ticket_id: row.try_get("ticket_id")?,
        contact_id: row.try_get("contact_id")?,
        body: row.try_get("body")?,
        from_me: row.try_get("from_me")?,
        read: row.try_get("read")?,
        media_url: row.try_get("media_url")?,
        media_type: row.try_get("media_type")?,
        quoted_msg_id: row.try_get("quoted_msg_id")?,
        ack: row.try_get("ack")?,
        remote_jid: row.try_get("remote_jid")?,
        participant: row.try_get("participant")?,
        data_json: row.try_get("data_json")?,
        is_edited: row.try_get("is_edited")?,
        created_at: row.try_get("created_at")?,
    })
}

pub(crate) fn queue(row: &SqliteRow) -> sqlx::Result<Queue> {
    Ok(Queue {
        id: row.try_get("id")?,
        tenant_id: row.try_get("tenant_id")?,
        name: row.try_get("name")?,
        greeting_message: row.try_get("greeting_message")?,
        out_of_hours_message: row.try_get("out_of_hours_message")?,
        schedules: schedules(row)?,
        integration_id: row.try_get("integration_id")?,
        prompt_id: row.try_get("prompt_id")?,
    })
}

pub(crate) fn queue_option(row: &SqliteRow) -> sqlx::Result<QueueOption> {
    Ok(QueueOption {
        id: row.try_get("id")?,
        queue_id: row.try_get("queue_id")?,
        parent_id: row.try_get("parent_id")?,
        option: row.try_get("option_code")?,
        title: row.try_get("title")?,
        message: row.try_get("message")?,
    })
}

pub(crate) fn channel(row: &SqliteRow) -> sqlx::Result<Channel> {
    Ok(Channel {
        id: row.try_get("id")?,
        tenant_id: row.try_get("tenant_id")?,
        name: row.try_get("name")?,
        greeting_message: row.try_get("greeting_message")?,
        completion_message: row.try_get("completion_message")?,
        out_of_hours_message: row.try_get("out_of_hours_message")?,
        rating_message: row.try_get("rating_message")?,
        transfer_message: row.try_get("transfer_message")?,
        prompt_id: row.try_get("prompt_id")?,
        integration_id: row.try_get("integration_id")?,
        max_use_bot_queues: row.try_get("max_use_bot_queues")?,
        time_use_bot_queues: row.try_get("time_use_bot_queues")?,
        expires_ticket: row.try_get("expires_ticket")?,
        expires_inactive_message: row.try_get("expires_inactive_message")?,
    })
}

pub(crate) fn tenant(row: &SqliteRow) -> sqlx::Result<Tenant> {
    Ok(Tenant {
        id: row.try_get("id")?,
        name: row.try_get("name")?,
        schedules: schedules(row)?,
    })
}

pub(crate) fn prompt(row: &SqliteRow) -> sqlx::Result<Prompt> {
    Ok(Prompt {
        id: row.try_get("id")?,
        tenant_id: row.try_get("tenant_id")?,
        name: row.try_get("name")?,
        prompt: row.try_get("prompt")?,
        api_key: row.try_get("api_key")?,
        max_tokens: row.try_get("max_tokens")?,
        max_messages: row.try_get("max_messages")?,
        temperature: row.try_get("temperature")?,
        voice: row.try_get("voice")?,
        voice_key: row.try_get("voice_key")?,
        voice_region: row.try_get("voice_region")?,
        queue_id: row.try_get("queue_id")?,
    })
}

pub(crate) fn integration(row: &SqliteRow) -> sqlx::Result<Integration> {
    let kind: String = row.try_get("kind")?;
    let kind: IntegrationKind = kind.parse().map_err(|e| decode_err("kind", e))?;
    Ok(Integration {
        id: row.try_get("id")?,
        tenant_id: row.try_get("tenant_id")?,
        name: row.try_get("name")?,
        kind,
        url: row.try_get("url")?,
        project_name: row.try_get("project_name")?,
        language: row.try_get("language")?,
    })
}

pub(crate) fn user(row: &SqliteRow) -> sqlx::Result<User> {
    Ok(User {
        id: row.try_get("id")?,
        tenant_id: row.try_get("tenant_id")?,
        name: row.try_get("name")?,
    })
}

pub(crate) fn user_rating(row: &SqliteRow) -> sqlx::Result<UserRating> {
    Ok(UserRating {
        id: row.try_get("id")?,
        ticket_id: row.try_get("ticket_id")?,
        tenant_id: row.try_get("tenant_id")?,
        user_id: row.try_get("user_id")?,
        rate: row.try_get("rate")?,
        created_at: row.try_get("created_at")?,
    })
}
