use warden_persistence::OutboxStore;

const USAGE: &str = "Usage: /notify on|off|status";

/// Handle `/notify on|off|status` for one chat.
pub fn handle_notify_command(outbox: &OutboxStore, chat_id: &str, command_text: &str) -> String {
    let mut parts = command_text.split_whitespace();
    let _command = parts.next();
    let Some(action) = parts.next() else {
        return USAGE.to_string();
    };

    match action.to_ascii_lowercase().as_str() {
        "on" => match outbox.set_notifications_enabled(chat_id, true) {
            Ok(()) => "Notifications enabled.".to_string(),
            Err(err) => format!("Failed to update notification setting: {err}"),
        },
        "off" => match outbox.set_notifications_enabled(chat_id, false) {
            Ok(()) => "Notifications disabled.".to_string(),
            Err(err) => format!("Failed to update notification setting: {err}"),
        },
        "status" => match outbox.notifications_enabled(chat_id) {
            Ok(true) => "Notifications are ON.".to_string(),
            Ok(false) => "Notifications are OFF.".to_string(),
            Err(err) => format!("Failed to read notification setting: {err}"),
        },
        _ => USAGE.to_string(),
    }
}
