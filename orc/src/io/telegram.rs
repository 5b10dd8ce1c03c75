//! Telegram side channel for the User/Admin Broker (§4.5, §6 Telegram
//! protocol).
//!
//! Grounded directly in `original_source/telegram_client.py`'s
//! `_post`/`send_message`/`poll_updates`/`filter_messages` shape, using
//! `reqwest::blocking` in place of raw `urllib`.

use std::collections::HashSet;

use anyhow::{Context, Result};
use serde_json::Value;
use tracing::{debug, warn};

use crate::io::broker::{TelegramChannel, TelegramReply};

pub struct TelegramClient {
    bot_token: String,
    chat_id: String,
    allowed_user_ids: HashSet<i64>,
    client: reqwest::blocking::Client,
    offset: Option<i64>,
}

impl TelegramClient {
    pub fn new(bot_token: impl Into<String>, chat_id: impl Into<String>, allowed_user_ids: Vec<i64>) -> Self {
        Self {
            bot_token: bot_token.into(),
            chat_id: chat_id.into(),
            allowed_user_ids: allowed_user_ids.into_iter().collect(),
            client: reqwest::blocking::Client::new(),
            offset: None,
        }
    }

    pub fn with_offset(mut self, offset: Option<i64>) -> Self {
        self.offset = offset;
        self
    }

    pub fn offset(&self) -> Option<i64> {
        self.offset
    }

    fn base_url(&self) -> String {
        format!("https://api.telegram.org/bot{}", self.bot_token)
    }

    pub fn send_message(&self, text: &str) -> Result<bool> {
        if self.bot_token.is_empty() || self.chat_id.is_empty() {
            return Ok(false);
        }
        let url = format!("{}/sendMessage", self.base_url());
        let response: Value = self
            .client
            .post(url)
            .form(&[("chat_id", self.chat_id.as_str()), ("text", text)])
            .send()
            .context("send telegram message")?
            .json()
            .context("parse telegram response")?;
        let ok = response.get("ok").and_then(Value::as_bool).unwrap_or(false);
        if !ok {
            warn!(response = %response, "sendMessage failed");
        }
        Ok(ok)
    }

    fn poll_updates(&mut self) -> Result<Vec<Value>> {
        if self.bot_token.is_empty() {
            return Ok(Vec::new());
        }
        let url = format!("{}/getUpdates", self.base_url());
        let mut form = vec![("timeout", "2".to_string())];
        if let Some(offset) = self.offset {
            form.push(("offset", offset.to_string()));
        }
        let response: Value = self
            .client
            .post(url)
            .form(&form)
            .send()
            .context("poll telegram updates")?
            .json()
            .context("parse telegram updates")?;

        if !response.get("ok").and_then(Value::as_bool).unwrap_or(false) {
            return Ok(Vec::new());
        }
        let updates = response
            .get("result")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();

        if let Some(last) = updates.iter().filter_map(|u| u.get("update_id").and_then(Value::as_i64)).max() {
            self.offset = Some(last + 1);
        }
        Ok(updates)
    }

    fn filter_messages(&self, updates: &[Value]) -> Vec<Value> {
        updates
            .iter()
            .filter_map(|item| item.get("message").or_else(|| item.get("edited_message")))
            .filter(|message| {
                let user_id = message.get("from").and_then(|f| f.get("id")).and_then(Value::as_i64);
                if !self.allowed_user_ids.is_empty()
                    && !user_id.is_some_and(|id| self.allowed_user_ids.contains(&id))
                {
                    return false;
                }
                let chat_id = message
                    .get("chat")
                    .and_then(|c| c.get("id"))
                    .map(|id| id.to_string())
                    .unwrap_or_default();
                chat_id.is_empty() || self.chat_id.is_empty() || chat_id == self.chat_id
            })
            .cloned()
            .collect()
    }
}

impl TelegramChannel for TelegramClient {
    fn poll_reply(&mut self, request_id: &str) -> Result<Option<TelegramReply>> {
        let updates = self.poll_updates()?;
        let messages = self.filter_messages(&updates);
        for message in messages {
            let text = message.get("text").and_then(Value::as_str).unwrap_or("");
            if let Some(reply) = parse_reply(text, request_id) {
                debug!(request_id, "matched telegram reply");
                return Ok(Some(reply));
            }
        }
        Ok(None)
    }

    fn notify(&mut self, text: &str) -> Result<()> {
        TelegramClient::send_message(self, text).map(|_| ())
    }

    fn offset(&self) -> Option<i64> {
        self.offset
    }
}

/// Admin/user replies must carry `request_id: <id>` and either `choose <N>`
/// (with optional `notes: …`), `task: …`, or free-form text. Unrecognized or
/// stale request ids are ignored (§6 Telegram protocol).
fn parse_reply(text: &str, expected_request_id: &str) -> Option<TelegramReply> {
    let mut found_id = false;
    let mut choice: Option<i64> = None;
    let mut notes: Option<String> = None;
    let mut task: Option<String> = None;
    let mut rest: Vec<&str> = Vec::new();

    for line in text.lines() {
        let trimmed = line.trim();
        if let Some(id) = trimmed.strip_prefix("request_id:") {
            if id.trim() != expected_request_id {
                return None;
            }
            found_id = true;
        } else if let Some(n) = trimmed.strip_prefix("choose ") {
            choice = n.trim().parse::<i64>().ok();
        } else if let Some(n) = trimmed.strip_prefix("notes:") {
            notes = Some(n.trim().to_string());
        } else if let Some(t) = trimmed.strip_prefix("task:") {
            task = Some(t.trim().to_string());
        } else if !trimmed.is_empty() {
            rest.push(trimmed);
        }
    }

    if !found_id {
        return None;
    }
    if let Some(n) = choice {
        return Some(TelegramReply::Choice(n, notes));
    }
    if let Some(t) = task {
        return Some(TelegramReply::Task(t));
    }
    Some(TelegramReply::Text(rest.join("\n")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_reply_recognizes_choose_and_notes() {
        let text = "request_id: abc\nchoose 2\nnotes: go with candidate 2";
        match parse_reply(text, "abc") {
            Some(TelegramReply::Choice(n, notes)) => {
                assert_eq!(n, 2);
                assert_eq!(notes.as_deref(), Some("go with candidate 2"));
            }
            other => panic!("expected Choice, got {other:?}"),
        }
    }

    #[test]
    fn parse_reply_recognizes_task() {
        let text = "request_id: xyz\ntask: fix the login bug";
        match parse_reply(text, "xyz") {
            Some(TelegramReply::Task(task)) => assert_eq!(task, "fix the login bug"),
            other => panic!("expected Task, got {other:?}"),
        }
    }

    #[test]
    fn parse_reply_ignores_mismatched_request_id() {
        assert!(parse_reply("request_id: other\nchoose 1", "abc").is_none());
    }

    #[test]
    fn parse_reply_falls_back_to_free_text() {
        match parse_reply("request_id: abc\nThrow an error instead.", "abc") {
            Some(TelegramReply::Text(text)) => assert_eq!(text, "Throw an error instead."),
            other => panic!("expected Text, got {other:?}"),
        }
    }

    #[test]
    fn filter_messages_respects_allowed_user_ids() {
        let client = TelegramClient::new("token", "123", vec![42]);
        let updates = serde_json::json!([
            {"update_id": 1, "message": {"from": {"id": 42}, "chat": {"id": 123}, "text": "hi"}},
            {"update_id": 2, "message": {"from": {"id": 99}, "chat": {"id": 123}, "text": "nope"}},
        ]);
        let messages = client.filter_messages(updates.as_array().unwrap());
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0]["text"], "hi");
    }
}
