//! Payload normalizer: turn provider webhook bodies into `InboundMessage`s.
//!
//! Bodies arrive as JSON or as form-encoded data using bracket notation
//! (`message[add][0][text]=...`). Both are decoded into a `serde_json::Value` tree
//! first, so every provider shape is matched against the same representation.
//! Nothing here fails: anything that is not a replyable message becomes
//! `Normalized::Ignore` with a reason for the logs.

use serde_json::{Map, Value};

use crate::channels::InboundMessage;

pub const KOMMO_CHANNEL: &str = "kommo";
pub const KOMMO_CHATS_CHANNEL: &str = "kommo-chats";
pub const WAZZUP_CHANNEL: &str = "wazzup";

/// Largest numeric bracket index turned into an array slot; larger ones become object keys.
const MAX_FORM_INDEX: usize = 1000;
/// Keys nested deeper than this many segments are dropped.
const MAX_FORM_DEPTH: usize = 16;
/// Array slots one form body may allocate in total.
const MAX_FORM_SLOTS: usize = 10_000;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Normalized {
    Message(InboundMessage),
    Ignore(IgnoreReason),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IgnoreReason {
    Unparsable,
    UnknownShape,
    MissingText,
    MissingChatId,
    Echo,
    TestPing,
}

impl IgnoreReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            IgnoreReason::Unparsable => "unparsable body",
            IgnoreReason::UnknownShape => "unknown payload shape",
            IgnoreReason::MissingText => "missing text",
            IgnoreReason::MissingChatId => "missing chat id",
            IgnoreReason::Echo => "echo or outgoing message",
            IgnoreReason::TestPing => "test request",
        }
    }
}

impl std::fmt::Display for IgnoreReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Decode a webhook body. Form content types use bracket notation; everything else is tried as
/// JSON first and falls back to form decoding when no content type was given.
pub fn decode_body(body: &[u8], content_type: Option<&str>) -> Option<Value> {
    let ct = content_type.unwrap_or("").to_ascii_lowercase();
    if ct.starts_with("application/x-www-form-urlencoded") {
        return Some(parse_form(body));
    }
    match serde_json::from_slice::<Value>(body) {
        Ok(v) => Some(v),
        Err(_) if ct.is_empty() && body.contains(&b'=') => Some(parse_form(body)),
        Err(_) => None,
    }
}

/// Decode `application/x-www-form-urlencoded` with bracket nesting into a JSON tree.
/// Numeric segments build arrays, `[]` appends, repeated plain keys keep the last value.
pub fn parse_form(body: &[u8]) -> Value {
    let mut root = Value::Object(Map::new());
    let mut slots = MAX_FORM_SLOTS;
    for (key, value) in url::form_urlencoded::parse(body) {
        let Some(segments) = split_key(&key) else {
            log::debug!("form key nested deeper than {} levels dropped", MAX_FORM_DEPTH);
            continue;
        };
        if !insert_path(&mut root, &segments, value.into_owned(), &mut slots) {
            log::debug!("form array slot budget exhausted, key {} dropped", segments[0]);
        }
    }
    root
}

/// Split `a[b][0]` into segments. None when the key has more than `MAX_FORM_DEPTH` segments.
fn split_key(key: &str) -> Option<Vec<String>> {
    let Some(open) = key.find('[') else {
        return Some(vec![key.to_string()]);
    };
    let mut segments = vec![key[..open].to_string()];
    let mut rest = &key[open..];
    while let Some(stripped) = rest.strip_prefix('[') {
        let Some(close) = stripped.find(']') else {
            // Unbalanced bracket: keep the remainder literally.
            let last = segments.pop().unwrap_or_default();
            segments.push(format!("{}{}", last, rest));
            return Some(segments);
        };
        if segments.len() >= MAX_FORM_DEPTH {
            return None;
        }
        segments.push(stripped[..close].to_string());
        rest = &stripped[close + 1..];
    }
    if !rest.is_empty() {
        let last = segments.pop().unwrap_or_default();
        segments.push(format!("{}{}", last, rest));
    }
    Some(segments)
}

fn array_index(segment: &str) -> Option<usize> {
    if segment.is_empty() || !segment.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    segment.parse().ok().filter(|i| *i <= MAX_FORM_INDEX)
}

/// Insert `value` at `segments`. Returns false when the array slot budget would be exceeded.
fn insert_path(node: &mut Value, segments: &[String], value: String, slots: &mut usize) -> bool {
    let Some((seg, rest)) = segments.split_first() else {
        *node = Value::String(value);
        return true;
    };
    let wants_array = seg.is_empty() || array_index(seg).is_some();
    if !node.is_array() && !node.is_object() {
        *node = if wants_array {
            Value::Array(Vec::new())
        } else {
            Value::Object(Map::new())
        };
    } else if node.is_array() && !wants_array {
        // A named key under an indexed container: keep the indexes as object keys.
        if let Value::Array(items) = std::mem::take(node) {
            let map = items
                .into_iter()
                .enumerate()
                .map(|(i, v)| (i.to_string(), v))
                .collect();
            *node = Value::Object(map);
        }
    }
    match node {
        Value::Array(items) => {
            let idx = array_index(seg).unwrap_or(items.len());
            if items.len() <= idx {
                let grow = idx + 1 - items.len();
                if grow > *slots {
                    return false;
                }
                *slots -= grow;
                items.resize(idx + 1, Value::Null);
            }
            insert_path(&mut items[idx], rest, value, slots)
        }
        Value::Object(map) => {
            let key = if seg.is_empty() {
                map.len().to_string()
            } else {
                seg.clone()
            };
            insert_path(map.entry(key).or_insert(Value::Null), rest, value, slots)
        }
        _ => false,
    }
}

/// String or number field as a trimmed, non-empty string.
fn str_field(v: &Value, key: &str) -> Option<String> {
    scalar(v.get(key)?)
}

fn scalar(v: &Value) -> Option<String> {
    let s = match v {
        Value::String(s) => s.trim().to_string(),
        Value::Number(n) => n.to_string(),
        _ => return None,
    };
    if s.is_empty() {
        None
    } else {
        Some(s)
    }
}

fn nested<'a>(v: &'a Value, path: &[&str]) -> Option<&'a Value> {
    path.iter().try_fold(v, |cur, key| cur.get(*key))
}

/// First element of an array, or first value of an index-keyed object.
fn first(v: &Value) -> Option<&Value> {
    match v {
        Value::Array(items) => items.first(),
        Value::Object(map) => map.values().next(),
        _ => None,
    }
}

fn truthy(v: Option<&Value>) -> bool {
    match v {
        Some(Value::Bool(b)) => *b,
        Some(Value::Number(n)) => n.as_i64() == Some(1),
        Some(Value::String(s)) => matches!(s.trim(), "true" | "1"),
        _ => false,
    }
}

fn build(channel: &str, chat_id: Option<String>, text: Option<String>) -> Result<InboundMessage, IgnoreReason> {
    let text = text.ok_or(IgnoreReason::MissingText)?;
    let chat_id = chat_id.ok_or(IgnoreReason::MissingChatId)?;
    Ok(InboundMessage::new(channel, chat_id, text))
}

fn finish(result: Result<InboundMessage, IgnoreReason>) -> Normalized {
    match result {
        Ok(m) => Normalized::Message(m),
        Err(reason) => Normalized::Ignore(reason),
    }
}

/// Kommo CRM webhook: form `message[add][0]`, JSON `message`, or form `notes[add][0]`.
pub fn normalize_kommo(root: &Value) -> Normalized {
    let message = root.get("message");
    if let Some(item) = message.and_then(|m| m.get("add")).and_then(first) {
        return finish(kommo_added_message(item));
    }
    if let Some(m) = message.filter(|m| m.is_object()) {
        return finish(kommo_json_message(m));
    }
    if let Some(item) = nested(root, &["notes", "add"]).and_then(first) {
        return finish(kommo_note(item));
    }
    Normalized::Ignore(IgnoreReason::UnknownShape)
}

fn kommo_linkage(m: &mut InboundMessage, item: &Value) {
    m.linkage.entity_id = str_field(item, "entity_id").or_else(|| str_field(item, "element_id"));
    m.linkage.entity_type =
        str_field(item, "entity_type").or_else(|| str_field(item, "element_type"));
    m.linkage.contact_id = str_field(item, "contact_id");
    m.linkage.dialog_id = str_field(item, "talk_id");
}

fn kommo_added_message(item: &Value) -> Result<InboundMessage, IgnoreReason> {
    if str_field(item, "type").as_deref() == Some("outgoing") {
        return Err(IgnoreReason::Echo);
    }
    let mut m = build(KOMMO_CHANNEL, str_field(item, "chat_id"), str_field(item, "text"))?;
    m.sender_id = nested(item, &["author", "id"])
        .and_then(scalar)
        .or_else(|| str_field(item, "contact_id"));
    m.sender_name = nested(item, &["author", "name"]).and_then(scalar);
    kommo_linkage(&mut m, item);
    Ok(m)
}

fn kommo_json_message(item: &Value) -> Result<InboundMessage, IgnoreReason> {
    if !truthy(item.get("incoming")) {
        return Err(IgnoreReason::Echo);
    }
    let mut m = build(KOMMO_CHANNEL, str_field(item, "chat_id"), str_field(item, "text"))?;
    m.sender_id = str_field(item, "sender_id")
        .or_else(|| nested(item, &["author", "id"]).and_then(scalar))
        .or_else(|| str_field(item, "contact_id"));
    kommo_linkage(&mut m, item);
    Ok(m)
}

fn kommo_note(item: &Value) -> Result<InboundMessage, IgnoreReason> {
    let note = item.get("note").filter(|n| n.is_object()).unwrap_or(item);
    if str_field(note, "type").as_deref() == Some("outgoing") {
        return Err(IgnoreReason::Echo);
    }
    let text = str_field(note, "text").or_else(|| nested(note, &["params", "text"]).and_then(scalar));
    let chat_id = str_field(note, "chat_id")
        .or_else(|| str_field(note, "talk_id"))
        .or_else(|| nested(note, &["params", "chat_id"]).and_then(scalar));
    let mut m = build(KOMMO_CHANNEL, chat_id, text)?;
    m.sender_id = str_field(note, "author_id").or_else(|| str_field(note, "created_by"));
    kommo_linkage(&mut m, note);
    if m.linkage.entity_id.is_none() {
        m.linkage.entity_id = str_field(item, "element_id");
        m.linkage.entity_type = str_field(item, "element_type");
    }
    Ok(m)
}

/// Kommo Chats API hook (`/webhook/chat/:scope_id`). Messages sent by `bot_user_id` are echoes.
pub fn normalize_chats_hook(root: &Value, bot_user_id: &str) -> Normalized {
    let Some(msg) = root.get("message").filter(|m| m.is_object()) else {
        return Normalized::Ignore(IgnoreReason::UnknownShape);
    };
    let sender_id = nested(msg, &["sender", "id"]).and_then(scalar);
    if sender_id.as_deref() == Some(bot_user_id) {
        return Normalized::Ignore(IgnoreReason::Echo);
    }
    let text = nested(msg, &["message", "text"]).and_then(scalar);
    let chat_id = nested(msg, &["conversation", "client_id"])
        .and_then(scalar)
        .or_else(|| nested(msg, &["conversation", "id"]).and_then(scalar));
    finish(build(KOMMO_CHATS_CHANNEL, chat_id, text).map(|mut m| {
        m.sender_id = sender_id;
        m.sender_name = nested(msg, &["sender", "name"]).and_then(scalar);
        m
    }))
}

/// Wazzup webhook: one result per element of `messages`.
pub fn normalize_wazzup(root: &Value) -> Vec<Normalized> {
    if truthy(root.get("test")) {
        return vec![Normalized::Ignore(IgnoreReason::TestPing)];
    }
    match root.get("messages").and_then(|m| m.as_array()) {
        Some(items) if !items.is_empty() => items.iter().map(wazzup_message).collect(),
        _ => vec![Normalized::Ignore(IgnoreReason::UnknownShape)],
    }
}

fn wazzup_message(item: &Value) -> Normalized {
    if truthy(item.get("isEcho")) {
        return Normalized::Ignore(IgnoreReason::Echo);
    }
    if let Some(status) = str_field(item, "status") {
        if status != "inbound" {
            return Normalized::Ignore(IgnoreReason::Echo);
        }
    }
    finish(
        build(WAZZUP_CHANNEL, str_field(item, "chatId"), str_field(item, "text")).map(|mut m| {
            m.sender_id = str_field(item, "chatId");
            m.sender_name = nested(item, &["contact", "name"]).and_then(scalar);
            m.chat_type = str_field(item, "chatType");
            m.source_channel = str_field(item, "channelId");
            m
        }),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn message(n: Normalized) -> InboundMessage {
        match n {
            Normalized::Message(m) => m,
            Normalized::Ignore(r) => panic!("expected message, ignored: {}", r),
        }
    }

    #[test]
    fn form_brackets_build_nested_tree() {
        let body = b"message%5Badd%5D%5B0%5D%5Btext%5D=hola&message[add][0][chat_id]=abc&account[subdomain]=acme";
        let v = parse_form(body);
        assert_eq!(
            v,
            json!({
                "message": {"add": [{"text": "hola", "chat_id": "abc"}]},
                "account": {"subdomain": "acme"}
            })
        );
    }

    #[test]
    fn form_append_and_plain_keys() {
        let v = parse_form(b"tags[]=a&tags[]=b&plain=1&plain=2&odd[x=1");
        assert_eq!(v["tags"], json!(["a", "b"]));
        assert_eq!(v["plain"], json!("2"));
        assert_eq!(v["odd[x"], json!("1"));
    }

    #[test]
    fn form_mixed_index_and_name_becomes_object() {
        let v = parse_form(b"a[0]=x&a[name]=y");
        assert_eq!(v["a"], json!({"0": "x", "name": "y"}));
    }

    #[test]
    fn form_key_too_deep_is_dropped() {
        let deep = format!("message{}=x&plain=1", "[]".repeat(100_000));
        let v = parse_form(deep.as_bytes());
        assert_eq!(v, json!({"plain": "1"}));

        let at_limit = format!("a{}=x", "[b]".repeat(MAX_FORM_DEPTH - 1));
        let v = parse_form(at_limit.as_bytes());
        assert!(v.get("a").is_some());
    }

    #[tokio::test]
    async fn deep_form_webhook_is_ignored_on_worker_thread() {
        let body = format!("message{}=x", "[]".repeat(100_000));
        let event = tokio::spawn(async move {
            normalize_kommo(&parse_form(body.as_bytes()))
        })
        .await
        .unwrap();
        assert_eq!(event, Normalized::Ignore(IgnoreReason::UnknownShape));
    }

    #[test]
    fn form_array_slots_are_capped() {
        let body: String = (0..50)
            .map(|i| format!("k{}[{}]=x", i, MAX_FORM_INDEX))
            .collect::<Vec<_>>()
            .join("&");
        let v = parse_form(body.as_bytes());
        let total: usize = v
            .as_object()
            .unwrap()
            .values()
            .filter_map(|x| x.as_array())
            .map(|a| a.len())
            .sum();
        assert!(total <= MAX_FORM_SLOTS);
        assert!(v.get("k0").is_some());
        assert_eq!(v["k49"].as_array().map_or(0, |a| a.len()), 0);
    }

    #[test]
    fn decode_body_by_content_type() {
        assert_eq!(
            decode_body(br#"{"a":1}"#, Some("application/json")),
            Some(json!({"a": 1}))
        );
        assert_eq!(
            decode_body(b"a=1", Some("application/x-www-form-urlencoded; charset=utf-8")),
            Some(json!({"a": "1"}))
        );
        assert_eq!(decode_body(b"a=1", None), Some(json!({"a": "1"})));
        assert_eq!(decode_body(b"nope", Some("application/json")), None);
    }

    #[test]
    fn kommo_json_incoming_message() {
        let m = message(normalize_kommo(&json!({
            "message": {"chat_id": "c-1", "text": "Hola", "incoming": true}
        })));
        assert_eq!(m.channel_id, "kommo");
        assert_eq!(m.chat_id, "c-1");
        assert_eq!(m.text, "Hola");
    }

    #[test]
    fn kommo_json_not_incoming_is_echo() {
        for payload in [
            json!({"message": {"chat_id": "c", "text": "x", "incoming": false}}),
            json!({"message": {"chat_id": "c", "text": "x"}}),
        ] {
            assert_eq!(
                normalize_kommo(&payload),
                Normalized::Ignore(IgnoreReason::Echo)
            );
        }
    }

    #[test]
    fn kommo_json_missing_fields_are_ignored() {
        assert_eq!(
            normalize_kommo(&json!({"message": {"chat_id": "c", "incoming": true}})),
            Normalized::Ignore(IgnoreReason::MissingText)
        );
        assert_eq!(
            normalize_kommo(&json!({"message": {"text": "hola", "incoming": true}})),
            Normalized::Ignore(IgnoreReason::MissingChatId)
        );
        assert_eq!(
            normalize_kommo(&json!({"leads": {}})),
            Normalized::Ignore(IgnoreReason::UnknownShape)
        );
    }

    #[test]
    fn kommo_form_message_with_linkage() {
        let body = b"message[add][0][text]=precio%3F&message[add][0][chat_id]=chat-9\
&message[add][0][talk_id]=77&message[add][0][contact_id]=55&message[add][0][entity_id]=1001\
&message[add][0][entity_type]=lead&message[add][0][type]=incoming&message[add][0][author][id]=u-1";
        let m = message(normalize_kommo(&parse_form(body)));
        assert_eq!(m.text, "precio?");
        assert_eq!(m.chat_id, "chat-9");
        assert_eq!(m.sender_id.as_deref(), Some("u-1"));
        assert_eq!(m.linkage.entity_id.as_deref(), Some("1001"));
        assert_eq!(m.linkage.entity_type.as_deref(), Some("lead"));
        assert_eq!(m.linkage.contact_id.as_deref(), Some("55"));
        assert_eq!(m.linkage.dialog_id.as_deref(), Some("77"));
    }

    #[test]
    fn kommo_form_outgoing_is_echo() {
        let body = b"message[add][0][text]=hi&message[add][0][chat_id]=c&message[add][0][type]=outgoing";
        assert_eq!(
            normalize_kommo(&parse_form(body)),
            Normalized::Ignore(IgnoreReason::Echo)
        );
    }

    #[test]
    fn kommo_note_shapes() {
        let body = b"notes[add][0][note][text]=buenos%20dias&notes[add][0][note][chat_id]=n-1\
&notes[add][0][note][type]=incoming&notes[add][0][element_id]=900&notes[add][0][element_type]=2";
        let m = message(normalize_kommo(&parse_form(body)));
        assert_eq!(m.text, "buenos dias");
        assert_eq!(m.chat_id, "n-1");
        assert_eq!(m.linkage.entity_id.as_deref(), Some("900"));

        let outgoing = b"notes[add][0][note][text]=x&notes[add][0][note][chat_id]=n&notes[add][0][note][type]=outgoing";
        assert_eq!(
            normalize_kommo(&parse_form(outgoing)),
            Normalized::Ignore(IgnoreReason::Echo)
        );
    }

    #[test]
    fn chats_hook_message_and_echo() {
        let payload = json!({
            "account_id": "acc",
            "message": {
                "sender": {"id": "manager-1", "name": "Ana"},
                "conversation": {"id": "amojo-conv", "client_id": "conv-1"},
                "message": {"type": "text", "text": "hola"}
            }
        });
        let m = message(normalize_chats_hook(&payload, "chatrelay-bot"));
        assert_eq!(m.channel_id, "kommo-chats");
        assert_eq!(m.chat_id, "conv-1");
        assert_eq!(m.sender_name.as_deref(), Some("Ana"));

        assert_eq!(
            normalize_chats_hook(&payload, "manager-1"),
            Normalized::Ignore(IgnoreReason::Echo)
        );
    }

    #[test]
    fn chats_hook_from_default_bot_is_echo() {
        let bot = crate::config::Config::default().kommo.chats.bot_user_id;
        let payload = json!({
            "message": {
                "sender": {"id": bot, "name": "Bot"},
                "conversation": {"client_id": "conv-1"},
                "message": {"type": "text", "text": "hola"}
            }
        });
        assert_eq!(
            normalize_chats_hook(&payload, &bot),
            Normalized::Ignore(IgnoreReason::Echo)
        );
    }

    #[test]
    fn wazzup_messages_and_echo_flags() {
        let payload = json!({
            "messages": [
                {"chatId": "7999", "chatType": "whatsapp", "channelId": "ch-1", "text": "hola", "status": "inbound", "isEcho": false, "contact": {"name": "Luis"}},
                {"chatId": "7999", "text": "eco", "isEcho": true},
                {"chatId": "7999", "text": "sent", "status": "sent"},
                {"chatId": "7999", "type": "image"}
            ]
        });
        let results = normalize_wazzup(&payload);
        assert_eq!(results.len(), 4);
        let m = message(results[0].clone());
        assert_eq!(m.chat_type.as_deref(), Some("whatsapp"));
        assert_eq!(m.source_channel.as_deref(), Some("ch-1"));
        assert_eq!(m.sender_name.as_deref(), Some("Luis"));
        assert_eq!(results[1], Normalized::Ignore(IgnoreReason::Echo));
        assert_eq!(results[2], Normalized::Ignore(IgnoreReason::Echo));
        assert_eq!(results[3], Normalized::Ignore(IgnoreReason::MissingText));
    }

    #[test]
    fn wazzup_test_ping_and_unknown() {
        assert_eq!(
            normalize_wazzup(&json!({"test": true})),
            vec![Normalized::Ignore(IgnoreReason::TestPing)]
        );
        assert_eq!(
            normalize_wazzup(&json!({"statuses": []})),
            vec![Normalized::Ignore(IgnoreReason::UnknownShape)]
        );
    }
}
