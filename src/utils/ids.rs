//! Identifier generators for downstream-facing objects.

use uuid::Uuid;

/// Tool-call id in the OpenAI `call_...` shape, for upstream frames that
/// arrive without a `toolUseId`.
pub fn generate_tool_call_id() -> String {
    let simple = Uuid::new_v4().simple().to_string();
    format!("call_{}", &simple[..12])
}

/// `chatcmpl-...` id for OpenAI completion responses and chunks.
pub fn generate_completion_id() -> String {
    format!("chatcmpl-{}", Uuid::new_v4())
}

/// `msg_...` id for Anthropic message envelopes.
pub fn generate_message_id() -> String {
    let simple = Uuid::new_v4().simple().to_string();
    format!("msg_{}", &simple[..24])
}

/// Fresh conversation id for each upstream payload.
pub fn generate_conversation_id() -> String {
    Uuid::new_v4().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn id_prefixes_match_their_dialects() {
        assert!(generate_tool_call_id().starts_with("call_"));
        assert!(generate_completion_id().starts_with("chatcmpl-"));
        assert!(generate_message_id().starts_with("msg_"));
    }

    #[test]
    fn conversation_ids_are_unique() {
        assert_ne!(generate_conversation_id(), generate_conversation_id());
    }
}
