use crate::cards::CardPayload;

/// Builds the context block accompanying a production request: the source
/// card's non-empty fields as `name: value` lines, then its tags. Field
/// order follows the card's field map.
pub fn build_card_context(payload: &CardPayload) -> String {
    let mut lines: Vec<String> = payload
        .fields
        .iter()
        .filter(|(_, value)| !value.trim().is_empty())
        .map(|(name, value)| format!("{}: {}", name, value.trim()))
        .collect();
    if !payload.tags.is_empty() {
        lines.push(format!("Tags: {}", payload.tags.join(", ")));
    }
    lines.join("\n")
}
