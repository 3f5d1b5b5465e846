// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
/// Default system prompt used when the host supplies no override.
const DEFAULT_SYSTEM_PROMPT: &str = "\
You are a capable assistant operating inside an automated session. \
When tools are available, prefer calling them over guessing; report tool \
failures honestly and continue with the best available information. \
Keep responses concise and grounded in the conversation.";

/// Assemble the system prompt for a session.
pub fn system_prompt(custom: Option<&str>) -> String {
    match custom {
        Some(text) if !text.trim().is_empty() => text.to_string(),
        _ => DEFAULT_SYSTEM_PROMPT.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_prompt_when_no_override() {
        assert!(system_prompt(None).contains("assistant"));
    }

    #[test]
    fn override_replaces_default_entirely() {
        assert_eq!(system_prompt(Some("be terse")), "be terse");
    }

    #[test]
    fn blank_override_falls_back_to_default() {
        assert_eq!(system_prompt(Some("   ")), system_prompt(None));
    }
}
