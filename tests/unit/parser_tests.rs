use agent_bridge::permission::PermissionBehavior;
use agent_bridge::slack::handlers::{
    leading_mention, parse_continuation, parse_mention, parse_permission_response,
};

// ─── New-task directive parsing ───────────────────────────────────────

#[test]
fn parses_task_name_and_instructions() {
    let parsed = parse_mention("<@U0BOT> demo: hello world").expect("directive");
    assert_eq!(parsed.task_name, "demo");
    assert_eq!(parsed.instructions, "hello world");
}

#[test]
fn task_name_is_lowercased() {
    let parsed = parse_mention("<@U0BOT> Deploy: ship it").expect("directive");
    assert_eq!(parsed.task_name, "deploy");
}

#[test]
fn directive_without_colon_is_rejected() {
    assert!(parse_mention("<@U0BOT> just some words").is_none());
    assert!(parse_mention("no mention at all").is_none());
    assert!(parse_mention("<@U0BOT>").is_none());
}

// ─── Continuation parsing ─────────────────────────────────────────────

#[test]
fn continuation_strips_leading_mention() {
    assert_eq!(parse_continuation("<@U0BOT> add tests"), "add tests");
    assert_eq!(parse_continuation("<@U0BOT>   spaced   "), "spaced");
}

#[test]
fn continuation_without_mention_passes_through_trimmed() {
    assert_eq!(parse_continuation("  add tests  "), "add tests");
}

#[test]
fn leading_mention_extracts_user_id() {
    assert_eq!(leading_mention("<@U123ABC> hi").as_deref(), Some("U123ABC"));
    assert_eq!(leading_mention("hi <@U123ABC>"), None);
}

// ─── Permission text fallback ─────────────────────────────────────────

#[test]
fn affirmative_words_allow() {
    for word in ["yes", "y", "allow", "ok", "approve", "approved", "accept", "yep", "yeah", "sure"]
    {
        let response = parse_permission_response(word).unwrap_or_else(|| panic!("{word} parses"));
        assert_eq!(response.behavior, PermissionBehavior::Allow, "word: {word}");
    }
}

#[test]
fn negative_words_deny() {
    for word in ["no", "n", "deny", "denied", "reject", "rejected", "nope", "nah"] {
        let response = parse_permission_response(word).unwrap_or_else(|| panic!("{word} parses"));
        assert_eq!(response.behavior, PermissionBehavior::Deny, "word: {word}");
    }
}

#[test]
fn matching_is_case_insensitive_and_trims() {
    assert_eq!(
        parse_permission_response("  YES  ").map(|r| r.behavior),
        Some(PermissionBehavior::Allow)
    );
    assert_eq!(
        parse_permission_response("Nope").map(|r| r.behavior),
        Some(PermissionBehavior::Deny)
    );
}

#[test]
fn anything_else_is_not_a_decision() {
    for text in ["maybe", "yes please", "allow it", "sounds good", ""] {
        assert!(parse_permission_response(text).is_none(), "text: {text}");
    }
}
