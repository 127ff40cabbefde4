use agent_bridge::auth::Allowlist;

#[test]
fn member_is_allowed() {
    let auth = Allowlist::new(["U1".to_owned(), "U2".to_owned()]);
    assert!(auth.is_allowed("U1"));
    assert!(auth.is_allowed("U2"));
}

#[test]
fn non_member_is_denied() {
    let auth = Allowlist::new(["U1".to_owned()]);
    assert!(!auth.is_allowed("U3"));
}

#[test]
fn empty_allowlist_rejects_every_identity() {
    let auth = Allowlist::new(Vec::new());
    assert!(!auth.is_allowed("U1"));
    assert!(!auth.is_allowed(""));
    assert!(auth.is_empty());
}

#[test]
fn reject_message_names_an_administrator() {
    let auth = Allowlist::new(Vec::new());
    assert!(auth.reject_message().contains("not authorized"));
    assert!(auth.reject_message().contains("administrator"));
}
