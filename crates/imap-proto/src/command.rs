//! Tagged command parsing (spec §4.8). Callers are expected to have already
//! resolved any `{n}` literal continuations into the command line before
//! handing it to [`parse_command`] - reading literals off the wire is a
//! stream-reader concern, not a grammar concern.

use crate::{
    error::{Error, Result},
    message_set::MessageSet,
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BodySection {
    Full,
    Header,
    Text,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FetchItem {
    Uid,
    Flags,
    InternalDate,
    Rfc822Size,
    Envelope,
    BodyStructure,
    Body { section: BodySection, peek: bool },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreAction {
    Add,
    Remove,
    Replace,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SearchKey {
    All,
    Seen,
    Unseen,
    Deleted,
    Undeleted,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Capability,
    StartTls,
    Login { user: String, pass: String },
    Authenticate { mechanism: String, initial: Option<String> },
    Noop,
    Logout,
    List,
    Select { mailbox: String },
    Examine { mailbox: String },
    Fetch { set: MessageSet, uid: bool, items: Vec<FetchItem> },
    Store { set: MessageSet, uid: bool, action: StoreAction, silent: bool, flags: Vec<String> },
    Search { uid: bool, keys: Vec<SearchKey> },
    Expunge,
    Status { mailbox: String, items: Vec<String> },
    Close,
}

/// Parses one complete, unfolded command line (without its trailing CRLF).
/// Returns the client's opaque tag alongside the parsed command.
pub fn parse_command(line: &str) -> Result<(String, Command)> {
    let line = line.trim_end();
    let mut parts = line.splitn(2, ' ');
    let tag = parts.next().filter(|t| !t.is_empty()).ok_or(Error::MissingTag)?;
    let rest = parts.next().unwrap_or_default().trim_start();

    let mut rest_parts = rest.splitn(2, ' ');
    let mut verb = rest_parts.next().unwrap_or_default().to_ascii_uppercase();
    let mut args = rest_parts.next().unwrap_or_default().trim_start();

    let mut uid_prefixed = false;
    if verb == "UID" {
        uid_prefixed = true;
        let mut inner = args.splitn(2, ' ');
        verb = inner.next().unwrap_or_default().to_ascii_uppercase();
        args = inner.next().unwrap_or_default().trim_start();
    }

    let command = match verb.as_str() {
        "CAPABILITY" => Command::Capability,
        "STARTTLS" => Command::StartTls,
        "NOOP" => Command::Noop,
        "LOGOUT" => Command::Logout,
        "EXPUNGE" => Command::Expunge,
        "CLOSE" => Command::Close,
        "LOGIN" => parse_login(args)?,
        "AUTHENTICATE" => parse_authenticate(args)?,
        "LIST" => Command::List,
        "SELECT" => Command::Select {
            mailbox: unquote(args),
        },
        "EXAMINE" => Command::Examine {
            mailbox: unquote(args),
        },
        "FETCH" => parse_fetch(args, uid_prefixed)?,
        "STORE" => parse_store(args, uid_prefixed)?,
        "SEARCH" => parse_search(args, uid_prefixed)?,
        "STATUS" => parse_status(args)?,
        _ => return Err(Error::UnknownCommand(verb)),
    };

    Ok((tag.to_string(), command))
}

fn unquote(token: &str) -> String {
    let token = token.trim();
    token
        .strip_prefix('"')
        .and_then(|t| t.strip_suffix('"'))
        .unwrap_or(token)
        .to_string()
}

fn parse_login(args: &str) -> Result<Command> {
    let mut parts = args.splitn(2, ' ');
    let user = parts.next().filter(|s| !s.is_empty()).ok_or(Error::Syntax)?;
    let pass = parts.next().filter(|s| !s.is_empty()).ok_or(Error::Syntax)?;
    Ok(Command::Login {
        user: unquote(user),
        pass: unquote(pass),
    })
}

fn parse_authenticate(args: &str) -> Result<Command> {
    let mut parts = args.splitn(2, ' ');
    let mechanism = parts.next().filter(|s| !s.is_empty()).ok_or(Error::Syntax)?;
    let initial = parts.next().map(|s| s.trim().to_string()).filter(|s| !s.is_empty());
    Ok(Command::Authenticate {
        mechanism: mechanism.to_ascii_uppercase(),
        initial,
    })
}

fn parse_fetch(args: &str, uid: bool) -> Result<Command> {
    let mut parts = args.splitn(2, ' ');
    let set_token = parts.next().filter(|s| !s.is_empty()).ok_or(Error::Syntax)?;
    let items_token = parts.next().ok_or(Error::Syntax)?.trim();
    let set = MessageSet::parse(set_token).map_err(|_| Error::MalformedMessageSet)?;

    let items_body = strip_parens(items_token).unwrap_or(items_token);
    let mut items = Vec::new();
    for raw in split_top_level(items_body) {
        items.push(parse_fetch_item(raw)?);
    }
    if items.is_empty() {
        return Err(Error::Syntax);
    }

    Ok(Command::Fetch { set, uid, items })
}

fn parse_fetch_item(token: &str) -> Result<FetchItem> {
    let upper = token.to_ascii_uppercase();
    Ok(match upper.as_str() {
        "UID" => FetchItem::Uid,
        "FLAGS" => FetchItem::Flags,
        "INTERNALDATE" => FetchItem::InternalDate,
        "RFC822.SIZE" => FetchItem::Rfc822Size,
        "ENVELOPE" => FetchItem::Envelope,
        "BODYSTRUCTURE" => FetchItem::BodyStructure,
        "BODY[]" => FetchItem::Body { section: BodySection::Full, peek: false },
        "BODY[HEADER]" => FetchItem::Body { section: BodySection::Header, peek: false },
        "BODY[TEXT]" => FetchItem::Body { section: BodySection::Text, peek: false },
        "BODY.PEEK[]" => FetchItem::Body { section: BodySection::Full, peek: true },
        "BODY.PEEK[HEADER]" => FetchItem::Body { section: BodySection::Header, peek: true },
        "BODY.PEEK[TEXT]" => FetchItem::Body { section: BodySection::Text, peek: true },
        _ => return Err(Error::Syntax),
    })
}

fn parse_store(args: &str, uid: bool) -> Result<Command> {
    let mut parts = args.splitn(3, ' ');
    let set_token = parts.next().filter(|s| !s.is_empty()).ok_or(Error::Syntax)?;
    let action_token = parts.next().filter(|s| !s.is_empty()).ok_or(Error::Syntax)?;
    let flags_token = parts.next().ok_or(Error::Syntax)?.trim();

    let set = MessageSet::parse(set_token).map_err(|_| Error::MalformedMessageSet)?;

    let upper = action_token.to_ascii_uppercase();
    let (action, silent) = match upper.as_str() {
        "FLAGS" => (StoreAction::Replace, false),
        "FLAGS.SILENT" => (StoreAction::Replace, true),
        "+FLAGS" => (StoreAction::Add, false),
        "+FLAGS.SILENT" => (StoreAction::Add, true),
        "-FLAGS" => (StoreAction::Remove, false),
        "-FLAGS.SILENT" => (StoreAction::Remove, true),
        _ => return Err(Error::Syntax),
    };

    let flags_body = strip_parens(flags_token).unwrap_or(flags_token);
    let flags = split_top_level(flags_body)
        .into_iter()
        .map(|s| s.to_string())
        .collect();

    Ok(Command::Store { set, uid, action, silent, flags })
}

fn parse_search(args: &str, uid: bool) -> Result<Command> {
    let mut keys = Vec::new();
    for token in split_top_level(args.trim()) {
        keys.push(match token.to_ascii_uppercase().as_str() {
            "ALL" => SearchKey::All,
            "SEEN" => SearchKey::Seen,
            "UNSEEN" => SearchKey::Unseen,
            "DELETED" => SearchKey::Deleted,
            "UNDELETED" => SearchKey::Undeleted,
            _ => return Err(Error::Syntax),
        });
    }
    if keys.is_empty() {
        keys.push(SearchKey::All);
    }
    Ok(Command::Search { uid, keys })
}

fn parse_status(args: &str) -> Result<Command> {
    let mut parts = args.splitn(2, ' ');
    let mailbox = parts.next().filter(|s| !s.is_empty()).ok_or(Error::Syntax)?;
    let items_token = parts.next().ok_or(Error::Syntax)?.trim();
    let items_body = strip_parens(items_token).unwrap_or(items_token);
    let items = split_top_level(items_body)
        .into_iter()
        .map(|s| s.to_ascii_uppercase())
        .collect();
    Ok(Command::Status {
        mailbox: unquote(mailbox),
        items,
    })
}

fn strip_parens(token: &str) -> Option<&str> {
    token.strip_prefix('(').and_then(|t| t.strip_suffix(')'))
}

fn split_top_level(text: &str) -> Vec<&str> {
    text.split_whitespace().collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_login() {
        let (tag, cmd) = parse_command("a1 LOGIN alice secret").unwrap();
        assert_eq!(tag, "a1");
        assert_eq!(
            cmd,
            Command::Login {
                user: "alice".into(),
                pass: "secret".into()
            }
        );
    }

    #[test]
    fn parses_select() {
        let (_, cmd) = parse_command("a2 SELECT INBOX").unwrap();
        assert_eq!(cmd, Command::Select { mailbox: "INBOX".into() });
    }

    #[test]
    fn parses_fetch_with_multiple_items() {
        let (_, cmd) = parse_command("a3 FETCH 1:3 (UID FLAGS BODY.PEEK[])").unwrap();
        match cmd {
            Command::Fetch { uid, items, .. } => {
                assert!(!uid);
                assert_eq!(items.len(), 3);
                assert!(items.contains(&FetchItem::Uid));
                assert!(items.contains(&FetchItem::Body { section: BodySection::Full, peek: true }));
            }
            _ => panic!("expected Fetch"),
        }
    }

    #[test]
    fn parses_uid_fetch() {
        let (_, cmd) = parse_command("a4 UID FETCH 1:* (FLAGS)").unwrap();
        match cmd {
            Command::Fetch { uid, .. } => assert!(uid),
            _ => panic!("expected Fetch"),
        }
    }

    #[test]
    fn parses_store_silent() {
        let (_, cmd) = parse_command("a5 STORE 2 +FLAGS.SILENT (\\Seen)").unwrap();
        match cmd {
            Command::Store { action, silent, flags, .. } => {
                assert_eq!(action, StoreAction::Add);
                assert!(silent);
                assert_eq!(flags, vec!["\\Seen".to_string()]);
            }
            _ => panic!("expected Store"),
        }
    }

    #[test]
    fn parses_search_keys() {
        let (_, cmd) = parse_command("a6 SEARCH UNSEEN").unwrap();
        assert_eq!(cmd, Command::Search { uid: false, keys: vec![SearchKey::Unseen] });
    }

    #[test]
    fn rejects_unknown_verb() {
        assert!(matches!(
            parse_command("a7 BOGUS"),
            Err(Error::UnknownCommand(_))
        ));
    }

    #[test]
    fn rejects_missing_tag() {
        assert!(matches!(parse_command(" LOGIN a b"), Err(Error::MissingTag)));
    }
}
