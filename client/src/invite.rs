use common::PlayerId;
use url::Url;

use crate::error::{ClientError, ClientResult};

pub const INVITE_PARAM: &str = "pid";

/// An invite link taken apart: who it points at and the link without the invite
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invite {
    /// `None` when the parameter is absent or not a well-formed player id
    pub inviter: Option<PlayerId>,
    pub cleaned_url: String,
}

fn parse_url(raw: &str) -> ClientResult<Url> {
    Url::parse(raw.trim()).map_err(|e| ClientError::InvalidUrl(format!("{}: {}", raw, e)))
}

// Rewrites the query without `pid`, keeping other parameters in order
fn without_invite(url: &mut Url) {
    let kept: Vec<(String, String)> = url
        .query_pairs()
        .filter(|(key, _)| key != INVITE_PARAM)
        .map(|(key, value)| (key.into_owned(), value.into_owned()))
        .collect();
    if kept.is_empty() {
        url.set_query(None);
    } else {
        url.query_pairs_mut().clear().extend_pairs(kept);
    }
}

/// Builds `base?pid=<id>`, replacing any invite already on `base`
pub fn invite_link(base: &str, player_id: &PlayerId) -> ClientResult<String> {
    let mut url = parse_url(base)?;
    without_invite(&mut url);
    url.query_pairs_mut()
        .append_pair(INVITE_PARAM, player_id.as_str());
    Ok(url.into())
}

pub fn parse_invite(raw: &str) -> ClientResult<Invite> {
    let mut url = parse_url(raw)?;
    let inviter = url
        .query_pairs()
        .find(|(key, _)| key == INVITE_PARAM)
        .and_then(|(_, value)| PlayerId::parse(&value));
    without_invite(&mut url);
    Ok(Invite {
        inviter,
        cleaned_url: url.into(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_link_roundtrip() {
        let id = PlayerId::from("123456");
        let link = invite_link("https://brisker.example/play", &id).unwrap();
        assert_eq!(link, "https://brisker.example/play?pid=123456");

        let invite = parse_invite(&link).unwrap();
        assert_eq!(invite.inviter, Some(id));
        assert_eq!(invite.cleaned_url, "https://brisker.example/play");
    }

    #[test]
    fn test_other_params_and_fragment_survive() {
        let invite = parse_invite("https://brisker.example/?lang=tr&pid=4321&theme=dark#scores").unwrap();
        assert_eq!(invite.inviter, Some(PlayerId::from("4321")));
        assert_eq!(
            invite.cleaned_url,
            "https://brisker.example/?lang=tr&theme=dark#scores"
        );
    }

    #[test]
    fn test_malformed_pid_is_stripped_without_inviter() {
        for raw in [
            "https://brisker.example/?pid=12",
            "https://brisker.example/?pid=abcd",
            "https://brisker.example/?pid=1234567890123",
        ] {
            let invite = parse_invite(raw).unwrap();
            assert_eq!(invite.inviter, None, "{}", raw);
            assert_eq!(invite.cleaned_url, "https://brisker.example/");
        }

        let invite = parse_invite("https://brisker.example/?lang=en").unwrap();
        assert_eq!(invite.inviter, None);
        assert_eq!(invite.cleaned_url, "https://brisker.example/?lang=en");
    }

    #[test]
    fn test_replaces_existing_invite() {
        let link = invite_link("https://brisker.example/?pid=9999", &PlayerId::from("1234")).unwrap();
        assert_eq!(link, "https://brisker.example/?pid=1234");
        assert!(matches!(parse_invite("not a url"), Err(ClientError::InvalidUrl(_))));
    }
}
