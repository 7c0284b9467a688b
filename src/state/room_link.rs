use url::Url;

/// Query parameter carrying the room identity on the page URL.
pub const ROOM_PARAM: &str = "room";

/// Room id carried by `url`, if any.
pub fn room_id_from_url(url: &Url) -> Option<String> {
    url.query_pairs()
        .find(|(key, _)| key == ROOM_PARAM)
        .map(|(_, value)| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

/// `url` with its room parameter set to `room_id`, other parameters kept.
pub fn with_room(url: &Url, room_id: &str) -> Url {
    rewrite_room(url, Some(room_id))
}

/// `url` without any room parameter.
pub fn without_room(url: &Url) -> Url {
    rewrite_room(url, None)
}

fn rewrite_room(url: &Url, room_id: Option<&str>) -> Url {
    let kept: Vec<(String, String)> = url
        .query_pairs()
        .filter(|(key, _)| key != ROOM_PARAM)
        .map(|(key, value)| (key.into_owned(), value.into_owned()))
        .collect();

    let mut rewritten = url.clone();
    rewritten.set_query(None);
    if kept.is_empty() && room_id.is_none() {
        return rewritten;
    }
    {
        let mut pairs = rewritten.query_pairs_mut();
        for (key, value) in &kept {
            pairs.append_pair(key, value);
        }
        if let Some(room_id) = room_id {
            pairs.append_pair(ROOM_PARAM, room_id);
        }
    }
    rewritten
}

#[cfg(test)]
mod tests {
    use super::*;

    fn url(raw: &str) -> Url {
        Url::parse(raw).unwrap()
    }

    #[test]
    fn join_sets_and_leave_removes_room_param() {
        let page = url("https://watch.example/app?theme=dark");
        let joined = with_room(&page, "abc");
        assert_eq!(joined.as_str(), "https://watch.example/app?theme=dark&room=abc");
        assert_eq!(room_id_from_url(&joined).as_deref(), Some("abc"));

        let rejoined = with_room(&joined, "xyz");
        assert_eq!(room_id_from_url(&rejoined).as_deref(), Some("xyz"));

        let left = without_room(&rejoined);
        assert_eq!(left.as_str(), "https://watch.example/app?theme=dark");
    }

    #[test]
    fn leaving_drops_empty_query() {
        let left = without_room(&url("https://watch.example/?room=abc"));
        assert_eq!(left.as_str(), "https://watch.example/");
        assert_eq!(room_id_from_url(&left), None);
    }

    #[test]
    fn blank_room_param_is_ignored() {
        assert_eq!(room_id_from_url(&url("https://watch.example/?room=%20")), None);
    }
}
