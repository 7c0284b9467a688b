use std::fmt;

const ROOMS: &str = "rooms";
const USERS: &str = "users";
const MEMBERS: &str = "members";
const MESSAGES: &str = "messages";

/// Slash separated path of a single document (`collection/id[/collection/id...]`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DocPath(String);

/// Slash separated path of a collection (`collection[/id/collection...]`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CollectionPath(String);

impl DocPath {
    /// Shared room document.
    pub fn room(room_id: &str) -> Self {
        CollectionPath::rooms().doc(room_id)
    }

    /// Presence document of one member inside a room.
    pub fn member(room_id: &str, uid: &str) -> Self {
        CollectionPath::members(room_id).doc(uid)
    }

    /// Chat message document inside a room.
    pub fn message(room_id: &str, message_id: &str) -> Self {
        CollectionPath::messages(room_id).doc(message_id)
    }

    /// Personal (out of room) document of a signed-in user.
    pub fn user(uid: &str) -> Self {
        CollectionPath(USERS.to_string()).doc(uid)
    }

    /// Parse a raw path, accepting only an even number of non-empty segments.
    pub fn parse(raw: &str) -> Option<Self> {
        let count = segment_count(raw)?;
        (count % 2 == 0).then(|| Self(raw.to_string()))
    }

    /// Identifier of the document (last segment).
    pub fn id(&self) -> &str {
        self.0.rsplit('/').next().unwrap_or_default()
    }

    /// Collection the document belongs to.
    pub fn parent(&self) -> CollectionPath {
        match self.0.rsplit_once('/') {
            Some((parent, _)) => CollectionPath(parent.to_string()),
            None => CollectionPath(String::new()),
        }
    }

    /// Raw path string.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl CollectionPath {
    /// Top-level collection of rooms.
    pub fn rooms() -> Self {
        Self(ROOMS.to_string())
    }

    /// Member presence documents of a room.
    pub fn members(room_id: &str) -> Self {
        Self(format!("{ROOMS}/{room_id}/{MEMBERS}"))
    }

    /// Chat messages of a room.
    pub fn messages(room_id: &str) -> Self {
        Self(format!("{ROOMS}/{room_id}/{MESSAGES}"))
    }

    /// Parse a raw path, accepting only an odd number of non-empty segments.
    pub fn parse(raw: &str) -> Option<Self> {
        let count = segment_count(raw)?;
        (count % 2 == 1).then(|| Self(raw.to_string()))
    }

    /// Path of the document `id` inside this collection.
    pub fn doc(&self, id: &str) -> DocPath {
        DocPath(format!("{}/{}", self.0, id))
    }

    /// Whether `path` is a direct child document of this collection.
    pub fn contains(&self, path: &DocPath) -> bool {
        path.parent() == *self
    }

    /// Raw path string.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

fn segment_count(raw: &str) -> Option<usize> {
    if raw.is_empty() {
        return None;
    }
    let mut count = 0;
    for segment in raw.split('/') {
        if segment.is_empty() {
            return None;
        }
        count += 1;
    }
    Some(count)
}

impl fmt::Display for DocPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Display for CollectionPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
