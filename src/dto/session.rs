use serde::{Deserialize, Serialize};
use validator::Validate;

use crate::{dto::validation::validate_room_id, state::identity::Identity};

/// Identity handed over by the embedding page after the user signs in.
#[derive(Debug, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct SignInRequest {
    #[validate(length(min = 1, max = 128))]
    /// Stable user id issued by the identity provider.
    pub uid: String,
    #[validate(length(max = 80))]
    #[serde(default)]
    /// Display name, if the provider has one.
    pub display_name: Option<String>,
    #[validate(email)]
    #[serde(default)]
    /// Email address, if the provider has one.
    pub email: Option<String>,
}

impl From<SignInRequest> for Identity {
    fn from(request: SignInRequest) -> Self {
        let display_name = request
            .display_name
            .map(|name| name.trim().to_string())
            .filter(|name| !name.is_empty());
        Identity::new(request.uid.trim(), display_name, request.email)
    }
}

/// Room to join.
#[derive(Debug, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct JoinRoomRequest {
    #[validate(custom(function = "validate_room_id"))]
    /// Room id, as typed or taken from a shared link.
    pub room_id: String,
}

/// External co-watch link to store on the room.
#[derive(Debug, Deserialize, Validate)]
pub struct TelepartyRequest {
    #[validate(url)]
    /// Absolute link.
    pub url: String,
}

/// Returned after a room was created and joined.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CreatedRoom {
    /// Generated room id.
    pub room_id: String,
    /// Shareable link pointing at the new room.
    pub link: String,
}

/// Current sign-in and room attachment of the bridge.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionView {
    /// Signed-in identity, if any.
    pub identity: Option<Identity>,
    /// Joined room, if any.
    pub room_id: Option<String>,
    /// Page link reflecting the joined room.
    pub link: String,
    /// Whether the presence heartbeat is running.
    pub heartbeat_active: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sign_in_rejects_malformed_email() {
        let request: SignInRequest =
            serde_json::from_str(r#"{"uid":"ada","email":"not-an-email"}"#).unwrap();
        assert!(request.validate().is_err());
    }

    #[test]
    fn sign_in_blank_display_name_is_dropped() {
        let request: SignInRequest =
            serde_json::from_str(r#"{"uid":"ada","displayName":"  "}"#).unwrap();
        assert!(request.validate().is_ok());
        let identity = Identity::from(request);
        assert_eq!(identity.display_name, None);
        assert_eq!(identity.label(), "ada");
    }

    #[test]
    fn join_rejects_path_like_ids() {
        let request: JoinRoomRequest = serde_json::from_str(r#"{"roomId":"a/b"}"#).unwrap();
        assert!(request.validate().is_err());
    }

    #[test]
    fn teleparty_requires_absolute_url() {
        let ok = TelepartyRequest {
            url: "https://teleparty.example/join/abc".into(),
        };
        let bad = TelepartyRequest {
            url: "teleparty".into(),
        };
        assert!(ok.validate().is_ok());
        assert!(bad.validate().is_err());
    }
}
