use axum::http::HeaderMap;
use ulid::Ulid;

/// Who is making the request. Always passed explicitly into handlers —
/// never carried as ambient request state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Caller {
    pub id: Ulid,
    pub role: Role,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Doctor,
    Staff,
    Patient,
}

#[derive(Debug, PartialEq, Eq)]
pub enum AuthError {
    MissingToken,
    BadToken,
    MissingIdentity,
    BadIdentity,
}

/// Check the static service token and parse the caller identity headers.
///
/// Upstream auth (JWT verification, user directory) terminates at the
/// gateway; this service only receives the resolved identity:
/// `authorization: Bearer <token>`, `x-caller-id: <ulid>`,
/// `x-caller-role: doctor|staff|patient`.
pub fn authenticate(headers: &HeaderMap, token: &str) -> Result<Caller, AuthError> {
    let supplied = headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .ok_or(AuthError::MissingToken)?;
    if supplied != token {
        return Err(AuthError::BadToken);
    }

    let id = headers
        .get("x-caller-id")
        .and_then(|v| v.to_str().ok())
        .ok_or(AuthError::MissingIdentity)?;
    let id = Ulid::from_string(id).map_err(|_| AuthError::BadIdentity)?;

    let role = match headers.get("x-caller-role").and_then(|v| v.to_str().ok()) {
        Some("doctor") => Role::Doctor,
        Some("staff") => Role::Staff,
        Some("patient") => Role::Patient,
        Some(_) => return Err(AuthError::BadIdentity),
        None => return Err(AuthError::MissingIdentity),
    };

    Ok(Caller { id, role })
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    fn headers(token: Option<&str>, id: Option<&str>, role: Option<&str>) -> HeaderMap {
        let mut h = HeaderMap::new();
        if let Some(t) = token {
            h.insert(
                "authorization",
                HeaderValue::from_str(&format!("Bearer {t}")).unwrap(),
            );
        }
        if let Some(i) = id {
            h.insert("x-caller-id", HeaderValue::from_str(i).unwrap());
        }
        if let Some(r) = role {
            h.insert("x-caller-role", HeaderValue::from_str(r).unwrap());
        }
        h
    }

    #[test]
    fn accepts_valid_identity() {
        let id = Ulid::new();
        let h = headers(Some("secret"), Some(&id.to_string()), Some("doctor"));
        let caller = authenticate(&h, "secret").unwrap();
        assert_eq!(caller.id, id);
        assert_eq!(caller.role, Role::Doctor);
    }

    #[test]
    fn rejects_wrong_token() {
        let h = headers(Some("nope"), Some(&Ulid::new().to_string()), Some("staff"));
        assert_eq!(authenticate(&h, "secret"), Err(AuthError::BadToken));
    }

    #[test]
    fn rejects_missing_token() {
        let h = headers(None, Some(&Ulid::new().to_string()), Some("staff"));
        assert_eq!(authenticate(&h, "secret"), Err(AuthError::MissingToken));
    }

    #[test]
    fn rejects_unknown_role() {
        let h = headers(Some("secret"), Some(&Ulid::new().to_string()), Some("admin"));
        assert_eq!(authenticate(&h, "secret"), Err(AuthError::BadIdentity));
    }

    #[test]
    fn rejects_malformed_id() {
        let h = headers(Some("secret"), Some("not-a-ulid"), Some("patient"));
        assert_eq!(authenticate(&h, "secret"), Err(AuthError::BadIdentity));
    }

    #[test]
    fn rejects_missing_identity() {
        let h = headers(Some("secret"), None, None);
        assert_eq!(authenticate(&h, "secret"), Err(AuthError::MissingIdentity));
    }
}
