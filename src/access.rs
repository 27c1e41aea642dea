//! Room access policy. Pure functions over what is already known about a
//! room and a caller; role lookups happen at the call site.

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoomKind {
    Public,
    Private,
    Direct,
}

impl RoomKind {
    pub fn as_str(self) -> &'static str {
        match self {
            RoomKind::Public => "public",
            RoomKind::Private => "private",
            RoomKind::Direct => "direct",
        }
    }

    /// Unknown stored values fall back to the most restrictive common kind.
    pub fn from_db(raw: &str) -> RoomKind {
        match raw {
            "public" => RoomKind::Public,
            "direct" => RoomKind::Direct,
            _ => RoomKind::Private,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Owner,
    Admin,
    Member,
    Viewer,
    Blocked,
}

impl Role {
    pub fn as_str(self) -> &'static str {
        match self {
            Role::Owner => "owner",
            Role::Admin => "admin",
            Role::Member => "member",
            Role::Viewer => "viewer",
            Role::Blocked => "blocked",
        }
    }

    pub fn from_db(raw: &str) -> Option<Role> {
        match raw {
            "owner" => Some(Role::Owner),
            "admin" => Some(Role::Admin),
            "member" => Some(Role::Member),
            "viewer" => Some(Role::Viewer),
            "blocked" => Some(Role::Blocked),
            _ => None,
        }
    }
}

/// PUBLIC rooms are readable by anyone. Everything else requires a signed-in
/// caller who passes the DIRECT membership check and holds a reading role.
pub fn can_read(
    kind: RoomKind,
    direct_pair_key: Option<&str>,
    role: Option<Role>,
    username: Option<&str>,
) -> bool {
    if kind == RoomKind::Public {
        return true;
    }
    let Some(username) = username else {
        return false;
    };
    if kind == RoomKind::Direct && !direct_contains(direct_pair_key, username) {
        return false;
    }
    matches!(
        role,
        Some(Role::Owner | Role::Admin | Role::Member | Role::Viewer)
    )
}

/// Writing needs authentication even in PUBLIC rooms; elsewhere it needs a
/// role that can post.
pub fn can_write(
    kind: RoomKind,
    direct_pair_key: Option<&str>,
    role: Option<Role>,
    username: Option<&str>,
) -> bool {
    let Some(username) = username else {
        return false;
    };
    if kind == RoomKind::Public {
        return true;
    }
    if kind == RoomKind::Direct && !direct_contains(direct_pair_key, username) {
        return false;
    }
    matches!(role, Some(Role::Owner | Role::Admin | Role::Member))
}

/// DIRECT pair keys are the two usernames sorted and joined with `:`.
pub fn direct_pair_key(a: &str, b: &str) -> String {
    if a <= b {
        format!("{a}:{b}")
    } else {
        format!("{b}:{a}")
    }
}

/// The other participant named by a DIRECT pair key, when `username` is one
/// of the two.
pub fn direct_peer<'a>(pair_key: &'a str, username: &str) -> Option<&'a str> {
    let (a, b) = pair_key.split_once(':')?;
    if a == username {
        Some(b)
    } else if b == username {
        Some(a)
    } else {
        None
    }
}

fn direct_contains(pair_key: Option<&str>, username: &str) -> bool {
    pair_key.is_some_and(|key| direct_peer(key, username).is_some())
}
