/// A target user identity for privilege dropping: either an account name
/// resolved through the system user database, or a raw numeric uid.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum User {
    Name(String),
    Id(u32),
}

/// A target group identity for privilege dropping.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Group {
    Name(String),
    Id(u32),
}

impl From<&str> for User {
    fn from(s: &str) -> Self {
        User::Name(s.to_owned())
    }
}

impl From<String> for User {
    fn from(s: String) -> Self {
        User::Name(s)
    }
}

impl From<u32> for User {
    fn from(id: u32) -> Self {
        User::Id(id)
    }
}

impl From<&str> for Group {
    fn from(s: &str) -> Self {
        Group::Name(s.to_owned())
    }
}

impl From<String> for Group {
    fn from(s: String) -> Self {
        Group::Name(s)
    }
}

impl From<u32> for Group {
    fn from(id: u32) -> Self {
        Group::Id(id)
    }
}
