//! Declarative table schema for the user store.
//!
//! The spec models the backing store as a schema table list
//! `{table -> [field spec...]}`: this module is that list, expressed as
//! plain Rust data so [`super::UserStore::load`] can build
//! `CREATE TABLE`/`INSERT`/`UPDATE` statements generically instead of having
//! one hand-written query per service.

/// SQL storage class for a user field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldKind {
    Text,
    Integer,
}

#[derive(Debug, Clone, Copy)]
pub struct FieldSpec {
    pub name: &'static str,
    pub kind: FieldKind,
}

#[derive(Debug, Clone, Copy)]
pub struct TableSchema {
    pub name: &'static str,
    pub fields: &'static [FieldSpec],
}

pub const WEBTILES_USERS: TableSchema = TableSchema {
    name: "webtiles_users",
    fields: &[
        FieldSpec { name: "nick", kind: FieldKind::Text },
        FieldSpec { name: "subscription", kind: FieldKind::Integer },
        FieldSpec { name: "twitch_username", kind: FieldKind::Text },
        FieldSpec { name: "twitch_reminder", kind: FieldKind::Integer },
        FieldSpec { name: "player_only", kind: FieldKind::Integer },
    ],
};

pub const TV_USERS: TableSchema = TableSchema {
    name: "tv_users",
    fields: &[FieldSpec { name: "nick", kind: FieldKind::Text }],
};

pub const SCHEMA: &[TableSchema] = &[WEBTILES_USERS, TV_USERS];

impl TableSchema {
    pub fn field(&self, name: &str) -> Option<&'static FieldSpec> {
        self.fields.iter().find(|f| f.name == name)
    }

    /// Default value for a freshly-registered row's field.
    pub fn default_for(kind: FieldKind) -> super::FieldValue {
        match kind {
            FieldKind::Text => super::FieldValue::Text(String::new()),
            FieldKind::Integer => super::FieldValue::Int(0),
        }
    }
}
