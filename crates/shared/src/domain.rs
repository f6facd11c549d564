use std::{cmp::Ordering, fmt};

use serde::{Deserialize, Serialize};

macro_rules! id_newtype {
    ($name:ident) => {
        #[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub String);

        impl $name {
            pub fn new(value: impl Into<String>) -> Self {
                Self(value.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(value: &str) -> Self {
                Self(value.to_string())
            }
        }

        impl From<String> for $name {
            fn from(value: String) -> Self {
                Self(value)
            }
        }

        impl Ord for $name {
            fn cmp(&self, other: &Self) -> Ordering {
                snowflake_cmp(&self.0, &other.0)
            }
        }

        impl PartialOrd for $name {
            fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
                Some(self.cmp(other))
            }
        }
    };
}

id_newtype!(UserId);
id_newtype!(ChannelId);
id_newtype!(MessageId);
id_newtype!(AttachmentId);
id_newtype!(PollId);

/// Orders snowflake strings by numeric value without parsing them: a shorter
/// decimal string is always the smaller id.
fn snowflake_cmp(left: &str, right: &str) -> Ordering {
    left.len()
        .cmp(&right.len())
        .then_with(|| left.cmp(right))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    #[default]
    Default,
    RecipientAdd,
    RecipientRemove,
    Call,
    ChannelNameChange,
    ChannelIconChange,
    PinnedMessage,
    MemberJoin,
    System,
    Reply,
    Unknown,
}

impl MessageKind {
    pub fn from_code(code: i16) -> Self {
        match code {
            0 => Self::Default,
            1 => Self::RecipientAdd,
            2 => Self::RecipientRemove,
            3 => Self::Call,
            4 => Self::ChannelNameChange,
            5 => Self::ChannelIconChange,
            6 => Self::PinnedMessage,
            7 => Self::MemberJoin,
            8 => Self::System,
            19 => Self::Reply,
            _ => Self::Unknown,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn message_ids_sort_by_numeric_value() {
        let mut ids = vec![
            MessageId::from("1000"),
            MessageId::from("99"),
            MessageId::from("101"),
            MessageId::from("9"),
        ];
        ids.sort();
        let ordered: Vec<&str> = ids.iter().map(MessageId::as_str).collect();
        assert_eq!(ordered, vec!["9", "99", "101", "1000"]);
    }

    #[test]
    fn unknown_message_type_codes_map_to_unknown() {
        assert_eq!(MessageKind::from_code(19), MessageKind::Reply);
        assert_eq!(MessageKind::from_code(42), MessageKind::Unknown);
    }
}
