//! Lenient identifier deserialization.
//!
//! GraphQL `ID` scalars arrive as strings while persisted data uses numbers;
//! both forms are accepted.

use serde::{de::Error, Deserialize, Deserializer};

#[derive(Deserialize)]
#[serde(untagged)]
enum RawId {
    Number(u32),
    Text(String),
}

impl RawId {
    fn into_id<E: Error>(self) -> Result<u32, E> {
        match self {
            RawId::Number(n) => Ok(n),
            RawId::Text(s) => s
                .trim()
                .parse()
                .map_err(|_| E::custom(format!("invalid identifier '{}'", s))),
        }
    }
}

/// Deserialize a required identifier.
pub fn de_id<'de, D>(deserializer: D) -> Result<u32, D::Error>
where
    D: Deserializer<'de>,
{
    RawId::deserialize(deserializer)?.into_id()
}

/// Deserialize an optional identifier (`null` or missing maps to `None`).
pub fn de_opt_id<'de, D>(deserializer: D) -> Result<Option<u32>, D::Error>
where
    D: Deserializer<'de>,
{
    Option::<RawId>::deserialize(deserializer)?
        .map(RawId::into_id)
        .transpose()
}

/// Deserialize a list of identifiers.
pub fn de_ids<'de, D>(deserializer: D) -> Result<Vec<u32>, D::Error>
where
    D: Deserializer<'de>,
{
    Vec::<RawId>::deserialize(deserializer)?
        .into_iter()
        .map(RawId::into_id)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[derive(Debug, Deserialize)]
    struct Holder {
        #[serde(deserialize_with = "de_id")]
        id: u32,
        #[serde(default, deserialize_with = "de_opt_id")]
        parent: Option<u32>,
        #[serde(default, deserialize_with = "de_ids")]
        members: Vec<u32>,
    }

    #[test]
    fn test_numeric_and_string_ids() {
        let h: Holder = serde_json::from_value(json!({
            "id": "17", "parent": 3, "members": ["1", 2]
        }))
        .unwrap();
        assert_eq!(h.id, 17);
        assert_eq!(h.parent, Some(3));
        assert_eq!(h.members, vec![1, 2]);
    }

    #[test]
    fn test_missing_and_null_optional_id() {
        let h: Holder = serde_json::from_value(json!({ "id": 1 })).unwrap();
        assert_eq!(h.parent, None);
        let h: Holder = serde_json::from_value(json!({ "id": 1, "parent": null })).unwrap();
        assert_eq!(h.parent, None);
    }

    #[test]
    fn test_invalid_id_is_rejected() {
        let result: Result<Holder, _> = serde_json::from_value(json!({ "id": "abc" }));
        assert!(result.is_err());
    }
}
