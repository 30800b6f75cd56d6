use serde::{Deserialize, Deserializer, Serialize};
use std::{ops::Deref, str::FromStr};
use thiserror::Error;
use utoipa::ToSchema;

#[derive(Error, Debug, PartialEq, Eq, Clone)]
pub enum IdError {
    #[error("ID must be between 3 and 64 characters")]
    Length,
    #[error("ID must be lowercase alphanumeric")]
    Char,
}

/// Macro for generating new ID like types
macro_rules! new_string_id_type {
    ($type_name:ident) => {
        /// It is a string, but with some strict validation rules. It must be lowercase alphanumeric: `[a-z0-9-_]{3,64}`
        #[derive(Serialize, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, ToSchema)]
        #[serde(transparent)]
        pub struct $type_name(String);

        impl $type_name {
            // take Into<String> instead of ToString so we benefit from zero-cost conversions for common cases
            // String -> String is a no-op
            // &str -> String is via std lib magic (internal transmute, ultimately)
            pub fn new(id: impl Into<String>) -> Result<Self, IdError> {
                let id = id.into();

                if id.len() < 3 || id.len() > 64 {
                    return Err(IdError::Length);
                }
                if !id
                    .chars()
                    .all(|c| c.is_ascii_lowercase() || c.is_numeric() || c == '_' || c == '-')
                {
                    return Err(IdError::Char);
                }
                Ok(Self(id))
            }

            /// Mint a fresh random id (uuid v4, simple hex form)
            pub fn generate() -> Self {
                Self(uuid::Uuid::new_v4().simple().to_string())
            }
        }

        impl<'de> Deserialize<'de> for $type_name {
            fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
            where
                D: Deserializer<'de>,
            {
                let s = String::deserialize(deserializer)?;
                $type_name::new(s).map_err(serde::de::Error::custom)
            }
        }

        impl AsRef<str> for $type_name {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }

        impl Deref for $type_name {
            type Target = str;

            fn deref(&self) -> &Self::Target {
                &self.0
            }
        }

        impl std::fmt::Display for $type_name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl TryFrom<&str> for $type_name {
            type Error = IdError;

            fn try_from(s: &str) -> Result<Self, Self::Error> {
                $type_name::new(s)
            }
        }

        // makes it easier to use in T: TryInto
        impl TryFrom<&$type_name> for $type_name {
            type Error = IdError;

            fn try_from(id: &Self) -> Result<Self, Self::Error> {
                Ok(id.clone())
            }
        }

        impl FromStr for $type_name {
            type Err = IdError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                $type_name::new(s)
            }
        }
    };
}

new_string_id_type!(ServerId);
new_string_id_type!(GroupId);
new_string_id_type!(WorkflowId);
new_string_id_type!(ExecutionId);
new_string_id_type!(SubscriptionId);
new_string_id_type!(DeliveryId);
new_string_id_type!(BudgetId);
new_string_id_type!(ApiKeyId);
new_string_id_type!(TenantId);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn id_rejects_bad_chars() {
        assert_eq!(ServerId::new("Hello"), Err(IdError::Char));
        assert_eq!(ServerId::new("ok"), Err(IdError::Length));
        assert!(ServerId::new("weather-east_2").is_ok());
    }

    #[test]
    fn generated_ids_validate() {
        let id = ServerId::generate();
        assert!(ServerId::new(id.as_ref()).is_ok());
    }

    #[test]
    fn id_roundtrips_serde() {
        let id = WorkflowId::new("daily-report").unwrap();
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, "\"daily-report\"");
        let back: WorkflowId = serde_json::from_str(&json).unwrap();
        assert_eq!(id, back);
    }
}
