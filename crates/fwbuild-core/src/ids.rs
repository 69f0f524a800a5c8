use serde::{Deserialize, Serialize};

macro_rules! string_id {
    ($name:ident) => {
        #[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
        pub struct $name(String);

        impl $name {
            pub fn new(value: impl Into<String>) -> Self {
                Self(value.into())
            }

            pub fn generate() -> Self {
                Self(uuid::Uuid::new_v4().to_string())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl From<String> for $name {
            fn from(value: String) -> Self {
                Self(value)
            }
        }

        impl From<&str> for $name {
            fn from(value: &str) -> Self {
                Self(value.to_owned())
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(&self.0)
            }
        }
    };
}

string_id!(RequestId);
string_id!(LeaseId);

#[cfg(test)]
mod tests {
    use super::{LeaseId, RequestId};

    #[test]
    fn generated_ids_are_unique() {
        assert_ne!(RequestId::generate(), RequestId::generate());
        assert_ne!(LeaseId::generate(), LeaseId::generate());
    }

    #[test]
    fn ids_round_trip_through_json() {
        let id = RequestId::new("req-7");
        let encoded = serde_json::to_string(&id).expect("encode request id");
        let decoded: RequestId = serde_json::from_str(&encoded).expect("decode request id");
        assert_eq!(decoded, id);
        assert_eq!(decoded.as_str(), "req-7");
    }
}
