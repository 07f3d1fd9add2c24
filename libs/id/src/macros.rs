//! Macros for defining typed ID types.

/// Macro to define a typed integer ID.
///
/// This generates a newtype wrapper around `i64` with:
/// - `new()` from a raw value and `get()` to read it back
/// - `parse()` with strict validation (non-empty, numeric, positive)
/// - `Display` and `FromStr` implementations
/// - transparent `Serialize`/`Deserialize` as a JSON number
/// - `From<i64>` and `From<$name> for i64` conversions for binding to SQL
///
/// # Example
///
/// ```ignore
/// define_id!(SessionId, "session");
///
/// let id = SessionId::new(7);
/// let parsed: SessionId = "7".parse()?;
/// ```
#[macro_export]
macro_rules! define_id {
    ($name:ident, $label:literal) => {
        #[doc = concat!("Typed ID of a ", $label, ".")]
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
        pub struct $name(i64);

        impl $name {
            /// Human readable entity name, used in error messages and logs.
            pub const LABEL: &'static str = $label;

            /// Wraps a raw database ID.
            #[must_use]
            pub const fn new(id: i64) -> Self {
                Self(id)
            }

            /// Returns the raw database ID.
            #[must_use]
            pub const fn get(&self) -> i64 {
                self.0
            }

            /// Parses an ID from its decimal representation.
            pub fn parse(s: &str) -> Result<Self, $crate::IdError> {
                let s = s.trim();
                if s.is_empty() {
                    return Err($crate::IdError::Empty);
                }

                let value = s
                    .parse::<i64>()
                    .map_err(|e| $crate::IdError::NotANumber {
                        value: s.to_string(),
                        reason: e.to_string(),
                    })?;

                if value <= 0 {
                    return Err($crate::IdError::NotPositive(value));
                }

                Ok(Self(value))
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl std::str::FromStr for $name {
            type Err = $crate::IdError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Self::parse(s)
            }
        }

        impl From<i64> for $name {
            fn from(id: i64) -> Self {
                Self(id)
            }
        }

        impl From<$name> for i64 {
            fn from(id: $name) -> Self {
                id.0
            }
        }

        impl serde::Serialize for $name {
            fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
            where
                S: serde::Serializer,
            {
                serializer.serialize_i64(self.0)
            }
        }

        impl<'de> serde::Deserialize<'de> for $name {
            fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
            where
                D: serde::Deserializer<'de>,
            {
                let id = i64::deserialize(deserializer)?;
                Ok(Self(id))
            }
        }
    };
}
