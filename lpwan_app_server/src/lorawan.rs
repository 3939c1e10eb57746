//! LoRaWAN identifier and key types.
//!
//! All types are stored big endian and formatted as lower-case hex. Fields which are little
//! endian on the air are converted by the codecs.

use crate::error::LoRaWanTypeError;
use schemars::gen::SchemaGenerator;
use schemars::schema::Schema;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use sqlx::encode::IsNull;
use sqlx::error::BoxDynError;
use sqlx::postgres::{PgArgumentBuffer, PgTypeInfo, PgValueRef};
use sqlx::{Decode, Encode, Postgres, Type};
use std::fmt;
use std::str::FromStr;

/// Defines a fixed size byte newtype with hex formatting, serde and database support.
macro_rules! hex_bytes_type {
    ($(#[$meta:meta])* $name:ident, $len:expr) => {
        $(#[$meta])*
        #[derive(Debug, Copy, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(try_from = "String", into = "String")]
        pub struct $name(pub [u8; $len]);

        impl $name {
            /// Length in bytes.
            pub const LEN: usize = $len;

            /// Returns the bytes in reversed order as they are sent over the air.
            #[must_use]
            pub fn to_le_bytes(&self) -> [u8; $len] {
                let mut bytes = self.0;
                bytes.reverse();
                bytes
            }
        }

        impl TryFrom<&[u8]> for $name {
            type Error = LoRaWanTypeError;

            fn try_from(bytes: &[u8]) -> Result<Self, Self::Error> {
                let array = <[u8; $len]>::try_from(bytes).map_err(|_| {
                    LoRaWanTypeError::WrongLength {
                        expected: $len,
                        got: bytes.len(),
                    }
                })?;
                Ok($name(array))
            }
        }

        impl FromStr for $name {
            type Err = LoRaWanTypeError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                let bytes = hex::decode(s)?;
                $name::try_from(bytes.as_slice())
            }
        }

        impl TryFrom<String> for $name {
            type Error = LoRaWanTypeError;

            fn try_from(s: String) -> Result<Self, Self::Error> {
                s.parse()
            }
        }

        impl From<$name> for String {
            fn from(value: $name) -> Self {
                value.to_string()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", hex::encode(self.0))
            }
        }

        impl JsonSchema for $name {
            fn schema_name() -> String {
                stringify!($name).to_owned()
            }

            fn json_schema(gen: &mut SchemaGenerator) -> Schema {
                String::json_schema(gen)
            }
        }

        impl Type<Postgres> for $name {
            fn type_info() -> PgTypeInfo {
                <Vec<u8> as Type<Postgres>>::type_info()
            }
        }

        impl<'r> Decode<'r, Postgres> for $name {
            fn decode(value: PgValueRef<'r>) -> Result<Self, BoxDynError> {
                let bytes = <&[u8] as Decode<Postgres>>::decode(value)?;
                Ok($name::try_from(bytes)?)
            }
        }

        impl Encode<'_, Postgres> for $name {
            fn encode_by_ref(&self, buf: &mut PgArgumentBuffer) -> IsNull {
                <&[u8] as Encode<Postgres>>::encode_by_ref(&&self.0[..], buf)
            }
        }
    };
}

hex_bytes_type!(
    /// EUI-64, used for DevEUIs and gateway MACs.
    Eui64,
    8
);

hex_bytes_type!(
    /// Device or multicast address.
    DevAddr,
    4
);

hex_bytes_type!(
    /// AES-128 key.
    Aes128Key,
    16
);

hex_bytes_type!(
    /// Descriptor of the data transported by a fragmentation session.
    FragDescriptor,
    4
);

#[allow(clippy::unwrap_used)]
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_and_format() {
        let eui: Eui64 = "0102030405060708".parse().unwrap();
        assert_eq!(eui.0, [1, 2, 3, 4, 5, 6, 7, 8]);
        assert_eq!(eui.to_string(), "0102030405060708");
        assert_eq!(eui.to_le_bytes(), [8, 7, 6, 5, 4, 3, 2, 1]);

        let key: Aes128Key = "000102030405060708090A0B0C0D0E0F".parse().unwrap();
        assert_eq!(key.to_string(), "000102030405060708090a0b0c0d0e0f");
    }

    #[test]
    fn parse_errors() {
        assert_eq!(
            "010203".parse::<DevAddr>(),
            Err(LoRaWanTypeError::WrongLength {
                expected: 4,
                got: 3
            })
        );
        assert!(matches!(
            "zz020304".parse::<DevAddr>(),
            Err(LoRaWanTypeError::Hex(_))
        ));
    }

    #[test]
    fn serde_as_hex_string() {
        let addr: DevAddr = serde_json::from_str("\"01020304\"").unwrap();
        assert_eq!(addr, DevAddr([1, 2, 3, 4]));
        assert_eq!(serde_json::to_string(&addr).unwrap(), "\"01020304\"");
        assert!(serde_json::from_str::<DevAddr>("\"0102\"").is_err());
    }
}
